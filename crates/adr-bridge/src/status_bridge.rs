//! [`StatusBridge`] – status stream to registry propagation.
//!
//! Each message read from the device's status publisher is decoded into
//! [`StatusField`]s and written field by field into the
//! [`VariableRegistry`]:
//!
//! | Field | Variable | Write policy |
//! |---|---|---|
//! | `temperature` | `TEMP` | every message |
//! | `alt_temp` | `ALT_TEMP` | every message |
//! | `heater` | `HEATER_OUT` | every message |
//! | `stddev` | `TEMP_RMS_UK` | every message |
//! | `temp_sp_rb` | `TEMP_SP_RB` | every message |
//! | `state` | `STATE` | only on change |
//! | `uid` | `CYCLE_UID` | only on change |
//!
//! Unknown keys are ignored.  A message that cannot be decoded is logged with
//! its raw payload and skipped; it never stops the loop.
//!
//! There is no fixed scan period.  The loop suspends on the transport read,
//! bounded by [`StatusBridgeConfig::read_timeout`].  A timeout flips
//! `LINK_OK` to 0 and re-arms the read; after
//! [`StatusBridgeConfig::max_silent_reads`] consecutive timeouts the session
//! ends so [`StatusBridge::run_supervised`] can resubscribe.

use std::sync::Arc;
use std::time::Duration;

use adr_registry::VariableRegistry;
use adr_types::{AdrError, PvName, Skipped, StatusField, StatusMessage, Value, WriteOrigin};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::shutdown::wait_for_shutdown;
use crate::transport::{StatusConnector, StatusSource};

/// Raw payload bytes echoed into the log for undecodable messages.
const PAYLOAD_PREVIEW_BYTES: usize = 256;

/// Tuning for the status read loop.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusBridgeConfig {
    /// Upper bound on a single read.
    pub read_timeout: Duration,
    /// Consecutive timed-out reads before resubscribing; 0 never resubscribes.
    pub max_silent_reads: u32,
}

impl Default for StatusBridgeConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            max_silent_reads: 3,
        }
    }
}

/// Counts from applying one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub written: usize,
    /// Change-suppressed fields whose value was already stored.
    pub suppressed: usize,
    /// Unknown or badly typed keys.
    pub skipped: usize,
}

/// Propagates device status messages into the registry.
#[derive(Clone)]
pub struct StatusBridge {
    registry: Arc<VariableRegistry>,
    config: StatusBridgeConfig,
}

impl StatusBridge {
    pub fn new(registry: Arc<VariableRegistry>) -> Self {
        Self::with_config(registry, StatusBridgeConfig::default())
    }

    pub fn with_config(registry: Arc<VariableRegistry>, config: StatusBridgeConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &StatusBridgeConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Per-message processing
    // -----------------------------------------------------------------------

    /// Write every field of `msg` into the registry, in message order.
    pub fn apply(&self, msg: &StatusMessage) -> ApplyReport {
        let mut report = ApplyReport {
            skipped: msg.skipped.len(),
            ..ApplyReport::default()
        };
        for field in &msg.fields {
            match self.write_field(field) {
                Ok(true) => report.written += 1,
                Ok(false) => report.suppressed += 1,
                Err(e) => {
                    // Registry writes are coerced from a typed field, so this
                    // only fires if the variable table and StatusField drift.
                    warn!(pv = %field.target(), error = %e, "registry rejected status field");
                }
            }
        }
        report
    }

    /// Decode `payload` and [`apply`][Self::apply] it.
    ///
    /// # Errors
    ///
    /// [`AdrError::Decode`] when the payload is not a JSON object.  Badly
    /// typed fields are logged and skipped without failing the message.
    pub fn process(&self, payload: &[u8]) -> Result<ApplyReport, AdrError> {
        let msg = StatusMessage::decode(payload)?;
        for skipped in &msg.skipped {
            match skipped {
                Skipped::Unknown(key) => trace!(field = %key, "ignoring unknown status field"),
                Skipped::WrongType { key, raw } => {
                    warn!(field = %key, raw = %raw, "status field has unexpected type; skipped")
                }
            }
        }
        Ok(self.apply(&msg))
    }

    fn write_field(&self, field: &StatusField) -> Result<bool, AdrError> {
        let pv = field.target();
        if field.is_change_suppressed() {
            self.registry.write_if_changed(pv, field.value(), WriteOrigin::Device)
        } else {
            self.registry
                .write(pv, field.value(), WriteOrigin::Device)
                .map(|_| true)
        }
    }

    fn set_link(&self, up: bool) {
        match self
            .registry
            .write_if_changed(PvName::LinkOk, Value::Int(up as i64), WriteOrigin::Bridge)
        {
            Ok(true) if up => info!("status stream live"),
            Ok(true) => warn!("status stream stale"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to update LINK_OK"),
        }
    }

    // -----------------------------------------------------------------------
    // Read loop
    // -----------------------------------------------------------------------

    /// Read and apply messages from `source` until shutdown or failure.
    ///
    /// Returns `Ok(())` once `shutdown` is signalled.
    ///
    /// # Errors
    ///
    /// * [`AdrError::Transport`] – the source failed.
    /// * [`AdrError::Timeout`] – `max_silent_reads` consecutive reads timed
    ///   out.
    pub async fn run<S: StatusSource>(
        &self,
        source: &mut S,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), AdrError> {
        let mut received = 0;
        self.run_session(source, shutdown, &mut received).await
    }

    async fn run_session<S: StatusSource>(
        &self,
        source: &mut S,
        shutdown: &mut watch::Receiver<bool>,
        received: &mut u64,
    ) -> Result<(), AdrError> {
        let mut silent_reads = 0u32;
        loop {
            let read = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return Ok(()),
                read = tokio::time::timeout(self.config.read_timeout, source.recv()) => read,
            };

            match read {
                Ok(Ok(payload)) => {
                    silent_reads = 0;
                    *received += 1;
                    self.set_link(true);
                    match self.process(&payload) {
                        Ok(report) => trace!(
                            written = report.written,
                            suppressed = report.suppressed,
                            skipped = report.skipped,
                            "status message applied"
                        ),
                        Err(e) => {
                            let end = payload.len().min(PAYLOAD_PREVIEW_BYTES);
                            warn!(
                                error = %e,
                                payload = %String::from_utf8_lossy(&payload[..end]),
                                "dropping undecodable status message"
                            );
                        }
                    }
                }
                Ok(Err(e)) => {
                    self.set_link(false);
                    return Err(e);
                }
                Err(_) => {
                    silent_reads += 1;
                    self.set_link(false);
                    debug!(
                        silent_reads,
                        timeout_ms = self.config.read_timeout.as_millis() as u64,
                        "status read timed out"
                    );
                    if self.config.max_silent_reads > 0 && silent_reads >= self.config.max_silent_reads {
                        return Err(AdrError::Timeout(format!(
                            "no status message in {silent_reads} reads of {:?}",
                            self.config.read_timeout
                        )));
                    }
                }
            }
        }
    }

    /// Keep a status subscription alive until shutdown.
    ///
    /// Connects through `connector`, runs the read loop and, when the session
    /// ends with an error, waits `backoff` before resubscribing.  The attempt
    /// counter resets after any session that delivered a message.
    pub async fn run_supervised<C: StatusConnector>(
        &self,
        connector: &C,
        backoff: &Backoff,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let endpoint = connector.endpoint();
        let mut attempt = 0u32;
        loop {
            let connected = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return,
                connected = connector.connect() => connected,
            };

            match connected {
                Ok(mut source) => {
                    info!(endpoint = %endpoint, "subscribed to status stream");
                    let mut received = 0;
                    match self.run_session(&mut source, shutdown, &mut received).await {
                        Ok(()) => return,
                        Err(e) => {
                            warn!(endpoint = %endpoint, error = %e, received, "status subscription lost")
                        }
                    }
                    if received > 0 {
                        attempt = 0;
                    }
                }
                Err(e) => warn!(endpoint = %endpoint, error = %e, "status subscription failed"),
            }

            self.set_link(false);
            attempt = attempt.saturating_add(1);
            let delay = backoff.delay_for_attempt(attempt);
            debug!(endpoint = %endpoint, attempt, delay_ms = delay.as_millis() as u64, "resubscribing");
            tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    type Frame = Result<Vec<u8>, AdrError>;

    struct ChannelSource {
        rx: mpsc::UnboundedReceiver<Frame>,
    }

    #[async_trait]
    impl StatusSource for ChannelSource {
        async fn recv(&mut self) -> Result<Vec<u8>, AdrError> {
            self.rx.recv().await.unwrap_or_else(|| {
                Err(AdrError::Transport {
                    endpoint: "test".to_string(),
                    details: "closed".to_string(),
                })
            })
        }
    }

    fn channel_source(frames: &[&[u8]]) -> (mpsc::UnboundedSender<Frame>, ChannelSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        for frame in frames {
            tx.send(Ok(frame.to_vec())).unwrap();
        }
        (tx, ChannelSource { rx })
    }

    /// Hands out prepared sources in order, then fails.
    struct QueueConnector {
        sources: Mutex<VecDeque<ChannelSource>>,
        connects: AtomicUsize,
        connected_at: Mutex<Vec<Instant>>,
    }

    impl QueueConnector {
        fn new(sources: impl IntoIterator<Item = ChannelSource>) -> Self {
            Self {
                sources: Mutex::new(sources.into_iter().collect()),
                connects: AtomicUsize::new(0),
                connected_at: Mutex::new(Vec::new()),
            }
        }

        fn connect_times(&self) -> Vec<Instant> {
            self.connected_at.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatusConnector for QueueConnector {
        type Source = ChannelSource;

        async fn connect(&self) -> Result<ChannelSource, AdrError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected_at.lock().unwrap().push(Instant::now());
            self.sources
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AdrError::Transport {
                    endpoint: "queue".to_string(),
                    details: "no more sources".to_string(),
                })
        }

        fn endpoint(&self) -> String {
            "queue".to_string()
        }
    }

    fn make_bridge() -> (Arc<VariableRegistry>, StatusBridge) {
        let registry = Arc::new(VariableRegistry::default());
        let bridge = StatusBridge::new(Arc::clone(&registry));
        (registry, bridge)
    }

    fn fast_config() -> StatusBridgeConfig {
        StatusBridgeConfig {
            read_timeout: Duration::from_millis(20),
            max_silent_reads: 2,
        }
    }

    // ------------------------------------------------------------------
    // Change suppression
    // ------------------------------------------------------------------

    #[test]
    fn unchanged_state_is_not_rewritten() {
        let (registry, bridge) = make_bridge();
        registry
            .write(PvName::State, "Regulating".into(), WriteOrigin::Device)
            .unwrap();

        let report = bridge.process(br#"{"state": "Regulating"}"#).unwrap();

        assert_eq!(report.written, 0);
        assert_eq!(report.suppressed, 1);
        assert_eq!(registry.write_count(PvName::State), 1);
    }

    #[test]
    fn changed_state_is_written_once() {
        let (registry, bridge) = make_bridge();

        bridge.process(br#"{"state": "Ramping"}"#).unwrap();

        assert_eq!(registry.write_count(PvName::State), 1);
        assert_eq!(registry.value(PvName::State), Value::Text("Ramping".into()));
    }

    #[test]
    fn cycle_uid_is_change_suppressed() {
        let (registry, bridge) = make_bridge();

        bridge.process(br#"{"uid": "c-1"}"#).unwrap();
        bridge.process(br#"{"uid": "c-1"}"#).unwrap();
        bridge.process(br#"{"uid": "c-2"}"#).unwrap();

        assert_eq!(registry.write_count(PvName::CycleUid), 2);
        assert_eq!(registry.value(PvName::CycleUid), Value::Text("c-2".into()));
    }

    #[test]
    fn numeric_fields_are_written_every_message() {
        let (registry, bridge) = make_bridge();
        let payload =
            br#"{"temperature": 0.1, "alt_temp": 3.1, "heater": 5.0, "stddev": 2.5, "temp_sp_rb": 0.1}"#;

        bridge.process(payload).unwrap();
        let report = bridge.process(payload).unwrap();

        assert_eq!(report.written, 5);
        for pv in [
            PvName::Temp,
            PvName::AltTemp,
            PvName::HeaterOut,
            PvName::TempRmsUk,
            PvName::TempSpRb,
        ] {
            assert_eq!(registry.write_count(pv), 2, "{pv} should be written twice");
        }
        assert_eq!(registry.value(PvName::TempRmsUk), Value::Float(2.5));
    }

    #[test]
    fn unknown_fields_produce_no_writes_and_no_error() {
        let (registry, bridge) = make_bridge();

        let report = bridge.process(br#"{"pressure": 1e-7, "mode_flags": [1, 2]}"#).unwrap();

        assert_eq!(report, ApplyReport { written: 0, suppressed: 0, skipped: 2 });
        assert!(registry.snapshot().iter().all(|v| v.writes == 0));
    }

    #[test]
    fn badly_typed_field_does_not_block_the_rest() {
        let (registry, bridge) = make_bridge();

        let report = bridge.process(br#"{"temperature": null, "heater": 1.5}"#).unwrap();

        assert_eq!(report.written, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(registry.write_count(PvName::Temp), 0);
        assert_eq!(registry.value(PvName::HeaterOut), Value::Float(1.5));
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let (_, bridge) = make_bridge();
        assert!(matches!(bridge.process(b"{not json"), Err(AdrError::Decode(_))));
    }

    // ------------------------------------------------------------------
    // Read loop
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn run_skips_bad_messages_and_keeps_reading() {
        let (registry, bridge) = make_bridge();
        let (tx, mut source) = channel_source(&[
            br#"{"temperature": 0.2}"#,
            b"garbage",
            br#"{"state": "Idle"}"#,
        ]);
        drop(tx);
        let (_shutdown_tx, mut shutdown) = watch::channel(false);

        let result = bridge.run(&mut source, &mut shutdown).await;

        // Only the closed channel ends the loop.
        assert!(matches!(result, Err(AdrError::Transport { .. })));
        assert_eq!(registry.value(PvName::Temp), Value::Float(0.2));
        assert_eq!(registry.value(PvName::State), Value::Text("Idle".into()));
        assert_eq!(registry.value(PvName::LinkOk), Value::Int(0));
    }

    #[tokio::test]
    async fn messages_are_applied_in_arrival_order() {
        let (registry, bridge) = make_bridge();
        let (tx, mut source) = channel_source(&[
            br#"{"state": "Ramp"}"#,
            br#"{"state": "Soak"}"#,
            br#"{"state": "Regulate"}"#,
        ]);
        drop(tx);
        let mut rx = registry.subscribe();
        let (_shutdown_tx, mut shutdown) = watch::channel(false);

        let _ = bridge.run(&mut source, &mut shutdown).await;

        let mut states = Vec::new();
        while let Ok(update) = rx.try_recv() {
            if update.name == PvName::State {
                states.push(update.value);
            }
        }
        assert_eq!(
            states,
            vec![
                Value::Text("Ramp".into()),
                Value::Text("Soak".into()),
                Value::Text("Regulate".into()),
            ]
        );
    }

    #[tokio::test]
    async fn run_returns_ok_on_shutdown() {
        let (_, bridge) = make_bridge();
        let (_tx, mut source) = channel_source(&[]);
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        assert_eq!(bridge.run(&mut source, &mut shutdown).await, Ok(()));
    }

    #[tokio::test]
    async fn link_goes_up_on_message_and_down_on_silence() {
        let registry = Arc::new(VariableRegistry::default());
        let bridge = StatusBridge::with_config(Arc::clone(&registry), fast_config());
        let (_tx, mut source) = channel_source(&[br#"{"temperature": 0.1}"#]);
        let mut rx = registry.subscribe();
        let (_shutdown_tx, mut shutdown) = watch::channel(false);

        let result = bridge.run(&mut source, &mut shutdown).await;

        assert!(matches!(result, Err(AdrError::Timeout(_))));
        let link: Vec<Value> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|u| u.name == PvName::LinkOk)
            .map(|u| u.value)
            .collect();
        assert_eq!(link, vec![Value::Int(1), Value::Int(0)]);
    }

    #[tokio::test]
    async fn supervised_run_resubscribes_after_failure() {
        let registry = Arc::new(VariableRegistry::default());
        let bridge = StatusBridge::with_config(Arc::clone(&registry), fast_config());

        // First session dies immediately, second delivers one message.
        let (dead_tx, dead) = channel_source(&[]);
        drop(dead_tx);
        let (live_tx, live) = channel_source(&[br#"{"uid": "cycle-42"}"#]);
        let connector = QueueConnector::new([dead, live]);
        let backoff = Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            multiplier: 2.0,
        };
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let mut updates = registry.subscribe();

        let supervised = bridge.run_supervised(&connector, &backoff, &mut shutdown);
        let stop = async {
            // Wait for the second session's message, then stop.
            loop {
                match updates.recv().await {
                    Ok(update) if update.name == PvName::CycleUid => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
            shutdown_tx.send(true).unwrap();
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(supervised, stop);
        })
        .await
        .expect("supervised loop should stop on shutdown");
        drop(live_tx);

        assert!(connector.connects.load(Ordering::SeqCst) >= 2);
        assert_eq!(registry.value(PvName::CycleUid), Value::Text("cycle-42".into()));
    }

    #[tokio::test]
    async fn supervised_run_resets_backoff_after_a_productive_session() {
        let (registry, bridge) = make_bridge();
        let dead = || {
            let (tx, source) = channel_source(&[]);
            drop(tx);
            source
        };
        // Delivers one message, then the stream closes.
        let (productive_tx, productive) = channel_source(&[br#"{"temperature": 0.3}"#]);
        drop(productive_tx);
        let connector = QueueConnector::new([dead(), dead(), productive, dead()]);
        // 20 ms, 200 ms, 2 s, ...
        let backoff = Backoff {
            initial: Duration::from_millis(20),
            max: Duration::from_secs(10),
            multiplier: 10.0,
        };
        let (shutdown_tx, mut shutdown) = watch::channel(false);

        let supervised = bridge.run_supervised(&connector, &backoff, &mut shutdown);
        let stop = async {
            while connector.connect_times().len() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            shutdown_tx.send(true).unwrap();
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(supervised, stop);
        })
        .await
        .expect("supervised loop should stop on shutdown");

        let times = connector.connect_times();
        // Two empty sessions: the second wait is the 200 ms step.
        assert!(times[2] - times[1] >= Duration::from_millis(200));
        // After the productive session the schedule starts over at 20 ms
        // instead of climbing to 2 s.
        assert!(times[3] - times[2] < Duration::from_millis(1500));
        assert_eq!(registry.value(PvName::Temp), Value::Float(0.3));
    }
}
