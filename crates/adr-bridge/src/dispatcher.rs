//! [`CommandDispatcher`] – operator writes to device commands.
//!
//! The dispatcher drains the registry's operator-write queue and turns
//! writes on the three command variables into requests on the control
//! channel:
//!
//! | Variable | Written value | Method | Params |
//! |---|---|---|---|
//! | `PAUSE` | `1` | `pausePID` | `[]` |
//! | `PAUSE` | anything else | `resumePID` | `[]` |
//! | `START_CYCLE` | truthy | `start_mag_cycle` | `[]` |
//! | `START_CYCLE` | falsy | *(nothing sent)* | |
//! | `TEMP_SP` | any | `set_temp_sp_k` | `[value]` |
//!
//! Dispatch is fire-and-forget.  Every command runs on its own task, bounded
//! by [`DispatcherConfig::send_timeout`]; the registry write that triggered it
//! has already completed.  Commands issued back to back may reach the device
//! in either order.  The result of each send is logged and published as a
//! [`CommandReport`] for anyone who subscribes via
//! [`CommandDispatcher::subscribe_outcomes`]; nobody has to.

use std::sync::Arc;
use std::time::Duration;

use adr_types::{
    AdrError, CommandOutcome, CommandReport, DeviceCommand, PvName, VariableUpdate, WriteOrigin,
};
use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::shutdown::wait_for_shutdown;
use crate::transport::ControlChannel;

/// Buffered command reports before slow subscribers lag.
const OUTCOME_CAPACITY: usize = 64;

/// When a truthy `START_CYCLE` write actually starts a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartCyclePolicy {
    /// Every truthy write sends `start_mag_cycle`.
    #[default]
    EveryWrite,
    /// Only a write that follows a falsy stored value.
    RisingEdge,
    /// At most one start per interval; extra writes are dropped.
    MinInterval(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    pub send_timeout: Duration,
    pub start_cycle_policy: StartCyclePolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(2),
            start_cycle_policy: StartCyclePolicy::default(),
        }
    }
}

/// Sends device commands in reaction to operator writes.
pub struct CommandDispatcher {
    channel: Arc<dyn ControlChannel>,
    config: DispatcherConfig,
    start_limiter: Option<DefaultDirectRateLimiter>,
    outcomes: broadcast::Sender<CommandReport>,
}

impl CommandDispatcher {
    /// # Errors
    ///
    /// [`AdrError::Config`] for a zero [`StartCyclePolicy::MinInterval`].
    pub fn new(channel: Arc<dyn ControlChannel>, config: DispatcherConfig) -> Result<Self, AdrError> {
        let start_limiter = match config.start_cycle_policy {
            StartCyclePolicy::MinInterval(interval) => {
                let quota = Quota::with_period(interval).ok_or_else(|| {
                    AdrError::Config("start cycle interval must be non-zero".to_string())
                })?;
                Some(RateLimiter::direct(quota))
            }
            _ => None,
        };
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        Ok(Self {
            channel,
            config,
            start_limiter,
            outcomes,
        })
    }

    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<CommandReport> {
        self.outcomes.subscribe()
    }

    /// The command an update should trigger, if any.
    ///
    /// Only [`WriteOrigin::Operator`] writes trigger commands.  Under
    /// [`StartCyclePolicy::MinInterval`] an accepted `START_CYCLE` write
    /// consumes the interval.
    pub fn command_for(&self, update: &VariableUpdate) -> Option<DeviceCommand> {
        if update.origin != WriteOrigin::Operator {
            return None;
        }
        match update.name {
            PvName::Pause => {
                if update.value.as_i64() == Some(1) {
                    Some(DeviceCommand::PausePid)
                } else {
                    Some(DeviceCommand::ResumePid)
                }
            }
            PvName::StartCycle => {
                if !update.value.is_truthy() {
                    return None;
                }
                let allowed = match self.config.start_cycle_policy {
                    StartCyclePolicy::EveryWrite => true,
                    StartCyclePolicy::RisingEdge => !update.previous.is_truthy(),
                    StartCyclePolicy::MinInterval(_) => self
                        .start_limiter
                        .as_ref()
                        .is_none_or(|limiter| limiter.check().is_ok()),
                };
                if !allowed {
                    debug!(policy = ?self.config.start_cycle_policy, "START_CYCLE write debounced");
                    return None;
                }
                Some(DeviceCommand::StartMagCycle)
            }
            PvName::TempSp => match update.value.as_f64() {
                Some(kelvin) => Some(DeviceCommand::SetTempSetpoint(kelvin)),
                None => {
                    warn!(value = %update.value, "TEMP_SP write is not numeric");
                    None
                }
            },
            _ => None,
        }
    }

    /// Send `command` on its own task.
    ///
    /// Nothing needs to await the handle; it is returned for callers that
    /// want the outcome inline (tests, one-shot tools).
    pub fn dispatch(&self, command: DeviceCommand) -> JoinHandle<CommandOutcome> {
        let channel = Arc::clone(&self.channel);
        let outcomes = self.outcomes.clone();
        let send_timeout = self.config.send_timeout;

        tokio::spawn(async move {
            let method = command.method();
            let endpoint = channel.endpoint();
            let outcome = match command.to_request().to_json() {
                Err(e) => CommandOutcome::Failed(e.to_string()),
                Ok(payload) => match tokio::time::timeout(send_timeout, channel.send(payload)).await {
                    Ok(Ok(())) => CommandOutcome::Sent,
                    Ok(Err(e)) => CommandOutcome::Failed(e.to_string()),
                    Err(_) => CommandOutcome::TimedOut,
                },
            };

            match &outcome {
                CommandOutcome::Sent => info!(method, endpoint = %endpoint, "command sent"),
                CommandOutcome::Failed(e) => {
                    warn!(method, endpoint = %endpoint, error = %e, "command failed")
                }
                CommandOutcome::TimedOut => warn!(
                    method,
                    endpoint = %endpoint,
                    timeout_ms = send_timeout.as_millis() as u64,
                    "command send timed out"
                ),
            }

            // No outcome subscribers is the common case.
            let _ = outcomes.send(CommandReport {
                command,
                outcome: outcome.clone(),
                timestamp: Utc::now(),
            });
            outcome
        })
    }

    /// Consume operator writes until shutdown or the registry goes away.
    ///
    /// Feed it [`VariableRegistry::subscribe_operator_writes`][adr_registry::VariableRegistry::subscribe_operator_writes],
    /// which never drops a write.
    pub async fn run(
        self,
        mut writes: mpsc::UnboundedReceiver<VariableUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let update = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                update = writes.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            if let Some(command) = self.command_for(&update) {
                // Detached; the outcome is logged by the task.
                drop(self.dispatch(command));
            }
        }
        debug!("command dispatcher stopped");
    }
}
