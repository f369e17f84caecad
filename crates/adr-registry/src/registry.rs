//! [`VariableRegistry`] – the named, typed slots exposed to operators.
//!
//! The registry is the only state the status bridge and the command
//! dispatcher share.  It stores one [`Slot`] per [`PvName`], and after every
//! successful write broadcasts a [`VariableUpdate`] on a Tokio broadcast
//! channel so that observers such as the operator gateway see writes
//! without polling.  That channel is bounded and lags under telemetry
//! bursts, so operator writes are additionally queued, unbounded and in
//! order, to every [`subscribe_operator_writes`][VariableRegistry::subscribe_operator_writes]
//! receiver.  Command dispatch consumes that queue.
//!
//! # Write paths
//!
//! | Method | Origin | Checks |
//! |---|---|---|
//! | [`write`][VariableRegistry::write] | device / bridge | kind coercion |
//! | [`write_if_changed`][VariableRegistry::write_if_changed] | device / bridge | kind coercion, skips equal values |
//! | [`put`][VariableRegistry::put] | operator | name lookup, writability, kind coercion |

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

use adr_types::{AdrError, PvKind, PvName, Value, VariableUpdate, WriteOrigin};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::slot::{Slot, coerce};

/// Default record prefix of the ADR variables on the supervisory network.
pub const DEFAULT_PREFIX: &str = "XF:07ID-ES{UCAL:ADR}:";

/// Buffered updates before slow subscribers start lagging.
const UPDATE_CAPACITY: usize = 256;

/// Read-only view of one variable, as served to operator tools.
#[derive(Debug, Clone, Serialize)]
pub struct VariableInfo {
    pub name: PvName,
    pub full_name: String,
    pub kind: PvKind,
    pub value: Value,
    pub doc: &'static str,
    pub unit: Option<&'static str>,
    pub writable: bool,
    pub writes: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Registry of every [`PvName`] with its current value.
///
/// Share it behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct VariableRegistry {
    prefix: String,
    slots: RwLock<BTreeMap<PvName, Slot>>,
    updates: broadcast::Sender<VariableUpdate>,
    operator_writes: Mutex<Vec<mpsc::UnboundedSender<VariableUpdate>>>,
}

impl VariableRegistry {
    /// Create a registry holding every variable at its initial value.
    pub fn new(prefix: impl Into<String>) -> Self {
        let slots = PvName::ALL.into_iter().map(|pv| (pv, Slot::new(pv))).collect();
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            prefix: prefix.into(),
            slots: RwLock::new(slots),
            updates,
            operator_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Network-visible name, e.g. `XF:07ID-ES{UCAL:ADR}:TEMP`.
    pub fn full_name(&self, name: PvName) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Current stored value of `name`.
    pub fn value(&self, name: PvName) -> Value {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(&name)
            .map(|slot| slot.value.clone())
            .unwrap_or_else(|| name.initial_value())
    }

    /// Number of successful writes to `name` since startup.
    pub fn write_count(&self, name: PvName) -> u64 {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(&name).map_or(0, |slot| slot.writes)
    }

    /// Store `value` in `name` unconditionally and broadcast the update.
    ///
    /// # Errors
    ///
    /// [`AdrError::TypeMismatch`] if `value` cannot be coerced to the
    /// variable's kind.
    pub fn write(&self, name: PvName, value: Value, origin: WriteOrigin) -> Result<(), AdrError> {
        self.store(name, value, origin, false).map(|_| ())
    }

    /// Store `value` only when it differs from the current value.
    ///
    /// Returns `true` when a write happened.  The comparison and the write
    /// happen under one lock.
    pub fn write_if_changed(
        &self,
        name: PvName,
        value: Value,
        origin: WriteOrigin,
    ) -> Result<bool, AdrError> {
        self.store(name, value, origin, true)
    }

    /// Operator write by network or short name.
    ///
    /// The write completes here; any command it triggers runs independently
    /// off the update broadcast.
    ///
    /// # Errors
    ///
    /// * [`AdrError::UnknownVariable`] – `name` does not resolve.
    /// * [`AdrError::ReadOnly`] – the variable is fed by the device.
    /// * [`AdrError::TypeMismatch`] – wrong value kind.
    pub fn put(&self, name: &str, value: Value) -> Result<PvName, AdrError> {
        let pv = self.resolve(name)?;
        if !pv.is_writable() {
            return Err(AdrError::ReadOnly(pv));
        }
        self.write(pv, value, WriteOrigin::Operator)?;
        info!(pv = %pv, value = %self.value(pv), "operator put");
        Ok(pv)
    }

    /// Resolve a short (`TEMP`) or full (`<prefix>TEMP`) name.
    ///
    /// A name carrying any other prefix is unknown.
    pub fn resolve(&self, name: &str) -> Result<PvName, AdrError> {
        let short = name.strip_prefix(self.prefix.as_str()).unwrap_or(name);
        short
            .parse()
            .map_err(|_| AdrError::UnknownVariable(name.to_string()))
    }

    /// Subscribe to every future write.  Slow receivers lag and lose the
    /// oldest updates.
    pub fn subscribe(&self) -> broadcast::Receiver<VariableUpdate> {
        self.updates.subscribe()
    }

    /// Receive every future [`WriteOrigin::Operator`] write, none dropped.
    ///
    /// The receiver closes when the registry is dropped.
    pub fn subscribe_operator_writes(&self) -> mpsc::UnboundedReceiver<VariableUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.operator_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Every variable with its metadata, in [`PvName`] order.
    pub fn snapshot(&self) -> Vec<VariableInfo> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .iter()
            .map(|(name, slot)| VariableInfo {
                name: *name,
                full_name: self.full_name(*name),
                kind: name.kind(),
                value: slot.value.clone(),
                doc: name.doc(),
                unit: name.unit(),
                writable: name.is_writable(),
                writes: slot.writes,
                updated_at: slot.updated_at,
            })
            .collect()
    }

    fn store(
        &self,
        name: PvName,
        value: Value,
        origin: WriteOrigin,
        only_if_changed: bool,
    ) -> Result<bool, AdrError> {
        let value = coerce(name, value)?;
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(name).or_insert_with(|| Slot::new(name));
        if only_if_changed && slot.value == value {
            return Ok(false);
        }
        let previous = slot.store(value.clone());
        let update = VariableUpdate {
            id: Uuid::new_v4(),
            timestamp: slot.updated_at.unwrap_or_else(Utc::now),
            name,
            value,
            previous,
            origin,
        };
        // Publish under the lock so subscribers see writes in store order.
        if origin == WriteOrigin::Operator {
            let mut queues = self
                .operator_writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queues.retain(|tx| tx.send(update.clone()).is_ok());
        }
        // No subscribers is normal.
        if self.updates.send(update).is_err() {
            debug!(pv = %name, "registry update had no subscribers");
        }
        Ok(true)
    }
}

impl Default for VariableRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}
