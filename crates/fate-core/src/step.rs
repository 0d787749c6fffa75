//! The step capability and its serialization seam.
//!
//! A transaction is a stack of steps. The engine drives the four step
//! contracts (`is_ready`, `call`, `undo`, `return_value`) and never looks
//! inside a step beyond them. Durable stores persist steps opaquely: the
//! step's `encode` output is stored next to its `name`, and a
//! [`StepRegistry`] rebuilds the step from that pair on read.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FateError, Result};
use crate::id::FateId;

/// One unit of work in a transaction.
///
/// Implementations must make `call` idempotent in the sense that re-running
/// it after a crash (the previous run may or may not have completed) reaches
/// the same outcome, and `undo` idempotent outright. The engine guarantees
/// it invokes `undo` only on steps that were pushed, in reverse push order.
pub trait Step<E: 'static>: Send + Sync {
    /// Stable identifying name for this step type. Durable stores use it as
    /// the decoder key.
    fn name(&self) -> &str;

    /// Readiness probe. `Duration::ZERO` means run now; anything larger
    /// defers the whole transaction for at least that long.
    fn is_ready(&self, id: FateId, env: &E) -> anyhow::Result<Duration>;

    /// Execute the step. Returning a step pushes it as the new top of the
    /// stack; returning `None` pops this step as successful.
    fn call(&self, id: FateId, env: &E) -> anyhow::Result<Option<Box<dyn Step<E>>>>;

    /// Compensate side effects of this step.
    fn undo(&self, id: FateId, env: &E) -> anyhow::Result<()>;

    /// Success payload; only meaningful on the step whose pop empties the
    /// stack.
    fn return_value(&self) -> Option<Value> {
        None
    }

    /// Opaque serialized form for durable stores. Implementations own the
    /// payload schema; pair with a decoder registered under `name()`.
    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

impl<E: 'static> fmt::Debug for dyn Step<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("name", &self.name()).finish()
    }
}

type Decoder<E> = Box<dyn Fn(&[u8]) -> anyhow::Result<Arc<dyn Step<E>>> + Send + Sync>;

/// Rebuilds steps from their persisted `(name, payload)` form.
pub struct StepRegistry<E: 'static> {
    decoders: HashMap<String, Decoder<E>>,
}

impl<E: 'static> StepRegistry<E> {
    pub fn new() -> Self {
        StepRegistry {
            decoders: HashMap::new(),
        }
    }

    /// Register a decoder for the step type identified by `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, decode: F)
    where
        F: Fn(&[u8]) -> anyhow::Result<Arc<dyn Step<E>>> + Send + Sync + 'static,
    {
        self.decoders.insert(name.into(), Box::new(decode));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    pub fn decode(&self, name: &str, payload: &[u8]) -> Result<Arc<dyn Step<E>>> {
        let decoder = self.decoders.get(name).ok_or_else(|| {
            FateError::Serialization(format!("no step decoder registered for {name:?}"))
        })?;
        decoder(payload)
            .map_err(|e| FateError::Serialization(format!("decoding step {name:?}: {e:#}")))
    }
}

impl<E: 'static> Default for StepRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePhase {
    IsReady,
    Call,
    Cancelled,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePhase::IsReady => f.write_str("is_ready"),
            FailurePhase::Call => f.write_str("call"),
            FailurePhase::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Why a transaction entered the failed lifecycle. Stored in the row and
/// surfaced verbatim through `get_exception`; compensation never replaces
/// it (undo failures are only logged).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub step: String,
    pub phase: FailurePhase,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ExceptionRecord {
    pub fn new(step: impl Into<String>, phase: FailurePhase, message: impl Into<String>) -> Self {
        ExceptionRecord {
            step: step.into(),
            phase,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for ExceptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}: {}", self.phase, self.step, self.message)
    }
}

/// Well-known transaction-info keys. Values are opaque JSON; steps may read
/// them but only the public API writes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxInfoKey {
    /// Operation tag set at seed time (e.g. "compact-table").
    FateOp,
    /// Delete the row automatically once it reaches a terminal status.
    AutoClean,
    /// Human-readable reason recorded at seed time.
    Reason,
    /// Success payload captured from the terminal step.
    ReturnValue,
}

impl TxInfoKey {
    pub const ALL: [TxInfoKey; 4] = [
        TxInfoKey::FateOp,
        TxInfoKey::AutoClean,
        TxInfoKey::Reason,
        TxInfoKey::ReturnValue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TxInfoKey::FateOp => "fate_op",
            TxInfoKey::AutoClean => "auto_clean",
            TxInfoKey::Reason => "reason",
            TxInfoKey::ReturnValue => "return_value",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        TxInfoKey::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopStep;

    impl Step<()> for NoopStep {
        fn name(&self) -> &str {
            "NoopStep"
        }

        fn is_ready(&self, _id: FateId, _env: &()) -> anyhow::Result<Duration> {
            Ok(Duration::ZERO)
        }

        fn call(&self, _id: FateId, _env: &()) -> anyhow::Result<Option<Box<dyn Step<()>>>> {
            Ok(None)
        }

        fn undo(&self, _id: FateId, _env: &()) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_round_trip() {
        let mut registry: StepRegistry<()> = StepRegistry::new();
        registry.register("NoopStep", |_payload| Ok(Arc::new(NoopStep)));

        let step = NoopStep;
        let payload = step.encode().unwrap();
        let decoded = registry.decode(step.name(), &payload).unwrap();
        assert_eq!(decoded.name(), "NoopStep");
    }

    #[test]
    fn test_registry_unknown_name() {
        let registry: StepRegistry<()> = StepRegistry::new();
        let err = registry.decode("Mystery", &[]).unwrap_err();
        assert!(matches!(err, FateError::Serialization(_)));
    }

    #[test]
    fn test_tx_info_key_round_trip() {
        for key in TxInfoKey::ALL {
            assert_eq!(TxInfoKey::parse(key.as_str()), Some(key));
        }
        assert_eq!(TxInfoKey::parse("nope"), None);
    }
}
