//! Single-flight gate over mutating operations.

use crate::{Error, Result};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Operations serialized by the [`OperationGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Restore,
    Remove,
    Export,
    Reset,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Restore => "restore",
            Operation::Remove => "remove",
            Operation::Export => "export",
            Operation::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Non-blocking mutual exclusion: `try_acquire` either succeeds at once or
/// fails with [`Error::LockBusy`] naming the running operation.
#[derive(Debug, Clone, Default)]
pub struct OperationGate {
    current: Arc<Mutex<Option<Operation>>>,
}

impl OperationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, operation: Operation) -> Result<GateGuard> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| Error::Other("Operation gate poisoned".to_string()))?;
        if let Some(running) = *current {
            return Err(Error::LockBusy {
                operation: running.to_string(),
            });
        }
        *current = Some(operation);
        debug!(%operation, "Acquired operation gate");
        Ok(GateGuard {
            current: Arc::clone(&self.current),
            operation,
        })
    }

    /// The operation currently holding the gate, if any.
    pub fn in_flight(&self) -> Option<Operation> {
        self.current.lock().ok().and_then(|current| *current)
    }
}

/// Releases the gate when dropped.
#[derive(Debug)]
pub struct GateGuard {
    current: Arc<Mutex<Option<Operation>>>,
    operation: Operation,
}

impl GateGuard {
    pub fn operation(&self) -> Operation {
        self.operation
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        // Recover from poisoning so a panicked operation cannot wedge the gate.
        let mut current = match self.current.lock() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = None;
        debug!(operation = %self.operation, "Released operation gate");
    }
}
