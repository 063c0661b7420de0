//! # Admission Control
//!
//! Each wire surface owns one [`AdmissionGate`]: a counting semaphore with a
//! fixed capacity. Entry is a non-blocking acquire; a saturated gate rejects
//! the request with [`Error::Overload`] instead of queueing it. The permit is
//! released when the [`AdmissionPermit`] drops at the end of the request.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// RAII slot in an [`AdmissionGate`]; dropping it frees the slot.
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Try to enter; never blocks.
    pub fn try_enter(&self) -> Result<AdmissionPermit> {
        self.permits
            .clone()
            .try_acquire_owned()
            .map(|permit| AdmissionPermit { _permit: permit })
            .map_err(|_| Error::Overload)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_when_saturated() {
        let gate = AdmissionGate::new(2);

        let a = gate.try_enter().unwrap();
        let _b = gate.try_enter().unwrap();
        assert_eq!(gate.in_flight(), 2);

        assert!(matches!(gate.try_enter(), Err(Error::Overload)));

        drop(a);
        assert!(gate.try_enter().is_ok());
    }

    #[test]
    fn test_permit_release_on_drop() {
        let gate = AdmissionGate::new(1);
        {
            let _p = gate.try_enter().unwrap();
            assert_eq!(gate.in_flight(), 1);
        }
        assert_eq!(gate.in_flight(), 0);
    }
}
