//! A small value type a caller owns explicitly, rather than a process-wide
//! unit counter. No module-level mutable state is required: a `Registry` is
//! constructed by whoever enumerates devices and handed to each probe call.

use crate::error::{CanFail, Error};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Opaque unit index assigned to a probed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitId(usize);

impl UnitId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Bounds how many devices may be registered at once. This runtime targets
/// a single physical device per driver instance, so the default capacity is 1.
pub struct Registry {
    count: AtomicUsize,
    max: usize,
}

impl Registry {
    pub fn new(max: usize) -> Self {
        Self {
            count: AtomicUsize::new(0),
            max,
        }
    }

    /// Registers one unit slot, failing with [`Error::NoSpace`] once `max`
    /// has been reached.
    pub fn register(&self) -> CanFail<UnitId> {
        let prev = self.count.fetch_add(1, Ordering::SeqCst);
        if prev >= self.max {
            self.count.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::NoSpace("unit registry exhausted"));
        }
        Ok(UnitId(prev))
    }

    pub fn unregister(&self, _unit: UnitId) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_unit_registry_rejects_second_device() {
        let registry = Registry::default();
        let first = registry.register().unwrap();
        assert!(registry.register().is_err());
        registry.unregister(first);
        assert!(registry.register().is_ok());
    }
}
