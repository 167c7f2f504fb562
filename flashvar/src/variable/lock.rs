//! Variable write locks that take effect at end of boot.

use alloc::collections::BTreeSet;

use crate::variable::index::VariableKey;

/// Why a lock request was refused.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Locks can only be requested before end of boot.
    TooLate,
}

/// Keys that become read-only once the platform signals end of boot.
#[derive(Debug, Default)]
pub struct VariableLocks {
    locked: BTreeSet<VariableKey>,
    end_of_boot: bool,
}

impl VariableLocks {
    /// No locks, boot in progress.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `key` from end of boot on.
    pub fn request(&mut self, key: VariableKey) -> Result<(), LockError> {
        if self.end_of_boot {
            return Err(LockError::TooLate);
        }
        self.locked.insert(key);
        Ok(())
    }

    /// Enforce the requested locks. Cannot be undone.
    pub fn signal_end_of_boot(&mut self) {
        self.end_of_boot = true;
    }

    /// Whether end of boot has been signalled.
    pub fn is_end_of_boot(&self) -> bool {
        self.end_of_boot
    }

    /// Whether writes to `key` are refused.
    pub fn is_write_protected(&self, key: &VariableKey) -> bool {
        self.end_of_boot && self.locked.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::Guid;

    #[test]
    fn test_locks_apply_after_end_of_boot() {
        let key = VariableKey::new(Guid::NIL, "Setup");
        let mut locks = VariableLocks::new();
        locks.request(key.clone()).unwrap();
        assert!(!locks.is_write_protected(&key));

        locks.signal_end_of_boot();
        assert!(locks.is_write_protected(&key));
        assert!(!locks.is_write_protected(&VariableKey::new(Guid::NIL, "Other")));
        assert_eq!(locks.request(VariableKey::new(Guid::NIL, "Late")), Err(LockError::TooLate));
    }
}
