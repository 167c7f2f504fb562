//! Variable attribute bits.

use bitflags::bitflags;

bitflags! {
    /// Attributes stored with each variable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Attributes: u32 {
        /// Survives a reset.
        const NON_VOLATILE = 0x0000_0001;
        /// Visible while boot services run.
        const BOOTSERVICE_ACCESS = 0x0000_0002;
        /// Visible after boot services exit. Requires `BOOTSERVICE_ACCESS`.
        const RUNTIME_ACCESS = 0x0000_0004;
        /// Hardware error record.
        const HARDWARE_ERROR_RECORD = 0x0000_0008;
        /// Append the written data to the existing value. Not persisted.
        const APPEND_WRITE = 0x0000_0040;
    }
}

impl Attributes {
    /// The usual attributes of a boot configuration variable.
    pub const NV_BS_RT: Attributes = Attributes::NON_VOLATILE
        .union(Attributes::BOOTSERVICE_ACCESS)
        .union(Attributes::RUNTIME_ACCESS);

    /// Check a caller-supplied attribute set.
    pub fn validate(self) -> Result<(), &'static str> {
        if self.bits() & !Self::all().bits() != 0 {
            return Err("unknown attribute bits");
        }
        if self.contains(Self::RUNTIME_ACCESS) && !self.contains(Self::BOOTSERVICE_ACCESS) {
            return Err("runtime access requires boot service access");
        }
        Ok(())
    }

    /// The attributes as stored on flash.
    pub fn persistent(self) -> Self {
        self.difference(Self::APPEND_WRITE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_needs_boot_service() {
        assert!(Attributes::RUNTIME_ACCESS.validate().is_err());
        assert!(Attributes::NV_BS_RT.validate().is_ok());
        assert!(Attributes::empty().validate().is_ok());
    }

    #[test]
    fn test_unknown_bits_are_rejected() {
        assert!(Attributes::from_bits_retain(0x8000_0000).validate().is_err());
    }

    #[test]
    fn test_append_write_is_not_persisted() {
        let attrs = Attributes::NV_BS_RT | Attributes::APPEND_WRITE;
        assert_eq!(attrs.persistent(), Attributes::NV_BS_RT);
    }
}
