use bitflags::bitflags;

bitflags! {
    pub struct OpenFlags: u32 {
        const O_RDONLY = 0;
        const O_WRONLY = 0x1;
        const O_RDWR = 0x2;
        const O_CREATE = 0x200;
    }
}

/// The access half of an open mode. Exactly one of these is stored in an
/// open-file entry; the creation bit is consumed by `open` itself.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenFlags {
    /// Extracts the access mode, rejecting the nonsensical
    /// `O_WRONLY | O_RDWR` combination.
    pub fn access_mode(self) -> Result<AccessMode, ()> {
        match self.bits() & 0x3 {
            0 => Ok(AccessMode::ReadOnly),
            0x1 => Ok(AccessMode::WriteOnly),
            0x2 => Ok(AccessMode::ReadWrite),
            _ => Err(()),
        }
    }
}

impl AccessMode {
    pub fn readable(self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    pub fn writable(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_mode_extraction() {
        assert_eq!(
            OpenFlags::O_RDONLY.access_mode(),
            Ok(AccessMode::ReadOnly)
        );
        assert_eq!(
            OpenFlags::O_WRONLY.access_mode(),
            Ok(AccessMode::WriteOnly)
        );
        assert_eq!(OpenFlags::O_RDWR.access_mode(), Ok(AccessMode::ReadWrite));
        assert_eq!(
            (OpenFlags::O_CREATE | OpenFlags::O_RDWR).access_mode(),
            Ok(AccessMode::ReadWrite)
        );
        assert_eq!(
            (OpenFlags::O_WRONLY | OpenFlags::O_RDWR).access_mode(),
            Err(())
        );
    }

    #[test]
    fn mode_capabilities() {
        assert!(AccessMode::ReadOnly.readable());
        assert!(!AccessMode::ReadOnly.writable());
        assert!(!AccessMode::WriteOnly.readable());
        assert!(AccessMode::WriteOnly.writable());
        assert!(AccessMode::ReadWrite.readable());
        assert!(AccessMode::ReadWrite.writable());
    }
}
