//! Open mode definitions

use nix::fcntl::OFlag;

/// Access mode for a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// How a shared memory object is opened
///
/// Create, exclusive and truncate combine freely; read-only and read-write
/// are exclusive by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub access: AccessMode,
    /// Create the object if it does not exist
    pub create: bool,
    /// Fail if the object already exists (only meaningful with `create`)
    pub exclusive: bool,
    /// Discard existing contents on open
    pub truncate: bool,
}

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags::new(AccessMode::ReadOnly);
    pub const READ_WRITE: OpenFlags = OpenFlags::new(AccessMode::ReadWrite);
    pub const CREATE_READ_WRITE: OpenFlags = OpenFlags::READ_WRITE.create();

    pub const fn new(access: AccessMode) -> Self {
        Self {
            access,
            create: false,
            exclusive: false,
            truncate: false,
        }
    }

    pub const fn create(mut self) -> Self {
        self.create = true;
        self
    }

    pub const fn exclusive(mut self) -> Self {
        self.create = true;
        self.exclusive = true;
        self
    }

    pub const fn truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    pub(crate) fn to_oflag(self) -> OFlag {
        let mut flags = match self.access {
            AccessMode::ReadOnly => OFlag::O_RDONLY,
            AccessMode::ReadWrite => OFlag::O_RDWR,
        };
        if self.create {
            flags |= OFlag::O_CREAT;
        }
        if self.exclusive {
            flags |= OFlag::O_EXCL;
        }
        if self.truncate {
            flags |= OFlag::O_TRUNC;
        }
        flags
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::CREATE_READ_WRITE
    }
}

/// What to do with initial bytes supplied at open time
///
/// Whether initial values should win over an existing object's contents has
/// no single right answer, so both behaviours are offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitPolicy {
    /// Overwrite the region on every local open, even if another process
    /// already initialized it. Last writer wins.
    #[default]
    Overwrite,
    /// Write only if this open created the object. A reader racing the
    /// creator may still observe the region before it is written.
    IfCreated,
}
