//! POSIX shared memory segments

use crate::flags::{AccessMode, InitPolicy, OpenFlags};
use crate::name::{NameCodec, Named};
use crate::{Error, Result};
use log::{debug, error, trace, warn};
use nix::errno::Errno;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::ptr::{self, NonNull};

/// Default permission bits for new objects
pub const DEFAULT_PERMISSIONS: libc::mode_t = 0o640;

#[derive(Debug)]
struct Mapping {
    fd: OwnedFd,
    base: NonNull<u8>,
}

// Safety: the mapping is process-wide memory; it is only unmapped under the
// segment's write guard
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Builder for opening a [`SharedSegment`]
#[derive(Debug, Clone)]
pub struct SegmentOptions {
    name: String,
    size: usize,
    flags: OpenFlags,
    permissions: libc::mode_t,
    delete_on_release: bool,
    initial: Option<Vec<u8>>,
    init_policy: InitPolicy,
    codec: NameCodec,
}

impl SegmentOptions {
    pub fn new(name: &str, size: usize) -> Self {
        Self {
            name: name.to_string(),
            size,
            flags: OpenFlags::default(),
            permissions: DEFAULT_PERMISSIONS,
            delete_on_release: false,
            initial: None,
            init_policy: InitPolicy::default(),
            codec: NameCodec::SHM,
        }
    }

    /// Open flags, ignored when an initial value is set
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Permission bits for a newly created object
    pub fn permissions(mut self, mode: libc::mode_t) -> Self {
        self.permissions = mode;
        self
    }

    /// Unlink the OS object when the segment is released
    pub fn delete_on_release(mut self, delete: bool) -> Self {
        self.delete_on_release = delete;
        self
    }

    /// Bytes written over the region after mapping.
    ///
    /// Forces create + read-write. Shorter input is zero-padded, longer input
    /// is cut to the segment size.
    pub fn initial_value(mut self, bytes: &[u8]) -> Self {
        self.initial = Some(bytes.to_vec());
        self
    }

    pub fn init_policy(mut self, policy: InitPolicy) -> Self {
        self.init_policy = policy;
        self
    }

    pub fn codec(mut self, codec: NameCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Open the segment, logging failures and returning an invalid segment
    pub fn open(self) -> SharedSegment {
        let os_name = self.codec.encode(&self.name);
        match self.open_encoded(os_name.clone()) {
            Ok(segment) => segment,
            Err(e) => {
                error!("{}", e);
                SharedSegment {
                    access: self.effective_flags().access,
                    name: self.name,
                    os_name,
                    size: self.size,
                    delete_on_release: self.delete_on_release,
                    mapping: RwLock::new(None),
                }
            }
        }
    }

    /// Open the segment
    pub fn try_open(self) -> Result<SharedSegment> {
        let os_name = self.codec.encode(&self.name);
        self.open_encoded(os_name)
    }

    fn open_encoded(&self, os_name: String) -> Result<SharedSegment> {
        let (fd, created) = self.open_fd(&os_name)?;

        let current = object_size(&fd).map_err(|source| Error::ResourceSize {
            name: os_name.clone(),
            size: self.size,
            source,
        })?;
        // grow only, never shrink
        if current < self.size {
            Errno::result(unsafe { libc::ftruncate(fd.as_raw_fd(), self.size as libc::off_t) })
                .map_err(|source| Error::ResourceSize {
                    name: os_name.clone(),
                    size: self.size,
                    source,
                })?;
        }

        let access = self.effective_flags().access;
        let base = map(&fd, self.size, access).map_err(|source| Error::Map {
            name: os_name.clone(),
            size: self.size,
            source,
        })?;

        debug!(
            "opened segment '{}' as {} ({} bytes, fd={})",
            self.name,
            os_name,
            self.size,
            fd.as_raw_fd()
        );

        let segment = SharedSegment {
            name: self.name.clone(),
            os_name,
            size: self.size,
            access,
            delete_on_release: self.delete_on_release,
            mapping: RwLock::new(Some(Mapping { fd, base })),
        };

        if let Some(initial) = &self.initial {
            if self.init_policy == InitPolicy::Overwrite || created {
                segment.write(|bytes| {
                    if initial.len() > bytes.len() {
                        warn!(
                            "initial value for '{}' is {} bytes, segment holds {}",
                            segment.name,
                            initial.len(),
                            bytes.len()
                        );
                    }
                    let n = initial.len().min(bytes.len());
                    bytes[..n].copy_from_slice(&initial[..n]);
                    bytes[n..].fill(0);
                })?;
            } else {
                trace!("'{}' already existed, initial value skipped", segment.name);
            }
        }

        Ok(segment)
    }

    fn effective_flags(&self) -> OpenFlags {
        if self.initial.is_some() {
            OpenFlags::CREATE_READ_WRITE
        } else {
            self.flags
        }
    }

    /// Returns the descriptor and whether this call created the object
    fn open_fd(&self, os_name: &str) -> Result<(OwnedFd, bool)> {
        let mode = Mode::from_bits_truncate(self.permissions);
        let open = |flags: OpenFlags| shm_open(os_name, flags.to_oflag(), mode);

        let opened = match (&self.initial, self.init_policy) {
            (None, _) => open(self.flags).map(|fd| (fd, self.flags.exclusive)),
            (Some(_), InitPolicy::Overwrite) => {
                open(OpenFlags::CREATE_READ_WRITE).map(|fd| (fd, false))
            }
            (Some(_), InitPolicy::IfCreated) => {
                match open(OpenFlags::CREATE_READ_WRITE.exclusive()) {
                    Ok(fd) => Ok((fd, true)),
                    Err(Errno::EEXIST) => open(OpenFlags::CREATE_READ_WRITE).map(|fd| (fd, false)),
                    Err(e) => Err(e),
                }
            }
        };

        opened.map_err(|source| Error::ResourceOpen {
            name: os_name.to_string(),
            source,
        })
    }
}

fn object_size(fd: &OwnedFd) -> nix::Result<usize> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    Errno::result(unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) })?;
    Ok(unsafe { stat.assume_init() }.st_size as usize)
}

fn map(fd: &OwnedFd, size: usize, access: AccessMode) -> nix::Result<NonNull<u8>> {
    let len = NonZeroUsize::new(size).ok_or(Errno::EINVAL)?;
    let prot = match access {
        AccessMode::ReadOnly => ProtFlags::PROT_READ,
        AccessMode::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
    };
    let base = unsafe { mmap(None, len, prot, MapFlags::MAP_SHARED, fd, 0)? };
    Ok(base.cast())
}

/// One mapped POSIX shared memory object
///
/// A segment is valid while it holds an open descriptor and a mapping. It
/// becomes invalid for good after [`release`](Self::release) or a failed
/// open; there is no partially valid state.
#[derive(Debug)]
pub struct SharedSegment {
    name: String,
    os_name: String,
    size: usize,
    access: AccessMode,
    delete_on_release: bool,
    mapping: RwLock<Option<Mapping>>,
}

impl SharedSegment {
    /// A segment that never mapped anything
    pub(crate) fn unmapped(name: &str, size: usize) -> Self {
        Self {
            name: name.to_string(),
            os_name: NameCodec::SHM.encode(name),
            size,
            access: AccessMode::ReadWrite,
            delete_on_release: false,
            mapping: RwLock::new(None),
        }
    }

    /// Open or create a segment of at least `size` bytes
    pub fn open(name: &str, size: usize, flags: OpenFlags, delete_on_release: bool) -> Self {
        SegmentOptions::new(name, size)
            .flags(flags)
            .delete_on_release(delete_on_release)
            .open()
    }

    pub fn try_open(
        name: &str,
        size: usize,
        flags: OpenFlags,
        delete_on_release: bool,
    ) -> Result<Self> {
        SegmentOptions::new(name, size)
            .flags(flags)
            .delete_on_release(delete_on_release)
            .try_open()
    }

    /// Open or create a segment and overwrite it with `bytes`.
    ///
    /// The overwrite happens even if the object already existed and another
    /// process wrote to it. Use [`SegmentOptions::init_policy`] with
    /// [`InitPolicy::IfCreated`] to write only into fresh objects.
    pub fn open_with_initial_value(
        name: &str,
        bytes: &[u8],
        size: usize,
        delete_on_release: bool,
    ) -> Self {
        SegmentOptions::new(name, size)
            .initial_value(bytes)
            .delete_on_release(delete_on_release)
            .open()
    }

    /// Open an existing object and map its whole current size
    pub fn attach(name: &str, access: AccessMode) -> Result<Self> {
        let os_name = NameCodec::SHM.encode(name);
        let fd = shm_open(
            os_name.as_str(),
            OpenFlags::new(access).to_oflag(),
            Mode::empty(),
        )
        .map_err(|source| Error::ResourceOpen {
            name: os_name.clone(),
            source,
        })?;

        let size = object_size(&fd).map_err(|source| Error::ResourceSize {
            name: os_name.clone(),
            size: 0,
            source,
        })?;
        let base = map(&fd, size, access).map_err(|source| Error::Map {
            name: os_name.clone(),
            size,
            source,
        })?;

        debug!("attached segment '{}' ({} bytes)", name, size);

        Ok(Self {
            name: name.to_string(),
            os_name,
            size,
            access,
            delete_on_release: false,
            mapping: RwLock::new(Some(Mapping { fd, base })),
        })
    }

    /// Check whether the OS object for `name` exists.
    ///
    /// Probes with a create-exclusive open and removes the object again if
    /// the probe created it.
    pub fn check_exists(name: &str) -> bool {
        let os_name = NameCodec::SHM.encode(name);
        let probe = OpenFlags::READ_ONLY.exclusive().to_oflag();
        match shm_open(os_name.as_str(), probe, Mode::empty()) {
            Ok(fd) => {
                drop(fd);
                if let Err(e) = shm_unlink(os_name.as_str()) {
                    warn!("cannot remove probe object {}: {}", os_name, e);
                }
                false
            }
            Err(Errno::EEXIST) => true,
            Err(e) => {
                warn!("cannot probe {}: {}", os_name, e);
                false
            }
        }
    }

    /// Remove the OS object for `name`, returns false if it did not exist
    pub fn unlink(name: &str) -> bool {
        match Self::try_unlink(name) {
            Ok(()) => true,
            Err(e) => {
                debug!("{}", e);
                false
            }
        }
    }

    pub fn try_unlink(name: &str) -> Result<()> {
        let os_name = NameCodec::SHM.encode(name);
        shm_unlink(os_name.as_str()).map_err(|source| Error::Unlink {
            name: os_name,
            source,
        })
    }

    /// OS-visible name
    pub fn os_name(&self) -> &str {
        &self.os_name
    }

    /// Mapped size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the access mode the segment was mapped with
    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// Whether releasing the segment also unlinks the OS object
    pub fn is_delete_on_release(&self) -> bool {
        self.delete_on_release
    }

    /// Check if the segment is still mapped
    pub fn is_valid(&self) -> bool {
        self.mapping.read_recursive().is_some()
    }

    /// Base address of the mapping, null when invalid.
    ///
    /// The pointer is only good until the segment is released; prefer
    /// [`read`](Self::read) and [`write`](Self::write).
    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping
            .read_recursive()
            .as_ref()
            .map_or(ptr::null_mut(), |m| m.base.as_ptr())
    }

    /// Run `f` with the base address; the region stays mapped until `f`
    /// returns. Nested calls on the same segment are fine, only `release`
    /// waits for them.
    pub(crate) fn with_base<R>(&self, f: impl FnOnce(*mut u8) -> R) -> Result<R> {
        let guard = self.mapping.read_recursive();
        let mapping = guard
            .as_ref()
            .ok_or_else(|| Error::InvalidResource(self.name.clone()))?;
        Ok(f(mapping.base.as_ptr()))
    }

    /// Like [`with_base`](Self::with_base), for writes
    pub(crate) fn with_base_mut<R>(&self, f: impl FnOnce(*mut u8) -> R) -> Result<R> {
        if self.access == AccessMode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        self.with_base(f)
    }

    /// Run `f` over the mapped bytes
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let size = self.size;
        self.with_base(|base| f(unsafe { std::slice::from_raw_parts(base, size) }))
    }

    /// Run `f` over the mapped bytes, mutably.
    ///
    /// No data lock is taken: other threads and processes may write the same
    /// bytes concurrently. `f` may query this segment (`is_valid`, `as_ptr`)
    /// but must not call `read` or `write` on it again, since that would alias
    /// the mutable slice. Calling [`release`](Self::release) from inside `f`
    /// blocks forever.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let size = self.size;
        self.with_base_mut(|base| f(unsafe { std::slice::from_raw_parts_mut(base, size) }))
    }

    /// Unmap, close and, with delete-on-release, unlink.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned. Releasing an invalid segment does nothing. Waits for
    /// in-flight accesses from other holders to finish.
    pub fn release(&self) -> Result<()> {
        let Some(Mapping { fd, base }) = self.mapping.write().take() else {
            return Ok(());
        };
        let mut first_err = None;

        if let Err(source) = unsafe { munmap(base.cast(), self.size) } {
            let e = Error::Unmap {
                name: self.os_name.clone(),
                source,
            };
            warn!("{}", e);
            first_err.get_or_insert(e);
        }

        if let Err(source) = nix::unistd::close(fd.into_raw_fd()) {
            let e = Error::Close {
                name: self.os_name.clone(),
                source,
            };
            warn!("{}", e);
            first_err.get_or_insert(e);
        }

        if self.delete_on_release {
            if let Err(source) = shm_unlink(self.os_name.as_str()) {
                let e = Error::Unlink {
                    name: self.os_name.clone(),
                    source,
                };
                warn!("{}", e);
                first_err.get_or_insert(e);
            }
        }

        debug!("released segment '{}'", self.name);
        first_err.map_or(Ok(()), Err)
    }
}

impl Named for SharedSegment {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> String {
        format!("segment '{}' ({}, {} bytes)", self.name, self.os_name, self.size)
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // failures are already logged by release
        let _ = self.release();
    }
}
