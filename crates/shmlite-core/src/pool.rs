//! Named shared scalars

use crate::flags::OpenFlags;
use crate::name::Named;
use crate::shm::{SegmentOptions, SharedSegment};
use crate::{Error, Result};
use bytemuck::Pod;
use log::{debug, trace};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr;
use std::sync::Arc;

static GLOBAL: Lazy<ScalarPool> = Lazy::new(ScalarPool::new);

/// Typed view of a scalar at the start of a shared segment
///
/// Any `T` whose size fits the segment may be used, regardless of the type
/// the segment was created for; the bytes are simply reinterpreted.
#[derive(Debug)]
pub struct Scalar<T> {
    segment: Arc<SharedSegment>,
    _marker: PhantomData<T>,
}

impl<T: Pod> Scalar<T> {
    fn new(segment: Arc<SharedSegment>) -> Result<Self> {
        if size_of::<T>() > segment.size() {
            return Err(Error::InsufficientSpace {
                required: size_of::<T>(),
                available: segment.size(),
            });
        }
        Ok(Self {
            segment,
            _marker: PhantomData,
        })
    }

    /// Read the current value
    pub fn load(&self) -> Result<T> {
        self.segment
            .with_base(|base| unsafe { ptr::read_unaligned(base.cast::<T>()) })
    }

    /// Overwrite the value
    pub fn store(&self, value: T) -> Result<()> {
        self.segment
            .with_base_mut(|base| unsafe { ptr::write_unaligned(base.cast::<T>(), value) })
    }

    /// Load, apply `f`, store the result.
    ///
    /// Not atomic: a store from another view between the load and the store
    /// is lost. `f` may read or write any scalar, including this one. Pair
    /// with a [`NamedSemaphore`](crate::NamedSemaphore) for exclusive updates.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut value = self.load()?;
        let r = f(&mut value);
        self.store(value)?;
        Ok(r)
    }

    /// Raw address of the scalar, null once the segment is released
    pub fn as_ptr(&self) -> *mut T {
        self.segment.as_ptr().cast()
    }

    /// Check if the backing segment is still mapped
    pub fn is_valid(&self) -> bool {
        self.segment.is_valid()
    }

    /// Get the shared backing segment
    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }
}

impl<T> Named for Scalar<T> {
    fn name(&self) -> &str {
        self.segment.name()
    }
}

/// Name to segment cache for shared scalars
///
/// The first lookup of a name opens its segment; later lookups are served
/// from the cache without touching the OS, even if the object has since
/// been unlinked. Entries are never evicted.
#[derive(Debug, Default)]
pub struct ScalarPool {
    entries: Mutex<HashMap<String, Arc<SharedSegment>>>,
}

impl ScalarPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide pool
    pub fn global() -> &'static ScalarPool {
        &GLOBAL
    }

    /// Get the scalar `name`, creating a zero-filled segment on first use
    pub fn get<T: Pod>(&self, name: &str) -> Result<Scalar<T>> {
        self.lookup(name, || {
            SharedSegment::try_open(name, size_of::<T>(), OpenFlags::CREATE_READ_WRITE, false)
        })
    }

    /// Get the scalar `name`, writing `default` into it on first use.
    ///
    /// The first use in this process overwrites whatever the segment held,
    /// even if another process already set it. Later calls return the cached
    /// scalar and ignore `default`.
    pub fn get_or_init<T: Pod>(&self, name: &str, default: T) -> Result<Scalar<T>> {
        self.lookup(name, || {
            SegmentOptions::new(name, size_of::<T>())
                .initial_value(bytemuck::bytes_of(&default))
                .try_open()
        })
    }

    fn lookup<T: Pod>(
        &self,
        name: &str,
        open: impl FnOnce() -> Result<SharedSegment>,
    ) -> Result<Scalar<T>> {
        let mut entries = self.entries.lock();
        if let Some(segment) = entries.get(name) {
            trace!("scalar '{}' cache hit", name);
            return Scalar::new(Arc::clone(segment));
        }

        let segment = Arc::new(open()?);
        debug!("scalar '{}' registered ({} bytes)", name, segment.size());
        entries.insert(name.to_string(), Arc::clone(&segment));
        Scalar::new(segment)
    }

    /// Check if `name` has been opened through this pool
    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    /// Number of cached scalars
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if no scalar has been cached yet
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
