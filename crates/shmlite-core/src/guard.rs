//! RAII semaphore guard

use crate::name::Named;
use crate::sem::NamedSemaphore;
use log::warn;

/// Holds one unit of a [`NamedSemaphore`] and posts it back on drop
#[must_use = "the semaphore is posted as soon as the guard is dropped"]
pub struct SemaphoreGuard<'a> {
    sem: &'a NamedSemaphore,
    /// Whether this guard owns the post responsibility
    should_release: bool,
}

impl<'a> SemaphoreGuard<'a> {
    pub(crate) fn new(sem: &'a NamedSemaphore) -> Self {
        Self {
            sem,
            should_release: true,
        }
    }

    pub fn semaphore(&self) -> &NamedSemaphore {
        self.sem
    }

    /// Drop the guard without posting.
    /// Used when another process is expected to post.
    pub fn forget(mut self) {
        self.should_release = false;
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if self.should_release {
            if let Err(e) = self.sem.post() {
                warn!("cannot release {}: {}", self.sem.describe(), e);
            }
        }
    }
}
