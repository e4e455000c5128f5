//! POSIX named semaphores

use crate::guard::SemaphoreGuard;
use crate::name::{NameCodec, Named};
use crate::shm::DEFAULT_PERMISSIONS;
use crate::{Error, Result};
use log::{debug, error, warn};
use nix::errno::Errno;
use std::ffi::CString;
use std::ptr::NonNull;

fn c_name(os_name: &str) -> nix::Result<CString> {
    CString::new(os_name).map_err(|_| Errno::EINVAL)
}

/// Named counting semaphore shared between processes
///
/// The count never goes negative: [`wait`](Self::wait) blocks until it can
/// decrement a positive count, [`post`](Self::post) never blocks.
#[derive(Debug)]
pub struct NamedSemaphore {
    name: String,
    os_name: String,
    sem: Option<NonNull<libc::sem_t>>,
    delete_on_release: bool,
}

// Safety: sem_* calls are thread-safe on a shared sem_t
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Open or create a semaphore, logging failures and returning an
    /// invalid semaphore
    pub fn open(name: &str, initial: u32, delete_on_release: bool) -> Self {
        match Self::try_open(name, initial, delete_on_release) {
            Ok(sem) => sem,
            Err(e) => {
                error!("{}", e);
                Self {
                    name: name.to_string(),
                    os_name: NameCodec::SEM.encode(name),
                    sem: None,
                    delete_on_release,
                }
            }
        }
    }

    /// Open or create a semaphore.
    ///
    /// `initial` only applies when the semaphore is created; an existing one
    /// keeps its count.
    pub fn try_open(name: &str, initial: u32, delete_on_release: bool) -> Result<Self> {
        let os_name = NameCodec::SEM.encode(name);
        let open_err = |source| Error::ResourceOpen {
            name: os_name.clone(),
            source,
        };
        let cname = c_name(&os_name).map_err(open_err)?;

        let raw = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                DEFAULT_PERMISSIONS as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if raw == libc::SEM_FAILED {
            return Err(open_err(Errno::last()));
        }
        let sem = NonNull::new(raw).ok_or_else(|| open_err(Errno::EINVAL))?;

        debug!("opened semaphore '{}' as {}", name, os_name);

        Ok(Self {
            name: name.to_string(),
            os_name,
            sem: Some(sem),
            delete_on_release,
        })
    }

    /// Remove the semaphore for `name`, returns false if it did not exist
    pub fn unlink(name: &str) -> bool {
        let os_name = NameCodec::SEM.encode(name);
        let removed = c_name(&os_name)
            .and_then(|cname| Errno::result(unsafe { libc::sem_unlink(cname.as_ptr()) }));
        match removed {
            Ok(_) => true,
            Err(e) => {
                debug!("cannot unlink semaphore {}: {}", os_name, e);
                false
            }
        }
    }

    /// Get the encoded name passed to the OS
    pub fn os_name(&self) -> &str {
        &self.os_name
    }

    /// Check if the semaphore is open
    pub fn is_valid(&self) -> bool {
        self.sem.is_some()
    }

    pub fn is_delete_on_release(&self) -> bool {
        self.delete_on_release
    }

    fn raw(&self) -> Result<*mut libc::sem_t> {
        self.sem
            .map(NonNull::as_ptr)
            .ok_or_else(|| Error::InvalidResource(self.name.clone()))
    }

    fn op_err(&self, op: &'static str, source: Errno) -> Error {
        Error::SemaphoreOp {
            op,
            name: self.os_name.clone(),
            source,
        }
    }

    /// Block until the count is positive, then decrement it.
    ///
    /// Interrupted waits are retried; any other failure is returned.
    pub fn wait(&self) -> Result<()> {
        let sem = self.raw()?;
        loop {
            match Errno::result(unsafe { libc::sem_wait(sem) }) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(self.op_err("wait", e)),
            }
        }
    }

    /// Decrement the count if it is positive, without blocking
    pub fn try_wait(&self) -> Result<bool> {
        let sem = self.raw()?;
        loop {
            match Errno::result(unsafe { libc::sem_trywait(sem) }) {
                Ok(_) => return Ok(true),
                Err(Errno::EAGAIN) => return Ok(false),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(self.op_err("trywait", e)),
            }
        }
    }

    /// Increment the count
    pub fn post(&self) -> Result<()> {
        let sem = self.raw()?;
        Errno::result(unsafe { libc::sem_post(sem) })
            .map(drop)
            .map_err(|e| self.op_err("post", e))
    }

    /// Instantaneous count, for diagnostics
    pub fn value(&self) -> Result<i32> {
        let sem = self.raw()?;
        let mut value: libc::c_int = 0;
        Errno::result(unsafe { libc::sem_getvalue(sem, &mut value) })
            .map_err(|e| self.op_err("getvalue", e))?;
        Ok(value)
    }

    /// Wait and return a guard that posts when dropped
    pub fn lock(&self) -> Result<SemaphoreGuard<'_>> {
        self.wait()?;
        Ok(SemaphoreGuard::new(self))
    }

    pub fn try_lock(&self) -> Result<Option<SemaphoreGuard<'_>>> {
        Ok(self.try_wait()?.then(|| SemaphoreGuard::new(self)))
    }
}

impl Named for NamedSemaphore {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> String {
        format!("semaphore '{}' ({})", self.name, self.os_name)
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        let Some(sem) = self.sem.take() else {
            return;
        };
        if let Err(e) = Errno::result(unsafe { libc::sem_close(sem.as_ptr()) }) {
            warn!("{}", self.op_err("close", e));
        }
        if self.delete_on_release && !Self::unlink(&self.name) {
            warn!("cannot unlink semaphore {}", self.os_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::unique_name;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_post_value() {
        let name = unique_name("lk");
        let lk = NamedSemaphore::open(&name, 2, true);
        assert!(lk.is_valid());
        assert_eq!(lk.name(), name);
        assert_eq!(lk.os_name(), format!("/lsmll-{}", name));
        assert_eq!(lk.value().unwrap(), 2);
        lk.wait().unwrap();
        assert_eq!(lk.value().unwrap(), 1);
        lk.post().unwrap();
        assert_eq!(lk.value().unwrap(), 2);
    }

    #[test]
    fn test_unlink() {
        let name = unique_name("lk_unlink");
        assert!(!NamedSemaphore::unlink(&name));
        {
            let _lk = NamedSemaphore::open(&name, 1, false);
        }
        assert!(NamedSemaphore::unlink(&name));
        assert!(!NamedSemaphore::unlink(&name));
    }

    #[test]
    fn test_delete_on_release() {
        let name = unique_name("lk_auto");
        drop(NamedSemaphore::open(&name, 1, true));
        assert!(!NamedSemaphore::unlink(&name));
    }

    #[test]
    fn test_existing_keeps_count() {
        let name = unique_name("lk_keep");
        let first = NamedSemaphore::open(&name, 3, true);
        let second = NamedSemaphore::open(&name, 7, false);
        assert_eq!(second.value().unwrap(), 3);
        second.wait().unwrap();
        assert_eq!(first.value().unwrap(), 2);
    }

    #[test]
    fn test_try_wait_on_zero() {
        let name = unique_name("lk_try");
        let lk = NamedSemaphore::open(&name, 0, true);
        assert!(!lk.try_wait().unwrap());
        lk.post().unwrap();
        assert!(lk.try_wait().unwrap());
        assert_eq!(lk.value().unwrap(), 0);
    }

    #[test]
    fn test_lock_guard_posts_on_drop() {
        let name = unique_name("lk_guard");
        let lk = NamedSemaphore::open(&name, 1, true);
        {
            let _guard = lk.lock().unwrap();
            assert_eq!(lk.value().unwrap(), 0);
            assert!(lk.try_lock().unwrap().is_none());
        }
        assert_eq!(lk.value().unwrap(), 1);
    }

    #[test]
    fn test_wait_blocks_until_post() {
        let name = unique_name("lk_block");
        let lk = Arc::new(NamedSemaphore::open(&name, 0, true));
        let poster = {
            let lk = Arc::clone(&lk);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                lk.post().unwrap();
            })
        };
        lk.wait().unwrap();
        poster.join().unwrap();
        assert_eq!(lk.value().unwrap(), 0);
    }

    #[test]
    fn test_invalid_semaphore() {
        let lk = NamedSemaphore::open("bad\0name", 1, false);
        assert!(!lk.is_valid());
        assert!(matches!(lk.wait(), Err(Error::InvalidResource(_))));
        assert!(matches!(lk.post(), Err(Error::InvalidResource(_))));
        assert!(matches!(lk.value(), Err(Error::InvalidResource(_))));
    }
}
