//! OS resource naming

use log::warn;

/// Prefix for shared memory object names, must start with '/'
pub const SHM_NAME_PREFIX: &str = "/libshmlite-";
/// Longest shared memory object name accepted by the kernel (NAME_MAX)
pub const SHM_NAME_MAX: usize = 255;
/// Prefix for named semaphore names, must start with '/'
pub const SEM_NAME_PREFIX: &str = "/lsmll-";
/// glibc stores semaphores as "sem.<name>" under /dev/shm, leaving 251 bytes
pub const SEM_NAME_MAX: usize = 251;

/// Concatenate `prefix` and `suffix`, truncated to at most `max_len` bytes.
///
/// Truncation never splits a UTF-8 character, so the result may be a few
/// bytes shorter than `max_len` when the cut falls inside one.
pub fn concat_limited(prefix: &str, suffix: &str, max_len: usize) -> String {
    let mut res = String::with_capacity(prefix.len() + suffix.len());
    res.push_str(prefix);
    res.push_str(suffix);
    if res.len() > max_len {
        let mut end = max_len;
        while !res.is_char_boundary(end) {
            end -= 1;
        }
        res.truncate(end);
    }
    res
}

/// Derives OS-visible names from logical names.
///
/// Two logical names that share a long common prefix can map onto the same
/// OS name after truncation. No disambiguation is attempted; a warning is
/// logged whenever a name gets cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameCodec {
    prefix: &'static str,
    max_len: usize,
}

impl NameCodec {
    /// Codec for shared memory segments
    pub const SHM: NameCodec = NameCodec::new(SHM_NAME_PREFIX, SHM_NAME_MAX);
    /// Codec for named semaphores
    pub const SEM: NameCodec = NameCodec::new(SEM_NAME_PREFIX, SEM_NAME_MAX);

    pub const fn new(prefix: &'static str, max_len: usize) -> Self {
        Self { prefix, max_len }
    }

    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Map a logical name to its OS name
    pub fn encode(&self, name: &str) -> String {
        let os_name = concat_limited(self.prefix, name, self.max_len);
        if os_name.len() < self.prefix.len() + name.len() {
            warn!(
                "name '{}' truncated to '{}' ({} byte limit)",
                name, os_name, self.max_len
            );
        }
        os_name
    }
}

/// Anything identified by a logical name
pub trait Named {
    fn name(&self) -> &str;

    /// Short human readable description used in diagnostics
    fn describe(&self) -> String {
        format!("'{}'", self.name())
    }
}
