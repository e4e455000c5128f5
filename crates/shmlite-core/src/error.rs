//! Error types for shmlite

use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot open '{name}': {source}")]
    ResourceOpen {
        name: String,
        #[source]
        source: Errno,
    },

    #[error("cannot size '{name}' to {size} bytes: {source}")]
    ResourceSize {
        name: String,
        size: usize,
        #[source]
        source: Errno,
    },

    #[error("cannot mmap '{name}' ({size} bytes): {source}")]
    Map {
        name: String,
        size: usize,
        #[source]
        source: Errno,
    },

    #[error("cannot munmap '{name}': {source}")]
    Unmap {
        name: String,
        #[source]
        source: Errno,
    },

    #[error("cannot close '{name}': {source}")]
    Close {
        name: String,
        #[source]
        source: Errno,
    },

    #[error("cannot unlink '{name}': {source}")]
    Unlink {
        name: String,
        #[source]
        source: Errno,
    },

    #[error("index {index} is out of range (size = {size})")]
    OutOfRange { index: usize, size: usize },

    #[error("'{0}' is not mapped")]
    InvalidResource(String),

    #[error("view needs {required} bytes but the segment has {available}")]
    InsufficientSpace { required: usize, available: usize },

    #[error("access denied: segment is read-only")]
    ReadOnly,

    #[error("semaphore {op} on '{name}' failed: {source}")]
    SemaphoreOp {
        op: &'static str,
        name: String,
        #[source]
        source: Errno,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
