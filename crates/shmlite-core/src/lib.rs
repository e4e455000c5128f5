//! shmlite - Named shared memory primitives for processes on one host
//!
//! - [`SharedSegment`]: one mapped POSIX shared memory object
//! - [`SharedArray`]: fixed-length typed array with a count header
//! - [`ScalarPool`]: per-process cache of named shared scalars
//! - [`NamedSemaphore`]: cross-process counting semaphore
//!
//! None of the memory types lock across processes. Wrap multi-step updates
//! in a [`NamedSemaphore`] agreed on by every participant.

pub mod array;
pub mod error;
pub mod flags;
pub mod guard;
pub mod name;
pub mod pool;
pub mod sem;
pub mod shm;

#[cfg(test)]
mod testutil;

pub use array::{SharedArray, HEADER_LEN};
pub use error::{Error, Result};
pub use flags::{AccessMode, InitPolicy, OpenFlags};
pub use guard::SemaphoreGuard;
pub use name::{concat_limited, NameCodec, Named};
pub use pool::{Scalar, ScalarPool};
pub use sem::NamedSemaphore;
pub use shm::{SegmentOptions, SharedSegment};
