//! Helpers shared by unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Name no other test (or test run) uses
pub(crate) fn unique_name(tag: &str) -> String {
    let _ = env_logger::builder().is_test(true).try_init();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_{}_{}_{}_{}", tag, std::process::id(), ts, n)
}
