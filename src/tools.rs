//! Small helpers shared across the crate.

use std::sync::atomic::{AtomicU32, Ordering};

pub mod fault;

mod format;
pub use format::*;

static NEXT_THREAD_ORD: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static THREAD_ORD: u32 = NEXT_THREAD_ORD.fetch_add(1, Ordering::Relaxed);
    static SCRATCH_SEQ: std::cell::Cell<u32> = std::cell::Cell::new(0);
}

/// Small, process-unique ordinal of the calling thread.
pub fn thread_ord() -> u32 {
    THREAD_ORD.with(|v| *v)
}

/// Build a scratch file name unique across processes, threads and
/// repeated calls: `<prefix><pid>_<thread>_<seq>-<suffix>`.
pub fn scratch_file_name(prefix: &str, suffix: &str) -> String {
    let seq = SCRATCH_SEQ.with(|c| {
        let v = c.get();
        c.set(v.wrapping_add(1));
        v
    });
    format!(
        "{}{:x}_{:x}_{:x}-{}",
        prefix,
        std::process::id(),
        thread_ord(),
        seq,
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_names_differ_per_call() {
        let a = scratch_file_name("bak", "log");
        let b = scratch_file_name("bak", "log");
        assert_ne!(a, b);
        assert!(a.starts_with("bak"));
        assert!(a.ends_with("-log"));
    }
}
