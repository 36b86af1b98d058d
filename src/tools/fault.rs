//! Named fault injection points for tests.
//!
//! A test arms a point by name; the code path carrying the matching
//! [`fault_point!`] invocation then fails with a synthetic error. In
//! builds without the `fault-injection` feature (and outside unit
//! tests) the whole mechanism compiles down to nothing.

#[cfg(any(test, feature = "fault-injection"))]
mod table {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use once_cell::sync::Lazy;

    static ARMED: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

    pub fn arm(name: &str) {
        ARMED.lock().unwrap().insert(name.to_string());
    }

    pub fn disarm(name: &str) {
        ARMED.lock().unwrap().remove(name);
    }

    pub fn triggered(name: &str) -> bool {
        ARMED.lock().unwrap().contains(name)
    }
}

#[cfg(any(test, feature = "fault-injection"))]
pub use table::{arm, disarm, triggered};

#[cfg(not(any(test, feature = "fault-injection")))]
#[inline(always)]
pub fn triggered(_name: &str) -> bool {
    false
}

/// Fail with a `Format` error if the named injection point is armed.
#[macro_export]
macro_rules! fault_point {
    ($name:expr) => {
        if $crate::tools::fault::triggered($name) {
            return Err($crate::error::Error::format(format!(
                "fault injected at {}",
                $name
            )));
        }
    };
}
