//! A cheap monotonic timestamp.
//!
//! The loop stamps every batch of readiness events once and passes the stamp
//! to the read callbacks, so user code gets a receive time without everyone
//! calling into the clock on their own. Monotonic on purpose: the stamp is
//! for ordering and latency measurements, not for wall-clock display.

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// A monotonic timestamp with microsecond resolution.
///
/// Measured from the first use inside the process. Copyable, comparable and
/// printable; that's all it needs to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    micros: u64,
}

impl Timestamp {
    /// The current time.
    pub fn now() -> Timestamp {
        Timestamp {
            micros: anchor().elapsed().as_micros() as u64,
        }
    }

    /// Microseconds since the process-local epoch.
    pub fn micros(&self) -> u64 {
        self.micros
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:06}", self.micros / 1_000_000, self.micros % 1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a <= b);
    }

    #[test]
    fn printable() {
        let t = Timestamp { micros: 1_000_042 };
        assert_eq!("1.000042", format!("{}", t));
    }
}
