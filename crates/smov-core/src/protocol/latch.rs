//! Fault latch shared between the link thread and the public handles

use std::sync::{Mutex, PoisonError};

use super::ErrorKind;

/// Most recent error reported for a connection.
///
/// Starts at [`ErrorKind::Ok`]. Any later report overwrites the previous one,
/// except that `Ok` is never written back: once a failure is latched it stays.
#[derive(Debug, Default)]
pub(crate) struct FaultLatch {
    state: Mutex<ErrorKind>,
}

impl FaultLatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a report. Returns `true` when it changed the latched value.
    pub(crate) fn record(&self, kind: ErrorKind) -> bool {
        if kind.is_ok() {
            return false;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = *state != kind;
        *state = kind;
        changed
    }

    /// Latest latched value
    pub(crate) fn get(&self) -> ErrorKind {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_starts_ok() {
        assert_eq!(FaultLatch::new().get(), ErrorKind::Ok);
    }

    #[test]
    fn test_last_write_wins() {
        let latch = FaultLatch::new();
        assert!(latch.record(ErrorKind::DeviceFault(1)));
        assert!(latch.record(ErrorKind::DeviceFault(2)));
        assert!(!latch.record(ErrorKind::DeviceFault(2)));
        assert_eq!(latch.get(), ErrorKind::DeviceFault(2));

        latch.record(ErrorKind::CommunicationFailure(libc::EIO));
        assert_eq!(latch.get(), ErrorKind::CommunicationFailure(libc::EIO));
    }

    #[test]
    fn test_never_reverts_to_ok() {
        let latch = FaultLatch::new();
        latch.record(ErrorKind::DeviceFault(9));
        assert!(!latch.record(ErrorKind::Ok));
        assert_eq!(latch.get(), ErrorKind::DeviceFault(9));
    }

    #[test]
    fn test_concurrent_writers() {
        let latch = Arc::new(FaultLatch::new());
        let workers: Vec<_> = (0..4u16)
            .map(|i| {
                let latch = latch.clone();
                thread::spawn(move || {
                    for n in 0..100 {
                        latch.record(ErrorKind::DeviceFault(i * 100 + n));
                        assert!(!latch.get().is_ok());
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert!(matches!(latch.get(), ErrorKind::DeviceFault(_)));
    }
}
