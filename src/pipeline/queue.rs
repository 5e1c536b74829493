//! Queue and thread helpers

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Result of a drop-oldest push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Sent,
    /// The queue was full and its oldest item was discarded
    DroppedOldest,
    Disconnected,
}

/// Push without blocking; a full queue loses its oldest item instead.
///
/// `rx` must be a receiver of the same channel as `tx`.
pub fn push_drop_oldest<T>(tx: &Sender<T>, rx: &Receiver<T>, item: T) -> PushOutcome {
    let mut item = item;
    let mut dropped = false;
    loop {
        match tx.try_send(item) {
            Ok(()) => {
                return if dropped {
                    PushOutcome::DroppedOldest
                } else {
                    PushOutcome::Sent
                };
            }
            Err(TrySendError::Full(back)) => {
                item = back;
                if rx.try_recv().is_ok() {
                    dropped = true;
                }
            }
            Err(TrySendError::Disconnected(_)) => return PushOutcome::Disconnected,
        }
    }
}

/// Discard everything currently queued, returning the count
pub fn drain<T>(rx: &Receiver<T>) -> usize {
    rx.try_iter().count()
}

/// Join `handle` if it finishes within `timeout`.
///
/// A thread still running at the deadline is detached. Returns true when the
/// thread was joined.
pub fn join_with_timeout(handle: JoinHandle<()>, name: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("{} thread did not stop within {:?}, detaching", name, timeout);
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    if handle.join().is_err() {
        error!("{} thread panicked", name);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let (tx, rx) = bounded(2);
        assert_eq!(push_drop_oldest(&tx, &rx, 1), PushOutcome::Sent);
        assert_eq!(push_drop_oldest(&tx, &rx, 2), PushOutcome::Sent);
        assert_eq!(push_drop_oldest(&tx, &rx, 3), PushOutcome::DroppedOldest);
        assert_eq!(push_drop_oldest(&tx, &rx, 4), PushOutcome::DroppedOldest);

        let items: Vec<i32> = rx.try_iter().collect();
        assert_eq!(items, vec![3, 4]);
    }

    #[test]
    fn test_drop_oldest_disconnected() {
        let (tx, rx) = bounded::<i32>(1);
        let other_rx = rx.clone();
        drop(rx);
        drop(other_rx);
        let (_, unrelated_rx) = bounded::<i32>(1);
        assert_eq!(push_drop_oldest(&tx, &unrelated_rx, 1), PushOutcome::Disconnected);
    }

    #[test]
    fn test_drain_counts() {
        let (tx, rx) = bounded(5);
        for i in 0..3 {
            tx.send(i).unwrap();
        }
        assert_eq!(drain(&rx), 3);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_join_finished_thread() {
        let handle = std::thread::spawn(|| {});
        assert!(join_with_timeout(handle, "quick", Duration::from_secs(1)));
    }

    #[test]
    fn test_stuck_thread_is_detached() {
        let handle = std::thread::spawn(|| std::thread::sleep(Duration::from_millis(500)));
        let started = Instant::now();
        assert!(!join_with_timeout(handle, "slow", Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_millis(400));
    }
}
