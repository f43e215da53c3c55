//! A small rendezvous primitive for "the last one out closes the door".
//!
//! Each channel runs two listeners. Either may finish first, and both race to tear the channel
//! down, but the sockets must only be closed once neither listener can still be reading from
//! them. A [`Countdown`] created with two permits makes that explicit: each listener calls
//! [`Countdown::arrive`] exactly once when it exits, and only the caller that takes the count
//! to zero gets `true` back.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub(crate) struct Countdown {
    remaining: AtomicUsize,
}

impl Countdown {
    pub(crate) const fn new(permits: usize) -> Countdown {
        Countdown {
            remaining: AtomicUsize::new(permits),
        }
    }

    /// Gives back one permit.
    ///
    /// Returns `true` for exactly one caller: the one whose arrival released the last permit.
    /// Arrivals after that return `false` and leave the count at zero.
    pub(crate) fn arrive(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                remaining.checked_sub(1)
            })
            .map(|previous| previous == 1)
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    #[test]
    fn releases_on_last_arrival() {
        let countdown = Countdown::new(2);
        assert!(!countdown.arrive());
        assert_eq!(countdown.remaining(), 1);
        assert!(countdown.arrive());
        assert_eq!(countdown.remaining(), 0);
        assert!(!countdown.arrive());
        assert_eq!(countdown.remaining(), 0);
    }

    #[test]
    fn exactly_one_releaser_under_contention() {
        for _ in 0..200 {
            let countdown = Arc::new(Countdown::new(2));
            let released = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let countdown = countdown.clone();
                    let released = released.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        if countdown.arrive() {
                            released.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(released.load(Ordering::SeqCst), 1);
        }
    }
}
