//! Observers: the one way to see the traffic.
//!
//! Storage, breakpoints, fuzzers and traffic views all implement [`Observer`] and register with
//! the [`ChannelRegistry`](crate::registry::ChannelRegistry). The relay notifies them
//! synchronously, in ascending [`Observer::observing_order`], on every frame and every channel
//! state change.
//!
//! # Notification is blocking
//!
//! [`Observer::on_message_frame`] runs on the listener thread for that direction, before the
//! frame is forwarded. While it runs, nothing else moves in that direction. This is the
//! mechanism breakpoints use to hold a message indefinitely, so implementations that only want
//! to watch should return quickly, and nothing here should be made fire-and-forget.
//!
//! Returning `false` drops the frame. An observer may also rewrite the frame through
//! [`Message::replace_frame_payload`] before returning `true`.
//!
//! # Failure isolation
//!
//! A panicking observer is caught and logged. The remaining observers are still notified and,
//! for frames, the panic counts as "keep forwarding".

use crate::channel::{ChannelInfo, ChannelState};
use crate::message::Message;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

pub trait Observer: Send + Sync {
    /// Position in the notification order. Lower goes first; ties keep registration order.
    fn observing_order(&self) -> i32;

    /// Called for every frame of every message on channels that are not forward-only.
    ///
    /// `message` may be unfinished. Return `false` to stop notifying later observers and drop
    /// the frame.
    fn on_message_frame(&self, channel_id: u64, message: &mut Message) -> bool;

    /// Called on every channel state change, including on forward-only channels.
    fn on_state_change(&self, state: ChannelState, channel: &ChannelInfo);
}

#[derive(Clone)]
struct Entry {
    order: i32,
    observer: Arc<dyn Observer>,
}

/// The ordered observer list shared by every channel.
///
/// Registration copies the list; notification works from a snapshot taken under a brief lock,
/// so a slow observer never blocks registration and registration never blocks a notification
/// that is already underway.
#[derive(Default)]
pub struct ObserverRegistry {
    entries: Mutex<Arc<Vec<Entry>>>,
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.len())
            .finish()
    }
}

fn same_observer(a: &Arc<dyn Observer>, b: &Arc<dyn Observer>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl ObserverRegistry {
    pub fn new() -> ObserverRegistry {
        ObserverRegistry::default()
    }

    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        let order = observer.observing_order();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut updated = Vec::clone(&entries);
        let at = updated.partition_point(|entry| entry.order <= order);
        updated.insert(at, Entry { order, observer });
        *entries = Arc::new(updated);
    }

    /// Removes `observer`, compared by identity. Returns whether it was registered.
    pub fn remove_observer(&self, observer: &Arc<dyn Observer>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(at) = entries.iter().position(|entry| same_observer(&entry.observer, observer)) else {
            return false;
        };
        let mut updated = Vec::clone(&entries);
        updated.remove(at);
        *entries = Arc::new(updated);
        true
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<Vec<Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Notifies observers of a frame, in order.
    ///
    /// Returns `false` as soon as one observer asks to drop the frame; later observers are not
    /// called in that case.
    pub fn notify_frame(&self, channel_id: u64, message: &mut Message) -> bool {
        for entry in self.snapshot().iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                entry.observer.on_message_frame(channel_id, message)
            }));
            match outcome {
                Ok(true) => {}
                Ok(false) => return false,
                Err(_) => {
                    logwise::error_sync!(
                        "Observer (order {order}) panicked handling message {message} on channel {channel}",
                        order = entry.order,
                        message = message.message_id(),
                        channel = channel_id
                    );
                }
            }
        }
        true
    }

    /// Notifies every observer of a state change. Panics are logged and skipped.
    pub fn notify_state_change(&self, state: ChannelState, channel: &ChannelInfo) {
        for entry in self.snapshot().iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                entry.observer.on_state_change(state, channel)
            }));
            if outcome.is_err() {
                logwise::error_sync!(
                    "Observer (order {order}) panicked handling {state} on channel {channel}",
                    order = entry.order,
                    state = logwise::privacy::LogIt(&state),
                    channel = channel.id
                );
            }
        }
    }
}

/// An observer that logs finished messages and state changes, and never interferes.
#[derive(Debug, Clone, Copy)]
pub struct LoggingObserver {
    order: i32,
}

impl LoggingObserver {
    /// Observers that may drop or rewrite frames should sort before this one, so it logs what
    /// is actually forwarded.
    pub const DEFAULT_ORDER: i32 = i32::MAX;

    pub fn new(order: i32) -> LoggingObserver {
        LoggingObserver { order }
    }
}

impl Default for LoggingObserver {
    fn default() -> Self {
        LoggingObserver::new(LoggingObserver::DEFAULT_ORDER)
    }
}

impl Observer for LoggingObserver {
    fn observing_order(&self) -> i32 {
        self.order
    }

    fn on_message_frame(&self, channel_id: u64, message: &mut Message) -> bool {
        if message.is_finished() {
            logwise::info_sync!(
                "channel {channel} message {message} {direction} {opcode} ({length} bytes): {payload}",
                channel = channel_id,
                message = message.message_id(),
                direction = logwise::privacy::LogIt(&message.direction()),
                opcode = logwise::privacy::LogIt(&message.opcode()),
                length = message.payload_len(),
                payload = logwise::privacy::LogIt(&message.readable_payload())
            );
        }
        true
    }

    fn on_state_change(&self, state: ChannelState, channel: &ChannelInfo) {
        logwise::info_sync!(
            "channel {channel} {url} is now {state}",
            channel = channel.id,
            url = logwise::privacy::LogIt(&channel.url),
            state = logwise::privacy::LogIt(&state)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, Opcode};
    use crate::message::Direction;

    struct Recorder {
        order: i32,
        name: &'static str,
        verdict: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Observer for Recorder {
        fn observing_order(&self) -> i32 {
            self.order
        }

        fn on_message_frame(&self, _channel_id: u64, _message: &mut Message) -> bool {
            self.log.lock().unwrap().push(self.name);
            self.verdict
        }

        fn on_state_change(&self, _state: ChannelState, _channel: &ChannelInfo) {
            self.log.lock().unwrap().push(self.name);
        }
    }

    struct Panicker;

    impl Observer for Panicker {
        fn observing_order(&self) -> i32 {
            0
        }

        fn on_message_frame(&self, _channel_id: u64, _message: &mut Message) -> bool {
            panic!("observer bug");
        }

        fn on_state_change(&self, _state: ChannelState, _channel: &ChannelInfo) {
            panic!("observer bug");
        }
    }

    fn recorder(order: i32, name: &'static str, verdict: bool, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<dyn Observer> {
        Arc::new(Recorder {
            order,
            name,
            verdict,
            log: log.clone(),
        })
    }

    fn message() -> Message {
        Message::start(1, 1, Direction::Outgoing, Frame::encode(true, 0, Opcode::Text, None, b"x"))
    }

    fn info() -> ChannelInfo {
        ChannelInfo {
            id: 1,
            host: "example.com".to_owned(),
            port: 80,
            url: "ws://example.com/".to_owned(),
            start_timestamp: None,
            end_timestamp: None,
            handshake_ref: None,
            state: ChannelState::Open,
            forward_only: false,
        }
    }

    #[test]
    fn notifies_in_order_stable_for_ties() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ObserverRegistry::new();
        registry.add_observer(recorder(5, "late", true, &log));
        registry.add_observer(recorder(-1, "early", true, &log));
        registry.add_observer(recorder(5, "late-second", true, &log));
        registry.add_observer(recorder(0, "middle", true, &log));
        assert!(registry.notify_frame(1, &mut message()));
        assert_eq!(*log.lock().unwrap(), vec!["early", "middle", "late", "late-second"]);
    }

    #[test]
    fn veto_stops_iteration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ObserverRegistry::new();
        registry.add_observer(recorder(0, "first", true, &log));
        registry.add_observer(recorder(1, "breakpoint", false, &log));
        registry.add_observer(recorder(2, "storage", true, &log));
        assert!(!registry.notify_frame(1, &mut message()));
        assert_eq!(*log.lock().unwrap(), vec!["first", "breakpoint"]);

        log.lock().unwrap().clear();
        registry.notify_state_change(ChannelState::Closed, &info());
        assert_eq!(*log.lock().unwrap(), vec!["first", "breakpoint", "storage"]);
    }

    #[test]
    fn panics_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ObserverRegistry::new();
        registry.add_observer(Arc::new(Panicker));
        registry.add_observer(recorder(1, "after", true, &log));
        assert!(registry.notify_frame(1, &mut message()));
        registry.notify_state_change(ChannelState::Open, &info());
        assert_eq!(*log.lock().unwrap(), vec!["after", "after"]);
    }

    #[test]
    fn remove_by_identity() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ObserverRegistry::new();
        let a = recorder(0, "a", true, &log);
        let b = recorder(0, "b", true, &log);
        registry.add_observer(a.clone());
        registry.add_observer(b.clone());
        assert!(registry.remove_observer(&a));
        assert!(!registry.remove_observer(&a));
        assert_eq!(registry.len(), 1);
        registry.notify_frame(1, &mut message());
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
    }
}
