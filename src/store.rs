//! The session storage the relay reports to.
//!
//! Persisting messages is an observer's job. The registry itself only needs two things from a
//! session: the highest channel id already used, so ids keep increasing across a session reload,
//! and a place to keep the ignore list.

use std::sync::Mutex;

pub trait SessionStore: Send + Sync {
    /// The highest channel id stored in this session, if any.
    fn highest_channel_id(&self) -> Option<u64>;

    /// Stores the raw ignore-list patterns.
    fn persist_ignore_list(&self, patterns: &[String]);
}

/// A session kept in memory.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    highest_channel_id: Option<u64>,
    ignore_list: Mutex<Vec<String>>,
}

impl MemorySessionStore {
    pub fn new() -> MemorySessionStore {
        MemorySessionStore::default()
    }

    /// A session that already used channel ids up to `highest`.
    pub fn resumed(highest: u64) -> MemorySessionStore {
        MemorySessionStore {
            highest_channel_id: Some(highest),
            ..MemorySessionStore::default()
        }
    }

    pub fn ignore_list(&self) -> Vec<String> {
        self.ignore_list
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl SessionStore for MemorySessionStore {
    fn highest_channel_id(&self) -> Option<u64> {
        self.highest_channel_id
    }

    fn persist_ignore_list(&self, patterns: &[String]) {
        *self
            .ignore_list
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = patterns.to_vec();
    }
}
