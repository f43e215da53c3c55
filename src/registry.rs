//! The process-wide table of live channels.
//!
//! The [`ChannelRegistry`] is the relay's front door. The handshake component hands it each
//! upgraded connection through [`ChannelRegistry::add_channel`]; observers register with it;
//! and it owns the ignore list that decides which channels are forward-only.
//!
//! ```no_run
//! use interpose::config::RelayConfig;
//! use interpose::handshake::HandshakeRecord;
//! use interpose::observer::LoggingObserver;
//! use interpose::registry::ChannelRegistry;
//! use interpose::store::MemorySessionStore;
//! use std::net::TcpStream;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ChannelRegistry::new(RelayConfig::default(), Arc::new(MemorySessionStore::new()))?;
//! registry.add_observer(Arc::new(LoggingObserver::default()));
//! registry.set_ignore_list(vec![r".*\.example\.com/ws".to_string()])?;
//!
//! # let (local, remote) = (TcpStream::connect("127.0.0.1:1")?, TcpStream::connect("127.0.0.1:2")?);
//! let handshake = HandshakeRecord::new("ws://chat.example.org/ws", "chat.example.org", 80);
//! handshake.reference.mark_stored(1);
//! let channel = registry.add_channel(&handshake, local, remote, Vec::new())?;
//! assert!(channel.is_connected());
//! # Ok(())
//! # }
//! ```

use crate::channel::{self, Channel, ChannelInfo};
use crate::config::RelayConfig;
use crate::handshake::{HandshakeRecord, HandshakeRef};
use crate::observer::{Observer, ObserverRegistry};
use crate::pool::WorkerPool;
use crate::store::SessionStore;
use regex::Regex;
use std::collections::BTreeMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("channel error: {0}")]
    Channel(#[from] channel::Error),
    #[error("invalid ignore pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("handshake for {url} was not stored within {waited_ms} ms")]
    HandshakeNotStored { url: String, waited_ms: u64 },
}

/// URL patterns for channels that are relayed but not observed.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    patterns: Vec<String>,
    compiled: Vec<Regex>,
    forward_all: bool,
}

impl IgnoreList {
    /// Compiles every pattern to match whole URLs only. Fails on the first bad pattern.
    pub fn compile(patterns: &[String]) -> Result<IgnoreList, Error> {
        let compiled = patterns
            .iter()
            .map(|pattern| {
                let invalid = |source: regex::Error| Error::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                };
                // checked on its own first so wrapping can't change what it means
                Regex::new(pattern).map_err(invalid)?;
                Regex::new(&format!(r"\A(?:{pattern})\z")).map_err(invalid)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(IgnoreList {
            patterns: patterns.to_vec(),
            compiled,
            forward_all: false,
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn forward_all(&self) -> bool {
        self.forward_all
    }

    /// Whether a channel with this URL is forward-only.
    pub fn matches(&self, url: &str) -> bool {
        self.forward_all || self.compiled.iter().any(|re| re.is_match(url))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ChannelRegistry {
    config: RelayConfig,
    next_channel_id: AtomicU64,
    channels: Mutex<BTreeMap<u64, Arc<Channel>>>,
    ignore: RwLock<IgnoreList>,
    observers: Arc<ObserverRegistry>,
    pool: WorkerPool,
    store: Arc<dyn SessionStore>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &lock(&self.channels).len())
            .field("next_channel_id", &self.next_channel_id)
            .field("observers", &self.observers)
            .field("pool", &self.pool)
            .finish()
    }
}

impl ChannelRegistry {
    /// Fails if one of `config.ignore_patterns` does not compile.
    pub fn new(config: RelayConfig, store: Arc<dyn SessionStore>) -> Result<ChannelRegistry, Error> {
        let mut ignore = IgnoreList::compile(&config.ignore_patterns)?;
        ignore.forward_all = config.forward_all;
        let first_id = store
            .highest_channel_id()
            .map_or(1, |highest| highest.saturating_add(1));
        Ok(ChannelRegistry {
            config,
            next_channel_id: AtomicU64::new(first_id),
            channels: Mutex::new(BTreeMap::new()),
            ignore: RwLock::new(ignore),
            observers: Arc::new(ObserverRegistry::new()),
            pool: WorkerPool::new(),
            store,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.observers
    }

    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.add_observer(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn Observer>) -> bool {
        self.observers.remove_observer(observer)
    }

    /// Takes over an upgraded connection and starts relaying it.
    ///
    /// Blocks until `handshake.reference` is marked stored, polling at the configured interval.
    /// An unsupported version fails before either socket is touched; the sockets are dropped,
    /// which closes them.
    ///
    /// `prefetched` are bytes already read from `remote` past the end of the handshake.
    pub fn add_channel(
        &self,
        handshake: &HandshakeRecord,
        local: TcpStream,
        remote: TcpStream,
        prefetched: Vec<u8>,
    ) -> Result<Arc<Channel>, Error> {
        let protocol = channel::protocol_for(&handshake.version)?;
        self.wait_for_handshake(&handshake.reference, &handshake.url)?;

        let id = self.next_channel_id.fetch_add(1, Ordering::AcqRel);
        let channel = Channel::with_protocol(
            protocol,
            id,
            handshake,
            local,
            remote,
            self.observers.clone(),
            self.config.max_frame_payload,
        )?;
        {
            // held until the channel is listed, so a concurrent list change re-evaluates it
            let ignore = self.ignore.read().unwrap_or_else(PoisonError::into_inner);
            if ignore.matches(channel.url()) {
                channel.set_forward_only(true);
            }
            lock(&self.channels).insert(id, channel.clone());
        }
        logwise::info_sync!(
            "channel {channel} opening for {url}",
            channel = id,
            url = logwise::privacy::LogIt(&handshake.url)
        );

        if let Err(e) = channel.start_listeners(&self.pool, prefetched) {
            lock(&self.channels).remove(&id);
            channel.shutdown();
            return Err(e.into());
        }
        Ok(channel)
    }

    fn wait_for_handshake(&self, reference: &HandshakeRef, url: &str) -> Result<(), Error> {
        let started = Instant::now();
        let deadline = started + self.config.handshake_timeout();
        while !reference.is_stored() {
            if Instant::now() >= deadline {
                return Err(Error::HandshakeNotStored {
                    url: url.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            std::thread::sleep(self.config.handshake_poll_interval());
        }
        Ok(())
    }

    /// Whether `channel` should be forward-only under the current ignore list.
    pub fn evaluate_ignore(&self, channel: &Channel) -> bool {
        self.ignore
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .matches(channel.url())
    }

    /// Re-evaluates every live channel against the ignore list.
    ///
    /// The list stays read-locked throughout, so observers must not change it from
    /// `on_state_change`.
    pub fn apply_ignore_list(&self) {
        let ignore = self.ignore.read().unwrap_or_else(PoisonError::into_inner);
        for channel in self.channels() {
            channel.set_forward_only(ignore.matches(channel.url()));
        }
    }

    /// Replaces the ignore list, applies it to live channels and stores it in the session.
    ///
    /// If any pattern fails to compile, nothing is stored, the ignore list is emptied, and the
    /// error names the offending pattern.
    pub fn set_ignore_list(&self, patterns: Vec<String>) -> Result<(), Error> {
        let result = IgnoreList::compile(&patterns);
        {
            let mut ignore = self.ignore.write().unwrap_or_else(PoisonError::into_inner);
            let forward_all = ignore.forward_all;
            *ignore = match &result {
                Ok(compiled) => compiled.clone(),
                Err(_) => IgnoreList::default(),
            };
            ignore.forward_all = forward_all;
        }
        self.apply_ignore_list();
        match result {
            Ok(_) => {
                self.store.persist_ignore_list(&patterns);
                Ok(())
            }
            Err(e) => {
                logwise::warn_sync!(
                    "Rejected ignore list: {error}",
                    error = logwise::privacy::LogIt(&e)
                );
                Err(e)
            }
        }
    }

    pub fn ignore_list(&self) -> Vec<String> {
        self.ignore
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .patterns()
            .to_vec()
    }

    pub fn set_forward_all(&self, forward_all: bool) {
        self.ignore
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .forward_all = forward_all;
        self.apply_ignore_list();
    }

    pub fn forward_all(&self) -> bool {
        self.ignore
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .forward_all()
    }

    pub fn channel(&self, id: u64) -> Option<Arc<Channel>> {
        lock(&self.channels).get(&id).cloned()
    }

    /// Live channels in id order.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        lock(&self.channels).values().cloned().collect()
    }

    pub fn channel_infos(&self) -> Vec<ChannelInfo> {
        self.channels().iter().map(|channel| channel.info()).collect()
    }

    pub fn is_connected(&self, id: u64) -> bool {
        self.channel(id).is_some_and(|channel| channel.is_connected())
    }

    /// Whether the channel opened by the handshake stored as `handshake_ref` is connected.
    pub fn is_connected_by_handshake(&self, handshake_ref: u64) -> bool {
        self.channels()
            .iter()
            .any(|channel| channel.handshake_ref() == Some(handshake_ref) && channel.is_connected())
    }

    /// Shuts a channel down and forgets it.
    pub fn remove_channel(&self, id: u64) -> Option<Arc<Channel>> {
        let channel = lock(&self.channels).remove(&id)?;
        channel.shutdown();
        Some(channel)
    }

    /// Shuts every channel down and forgets them, as when the session ends.
    pub fn remove_all(&self) {
        let channels = std::mem::take(&mut *lock(&self.channels));
        for channel in channels.values() {
            channel.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn patterns_match_whole_urls() {
        let list = IgnoreList::compile(&patterns(&[r".*\.example\.com/ws"])).unwrap();
        assert!(list.matches("ws://chat.example.com/ws"));
        assert!(!list.matches("ws://chat.example.com/ws/extra"));
        assert!(!list.matches("ws://example.org/ws"));

        let partial = IgnoreList::compile(&patterns(&["example"])).unwrap();
        assert!(!partial.matches("ws://example.com/"));
    }

    #[test]
    fn alternation_is_anchored_as_a_whole() {
        let list = IgnoreList::compile(&patterns(&["ws://a/|ws://b/"])).unwrap();
        assert!(list.matches("ws://b/"));
        assert!(!list.matches("ws://a/x"));
    }

    #[test]
    fn bad_pattern_empties_the_list() {
        let store = Arc::new(MemorySessionStore::new());
        let registry = ChannelRegistry::new(RelayConfig::default(), store.clone()).unwrap();
        registry.set_ignore_list(patterns(&["ws://ok/"])).unwrap();
        assert_eq!(store.ignore_list(), patterns(&["ws://ok/"]));

        let error = registry
            .set_ignore_list(patterns(&["ws://fine/", "a)|(b"]))
            .unwrap_err();
        assert!(matches!(error, Error::InvalidPattern { ref pattern, .. } if pattern == "a)|(b"));
        assert!(registry.ignore_list().is_empty());
        assert_eq!(store.ignore_list(), patterns(&["ws://ok/"]));
    }

    #[test]
    fn bad_configured_pattern_is_rejected() {
        let config = RelayConfig {
            ignore_patterns: patterns(&["("]),
            ..RelayConfig::default()
        };
        assert!(ChannelRegistry::new(config, Arc::new(MemorySessionStore::new())).is_err());
    }

    #[test]
    fn forward_all_survives_list_changes() {
        let registry = ChannelRegistry::new(RelayConfig::default(), Arc::new(MemorySessionStore::new())).unwrap();
        registry.set_forward_all(true);
        registry.set_ignore_list(patterns(&["x"])).unwrap();
        assert!(registry.forward_all());
        let _ = registry.set_ignore_list(patterns(&["("]));
        assert!(registry.forward_all());
    }

    #[test]
    fn channels_added_during_a_toggle_follow_the_final_setting() {
        let registry = ChannelRegistry::new(RelayConfig::default(), Arc::new(MemorySessionStore::new())).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let mut ends = Vec::new();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..200 {
                    registry.set_forward_all(round % 2 == 0);
                }
                registry.set_forward_all(true);
            });
            for n in 0..20 {
                let client = TcpStream::connect(address).unwrap();
                let (local, _) = listener.accept().unwrap();
                let remote = TcpStream::connect(address).unwrap();
                let (server, _) = listener.accept().unwrap();
                let handshake = HandshakeRecord {
                    reference: HandshakeRef::stored(n),
                    ..HandshakeRecord::new("ws://toggle/", "toggle", 80)
                };
                registry.add_channel(&handshake, local, remote, Vec::new()).unwrap();
                ends.push((client, server));
            }
        });
        let channels = registry.channels();
        assert_eq!(channels.len(), 20);
        assert!(channels.iter().all(|channel| channel.is_forward_only()));
        registry.remove_all();
    }

    #[test]
    fn ids_continue_from_the_session() {
        let registry = ChannelRegistry::new(RelayConfig::default(), Arc::new(MemorySessionStore::resumed(41))).unwrap();
        assert_eq!(registry.next_channel_id.load(Ordering::Acquire), 42);
    }

    #[test]
    fn unstored_handshake_times_out() {
        let config = RelayConfig {
            handshake_timeout_ms: 30,
            handshake_poll_interval_ms: 5,
            ..RelayConfig::default()
        };
        let registry = ChannelRegistry::new(config, Arc::new(MemorySessionStore::new())).unwrap();
        let reference = HandshakeRef::pending();
        assert!(matches!(
            registry.wait_for_handshake(&reference, "ws://x/"),
            Err(Error::HandshakeNotStored { .. })
        ));
        reference.mark_stored(1);
        assert!(registry.wait_for_handshake(&reference, "ws://x/").is_ok());
    }
}
