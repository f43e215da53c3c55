/*!
A transparent, observable WebSocket relay for intercepting proxies.

interpose takes over a TCP connection right after an HTTP Upgrade handshake and relays RFC 6455
traffic between the client and the server byte for byte, while giving every registered observer
a decoded, frame-accurate view of it. Observers can watch, hold, drop, or rewrite messages.

# Overview

The handshake component of a proxy owns the sockets until the `101 Switching Protocols`
response has passed. It then hands both sockets to a [`ChannelRegistry`], which creates a
[`Channel`] and starts two listener threads for it, one per direction. Each listener:

1. blocks reading the next frame header from its peer,
2. reassembles fragmented messages,
3. notifies observers in order,
4. writes the frame's original bytes to the opposite peer.

No async runtime is involved: each channel uses two OS threads, created on demand by an
unbounded [`WorkerPool`](pool::WorkerPool).

# Key Features

- **Transparent**: frames are forwarded with their original mask, RSV bits and length encoding
- **Frame-accurate**: observers see every frame, including the pieces of unfinished messages
- **Interleaving-aware**: control frames between fragments do not disturb reassembly
- **Backpressure**: a slow observer holds its direction; breakpoints rely on this
- **Forward-only mode**: channels matching an ignore list are relayed without being observed
- **Bounded memory**: oversized frames are streamed through rather than buffered
- **Privacy-aware logging**: via logwise

# Quick Start

```no_run
use interpose::channel::{ChannelInfo, ChannelState};
use interpose::config::RelayConfig;
use interpose::message::Message;
use interpose::observer::Observer;
use interpose::registry::ChannelRegistry;
use interpose::store::MemorySessionStore;
use std::sync::Arc;

/// Uppercases every outgoing text frame.
struct Shout;

impl Observer for Shout {
    fn observing_order(&self) -> i32 {
        0
    }

    fn on_message_frame(&self, _channel_id: u64, message: &mut Message) -> bool {
        if message.is_outgoing() && message.opcode() == interpose::frame::Opcode::Text {
            let loud = message.current_frame().payload().to_ascii_uppercase();
            message.replace_frame_payload(loud);
        }
        true
    }

    fn on_state_change(&self, state: ChannelState, channel: &ChannelInfo) {
        eprintln!("{} is {:?}", channel.url, state);
    }
}

let registry = ChannelRegistry::new(RelayConfig::default(), Arc::new(MemorySessionStore::new()))
    .expect("default config is valid");
registry.add_observer(Arc::new(Shout));
// the handshake component now calls registry.add_channel(...) for each upgraded connection
```

# Modules

- [`frame`]: the RFC 6455 frame codec
- [`message`]: messages and their reassembly from frames
- [`channel`]: one relayed connection and its lifecycle
- [`observer`]: the observer interface and notifier
- [`registry`]: the table of live channels and the ignore list
- [`handshake`]: helpers for the HTTP side of the handoff
- [`config`]: relay configuration
- [`store`]: the session storage the registry reports to
- [`pool`]: the worker pool listeners run on
*/

logwise::declare_logging_domain!();

pub mod channel;
pub mod config;
mod countdown;
pub mod frame;
pub mod handshake;
mod listener;
pub mod message;
pub mod observer;
pub mod pool;
pub mod registry;
pub mod store;

pub use channel::{Channel, ChannelInfo, ChannelState};
pub use message::{Direction, Message};
pub use observer::Observer;
pub use registry::ChannelRegistry;

/// Milliseconds since the Unix epoch; 0 if the clock is before it.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
