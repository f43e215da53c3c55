//! The blocking read loop for one direction of a channel.

use crate::channel::{self, Channel};
use crate::message::{Direction, MessageAssembler};
use std::io::{ErrorKind, Read};
use std::sync::Arc;

pub(crate) struct Listener {
    channel: Arc<Channel>,
    direction: Direction,
    input: Box<dyn Read + Send>,
    /// Owned by this listener alone, so it needs no lock.
    assembler: MessageAssembler,
}

impl Listener {
    pub(crate) fn new(channel: Arc<Channel>, direction: Direction, input: Box<dyn Read + Send>) -> Listener {
        let assembler = MessageAssembler::new(channel.id(), direction, channel.max_frame_payload());
        Listener {
            channel,
            direction,
            input,
            assembler,
        }
    }

    pub(crate) fn thread_name(&self) -> String {
        format!("interpose::channel-{}-{}", self.channel.id(), self.direction.name())
    }

    /// Relays frames until the input ends or fails, then reports to the channel.
    pub(crate) fn run(mut self) {
        let mut first = [0u8; 1];
        loop {
            match self.input.read(&mut first) {
                Ok(0) => {
                    logwise::debuginternal_sync!(
                        "channel {channel}: {direction} stream ended",
                        channel = self.channel.id(),
                        direction = logwise::privacy::LogIt(&self.direction)
                    );
                    break;
                }
                Ok(_) => {
                    if let Err(e) = self.channel.process_frame(
                        self.direction,
                        first[0],
                        &mut *self.input,
                        &mut self.assembler,
                    ) {
                        self.report(&e);
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted && !self.channel.is_closing() => {}
                Err(e) => {
                    self.report(&channel::Error::IoError(e));
                    break;
                }
            }
        }
        self.channel.listener_finished(self.direction);
    }

    fn report(&self, error: &channel::Error) {
        if self.channel.is_closing() {
            logwise::debuginternal_sync!(
                "channel {channel}: {direction} listener stopped during shutdown: {error}",
                channel = self.channel.id(),
                direction = logwise::privacy::LogIt(&self.direction),
                error = logwise::privacy::LogIt(error)
            );
        } else {
            logwise::warn_sync!(
                "channel {channel}: {direction} relay failed: {error}",
                channel = self.channel.id(),
                direction = logwise::privacy::LogIt(&self.direction),
                error = logwise::privacy::LogIt(error)
            );
        }
    }
}
