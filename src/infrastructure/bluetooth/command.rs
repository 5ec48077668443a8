//! Command Module
//!
//! A [`CommandHandler`] is the pluggable codec for one logical request: it
//! knows how to turn itself into a packet and how to recognize its response.
//! A [`Command`] wraps a handler with the transaction bookkeeping the session
//! needs (attempt count, assigned sequence, terminal callback, outcome) and is
//! shared between the caller, the pending-response registry and the timers.
//!
//! [`ChunkedCommand`] splits payloads that do not fit in one packet and relays
//! each chunk acknowledgment into the send of the next chunk.

use crate::domain::error::CommandError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Invoked once with the payload that completed the command.
/// Returns whether the payload was understood.
pub type ResponseCallback = Box<dyn FnOnce(&[u8]) -> bool + Send>;

/// What the session should do after a handler accepted a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStep {
    /// The command is done; resolve waiters and run the callback.
    Complete,
    /// More packets belong to this command; transmit it again.
    SendNext,
}

/// Serialization and matching rules for one kind of command.
pub trait CommandHandler: Send + 'static {
    /// Diagnostic name used in logs.
    fn name(&self) -> String;

    /// Build the packet for the current state. Called once per attempt, so it
    /// must produce the same bytes until the state is advanced.
    fn serialize(&self) -> Vec<u8>;

    /// Whether `payload` is the response to this command. Must not mutate.
    fn response_matches(&self, payload: &[u8]) -> bool;

    /// Fire-and-forget commands are never registered or retried.
    fn expects_response(&self) -> bool {
        true
    }

    fn needs_global_sequence(&self) -> bool {
        false
    }

    fn set_global_sequence(&mut self, _sequence: u8) {}

    /// `None` uses the session default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Total number of transmissions, the first one included. `None` uses the
    /// session default.
    fn max_retries(&self) -> Option<u32> {
        None
    }

    /// Advance internal state after a matched response.
    fn on_response(&mut self, _payload: &[u8]) -> ResponseStep {
        ResponseStep::Complete
    }
}

impl<H: CommandHandler + ?Sized> CommandHandler for Box<H> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn serialize(&self) -> Vec<u8> {
        (**self).serialize()
    }

    fn response_matches(&self, payload: &[u8]) -> bool {
        (**self).response_matches(payload)
    }

    fn expects_response(&self) -> bool {
        (**self).expects_response()
    }

    fn needs_global_sequence(&self) -> bool {
        (**self).needs_global_sequence()
    }

    fn set_global_sequence(&mut self, sequence: u8) {
        (**self).set_global_sequence(sequence)
    }

    fn timeout(&self) -> Option<Duration> {
        (**self).timeout()
    }

    fn max_retries(&self) -> Option<u32> {
        (**self).max_retries()
    }

    fn on_response(&mut self, payload: &[u8]) -> ResponseStep {
        (**self).on_response(payload)
    }
}

/// Capability to put a command back on the wire without assigning it a new
/// sequence number.
pub trait Transmitter: Send + Sync {
    fn transmit(&self, command: &Arc<Command>);
}

/// Final (or current) result of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    /// A fire-and-forget command was written.
    Sent,
    Resolved(Vec<u8>),
    Failed(CommandError),
}

impl Outcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Sent | Outcome::Resolved(_))
    }
}

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

struct CommandInner {
    handler: Box<dyn CommandHandler>,
    callback: Option<ResponseCallback>,
    attempts: u32,
    sequence: Option<u8>,
}

/// A handler in flight, shared by the caller and the session.
pub struct Command {
    id: u64,
    name: String,
    expects_response: bool,
    needs_global_sequence: bool,
    inner: Mutex<CommandInner>,
    outcome: watch::Sender<Outcome>,
}

impl Command {
    pub fn new(handler: impl CommandHandler) -> Arc<Self> {
        Self::build(Box::new(handler), None)
    }

    pub fn with_callback(
        handler: impl CommandHandler,
        callback: impl FnOnce(&[u8]) -> bool + Send + 'static,
    ) -> Arc<Self> {
        Self::build(Box::new(handler), Some(Box::new(callback)))
    }

    pub fn from_boxed(handler: Box<dyn CommandHandler>) -> Arc<Self> {
        Self::build(handler, None)
    }

    fn build(handler: Box<dyn CommandHandler>, callback: Option<ResponseCallback>) -> Arc<Self> {
        let (outcome, _) = watch::channel(Outcome::Pending);
        Arc::new(Self {
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
            name: handler.name(),
            expects_response: handler.expects_response(),
            needs_global_sequence: handler.needs_global_sequence(),
            inner: Mutex::new(CommandInner {
                handler,
                callback,
                attempts: 0,
                sequence: None,
            }),
            outcome,
        })
    }

    fn lock(&self) -> MutexGuard<'_, CommandInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expects_response(&self) -> bool {
        self.expects_response
    }

    pub fn needs_global_sequence(&self) -> bool {
        self.needs_global_sequence
    }

    pub fn sequence(&self) -> Option<u8> {
        self.lock().sequence
    }

    pub(crate) fn assign_sequence(&self, sequence: u8) {
        let mut inner = self.lock();
        inner.handler.set_global_sequence(sequence);
        inner.sequence = Some(sequence);
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.lock().handler.serialize()
    }

    pub fn response_matches(&self, payload: &[u8]) -> bool {
        self.lock().handler.response_matches(payload)
    }

    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.lock().handler.timeout().unwrap_or(default)
    }

    /// Total transmissions allowed for the current packet, never below one.
    pub fn max_attempts_or(&self, default: u32) -> u32 {
        self.lock().handler.max_retries().unwrap_or(default).max(1)
    }

    /// Transmissions made for the current packet.
    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    pub(crate) fn on_attempt(&self) -> u32 {
        let mut inner = self.lock();
        inner.attempts += 1;
        inner.attempts
    }

    /// Feed a matched response into the handler. Either relays the command
    /// through `transmitter` for its next packet or completes it.
    pub(crate) fn deliver(self: &Arc<Self>, payload: &[u8], transmitter: &dyn Transmitter) {
        let step = {
            let mut inner = self.lock();
            let step = inner.handler.on_response(payload);
            if step == ResponseStep::SendNext {
                inner.attempts = 0;
            }
            step
        };

        match step {
            ResponseStep::SendNext => transmitter.transmit(self),
            ResponseStep::Complete => {
                let callback = self.lock().callback.take();
                if let Some(callback) = callback {
                    if !callback(payload) {
                        debug!("Response for {} was not understood", self.name);
                    }
                }
                self.finish(Outcome::Resolved(payload.to_vec()));
            }
        }
    }

    pub(crate) fn mark_sent(&self) {
        self.finish(Outcome::Sent);
    }

    pub(crate) fn fail(&self, error: CommandError) {
        self.lock().callback = None;
        self.finish(Outcome::Failed(error));
    }

    /// Only the first transition out of `Pending` is kept.
    fn finish(&self, outcome: Outcome) {
        self.outcome.send_if_modified(|current| {
            if current.is_pending() {
                *current = outcome;
                true
            } else {
                false
            }
        });
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        !self.outcome.borrow().is_pending()
    }

    /// The payload that resolved the command, if any.
    pub fn response(&self) -> Option<Vec<u8>> {
        match &*self.outcome.borrow() {
            Outcome::Resolved(payload) => Some(payload.clone()),
            _ => None,
        }
    }

    /// Suspend until the command resolves or fails. Returns `true` when a
    /// response arrived (or a fire-and-forget command was written).
    ///
    /// Must not be awaited from the context that delivers inbound payloads.
    pub async fn wait_for_response(&self) -> bool {
        let mut rx = self.outcome.subscribe();
        let success = match rx.wait_for(|outcome| !outcome.is_pending()).await {
            Ok(outcome) => outcome.is_success(),
            Err(_) => false,
        };
        success
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("outcome", &*self.outcome.borrow())
            .finish()
    }
}

/// Header layout and ack matching for one kind of chunked command.
pub trait ChunkCodec: Send + 'static {
    fn name(&self) -> String;

    fn header_size(&self) -> usize;

    /// Fill `packet[..header_size()]`.
    fn write_header(&self, chunk_index: u8, chunk_count: u8, packet: &mut [u8]);

    /// Whether `payload` acknowledges chunk `chunk_index`.
    fn chunk_matches(&self, chunk_index: u8, payload: &[u8]) -> bool;
}

/// Progress of a chunked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPhase {
    /// `next_chunk` is the chunk on the wire (or about to be) and awaiting its ack.
    Relaying { next_chunk: u8 },
    /// The last chunk was acknowledged.
    Completed,
}

/// A payload split across as many packets as needed, one chunk in flight at a time.
pub struct ChunkedCommand<C: ChunkCodec> {
    codec: C,
    payload: Vec<u8>,
    chunk_size: usize,
    chunk_count: u8,
    phase: ChunkPhase,
}

impl<C: ChunkCodec> ChunkedCommand<C> {
    pub fn new(codec: C, payload: Vec<u8>, max_packet_size: usize) -> Result<Self, CommandError> {
        let chunk_size = max_packet_size.saturating_sub(codec.header_size()).max(1);
        let chunks = payload.len().div_ceil(chunk_size).max(1);
        let chunk_count = u8::try_from(chunks).map_err(|_| CommandError::PayloadTooLarge {
            name: codec.name(),
            len: payload.len(),
        })?;

        Ok(Self {
            codec,
            payload,
            chunk_size,
            chunk_count,
            phase: ChunkPhase::Relaying { next_chunk: 0 },
        })
    }

    pub fn chunk_count(&self) -> u8 {
        self.chunk_count
    }

    pub fn phase(&self) -> ChunkPhase {
        self.phase
    }

    fn current_chunk(&self) -> u8 {
        match self.phase {
            ChunkPhase::Relaying { next_chunk } => next_chunk,
            ChunkPhase::Completed => self.chunk_count - 1,
        }
    }
}

impl<C: ChunkCodec> CommandHandler for ChunkedCommand<C> {
    fn name(&self) -> String {
        self.codec.name()
    }

    fn serialize(&self) -> Vec<u8> {
        let chunk = self.current_chunk();
        let begin = (chunk as usize * self.chunk_size).min(self.payload.len());
        let end = (begin + self.chunk_size).min(self.payload.len());
        let header_size = self.codec.header_size();

        let mut packet = vec![0u8; header_size + (end - begin)];
        self.codec
            .write_header(chunk, self.chunk_count, &mut packet[..header_size]);
        packet[header_size..].copy_from_slice(&self.payload[begin..end]);
        packet
    }

    fn response_matches(&self, payload: &[u8]) -> bool {
        match self.phase {
            ChunkPhase::Relaying { next_chunk } => self.codec.chunk_matches(next_chunk, payload),
            ChunkPhase::Completed => false,
        }
    }

    fn on_response(&mut self, _payload: &[u8]) -> ResponseStep {
        match self.phase {
            ChunkPhase::Relaying { next_chunk } if next_chunk + 1 < self.chunk_count => {
                self.phase = ChunkPhase::Relaying {
                    next_chunk: next_chunk + 1,
                };
                ResponseStep::SendNext
            }
            _ => {
                self.phase = ChunkPhase::Completed;
                ResponseStep::Complete
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Probe {
        sequence: u8,
    }

    impl CommandHandler for Probe {
        fn name(&self) -> String {
            "probe".to_string()
        }

        fn serialize(&self) -> Vec<u8> {
            vec![0x42, self.sequence]
        }

        fn response_matches(&self, payload: &[u8]) -> bool {
            payload.len() >= 2 && payload[0] == 0x42 && payload[1] == self.sequence
        }

        fn needs_global_sequence(&self) -> bool {
            true
        }

        fn set_global_sequence(&mut self, sequence: u8) {
            self.sequence = sequence;
        }
    }

    struct TestCodec;

    impl ChunkCodec for TestCodec {
        fn name(&self) -> String {
            "test_chunks".to_string()
        }

        fn header_size(&self) -> usize {
            3
        }

        fn write_header(&self, chunk_index: u8, chunk_count: u8, packet: &mut [u8]) {
            packet[0] = 0x77;
            packet[1] = chunk_count;
            packet[2] = chunk_index;
        }

        fn chunk_matches(&self, _chunk_index: u8, payload: &[u8]) -> bool {
            payload.first() == Some(&0x77)
        }
    }

    #[derive(Default)]
    struct CountingTransmitter {
        calls: AtomicUsize,
    }

    impl Transmitter for CountingTransmitter {
        fn transmit(&self, _command: &Arc<Command>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_sequence_is_reused_across_serializations() {
        let command = Command::new(Probe { sequence: 0 });
        command.assign_sequence(7);
        assert_eq!(command.serialize(), vec![0x42, 7]);
        assert_eq!(command.serialize(), vec![0x42, 7]);
        assert_eq!(command.sequence(), Some(7));
    }

    #[test]
    fn test_response_matches_is_idempotent() {
        let command = Command::new(Probe { sequence: 3 });
        assert!(command.response_matches(&[0x42, 3]));
        assert!(command.response_matches(&[0x42, 3]));
        assert!(!command.response_matches(&[0x42, 4]));
        assert!(!command.response_matches(&[0x42, 4]));
        assert!(!command.is_finished());
    }

    #[test]
    fn test_first_outcome_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let command = Command::with_callback(Probe { sequence: 0 }, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        let transmitter = CountingTransmitter::default();

        command.deliver(&[0x42, 0], &transmitter);
        command.fail(CommandError::Disconnected {
            name: "probe".to_string(),
        });

        assert_eq!(command.response(), Some(vec![0x42, 0]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(transmitter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_chunk_count() {
        let empty = ChunkedCommand::new(TestCodec, vec![], 10).unwrap();
        assert_eq!(empty.chunk_count(), 1);
        assert_eq!(empty.serialize(), vec![0x77, 1, 0]);

        let exact = ChunkedCommand::new(TestCodec, vec![0; 14], 10).unwrap();
        assert_eq!(exact.chunk_count(), 2);

        let over = ChunkedCommand::new(TestCodec, vec![0; 15], 10).unwrap();
        assert_eq!(over.chunk_count(), 3);

        let too_large = ChunkedCommand::new(TestCodec, vec![0; 7 * 256], 10);
        assert!(matches!(
            too_large,
            Err(CommandError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_chunks_relay_until_last_ack() {
        let payload: Vec<u8> = (0..20).collect();
        let chunked = ChunkedCommand::new(TestCodec, payload, 10).unwrap();
        assert_eq!(chunked.chunk_count(), 3);

        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let command = Command::with_callback(chunked, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        let transmitter = CountingTransmitter::default();

        let mut packets = Vec::new();
        for _ in 0..3 {
            packets.push(command.serialize());
            assert_eq!(done.load(Ordering::SeqCst), 0);
            command.deliver(&[0x77, 0xC9], &transmitter);
        }

        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(transmitter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(packets[0], vec![0x77, 3, 0, 0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(packets[1], vec![0x77, 3, 1, 7, 8, 9, 10, 11, 12, 13]);
        assert_eq!(packets[2], vec![0x77, 3, 2, 14, 15, 16, 17, 18, 19]);
        assert!(!command.response_matches(&[0x77]));
        assert_eq!(command.response(), Some(vec![0x77, 0xC9]));
    }

    #[test]
    fn test_retry_resends_same_chunk() {
        let command = Command::new(ChunkedCommand::new(TestCodec, vec![1; 12], 10).unwrap());
        let first = command.serialize();
        assert_eq!(command.serialize(), first);
        assert_eq!(first[2], 0);
    }
}
