//! # Audio Ingest Buffer
//!
//! Per-session staging area between the websocket read loop and the transcription
//! stream. Every binary frame the client sends becomes an [`AudioChunk`] that must
//! pass through [`AudioIngestBuffer::accept`] before it can be forwarded.
//!
//! ## Key Features:
//! - **Strict ordering**: a chunk is accepted only if its sequence number is exactly
//!   one past the last accepted chunk (the first chunk carries sequence 0). A chunk
//!   that jumps ahead is rejected and the gap it exposed is abandoned, so nothing
//!   at or below its sequence number is ever forwarded
//! - **Bounded**: audio waiting for the transcription stream may never exceed the
//!   configured ceiling; the next chunk is rejected with [`RejectReason::Overflow`]
//! - **Opaque audio**: durations are derived from byte length and the declared
//!   [`AudioFormat`]; the bytes themselves are never decoded
//! - **Diagnostics**: only a short trailing window of forwarded-chunk metadata is
//!   retained, never the full history

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

/// Declared PCM layout of the client's audio stream.
///
/// ## Rust Concepts:
/// - **Copy**: the struct is three small integers, so it is passed by value
/// - **Serialize/Deserialize**: lets the format live inside `AppConfig`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Samples per second per channel
    pub sample_rate: u32,

    /// Number of interleaved channels
    pub channels: u8,

    /// Bits per sample (must be a multiple of 8)
    pub bit_depth: u8,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

impl AudioFormat {
    /// Number of bytes one second of audio occupies.
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * (self.bit_depth as u64 / 8)
    }

    /// Duration in milliseconds of `byte_len` bytes of audio in this format.
    ///
    /// Rounds down; a zero-rate format reports zero.
    pub fn duration_ms(&self, byte_len: usize) -> u64 {
        let bytes_per_second = self.bytes_per_second();
        if bytes_per_second == 0 {
            return 0;
        }
        (byte_len as u64 * 1000) / bytes_per_second
    }
}

/// Configuration for one session's ingest buffer.
#[derive(Debug, Clone)]
pub struct AudioBufferConfig {
    /// Layout used to turn byte counts into durations
    pub format: AudioFormat,

    /// Ceiling on audio accepted but not yet forwarded, in milliseconds
    pub max_buffered_ms: u64,

    /// How many forwarded chunks to remember for diagnostics
    pub diagnostic_window: usize,
}

impl Default for AudioBufferConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            max_buffered_ms: 5_000,
            diagnostic_window: 16,
        }
    }
}

/// One binary frame received from the client.
///
/// Fields are private so a chunk cannot change after it has been received.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    sequence: u64,
    data: Bytes,
    received_at: DateTime<Utc>,
}

impl AudioChunk {
    /// Stamp a frame with its sequence number and the current time.
    pub fn new(sequence: u64, data: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            data: data.into(),
            received_at: Utc::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Why a chunk was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("audio chunk {received} is out of order (expected sequence {expected})")]
    OutOfOrder { expected: u64, received: u64 },

    #[error("buffered audio would reach {would_buffer_ms}ms, above the {ceiling_ms}ms ceiling")]
    Overflow { would_buffer_ms: u64, ceiling_ms: u64 },
}

/// Metadata kept about a chunk after it has been handed to the transcription stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardedChunk {
    pub sequence: u64,
    pub bytes: usize,
    pub received_at: DateTime<Utc>,
}

/// Counters and the trailing window, for the ops surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestDiagnostics {
    pub accepted: u64,
    pub rejected_out_of_order: u64,
    pub rejected_overflow: u64,
    /// Highest sequence number abandoned because of a gap
    pub rejected_through: Option<u64>,
    pub pending_chunks: usize,
    pub pending_ms: u64,
    pub forwarded_ms: u64,
    pub recent: Vec<ForwardedChunk>,
}

/// Ordered, bounded queue of audio waiting to be forwarded.
///
/// ## Ownership:
/// The buffer is owned by exactly one `SessionRelay`, so it needs no locking.
/// Chunks move in by value through `accept` and move out by value through
/// `pop_front`, at which point the buffer only keeps their metadata.
pub struct AudioIngestBuffer {
    config: AudioBufferConfig,

    /// Sequence number the next accepted chunk must carry
    next_sequence: u64,

    /// Set when a chunk jumped ahead; everything up to it is refused
    rejected_through: Option<u64>,

    /// Accepted chunks not yet forwarded
    pending: VecDeque<AudioChunk>,
    pending_bytes: usize,

    /// Audio already handed to the transcription stream
    forwarded_bytes: u64,

    /// Trailing window of forwarded chunk metadata
    recent: VecDeque<ForwardedChunk>,

    accepted: u64,
    rejected_out_of_order: u64,
    rejected_overflow: u64,
}

impl AudioIngestBuffer {
    pub fn new(config: AudioBufferConfig) -> Self {
        let window = config.diagnostic_window;
        Self {
            config,
            next_sequence: 0,
            rejected_through: None,
            pending: VecDeque::new(),
            pending_bytes: 0,
            forwarded_bytes: 0,
            recent: VecDeque::with_capacity(window),
            accepted: 0,
            rejected_out_of_order: 0,
            rejected_overflow: 0,
        }
    }

    /// Accept a chunk or explain why it was refused.
    ///
    /// ## Rules:
    /// 1. The sequence number must equal [`next_sequence`](Self::next_sequence);
    ///    gaps and duplicates are both `OutOfOrder` and are never reordered
    /// 2. A chunk ahead of the expected number abandons the gap: it and every
    ///    chunk numbered at or below it are refused, and the expected number
    ///    moves past it
    /// 3. Pending audio plus this chunk must stay within `max_buffered_ms`
    ///
    /// Duplicates and overflow leave the expected sequence number where it is.
    pub fn accept(&mut self, chunk: AudioChunk) -> Result<(), RejectReason> {
        if chunk.sequence != self.next_sequence {
            let expected = self.next_sequence;
            self.rejected_out_of_order += 1;

            if chunk.sequence > expected {
                self.rejected_through = Some(chunk.sequence);
                self.next_sequence = chunk.sequence + 1;
            }
            return Err(RejectReason::OutOfOrder {
                expected,
                received: chunk.sequence,
            });
        }

        let would_buffer_ms = self.config.format.duration_ms(self.pending_bytes + chunk.len());
        if would_buffer_ms > self.config.max_buffered_ms {
            self.rejected_overflow += 1;
            return Err(RejectReason::Overflow {
                would_buffer_ms,
                ceiling_ms: self.config.max_buffered_ms,
            });
        }

        self.next_sequence += 1;
        self.accepted += 1;
        self.pending_bytes += chunk.len();
        self.pending.push_back(chunk);
        Ok(())
    }

    /// Sequence number the next chunk has to carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Oldest chunk still waiting to be forwarded.
    pub fn front(&self) -> Option<&AudioChunk> {
        self.pending.front()
    }

    /// Remove the oldest pending chunk once it has been forwarded.
    pub fn pop_front(&mut self) -> Option<AudioChunk> {
        let chunk = self.pending.pop_front()?;
        self.pending_bytes -= chunk.len();
        self.forwarded_bytes += chunk.len() as u64;

        if self.config.diagnostic_window > 0 {
            if self.recent.len() == self.config.diagnostic_window {
                self.recent.pop_front();
            }
            self.recent.push_back(ForwardedChunk {
                sequence: chunk.sequence,
                bytes: chunk.len(),
                received_at: chunk.received_at,
            });
        }

        Some(chunk)
    }

    /// Drop every pending chunk, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        self.pending_bytes = 0;
        discarded
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Duration of accepted audio not yet forwarded.
    pub fn pending_ms(&self) -> u64 {
        self.config.format.duration_ms(self.pending_bytes)
    }

    /// Duration of audio already handed to the transcription stream, which is
    /// where a freshly opened stream's timeline starts.
    pub fn forwarded_ms(&self) -> u64 {
        self.config.format.duration_ms(self.forwarded_bytes as usize)
    }

    pub fn diagnostics(&self) -> IngestDiagnostics {
        IngestDiagnostics {
            accepted: self.accepted,
            rejected_out_of_order: self.rejected_out_of_order,
            rejected_overflow: self.rejected_overflow,
            rejected_through: self.rejected_through,
            pending_chunks: self.pending.len(),
            pending_ms: self.pending_ms(),
            forwarded_ms: self.forwarded_ms(),
            recent: self.recent.iter().cloned().collect(),
        }
    }
}
