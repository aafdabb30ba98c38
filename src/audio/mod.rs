//! # Audio Module
//!
//! Audio handling on the way into a session.
//!
//! ## Audio Format:
//! The relay never decodes audio. Binary frames are treated as opaque PCM in the
//! configured format (16 kHz, 16-bit, mono by default), which is only used to turn
//! byte counts into durations for the buffer ceiling.

pub mod buffer;
