//! Carrier media transport: the wire protocol, the µ-law codec, the
//! bounded outbound ring, the per-call media session, and the energy VAD.
//!
//! Audio is 8 kHz µ-law, 20 ms frames of 160 bytes, both directions.

pub mod mulaw;
pub mod protocol;
pub mod ring;
pub mod session;
pub mod vad;

/// Bytes per 20 ms µ-law frame at 8 kHz.
pub const FRAME_BYTES: usize = 160;

/// Milliseconds of audio per frame.
pub const FRAME_MS: u64 = 20;

/// Frames per second on the wire.
pub const FRAMES_PER_SEC: u64 = 50;
