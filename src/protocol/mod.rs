// ABOUTME: Wire protocol spoken with the audio node
// ABOUTME: JSON text messages carried over the node WebSocket

/// Message type definitions
pub mod messages;

pub use messages::{
    CpuStats, EqualizerBand, Event, EventKind, FrameStats, IncomingMessage, MemoryStats,
    OutgoingMessage, PlayerState, Stats, TrackEndReason, TrackException,
};
