//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Pressure events travel as fixed 17-byte bincode frames (binary WebSocket
//! messages); everything else is JSON (text messages).

use std::collections::BTreeMap;

use bincode::Options;
use serde::{Serialize, Deserialize};

use crate::game::command::RhythmKey;
use crate::game::engine::{EngineSnapshot, GhostId};
use crate::game::events::EngineEvent;
use crate::network::prediction::AuthoritativeState;

/// Encoded size of a pressure event.
pub const PRESSURE_RPC_SIZE: usize = 17;

/// Protocol errors. A packet that fails to decode is dropped.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Packet shorter than the fixed layout.
    #[error("Truncated packet: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    /// Packet longer than the fixed layout.
    #[error("Overlong packet: expected {expected} bytes, got {got}")]
    Overlong { expected: usize, got: usize },

    /// A field holds a value outside its domain.
    #[error("Malformed field: {0}")]
    Malformed(&'static str),

    /// Key value is not a drum key.
    #[error("Invalid key: {0}")]
    InvalidKey(i32),

    /// Connection already queued its share of pressures for this tick.
    #[error("Rate limited: more than {limit} pressures in one tick")]
    RateLimited { limit: usize },

    /// Binary codec error.
    #[error("Binary codec error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON codec error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// PRESSURE RPC (BINARY)
// =============================================================================

/// Pressure event sent by a client for one of its engines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureEventRpc {
    /// Replicated id of the target engine
    pub engine_ghost_id: GhostId,
    /// Key pressed
    pub key: RhythmKey,
    /// Score measured by the client (informational only)
    pub score: f32,
    /// Flow beat measured by the client
    pub flow_beat: i32,
    /// Client believes this pressure fails the command
    pub should_start_recovery: bool,
}

/// Field layout on the wire, in order.
#[derive(Serialize, Deserialize)]
struct PressureEventWire {
    engine_ghost_id: u32,
    key: i32,
    score: f32,
    flow_beat: i32,
    should_start_recovery: u8,
}

/// Fixed-width little-endian integers, no trailing bytes.
fn rpc_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

impl PressureEventRpc {
    /// Encode to the 17-byte wire layout.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let wire = PressureEventWire {
            engine_ghost_id: self.engine_ghost_id.0,
            key: self.key.as_i32(),
            score: self.score,
            flow_beat: self.flow_beat,
            should_start_recovery: self.should_start_recovery as u8,
        };
        Ok(rpc_options().serialize(&wire)?)
    }

    /// Decode from the wire. Nothing is read past a length mismatch.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < PRESSURE_RPC_SIZE {
            return Err(ProtocolError::Truncated {
                expected: PRESSURE_RPC_SIZE,
                got: bytes.len(),
            });
        }
        if bytes.len() > PRESSURE_RPC_SIZE {
            return Err(ProtocolError::Overlong {
                expected: PRESSURE_RPC_SIZE,
                got: bytes.len(),
            });
        }

        let wire: PressureEventWire = rpc_options().deserialize(bytes)?;

        let should_start_recovery = match wire.should_start_recovery {
            0 => false,
            1 => true,
            _ => return Err(ProtocolError::Malformed("should_start_recovery")),
        };
        if !wire.score.is_finite() {
            return Err(ProtocolError::Malformed("score"));
        }
        let key = RhythmKey::from_i32(wire.key).ok_or(ProtocolError::InvalidKey(wire.key))?;

        Ok(Self {
            engine_ghost_id: GhostId(wire.engine_ghost_id),
            key,
            score: wire.score,
            flow_beat: wire.flow_beat,
            should_start_recovery,
        })
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Control messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the session and get an engine.
    Join {
        /// Player UUID; the server assigns one when absent.
        player_id: Option<String>,
    },

    /// Select the command being entered.
    BindCommand { command: String },

    /// Ask for hero mode.
    TriggerHero,

    /// Ping for latency measurement.
    Ping { timestamp: u64 },

    /// Answer to a server `LatencyPing`, echoing its nonce.
    LatencyReply { nonce: u64 },

    /// Player is leaving.
    Leave,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join accepted.
    Joined(JoinInfo),

    /// Per-tick update for every engine.
    Tick(TickUpdate),

    /// Authoritative state of the receiver's own engine.
    Authoritative(AuthoritativeState),

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Server-timed round trip; the client answers with `LatencyReply`.
    LatencyPing { nonce: u64 },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// Join result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinInfo {
    /// Player UUID
    pub player_id: String,
    /// Engine owned by the player
    pub engine_id: u32,
    /// Replicated id to put in pressure events
    pub ghost_id: u32,
    /// Beat interval of the song
    pub beat_interval_ms: i64,
    /// Song length in beats
    pub max_beat: i32,
    /// Command names and ids
    pub commands: BTreeMap<String, u32>,
    /// Server version
    pub server_version: String,
}

/// Per-tick broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickUpdate {
    /// Tick number
    pub tick: u32,
    /// Snapshot of every engine
    pub engines: Vec<EngineSnapshot>,
    /// Events raised this tick
    pub events: Vec<EngineEvent>,
    /// World state hash (hex)
    pub state_hash: String,
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Create an error message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid input.
    InvalidInput,
    /// Message needs a joined player.
    NotJoined,
    /// Connection already owns an engine.
    AlreadyJoined,
    /// Command name is not part of the song.
    UnknownCommand,
    /// Command cannot be bound right now.
    CommandNotAllowed,
    /// Hero mode requirements not met.
    HeroModeUnavailable,
    /// Session is full.
    SessionFull,
    /// Internal error.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
