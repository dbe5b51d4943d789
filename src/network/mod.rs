//! Network Layer
//!
//! WebSocket server, wire format and server authority over client pressures.
//! This layer is **non-deterministic** - all rhythm logic runs through `game/`.

pub mod protocol;
pub mod reconcile;
pub mod prediction;
pub mod session;
pub mod server;

pub use protocol::{ClientMessage, ServerMessage, PressureEventRpc, ProtocolError};
pub use reconcile::{reconcile_pressure_events, ReconcileReport, RejectReason};
pub use prediction::{AuthoritativeState, ClientPredictor, Reconciliation};
pub use session::{ConnectionId, ConnectionTable, RhythmSession, SessionError, SessionId};
pub use server::{GameServer, GameServerError};
