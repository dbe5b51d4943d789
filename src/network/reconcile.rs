//! Pressure Reconciliation
//!
//! Server authority over client pressure events. Every received RPC is
//! consumed exactly once: it is either dropped with a `RejectReason` or turned
//! into a `PressureInput` scored on the server clock and queued for the tick.
//!
//! Rejected events never mutate state and nothing is sent back to the sender.

use std::collections::BTreeSet;

use tracing::{debug, trace, warn};

use crate::core::clock::{get_flow_beat, get_score};
use crate::game::command::RhythmKey;
use crate::game::engine::{EngineId, GhostId, PlayerId};
use crate::game::matcher::PressureInput;
use crate::game::tick::{EngineInputs, EngineWorld};
use crate::network::protocol::PressureEventRpc;
use crate::network::session::{ConnectionId, ConnectionTable};

/// Largest accepted distance between client and server flow beats.
pub const LATENCY_TOLERANCE_BEATS: u32 = 1;

/// Upper bound on the one-way latency a press is moved back by.
pub const MAX_LATENCY_COMPENSATION_MS: i64 = 100;

/// One-way latency used to rescore a press.
///
/// Never more than `MAX_LATENCY_COMPENSATION_MS` nor a quarter beat.
pub fn latency_compensation_ms(one_way_ms: i64, beat_interval_ms: i64) -> i64 {
    one_way_ms.clamp(0, MAX_LATENCY_COMPENSATION_MS.min(beat_interval_ms / 4))
}

/// A decoded RPC together with the connection it came from.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedRpc {
    /// Connection the packet arrived on
    pub source: ConnectionId,
    /// Decoded payload
    pub payload: PressureEventRpc,
}

/// Why an RPC was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    /// Ghost id does not map to an engine.
    #[error("Unknown engine ghost {0:?}")]
    UnknownEngine(GhostId),

    /// Engine has no owning player.
    #[error("Engine {0:?} has no owner")]
    NoOwner(EngineId),

    /// Sender is not the owner's connection.
    #[error("Connection {conn:?} does not own engine {engine:?}")]
    NotOwner { engine: EngineId, conn: ConnectionId },

    /// Same `(flow_beat, key)` already consumed.
    #[error("Duplicate pressure {key:?} on beat {flow_beat}")]
    Duplicate { flow_beat: i32, key: RhythmKey },

    /// Client beat too far from the server beat.
    #[error("Stale pressure: client beat {client_flow_beat}, server beat {server_flow_beat}")]
    Stale { client_flow_beat: i32, server_flow_beat: i32 },
}

/// Counters and queued inputs of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// RPCs examined
    pub received: u32,
    /// RPCs turned into inputs
    pub accepted: u32,
    /// Dropped: unknown ghost
    pub unknown_engine: u32,
    /// Dropped: engine without owner
    pub no_owner: u32,
    /// Dropped: sender is not the owner
    pub not_owner: u32,
    /// Dropped: already consumed
    pub duplicates: u32,
    /// Dropped: flow beat out of tolerance
    pub stale: u32,
    /// Validated inputs, per engine in arrival order
    pub inputs: EngineInputs,
}

impl ReconcileReport {
    /// Total dropped RPCs.
    pub fn rejected(&self) -> u32 {
        self.unknown_engine + self.no_owner + self.not_owner + self.duplicates + self.stale
    }

    fn count(&mut self, reason: &RejectReason) {
        match reason {
            RejectReason::UnknownEngine(_) => self.unknown_engine += 1,
            RejectReason::NoOwner(_) => self.no_owner += 1,
            RejectReason::NotOwner { .. } => self.not_owner += 1,
            RejectReason::Duplicate { .. } => self.duplicates += 1,
            RejectReason::Stale { .. } => self.stale += 1,
        }
    }
}

/// Authorize and rescore one RPC.
///
/// `batch` holds `(engine, flow_beat, key)` already accepted in this pass.
fn validate(
    world: &EngineWorld,
    connections: &ConnectionTable,
    batch: &BTreeSet<(EngineId, i32, RhythmKey)>,
    rpc: &ReceivedRpc,
) -> Result<(EngineId, PressureInput), RejectReason> {
    let payload = &rpc.payload;

    let engine_id = world
        .resolve_ghost(payload.engine_ghost_id)
        .ok_or(RejectReason::UnknownEngine(payload.engine_ghost_id))?;
    let engine = world
        .engine(engine_id)
        .ok_or(RejectReason::UnknownEngine(payload.engine_ghost_id))?;
    let owner: PlayerId = engine.owner().ok_or(RejectReason::NoOwner(engine_id))?;
    if connections.connection_of(&owner) != Some(rpc.source) {
        return Err(RejectReason::NotOwner {
            engine: engine_id,
            conn: rpc.source,
        });
    }

    // Score where the press happened on the server clock, not where it arrived
    let interval = engine.settings().beat_interval_ms();
    let latency = latency_compensation_ms(connections.one_way_latency_ms(rpc.source), interval);
    let pressed_at = engine.process().elapsed_ms - latency;
    let server_flow_beat = get_flow_beat(pressed_at, interval);
    let server_score = get_score(pressed_at, interval);

    if engine.has_consumed(server_flow_beat, payload.key)
        || batch.contains(&(engine_id, server_flow_beat, payload.key))
    {
        return Err(RejectReason::Duplicate {
            flow_beat: server_flow_beat,
            key: payload.key,
        });
    }

    if payload.flow_beat.abs_diff(server_flow_beat) > LATENCY_TOLERANCE_BEATS {
        return Err(RejectReason::Stale {
            client_flow_beat: payload.flow_beat,
            server_flow_beat,
        });
    }

    trace!(
        engine = engine_id.0,
        client_score = payload.score,
        server_score,
        client_recovery = payload.should_start_recovery,
        "pressure rescored"
    );

    Ok((engine_id, PressureInput::new(payload.key, server_flow_beat, server_score)))
}

/// Validate a batch of received RPCs against the world.
///
/// Guards, in order: known ghost, owned engine, owner's connection, not yet
/// consumed, within latency tolerance. The world is only read; accepted
/// pressures are applied by the next tick.
pub fn reconcile_pressure_events(
    world: &EngineWorld,
    connections: &ConnectionTable,
    rpcs: Vec<ReceivedRpc>,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let mut batch = BTreeSet::new();

    for rpc in rpcs {
        report.received += 1;

        match validate(world, connections, &batch, &rpc) {
            Ok((engine_id, input)) => {
                batch.insert((engine_id, input.flow_beat, input.key));
                report.inputs.entry(engine_id).or_default().push(input);
                report.accepted += 1;
            }
            Err(reason) => {
                match reason {
                    RejectReason::NotOwner { .. } => {
                        warn!("Dropped pressure from {:?}: {}", rpc.source, reason)
                    }
                    _ => debug!("Dropped pressure from {:?}: {}", rpc.source, reason),
                }
                report.count(&reason);
            }
        }
    }

    report
}
