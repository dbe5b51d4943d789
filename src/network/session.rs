//! Rhythm Session Management
//!
//! A session owns the command registry, the engine world and the connection
//! table. Network tasks feed it decoded control messages and raw RPC bytes;
//! the tick loop drives `run_tick` and publishes the results.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

use crate::config::RegisteredSong;
use crate::core::hash::StateHash;
use crate::game::command::CommandRegistry;
use crate::game::engine::{EngineError, EngineId, PlayerId};
use crate::game::events::ResetCause;
use crate::game::tick::{tick, EngineWorld, TickResult};
use crate::network::prediction::AuthoritativeState;
use crate::network::protocol::{
    ErrorCode, JoinInfo, PressureEventRpc, ProtocolError, ServerMessage, TickUpdate,
};
use crate::network::reconcile::{reconcile_pressure_events, ReceivedRpc, ReconcileReport};

/// Unique session identifier.
pub type SessionId = [u8; 16];

/// Pressure RPCs a connection may queue between two ticks.
pub const MAX_RPCS_PER_TICK: usize = 8;

/// Transport connection identifier, assigned by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

// =============================================================================
// CONNECTIONS
// =============================================================================

/// A live transport connection.
#[derive(Debug)]
pub struct ConnectionInfo {
    /// Player bound by a successful join
    pub player_id: Option<PlayerId>,
    /// Engine owned through that player
    pub engine_id: Option<EngineId>,
    /// Round-trip time measured by the server (ms)
    pub rtt_ms: u32,
    /// Outstanding latency ping: nonce and send time
    pub rtt_ping: Option<(u64, Instant)>,
    /// Pings sent so far, the next nonce
    pub pings_sent: u64,
    /// RPCs queued since the last tick
    pub queued_rpcs: usize,
    /// Message channel to this connection.
    pub sender: mpsc::Sender<ServerMessage>,
}

/// Connection to player mapping.
///
/// Uses BTreeMap for deterministic iteration order.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: BTreeMap<ConnectionId, ConnectionInfo>,
    players: BTreeMap<PlayerId, ConnectionId>,
}

impl ConnectionTable {
    /// Register a new, not yet joined connection.
    pub fn open(&mut self, id: ConnectionId, sender: mpsc::Sender<ServerMessage>) {
        self.connections.insert(id, ConnectionInfo {
            player_id: None,
            engine_id: None,
            rtt_ms: 0,
            rtt_ping: None,
            pings_sent: 0,
            queued_rpcs: 0,
            sender,
        });
    }

    /// Forget a connection and its player binding.
    pub fn close(&mut self, id: ConnectionId) -> Option<ConnectionInfo> {
        let info = self.connections.remove(&id)?;
        if let Some(player) = info.player_id {
            self.players.remove(&player);
        }
        Some(info)
    }

    /// Bind a player and its engine to a connection.
    pub fn bind_player(&mut self, id: ConnectionId, player: PlayerId, engine: EngineId) -> bool {
        let Some(info) = self.connections.get_mut(&id) else {
            return false;
        };
        info.player_id = Some(player);
        info.engine_id = Some(engine);
        self.players.insert(player, id);
        true
    }

    /// Drop the player binding, keep the connection open.
    pub fn unbind_player(&mut self, id: ConnectionId) -> Option<(PlayerId, EngineId)> {
        let info = self.connections.get_mut(&id)?;
        let player = info.player_id.take()?;
        let engine = info.engine_id.take()?;
        self.players.remove(&player);
        Some((player, engine))
    }

    /// Get a connection.
    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionInfo> {
        self.connections.get(&id)
    }

    /// Connection currently bound to `player`.
    pub fn connection_of(&self, player: &PlayerId) -> Option<ConnectionId> {
        self.players.get(player).copied()
    }

    /// Store a round-trip time measurement.
    pub fn set_rtt(&mut self, id: ConnectionId, rtt_ms: u32) {
        if let Some(info) = self.connections.get_mut(&id) {
            info.rtt_ms = rtt_ms;
        }
    }

    /// Start a latency ping, replacing any unanswered one.
    pub fn begin_rtt_ping(&mut self, id: ConnectionId, now: Instant) -> Option<u64> {
        let info = self.connections.get_mut(&id)?;
        let nonce = info.pings_sent;
        info.pings_sent += 1;
        info.rtt_ping = Some((nonce, now));
        Some(nonce)
    }

    /// Finish a latency ping. Replies with an unknown nonce are ignored.
    pub fn complete_rtt_ping(&mut self, id: ConnectionId, nonce: u64, now: Instant) -> Option<u32> {
        let info = self.connections.get_mut(&id)?;
        let (expected, sent_at) = info.rtt_ping?;
        if nonce != expected {
            return None;
        }
        info.rtt_ping = None;
        let rtt_ms = u32::try_from(now.saturating_duration_since(sent_at).as_millis()).unwrap_or(u32::MAX);
        info.rtt_ms = rtt_ms;
        Some(rtt_ms)
    }

    /// Count one queued RPC against the connection's per-tick share.
    /// Unknown connections have no share.
    fn reserve_rpc(&mut self, id: ConnectionId) -> bool {
        match self.connections.get_mut(&id) {
            Some(info) if info.queued_rpcs < MAX_RPCS_PER_TICK => {
                info.queued_rpcs += 1;
                true
            }
            _ => false,
        }
    }

    fn reset_rpc_counts(&mut self) {
        for info in self.connections.values_mut() {
            info.queued_rpcs = 0;
        }
    }

    /// Half the round-trip time, 0 for unknown connections.
    pub fn one_way_latency_ms(&self, id: ConnectionId) -> i64 {
        self.connections
            .get(&id)
            .map(|info| info.rtt_ms as i64 / 2)
            .unwrap_or(0)
    }

    /// All connections in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&ConnectionId, &ConnectionInfo)> {
        self.connections.iter()
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is open.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Output of one session tick.
#[derive(Debug)]
pub struct SessionTick {
    /// Reconciliation counters and the inputs that were applied
    pub report: ReconcileReport,
    /// Simulation result
    pub result: TickResult,
    /// World hash after the tick
    pub hash: StateHash,
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No free engine slot.
    #[error("Session is full")]
    SessionFull,

    /// Connection already owns an engine.
    #[error("Already joined")]
    AlreadyJoined,

    /// Player id is bound to another connection.
    #[error("Player is connected elsewhere")]
    PlayerInUse,

    /// Connection has not joined.
    #[error("Not joined")]
    NotJoined,

    /// Connection id is not open.
    #[error("Unknown connection")]
    UnknownConnection,

    /// Command name is not part of the song.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Hero mode requirements not met.
    #[error("Hero mode unavailable")]
    HeroModeUnavailable,

    /// Engine refused the request.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl SessionError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::SessionFull => ErrorCode::SessionFull,
            SessionError::AlreadyJoined | SessionError::PlayerInUse => ErrorCode::AlreadyJoined,
            SessionError::NotJoined | SessionError::UnknownConnection => ErrorCode::NotJoined,
            SessionError::UnknownCommand(_) | SessionError::Engine(EngineError::UnknownCommand(_)) => {
                ErrorCode::UnknownCommand
            }
            SessionError::Engine(EngineError::CommandNotAllowed(_)) => ErrorCode::CommandNotAllowed,
            SessionError::HeroModeUnavailable => ErrorCode::HeroModeUnavailable,
        }
    }
}

/// A running song with its players.
pub struct RhythmSession {
    /// Unique session identifier.
    pub id: SessionId,
    registry: Arc<CommandRegistry>,
    song: RegisteredSong,
    world: EngineWorld,
    connections: ConnectionTable,
    /// RPCs received since the last tick, in arrival order
    rpc_queue: Vec<ReceivedRpc>,
    max_engines: usize,
}

impl RhythmSession {
    /// Create a session for a registered song.
    pub fn new(registry: Arc<CommandRegistry>, song: RegisteredSong, max_engines: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().into_bytes(),
            registry,
            song,
            world: EngineWorld::new(),
            connections: ConnectionTable::default(),
            rpc_queue: Vec::new(),
            max_engines,
        }
    }

    /// Command registry.
    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Song configuration.
    pub fn song(&self) -> &RegisteredSong {
        &self.song
    }

    /// Engine world.
    pub fn world(&self) -> &EngineWorld {
        &self.world
    }

    /// Connection table.
    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// Number of queued RPCs.
    pub fn pending_rpcs(&self) -> usize {
        self.rpc_queue.len()
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Register a transport connection.
    pub fn open_connection(&mut self, id: ConnectionId, sender: mpsc::Sender<ServerMessage>) {
        self.connections.open(id, sender);
    }

    /// Drop a connection, releasing its engine.
    pub fn close_connection(&mut self, id: ConnectionId) {
        if self.leave(id).is_ok() {
            debug!("Connection {:?} left on close", id);
        }
        self.connections.close(id);
    }

    /// Join with an optional player id and take an engine.
    ///
    /// Idle engines without owner are reused before new ones are spawned.
    /// The engine gets the song's chaining command bound.
    pub fn join(
        &mut self,
        conn: ConnectionId,
        player: Option<PlayerId>,
    ) -> Result<JoinInfo, SessionError> {
        let info = self.connections.get(conn).ok_or(SessionError::UnknownConnection)?;
        if info.player_id.is_some() {
            return Err(SessionError::AlreadyJoined);
        }
        let player = player.unwrap_or_else(PlayerId::random);
        if self.connections.connection_of(&player).is_some() {
            return Err(SessionError::PlayerInUse);
        }

        let free = self
            .world
            .engines()
            .find(|e| e.owner().is_none())
            .map(|e| e.id());
        let engine_id = match free {
            Some(id) => id,
            None if self.world.len() < self.max_engines => {
                self.world
                    .spawn_engine(self.song.settings, self.song.ability_commands.clone())
                    .0
            }
            None => return Err(SessionError::SessionFull),
        };

        let engine = self
            .world
            .engine_mut(engine_id)
            .ok_or(SessionError::SessionFull)?;
        engine.set_owner(Some(player));
        if let Some(chaining) = self.song.ability_commands.chaining {
            engine.bind_command(&self.registry, chaining)?;
        }
        let ghost = engine.ghost();
        self.connections.bind_player(conn, player, engine_id);

        info!(
            "Player {} joined on {:?} with engine {}",
            player.short(),
            conn,
            engine_id.0
        );

        Ok(JoinInfo {
            player_id: player.to_uuid_string(),
            engine_id: engine_id.0,
            ghost_id: ghost.0,
            beat_interval_ms: self.song.settings.beat_interval_ms(),
            max_beat: self.song.settings.max_beat(),
            commands: self
                .song
                .commands
                .iter()
                .map(|(name, id)| (name.clone(), id.0))
                .collect(),
            server_version: crate::VERSION.to_string(),
        })
    }

    /// Leave: the engine is reset and loses its owner.
    pub fn leave(&mut self, conn: ConnectionId) -> Result<(), SessionError> {
        let (player, engine_id) = self
            .connections
            .unbind_player(conn)
            .ok_or(SessionError::NotJoined)?;
        if let Some(engine) = self.world.engine_mut(engine_id) {
            engine.reset(ResetCause::OwnerLeft);
            engine.set_owner(None);
        }
        info!("Player {} left engine {}", player.short(), engine_id.0);
        Ok(())
    }

    fn engine_of(&self, conn: ConnectionId) -> Result<EngineId, SessionError> {
        self.connections
            .get(conn)
            .ok_or(SessionError::UnknownConnection)?
            .engine_id
            .ok_or(SessionError::NotJoined)
    }

    /// Select the command the connection's engine is entering.
    pub fn bind_command(&mut self, conn: ConnectionId, name: &str) -> Result<(), SessionError> {
        let engine_id = self.engine_of(conn)?;
        let command = self
            .song
            .command(name)
            .ok_or_else(|| SessionError::UnknownCommand(name.to_string()))?;
        let engine = self.world.engine_mut(engine_id).ok_or(SessionError::NotJoined)?;
        engine.bind_command(&self.registry, command)?;
        Ok(())
    }

    /// Ask for hero mode on the connection's engine.
    pub fn trigger_hero(&mut self, conn: ConnectionId) -> Result<(), SessionError> {
        let engine_id = self.engine_of(conn)?;
        let engine = self.world.engine_mut(engine_id).ok_or(SessionError::NotJoined)?;
        if engine.trigger_hero_activation() {
            Ok(())
        } else {
            Err(SessionError::HeroModeUnavailable)
        }
    }

    /// Start timing a round trip to the connection; returns the nonce to send.
    pub fn begin_rtt_ping(&mut self, conn: ConnectionId) -> Option<u64> {
        self.connections.begin_rtt_ping(conn, Instant::now())
    }

    /// Client answered a latency ping.
    pub fn complete_rtt_ping(&mut self, conn: ConnectionId, nonce: u64) -> Option<u32> {
        let rtt = self.connections.complete_rtt_ping(conn, nonce, Instant::now())?;
        trace!("Connection {:?} rtt {} ms", conn, rtt);
        Some(rtt)
    }

    /// Decode a pressure RPC and queue it for the next tick.
    ///
    /// Malformed packets and packets beyond `MAX_RPCS_PER_TICK` are dropped
    /// without touching any state.
    pub fn receive_rpc(&mut self, conn: ConnectionId, bytes: &[u8]) -> Result<(), ProtocolError> {
        let payload = match PressureEventRpc::decode(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropped malformed pressure from {:?}: {}", conn, e);
                return Err(e);
            }
        };
        if !self.connections.reserve_rpc(conn) {
            debug!("Dropped pressure from {:?}: per-tick limit reached", conn);
            return Err(ProtocolError::RateLimited { limit: MAX_RPCS_PER_TICK });
        }
        self.rpc_queue.push(ReceivedRpc { source: conn, payload });
        Ok(())
    }

    // =========================================================================
    // Tick
    // =========================================================================

    /// Reconcile queued RPCs, then simulate one tick.
    pub fn run_tick(&mut self, delta_ms: i64) -> SessionTick {
        let rpcs = std::mem::take(&mut self.rpc_queue);
        self.connections.reset_rpc_counts();
        let report = reconcile_pressure_events(&self.world, &self.connections, rpcs);
        if report.rejected() > 0 {
            debug!(
                "Tick {}: {} pressures accepted, {} rejected",
                self.world.tick,
                report.accepted,
                report.rejected()
            );
        }

        let result = tick(&mut self.world, &self.registry, &report.inputs, delta_ms);
        let hash = self.world.compute_hash();

        SessionTick { report, result, hash }
    }

    /// Broadcast payload for a tick.
    pub fn tick_update(&self, session_tick: &SessionTick) -> TickUpdate {
        TickUpdate {
            tick: session_tick.result.tick,
            engines: self.world.engines().map(|e| e.snapshot()).collect(),
            events: session_tick.result.events.clone(),
            state_hash: hex::encode(session_tick.hash),
        }
    }

    /// Authoritative state of one engine after the last tick.
    pub fn authoritative_state(&self, engine: EngineId) -> Option<AuthoritativeState> {
        let engine = self.world.engine(engine)?;
        Some(AuthoritativeState::capture(self.world.tick, engine))
    }

    /// Push a tick to every connection, and its own engine state to each owner.
    pub fn publish_tick(&self, session_tick: &SessionTick) {
        let update = ServerMessage::Tick(self.tick_update(session_tick));
        for (id, info) in self.connections.iter() {
            send(*id, &info.sender, update.clone());
            if let Some(state) = info.engine_id.and_then(|e| self.authoritative_state(e)) {
                send(*id, &info.sender, ServerMessage::Authoritative(state));
            }
        }
    }
}

/// Non-blocking send: a slow client never stalls the tick loop.
fn send(id: ConnectionId, sender: &mpsc::Sender<ServerMessage>, message: ServerMessage) {
    match sender.try_send(message) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => debug!("Outbound queue full for {:?}, dropping", id),
        Err(TrySendError::Closed(_)) => debug!("Outbound queue closed for {:?}", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SongConfig;
    use crate::game::command::RhythmKey;
    use crate::game::engine::{EnginePhase, GhostId};

    fn create_test_session(max_engines: usize) -> RhythmSession {
        let registry = Arc::new(CommandRegistry::new());
        let song = SongConfig::default().register(&registry).unwrap();
        RhythmSession::new(registry, song, max_engines)
    }

    fn rpc_bytes(ghost: u32, key: RhythmKey, flow_beat: i32) -> Vec<u8> {
        PressureEventRpc {
            engine_ghost_id: GhostId(ghost),
            key,
            score: 0.0,
            flow_beat,
            should_start_recovery: false,
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let mut session = create_test_session(4);
        let (tx, _rx) = mpsc::channel(10);
        session.open_connection(ConnectionId(1), tx);

        let player = PlayerId::new([1; 16]);
        let info = session.join(ConnectionId(1), Some(player)).unwrap();
        assert_eq!(info.player_id, player.to_uuid_string());
        assert_eq!(info.ghost_id, 1);
        assert!(info.commands.contains_key("march"));
        assert_eq!(session.connections().connection_of(&player), Some(ConnectionId(1)));

        let engine = session.world().engine(EngineId(info.engine_id)).unwrap();
        assert_eq!(engine.owner(), Some(player));
        assert_eq!(engine.bound_command(), session.song().command("march"));

        assert!(matches!(
            session.join(ConnectionId(1), None),
            Err(SessionError::AlreadyJoined)
        ));

        session.leave(ConnectionId(1)).unwrap();
        let engine = session.world().engine(EngineId(info.engine_id)).unwrap();
        assert_eq!(engine.owner(), None);
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert!(matches!(session.leave(ConnectionId(1)), Err(SessionError::NotJoined)));
    }

    #[tokio::test]
    async fn test_session_full_and_engine_reuse() {
        let mut session = create_test_session(1);
        let (tx, _rx) = mpsc::channel(10);
        session.open_connection(ConnectionId(1), tx.clone());
        session.open_connection(ConnectionId(2), tx);

        let first = session.join(ConnectionId(1), None).unwrap();
        let full = session.join(ConnectionId(2), None);
        assert!(matches!(full, Err(SessionError::SessionFull)));
        assert_eq!(full.unwrap_err().code(), ErrorCode::SessionFull);

        session.close_connection(ConnectionId(1));
        let second = session.join(ConnectionId(2), None).unwrap();
        assert_eq!(second.engine_id, first.engine_id);
        assert_eq!(session.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_player_in_use() {
        let mut session = create_test_session(4);
        let (tx, _rx) = mpsc::channel(10);
        session.open_connection(ConnectionId(1), tx.clone());
        session.open_connection(ConnectionId(2), tx);

        let player = PlayerId::new([7; 16]);
        session.join(ConnectionId(1), Some(player)).unwrap();
        assert!(matches!(
            session.join(ConnectionId(2), Some(player)),
            Err(SessionError::PlayerInUse)
        ));
    }

    #[tokio::test]
    async fn test_bind_command_errors() {
        let mut session = create_test_session(4);
        let (tx, _rx) = mpsc::channel(10);
        session.open_connection(ConnectionId(1), tx);

        assert!(matches!(
            session.bind_command(ConnectionId(1), "march"),
            Err(SessionError::NotJoined)
        ));

        session.join(ConnectionId(1), None).unwrap();
        session.bind_command(ConnectionId(1), "attack").unwrap();

        let err = session.bind_command(ConnectionId(1), "moonwalk").unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownCommand);

        // Summon is reserved for hero mode
        let err = session.bind_command(ConnectionId(1), "summon").unwrap_err();
        assert_eq!(err.code(), ErrorCode::CommandNotAllowed);

        let err = session.trigger_hero(ConnectionId(1)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::HeroModeUnavailable);
    }

    #[tokio::test]
    async fn test_malformed_rpc_is_dropped() {
        let mut session = create_test_session(4);
        let (tx, _rx) = mpsc::channel(10);
        session.open_connection(ConnectionId(1), tx);
        session.join(ConnectionId(1), None).unwrap();
        session.run_tick(1);
        let hash = session.world().compute_hash();

        let bytes = rpc_bytes(1, RhythmKey::Pata, 0);
        assert!(session.receive_rpc(ConnectionId(1), &bytes[..12]).is_err());
        assert_eq!(session.pending_rpcs(), 0);
        assert_eq!(session.world().compute_hash(), hash);
    }

    #[tokio::test]
    async fn test_run_tick_applies_owner_pressure() {
        let mut session = create_test_session(4);
        let (tx, _rx) = mpsc::channel(10);
        session.open_connection(ConnectionId(1), tx.clone());
        session.open_connection(ConnectionId(2), tx);
        let info = session.join(ConnectionId(1), None).unwrap();
        session.run_tick(1);

        let bytes = rpc_bytes(info.ghost_id, RhythmKey::Pata, 0);
        session.receive_rpc(ConnectionId(1), &bytes).unwrap();
        session.receive_rpc(ConnectionId(2), &bytes).unwrap();

        let result = session.run_tick(16);
        assert_eq!(result.report.accepted, 1);
        assert_eq!(result.report.not_owner, 1);
        assert_eq!(result.result.outcomes.len(), 1);
        assert_eq!(result.hash, session.world().compute_hash());

        let engine = session.world().engine(EngineId(info.engine_id)).unwrap();
        assert!(engine.has_consumed(0, RhythmKey::Pata));
    }

    #[tokio::test]
    async fn test_publish_tick() {
        let mut session = create_test_session(4);
        let (tx1, mut rx1) = mpsc::channel(10);
        let (tx2, mut rx2) = mpsc::channel(10);
        session.open_connection(ConnectionId(1), tx1);
        session.open_connection(ConnectionId(2), tx2);
        let info = session.join(ConnectionId(1), None).unwrap();

        let result = session.run_tick(16);
        session.publish_tick(&result);

        match rx1.recv().await {
            Some(ServerMessage::Tick(update)) => {
                assert_eq!(update.tick, 0);
                assert_eq!(update.engines.len(), 1);
                assert_eq!(update.state_hash, hex::encode(result.hash));
            }
            other => panic!("Expected tick update, got {:?}", other),
        }
        match rx1.recv().await {
            Some(ServerMessage::Authoritative(state)) => {
                assert_eq!(state.tick, 1);
                assert_eq!(state.engine.id(), EngineId(info.engine_id));
            }
            other => panic!("Expected authoritative state, got {:?}", other),
        }

        // Spectator gets the tick only
        assert!(matches!(rx2.recv().await, Some(ServerMessage::Tick(_))));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rpc_flood_is_capped_per_tick() {
        let mut session = create_test_session(4);
        let (tx, _rx) = mpsc::channel(10);
        session.open_connection(ConnectionId(1), tx.clone());
        session.open_connection(ConnectionId(2), tx);
        let info = session.join(ConnectionId(1), None).unwrap();
        let bytes = rpc_bytes(info.ghost_id, RhythmKey::Pata, 0);

        for _ in 0..MAX_RPCS_PER_TICK {
            session.receive_rpc(ConnectionId(1), &bytes).unwrap();
        }
        assert!(matches!(
            session.receive_rpc(ConnectionId(1), &bytes),
            Err(ProtocolError::RateLimited { limit: MAX_RPCS_PER_TICK })
        ));
        // Other connections keep their own share
        session.receive_rpc(ConnectionId(2), &bytes).unwrap();
        assert_eq!(session.pending_rpcs(), MAX_RPCS_PER_TICK + 1);

        // The share refills every tick
        session.run_tick(16);
        assert_eq!(session.pending_rpcs(), 0);
        session.receive_rpc(ConnectionId(1), &bytes).unwrap();
    }

    #[tokio::test]
    async fn test_rtt_is_measured_by_server() {
        let mut table = ConnectionTable::default();
        let (tx, _rx) = mpsc::channel(10);
        table.open(ConnectionId(1), tx);

        let sent = Instant::now();
        let first = table.begin_rtt_ping(ConnectionId(1), sent).unwrap();
        let second = table.begin_rtt_ping(ConnectionId(1), sent).unwrap();
        assert_ne!(first, second);

        // Only the outstanding nonce counts, and only once
        let later = sent + std::time::Duration::from_millis(80);
        assert_eq!(table.complete_rtt_ping(ConnectionId(1), first, later), None);
        assert_eq!(table.complete_rtt_ping(ConnectionId(1), second, later), Some(80));
        assert_eq!(table.complete_rtt_ping(ConnectionId(1), second, later), None);
        assert_eq!(table.one_way_latency_ms(ConnectionId(1)), 40);

        assert_eq!(table.begin_rtt_ping(ConnectionId(9), sent), None);
    }
}
