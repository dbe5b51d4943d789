//! Client Prediction
//!
//! Clients run their own copy of their engine so a pressure gets feedback
//! immediately. Every simulated frame is kept with its inputs and hash until
//! the server acknowledges it. When the authoritative state disagrees, the
//! server engine is adopted and the unacknowledged frames are replayed on it.

use std::collections::VecDeque;

use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::core::hash::StateHash;
use crate::game::command::{CommandRegistry, RhythmKey};
use crate::game::engine::{PressureOutcome, RhythmEngine};
use crate::game::events::EngineEventData;
use crate::game::matcher::PressureInput;
use crate::network::protocol::PressureEventRpc;

/// Unacknowledged frames kept before the oldest is dropped (2 s at 60 Hz).
pub const MAX_PREDICTED_FRAMES: usize = 120;

/// Server copy of one engine after a tick.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthoritativeState {
    /// Ticks simulated so far
    pub tick: u32,
    /// Engine state
    pub engine: RhythmEngine,
    /// `engine.compute_hash()`
    pub hash: StateHash,
}

impl AuthoritativeState {
    /// Capture an engine after `tick` ticks.
    pub fn capture(tick: u32, engine: &RhythmEngine) -> Self {
        Self {
            tick,
            engine: engine.clone(),
            hash: engine.compute_hash(),
        }
    }
}

/// What an authoritative state did to the prediction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconciliation {
    /// Prediction matched the server.
    Confirmed,
    /// Prediction diverged; `replayed` frames were resimulated on the server state.
    Corrected { replayed: usize },
    /// State is older than one already handled.
    Stale,
    /// No predicted frame to compare with; server state taken and the
    /// frames following it replayed.
    Adopted,
}

#[derive(Clone, Debug)]
struct PredictedFrame {
    tick: u32,
    delta_ms: i64,
    inputs: Vec<PressureInput>,
    hash: StateHash,
}

/// Predicted engine of the local player.
#[derive(Clone, Debug)]
pub struct ClientPredictor {
    engine: RhythmEngine,
    history: VecDeque<PredictedFrame>,
    /// Inputs predicted since the last advance
    pending: Vec<PressureInput>,
    /// Next tick to simulate
    tick: u32,
    last_ack: u32,
    corrections: u32,
}

impl ClientPredictor {
    /// Start predicting from a server state.
    pub fn from_authoritative(state: AuthoritativeState) -> Self {
        Self {
            engine: state.engine,
            history: VecDeque::new(),
            pending: Vec::new(),
            tick: state.tick,
            last_ack: state.tick,
            corrections: 0,
        }
    }

    /// Predicted engine.
    pub fn engine(&self) -> &RhythmEngine {
        &self.engine
    }

    /// Next tick to simulate.
    pub fn tick(&self) -> u32 {
        self.tick
    }

    /// Number of corrections so far.
    pub fn corrections(&self) -> u32 {
        self.corrections
    }

    /// Frames not yet acknowledged.
    pub fn unacknowledged(&self) -> usize {
        self.history.len()
    }

    /// Apply an input locally.
    pub fn predict(&mut self, registry: &CommandRegistry, input: PressureInput) -> PressureOutcome {
        self.pending.push(input);
        self.engine.apply_pressure(registry, input)
    }

    /// Press a key now: predict it and build the RPC to send.
    pub fn press(
        &mut self,
        registry: &CommandRegistry,
        key: RhythmKey,
    ) -> (PressureEventRpc, PressureOutcome) {
        let input = PressureInput::new(key, self.engine.flow_beat(), self.engine.score());
        let outcome = self.predict(registry, input);
        let rpc = PressureEventRpc {
            engine_ghost_id: self.engine.ghost(),
            key,
            score: input.score,
            flow_beat: input.flow_beat,
            should_start_recovery: matches!(outcome, PressureOutcome::Failed(_)),
        };
        (rpc, outcome)
    }

    /// Advance the predicted clock by one tick.
    pub fn advance(&mut self, registry: &CommandRegistry, delta_ms: i64) {
        self.engine.advance(registry, delta_ms);
        self.history.push_back(PredictedFrame {
            tick: self.tick,
            delta_ms,
            inputs: std::mem::take(&mut self.pending),
            hash: self.engine.compute_hash(),
        });
        if self.history.len() > MAX_PREDICTED_FRAMES {
            self.history.pop_front();
        }
        self.tick += 1;
    }

    /// Check the prediction against a server state.
    ///
    /// `state.tick` counts simulated ticks, so the frame that produced it is
    /// `state.tick - 1`.
    pub fn on_authoritative(
        &mut self,
        registry: &CommandRegistry,
        state: AuthoritativeState,
    ) -> Reconciliation {
        if state.tick <= self.last_ack {
            return Reconciliation::Stale;
        }
        self.last_ack = state.tick;

        let produced_by = self
            .history
            .iter()
            .find(|frame| frame.tick + 1 == state.tick)
            .map(|frame| frame.hash);
        while self.history.front().is_some_and(|f| f.tick < state.tick) {
            self.history.pop_front();
        }

        match produced_by {
            Some(hash) if hash == state.hash => Reconciliation::Confirmed,
            Some(_) => {
                let replayed = self.replay(registry, state.engine);
                self.corrections += 1;
                debug!(
                    tick = state.tick,
                    replayed,
                    "prediction corrected"
                );
                Reconciliation::Corrected { replayed }
            }
            None => {
                // Frames right after the state are replayed on it. Past
                // `MAX_PREDICTED_FRAMES` of lag the frames in between are gone
                // and the client resyncs from the server state alone.
                if self.history.front().is_some_and(|f| f.tick != state.tick) {
                    debug!(tick = state.tick, "prediction history gap, resyncing");
                    self.history.clear();
                }
                if self.history.is_empty() {
                    self.tick = state.tick;
                }
                self.replay(registry, state.engine);
                Reconciliation::Adopted
            }
        }
    }

    /// Take the server engine and resimulate every unacknowledged frame on it.
    fn replay(&mut self, registry: &CommandRegistry, engine: RhythmEngine) -> usize {
        self.engine = engine;
        for frame in self.history.iter_mut() {
            for input in &frame.inputs {
                self.engine.apply_pressure(registry, *input);
            }
            self.engine.advance(registry, frame.delta_ms);
            frame.hash = self.engine.compute_hash();
        }
        for input in &self.pending {
            self.engine.apply_pressure(registry, *input);
        }
        // Feedback for these was already given when they were first predicted
        self.engine.take_events();
        self.history.len()
    }

    /// Events raised by predicted frames since the last call.
    pub fn take_events(&mut self) -> Vec<EngineEventData> {
        self.engine.take_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::EngineSettings;
    use crate::game::command::CommandStep;
    use crate::game::engine::{EngineId, GhostId};

    fn setup() -> (CommandRegistry, RhythmEngine) {
        let registry = CommandRegistry::new();
        let march = registry
            .get_or_create(&[
                CommandStep::new(0, RhythmKey::Pata),
                CommandStep::new(1, RhythmKey::Pata),
                CommandStep::new(2, RhythmKey::Pata),
                CommandStep::new(3, RhythmKey::Pon),
            ])
            .unwrap();
        let settings = EngineSettings::new(500, 0).unwrap();
        let mut engine = RhythmEngine::new(EngineId(0), GhostId(1), settings);
        engine.bind_command(&registry, march).unwrap();
        engine.advance(&registry, 1);
        engine.take_events();
        (registry, engine)
    }

    #[test]
    fn test_matching_prediction_is_confirmed() {
        let (registry, mut server) = setup();
        let mut client = ClientPredictor::from_authoritative(AuthoritativeState::capture(0, &server));

        let (rpc, outcome) = client.press(&registry, RhythmKey::Pata);
        assert!(outcome.is_accepted());
        client.advance(&registry, 16);

        server.apply_pressure(&registry, PressureInput::new(rpc.key, rpc.flow_beat, rpc.score));
        server.advance(&registry, 16);

        let result = client.on_authoritative(&registry, AuthoritativeState::capture(1, &server));
        assert_eq!(result, Reconciliation::Confirmed);
        assert_eq!(client.unacknowledged(), 0);
        assert_eq!(client.corrections(), 0);
    }

    #[test]
    fn test_divergence_replays_unacknowledged_frames() {
        let (registry, mut server) = setup();
        let mut client = ClientPredictor::from_authoritative(AuthoritativeState::capture(0, &server));

        // Server never receives this pressure
        client.press(&registry, RhythmKey::Pata);
        client.advance(&registry, 16);
        client.advance(&registry, 16);

        server.advance(&registry, 16);
        let result = client.on_authoritative(&registry, AuthoritativeState::capture(1, &server));
        assert_eq!(result, Reconciliation::Corrected { replayed: 1 });
        assert_eq!(client.corrections(), 1);

        server.advance(&registry, 16);
        assert_eq!(client.engine().compute_hash(), server.compute_hash());
        assert!(!client.engine().has_consumed(0, RhythmKey::Pata));
    }

    #[test]
    fn test_old_state_is_stale() {
        let (registry, mut server) = setup();
        let mut client = ClientPredictor::from_authoritative(AuthoritativeState::capture(0, &server));
        client.advance(&registry, 16);
        server.advance(&registry, 16);

        let state = AuthoritativeState::capture(1, &server);
        assert_eq!(client.on_authoritative(&registry, state.clone()), Reconciliation::Confirmed);
        assert_eq!(client.on_authoritative(&registry, state), Reconciliation::Stale);
    }

    #[test]
    fn test_state_ahead_is_adopted() {
        let (registry, mut server) = setup();
        let mut client = ClientPredictor::from_authoritative(AuthoritativeState::capture(0, &server));

        for _ in 0..5 {
            server.advance(&registry, 16);
        }
        let result = client.on_authoritative(&registry, AuthoritativeState::capture(5, &server));
        assert_eq!(result, Reconciliation::Adopted);
        assert_eq!(client.tick(), 5);
        assert_eq!(client.engine().compute_hash(), server.compute_hash());
    }

    #[test]
    fn test_evicted_ack_replays_retained_frames() {
        let (registry, mut server) = setup();
        let mut reference = server.clone();
        let mut client = ClientPredictor::from_authoritative(AuthoritativeState::capture(0, &server));

        // Ticks 0..10 fall out of the history
        let frames = MAX_PREDICTED_FRAMES as u32 + 10;
        for _ in 0..frames {
            client.advance(&registry, 16);
            reference.advance(&registry, 16);
        }
        for _ in 0..10 {
            server.advance(&registry, 16);
        }

        let result = client.on_authoritative(&registry, AuthoritativeState::capture(10, &server));
        assert_eq!(result, Reconciliation::Adopted);
        assert_eq!(client.tick(), frames);
        assert_eq!(client.unacknowledged(), MAX_PREDICTED_FRAMES);
        assert_eq!(client.engine().compute_hash(), reference.compute_hash());
    }

    #[test]
    fn test_history_gap_resyncs() {
        let (registry, mut server) = setup();
        let mut client = ClientPredictor::from_authoritative(AuthoritativeState::capture(0, &server));

        for _ in 0..MAX_PREDICTED_FRAMES + 10 {
            client.advance(&registry, 16);
        }
        for _ in 0..5 {
            server.advance(&registry, 16);
        }

        // Frames 5..10 were evicted, nothing can be replayed
        let result = client.on_authoritative(&registry, AuthoritativeState::capture(5, &server));
        assert_eq!(result, Reconciliation::Adopted);
        assert_eq!(client.tick(), 5);
        assert_eq!(client.unacknowledged(), 0);
        assert_eq!(client.engine().compute_hash(), server.compute_hash());
    }

    #[test]
    fn test_press_builds_rpc() {
        let (registry, server) = setup();
        let mut client = ClientPredictor::from_authoritative(AuthoritativeState::capture(0, &server));

        // March starts with Pata
        let (rpc, outcome) = client.press(&registry, RhythmKey::Pon);
        assert!(matches!(outcome, PressureOutcome::Failed(_)));
        assert_eq!(rpc.engine_ghost_id, GhostId(1));
        assert_eq!(rpc.flow_beat, 0);
        assert!(rpc.should_start_recovery);

        let bytes = rpc.encode().unwrap();
        assert_eq!(PressureEventRpc::decode(&bytes).unwrap(), rpc);
    }
}
