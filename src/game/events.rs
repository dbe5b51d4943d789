//! Engine Events
//!
//! Events raised by rhythm engines during a tick. Collaborators outside the
//! core (audio, animation, UI) react to these instead of polling state.

use serde::{Serialize, Deserialize};

use crate::game::command::CommandId;
use crate::game::engine::EngineId;
use crate::game::matcher::FailReason;

/// Priority for event processing order.
///
/// Lower value = processed first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventPriority {
    /// Engine resets processed first
    EngineReset = 0,
    /// Then failures
    CommandFailure = 1,
    /// Then completions
    CommandCompletion = 2,
    /// Then command activations
    CommandActivation = 3,
    /// Then fever and hero mode changes
    ComboChange = 4,
    /// Lowest priority
    Other = 255,
}

/// Why an engine went back to idle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetCause {
    /// Song reached its last beat
    SongEnded,
    /// Owner left the session
    OwnerLeft,
    /// Stopped by the host (death, restart)
    Stopped,
}

/// Engine event data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEventData {
    /// Engine clock passed zero with a bound command
    Started,

    /// Last step of a command matched
    CommandCompleted {
        command: CommandId,
        power: u8,
        chain: u32,
    },

    /// Completed command starts executing
    CommandActivated {
        command: CommandId,
        power: u8,
    },

    /// Command attempt failed, engine recovers until `recovery_until`
    CommandFailed {
        reason: FailReason,
        recovery_until: i32,
    },

    /// No command input followed the last execution in time
    ChainBroken {
        chain: u32,
    },

    /// Fever started
    FeverStarted {
        chain: u32,
    },

    /// Hero mode requested, active from `activates_at`
    HeroModeTriggered {
        activates_at: i32,
    },

    /// Hero mode is on
    HeroModeStarted,

    /// Hero mode ended after too many imperfect pressures
    HeroModeEnded,

    /// Engine went back to idle
    EngineReset {
        cause: ResetCause,
    },
}

impl EngineEventData {
    /// Processing priority of this event.
    pub fn priority(&self) -> EventPriority {
        match self {
            EngineEventData::EngineReset { .. } => EventPriority::EngineReset,
            EngineEventData::CommandFailed { .. } | EngineEventData::ChainBroken { .. } => {
                EventPriority::CommandFailure
            }
            EngineEventData::CommandCompleted { .. } => EventPriority::CommandCompletion,
            EngineEventData::CommandActivated { .. } => EventPriority::CommandActivation,
            EngineEventData::FeverStarted { .. }
            | EngineEventData::HeroModeTriggered { .. }
            | EngineEventData::HeroModeStarted
            | EngineEventData::HeroModeEnded => EventPriority::ComboChange,
            EngineEventData::Started => EventPriority::Other,
        }
    }
}

/// An engine event with timing and priority.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Tick when event occurred
    pub tick: u32,

    /// Processing priority
    pub priority: EventPriority,

    /// Engine that raised the event (for tie-breaking)
    pub engine_id: EngineId,

    /// Position in the engine's own event stream
    pub sequence: u32,

    /// Event data
    pub data: EngineEventData,
}

impl EngineEvent {
    /// Create a new event.
    pub fn new(tick: u32, engine_id: EngineId, sequence: u32, data: EngineEventData) -> Self {
        Self {
            tick,
            priority: data.priority(),
            engine_id,
            sequence,
            data,
        }
    }
}

impl PartialEq for EngineEvent {
    fn eq(&self, other: &Self) -> bool {
        self.tick == other.tick
            && self.priority == other.priority
            && self.engine_id == other.engine_id
            && self.sequence == other.sequence
    }
}

impl Eq for EngineEvent {}

impl PartialOrd for EngineEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EngineEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Sort by: tick, then priority, then engine, then emission order
        self.tick
            .cmp(&other.tick)
            .then(self.priority.cmp(&other.priority))
            .then(self.engine_id.cmp(&other.engine_id))
            .then(self.sequence.cmp(&other.sequence))
    }
}
