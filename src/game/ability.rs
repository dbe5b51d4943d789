//! Ability Phase
//!
//! Phase of the ability attached to a command result, driven by an explicit
//! transition table instead of flag arithmetic at call sites.

use serde::{Serialize, Deserialize};

use crate::game::command::CommandId;

/// Non-perfect pressures tolerated while hero mode is on.
pub const HERO_MODE_MAX_IMPERFECT: u32 = 3;

/// Phase of the current command's ability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AbilityPhase {
    /// No command result pending
    #[default]
    None = 0,
    /// Command completed, ability starts on the next beat
    WillBeActive = 1,
    /// Ability is executing
    Active = 2,
    /// Execution ended, ability carries over while the next command is entered
    Chaining = 3,
    /// Hero mode is being granted (one beat delay)
    HeroActivation = 4,
}

/// Event that may move an ability phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbilityTrigger {
    /// A command was completed
    CommandCompleted,
    /// Hero mode was requested
    HeroTriggered,
    /// Activation beat reached
    ActivationReached,
    /// Activation range ended
    ExecutionEnded,
    /// Chain broken, failure or engine reset
    Reset,
}

impl AbilityPhase {
    /// Transition table. `None` means the trigger does not apply in this phase.
    pub fn transition(self, trigger: AbilityTrigger) -> Option<AbilityPhase> {
        use AbilityPhase as P;
        use AbilityTrigger as T;

        match (self, trigger) {
            (_, T::Reset) => Some(P::None),
            (P::None | P::Active | P::Chaining, T::CommandCompleted) => Some(P::WillBeActive),
            (P::None | P::WillBeActive | P::Active | P::Chaining, T::HeroTriggered) => {
                Some(P::HeroActivation)
            }
            (P::WillBeActive | P::HeroActivation, T::ActivationReached) => Some(P::Active),
            (P::Active, T::ExecutionEnded) => Some(P::Chaining),
            _ => None,
        }
    }

    /// Ability is executing or carrying over.
    #[inline]
    pub fn is_active_or_chaining(self) -> bool {
        matches!(self, AbilityPhase::Active | AbilityPhase::Chaining)
    }
}

/// Ability state of one engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityState {
    /// Current phase
    pub phase: AbilityPhase,
    /// Combo chain at the time the command completed
    pub combo: u32,
    /// Hero mode is on
    pub hero_mode: bool,
    /// Imperfect pressures entered while hero mode is on
    pub hero_mode_imperfect_count: u32,
    /// Bumped on every phase change
    pub update_version: u32,
    /// Bumped every time the ability becomes active
    pub activation_version: u32,
}

impl AbilityState {
    /// Apply a trigger. Returns true if the phase changed.
    pub fn apply(&mut self, trigger: AbilityTrigger) -> bool {
        let Some(next) = self.phase.transition(trigger) else {
            return false;
        };
        if next == self.phase {
            return false;
        }
        if next == AbilityPhase::Active {
            self.activation_version = self.activation_version.wrapping_add(1);
        }
        self.phase = next;
        self.update_version = self.update_version.wrapping_add(1);
        true
    }

    /// Count an imperfect pressure. Returns true if hero mode just ended.
    pub fn record_imperfect(&mut self) -> bool {
        if !self.hero_mode {
            return false;
        }
        self.hero_mode_imperfect_count += 1;
        if self.hero_mode_imperfect_count > HERO_MODE_MAX_IMPERFECT {
            self.end_hero_mode();
            return true;
        }
        false
    }

    /// Turn hero mode on.
    pub fn start_hero_mode(&mut self) {
        self.hero_mode = true;
        self.hero_mode_imperfect_count = 0;
    }

    /// Turn hero mode off.
    pub fn end_hero_mode(&mut self) {
        self.hero_mode = false;
        self.hero_mode_imperfect_count = 0;
    }

    /// Back to `None`, hero mode off.
    pub fn reset(&mut self) {
        self.apply(AbilityTrigger::Reset);
        self.combo = 0;
        self.end_hero_mode();
    }
}

/// Commands an engine may bind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityCommands {
    /// Command used for chaining
    pub chaining: Option<CommandId>,
    /// Combo commands, excluding the chaining command
    pub combos: Vec<CommandId>,
    /// Extra commands unlocked while hero mode is on
    pub hero_mode_allowed: Vec<CommandId>,
}

impl AbilityCommands {
    /// Whether `command` may be bound. An unconfigured set allows everything.
    pub fn allows(&self, command: CommandId, hero_mode: bool) -> bool {
        if self.chaining.is_none() && self.combos.is_empty() && self.hero_mode_allowed.is_empty() {
            return true;
        }
        self.chaining == Some(command)
            || self.combos.contains(&command)
            || (hero_mode && self.hero_mode_allowed.contains(&command))
    }
}
