//! Command Sequence Matcher
//!
//! Walks a cursor through a command's steps as pressures arrive and turns
//! each pressure into a verdict: ignored, progress, completed or failed.
//! Gameplay failures are values, never errors.

use serde::{Serialize, Deserialize};

use crate::core::hash::StateHasher;
use crate::game::command::{CommandDefinition, CommandId, RhythmKey};

/// Largest `|score|` still counted as perfect (inclusive).
pub const PERFECT_THRESHOLD: f32 = 0.15;

/// Largest `|score|` still counted as a hit (inclusive).
pub const ERROR_THRESHOLD: f32 = 0.42;

/// Credit units per step for a perfect press. A good press earns half.
const PERFECT_CREDIT: u32 = 2;

// =============================================================================
// RANKS
// =============================================================================

/// Timing rank of a single pressure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PressureRank {
    /// Rank 0: within `PERFECT_THRESHOLD`
    Perfect = 0,
    /// Rank 1: within `ERROR_THRESHOLD`
    Good = 1,
    /// Rank 2: outside `ERROR_THRESHOLD`, always fails the command
    Miss = 2,
}

impl PressureRank {
    /// Credit units earned by this rank.
    #[inline]
    fn credit(self) -> u32 {
        match self {
            PressureRank::Perfect => PERFECT_CREDIT,
            PressureRank::Good => 1,
            PressureRank::Miss => 0,
        }
    }
}

/// Rank a signed score.
///
/// NaN never compares as in range and ranks as a miss.
#[inline]
pub fn classify(score: f32) -> PressureRank {
    let abs = score.abs();
    if abs <= PERFECT_THRESHOLD {
        PressureRank::Perfect
    } else if abs <= ERROR_THRESHOLD {
        PressureRank::Good
    } else {
        PressureRank::Miss
    }
}

// =============================================================================
// INPUT & VERDICTS
// =============================================================================

/// A pressure as seen by the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PressureInput {
    /// Key pressed
    pub key: RhythmKey,
    /// Beat the pressure is credited to
    pub flow_beat: i32,
    /// Signed distance from that beat, see `core::clock::get_score`
    pub score: f32,
}

impl PressureInput {
    /// Create a pressure.
    pub const fn new(key: RhythmKey, flow_beat: i32, score: f32) -> Self {
        Self { key, flow_beat, score }
    }
}

/// Why a command attempt failed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum FailReason {
    /// Key differs from the step at the cursor
    WrongKey { expected: RhythmKey, got: RhythmKey },
    /// Pressure landed on a different beat than the step expects
    OffBeat { expected_beat: i32, flow_beat: i32 },
    /// Pressure was outside the error window
    Mistimed { score: f32 },
    /// Pressure arrived while the previous command was executing
    InputDuringExecution { flow_beat: i32 },
}

/// Result of feeding one pressure to the matcher.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum MatchVerdict {
    /// Pressure fell in a recovery window and does not count
    Ignored,
    /// Step matched, more steps remain
    Progress { step: usize, rank: PressureRank },
    /// Last step matched
    Completed { power: u8, rank: PressureRank },
    /// Attempt failed, cursor was reset
    Failed(FailReason),
}

// =============================================================================
// MATCHER
// =============================================================================

/// Cursor over one target command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMatcher {
    target: CommandId,
    cursor: usize,
    start_beat: i32,
    credit: u32,
}

impl CommandMatcher {
    /// Start matching `target` from step 0.
    pub fn new(target: CommandId) -> Self {
        Self {
            target,
            cursor: 0,
            start_beat: 0,
            credit: 0,
        }
    }

    /// Command being matched.
    #[inline]
    pub fn target(&self) -> CommandId {
        self.target
    }

    /// Index of the next expected step.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Whether at least one step has been matched.
    #[inline]
    pub fn in_progress(&self) -> bool {
        self.cursor > 0
    }

    /// Beat at which the current attempt started.
    #[inline]
    pub fn start_beat(&self) -> i32 {
        self.start_beat
    }

    /// Go back to step 0. Never retries automatically.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.start_beat = 0;
        self.credit = 0;
    }

    /// Hash matcher progress.
    pub fn hash_into(&self, hasher: &mut StateHasher) {
        hasher.update_u32(self.target.0);
        hasher.update_u32(self.cursor as u32);
        hasher.update_i32(self.start_beat);
        hasher.update_u32(self.credit);
    }

    /// Power of a command with no steps: trivially perfect.
    pub fn complete_empty(&mut self) -> MatchVerdict {
        self.reset();
        MatchVerdict::Completed {
            power: 100,
            rank: PressureRank::Perfect,
        }
    }

    /// Feed one pressure.
    ///
    /// `definition` must be the definition of `self.target()`.
    pub fn feed(
        &mut self,
        definition: &CommandDefinition,
        input: &PressureInput,
        recovery_activation_beat: i32,
    ) -> MatchVerdict {
        if recovery_activation_beat > input.flow_beat {
            return MatchVerdict::Ignored;
        }

        let steps = definition.steps();
        if steps.is_empty() {
            return self.complete_empty();
        }

        let expected = steps[self.cursor];
        if input.key != expected.key {
            self.reset();
            return MatchVerdict::Failed(FailReason::WrongKey {
                expected: expected.key,
                got: input.key,
            });
        }

        if self.cursor == 0 {
            self.start_beat = input.flow_beat;
        } else {
            let expected_beat = self.start_beat + expected.beat_offset;
            if input.flow_beat != expected_beat {
                self.reset();
                return MatchVerdict::Failed(FailReason::OffBeat {
                    expected_beat,
                    flow_beat: input.flow_beat,
                });
            }
        }

        let rank = classify(input.score);
        if rank == PressureRank::Miss {
            self.reset();
            return MatchVerdict::Failed(FailReason::Mistimed { score: input.score });
        }

        self.credit += rank.credit();
        self.cursor += 1;

        if self.cursor < steps.len() {
            return MatchVerdict::Progress {
                step: self.cursor - 1,
                rank,
            };
        }

        let max_credit = PERFECT_CREDIT * steps.len() as u32;
        let power = (self.credit * 100 / max_credit).min(100) as u8;
        self.reset();
        MatchVerdict::Completed { power, rank }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::command::{CommandRegistry, CommandStep};

    fn march(registry: &CommandRegistry) -> std::sync::Arc<CommandDefinition> {
        let id = registry
            .get_or_create(&[
                CommandStep::new(0, RhythmKey::Pata),
                CommandStep::new(1, RhythmKey::Pata),
                CommandStep::new(2, RhythmKey::Pata),
                CommandStep::new(3, RhythmKey::Pon),
            ])
            .unwrap();
        registry.get(id).unwrap()
    }

    #[test]
    fn test_classify_boundaries() {
        assert_eq!(classify(0.0), PressureRank::Perfect);
        assert_eq!(classify(PERFECT_THRESHOLD), PressureRank::Perfect);
        assert_eq!(classify(-PERFECT_THRESHOLD), PressureRank::Perfect);
        assert_eq!(classify(0.2), PressureRank::Good);
        assert_eq!(classify(ERROR_THRESHOLD), PressureRank::Good);
        assert_eq!(classify(0.43), PressureRank::Miss);
        assert_eq!(classify(f32::NAN), PressureRank::Miss);
    }

    #[test]
    fn test_exact_sequence_is_perfect() {
        let registry = CommandRegistry::new();
        let def = march(&registry);
        let mut matcher = CommandMatcher::new(def.id);

        let keys = [RhythmKey::Pata, RhythmKey::Pata, RhythmKey::Pata, RhythmKey::Pon];
        let mut last = MatchVerdict::Ignored;
        for (beat, key) in keys.iter().enumerate() {
            last = matcher.feed(&def, &PressureInput::new(*key, beat as i32, 0.0), 0);
        }

        assert_eq!(
            last,
            MatchVerdict::Completed { power: 100, rank: PressureRank::Perfect }
        );
        assert_eq!(matcher.cursor(), 0);
    }

    #[test]
    fn test_good_presses_give_partial_power() {
        let registry = CommandRegistry::new();
        let def = march(&registry);
        let mut matcher = CommandMatcher::new(def.id);

        matcher.feed(&def, &PressureInput::new(RhythmKey::Pata, 10, 0.3), 0);
        matcher.feed(&def, &PressureInput::new(RhythmKey::Pata, 11, 0.0), 0);
        matcher.feed(&def, &PressureInput::new(RhythmKey::Pata, 12, -0.3), 0);
        let verdict = matcher.feed(&def, &PressureInput::new(RhythmKey::Pon, 13, 0.0), 0);

        // 2 perfect (4 units) + 2 good (2 units) of 8
        assert_eq!(
            verdict,
            MatchVerdict::Completed { power: 75, rank: PressureRank::Perfect }
        );
    }

    #[test]
    fn test_wrong_key_fails_and_resets() {
        let registry = CommandRegistry::new();
        let def = march(&registry);
        let mut matcher = CommandMatcher::new(def.id);

        matcher.feed(&def, &PressureInput::new(RhythmKey::Pata, 0, 0.0), 0);
        matcher.feed(&def, &PressureInput::new(RhythmKey::Pata, 1, 0.0), 0);
        let verdict = matcher.feed(&def, &PressureInput::new(RhythmKey::Pon, 2, 0.0), 0);

        assert_eq!(
            verdict,
            MatchVerdict::Failed(FailReason::WrongKey {
                expected: RhythmKey::Pata,
                got: RhythmKey::Pon,
            })
        );
        assert!(!matcher.in_progress());
    }

    #[test]
    fn test_skipped_beat_fails() {
        let registry = CommandRegistry::new();
        let def = march(&registry);
        let mut matcher = CommandMatcher::new(def.id);

        matcher.feed(&def, &PressureInput::new(RhythmKey::Pata, 4, 0.0), 0);
        let verdict = matcher.feed(&def, &PressureInput::new(RhythmKey::Pata, 6, 0.0), 0);

        assert_eq!(
            verdict,
            MatchVerdict::Failed(FailReason::OffBeat { expected_beat: 5, flow_beat: 6 })
        );
    }

    #[test]
    fn test_miss_forces_failure() {
        let registry = CommandRegistry::new();
        let def = march(&registry);
        let mut matcher = CommandMatcher::new(def.id);

        let verdict = matcher.feed(&def, &PressureInput::new(RhythmKey::Pata, 0, 0.45), 0);
        assert!(matches!(verdict, MatchVerdict::Failed(FailReason::Mistimed { .. })));
    }

    #[test]
    fn test_recovery_window_ignores_then_accepts() {
        let registry = CommandRegistry::new();
        let def = march(&registry);
        let mut matcher = CommandMatcher::new(def.id);

        let ignored = matcher.feed(&def, &PressureInput::new(RhythmKey::Pata, 5, 0.0), 6);
        assert_eq!(ignored, MatchVerdict::Ignored);
        assert!(!matcher.in_progress());

        let accepted = matcher.feed(&def, &PressureInput::new(RhythmKey::Pata, 6, 0.0), 6);
        assert!(matches!(accepted, MatchVerdict::Progress { step: 0, .. }));
    }

    #[test]
    fn test_empty_command_is_trivially_perfect() {
        let registry = CommandRegistry::new();
        let id = registry.get_or_create(&[]).unwrap();
        let def = registry.get(id).unwrap();
        let mut matcher = CommandMatcher::new(id);

        let verdict = matcher.feed(&def, &PressureInput::new(RhythmKey::Don, 3, 0.3), 0);
        assert_eq!(
            verdict,
            MatchVerdict::Completed { power: 100, rank: PressureRank::Perfect }
        );
    }
}
