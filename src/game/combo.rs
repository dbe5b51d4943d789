//! Combo, Fever and Jinn Energy
//!
//! Bookkeeping for consecutive successful commands. Fever grants stat bonuses
//! to the units; full jinn energy unlocks hero mode.

use serde::{Serialize, Deserialize};

/// Minimum chain before fever can start.
pub const FEVER_MIN_CHAIN: u32 = 3;

/// Fever score needed once the chain is long enough.
pub const FEVER_SCORE_THRESHOLD: u32 = 50;

/// Chain length that starts fever regardless of score.
pub const FEVER_FORCED_CHAIN: u32 = 10;

/// Energy granted by one perfect pressure.
pub const JINN_ENERGY_PER_PERFECT: u32 = 20;

/// Energy cap; reaching it makes hero mode available.
pub const JINN_ENERGY_MAX: u32 = 100;

/// Combo state of one engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComboState {
    /// Consecutive successful commands
    pub chain: u32,
    /// Fever progress, grows with command power
    pub score: u32,
    /// Fever is active
    pub is_fever: bool,
    /// Last command had full power
    pub is_perfect: bool,
    /// Jinn energy, `0..=JINN_ENERGY_MAX`
    pub jinn_energy: u32,
}

impl ComboState {
    /// Record a completed command. Returns true if fever just started.
    pub fn on_command_success(&mut self, power: u8) -> bool {
        self.chain = self.chain.saturating_add(1);
        self.score = self.score.saturating_add(power as u32 / 4);
        self.is_perfect = power >= 100;

        let was_fever = self.is_fever;
        if !self.is_fever {
            self.is_fever = (self.chain >= FEVER_MIN_CHAIN && self.score >= FEVER_SCORE_THRESHOLD)
                || self.chain >= FEVER_FORCED_CHAIN;
        }
        self.is_fever && !was_fever
    }

    /// Credit one perfect pressure.
    pub fn add_jinn_energy(&mut self, amount: u32) {
        self.jinn_energy = (self.jinn_energy + amount).min(JINN_ENERGY_MAX);
    }

    /// Whether enough energy was stored for hero mode.
    #[inline]
    pub fn jinn_energy_full(&self) -> bool {
        self.jinn_energy >= JINN_ENERGY_MAX
    }

    /// Spend all stored energy (on hero activation).
    pub fn consume_jinn_energy(&mut self) {
        self.jinn_energy = 0;
    }

    /// Break the chain. Jinn energy survives a broken chain.
    pub fn reset_chain(&mut self) {
        self.chain = 0;
        self.score = 0;
        self.is_fever = false;
        self.is_perfect = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fever_after_three_perfect_commands() {
        let mut combo = ComboState::default();
        assert!(!combo.on_command_success(100));
        assert!(!combo.on_command_success(100));
        assert!(combo.on_command_success(100));
        assert!(combo.is_fever);
        assert!(combo.is_perfect);
    }

    #[test]
    fn test_forced_fever_on_long_chain() {
        let mut combo = ComboState::default();
        for _ in 0..9 {
            combo.on_command_success(0);
        }
        assert!(!combo.is_fever);
        assert!(combo.on_command_success(0));
    }

    #[test]
    fn test_reset_keeps_energy() {
        let mut combo = ComboState::default();
        combo.on_command_success(100);
        combo.add_jinn_energy(JINN_ENERGY_PER_PERFECT);
        combo.reset_chain();

        assert_eq!(combo.chain, 0);
        assert!(!combo.is_fever);
        assert_eq!(combo.jinn_energy, JINN_ENERGY_PER_PERFECT);
    }

    #[test]
    fn test_energy_is_capped() {
        let mut combo = ComboState::default();
        for _ in 0..10 {
            combo.add_jinn_energy(JINN_ENERGY_PER_PERFECT);
        }
        assert_eq!(combo.jinn_energy, JINN_ENERGY_MAX);
        assert!(combo.jinn_energy_full());
    }
}
