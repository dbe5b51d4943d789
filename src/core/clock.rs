//! Beat Clock
//!
//! Converts elapsed engine time into beats, beat phase and pressure score.
//! Every function here is pure: integer milliseconds in, beat data out.

use serde::{Serialize, Deserialize};
use crate::config::ConfigError;

// =============================================================================
// PURE CLOCK FUNCTIONS
// =============================================================================

/// Beat index for an elapsed time.
///
/// Floor division. A negative elapsed time is a transient state (the engine
/// has not started yet) and maps to beat 0.
#[inline]
pub fn get_beat(elapsed_ms: i64, interval_ms: i64) -> i32 {
    if elapsed_ms <= 0 || interval_ms <= 0 {
        return 0;
    }
    (elapsed_ms / interval_ms) as i32
}

/// Position inside the current beat, in `[0, 1)`.
#[inline]
pub fn get_phase(elapsed_ms: i64, interval_ms: i64) -> f32 {
    if interval_ms <= 0 {
        return 0.0;
    }
    elapsed_ms.rem_euclid(interval_ms) as f32 / interval_ms as f32
}

/// Signed distance from the nearest beat boundary, normalized by the interval.
///
/// `0.0` is exactly on the beat. Negative values are early (the next beat is
/// closer), positive values are late. The magnitude reaches `0.5` exactly
/// halfway between two beats.
#[inline]
pub fn get_score(elapsed_ms: i64, interval_ms: i64) -> f32 {
    if interval_ms <= 0 {
        return 0.0;
    }
    let delta = elapsed_ms.rem_euclid(interval_ms);
    let corrected = if delta * 2 > interval_ms {
        delta - interval_ms
    } else {
        delta
    };
    corrected as f32 / interval_ms as f32
}

/// Index of the nearest beat boundary.
///
/// This is the beat a pressure is credited to; `get_score` is relative to it.
#[inline]
pub fn get_flow_beat(elapsed_ms: i64, interval_ms: i64) -> i32 {
    if interval_ms <= 0 {
        return 0;
    }
    get_beat(elapsed_ms + interval_ms / 2, interval_ms)
}

// =============================================================================
// ENGINE SETTINGS
// =============================================================================

/// Immutable per-engine clock configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Duration of one beat in milliseconds (always > 0).
    beat_interval_ms: i64,
    /// Song length in beats. 0 = unbounded.
    max_beat: i32,
}

impl EngineSettings {
    /// Validate and build settings.
    pub fn new(beat_interval_ms: i64, max_beat: i32) -> Result<Self, ConfigError> {
        if beat_interval_ms <= 0 {
            return Err(ConfigError::InvalidBeatInterval(beat_interval_ms));
        }
        if max_beat < 0 {
            return Err(ConfigError::InvalidMaxBeat(max_beat));
        }
        Ok(Self { beat_interval_ms, max_beat })
    }

    /// Beat interval in milliseconds.
    #[inline]
    pub fn beat_interval_ms(&self) -> i64 {
        self.beat_interval_ms
    }

    /// Song length in beats (0 = unbounded).
    #[inline]
    pub fn max_beat(&self) -> i32 {
        self.max_beat
    }

    /// Whether `beat` is past the end of the song.
    #[inline]
    pub fn is_song_over(&self, beat: i32) -> bool {
        self.max_beat > 0 && beat >= self.max_beat
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            beat_interval_ms: 500,
            max_beat: 0,
        }
    }
}

// =============================================================================
// ENGINE PROCESS
// =============================================================================

/// Mutable clock state of one engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineProcess {
    /// Milliseconds since the engine started.
    pub elapsed_ms: i64,
}

impl EngineProcess {
    /// Advance the clock. Returns true if a new beat started.
    pub fn advance(&mut self, delta_ms: i64, settings: &EngineSettings) -> bool {
        let before = self.beat(settings);
        let was_started = self.elapsed_ms > 0;
        self.elapsed_ms = self.elapsed_ms.saturating_add(delta_ms);
        let after = self.beat(settings);
        after != before || (!was_started && self.elapsed_ms > 0)
    }

    /// Current beat index.
    #[inline]
    pub fn beat(&self, settings: &EngineSettings) -> i32 {
        get_beat(self.elapsed_ms, settings.beat_interval_ms)
    }

    /// Current phase inside the beat.
    #[inline]
    pub fn phase(&self, settings: &EngineSettings) -> f32 {
        get_phase(self.elapsed_ms, settings.beat_interval_ms)
    }

    /// Score a pressure would get right now.
    #[inline]
    pub fn score(&self, settings: &EngineSettings) -> f32 {
        get_score(self.elapsed_ms, settings.beat_interval_ms)
    }

    /// Beat a pressure would be credited to right now.
    #[inline]
    pub fn flow_beat(&self, settings: &EngineSettings) -> i32 {
        get_flow_beat(self.elapsed_ms, settings.beat_interval_ms)
    }
}
