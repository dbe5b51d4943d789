//! Command Definitions
//!
//! Rhythm commands are ordered `(beat offset, key)` sequences. Definitions are
//! interned in a process-wide registry: identical sequences share one
//! [`CommandId`], and a definition is never freed once registered.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use serde::{Serialize, Deserialize};

use crate::config::ConfigError;

// =============================================================================
// KEYS
// =============================================================================

/// Drum key pressed by the player.
///
/// Discriminants match the wire encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum RhythmKey {
    /// Square drum
    Pata = 1,
    /// Circle drum
    Pon = 2,
    /// Cross drum
    Don = 3,
    /// Triangle drum
    Chaka = 4,
}

impl RhythmKey {
    /// Wire value of this key.
    #[inline]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Get key from its wire value.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(RhythmKey::Pata),
            2 => Some(RhythmKey::Pon),
            3 => Some(RhythmKey::Don),
            4 => Some(RhythmKey::Chaka),
            _ => None,
        }
    }
}

// =============================================================================
// DEFINITIONS
// =============================================================================

/// One expected press inside a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandStep {
    /// Beat offset relative to the first press of the command.
    pub beat_offset: i32,
    /// Key that must be pressed.
    pub key: RhythmKey,
}

impl CommandStep {
    /// Create a step.
    pub const fn new(beat_offset: i32, key: RhythmKey) -> Self {
        Self { beat_offset, key }
    }
}

/// Opaque handle to an interned command definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommandId(pub u32);

/// Immutable command definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDefinition {
    /// Handle of this definition in its registry.
    pub id: CommandId,
    /// Ordered steps. First offset is always 0.
    steps: Vec<CommandStep>,
}

impl CommandDefinition {
    /// Ordered steps.
    #[inline]
    pub fn steps(&self) -> &[CommandStep] {
        &self.steps
    }

    /// Number of presses.
    #[inline]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Number of beats the command spans (and executes for).
    ///
    /// Never zero, so an empty command still occupies one beat.
    pub fn beat_length(&self) -> i32 {
        self.steps
            .last()
            .map(|s| s.beat_offset + 1)
            .unwrap_or(1)
    }
}

/// Check a step list before it is interned.
pub fn validate_steps(steps: &[CommandStep]) -> Result<(), ConfigError> {
    if let Some(first) = steps.first() {
        if first.beat_offset != 0 {
            return Err(ConfigError::FirstStepOffset(first.beat_offset));
        }
    }
    for pair in steps.windows(2) {
        if pair[1].beat_offset <= pair[0].beat_offset {
            return Err(ConfigError::UnorderedSteps {
                previous: pair[0].beat_offset,
                next: pair[1].beat_offset,
            });
        }
    }
    Ok(())
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Default)]
struct RegistryInner {
    definitions: Vec<Arc<CommandDefinition>>,
    by_steps: HashMap<Vec<CommandStep>, CommandId>,
}

/// Append-only, content-addressed command registry.
///
/// Reads take a shared lock. Inserts go through an upgradable read so two
/// engines registering the same sequence concurrently always end up with the
/// same id.
#[derive(Default)]
pub struct CommandRegistry {
    inner: RwLock<RegistryInner>,
}

impl CommandRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id for `steps`, registering it if it is new.
    pub fn get_or_create(&self, steps: &[CommandStep]) -> Result<CommandId, ConfigError> {
        validate_steps(steps)?;

        let inner = self.inner.upgradable_read();
        if let Some(id) = inner.by_steps.get(steps) {
            return Ok(*id);
        }

        let mut inner = RwLockUpgradableReadGuard::upgrade(inner);
        let id = CommandId(inner.definitions.len() as u32);
        inner.definitions.push(Arc::new(CommandDefinition {
            id,
            steps: steps.to_vec(),
        }));
        inner.by_steps.insert(steps.to_vec(), id);
        Ok(id)
    }

    /// Look up a definition by id.
    pub fn get(&self, id: CommandId) -> Option<Arc<CommandDefinition>> {
        self.inner.read().definitions.get(id.0 as usize).cloned()
    }

    /// Find an already registered sequence.
    pub fn find(&self, steps: &[CommandStep]) -> Option<CommandId> {
        self.inner.read().by_steps.get(steps).copied()
    }

    /// Number of distinct definitions.
    pub fn len(&self) -> usize {
        self.inner.read().definitions.len()
    }

    /// Whether no definition was registered yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
