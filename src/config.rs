//! Configuration
//!
//! Server settings come from the environment, song settings (beat interval,
//! song length and the command set) from a JSON file. Everything in here is
//! validated once at load; a `ConfigError` is fatal.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Serialize, Deserialize};

use crate::core::clock::EngineSettings;
use crate::game::ability::AbilityCommands;
use crate::game::command::{CommandId, CommandRegistry, CommandStep, RhythmKey};

// =============================================================================
// ERRORS
// =============================================================================

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Beat interval must be strictly positive.
    #[error("Invalid beat interval: {0} ms")]
    InvalidBeatInterval(i64),

    /// Song length cannot be negative.
    #[error("Invalid max beat: {0}")]
    InvalidMaxBeat(i32),

    /// First step of a command must sit on offset 0.
    #[error("First step must have offset 0, got {0}")]
    FirstStepOffset(i32),

    /// Step offsets must be strictly increasing.
    #[error("Step offsets must increase: {previous} then {next}")]
    UnorderedSteps {
        /// Offset of the earlier step
        previous: i32,
        /// Offset of the later step
        next: i32,
    },

    /// A command name was declared twice.
    #[error("Duplicate command name: {0}")]
    DuplicateCommand(String),

    /// A command name is referenced but never declared.
    #[error("Unknown command name: {0}")]
    UnknownCommand(String),

    /// Environment variable could not be parsed.
    #[error("Invalid value for {name}: {value}")]
    InvalidEnv {
        /// Variable name
        name: &'static str,
        /// Raw value
        value: String,
    },

    /// Song file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Song file is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// SERVER CONFIG
// =============================================================================

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connection timeout.
    pub connection_timeout: Duration,
    /// How often the server times a round trip to each client.
    pub rtt_ping_interval: Duration,
    /// Tick rate for the engine simulation (Hz).
    pub tick_rate: u32,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Optional song file, built-in song when unset.
    pub song_path: Option<String>,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            connection_timeout: Duration::from_secs(30),
            rtt_ping_interval: Duration::from_secs(2),
            tick_rate: crate::TICK_RATE,
            log_filter: "info".to_string(),
            song_path: None,
            version: crate::VERSION.to_string(),
        }
    }
}

impl ServerConfig {
    /// Build from `RHYTHM_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("RHYTHM_BIND_ADDR") {
            config.bind_addr = parse_env("RHYTHM_BIND_ADDR", value)?;
        }
        if let Some(value) = lookup("RHYTHM_TICK_RATE") {
            let rate: u32 = parse_env("RHYTHM_TICK_RATE", value.clone())?;
            if rate == 0 {
                return Err(ConfigError::InvalidEnv { name: "RHYTHM_TICK_RATE", value });
            }
            config.tick_rate = rate;
        }
        if let Some(value) = lookup("RHYTHM_MAX_CONNECTIONS") {
            config.max_connections = parse_env("RHYTHM_MAX_CONNECTIONS", value)?;
        }
        if let Some(value) = lookup("RHYTHM_LOG") {
            config.log_filter = value;
        }
        config.song_path = lookup("RHYTHM_SONG").filter(|p| !p.is_empty());

        Ok(config)
    }

    /// Duration of one simulation tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_rate.max(1) as u64)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { name, value })
}

// =============================================================================
// SONG CONFIG
// =============================================================================

/// Named command in a song file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCommand {
    /// Name used by clients to bind the command
    pub name: String,
    /// Ordered steps
    pub steps: Vec<CommandStep>,
}

/// Song file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongConfig {
    /// Duration of one beat in milliseconds
    pub beat_interval_ms: i64,
    /// Song length in beats, 0 = unbounded
    #[serde(default)]
    pub max_beat: i32,
    /// Every command of the song
    pub commands: Vec<NamedCommand>,
    /// Command used for chaining
    #[serde(default)]
    pub chaining: Option<String>,
    /// Combo commands
    #[serde(default)]
    pub combos: Vec<String>,
    /// Commands unlocked by hero mode
    #[serde(default)]
    pub hero_mode_commands: Vec<String>,
}

/// Song after validation and registration.
#[derive(Debug, Clone)]
pub struct RegisteredSong {
    /// Clock settings shared by every engine of the song
    pub settings: EngineSettings,
    /// Command ids by name
    pub commands: BTreeMap<String, CommandId>,
    /// Commands engines may bind
    pub ability_commands: AbilityCommands,
}

impl RegisteredSong {
    /// Look up a command id by name.
    pub fn command(&self, name: &str) -> Option<CommandId> {
        self.commands.get(name).copied()
    }

    /// Name of a registered command.
    pub fn command_name(&self, id: CommandId) -> Option<&str> {
        self.commands
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.as_str())
    }
}

impl SongConfig {
    /// Parse a song from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a song file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Validate the song and intern its commands.
    pub fn register(&self, registry: &CommandRegistry) -> Result<RegisteredSong, ConfigError> {
        let settings = EngineSettings::new(self.beat_interval_ms, self.max_beat)?;

        let mut commands = BTreeMap::new();
        for command in &self.commands {
            if commands.contains_key(&command.name) {
                return Err(ConfigError::DuplicateCommand(command.name.clone()));
            }
            let id = registry.get_or_create(&command.steps)?;
            commands.insert(command.name.clone(), id);
        }

        let resolve = |name: &String| {
            commands
                .get(name)
                .copied()
                .ok_or_else(|| ConfigError::UnknownCommand(name.clone()))
        };

        let ability_commands = AbilityCommands {
            chaining: self.chaining.as_ref().map(resolve).transpose()?,
            combos: self.combos.iter().map(resolve).collect::<Result<_, _>>()?,
            hero_mode_allowed: self
                .hero_mode_commands
                .iter()
                .map(resolve)
                .collect::<Result<_, _>>()?,
        };

        Ok(RegisteredSong {
            settings,
            commands,
            ability_commands,
        })
    }
}

impl Default for SongConfig {
    /// Built-in song: 120 BPM, the classic four-beat drum commands.
    fn default() -> Self {
        use RhythmKey::{Chaka, Don, Pata, Pon};

        let command = |name: &str, keys: [RhythmKey; 4]| NamedCommand {
            name: name.to_string(),
            steps: keys
                .iter()
                .enumerate()
                .map(|(i, key)| CommandStep::new(i as i32, *key))
                .collect(),
        };

        Self {
            beat_interval_ms: 500,
            max_beat: 0,
            commands: vec![
                command("march", [Pata, Pata, Pata, Pon]),
                command("attack", [Pon, Pon, Pata, Pon]),
                command("defend", [Chaka, Chaka, Pata, Pon]),
                command("retreat", [Pon, Pata, Pon, Pata]),
                command("charge", [Pon, Pon, Chaka, Chaka]),
                command("summon", [Don, Don, Don, Don]),
            ],
            chaining: Some("march".to_string()),
            combos: vec![
                "attack".to_string(),
                "defend".to_string(),
                "retreat".to_string(),
                "charge".to_string(),
            ],
            hero_mode_commands: vec!["summon".to_string()],
        }
    }
}
