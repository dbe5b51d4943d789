//! Rhythm Engine Server
//!
//! Authoritative rhythm server. Runs the WebSocket server by default;
//! `--demo` plays a scripted song offline and checks tick determinism.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rhythm_engine::{
    TICK_RATE, VERSION,
    config::{RegisteredSong, ServerConfig, SongConfig},
    game::{
        command::{CommandRegistry, RhythmKey},
        engine::EngineId,
        events::EngineEventData,
        matcher::PressureInput,
        tick::{tick, tick_sequential, EngineInputs, EngineWorld},
    },
    network::{GameServer, RhythmSession},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("Invalid server configuration")?;

    // Initialize logging, RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Rhythm Engine Server v{}", VERSION);
    info!("Tick Rate: {} Hz", config.tick_rate);

    let song = match &config.song_path {
        Some(path) => SongConfig::load(path).with_context(|| format!("Failed to load song {}", path))?,
        None => SongConfig::default(),
    };
    let registry = Arc::new(CommandRegistry::new());
    let registered = song.register(&registry).context("Invalid song")?;
    info!(
        "Song: {} ms per beat, {} commands",
        registered.settings.beat_interval_ms(),
        registered.commands.len()
    );

    if std::env::args().any(|arg| arg == "--demo") {
        demo_song(&registry, &registered);
        return Ok(());
    }

    let session = RhythmSession::new(registry, registered, config.max_connections);
    let server = Arc::new(GameServer::new(config, session));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_server.shutdown();
        }
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}

/// Play four engines through a scripted song, in parallel and sequentially.
fn demo_song(registry: &CommandRegistry, song: &RegisteredSong) {
    info!("=== Starting Demo Song ===");

    let Some(march) = song.command("march") else {
        warn!("Song has no march command, nothing to play");
        return;
    };
    let keys: Vec<RhythmKey> = registry
        .get(march)
        .map(|def| def.steps().iter().map(|s| s.key).collect())
        .unwrap_or_default();
    let pattern_len = keys.len() as i32;

    let mut world = EngineWorld::new();
    for _ in 0..4 {
        let (id, _) = world.spawn_engine(song.settings, song.ability_commands.clone());
        if let Some(engine) = world.engine_mut(id) {
            if let Err(e) = engine.bind_command(registry, march) {
                warn!("Engine {} cannot bind march: {}", id.0, e);
            }
        }
    }
    let mut replay = world.clone();

    let delta_ms = (1000 / TICK_RATE) as i64;
    let ticks = 64 * song.settings.beat_interval_ms() / delta_ms;
    let mut last_beat: BTreeMap<EngineId, i32> = BTreeMap::new();
    let mut completed = 0;
    let mut failed = 0;

    info!("Running {} ticks...", ticks);

    for _ in 0..ticks {
        // Press the pattern on the first tick of each beat, rest while it executes
        let mut inputs = EngineInputs::new();
        for engine in world.engines() {
            if !engine.phase().is_running() {
                continue;
            }
            let beat = engine.current_beat();
            if last_beat.insert(engine.id(), beat) == Some(beat) {
                continue;
            }
            let cycle = beat % (pattern_len * 2);
            if cycle >= pattern_len {
                continue;
            }
            let mut key = keys[cycle as usize];
            // Engine 3 misses its third key every time
            if engine.id() == EngineId(3) && cycle == 2 {
                key = RhythmKey::Chaka;
            }
            inputs
                .entry(engine.id())
                .or_default()
                .push(PressureInput::new(key, engine.flow_beat(), engine.score()));
        }

        let result = tick(&mut world, registry, &inputs, delta_ms);
        tick_sequential(&mut replay, registry, &inputs, delta_ms);

        for event in &result.events {
            match &event.data {
                EngineEventData::CommandCompleted { power, chain, .. } => {
                    completed += 1;
                    info!("Engine {} completed march (power {}, chain {})", event.engine_id.0, power, chain);
                }
                EngineEventData::CommandFailed { reason, .. } => {
                    failed += 1;
                    info!("Engine {} failed: {:?}", event.engine_id.0, reason);
                }
                EngineEventData::FeverStarted { chain } => {
                    info!("Engine {} entered fever at chain {}", event.engine_id.0, chain);
                }
                _ => {}
            }
        }
    }

    info!("=== Demo Results ===");
    for engine in world.engines() {
        let combo = engine.combo();
        info!(
            "Engine {}: chain {}, fever {}, jinn {}",
            engine.id().0,
            combo.chain,
            combo.is_fever,
            combo.jinn_energy
        );
    }
    info!("Completed: {}, failed: {}", completed, failed);

    // Verify determinism of the parallel tick
    let hash = world.compute_hash();
    let replay_hash = replay.compute_hash();
    info!("Parallel State Hash: {}", hex::encode(hash));
    info!("Sequential State Hash: {}", hex::encode(replay_hash));

    if hash == replay_hash {
        info!("DETERMINISM VERIFIED: Hashes match!");
    } else {
        warn!("DETERMINISM FAILURE: Hashes differ!");
    }
}
