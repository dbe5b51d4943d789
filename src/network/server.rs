//! WebSocket Game Server
//!
//! Async WebSocket server for the rhythm session.
//! Binary frames carry pressure RPCs, text frames carry JSON control messages.
//! A fixed-rate tick loop drives the session and pushes the results back.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, sleep_until, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ServerConfig;
use crate::game::engine::PlayerId;
use crate::network::protocol::{ClientMessage, ErrorCode, ServerError, ServerMessage};
use crate::network::session::{ConnectionId, RhythmSession, SessionError};

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// The session every client plays in.
    session: Arc<RwLock<RhythmSession>>,
    /// Connected clients and their remote addresses.
    clients: Arc<RwLock<BTreeMap<ConnectionId, SocketAddr>>>,
    /// Connection id allocator.
    next_connection: Arc<AtomicU64>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl GameServer {
    /// Create a new game server around a session.
    pub fn new(config: ServerConfig, session: RhythmSession) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            session: Arc::new(RwLock::new(session)),
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            next_connection: Arc::new(AtomicU64::new(1)),
            shutdown_tx,
        }
    }

    /// Shared session handle.
    pub fn session(&self) -> Arc<RwLock<RhythmSession>> {
        self.session.clone()
    }

    /// Run the server until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Rhythm server listening on {}", self.config.bind_addr);

        let tick_session = self.session.clone();
        let tick_config = self.config.clone();
        let tick_shutdown = self.shutdown_tx.subscribe();
        let tick_handle = tokio::spawn(async move {
            Self::run_tick_loop(tick_session, tick_config, tick_shutdown).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        tick_handle.abort();
        for (id, addr) in self.clients.read().await.iter() {
            debug!("Closing {:?} ({})", id, addr);
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let session = self.session.clone();
        let timeout = self.config.connection_timeout;
        let ping_every = self.config.rtt_ping_interval;
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            // Register client
            session.write().await.open_connection(id, msg_tx.clone());
            clients.write().await.insert(id, addr);

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            let mut last_activity = Instant::now();
            let mut ping_timer = interval(ping_every);
            ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            // Handle incoming messages
            loop {
                let idle_deadline = tokio::time::Instant::from_std(last_activity + timeout);

                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                // Malformed packets are logged by the session and dropped
                                let _ = session.write().await.receive_rpc(id, &data);
                            }
                            Some(Ok(Message::Text(text))) => {
                                match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => {
                                        Self::handle_client_message(id, client_msg, &session, &msg_tx).await;
                                    }
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::Error(ServerError::new(
                                            ErrorCode::InvalidInput,
                                            "Invalid message format",
                                        ))).await;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }

                        last_activity = Instant::now();
                    }
                    _ = ping_timer.tick() => {
                        // Round trips are only ever timed on this side
                        if let Some(nonce) = session.write().await.begin_rtt_ping(id) {
                            let _ = msg_tx.try_send(ServerMessage::LatencyPing { nonce });
                        }
                    }
                    _ = sleep_until(idle_deadline) => {
                        info!("Client {} idle for {:?}, closing", addr, timeout);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Cleanup
            session.write().await.close_connection(id);
            clients.write().await.remove(&id);
            // Let queued messages (shutdown notice included) drain
            drop(msg_tx);
            let _ = sender_task.await;

            info!("Client {} cleaned up", addr);
        });
    }

    /// Handle a control message.
    async fn handle_client_message(
        id: ConnectionId,
        msg: ClientMessage,
        session: &Arc<RwLock<RhythmSession>>,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let reply = match msg {
            ClientMessage::Join { player_id } => {
                let player = match player_id.as_deref().map(PlayerId::from_uuid_str) {
                    Some(None) => {
                        let _ = sender.send(ServerMessage::Error(ServerError::new(
                            ErrorCode::InvalidInput,
                            "Invalid player id",
                        ))).await;
                        return;
                    }
                    Some(Some(player)) => Some(player),
                    None => None,
                };
                match session.write().await.join(id, player) {
                    Ok(info) => Some(ServerMessage::Joined(info)),
                    Err(e) => Some(Self::error_message(&e)),
                }
            }
            ClientMessage::BindCommand { command } => {
                session.write().await
                    .bind_command(id, &command)
                    .err()
                    .map(|e| Self::error_message(&e))
            }
            ClientMessage::TriggerHero => {
                session.write().await
                    .trigger_hero(id)
                    .err()
                    .map(|e| Self::error_message(&e))
            }
            ClientMessage::Ping { timestamp } => Some(ServerMessage::Pong {
                timestamp,
                server_time: now_millis(),
            }),
            ClientMessage::LatencyReply { nonce } => {
                session.write().await.complete_rtt_ping(id, nonce);
                None
            }
            ClientMessage::Leave => {
                session.write().await
                    .leave(id)
                    .err()
                    .map(|e| Self::error_message(&e))
            }
        };

        if let Some(reply) = reply {
            let _ = sender.send(reply).await;
        }
    }

    fn error_message(err: &SessionError) -> ServerMessage {
        ServerMessage::Error(ServerError::new(err.code(), err.to_string()))
    }

    /// Run the session at the configured tick rate.
    ///
    /// The clock advances by wall time; sub-millisecond remainders carry over
    /// so the song never drifts.
    async fn run_tick_loop(
        session: Arc<RwLock<RhythmSession>>,
        config: ServerConfig,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut tick_interval = interval(config.tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last = Instant::now();
        let mut carry_us: u128 = 0;

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {}
                _ = shutdown_rx.recv() => break,
            }

            let now = Instant::now();
            carry_us += now.duration_since(last).as_micros();
            last = now;
            let delta_ms = (carry_us / 1000) as i64;
            carry_us %= 1000;

            let mut s = session.write().await;
            let result = s.run_tick(delta_ms);
            s.publish_tick(&result);

            trace!(
                tick = result.result.tick,
                delta_ms,
                hash = %hex::encode(&result.hash[..8]),
                "session tick"
            );
            if !result.result.events.is_empty() {
                debug!(
                    "Tick {}: {} events, {} pressures applied",
                    result.result.tick,
                    result.result.events.len(),
                    result.report.accepted
                );
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }
}
