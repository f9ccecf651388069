//! WebSocket Arena Server
//!
//! Async WebSocket server tying the pieces together: authentication,
//! the matchmaking queue, per-room driver tasks, and settlement. All
//! match timers (confirmation window, round deadline, battle clock)
//! are owned by the server; clients only ever submit intents and read
//! back authoritative state.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::core::ids::{RoomId, UserId};
use crate::game::events::{RoomBroadcaster, RoomEvent};
use crate::game::queue::MatchQueue;
use crate::game::room::{MatchRules, Room, RoomManager, RoomStatus};
use crate::game::rounds;
use crate::game::settlement::{SettlementEngine, SettlementError, SettlementPolicy};
use crate::ledger::{AccountLedger, LedgerError};
use crate::network::auth::{validate_token, AuthConfig, AuthError};
use crate::network::protocol::{
    AuthRequest, AuthResult, ClientMessage, ErrorCode, ServerError, ServerMessage,
};
use crate::questions::{QuestionSource, OPTION_COUNT};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Match parameters applied to every new room.
    pub rules: MatchRules,
    /// Settlement amounts.
    pub policy: SettlementPolicy,
    /// Token validation settings.
    pub auth: AuthConfig,
    /// Delay between settlement retries after a ledger outage.
    pub settlement_retry: Duration,
    /// How long a terminal room stays readable before being retired.
    pub room_linger: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            max_connections: 1000,
            rules: MatchRules::default(),
            policy: SettlementPolicy::default(),
            auth: AuthConfig::default(),
            settlement_retry: Duration::from_secs(5),
            room_linger: Duration::from_secs(30),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self {
            auth: AuthConfig::from_env(),
            ..Default::default()
        };
        if let Ok(addr) = std::env::var("ARENA_BIND_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.bind_addr = parsed;
            }
        }
        if let Ok(max) = std::env::var("ARENA_MAX_CONNECTIONS") {
            if let Ok(parsed) = max.parse() {
                config.max_connections = parsed;
            }
        }
        config
    }
}

/// Arena server errors.
#[derive(Debug, thiserror::Error)]
pub enum ArenaServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Connected client state.
struct ConnectedClient {
    /// Authenticated identity, set after a successful Auth.
    user_id: Option<UserId>,
    /// Connection time.
    #[allow(dead_code)]
    connected_at: Instant,
    /// Last activity.
    last_activity: Instant,
    /// Message sender (for direct messaging to client).
    sender: mpsc::Sender<ServerMessage>,
    /// Room event sender; subscribed to rooms the user joins.
    events: mpsc::Sender<RoomEvent>,
}

/// State shared by every connection and background task.
struct Shared<L, Q> {
    config: ServerConfig,
    queue: MatchQueue,
    rooms: RoomManager,
    broadcaster: RoomBroadcaster,
    engine: SettlementEngine,
    ledger: L,
    questions: Q,
    clients: RwLock<BTreeMap<SocketAddr, ConnectedClient>>,
}

impl<L, Q> Shared<L, Q> {
    /// The authenticated user behind a connection, if any.
    async fn authed_user(&self, addr: SocketAddr) -> Option<UserId> {
        self.clients
            .read()
            .await
            .get(&addr)
            .and_then(|c| c.user_id)
    }

    /// Look up a connected user's event sender.
    async fn event_sender(&self, user_id: UserId) -> Option<mpsc::Sender<RoomEvent>> {
        self.clients
            .read()
            .await
            .values()
            .find(|c| c.user_id == Some(user_id))
            .map(|c| c.events.clone())
    }

    /// Look up a connected user's message sender.
    async fn message_sender(&self, user_id: UserId) -> Option<mpsc::Sender<ServerMessage>> {
        self.clients
            .read()
            .await
            .values()
            .find(|c| c.user_id == Some(user_id))
            .map(|c| c.sender.clone())
    }
}

async fn send_error(sender: &mpsc::Sender<ServerMessage>, code: ErrorCode, message: impl Into<String>) {
    let _ = sender
        .send(ServerMessage::Error(ServerError::new(code, message)))
        .await;
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The arena server.
pub struct ArenaServer<L, Q> {
    shared: Arc<Shared<L, Q>>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl<L, Q> ArenaServer<L, Q>
where
    L: AccountLedger + 'static,
    Q: QuestionSource + 'static,
{
    /// Create a new arena server.
    pub fn new(config: ServerConfig, ledger: L, questions: Q) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let engine = SettlementEngine::new(config.policy);

        Self {
            shared: Arc::new(Shared {
                config,
                queue: MatchQueue::new(),
                rooms: RoomManager::new(),
                broadcaster: RoomBroadcaster::new(),
                engine,
                ledger,
                questions,
                clients: RwLock::new(BTreeMap::new()),
            }),
            shutdown_tx,
        }
    }

    /// Run the server.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), ArenaServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        info!("Arena server listening on {}", self.shared.config.bind_addr);

        let matchmaking_handle = tokio::spawn(Self::run_matchmaking_loop(self.shared.clone()));
        let cleanup_handle = tokio::spawn(Self::run_cleanup_loop(self.shared.clone()));

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let count = self.shared.clients.read().await.len();
                            if count >= self.shared.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            Self::handle_connection(
                                self.shared.clone(),
                                stream,
                                addr,
                                self.shutdown_tx.subscribe(),
                            );
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

        matchmaking_handle.abort();
        cleanup_handle.abort();

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(
        shared: Arc<Shared<L, Q>>,
        stream: TcpStream,
        addr: SocketAddr,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
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
            let (evt_tx, mut evt_rx) = mpsc::channel::<RoomEvent>(64);

            // Register client
            {
                let mut clients = shared.clients.write().await;
                clients.insert(
                    addr,
                    ConnectedClient {
                        user_id: None,
                        connected_at: Instant::now(),
                        last_activity: Instant::now(),
                        sender: msg_tx.clone(),
                        events: evt_tx,
                    },
                );
            }

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

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        send_error(&msg_tx, ErrorCode::InvalidInput, "Invalid message format").await;
                                        continue;
                                    }
                                };

                                // Update activity
                                {
                                    let mut clients = shared.clients.write().await;
                                    if let Some(client) = clients.get_mut(&addr) {
                                        client.last_activity = Instant::now();
                                    }
                                }

                                Self::handle_client_message(&shared, addr, client_msg, &msg_tx).await;
                            }
                            Some(Ok(Message::Ping(_))) => {
                                let _ = msg_tx.send(ServerMessage::Pong {
                                    timestamp: 0,
                                    server_time: unix_millis(),
                                }).await;
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
                    }
                    // Room events fan in through the per-connection channel.
                    evt = evt_rx.recv() => {
                        match evt {
                            Some(event) => {
                                let _ = msg_tx.send(ServerMessage::Event(event)).await;
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            sender_task.abort();

            // Remove client; drop any queue entry so the user cannot be
            // paired while offline. Live rooms are NOT abandoned: the
            // room driver keeps the match running and the user can
            // reconnect and resync.
            let user_id = {
                let mut clients = shared.clients.write().await;
                clients.remove(&addr).and_then(|c| c.user_id)
            };
            if let Some(user_id) = user_id {
                let _ = shared.queue.dequeue(user_id);
            }

            info!("Client {} cleaned up", addr);
        });
    }

    /// Handle a client message.
    async fn handle_client_message(
        shared: &Arc<Shared<L, Q>>,
        addr: SocketAddr,
        msg: ClientMessage,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        match msg {
            ClientMessage::Auth(auth) => {
                Self::handle_auth(shared, addr, auth, sender).await;
            }
            ClientMessage::JoinQueue { stake, character } => {
                Self::handle_join_queue(shared, addr, stake, character, sender).await;
            }
            ClientMessage::LeaveQueue => {
                Self::handle_leave_queue(shared, addr, sender).await;
            }
            ClientMessage::Confirm { room_id } => {
                Self::handle_confirm(shared, addr, room_id, sender).await;
            }
            ClientMessage::Answer {
                room_id,
                round_index,
                option,
            } => {
                Self::handle_answer(shared, addr, room_id, round_index, option, sender).await;
            }
            ClientMessage::SyncRequest { room_id } => {
                Self::handle_sync(shared, addr, room_id, sender).await;
            }
            ClientMessage::Ping { timestamp } => {
                let _ = sender
                    .send(ServerMessage::Pong {
                        timestamp,
                        server_time: unix_millis(),
                    })
                    .await;
            }
            ClientMessage::Leave => {
                if let Some(user_id) = shared.authed_user(addr).await {
                    let _ = shared.queue.dequeue(user_id);
                }
            }
        }
    }

    /// Handle authentication.
    async fn handle_auth(
        shared: &Arc<Shared<L, Q>>,
        addr: SocketAddr,
        auth: AuthRequest,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        match validate_token(&auth.token, &shared.config.auth) {
            Ok(claims) => {
                let user_id = claims.user_id();
                {
                    let mut clients = shared.clients.write().await;
                    if let Some(client) = clients.get_mut(&addr) {
                        client.user_id = Some(user_id);
                    }
                }

                let _ = sender
                    .send(ServerMessage::AuthResult(AuthResult {
                        success: true,
                        user_id: Some(user_id),
                        error: None,
                        server_version: shared.config.version.clone(),
                    }))
                    .await;

                debug!("Client {} authenticated as {}", addr, user_id.short());
            }
            Err(err) => {
                let code = match err {
                    AuthError::Expired => ErrorCode::TokenExpired,
                    AuthError::NotConfigured => ErrorCode::AuthFailed,
                    _ => ErrorCode::InvalidToken,
                };
                let _ = sender
                    .send(ServerMessage::AuthResult(AuthResult {
                        success: false,
                        user_id: None,
                        error: Some(err.to_string()),
                        server_version: shared.config.version.clone(),
                    }))
                    .await;
                send_error(sender, code, err.to_string()).await;
            }
        }
    }

    /// Handle a queue join.
    async fn handle_join_queue(
        shared: &Arc<Shared<L, Q>>,
        addr: SocketAddr,
        stake: u64,
        character: u8,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let user_id = match shared.authed_user(addr).await {
            Some(id) => id,
            None => {
                send_error(sender, ErrorCode::NotAuthenticated, "Must authenticate first").await;
                return;
            }
        };

        if shared.rooms.user_in_room(user_id).await {
            send_error(sender, ErrorCode::AlreadyInRoom, "Already in a live room").await;
            return;
        }

        match shared.queue.enqueue(user_id, stake, character) {
            Ok(_) => {
                let _ = sender
                    .send(ServerMessage::QueueJoined {
                        position: shared.queue.len(),
                    })
                    .await;
                debug!("User {} queued at stake {}", user_id.short(), stake);
            }
            Err(err) => {
                send_error(sender, ErrorCode::from(&err), err.to_string()).await;
            }
        }
    }

    /// Handle a queue leave.
    async fn handle_leave_queue(
        shared: &Arc<Shared<L, Q>>,
        addr: SocketAddr,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let user_id = match shared.authed_user(addr).await {
            Some(id) => id,
            None => {
                send_error(sender, ErrorCode::NotAuthenticated, "Must authenticate first").await;
                return;
            }
        };

        match shared.queue.dequeue(user_id) {
            Ok(()) => {
                let _ = sender.send(ServerMessage::QueueLeft).await;
            }
            Err(err) => {
                send_error(sender, ErrorCode::from(&err), err.to_string()).await;
            }
        }
    }

    /// Handle a room confirmation.
    async fn handle_confirm(
        shared: &Arc<Shared<L, Q>>,
        addr: SocketAddr,
        room_id: RoomId,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let user_id = match shared.authed_user(addr).await {
            Some(id) => id,
            None => {
                send_error(sender, ErrorCode::NotAuthenticated, "Must authenticate first").await;
                return;
            }
        };

        let room = match shared.rooms.get(room_id).await {
            Some(room) => room,
            None => {
                send_error(sender, ErrorCode::RoomNotFound, "room not found").await;
                return;
            }
        };

        let now = Utc::now();
        let (status, started_at) = {
            let mut room = room.write().await;
            let before = room.status;
            match room.confirm(user_id, now) {
                Ok(status) => {
                    let started = (before == RoomStatus::Confirming
                        && room.status == RoomStatus::Playing)
                        .then(|| room.started_at())
                        .flatten();
                    (status, started)
                }
                Err(err) => {
                    send_error(sender, ErrorCode::from(&err), err.to_string()).await;
                    return;
                }
            }
        };

        // Confirm doubles as (re)subscription; only a verified
        // participant reaches this point.
        if let Some(events) = shared.event_sender(user_id).await {
            shared.broadcaster.subscribe(room_id, user_id, events).await;
        }

        shared
            .broadcaster
            .publish(
                room_id,
                RoomEvent::ConfirmationUpdate {
                    room_id,
                    user_id,
                    all_confirmed: status.self_confirmed && status.peer_confirmed,
                },
            )
            .await;

        if let Some(started_at) = started_at {
            info!(room = %room_id.short(), "match started");
            shared
                .broadcaster
                .publish(room_id, RoomEvent::MatchStarted { room_id, started_at })
                .await;
        }
    }

    /// Handle an answer submission.
    async fn handle_answer(
        shared: &Arc<Shared<L, Q>>,
        addr: SocketAddr,
        room_id: RoomId,
        round_index: usize,
        option: u8,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let user_id = match shared.authed_user(addr).await {
            Some(id) => id,
            None => {
                send_error(sender, ErrorCode::NotAuthenticated, "Must authenticate first").await;
                return;
            }
        };

        if option as usize >= OPTION_COUNT {
            send_error(
                sender,
                ErrorCode::InvalidInput,
                format!("option must be below {}", OPTION_COUNT),
            )
            .await;
            return;
        }

        let room = match shared.rooms.get(room_id).await {
            Some(room) => room,
            None => {
                send_error(sender, ErrorCode::RoomNotFound, "room not found").await;
                return;
            }
        };

        let now = Utc::now();
        let (outcome, transition, finish) = {
            let mut room = room.write().await;
            match rounds::submit_answer(&mut room, user_id, round_index, option, now) {
                Ok((outcome, transition)) => {
                    let finish = transition
                        .filter(|t| t.match_over)
                        .map(|_| (room.winner_id, room.scores));
                    (outcome, transition, finish)
                }
                Err(err) => {
                    send_error(sender, ErrorCode::from(&err), err.to_string()).await;
                    return;
                }
            }
        };

        let _ = sender
            .send(ServerMessage::AnswerAck {
                round_index,
                accepted: outcome.accepted,
                correct: outcome.correct,
            })
            .await;

        if let Some(t) = transition {
            shared
                .broadcaster
                .publish(
                    room_id,
                    RoomEvent::RoundAdvanced {
                        room_id,
                        index: t.completed_index,
                        correct_answer: t.correct_answer,
                        scores: t.scores,
                    },
                )
                .await;
        }

        if let Some((winner_id, final_scores)) = finish {
            shared
                .broadcaster
                .publish(
                    room_id,
                    RoomEvent::MatchFinished {
                        room_id,
                        winner_id,
                        final_scores,
                    },
                )
                .await;
            // Both players are free to matchmake again immediately;
            // the driver takes care of settlement and retirement.
            shared.rooms.release_users(room_id).await;
        }
    }

    /// Handle a snapshot request.
    async fn handle_sync(
        shared: &Arc<Shared<L, Q>>,
        addr: SocketAddr,
        room_id: RoomId,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let user_id = match shared.authed_user(addr).await {
            Some(id) => id,
            None => {
                send_error(sender, ErrorCode::NotAuthenticated, "Must authenticate first").await;
                return;
            }
        };

        match shared.rooms.snapshot(room_id).await {
            Ok(snapshot) => {
                // Resubscribe on resync so the reconnected client keeps
                // receiving events after catching up.
                if snapshot.participants.iter().any(|p| p.user_id == user_id) {
                    if let Some(events) = shared.event_sender(user_id).await {
                        shared.broadcaster.subscribe(room_id, user_id, events).await;
                    }
                }
                let _ = sender.send(ServerMessage::Snapshot(snapshot)).await;
            }
            Err(err) => {
                send_error(sender, ErrorCode::from(&err), err.to_string()).await;
            }
        }
    }

    /// Run the matchmaking loop: sweep stale entries, pair the rest,
    /// and spawn a driver per created room.
    async fn run_matchmaking_loop(shared: Arc<Shared<L, Q>>) {
        let mut tick = interval(Duration::from_secs(1));

        loop {
            tick.tick().await;

            // Notify users evicted after waiting too long.
            for user_id in shared.queue.sweep_expired() {
                if let Some(sender) = shared.message_sender(user_id).await {
                    let _ = sender.send(ServerMessage::QueueExpired).await;
                }
            }

            for (room_id, handle) in Self::pair_waiting_players(&shared).await {
                tokio::spawn(Self::run_room_driver(shared.clone(), handle, room_id));
            }
        }
    }

    /// Pair every compatible couple currently in the queue, creating a
    /// confirming room for each. Returns the new rooms so the caller
    /// can attach a driver to each.
    async fn pair_waiting_players(
        shared: &Arc<Shared<L, Q>>,
    ) -> Vec<(RoomId, Arc<RwLock<Room>>)> {
        let mut created = Vec::new();

        while let Some(pair) = shared.queue.try_match() {
            let rules = shared.config.rules;
            let questions = match shared.questions.fetch(rules.question_count).await {
                Ok(qs) => qs,
                Err(err) => {
                    // Neither player loses their place when content
                    // cannot be fetched.
                    warn!("Question fetch failed, requeueing pair: {}", err);
                    shared.queue.requeue(pair);
                    break;
                }
            };

            let stake = pair.first.stake;
            let room = match Room::new(
                RoomId::generate(),
                (pair.first.user_id, pair.first.character),
                (pair.second.user_id, pair.second.character),
                questions,
                stake,
                rules,
            ) {
                Ok(room) => room,
                Err(err) => {
                    error!("Room creation failed: {}", err);
                    shared.queue.requeue(pair);
                    break;
                }
            };

            let room_id = room.id;
            let participants = [room.participants[0].user_id, room.participants[1].user_id];
            let handle = shared.rooms.insert(room).await;

            for user_id in participants {
                if let Some(events) = shared.event_sender(user_id).await {
                    shared.broadcaster.subscribe(room_id, user_id, events).await;
                }
            }

            shared
                .broadcaster
                .publish(
                    room_id,
                    RoomEvent::RoomCreated {
                        room_id,
                        participants,
                        stake,
                        confirm_window_secs: rules.confirm_window_secs,
                    },
                )
                .await;

            info!(
                room = %room_id.short(),
                first = %participants[0].short(),
                second = %participants[1].short(),
                stake,
                "room created"
            );

            created.push((room_id, handle));
        }

        created
    }

    /// Drive one room through its lifecycle.
    ///
    /// Owns every timer: the confirmation window, the per-round answer
    /// deadline, and the battle clock. Once the room finishes it pushes
    /// settlement to completion (retrying through ledger outages),
    /// lingers so late sync requests still resolve, then retires the
    /// room.
    async fn run_room_driver(shared: Arc<Shared<L, Q>>, room: Arc<RwLock<Room>>, room_id: RoomId) {
        let mut tick = interval(Duration::from_secs(1));

        loop {
            tick.tick().await;
            let now = Utc::now();

            enum Step {
                Cancelled,
                Advanced(rounds::RoundTransition),
                Finished(Option<UserId>, [u32; 2]),
                Done,
                Nothing,
            }

            let step = {
                let mut room = room.write().await;
                match room.status {
                    RoomStatus::Confirming => {
                        if room.confirm_window_expired(now) && room.cancel(now) {
                            Step::Cancelled
                        } else {
                            Step::Nothing
                        }
                    }
                    RoomStatus::Playing => {
                        if let Some(t) = rounds::expire_round(&mut room, now) {
                            Step::Advanced(t)
                        } else if rounds::check_clock(&mut room, now) {
                            Step::Finished(room.winner_id, room.scores)
                        } else {
                            Step::Nothing
                        }
                    }
                    RoomStatus::Finished | RoomStatus::Cancelled => Step::Done,
                }
            };

            match step {
                Step::Cancelled => {
                    info!(room = %room_id.short(), "confirmation window lapsed, room cancelled");
                    shared
                        .broadcaster
                        .publish(room_id, RoomEvent::RoomCancelled { room_id })
                        .await;
                    break;
                }
                Step::Advanced(t) => {
                    shared
                        .broadcaster
                        .publish(
                            room_id,
                            RoomEvent::RoundAdvanced {
                                room_id,
                                index: t.completed_index,
                                correct_answer: t.correct_answer,
                                scores: t.scores,
                            },
                        )
                        .await;
                    if t.match_over {
                        let (winner_id, final_scores) = {
                            let room = room.read().await;
                            (room.winner_id, room.scores)
                        };
                        shared
                            .broadcaster
                            .publish(
                                room_id,
                                RoomEvent::MatchFinished {
                                    room_id,
                                    winner_id,
                                    final_scores,
                                },
                            )
                            .await;
                    }
                }
                Step::Finished(winner_id, final_scores) => {
                    info!(room = %room_id.short(), "battle clock elapsed, match finished");
                    shared
                        .broadcaster
                        .publish(
                            room_id,
                            RoomEvent::MatchFinished {
                                room_id,
                                winner_id,
                                final_scores,
                            },
                        )
                        .await;
                }
                Step::Done => break,
                Step::Nothing => {}
            }
        }

        // The room is terminal: unbind the players right away so they
        // can queue for the next match while settlement and the linger
        // window run out.
        shared.rooms.release_users(room_id).await;

        // Settlement phase: only finished rooms move money.
        if room.read().await.status == RoomStatus::Finished {
            loop {
                match shared.engine.settle(&room, &shared.ledger).await {
                    Ok(_) => break,
                    Err(SettlementError::Ledger(LedgerError::Unavailable(_))) => {
                        tokio::time::sleep(shared.config.settlement_retry).await;
                    }
                    // Insufficient funds was already logged at error
                    // level for operators; nothing more to do here.
                    Err(_) => break,
                }
            }
        }

        tokio::time::sleep(shared.config.room_linger).await;
        shared.rooms.retire(room_id).await;
        shared.broadcaster.remove_room(room_id).await;
        debug!(room = %room_id.short(), "room retired");
    }

    /// Run cleanup loop for idle connections.
    async fn run_cleanup_loop(shared: Arc<Shared<L, Q>>) {
        let mut tick = interval(Duration::from_secs(60));
        let idle_timeout = Duration::from_secs(300);

        loop {
            tick.tick().await;

            let now = Instant::now();
            let to_remove: Vec<SocketAddr> = {
                let clients = shared.clients.read().await;
                clients
                    .iter()
                    .filter(|(_, c)| now.duration_since(c.last_activity) > idle_timeout)
                    .map(|(addr, _)| *addr)
                    .collect()
            };

            for addr in to_remove {
                let removed = shared.clients.write().await.remove(&addr);
                if let Some(client) = removed {
                    if let Some(user_id) = client.user_id {
                        let _ = shared.queue.dequeue(user_id);
                    }
                    info!("Removed idle client {}", addr);
                }
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.shared.clients.read().await.len()
    }

    /// Get live room count.
    pub async fn room_count(&self) -> usize {
        self.shared.rooms.room_count().await
    }

    /// Get matchmaking queue size.
    pub fn queue_size(&self) -> usize {
        self.shared.queue.len()
    }
}
