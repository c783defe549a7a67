// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use chrono::Utc;
use league_sdk::config::{LeagueConfig, parse_bind_addr};
use league_sdk::game::EvenOddRules;
use league_sdk::messages::{
    self, ChooseParityCall, ErrorCode, GameError, GameInvitation, GameOver, GameResult, GameStatus,
    LeagueError, MatchResultReport, MatchRole, Message, MessagePayload, Parity, ParityCallContext,
    RefereeMeta, RefereeRegisterRequest, RegistrationStatus, Role, RunMatchRequest,
    RunMatchResponse, Sender,
};
use league_sdk::repos::{MatchRecord, MatchRepository, MatchState};
use league_sdk::rpc::RpcClient;
use league_sdk::{JsonlLogger, TokenService};
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock, Semaphore, mpsc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Identity assigned by the manager at registration time.
#[derive(Debug, Clone, Default)]
struct RefereeIdentity {
    referee_id: String,
    auth_token: String,
}

#[derive(Debug)]
enum MatchEvent {
    JoinAck { player_id: String, accept: bool },
    Choice { player_id: String, choice: Parity },
    InvalidChoice { player_id: String },
}

struct MatchHandle {
    event_tx: mpsc::UnboundedSender<MatchEvent>,
}

/// Sends one protocol message to one player endpoint.
#[async_trait]
trait PlayerGateway: Send + Sync {
    async fn send(
        &self,
        endpoint: &str,
        conversation_id: &str,
        payload: MessagePayload,
    ) -> anyhow::Result<()>;
}

/// Delivers the authoritative match result to the league manager.
#[async_trait]
trait ResultReporter: Send + Sync {
    async fn report(&self, report: MatchResultReport) -> anyhow::Result<()>;
}

struct RpcPlayerGateway {
    rpc: Arc<RpcClient>,
    identity: Arc<RwLock<RefereeIdentity>>,
    generic_timeout: Duration,
    audit: Arc<JsonlLogger>,
}

#[async_trait]
impl PlayerGateway for RpcPlayerGateway {
    async fn send(
        &self,
        endpoint: &str,
        conversation_id: &str,
        payload: MessagePayload,
    ) -> anyhow::Result<()> {
        let identity = self.identity.read().await.clone();
        let method = payload.rpc_method().context("payload has no RPC method")?;
        let message_type = payload.message_type();
        let message = Message::new(
            Sender::referee(identity.referee_id),
            conversation_id,
            identity.auth_token,
            payload,
        );
        self.rpc
            .call(endpoint, method, message.into_params(), Some(self.generic_timeout))
            .await
            .map_err(|e| anyhow::anyhow!("send to {endpoint} failed: {e}"))?;
        self.audit.message_sent(message_type, endpoint, conversation_id);
        Ok(())
    }
}

struct RpcResultReporter {
    rpc: Arc<RpcClient>,
    identity: Arc<RwLock<RefereeIdentity>>,
    manager_endpoint: String,
    generic_timeout: Duration,
    audit: Arc<JsonlLogger>,
}

#[async_trait]
impl ResultReporter for RpcResultReporter {
    async fn report(&self, report: MatchResultReport) -> anyhow::Result<()> {
        let identity = self.identity.read().await.clone();
        let conversation_id = report.match_id.clone();
        let message = Message::new(
            Sender::referee(identity.referee_id),
            conversation_id.clone(),
            identity.auth_token,
            MessagePayload::MatchResultReport(report),
        );
        self.rpc
            .call(
                &self.manager_endpoint,
                "report_match_result",
                message.into_params(),
                Some(self.generic_timeout),
            )
            .await
            .map_err(|e| anyhow::anyhow!("result report failed: {e}"))?;
        self.audit
            .message_sent("MATCH_RESULT_REPORT", &self.manager_endpoint, &conversation_id);
        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<LeagueConfig>,
    tokens: Arc<TokenService>,
    identity: Arc<RwLock<RefereeIdentity>>,
    matches: Arc<Mutex<HashMap<String, MatchHandle>>>,
    capacity: Arc<Semaphore>,
    players: Arc<dyn PlayerGateway>,
    reporter: Arc<dyn ResultReporter>,
    match_repo: Arc<MatchRepository>,
    rules: Arc<EvenOddRules>,
    audit: Arc<JsonlLogger>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "referee_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = Arc::new(LeagueConfig::load());
    let data_root = std::env::var("LEAGUE_DATA_DIR")
        .ok()
        .unwrap_or_else(|| "./data".to_string());
    let manager_endpoint = std::env::var("LEAGUE_MANAGER_ENDPOINT")
        .ok()
        .unwrap_or_else(|| "http://localhost:8000/mcp".to_string());
    let public_endpoint = std::env::var("REFEREE_PUBLIC_ENDPOINT")
        .ok()
        .unwrap_or_else(|| "http://localhost:8001/mcp".to_string());
    let display_name = std::env::var("REFEREE_DISPLAY_NAME")
        .ok()
        .unwrap_or_else(|| "Even/Odd Referee".to_string());
    let max_concurrent: u32 = std::env::var("REFEREE_MAX_CONCURRENT_MATCHES")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(2);

    let tokens = Arc::new(TokenService::from_env(config.token_expiry_hours));
    let identity = Arc::new(RwLock::new(RefereeIdentity::default()));
    let audit = Arc::new(JsonlLogger::new(
        "referee:unregistered",
        std::path::Path::new(&data_root)
            .join("logs")
            .join("agents")
            .join("referee.log.jsonl"),
    )?);
    let rpc = Arc::new(RpcClient::new(config.rpc_client_config()));

    let state = AppState {
        config: config.clone(),
        tokens,
        identity: identity.clone(),
        matches: Arc::new(Mutex::new(HashMap::new())),
        capacity: Arc::new(Semaphore::new(max_concurrent as usize)),
        players: Arc::new(RpcPlayerGateway {
            rpc: rpc.clone(),
            identity: identity.clone(),
            generic_timeout: config.timeouts.generic(),
            audit: audit.clone(),
        }),
        reporter: Arc::new(RpcResultReporter {
            rpc: rpc.clone(),
            identity: identity.clone(),
            manager_endpoint: manager_endpoint.clone(),
            generic_timeout: config.timeouts.generic(),
            audit: audit.clone(),
        }),
        match_repo: Arc::new(MatchRepository::new(&data_root, &config.league_id)),
        rules: Arc::new(EvenOddRules::new(
            config.rules.number_range,
            config.rules.draw_on_both_wrong,
            config.scoring,
        )),
        audit,
    };

    {
        let rpc = rpc.clone();
        let config = config.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            register_with_manager(
                rpc,
                config,
                identity,
                manager_endpoint,
                public_endpoint,
                display_name,
                max_concurrent,
            )
            .await;
        });
    }

    let app = build_router(state);
    let bind_addr = parse_bind_addr("REFEREE_BIND", "0.0.0.0:8001")?;
    info!(%bind_addr, "referee-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Registers with the manager, retrying until accepted. Registration carries
/// an empty auth token; the accepted response supplies the referee id and
/// bearer token used for everything after.
async fn register_with_manager(
    rpc: Arc<RpcClient>,
    config: Arc<LeagueConfig>,
    identity: Arc<RwLock<RefereeIdentity>>,
    manager_endpoint: String,
    public_endpoint: String,
    display_name: String,
    max_concurrent: u32,
) {
    let requested_id = std::env::var("REFEREE_ID")
        .ok()
        .unwrap_or_else(|| "REF01".to_string());
    loop {
        let message = Message::new(
            Sender::referee(requested_id.clone()),
            format!("register_{requested_id}"),
            "",
            MessagePayload::RefereeRegisterRequest(RefereeRegisterRequest {
                referee_meta: RefereeMeta {
                    display_name: display_name.clone(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    game_types: vec![config.rules.game_type.clone()],
                    contact_endpoint: public_endpoint.clone(),
                    max_concurrent_matches: max_concurrent,
                },
            }),
        );

        match rpc
            .call(
                &manager_endpoint,
                "register_referee",
                message.into_params(),
                Some(config.timeouts.http()),
            )
            .await
        {
            Ok(result) => match messages::decode_value(result) {
                Ok(response) => {
                    if let MessagePayload::RefereeRegisterResponse(response) = response.payload {
                        if response.status == RegistrationStatus::Accepted {
                            let referee_id = response.referee_id.unwrap_or(requested_id.clone());
                            let auth_token = response.auth_token.unwrap_or_default();
                            info!(%referee_id, "registered with league manager");
                            *identity.write().await = RefereeIdentity {
                                referee_id,
                                auth_token,
                            };
                            return;
                        }
                        warn!(
                            reason = response.rejection_reason.as_deref().unwrap_or("unknown"),
                            "registration rejected"
                        );
                    }
                }
                Err(error) => warn!(%error, "registration response did not decode"),
            },
            Err(error) => warn!(%error, "registration call failed; retrying"),
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mcp", post(mcp_handler))
        .route("/admin/run_match", post(run_match_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let identity = state.identity.read().await;
    Json(json!({
        "ok": true,
        "service": "referee-service",
        "referee_id": identity.referee_id,
        "active_matches": state.matches.lock().await.len(),
    }))
}

// ---------------------------------------------------------------------------
// Ingress
// ---------------------------------------------------------------------------

fn rpc_result(id: Value, result: Value) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({"jsonrpc": "2.0", "result": result, "id": id})),
    )
}

fn rpc_error(id: Value, code: i64, message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"jsonrpc": "2.0", "error": {"code": code, "message": message}, "id": id})),
    )
}

async fn league_error_result(
    state: &AppState,
    id: Value,
    conversation_id: String,
    code: ErrorCode,
    description: String,
) -> (StatusCode, Json<Value>) {
    let identity = state.identity.read().await.clone();
    let message = Message::new(
        Sender::referee(identity.referee_id),
        conversation_id,
        identity.auth_token,
        MessagePayload::LeagueError(LeagueError {
            error_code: code,
            error_description: description,
            context: None,
        }),
    );
    rpc_result(id, message.into_params())
}

async fn mcp_handler(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let id = request.get("id").cloned().unwrap_or(json!(1));
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    let message = match messages::decode_value(params.clone()) {
        Ok(message) => message,
        Err(error) => {
            // A well-enveloped CHOOSE_PARITY_RESPONSE with a bad parity value
            // still deserves a GAME_ERROR so the player can correct itself;
            // the engine counts it as missing.
            if params.get("message_type").and_then(Value::as_str)
                == Some("CHOOSE_PARITY_RESPONSE")
                && let Some(match_id) = params.get("match_id").and_then(Value::as_str)
                && let Some(sender) = params
                    .get("sender")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<Sender>().ok())
            {
                let handle_tx = {
                    let matches = state.matches.lock().await;
                    matches.get(match_id).map(|h| h.event_tx.clone())
                };
                if let Some(tx) = handle_tx {
                    let _ = tx.send(MatchEvent::InvalidChoice {
                        player_id: sender.agent_id,
                    });
                }
            }
            return rpc_error(id, -32602, error.to_string());
        }
    };
    state.audit.message_received(
        message.payload.message_type(),
        &message.envelope.sender.to_string(),
        &message.envelope.conversation_id,
    );

    let sender = message.envelope.sender.clone();
    let conversation_id = message.envelope.conversation_id.clone();
    let claims = match state.tokens.validate(
        &message.envelope.auth_token,
        Some(&sender.agent_id),
        Some(&state.config.league_id),
    ) {
        Ok(claims) => claims,
        Err(error) => {
            return league_error_result(
                &state,
                id,
                conversation_id,
                error.error_code(),
                error.to_string(),
            )
            .await;
        }
    };
    if claims.role != Role::Player || sender.role != Role::Player {
        return league_error_result(
            &state,
            id,
            conversation_id,
            ErrorCode::AuthTokenInvalid,
            "only players talk to a referee".to_string(),
        )
        .await;
    }

    let (match_id, event) = match message.payload {
        MessagePayload::GameJoinAck(ack) => (
            ack.match_id,
            MatchEvent::JoinAck {
                player_id: sender.agent_id.clone(),
                accept: ack.accept,
            },
        ),
        MessagePayload::ChooseParityResponse(response) => (
            response.match_id,
            MatchEvent::Choice {
                player_id: sender.agent_id.clone(),
                choice: response.parity_choice,
            },
        ),
        other => {
            return rpc_error(
                id,
                -32601,
                format!("message type {} is not accepted here", other.message_type()),
            );
        }
    };

    let handle_tx = {
        let matches = state.matches.lock().await;
        matches.get(&match_id).map(|h| h.event_tx.clone())
    };
    match handle_tx {
        Some(tx) => {
            // A send failure means the match task already terminated; the
            // message is a late duplicate and is dropped on the floor.
            let _ = tx.send(event);
            rpc_result(id, json!({"status": "accepted", "match_id": match_id}))
        }
        None => {
            warn!(%match_id, sender = %sender, "message for unknown or finished match");
            rpc_result(id, json!({"status": "ignored", "match_id": match_id}))
        }
    }
}

async fn run_match_handler(
    State(state): State<AppState>,
    Json(request): Json<RunMatchRequest>,
) -> (StatusCode, Json<RunMatchResponse>) {
    let match_id = request.match_id.clone();
    {
        let mut matches = state.matches.lock().await;
        if matches.contains_key(&match_id) {
            return (
                StatusCode::CONFLICT,
                Json(RunMatchResponse {
                    accepted: false,
                    match_id,
                    reason: Some("match already running".to_string()),
                }),
            );
        }
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        matches.insert(match_id.clone(), MatchHandle { event_tx });

        let state = state.clone();
        let request = request.clone();
        tokio::spawn(async move {
            // Capacity guard: overflow matches wait here, running
            // sequentially once a slot frees up.
            let permit = state
                .capacity
                .clone()
                .acquire_owned()
                .await
                .expect("capacity semaphore closed");
            run_match(&state, &request, event_rx).await;
            drop(permit);
            state.matches.lock().await.remove(&request.match_id);
        });
    }

    info!(%match_id, "match accepted");
    (
        StatusCode::OK,
        Json(RunMatchResponse {
            accepted: true,
            match_id,
            reason: None,
        }),
    )
}

// ---------------------------------------------------------------------------
// Match engine
// ---------------------------------------------------------------------------

struct MatchCtx<'a> {
    state: &'a AppState,
    request: &'a RunMatchRequest,
    referee_id: String,
    acks: HashMap<String, bool>,
    choices: HashMap<String, Parity>,
    retry_count: u32,
}

impl MatchCtx<'_> {
    fn endpoint_of(&self, player_id: &str) -> &str {
        if player_id == self.request.player_a_id {
            &self.request.player_a_endpoint
        } else {
            &self.request.player_b_endpoint
        }
    }

    fn is_participant(&self, player_id: &str) -> bool {
        player_id == self.request.player_a_id || player_id == self.request.player_b_id
    }

    fn both_joined(&self) -> bool {
        self.acks.len() == 2 && self.acks.values().all(|accept| *accept)
    }

    fn any_declined(&self) -> bool {
        self.acks.values().any(|accept| !accept)
    }

    fn missing_choices(&self) -> Vec<String> {
        [&self.request.player_a_id, &self.request.player_b_id]
            .into_iter()
            .filter(|id| !self.choices.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Applies one inbound event. Replays for the current or an earlier step
    /// are ignored, keeping the state machine idempotent.
    async fn apply(&mut self, event: MatchEvent) {
        match event {
            MatchEvent::JoinAck { player_id, accept } => {
                if !self.is_participant(&player_id) || self.acks.contains_key(&player_id) {
                    return;
                }
                self.acks.insert(player_id.clone(), accept);
                let _ = self.state.match_repo.append_transcript(
                    &self.request.match_id,
                    &format!("player:{player_id}"),
                    &format!("referee:{}", self.referee_id),
                    "GAME_JOIN_ACK",
                );
            }
            MatchEvent::Choice { player_id, choice } => {
                if !self.is_participant(&player_id) || self.choices.contains_key(&player_id) {
                    return;
                }
                self.choices.insert(player_id.clone(), choice);
                let _ = self.state.match_repo.append_transcript(
                    &self.request.match_id,
                    &format!("player:{player_id}"),
                    &format!("referee:{}", self.referee_id),
                    "CHOOSE_PARITY_RESPONSE",
                );
            }
            MatchEvent::InvalidChoice { player_id } => {
                if !self.is_participant(&player_id) || self.choices.contains_key(&player_id) {
                    return;
                }
                self.send_game_error(
                    &player_id,
                    ErrorCode::InvalidChoice,
                    "parity_choice must be \"even\" or \"odd\"".to_string(),
                    "resend CHOOSE_PARITY_RESPONSE with a valid choice",
                )
                .await;
            }
        }
    }

    async fn send_to_player(&self, player_id: &str, payload: MessagePayload) -> anyhow::Result<()> {
        let message_type = payload.message_type();
        let endpoint = self.endpoint_of(player_id);
        self.state
            .players
            .send(endpoint, &self.request.match_id, payload)
            .await?;
        let _ = self.state.match_repo.append_transcript(
            &self.request.match_id,
            &format!("referee:{}", self.referee_id),
            &format!("player:{player_id}"),
            message_type,
        );
        Ok(())
    }

    async fn send_game_error(
        &self,
        player_id: &str,
        error_code: ErrorCode,
        description: String,
        action_required: &str,
    ) {
        let max_retries = self.state.config.retry.max_retries;
        let consequence = if self.retry_count >= max_retries {
            "technical loss"
        } else {
            "retry"
        };
        let payload = MessagePayload::GameError(GameError {
            match_id: self.request.match_id.clone(),
            error_code,
            error_description: description,
            affected_player: Some(player_id.to_string()),
            action_required: Some(action_required.to_string()),
            retry_count: self.retry_count,
            max_retries,
            consequence: Some(consequence.to_string()),
        });
        if let Err(error) = self.send_to_player(player_id, payload).await {
            warn!(match_id = %self.request.match_id, %player_id, %error, "failed to deliver GAME_ERROR");
        }
    }

    fn transition(&self, state: MatchState) {
        if let Err(error) =
            self.state
                .match_repo
                .append_transition(&self.request.match_id, state, Utc::now())
        {
            warn!(match_id = %self.request.match_id, %error, "failed to persist transition");
        }
        info!(match_id = %self.request.match_id, new_state = ?state, "match state changed");
        self.state.audit.info(
            "MATCH_STATE_CHANGED",
            json!({"match_id": self.request.match_id, "state": state}),
        );
    }
}

/// Receives events until `done` holds or the deadline passes.
async fn drain_until<F>(
    ctx: &mut MatchCtx<'_>,
    events: &mut mpsc::UnboundedReceiver<MatchEvent>,
    deadline: tokio::time::Instant,
    mut done: F,
) where
    F: FnMut(&MatchCtx<'_>) -> bool,
{
    loop {
        if done(ctx) {
            return;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return;
        }
        match tokio::time::timeout(deadline - now, events.recv()).await {
            Ok(Some(event)) => ctx.apply(event).await,
            Ok(None) | Err(_) => return,
        }
    }
}

/// Drives one match from invitation to its terminal state. Exactly one
/// MATCH_RESULT_REPORT leaves this function, for cancelled matches included.
async fn run_match(
    state: &AppState,
    request: &RunMatchRequest,
    mut events: mpsc::UnboundedReceiver<MatchEvent>,
) {
    let referee_id = {
        let identity = state.identity.read().await;
        if identity.referee_id.is_empty() {
            "REF01".to_string()
        } else {
            identity.referee_id.clone()
        }
    };
    if let Err(error) = state.match_repo.create(&MatchRecord::new(
        &request.match_id,
        &request.round_id,
        &request.league_id,
        &request.game_type,
        &referee_id,
        &request.player_a_id,
        &request.player_b_id,
    )) {
        warn!(match_id = %request.match_id, %error, "failed to persist match record");
    }

    let mut ctx = MatchCtx {
        state,
        request,
        referee_id,
        acks: HashMap::new(),
        choices: HashMap::new(),
        retry_count: 0,
    };

    // WAITING_FOR_PLAYERS: both invitations out, 5s to join.
    ctx.transition(MatchState::WaitingForPlayers);
    for (player_id, role, opponent) in [
        (
            &request.player_a_id,
            MatchRole::PlayerA,
            &request.player_b_id,
        ),
        (
            &request.player_b_id,
            MatchRole::PlayerB,
            &request.player_a_id,
        ),
    ] {
        let invitation = MessagePayload::GameInvitation(GameInvitation {
            match_id: request.match_id.clone(),
            game_type: request.game_type.clone(),
            role_in_match: role,
            opponent_id: opponent.clone(),
        });
        if let Err(error) = ctx.send_to_player(player_id, invitation).await {
            warn!(match_id = %request.match_id, %player_id, %error, "invitation undeliverable");
            cancel_match(&mut ctx, format!("player {player_id} unreachable")).await;
            return;
        }
    }

    let join_deadline = tokio::time::Instant::now() + state.config.timeouts.join_ack();
    drain_until(&mut ctx, &mut events, join_deadline, |ctx| {
        ctx.both_joined() || ctx.any_declined()
    })
    .await;
    if ctx.any_declined() {
        cancel_match(&mut ctx, "player declined the invitation".to_string()).await;
        return;
    }
    if !ctx.both_joined() {
        cancel_match(&mut ctx, "players failed to join in time".to_string()).await;
        return;
    }

    // COLLECTING_CHOICES: call both, 30s per attempt, resends with backoff.
    ctx.transition(MatchState::CollectingChoices);
    let max_retries = state.config.retry.max_retries;
    let backoff_base = Duration::from_secs(state.config.retry.backoff_base_sec);
    let pending = ctx.missing_choices();
    send_parity_calls(&ctx, &pending).await;

    loop {
        let move_deadline = tokio::time::Instant::now() + state.config.timeouts.move_timeout();
        drain_until(&mut ctx, &mut events, move_deadline, |ctx| {
            ctx.missing_choices().is_empty()
        })
        .await;

        let missing = ctx.missing_choices();
        if missing.is_empty() || ctx.retry_count >= max_retries {
            break;
        }

        ctx.retry_count += 1;
        for player_id in &missing {
            ctx.send_game_error(
                player_id,
                ErrorCode::TimeoutError,
                format!(
                    "no CHOOSE_PARITY_RESPONSE within {}s",
                    state.config.timeouts.move_sec
                ),
                "respond to CHOOSE_PARITY_CALL",
            )
            .await;
        }
        tokio::time::sleep(backoff_base * 2u32.pow(ctx.retry_count - 1)).await;
        send_parity_calls(&ctx, &missing).await;
    }

    let missing = ctx.missing_choices();
    match missing.len() {
        0 => {
            // DRAWING_NUMBER: ordinary outcome.
            ctx.transition(MatchState::DrawingNumber);
            let drawn = state.rules.draw_number();
            let result = state.rules.decide(
                &request.player_a_id,
                &request.player_b_id,
                ctx.choices[&request.player_a_id],
                ctx.choices[&request.player_b_id],
                drawn,
            );
            finish_match(&mut ctx, result).await;
        }
        1 => {
            // Technical loss: the responder takes the win regardless of the
            // drawn parity.
            ctx.transition(MatchState::DrawingNumber);
            let offender = missing[0].clone();
            let winner = if offender == request.player_a_id {
                request.player_b_id.clone()
            } else {
                request.player_a_id.clone()
            };
            let drawn = state.rules.draw_number();
            let result = GameResult {
                status: GameStatus::Win,
                winner_player_id: Some(winner.clone()),
                drawn_number: Some(drawn),
                number_parity: Some(EvenOddRules::parity_of(drawn)),
                choices: Some(ctx.choices.clone().into_iter().collect::<BTreeMap<_, _>>()),
                reason: format!("technical loss: {offender} failed to respond"),
                score: BTreeMap::from([
                    (winner, state.config.scoring.win_points),
                    (offender, state.config.scoring.technical_loss_points),
                ]),
            };
            finish_match(&mut ctx, result).await;
        }
        _ => {
            cancel_match(
                &mut ctx,
                "both players failed to respond after retries".to_string(),
            )
            .await;
        }
    }
}

async fn send_parity_calls(ctx: &MatchCtx<'_>, player_ids: &[String]) {
    let deadline = Utc::now()
        + chrono::Duration::from_std(ctx.state.config.timeouts.move_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
    for player_id in player_ids {
        let opponent_id = if player_id == &ctx.request.player_a_id {
            ctx.request.player_b_id.clone()
        } else {
            ctx.request.player_a_id.clone()
        };
        let call = MessagePayload::ChooseParityCall(ChooseParityCall {
            match_id: ctx.request.match_id.clone(),
            game_type: ctx.request.game_type.clone(),
            deadline,
            context: ParityCallContext {
                opponent_id,
                round_id: ctx.request.round_id.clone(),
            },
        });
        if let Err(error) = ctx.send_to_player(player_id, call).await {
            warn!(match_id = %ctx.request.match_id, %player_id, %error, "parity call undeliverable");
        }
    }
}

async fn finish_match(ctx: &mut MatchCtx<'_>, result: GameResult) {
    ctx.transition(MatchState::Finished);
    if let Err(error) = ctx
        .state
        .match_repo
        .save_result(&ctx.request.match_id, &result)
    {
        warn!(match_id = %ctx.request.match_id, %error, "failed to persist result");
    }

    for player_id in [&ctx.request.player_a_id, &ctx.request.player_b_id] {
        let game_over = MessagePayload::GameOver(GameOver {
            match_id: ctx.request.match_id.clone(),
            game_result: result.clone(),
        });
        if let Err(error) = ctx.send_to_player(player_id, game_over).await {
            warn!(match_id = %ctx.request.match_id, %player_id, %error, "GAME_OVER undeliverable");
        }
    }

    info!(
        match_id = %ctx.request.match_id,
        status = ?result.status,
        winner = result.winner_player_id.as_deref().unwrap_or("-"),
        "match finished"
    );
    report_result(ctx, result).await;
}

async fn cancel_match(ctx: &mut MatchCtx<'_>, reason: String) {
    ctx.transition(MatchState::Cancelled);
    warn!(match_id = %ctx.request.match_id, reason, "match cancelled");
    ctx.state.audit.warn(
        "MATCH_CANCELLED",
        json!({"match_id": ctx.request.match_id, "reason": reason}),
    );

    let result = GameResult {
        status: GameStatus::Cancelled,
        winner_player_id: None,
        drawn_number: None,
        number_parity: None,
        choices: None,
        reason,
        score: BTreeMap::from([
            (ctx.request.player_a_id.clone(), 0),
            (ctx.request.player_b_id.clone(), 0),
        ]),
    };
    if let Err(error) = ctx
        .state
        .match_repo
        .save_result(&ctx.request.match_id, &result)
    {
        warn!(match_id = %ctx.request.match_id, %error, "failed to persist cancellation");
    }
    report_result(ctx, result).await;
}

async fn report_result(ctx: &mut MatchCtx<'_>, result: GameResult) {
    let report = MatchResultReport {
        match_id: ctx.request.match_id.clone(),
        round_id: ctx.request.round_id.clone(),
        league_id: ctx.request.league_id.clone(),
        result,
    };
    match ctx.state.reporter.report(report).await {
        Ok(()) => {
            let _ = ctx.state.match_repo.append_transcript(
                &ctx.request.match_id,
                &format!("referee:{}", ctx.referee_id),
                "league_manager:LEAGUE_MANAGER_01",
                "MATCH_RESULT_REPORT",
            );
        }
        Err(error) => {
            warn!(match_id = %ctx.request.match_id, %error, "failed to report match result");
            ctx.state.audit.error(
                "RESULT_REPORT_FAILED",
                json!({"match_id": ctx.request.match_id, "error": error.to_string()}),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use league_sdk::config::ScoringConfig;
    use league_sdk::messages::{ChooseParityResponse, GameJoinAck};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingGateway {
        sent: StdMutex<Vec<(String, MessagePayload)>>,
    }

    impl RecordingGateway {
        fn count_to(&self, endpoint: &str, message_type: &str) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(e, p)| e == endpoint && p.message_type() == message_type)
                .count()
        }

        fn game_errors(&self) -> Vec<GameError> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(_, p)| match p {
                    MessagePayload::GameError(e) => Some(e.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl PlayerGateway for RecordingGateway {
        async fn send(
            &self,
            endpoint: &str,
            _conversation_id: &str,
            payload: MessagePayload,
        ) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((endpoint.to_string(), payload));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        reports: StdMutex<Vec<MatchResultReport>>,
    }

    #[async_trait]
    impl ResultReporter for RecordingReporter {
        async fn report(&self, report: MatchResultReport) -> anyhow::Result<()> {
            self.reports.lock().unwrap().push(report);
            Ok(())
        }
    }

    struct TestHarness {
        state: AppState,
        gateway: Arc<RecordingGateway>,
        reporter: Arc<RecordingReporter>,
        _dir: tempfile::TempDir,
    }

    const ENDPOINT_A: &str = "http://localhost:9001/mcp";
    const ENDPOINT_B: &str = "http://localhost:9002/mcp";

    fn harness() -> TestHarness {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(LeagueConfig::default());
        let gateway = Arc::new(RecordingGateway::default());
        let reporter = Arc::new(RecordingReporter::default());
        let tokens = Arc::new(TokenService::new("referee-test-secret", 24));
        let identity = Arc::new(RwLock::new(RefereeIdentity {
            referee_id: "REF01".to_string(),
            auth_token: tokens
                .issue("REF01", &config.league_id, Role::Referee)
                .unwrap(),
        }));
        let audit = Arc::new(
            JsonlLogger::new("referee:REF01", dir.path().join("referee.log.jsonl")).unwrap(),
        );
        let state = AppState {
            tokens,
            identity,
            matches: Arc::new(Mutex::new(HashMap::new())),
            capacity: Arc::new(Semaphore::new(2)),
            players: gateway.clone(),
            reporter: reporter.clone(),
            match_repo: Arc::new(MatchRepository::new(dir.path(), &config.league_id)),
            rules: Arc::new(EvenOddRules::new(
                config.rules.number_range,
                config.rules.draw_on_both_wrong,
                ScoringConfig::default(),
            )),
            audit,
            config,
        };
        TestHarness {
            state,
            gateway,
            reporter,
            _dir: dir,
        }
    }

    fn request() -> RunMatchRequest {
        RunMatchRequest {
            match_id: "R1M1".to_string(),
            round_id: "R1".to_string(),
            league_id: LeagueConfig::default().league_id,
            game_type: "even_odd".to_string(),
            player_a_id: "P01".to_string(),
            player_b_id: "P02".to_string(),
            player_a_endpoint: ENDPOINT_A.to_string(),
            player_b_endpoint: ENDPOINT_B.to_string(),
        }
    }

    async fn start_match(harness: &TestHarness) -> mpsc::UnboundedSender<MatchEvent> {
        let (status, Json(response)) =
            run_match_handler(State(harness.state.clone()), Json(request())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(response.accepted);
        let matches = harness.state.matches.lock().await;
        matches.get("R1M1").unwrap().event_tx.clone()
    }

    async fn wait_for_report(harness: &TestHarness) -> MatchResultReport {
        for _ in 0..10_000 {
            if let Some(report) = harness.reporter.reports.lock().unwrap().first().cloned() {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no match result report arrived");
    }

    fn join(player_id: &str) -> MatchEvent {
        MatchEvent::JoinAck {
            player_id: player_id.to_string(),
            accept: true,
        }
    }

    fn choice(player_id: &str, parity: Parity) -> MatchEvent {
        MatchEvent::Choice {
            player_id: player_id.to_string(),
            choice: parity,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_match_reports_an_outcome_consistent_with_the_draw() {
        let harness = harness();
        let tx = start_match(&harness).await;

        tx.send(join("P01")).unwrap();
        tx.send(join("P02")).unwrap();
        tx.send(choice("P01", Parity::Even)).unwrap();
        tx.send(choice("P02", Parity::Odd)).unwrap();

        let report = wait_for_report(&harness).await;
        assert_eq!(report.match_id, "R1M1");
        assert_eq!(report.result.status, GameStatus::Win);

        let drawn = report.result.drawn_number.unwrap();
        let expected_winner = if drawn % 2 == 0 { "P01" } else { "P02" };
        assert_eq!(report.result.winner_player_id.as_deref(), Some(expected_winner));
        assert_eq!(report.result.score[expected_winner], 3);
        assert_eq!(report.result.score.values().sum::<i64>(), 3);

        // Both players got the invitation, the call, and the result.
        for endpoint in [ENDPOINT_A, ENDPOINT_B] {
            assert_eq!(harness.gateway.count_to(endpoint, "GAME_INVITATION"), 1);
            assert_eq!(harness.gateway.count_to(endpoint, "CHOOSE_PARITY_CALL"), 1);
            assert_eq!(harness.gateway.count_to(endpoint, "GAME_OVER"), 1);
        }

        // Exactly one report, and the lifecycle is a valid path.
        assert_eq!(harness.reporter.reports.lock().unwrap().len(), 1);
        let record = harness.state.match_repo.load("R1M1").unwrap().unwrap();
        let states: Vec<MatchState> = record.lifecycle.iter().map(|l| l.state).collect();
        assert_eq!(
            states,
            vec![
                MatchState::Created,
                MatchState::WaitingForPlayers,
                MatchState::CollectingChoices,
                MatchState::DrawingNumber,
                MatchState::Finished,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn same_choices_draw_with_one_point_each() {
        let harness = harness();
        let tx = start_match(&harness).await;

        tx.send(join("P01")).unwrap();
        tx.send(join("P02")).unwrap();
        tx.send(choice("P01", Parity::Even)).unwrap();
        tx.send(choice("P02", Parity::Even)).unwrap();

        let report = wait_for_report(&harness).await;
        assert_eq!(report.result.status, GameStatus::Draw);
        assert_eq!(report.result.winner_player_id, None);
        assert_eq!(report.result.score["P01"], 1);
        assert_eq!(report.result.score["P02"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn declined_invitation_cancels_the_match() {
        let harness = harness();
        let tx = start_match(&harness).await;

        tx.send(join("P01")).unwrap();
        tx.send(MatchEvent::JoinAck {
            player_id: "P02".to_string(),
            accept: false,
        })
        .unwrap();

        let report = wait_for_report(&harness).await;
        assert_eq!(report.result.status, GameStatus::Cancelled);
        assert_eq!(report.result.score["P01"], 0);
        assert_eq!(report.result.score["P02"], 0);

        // No GAME_OVER for a cancelled match; the report is the only signal.
        assert_eq!(harness.gateway.count_to(ENDPOINT_A, "GAME_OVER"), 0);
        let record = harness.state.match_repo.load("R1M1").unwrap().unwrap();
        assert_eq!(record.lifecycle.last().unwrap().state, MatchState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn join_timeout_cancels_the_match() {
        let harness = harness();
        let tx = start_match(&harness).await;
        tx.send(join("P01")).unwrap();

        let report = wait_for_report(&harness).await;
        assert_eq!(report.result.status, GameStatus::Cancelled);
        assert!(report.result.reason.contains("failed to join"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_player_takes_a_technical_loss_after_three_retries() {
        let harness = harness();
        let tx = start_match(&harness).await;

        tx.send(join("P01")).unwrap();
        tx.send(join("P02")).unwrap();
        tx.send(choice("P01", Parity::Even)).unwrap();
        // P02 never answers the parity call.

        let report = wait_for_report(&harness).await;
        assert_eq!(report.result.status, GameStatus::Win);
        assert_eq!(report.result.winner_player_id.as_deref(), Some("P01"));
        assert!(report.result.reason.contains("technical loss"));
        assert_eq!(report.result.score["P01"], 3);
        assert_eq!(report.result.score["P02"], 0);

        // Initial call to both, then three resends to the silent player only.
        assert_eq!(harness.gateway.count_to(ENDPOINT_A, "CHOOSE_PARITY_CALL"), 1);
        assert_eq!(harness.gateway.count_to(ENDPOINT_B, "CHOOSE_PARITY_CALL"), 4);

        let errors = harness.gateway.game_errors();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| e.error_code == ErrorCode::TimeoutError));
        assert!(errors.iter().all(|e| e.affected_player.as_deref() == Some("P02")));
        let last = errors.last().unwrap();
        assert_eq!((last.retry_count, last.max_retries), (3, 3));
        assert_eq!(last.consequence.as_deref(), Some("technical loss"));

        let record = harness.state.match_repo.load("R1M1").unwrap().unwrap();
        assert_eq!(record.lifecycle.last().unwrap().state, MatchState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn both_silent_players_cancel_the_match_with_zero_points() {
        let harness = harness();
        let tx = start_match(&harness).await;

        tx.send(join("P01")).unwrap();
        tx.send(join("P02")).unwrap();

        let report = wait_for_report(&harness).await;
        assert_eq!(report.result.status, GameStatus::Cancelled);
        assert_eq!(report.result.score.values().sum::<i64>(), 0);
        assert_eq!(harness.reporter.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_events_do_not_change_outcome_or_transcript() {
        let harness = harness();
        let tx = start_match(&harness).await;

        tx.send(join("P01")).unwrap();
        tx.send(join("P01")).unwrap();
        tx.send(join("P02")).unwrap();
        tx.send(choice("P01", Parity::Even)).unwrap();
        tx.send(choice("P01", Parity::Odd)).unwrap();
        tx.send(choice("P02", Parity::Odd)).unwrap();

        let report = wait_for_report(&harness).await;
        // The first choice per player wins; the replay is dropped.
        assert_eq!(report.result.choices.as_ref().unwrap()["P01"], Parity::Even);

        let record = harness.state.match_repo.load("R1M1").unwrap().unwrap();
        let ack_entries = record
            .transcript
            .iter()
            .filter(|t| t.message_type == "GAME_JOIN_ACK")
            .count();
        let choice_entries = record
            .transcript
            .iter()
            .filter(|t| t.message_type == "CHOOSE_PARITY_RESPONSE")
            .count();
        assert_eq!(ack_entries, 2);
        assert_eq!(choice_entries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_match_rejects_a_duplicate_match_id() {
        let harness = harness();
        let _tx = start_match(&harness).await;
        let (status, Json(response)) =
            run_match_handler(State(harness.state.clone()), Json(request())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(!response.accepted);
    }

    fn player_message(harness: &TestHarness, player_id: &str, payload: MessagePayload) -> Value {
        let token = harness
            .state
            .tokens
            .issue(player_id, &harness.state.config.league_id, Role::Player)
            .unwrap();
        let message = Message::new(Sender::player(player_id), "R1M1", token, payload);
        json!({
            "jsonrpc": "2.0",
            "method": "game_join_ack",
            "params": message.into_params(),
            "id": 1,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn mcp_routes_acks_and_choices_into_the_running_match() {
        let harness = harness();
        let _tx = start_match(&harness).await;

        for (player_id, parity) in [("P01", Parity::Even), ("P02", Parity::Odd)] {
            let ack = player_message(
                &harness,
                player_id,
                MessagePayload::GameJoinAck(GameJoinAck {
                    match_id: "R1M1".to_string(),
                    accept: true,
                    arrival_timestamp: Utc::now(),
                }),
            );
            let (status, Json(body)) = mcp_handler(State(harness.state.clone()), Json(ack)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["result"]["status"], "accepted");

            let response = player_message(
                &harness,
                player_id,
                MessagePayload::ChooseParityResponse(ChooseParityResponse {
                    match_id: "R1M1".to_string(),
                    parity_choice: parity,
                }),
            );
            let (status, _) = mcp_handler(State(harness.state.clone()), Json(response)).await;
            assert_eq!(status, StatusCode::OK);
        }

        let report = wait_for_report(&harness).await;
        assert_eq!(report.result.status, GameStatus::Win);
    }

    #[tokio::test(start_paused = true)]
    async fn mcp_rejects_a_bad_token_with_league_error() {
        let harness = harness();
        let _tx = start_match(&harness).await;

        let message = Message::new(
            Sender::player("P01"),
            "R1M1",
            "forged-token",
            MessagePayload::GameJoinAck(GameJoinAck {
                match_id: "R1M1".to_string(),
                accept: true,
                arrival_timestamp: Utc::now(),
            }),
        );
        let request = json!({
            "jsonrpc": "2.0",
            "method": "game_join_ack",
            "params": message.into_params(),
            "id": 1,
        });
        let (status, Json(body)) = mcp_handler(State(harness.state.clone()), Json(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["message_type"], "LEAGUE_ERROR");
        assert_eq!(body["result"]["error_code"], "AUTH_TOKEN_INVALID");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_parity_choice_draws_a_game_error_and_counts_as_missing() {
        let harness = harness();
        let tx = start_match(&harness).await;
        tx.send(join("P01")).unwrap();
        tx.send(join("P02")).unwrap();
        tx.send(choice("P01", Parity::Even)).unwrap();

        // A syntactically valid envelope with an out-of-enum parity value.
        let token = harness
            .state
            .tokens
            .issue("P02", &harness.state.config.league_id, Role::Player)
            .unwrap();
        let request = json!({
            "jsonrpc": "2.0",
            "method": "choose_parity_response",
            "params": {
                "protocol": "league.v2",
                "message_type": "CHOOSE_PARITY_RESPONSE",
                "sender": "player:P02",
                "timestamp": "2026-08-02T10:00:00Z",
                "conversation_id": "R1M1",
                "auth_token": token,
                "match_id": "R1M1",
                "parity_choice": "seven",
            },
            "id": 1,
        });
        let (status, Json(body)) = mcp_handler(State(harness.state.clone()), Json(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].as_str().unwrap().contains("schema"));

        // The engine emitted INVALID_CHOICE and, with P02 still silent, the
        // match ends in a technical loss.
        let report = wait_for_report(&harness).await;
        assert_eq!(report.result.winner_player_id.as_deref(), Some("P01"));
        assert!(harness
            .gateway
            .game_errors()
            .iter()
            .any(|e| e.error_code == ErrorCode::InvalidChoice));
    }
}
