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

use std::collections::HashMap;
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
use league_sdk::messages::{
    self, ChooseParityResponse, ErrorCode, GameJoinAck, GameOver, GameStatus, LeagueError,
    LeagueRegisterRequest, LeagueStandingsUpdate, MatchRole, Message, MessagePayload, Parity,
    PlayerMeta, RegistrationStatus, Role, Sender,
};
use league_sdk::repos::{HistoryRecord, MatchOutcome, PlayerHistoryRepository};
use league_sdk::rpc::RpcClient;
use league_sdk::{JsonlLogger, TokenService};
use rand::Rng;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Identity assigned by the manager at registration time.
#[derive(Debug, Clone, Default)]
struct PlayerIdentity {
    player_id: String,
    auth_token: String,
}

#[derive(Debug, Clone)]
struct MatchAssignment {
    opponent_id: String,
    role: MatchRole,
    my_choice: Option<Parity>,
}

/// What the player knows about scheduled and running matches. Referee
/// endpoints come from the round announcement, keyed by match id.
#[derive(Default)]
struct MatchBook {
    referee_endpoints: HashMap<String, String>,
    active: HashMap<String, MatchAssignment>,
}

/// Picks `"even"` or `"odd"` from the opponent id and the match history
/// against that opponent. Pure with respect to its inputs apart from
/// randomness.
trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn choose(&self, opponent_id: &str, history: &[HistoryRecord]) -> Parity;
}

struct RandomStrategy;

impl Strategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn choose(&self, _opponent_id: &str, _history: &[HistoryRecord]) -> Parity {
        random_parity()
    }
}

/// Leans into an opponent's historical bias: an opponent that mostly plays
/// one parity gets matched on it (same choices always draw, which caps the
/// expected loss against a biased opponent).
struct PatternStrategy {
    threshold: f64,
}

impl Strategy for PatternStrategy {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn choose(&self, _opponent_id: &str, history: &[HistoryRecord]) -> Parity {
        let observed: Vec<Parity> = history.iter().filter_map(|m| m.opponent_choice).collect();
        if observed.is_empty() {
            return random_parity();
        }
        let even = observed.iter().filter(|c| **c == Parity::Even).count() as f64;
        let even_ratio = even / observed.len() as f64;
        if even_ratio >= self.threshold {
            Parity::Even
        } else if 1.0 - even_ratio >= self.threshold {
            Parity::Odd
        } else {
            random_parity()
        }
    }
}

fn random_parity() -> Parity {
    if rand::rng().random_bool(0.5) {
        Parity::Even
    } else {
        Parity::Odd
    }
}

fn strategy_from_name(name: &str) -> Arc<dyn Strategy> {
    match name {
        "pattern" => Arc::new(PatternStrategy { threshold: 0.6 }),
        "random" => Arc::new(RandomStrategy),
        other => {
            warn!(strategy = other, "unknown strategy; falling back to random");
            Arc::new(RandomStrategy)
        }
    }
}

/// Sends one protocol message to the referee currently running a match.
#[async_trait]
trait RefereeGateway: Send + Sync {
    async fn send(
        &self,
        endpoint: &str,
        conversation_id: &str,
        payload: MessagePayload,
    ) -> anyhow::Result<()>;
}

struct RpcRefereeGateway {
    rpc: Arc<RpcClient>,
    identity: Arc<RwLock<PlayerIdentity>>,
    generic_timeout: Duration,
    audit: Arc<JsonlLogger>,
}

#[async_trait]
impl RefereeGateway for RpcRefereeGateway {
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
            Sender::player(identity.player_id),
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

#[derive(Clone)]
struct AppState {
    config: Arc<LeagueConfig>,
    tokens: Arc<TokenService>,
    identity: Arc<RwLock<PlayerIdentity>>,
    book: Arc<RwLock<MatchBook>>,
    strategy: Arc<dyn Strategy>,
    history: Arc<PlayerHistoryRepository>,
    referee: Arc<dyn RefereeGateway>,
    latest_standings: Arc<RwLock<Option<LeagueStandingsUpdate>>>,
    audit: Arc<JsonlLogger>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "player_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = Arc::new(LeagueConfig::load());
    let data_root = std::env::var("LEAGUE_DATA_DIR")
        .ok()
        .unwrap_or_else(|| "./data".to_string());
    let manager_endpoint = std::env::var("LEAGUE_MANAGER_ENDPOINT")
        .ok()
        .unwrap_or_else(|| "http://localhost:8000/mcp".to_string());
    let public_endpoint = std::env::var("PLAYER_PUBLIC_ENDPOINT")
        .ok()
        .unwrap_or_else(|| "http://localhost:8101/mcp".to_string());
    let display_name = std::env::var("PLAYER_DISPLAY_NAME")
        .ok()
        .unwrap_or_else(|| "Even/Odd Player".to_string());
    let requested_id = std::env::var("PLAYER_ID")
        .ok()
        .unwrap_or_else(|| "P01".to_string());
    let strategy_name = std::env::var("PLAYER_STRATEGY")
        .ok()
        .unwrap_or_else(|| "random".to_string());

    let tokens = Arc::new(TokenService::from_env(config.token_expiry_hours));
    let identity = Arc::new(RwLock::new(PlayerIdentity {
        player_id: requested_id.clone(),
        auth_token: String::new(),
    }));
    let audit = Arc::new(JsonlLogger::new(
        format!("player:{requested_id}"),
        std::path::Path::new(&data_root)
            .join("logs")
            .join("agents")
            .join(format!("{requested_id}.log.jsonl")),
    )?);
    let rpc = Arc::new(RpcClient::new(config.rpc_client_config()));

    let state = AppState {
        config: config.clone(),
        tokens,
        identity: identity.clone(),
        book: Arc::new(RwLock::new(MatchBook::default())),
        strategy: strategy_from_name(&strategy_name),
        history: Arc::new(PlayerHistoryRepository::new(&data_root, &requested_id)),
        referee: Arc::new(RpcRefereeGateway {
            rpc: rpc.clone(),
            identity: identity.clone(),
            generic_timeout: config.timeouts.generic(),
            audit: audit.clone(),
        }),
        latest_standings: Arc::new(RwLock::new(None)),
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
                requested_id,
            )
            .await;
        });
    }

    let app = build_router(state);
    let bind_addr = parse_bind_addr("PLAYER_BIND", "0.0.0.0:8101")?;
    info!(%bind_addr, "player-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn register_with_manager(
    rpc: Arc<RpcClient>,
    config: Arc<LeagueConfig>,
    identity: Arc<RwLock<PlayerIdentity>>,
    manager_endpoint: String,
    public_endpoint: String,
    display_name: String,
    requested_id: String,
) {
    loop {
        let message = Message::new(
            Sender::player(requested_id.clone()),
            format!("register_{requested_id}"),
            "",
            MessagePayload::LeagueRegisterRequest(LeagueRegisterRequest {
                player_meta: PlayerMeta {
                    display_name: display_name.clone(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    game_types: vec![config.rules.game_type.clone()],
                    contact_endpoint: public_endpoint.clone(),
                },
            }),
        );

        match rpc
            .call(
                &manager_endpoint,
                "register_player",
                message.into_params(),
                Some(config.timeouts.http()),
            )
            .await
        {
            Ok(result) => match messages::decode_value(result) {
                Ok(response) => {
                    if let MessagePayload::LeagueRegisterResponse(response) = response.payload {
                        if response.status == RegistrationStatus::Accepted {
                            let player_id = response.player_id.unwrap_or(requested_id.clone());
                            info!(%player_id, "registered with league manager");
                            *identity.write().await = PlayerIdentity {
                                player_id,
                                auth_token: response.auth_token.unwrap_or_default(),
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
        .route("/admin/stats", get(stats_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let identity = state.identity.read().await;
    Json(json!({
        "ok": true,
        "service": "player-service",
        "player_id": identity.player_id,
        "registered": !identity.auth_token.is_empty(),
        "strategy": state.strategy.name(),
    }))
}

async fn stats_handler(State(state): State<AppState>) -> Json<Value> {
    let stats = state
        .history
        .load()
        .map(|h| h.stats)
        .unwrap_or_default();
    let my_rank = {
        let identity = state.identity.read().await;
        let standings = state.latest_standings.read().await;
        standings.as_ref().and_then(|update| {
            update
                .standings
                .iter()
                .find(|entry| entry.player_id == identity.player_id)
                .map(|entry| entry.rank)
        })
    };
    Json(json!({
        "stats": serde_json::to_value(stats).unwrap_or(Value::Null),
        "rank": my_rank,
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

async fn mcp_handler(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let id = request.get("id").cloned().unwrap_or(json!(1));
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    let message = match messages::decode_value(params) {
        Ok(message) => message,
        Err(error) => return rpc_error(id, -32602, error.to_string()),
    };
    state.audit.message_received(
        message.payload.message_type(),
        &message.envelope.sender.to_string(),
        &message.envelope.conversation_id,
    );

    // Match traffic arriving before registration completed has nowhere to go.
    {
        let identity = state.identity.read().await.clone();
        if identity.auth_token.is_empty() {
            let reply = Message::new(
                Sender::player(identity.player_id),
                message.envelope.conversation_id.clone(),
                "",
                MessagePayload::LeagueError(LeagueError {
                    error_code: ErrorCode::PlayerNotRegistered,
                    error_description: "player has not completed league registration".to_string(),
                    context: None,
                }),
            );
            return rpc_result(id, reply.into_params());
        }
    }

    let sender = message.envelope.sender.clone();
    let expected_agent =
        (!sender.agent_id.is_empty()).then_some(sender.agent_id.as_str());
    let claims = match state.tokens.validate(
        &message.envelope.auth_token,
        expected_agent,
        Some(&state.config.league_id),
    ) {
        Ok(claims) => claims,
        Err(error) => {
            let identity = state.identity.read().await.clone();
            let reply = Message::new(
                Sender::player(identity.player_id),
                message.envelope.conversation_id,
                identity.auth_token,
                MessagePayload::LeagueError(LeagueError {
                    error_code: error.error_code(),
                    error_description: error.to_string(),
                    context: None,
                }),
            );
            return rpc_result(id, reply.into_params());
        }
    };
    if claims.role != sender.role
        || !matches!(sender.role, Role::Referee | Role::LeagueManager)
    {
        return rpc_error(
            id,
            -32602,
            format!("unexpected sender '{sender}' for a player agent"),
        );
    }

    let conversation_id = message.envelope.conversation_id.clone();
    let result = match message.payload {
        MessagePayload::RoundAnnouncement(announcement) => {
            handle_round_announcement(&state, announcement).await
        }
        MessagePayload::GameInvitation(invitation) => {
            handle_game_invitation(&state, &conversation_id, invitation).await
        }
        MessagePayload::ChooseParityCall(call) => {
            handle_parity_call(&state, &conversation_id, call).await
        }
        MessagePayload::GameOver(game_over) => handle_game_over(&state, game_over).await,
        MessagePayload::LeagueStandingsUpdate(update) => {
            handle_standings_update(&state, update).await
        }
        MessagePayload::RoundCompleted(completed) => {
            info!(
                round_id = %completed.round_id,
                next_round = completed.next_round_id.as_deref().unwrap_or("-"),
                "round completed"
            );
            json!({"status": "acknowledged"})
        }
        MessagePayload::LeagueCompleted(completed) => {
            info!(
                champion = %completed.champion.player_id,
                total_rounds = completed.total_rounds,
                total_matches = completed.total_matches,
                "league completed"
            );
            state.audit.info(
                "LEAGUE_COMPLETED",
                json!({"champion": completed.champion.player_id}),
            );
            json!({"status": "acknowledged"})
        }
        MessagePayload::LeagueError(error) => {
            warn!(code = ?error.error_code, description = %error.error_description, "league error received");
            json!({"status": "acknowledged"})
        }
        MessagePayload::GameError(error) => {
            warn!(
                match_id = %error.match_id,
                code = ?error.error_code,
                retry_count = error.retry_count,
                "game error received"
            );
            json!({"status": "acknowledged"})
        }
        other => {
            return rpc_error(
                id,
                -32601,
                format!("message type {} is not accepted here", other.message_type()),
            );
        }
    };

    rpc_result(id, result)
}

async fn handle_round_announcement(
    state: &AppState,
    announcement: league_sdk::messages::RoundAnnouncement,
) -> Value {
    let my_id = state.identity.read().await.player_id.clone();
    let mut book = state.book.write().await;
    let mut my_matches = 0;
    for match_info in &announcement.matches {
        book.referee_endpoints
            .insert(match_info.match_id.clone(), match_info.referee_endpoint.clone());
        if match_info.player_a_id == my_id || match_info.player_b_id == my_id {
            my_matches += 1;
            let opponent = if match_info.player_a_id == my_id {
                &match_info.player_b_id
            } else {
                &match_info.player_a_id
            };
            info!(match_id = %match_info.match_id, %opponent, "match assigned this round");
        }
    }
    info!(round_id = %announcement.round_id, my_matches, "round announced");
    json!({"status": "acknowledged", "round_id": announcement.round_id})
}

async fn handle_game_invitation(
    state: &AppState,
    conversation_id: &str,
    invitation: league_sdk::messages::GameInvitation,
) -> Value {
    let endpoint = {
        let book = state.book.read().await;
        book.referee_endpoints.get(&invitation.match_id).cloned()
    };
    let Some(endpoint) = endpoint else {
        warn!(match_id = %invitation.match_id, "invitation for an unannounced match");
        return json!({"status": "rejected", "reason": "match was never announced"});
    };

    {
        let mut book = state.book.write().await;
        book.active.insert(
            invitation.match_id.clone(),
            MatchAssignment {
                opponent_id: invitation.opponent_id.clone(),
                role: invitation.role_in_match,
                my_choice: None,
            },
        );
    }
    info!(
        match_id = %invitation.match_id,
        opponent = %invitation.opponent_id,
        role = ?invitation.role_in_match,
        "invitation received"
    );

    let ack = MessagePayload::GameJoinAck(GameJoinAck {
        match_id: invitation.match_id.clone(),
        accept: true,
        arrival_timestamp: Utc::now(),
    });
    if let Err(error) = state.referee.send(&endpoint, conversation_id, ack).await {
        warn!(match_id = %invitation.match_id, %error, "failed to send join ack");
        return json!({"status": "error", "reason": error.to_string()});
    }
    json!({"status": "joined", "match_id": invitation.match_id})
}

async fn handle_parity_call(
    state: &AppState,
    conversation_id: &str,
    call: league_sdk::messages::ChooseParityCall,
) -> Value {
    let endpoint = {
        let book = state.book.read().await;
        book.referee_endpoints.get(&call.match_id).cloned()
    };
    let Some(endpoint) = endpoint else {
        warn!(match_id = %call.match_id, "parity call for an unknown match");
        return json!({"status": "rejected", "reason": "unknown match"});
    };

    let opponent_id = {
        let book = state.book.read().await;
        book.active
            .get(&call.match_id)
            .map(|a| a.opponent_id.clone())
            .unwrap_or_else(|| call.context.opponent_id.clone())
    };
    let history = state.history.against(&opponent_id).unwrap_or_default();
    let choice = state.strategy.choose(&opponent_id, &history);

    {
        let mut book = state.book.write().await;
        if let Some(assignment) = book.active.get_mut(&call.match_id) {
            assignment.my_choice = Some(choice);
        }
    }
    info!(
        match_id = %call.match_id,
        choice = choice.as_str(),
        deadline = %call.deadline,
        "parity chosen"
    );
    state.audit.info(
        "PARITY_CHOSEN",
        json!({"match_id": call.match_id, "choice": choice.as_str()}),
    );

    let response = MessagePayload::ChooseParityResponse(ChooseParityResponse {
        match_id: call.match_id.clone(),
        parity_choice: choice,
    });
    if let Err(error) = state.referee.send(&endpoint, conversation_id, response).await {
        warn!(match_id = %call.match_id, %error, "failed to send parity response");
        return json!({"status": "error", "reason": error.to_string()});
    }
    json!({"status": "choice_sent", "match_id": call.match_id})
}

async fn handle_game_over(state: &AppState, game_over: GameOver) -> Value {
    let my_id = state.identity.read().await.player_id.clone();
    let assignment = {
        let mut book = state.book.write().await;
        book.referee_endpoints.remove(&game_over.match_id);
        book.active.remove(&game_over.match_id)
    };

    let result = game_over.game_result;
    if result.status == GameStatus::Cancelled {
        info!(match_id = %game_over.match_id, reason = %result.reason, "match cancelled");
        return json!({"status": "acknowledged"});
    }

    let outcome = if result.winner_player_id.as_deref() == Some(my_id.as_str()) {
        MatchOutcome::Win
    } else if result.status == GameStatus::Draw {
        MatchOutcome::Draw
    } else {
        MatchOutcome::Loss
    };
    let points = result.score.get(&my_id).copied().unwrap_or(0);
    let opponent_id = assignment
        .as_ref()
        .map(|a| a.opponent_id.clone())
        .or_else(|| {
            result
                .choices
                .as_ref()
                .and_then(|choices| choices.keys().find(|k| *k != &my_id).cloned())
        })
        .unwrap_or_default();
    let my_choice = result
        .choices
        .as_ref()
        .and_then(|choices| choices.get(&my_id).copied())
        .or(assignment.as_ref().and_then(|a| a.my_choice));
    let opponent_choice = result
        .choices
        .as_ref()
        .and_then(|choices| choices.get(&opponent_id).copied());

    if let Err(error) = state.history.append(HistoryRecord {
        match_id: game_over.match_id.clone(),
        timestamp: Utc::now(),
        opponent_id,
        my_choice,
        opponent_choice,
        drawn_number: result.drawn_number,
        result: outcome,
        points,
    }) {
        warn!(match_id = %game_over.match_id, %error, "failed to persist history");
    }

    info!(
        match_id = %game_over.match_id,
        outcome = ?outcome,
        points,
        drawn_number = result.drawn_number.unwrap_or(-1),
        "match over"
    );
    state.audit.info(
        "MATCH_COMPLETED",
        json!({"match_id": game_over.match_id, "outcome": outcome, "points": points}),
    );
    json!({"status": "acknowledged"})
}

async fn handle_standings_update(state: &AppState, update: LeagueStandingsUpdate) -> Value {
    let my_id = state.identity.read().await.player_id.clone();
    if let Some(mine) = update.standings.iter().find(|e| e.player_id == my_id) {
        info!(
            round_id = %update.round_id,
            rank = mine.rank,
            points = mine.points,
            "standings update received"
        );
    }
    *state.latest_standings.write().await = Some(update);
    json!({"status": "acknowledged"})
}
