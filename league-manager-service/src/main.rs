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

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use league_sdk::config::{LeagueConfig, parse_bind_addr};
use league_sdk::messages::{
    self, ErrorCode, GameResult, GameStatus, LeagueCompleted, LeagueError, LeagueRegisterRequest,
    LeagueRegisterResponse, LeagueStandingsUpdate, MatchInfo, MatchResultReport, Message,
    MessagePayload, RefereeRegisterRequest, RefereeRegisterResponse, RegistrationStatus, Role,
    RoundAnnouncement, RoundCompleted, RunMatchRequest, Sender, StandingEntry,
};
use league_sdk::repos::{JournalMatch, RoundsRepository, StandingsRepository};
use league_sdk::rpc::RpcClient;
use league_sdk::{JsonlLogger, TokenService};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

const MANAGER_ID: &str = "LEAGUE_MANAGER_01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum LeaguePhase {
    Initialized,
    Accepting,
    Scheduled,
    InProgress,
    Finished,
    Closed,
}

#[derive(Debug, Clone)]
struct PlayerRegistration {
    player_id: String,
    display_name: String,
    endpoint: String,
    auth_token: String,
}

#[derive(Debug, Clone)]
struct RefereeRegistration {
    referee_id: String,
    display_name: String,
    endpoint: String,
    max_concurrent_matches: u32,
    auth_token: String,
}

#[derive(Default)]
struct Registry {
    players: BTreeMap<String, PlayerRegistration>,
    referees: BTreeMap<String, RefereeRegistration>,
}

#[derive(Debug, Clone)]
struct PlannedMatch {
    match_id: String,
    player_a_id: String,
    player_b_id: String,
    referee_id: String,
    referee_endpoint: String,
}

#[derive(Debug, Clone)]
struct RoundPlan {
    round_id: String,
    matches: Vec<PlannedMatch>,
}

struct LeagueState {
    phase: LeaguePhase,
    schedule: Vec<RoundPlan>,
    current_round: usize,
    reported: HashSet<String>,
}

impl Default for LeagueState {
    fn default() -> Self {
        Self {
            phase: LeaguePhase::Initialized,
            schedule: Vec::new(),
            current_round: 0,
            reported: HashSet::new(),
        }
    }
}

/// Sends one protocol message to one player endpoint.
#[async_trait]
trait PlayerNotifier: Send + Sync {
    async fn notify(
        &self,
        endpoint: &str,
        conversation_id: &str,
        payload: MessagePayload,
    ) -> anyhow::Result<()>;
}

/// Instructs a referee to run a match.
#[async_trait]
trait MatchDispatcher: Send + Sync {
    async fn run_match(&self, referee_endpoint: &str, request: RunMatchRequest)
    -> anyhow::Result<()>;
}

struct RpcPlayerNotifier {
    rpc: Arc<RpcClient>,
    manager_token: String,
    generic_timeout: std::time::Duration,
    audit: Arc<JsonlLogger>,
}

#[async_trait]
impl PlayerNotifier for RpcPlayerNotifier {
    async fn notify(
        &self,
        endpoint: &str,
        conversation_id: &str,
        payload: MessagePayload,
    ) -> anyhow::Result<()> {
        let method = payload
            .rpc_method()
            .context("payload has no RPC method")?;
        let message_type = payload.message_type();
        let message = Message::new(
            Sender::manager(MANAGER_ID),
            conversation_id,
            self.manager_token.clone(),
            payload,
        );
        self.rpc
            .call(endpoint, method, message.into_params(), Some(self.generic_timeout))
            .await
            .map_err(|e| anyhow::anyhow!("notify {endpoint} failed: {e}"))?;
        self.audit.message_sent(message_type, endpoint, conversation_id);
        Ok(())
    }
}

struct HttpMatchDispatcher {
    client: reqwest::Client,
    generic_timeout: std::time::Duration,
}

#[async_trait]
impl MatchDispatcher for HttpMatchDispatcher {
    async fn run_match(
        &self,
        referee_endpoint: &str,
        request: RunMatchRequest,
    ) -> anyhow::Result<()> {
        let url = format!("{}/admin/run_match", admin_base(referee_endpoint));
        let response = self
            .client
            .post(&url)
            .timeout(self.generic_timeout)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("failed to call referee at {url}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            anyhow::bail!("referee returned {status}: {body}");
        }
        Ok(())
    }
}

/// Referee endpoints are advertised as `.../mcp`; admin routes hang off the
/// same base.
fn admin_base(endpoint: &str) -> &str {
    endpoint
        .trim_end_matches('/')
        .trim_end_matches("/mcp")
        .trim_end_matches('/')
}

#[derive(Clone)]
struct AppState {
    config: Arc<LeagueConfig>,
    tokens: Arc<TokenService>,
    manager_token: String,
    registry: Arc<RwLock<Registry>>,
    league: Arc<RwLock<LeagueState>>,
    standings_repo: Arc<StandingsRepository>,
    rounds_repo: Arc<RoundsRepository>,
    engine: StandingsEngine,
    notifier: Arc<dyn PlayerNotifier>,
    dispatcher: Arc<dyn MatchDispatcher>,
    audit: Arc<JsonlLogger>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "league_manager_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = Arc::new(LeagueConfig::load());
    let data_root = std::env::var("LEAGUE_DATA_DIR")
        .ok()
        .unwrap_or_else(|| "./data".to_string());

    let tokens = Arc::new(TokenService::from_env(config.token_expiry_hours));
    let manager_token = tokens.issue(MANAGER_ID, &config.league_id, Role::LeagueManager)?;

    let audit = Arc::new(JsonlLogger::new(
        format!("league_manager:{MANAGER_ID}"),
        std::path::Path::new(&data_root)
            .join("logs")
            .join("league")
            .join(&config.league_id)
            .join("league.log.jsonl"),
    )?);

    let rpc = Arc::new(RpcClient::new(config.rpc_client_config()));
    let state = AppState {
        config: config.clone(),
        tokens,
        manager_token: manager_token.clone(),
        registry: Arc::new(RwLock::new(Registry::default())),
        league: Arc::new(RwLock::new(LeagueState::default())),
        standings_repo: Arc::new(StandingsRepository::new(&data_root, &config.league_id)),
        rounds_repo: Arc::new(RoundsRepository::new(&data_root, &config.league_id)),
        engine: StandingsEngine {
            scoring: config.scoring,
        },
        notifier: Arc::new(RpcPlayerNotifier {
            rpc,
            manager_token,
            generic_timeout: config.timeouts.generic(),
            audit: audit.clone(),
        }),
        dispatcher: Arc::new(HttpMatchDispatcher {
            client: reqwest::Client::new(),
            generic_timeout: config.timeouts.generic(),
        }),
        audit,
    };

    let app = build_router(state);
    let bind_addr = parse_bind_addr("LEAGUE_MANAGER_BIND", "0.0.0.0:8000")?;
    info!(%bind_addr, league_id = %config.league_id, "league-manager-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mcp", post(mcp_handler))
        .route("/admin/start_league", post(start_league_handler))
        .route("/admin/standings", get(get_standings_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let phase = state.league.read().await.phase;
    Json(json!({
        "ok": true,
        "service": "league-manager-service",
        "league_id": state.config.league_id,
        "phase": phase,
    }))
}

// ---------------------------------------------------------------------------
// JSON-RPC ingress
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

/// Rejections that travel back as a `LEAGUE_ERROR` protocol message.
struct LeagueReject {
    code: ErrorCode,
    description: String,
}

impl LeagueReject {
    fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

async fn mcp_handler(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let id = request.get("id").cloned().unwrap_or(json!(1));
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    // The administrative start signal carries no envelope.
    if request.get("method").and_then(Value::as_str) == Some("start_league") {
        return match do_start_league(&state).await {
            Ok(summary) => rpc_result(id, summary),
            Err(error) => rpc_error(id, -32000, error.message),
        };
    }

    let message = match messages::decode_value(params) {
        Ok(message) => message,
        Err(error) => return rpc_error(id, -32602, error.to_string()),
    };
    state.audit.message_received(
        message.payload.message_type(),
        &message.envelope.sender.to_string(),
        &message.envelope.conversation_id,
    );

    let conversation_id = message.envelope.conversation_id.clone();
    let outcome = match message.payload.clone() {
        MessagePayload::RefereeRegisterRequest(request) => {
            register_referee(&state, &message, request).await
        }
        MessagePayload::LeagueRegisterRequest(request) => {
            register_player(&state, &message, request).await
        }
        MessagePayload::MatchResultReport(report) => {
            report_match_result(&state, &message, report).await
        }
        other => {
            return rpc_error(
                id,
                -32601,
                format!("message type {} is not accepted here", other.message_type()),
            );
        }
    };

    match outcome {
        Ok(result) => rpc_result(id, result),
        Err(reject) => {
            warn!(
                code = ?reject.code,
                description = %reject.description,
                sender = %message.envelope.sender,
                "request rejected"
            );
            let error_message = Message::new(
                Sender::manager(MANAGER_ID),
                conversation_id,
                state.manager_token.clone(),
                MessagePayload::LeagueError(LeagueError {
                    error_code: reject.code,
                    error_description: reject.description,
                    context: None,
                }),
            );
            rpc_result(id, error_message.into_params())
        }
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

fn endpoint_is_valid(endpoint: &str) -> bool {
    reqwest::Url::parse(endpoint)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}

fn next_free_id(prefix: &str, taken: impl Fn(&str) -> bool) -> String {
    let mut n = 1;
    loop {
        let candidate = format!("{prefix}{n:02}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

async fn register_referee(
    state: &AppState,
    inbound: &Message,
    request: RefereeRegisterRequest,
) -> Result<Value, LeagueReject> {
    let meta = request.referee_meta;
    let response = |status, referee_id: Option<String>, auth_token: Option<String>, reason| {
        let payload = MessagePayload::RefereeRegisterResponse(RefereeRegisterResponse {
            status,
            referee_id,
            auth_token,
            league_id: Some(state.config.league_id.clone()),
            rejection_reason: reason,
        });
        Message::new(
            Sender::manager(MANAGER_ID),
            inbound.envelope.conversation_id.clone(),
            state.manager_token.clone(),
            payload,
        )
        .into_params()
    };
    let rejected = |reason: String| response(RegistrationStatus::Rejected, None, None, Some(reason));

    if !meta.game_types.contains(&state.config.rules.game_type) {
        return Ok(rejected(format!(
            "referee does not support game type '{}'",
            state.config.rules.game_type
        )));
    }
    if !endpoint_is_valid(&meta.contact_endpoint) {
        return Ok(rejected(format!(
            "contact endpoint '{}' is not a valid http(s) URL",
            meta.contact_endpoint
        )));
    }

    let mut registry = state.registry.write().await;

    let requested_id = inbound.envelope.sender.agent_id.clone();
    if let Some(existing) = registry.referees.get(&requested_id) {
        if existing.endpoint == meta.contact_endpoint {
            return Ok(response(
                RegistrationStatus::Accepted,
                Some(existing.referee_id.clone()),
                Some(existing.auth_token.clone()),
                None,
            ));
        }
    }
    let referee_id = if !requested_id.is_empty() && !registry.referees.contains_key(&requested_id) {
        requested_id
    } else {
        next_free_id("REF", |id| registry.referees.contains_key(id))
    };

    let auth_token = state
        .tokens
        .issue(&referee_id, &state.config.league_id, Role::Referee)
        .map_err(|e| LeagueReject::new(ErrorCode::AuthTokenInvalid, e.to_string()))?;

    registry.referees.insert(
        referee_id.clone(),
        RefereeRegistration {
            referee_id: referee_id.clone(),
            display_name: meta.display_name.clone(),
            endpoint: meta.contact_endpoint.clone(),
            max_concurrent_matches: meta.max_concurrent_matches,
            auth_token: auth_token.clone(),
        },
    );
    drop(registry);

    let mut league = state.league.write().await;
    if league.phase == LeaguePhase::Initialized {
        league.phase = LeaguePhase::Accepting;
    }
    drop(league);

    info!(%referee_id, display_name = %meta.display_name, endpoint = %meta.contact_endpoint, "referee registered");
    state.audit.info(
        "REFEREE_REGISTERED",
        json!({"referee_id": referee_id, "endpoint": meta.contact_endpoint}),
    );

    Ok(response(
        RegistrationStatus::Accepted,
        Some(referee_id),
        Some(auth_token),
        None,
    ))
}

async fn register_player(
    state: &AppState,
    inbound: &Message,
    request: LeagueRegisterRequest,
) -> Result<Value, LeagueReject> {
    let meta = request.player_meta;
    let response = |status, player_id: Option<String>, auth_token: Option<String>, reason| {
        let payload = MessagePayload::LeagueRegisterResponse(LeagueRegisterResponse {
            status,
            player_id,
            auth_token,
            league_id: Some(state.config.league_id.clone()),
            rejection_reason: reason,
        });
        Message::new(
            Sender::manager(MANAGER_ID),
            inbound.envelope.conversation_id.clone(),
            state.manager_token.clone(),
            payload,
        )
        .into_params()
    };
    let rejected = |reason: String| response(RegistrationStatus::Rejected, None, None, Some(reason));

    {
        let league = state.league.read().await;
        if !matches!(league.phase, LeaguePhase::Initialized | LeaguePhase::Accepting) {
            return Ok(rejected("registration is closed".to_string()));
        }
    }
    if !meta.game_types.contains(&state.config.rules.game_type) {
        return Ok(rejected(format!(
            "player does not support game type '{}'",
            state.config.rules.game_type
        )));
    }
    if !endpoint_is_valid(&meta.contact_endpoint) {
        return Ok(rejected(format!(
            "contact endpoint '{}' is not a valid http(s) URL",
            meta.contact_endpoint
        )));
    }

    let mut registry = state.registry.write().await;

    let requested_id = inbound.envelope.sender.agent_id.clone();
    if let Some(existing) = registry.players.get(&requested_id) {
        if existing.endpoint == meta.contact_endpoint {
            return Ok(response(
                RegistrationStatus::Accepted,
                Some(existing.player_id.clone()),
                Some(existing.auth_token.clone()),
                None,
            ));
        }
    }

    // The max_players bound is enforced when the league starts, not here.
    let player_id = if !requested_id.is_empty() && !registry.players.contains_key(&requested_id) {
        requested_id
    } else {
        next_free_id("P", |id| registry.players.contains_key(id))
    };

    let auth_token = state
        .tokens
        .issue(&player_id, &state.config.league_id, Role::Player)
        .map_err(|e| LeagueReject::new(ErrorCode::AuthTokenInvalid, e.to_string()))?;

    registry.players.insert(
        player_id.clone(),
        PlayerRegistration {
            player_id: player_id.clone(),
            display_name: meta.display_name.clone(),
            endpoint: meta.contact_endpoint.clone(),
            auth_token: auth_token.clone(),
        },
    );
    drop(registry);

    let mut league = state.league.write().await;
    if league.phase == LeaguePhase::Initialized {
        league.phase = LeaguePhase::Accepting;
    }
    drop(league);

    info!(%player_id, display_name = %meta.display_name, endpoint = %meta.contact_endpoint, "player registered");
    state.audit.info(
        "PLAYER_REGISTERED",
        json!({"player_id": player_id, "endpoint": meta.contact_endpoint}),
    );

    Ok(response(
        RegistrationStatus::Accepted,
        Some(player_id),
        Some(auth_token),
        None,
    ))
}

// ---------------------------------------------------------------------------
// Result handling and round lifecycle
// ---------------------------------------------------------------------------

enum AfterReport {
    ResultApplied,
    RoundDone {
        round_id: String,
        completed_matches: Vec<String>,
        next_round: Option<usize>,
    },
}

async fn report_match_result(
    state: &AppState,
    inbound: &Message,
    report: MatchResultReport,
) -> Result<Value, LeagueReject> {
    let sender = &inbound.envelope.sender;
    let claims = state
        .tokens
        .validate(
            &inbound.envelope.auth_token,
            Some(&sender.agent_id),
            Some(&state.config.league_id),
        )
        .map_err(|e| LeagueReject::new(e.error_code(), e.to_string()))?;
    if claims.role != Role::Referee || sender.role != Role::Referee {
        return Err(LeagueReject::new(
            ErrorCode::AuthTokenInvalid,
            "match results must come from a referee",
        ));
    }

    if report.league_id != state.config.league_id {
        return Err(LeagueReject::new(
            ErrorCode::LeagueNotFound,
            format!("unknown league '{}'", report.league_id),
        ));
    }

    let players: Vec<(String, String)> = {
        let registry = state.registry.read().await;
        for player_id in report.result.score.keys() {
            if !registry.players.contains_key(player_id) {
                return Err(LeagueReject::new(
                    ErrorCode::PlayerNotFound,
                    format!("player '{player_id}' is not part of this league"),
                ));
            }
        }
        registry
            .players
            .values()
            .map(|p| (p.player_id.clone(), p.endpoint.clone()))
            .collect()
    };

    // Single-writer critical section over the standings and rounds journals.
    let after = {
        let mut league = state.league.write().await;
        if league.phase != LeaguePhase::InProgress {
            return Err(LeagueReject::new(
                ErrorCode::LeagueNotFound,
                "league is not in progress",
            ));
        }
        if !league.reported.insert(report.match_id.clone()) {
            warn!(match_id = %report.match_id, "duplicate match result ignored");
            state.audit.warn(
                "DUPLICATE_RESULT_IGNORED",
                json!({"match_id": report.match_id}),
            );
            return Ok(json!({"status": "duplicate_ignored", "match_id": report.match_id}));
        }

        let current = state
            .standings_repo
            .load()
            .map_err(|e| LeagueReject::new(ErrorCode::LeagueNotFound, e.to_string()))?;
        let updated = state.engine.apply(current.standings, &report.result);
        let snapshot = state
            .standings_repo
            .save(updated)
            .map_err(|e| LeagueReject::new(ErrorCode::LeagueNotFound, e.to_string()))?;
        state
            .rounds_repo
            .mark_match_completed(&report.round_id, &report.match_id, &report.result)
            .map_err(|e| LeagueReject::new(ErrorCode::LeagueNotFound, e.to_string()))?;

        info!(
            match_id = %report.match_id,
            round_id = %report.round_id,
            status = ?report.result.status,
            standings_version = snapshot.version,
            "match result applied"
        );
        state.audit.info(
            "MATCH_RESULT_APPLIED",
            json!({
                "match_id": report.match_id,
                "round_id": report.round_id,
                "standings_version": snapshot.version,
            }),
        );

        let round = state
            .rounds_repo
            .get_round(&report.round_id)
            .ok()
            .flatten();
        match round {
            Some(round) if round.is_complete() => {
                state
                    .rounds_repo
                    .mark_round_completed(&report.round_id)
                    .map_err(|e| LeagueReject::new(ErrorCode::LeagueNotFound, e.to_string()))?;
                state
                    .standings_repo
                    .increment_rounds_completed()
                    .map_err(|e| LeagueReject::new(ErrorCode::LeagueNotFound, e.to_string()))?;
                league.current_round += 1;
                let next_round = (league.current_round < league.schedule.len())
                    .then_some(league.current_round);
                if next_round.is_none() {
                    league.phase = LeaguePhase::Finished;
                }
                AfterReport::RoundDone {
                    round_id: report.round_id.clone(),
                    completed_matches: round.completed_match_ids(),
                    next_round,
                }
            }
            _ => AfterReport::ResultApplied,
        }
    };

    broadcast_standings(state, &report.round_id, &players).await;

    if let AfterReport::RoundDone {
        round_id,
        completed_matches,
        next_round,
    } = after
    {
        info!(%round_id, "round completed");
        state
            .audit
            .info("ROUND_COMPLETED", json!({"round_id": round_id}));

        let next_round_id = {
            let league = state.league.read().await;
            next_round.map(|idx| league.schedule[idx].round_id.clone())
        };
        broadcast_to_players(
            state,
            &players,
            format!("round_complete_{round_id}"),
            MessagePayload::RoundCompleted(RoundCompleted {
                round_id: round_id.clone(),
                league_id: state.config.league_id.clone(),
                completed_matches,
                next_round_id: next_round_id.clone(),
            }),
        )
        .await;

        match next_round {
            Some(idx) => announce_round(state, idx).await,
            None => complete_league(state, &players).await,
        }
    }

    Ok(json!({"status": "success", "match_id": report.match_id}))
}

async fn broadcast_standings(state: &AppState, round_id: &str, players: &[(String, String)]) {
    let standings = match state.standings_repo.load() {
        Ok(snapshot) => snapshot.standings,
        Err(error) => {
            warn!(%error, "failed to load standings for broadcast");
            return;
        }
    };
    broadcast_to_players(
        state,
        players,
        format!("standings_{round_id}"),
        MessagePayload::LeagueStandingsUpdate(LeagueStandingsUpdate {
            league_id: state.config.league_id.clone(),
            round_id: round_id.to_string(),
            standings,
        }),
    )
    .await;
}

/// Broadcasts proceed in parallel; an unreachable player is logged and
/// skipped, never aborting the round.
async fn broadcast_to_players(
    state: &AppState,
    players: &[(String, String)],
    conversation_id: String,
    payload: MessagePayload,
) {
    let mut tasks = JoinSet::new();
    for (player_id, endpoint) in players {
        let notifier = state.notifier.clone();
        let payload = payload.clone();
        let conversation_id = conversation_id.clone();
        let player_id = player_id.clone();
        let endpoint = endpoint.clone();
        tasks.spawn(async move {
            if let Err(error) = notifier.notify(&endpoint, &conversation_id, payload).await {
                warn!(%player_id, %endpoint, %error, "player broadcast failed");
            }
        });
    }
    while tasks.join_next().await.is_some() {}
}

async fn announce_round(state: &AppState, round_index: usize) {
    let (round, players) = {
        let league = state.league.read().await;
        let Some(round) = league.schedule.get(round_index).cloned() else {
            return;
        };
        let registry = state.registry.read().await;
        let players: Vec<(String, String)> = registry
            .players
            .values()
            .map(|p| (p.player_id.clone(), p.endpoint.clone()))
            .collect();
        (round, players)
    };

    if let Err(error) = state.rounds_repo.add_round(
        &round.round_id,
        round
            .matches
            .iter()
            .map(|m| JournalMatch {
                match_id: m.match_id.clone(),
                player_a_id: m.player_a_id.clone(),
                player_b_id: m.player_b_id.clone(),
                referee_id: m.referee_id.clone(),
                result: None,
            })
            .collect(),
    ) {
        warn!(round_id = %round.round_id, %error, "failed to journal round");
    }

    let matches: Vec<MatchInfo> = round
        .matches
        .iter()
        .map(|m| MatchInfo {
            match_id: m.match_id.clone(),
            game_type: state.config.rules.game_type.clone(),
            player_a_id: m.player_a_id.clone(),
            player_b_id: m.player_b_id.clone(),
            referee_endpoint: m.referee_endpoint.clone(),
        })
        .collect();

    broadcast_to_players(
        state,
        &players,
        format!("round_{}", round.round_id),
        MessagePayload::RoundAnnouncement(RoundAnnouncement {
            round_id: round.round_id.clone(),
            league_id: state.config.league_id.clone(),
            matches,
        }),
    )
    .await;
    info!(round_id = %round.round_id, match_count = round.matches.len(), "round announced");
    state.audit.info(
        "ROUND_ANNOUNCED",
        json!({"round_id": round.round_id, "matches": round.matches.len()}),
    );

    let endpoints: BTreeMap<String, String> = {
        let registry = state.registry.read().await;
        registry
            .players
            .values()
            .map(|p| (p.player_id.clone(), p.endpoint.clone()))
            .collect()
    };
    for planned in &round.matches {
        let (Some(endpoint_a), Some(endpoint_b)) = (
            endpoints.get(&planned.player_a_id),
            endpoints.get(&planned.player_b_id),
        ) else {
            warn!(match_id = %planned.match_id, "match references an unregistered player");
            continue;
        };
        let request = RunMatchRequest {
            match_id: planned.match_id.clone(),
            round_id: round.round_id.clone(),
            league_id: state.config.league_id.clone(),
            game_type: state.config.rules.game_type.clone(),
            player_a_id: planned.player_a_id.clone(),
            player_b_id: planned.player_b_id.clone(),
            player_a_endpoint: endpoint_a.clone(),
            player_b_endpoint: endpoint_b.clone(),
        };
        match state
            .dispatcher
            .run_match(&planned.referee_endpoint, request)
            .await
        {
            Ok(()) => {
                info!(match_id = %planned.match_id, referee_id = %planned.referee_id, "match dispatched");
                state.audit.info(
                    "MATCH_DISPATCHED",
                    json!({"match_id": planned.match_id, "referee_id": planned.referee_id}),
                );
            }
            Err(error) => {
                warn!(match_id = %planned.match_id, %error, "failed to dispatch match");
                state.audit.error(
                    "MATCH_DISPATCH_FAILED",
                    json!({"match_id": planned.match_id, "error": error.to_string()}),
                );
            }
        }
    }
}

async fn complete_league(state: &AppState, players: &[(String, String)]) {
    let snapshot = match state.standings_repo.load() {
        Ok(snapshot) => snapshot,
        Err(error) => {
            warn!(%error, "failed to load final standings");
            return;
        }
    };
    let final_standings = state.engine.rank(snapshot.standings);
    let Some(champion) = state.engine.champion(final_standings.clone()) else {
        warn!("league completed without any standings");
        return;
    };

    let (total_rounds, total_matches) = {
        let league = state.league.read().await;
        (
            league.schedule.len() as u32,
            league.schedule.iter().map(|r| r.matches.len() as u32).sum(),
        )
    };

    info!(champion = %champion.player_id, total_rounds, total_matches, "league completed");
    state.audit.info(
        "LEAGUE_COMPLETED",
        json!({
            "champion": champion.player_id,
            "total_rounds": total_rounds,
            "total_matches": total_matches,
        }),
    );

    broadcast_to_players(
        state,
        players,
        "league_complete".to_string(),
        MessagePayload::LeagueCompleted(LeagueCompleted {
            league_id: state.config.league_id.clone(),
            total_rounds,
            total_matches,
            champion,
            final_standings,
        }),
    )
    .await;

    let mut league = state.league.write().await;
    league.phase = LeaguePhase::Closed;
}

// ---------------------------------------------------------------------------
// Admin surface
// ---------------------------------------------------------------------------

async fn start_league_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    do_start_league(&state).await.map(Json)
}

async fn do_start_league(state: &AppState) -> Result<Value, ApiError> {
    let (player_ids, referees, display_names) = {
        let registry = state.registry.read().await;
        let player_ids: Vec<String> = registry.players.keys().cloned().collect();
        let referees: Vec<(String, String)> = registry
            .referees
            .values()
            .map(|r| (r.referee_id.clone(), r.endpoint.clone()))
            .collect();
        let display_names: BTreeMap<String, String> = registry
            .players
            .values()
            .map(|p| (p.player_id.clone(), p.display_name.clone()))
            .collect();
        (player_ids, referees, display_names)
    };

    {
        let mut league = state.league.write().await;
        if !matches!(
            league.phase,
            LeaguePhase::Initialized | LeaguePhase::Accepting
        ) {
            return Err(ApiError::bad_request("league already started"));
        }
        if player_ids.len() < state.config.rules.min_players {
            return Err(ApiError::bad_request(format!(
                "need at least {} players, have {}",
                state.config.rules.min_players,
                player_ids.len()
            )));
        }
        if player_ids.len() > state.config.rules.max_players {
            return Err(ApiError::bad_request(format!(
                "at most {} players allowed, have {}",
                state.config.rules.max_players,
                player_ids.len()
            )));
        }
        if referees.is_empty() {
            return Err(ApiError::bad_request("no referees registered"));
        }

        league.schedule = build_schedule(&player_ids, &referees);
        league.current_round = 0;
        league.phase = LeaguePhase::Scheduled;

        let initial = state.engine.initialize(&player_ids, &display_names);
        state
            .standings_repo
            .save(initial)
            .map_err(ApiError::internal_from)?;

        info!(
            players = player_ids.len(),
            rounds = league.schedule.len(),
            "league schedule generated"
        );
        state.audit.info(
            "LEAGUE_STARTING",
            json!({
                "players": player_ids.len(),
                "rounds": league.schedule.len(),
                "matches": league.schedule.iter().map(|r| r.matches.len()).sum::<usize>(),
            }),
        );

        // Referees may start reporting the instant matches are dispatched.
        league.phase = LeaguePhase::InProgress;
    }

    announce_round(state, 0).await;

    let league = state.league.read().await;
    Ok(json!({
        "status": "started",
        "league_id": state.config.league_id,
        "total_players": player_ids.len(),
        "total_rounds": league.schedule.len(),
        "total_matches": league.schedule.iter().map(|r| r.matches.len()).sum::<usize>(),
    }))
}

async fn get_standings_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let snapshot = state.standings_repo.load().map_err(ApiError::internal_from)?;
    Ok(Json(serde_json::to_value(snapshot).map_err(ApiError::internal_from)?))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal_from(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "admin request failed");
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Round-robin scheduler (circle method)
// ---------------------------------------------------------------------------

/// Pairings for one full round robin. Odd player counts get a bye slot; the
/// bye's matches are omitted. Deterministic for a given player order.
fn round_robin_pairings(player_ids: &[String]) -> Vec<Vec<(String, String)>> {
    if player_ids.len() < 2 {
        return Vec::new();
    }

    let mut slots: Vec<Option<String>> = player_ids.iter().cloned().map(Some).collect();
    if slots.len() % 2 == 1 {
        slots.push(None);
    }
    let n = slots.len();

    let mut rounds = Vec::with_capacity(n - 1);
    for _ in 0..n - 1 {
        let mut round = Vec::new();
        for i in 0..n / 2 {
            if let (Some(a), Some(b)) = (&slots[i], &slots[n - 1 - i]) {
                round.push((a.clone(), b.clone()));
            }
        }
        rounds.push(round);

        // Rotate every slot but the first.
        let last = slots.pop().expect("slots is never empty");
        slots.insert(1, last);
    }
    rounds
}

fn build_schedule(player_ids: &[String], referees: &[(String, String)]) -> Vec<RoundPlan> {
    round_robin_pairings(player_ids)
        .into_iter()
        .enumerate()
        .map(|(round_idx, pairings)| {
            let round_id = format!("R{}", round_idx + 1);
            let matches = pairings
                .into_iter()
                .enumerate()
                .map(|(match_idx, (player_a, player_b))| {
                    let (referee_id, referee_endpoint) = &referees[match_idx % referees.len()];
                    PlannedMatch {
                        match_id: format!("{round_id}M{}", match_idx + 1),
                        player_a_id: player_a,
                        player_b_id: player_b,
                        referee_id: referee_id.clone(),
                        referee_endpoint: referee_endpoint.clone(),
                    }
                })
                .collect();
            RoundPlan { round_id, matches }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Standings engine
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct StandingsEngine {
    scoring: league_sdk::config::ScoringConfig,
}

impl StandingsEngine {
    fn initialize(
        &self,
        player_ids: &[String],
        display_names: &BTreeMap<String, String>,
    ) -> Vec<StandingEntry> {
        let entries = player_ids
            .iter()
            .map(|player_id| StandingEntry {
                rank: 1,
                player_id: player_id.clone(),
                display_name: display_names
                    .get(player_id)
                    .cloned()
                    .unwrap_or_else(|| player_id.clone()),
                played: 0,
                wins: 0,
                draws: 0,
                losses: 0,
                points: 0,
            })
            .collect();
        self.rank(entries)
    }

    /// Applies one match result. Cancelled matches leave the table untouched;
    /// points stay derivable from the counts and the scoring weights.
    fn apply(&self, entries: Vec<StandingEntry>, result: &GameResult) -> Vec<StandingEntry> {
        if result.status == GameStatus::Cancelled {
            return self.rank(entries);
        }

        let mut entries = entries;
        for entry in &mut entries {
            if !result.score.contains_key(&entry.player_id) {
                continue;
            }
            entry.played += 1;
            match result.status {
                GameStatus::Win => {
                    if result.winner_player_id.as_deref() == Some(entry.player_id.as_str()) {
                        entry.wins += 1;
                        entry.points += self.scoring.win_points;
                    } else {
                        entry.losses += 1;
                        entry.points += self.scoring.loss_points;
                    }
                }
                GameStatus::Draw => {
                    entry.draws += 1;
                    entry.points += self.scoring.draw_points;
                }
                GameStatus::Cancelled => unreachable!("handled above"),
            }
        }
        self.rank(entries)
    }

    /// Sorts by points, then wins, then player id, and assigns dense ranks.
    fn rank(&self, mut entries: Vec<StandingEntry>) -> Vec<StandingEntry> {
        entries.sort_by(|a, b| {
            b.points
                .cmp(&a.points)
                .then(b.wins.cmp(&a.wins))
                .then(a.player_id.cmp(&b.player_id))
        });
        let mut rank = 0;
        let mut previous: Option<(i64, u32)> = None;
        for entry in &mut entries {
            let key = (entry.points, entry.wins);
            if previous != Some(key) {
                rank += 1;
                previous = Some(key);
            }
            entry.rank = rank;
        }
        entries
    }

    fn champion(&self, entries: Vec<StandingEntry>) -> Option<StandingEntry> {
        self.rank(entries).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use league_sdk::messages::{GameJoinAck, Parity, PlayerMeta, RefereeMeta};
    use std::sync::Mutex;

    struct RecordingNotifier {
        sent: Mutex<Vec<(String, MessagePayload)>>,
        fail_endpoints: Vec<String>,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_endpoints: Vec::new(),
            }
        }

        fn failing_for(endpoint: &str) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_endpoints: vec![endpoint.to_string()],
            }
        }

        fn message_types(&self) -> Vec<&'static str> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(_, payload)| payload.message_type())
                .collect()
        }
    }

    #[async_trait]
    impl PlayerNotifier for RecordingNotifier {
        async fn notify(
            &self,
            endpoint: &str,
            _conversation_id: &str,
            payload: MessagePayload,
        ) -> anyhow::Result<()> {
            if self.fail_endpoints.iter().any(|e| e == endpoint) {
                anyhow::bail!("endpoint unreachable");
            }
            self.sent
                .lock()
                .unwrap()
                .push((endpoint.to_string(), payload));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        dispatched: Mutex<Vec<RunMatchRequest>>,
    }

    #[async_trait]
    impl MatchDispatcher for RecordingDispatcher {
        async fn run_match(
            &self,
            _referee_endpoint: &str,
            request: RunMatchRequest,
        ) -> anyhow::Result<()> {
            self.dispatched.lock().unwrap().push(request);
            Ok(())
        }
    }

    struct TestHarness {
        state: AppState,
        notifier: Arc<RecordingNotifier>,
        dispatcher: Arc<RecordingDispatcher>,
        _dir: tempfile::TempDir,
    }

    fn harness_with(notifier: RecordingNotifier, config: LeagueConfig) -> TestHarness {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(config);
        let tokens = Arc::new(TokenService::new("manager-test-secret", 24));
        let manager_token = tokens
            .issue(MANAGER_ID, &config.league_id, Role::LeagueManager)
            .unwrap();
        let notifier = Arc::new(notifier);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let audit = Arc::new(
            JsonlLogger::new("league_manager:test", dir.path().join("league.log.jsonl")).unwrap(),
        );
        let state = AppState {
            tokens,
            manager_token,
            registry: Arc::new(RwLock::new(Registry::default())),
            league: Arc::new(RwLock::new(LeagueState::default())),
            standings_repo: Arc::new(StandingsRepository::new(dir.path(), &config.league_id)),
            rounds_repo: Arc::new(RoundsRepository::new(dir.path(), &config.league_id)),
            engine: StandingsEngine {
                scoring: config.scoring,
            },
            notifier: notifier.clone(),
            dispatcher: dispatcher.clone(),
            audit,
            config,
        };
        TestHarness {
            state,
            notifier,
            dispatcher,
            _dir: dir,
        }
    }

    fn harness() -> TestHarness {
        harness_with(RecordingNotifier::new(), LeagueConfig::default())
    }

    fn rpc_request(message: Message) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": message.payload.rpc_method().unwrap_or("mcp"),
            "params": message.clone().into_params(),
            "id": 1,
        })
    }

    async fn call_mcp(state: &AppState, message: Message) -> Value {
        let (status, Json(body)) = mcp_handler(State(state.clone()), Json(rpc_request(message))).await;
        assert_eq!(status, StatusCode::OK, "unexpected status: {body}");
        body["result"].clone()
    }

    async fn register_test_player(state: &AppState, name: &str, endpoint: &str) -> (String, String) {
        let message = Message::new(
            Sender::player(name),
            format!("reg_{name}"),
            "",
            MessagePayload::LeagueRegisterRequest(LeagueRegisterRequest {
                player_meta: PlayerMeta {
                    display_name: name.to_string(),
                    version: "1.0.0".to_string(),
                    game_types: vec!["even_odd".to_string()],
                    contact_endpoint: endpoint.to_string(),
                },
            }),
        );
        let result = call_mcp(state, message).await;
        assert_eq!(result["status"], "ACCEPTED", "registration failed: {result}");
        (
            result["player_id"].as_str().unwrap().to_string(),
            result["auth_token"].as_str().unwrap().to_string(),
        )
    }

    async fn register_test_referee(state: &AppState, name: &str, endpoint: &str) -> (String, String) {
        let message = Message::new(
            Sender::referee(name),
            format!("reg_{name}"),
            "",
            MessagePayload::RefereeRegisterRequest(RefereeRegisterRequest {
                referee_meta: RefereeMeta {
                    display_name: name.to_string(),
                    version: "1.0.0".to_string(),
                    game_types: vec!["even_odd".to_string()],
                    contact_endpoint: endpoint.to_string(),
                    max_concurrent_matches: 2,
                },
            }),
        );
        let result = call_mcp(state, message).await;
        assert_eq!(result["status"], "ACCEPTED", "registration failed: {result}");
        (
            result["referee_id"].as_str().unwrap().to_string(),
            result["auth_token"].as_str().unwrap().to_string(),
        )
    }

    fn win_report(match_id: &str, round_id: &str, league_id: &str, winner: &str, loser: &str) -> MatchResultReport {
        MatchResultReport {
            match_id: match_id.to_string(),
            round_id: round_id.to_string(),
            league_id: league_id.to_string(),
            result: GameResult {
                status: GameStatus::Win,
                winner_player_id: Some(winner.to_string()),
                drawn_number: Some(4),
                number_parity: Some(Parity::Even),
                choices: Some(BTreeMap::from([
                    (winner.to_string(), Parity::Even),
                    (loser.to_string(), Parity::Odd),
                ])),
                reason: "winner matched the drawn parity".to_string(),
                score: BTreeMap::from([(winner.to_string(), 3), (loser.to_string(), 0)]),
            },
        }
    }

    async fn start_test_league(harness: &TestHarness, player_count: usize) -> Vec<(String, String)> {
        let mut players = Vec::new();
        for i in 1..=player_count {
            let name = format!("P{i:02}");
            let endpoint = format!("http://localhost:9{i:03}/mcp");
            players.push(register_test_player(&harness.state, &name, &endpoint).await);
        }
        register_test_referee(&harness.state, "REF01", "http://localhost:8001/mcp").await;
        start_league_handler(State(harness.state.clone()))
            .await
            .unwrap();
        players
    }

    #[tokio::test]
    async fn registration_assigns_requested_then_sequential_ids() {
        let harness = harness();
        let (first, token) =
            register_test_player(&harness.state, "P01", "http://localhost:9001/mcp").await;
        assert_eq!(first, "P01");
        assert!(!token.is_empty());

        // Same id, different endpoint: a fresh id is assigned.
        let message = Message::new(
            Sender::player("P01"),
            "reg_dup",
            "",
            MessagePayload::LeagueRegisterRequest(LeagueRegisterRequest {
                player_meta: PlayerMeta {
                    display_name: "Other".to_string(),
                    version: "1.0.0".to_string(),
                    game_types: vec!["even_odd".to_string()],
                    contact_endpoint: "http://localhost:9002/mcp".to_string(),
                },
            }),
        );
        let result = call_mcp(&harness.state, message).await;
        assert_eq!(result["status"], "ACCEPTED");
        assert_eq!(result["player_id"], "P02");
    }

    #[tokio::test]
    async fn referee_registration_is_idempotent_for_same_endpoint() {
        let harness = harness();
        let (id_first, token_first) =
            register_test_referee(&harness.state, "REF01", "http://localhost:8001/mcp").await;
        let (id_second, token_second) =
            register_test_referee(&harness.state, "REF01", "http://localhost:8001/mcp").await;
        assert_eq!(id_first, id_second);
        assert_eq!(token_first, token_second);
        assert_eq!(harness.state.registry.read().await.referees.len(), 1);
    }

    #[tokio::test]
    async fn registration_rejects_unsupported_game_type_and_bad_endpoint() {
        let harness = harness();
        let message = Message::new(
            Sender::referee("REF01"),
            "reg",
            "",
            MessagePayload::RefereeRegisterRequest(RefereeRegisterRequest {
                referee_meta: RefereeMeta {
                    display_name: "Chess referee".to_string(),
                    version: "1.0.0".to_string(),
                    game_types: vec!["chess".to_string()],
                    contact_endpoint: "http://localhost:8001/mcp".to_string(),
                    max_concurrent_matches: 2,
                },
            }),
        );
        let result = call_mcp(&harness.state, message).await;
        assert_eq!(result["status"], "REJECTED");

        let message = Message::new(
            Sender::player("P01"),
            "reg",
            "",
            MessagePayload::LeagueRegisterRequest(LeagueRegisterRequest {
                player_meta: PlayerMeta {
                    display_name: "No endpoint".to_string(),
                    version: "1.0.0".to_string(),
                    game_types: vec!["even_odd".to_string()],
                    contact_endpoint: "not-a-url".to_string(),
                },
            }),
        );
        let result = call_mcp(&harness.state, message).await;
        assert_eq!(result["status"], "REJECTED");
    }

    #[tokio::test]
    async fn extra_players_register_fine_but_start_league_rejects_them() {
        let mut config = LeagueConfig::default();
        config.rules.max_players = 2;
        let harness = harness_with(RecordingNotifier::new(), config);

        // Registration itself has no cap; the bound applies at start time.
        for i in 1..=3 {
            let name = format!("P{i:02}");
            let endpoint = format!("http://localhost:9{i:03}/mcp");
            register_test_player(&harness.state, &name, &endpoint).await;
        }
        register_test_referee(&harness.state, "REF01", "http://localhost:8001/mcp").await;
        assert_eq!(harness.state.registry.read().await.players.len(), 3);

        let error = start_league_handler(State(harness.state.clone()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert!(error.message.contains("at most 2 players"));
        assert_eq!(
            harness.state.league.read().await.phase,
            LeaguePhase::Accepting
        );
    }

    #[test]
    fn round_robin_on_four_players_matches_the_classic_shape() {
        let players: Vec<String> = ["P01", "P02", "P03", "P04"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rounds = round_robin_pairings(&players);

        assert_eq!(rounds.len(), 3);
        assert_eq!(rounds.iter().map(Vec::len).sum::<usize>(), 6);

        let mut seen = HashSet::new();
        for round in &rounds {
            let mut in_round = HashSet::new();
            for (a, b) in round {
                assert_ne!(a, b);
                assert!(in_round.insert(a.clone()), "{a} plays twice in a round");
                assert!(in_round.insert(b.clone()), "{b} plays twice in a round");
                let pair = if a < b { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) };
                assert!(seen.insert(pair), "pair ({a},{b}) repeats");
            }
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn round_robin_with_odd_count_gives_each_round_a_bye() {
        let players: Vec<String> = ["P01", "P02", "P03", "P04", "P05"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rounds = round_robin_pairings(&players);

        assert_eq!(rounds.len(), 5);
        assert_eq!(rounds.iter().map(Vec::len).sum::<usize>(), 10);
        for round in &rounds {
            assert_eq!(round.len(), 2);
        }
    }

    #[test]
    fn schedule_assigns_stable_match_ids_and_referees() {
        let players: Vec<String> = ["P01", "P02", "P03", "P04"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let referees = vec![
            ("REF01".to_string(), "http://localhost:8001/mcp".to_string()),
            ("REF02".to_string(), "http://localhost:8002/mcp".to_string()),
        ];
        let schedule = build_schedule(&players, &referees);

        assert_eq!(schedule[0].round_id, "R1");
        assert_eq!(schedule[0].matches[0].match_id, "R1M1");
        assert_eq!(schedule[0].matches[1].match_id, "R1M2");
        assert_eq!(schedule[0].matches[0].referee_id, "REF01");
        assert_eq!(schedule[0].matches[1].referee_id, "REF02");
        assert_eq!(schedule[2].matches[1].match_id, "R3M2");

        // Deterministic for the same inputs.
        let again = build_schedule(&players, &referees);
        for (a, b) in schedule.iter().zip(again.iter()) {
            for (x, y) in a.matches.iter().zip(b.matches.iter()) {
                assert_eq!(x.player_a_id, y.player_a_id);
                assert_eq!(x.player_b_id, y.player_b_id);
            }
        }
    }

    #[test]
    fn standings_apply_simple_win() {
        let engine = StandingsEngine {
            scoring: league_sdk::config::ScoringConfig::default(),
        };
        let names = BTreeMap::new();
        let entries = engine.initialize(
            &["P01".to_string(), "P02".to_string()],
            &names,
        );
        let report = win_report("R1M1", "R1", "L1", "P01", "P02");
        let updated = engine.apply(entries, &report.result);

        let p01 = updated.iter().find(|e| e.player_id == "P01").unwrap();
        let p02 = updated.iter().find(|e| e.player_id == "P02").unwrap();
        assert_eq!((p01.played, p01.wins, p01.points, p01.rank), (1, 1, 3, 1));
        assert_eq!((p02.played, p02.losses, p02.points, p02.rank), (1, 1, 0, 2));

        let total_played: u32 = updated.iter().map(|e| e.played).sum();
        assert_eq!(total_played, 2);
    }

    #[test]
    fn standings_rank_is_dense_on_ties() {
        let engine = StandingsEngine {
            scoring: league_sdk::config::ScoringConfig::default(),
        };
        let mut entries = engine.initialize(
            &["P01".to_string(), "P02".to_string(), "P03".to_string()],
            &BTreeMap::new(),
        );
        for entry in &mut entries {
            if entry.player_id != "P03" {
                entry.played = 1;
                entry.wins = 1;
                entry.points = 3;
            }
        }
        let ranked = engine.rank(entries);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[1].rank, 1);
        assert_eq!(ranked[2].rank, 2);
        assert_eq!(ranked[2].player_id, "P03");
        assert_eq!(
            engine.champion(ranked.clone()).unwrap().player_id,
            "P01"
        );
    }

    #[test]
    fn cancelled_results_leave_standings_untouched() {
        let engine = StandingsEngine {
            scoring: league_sdk::config::ScoringConfig::default(),
        };
        let entries = engine.initialize(
            &["P01".to_string(), "P02".to_string()],
            &BTreeMap::new(),
        );
        let cancelled = GameResult {
            status: GameStatus::Cancelled,
            winner_player_id: None,
            drawn_number: None,
            number_parity: None,
            choices: None,
            reason: "players failed to join".to_string(),
            score: BTreeMap::from([("P01".to_string(), 0), ("P02".to_string(), 0)]),
        };
        let updated = engine.apply(entries, &cancelled);
        assert!(updated.iter().all(|e| e.played == 0 && e.points == 0));
    }

    #[tokio::test]
    async fn start_league_requires_min_players_and_a_referee() {
        let harness = harness();
        register_test_player(&harness.state, "P01", "http://localhost:9001/mcp").await;
        let error = start_league_handler(State(harness.state.clone()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);

        register_test_player(&harness.state, "P02", "http://localhost:9002/mcp").await;
        let error = start_league_handler(State(harness.state.clone()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn start_league_announces_round_one_and_dispatches_matches() {
        let harness = harness();
        start_test_league(&harness, 4).await;

        assert_eq!(
            harness.state.league.read().await.phase,
            LeaguePhase::InProgress
        );

        // Every player hears the round announcement.
        let announcements = harness
            .notifier
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| matches!(p, MessagePayload::RoundAnnouncement(_)))
            .count();
        assert_eq!(announcements, 4);

        // Two matches in round one, both dispatched with player endpoints.
        let dispatched = harness.dispatcher.dispatched.lock().unwrap();
        assert_eq!(dispatched.len(), 2);
        assert_eq!(dispatched[0].match_id, "R1M1");
        assert_eq!(dispatched[0].round_id, "R1");
        assert!(dispatched[0].player_a_endpoint.starts_with("http://"));

        // The journal has the round in progress.
        let round = harness.state.rounds_repo.get_round("R1").unwrap().unwrap();
        assert_eq!(round.matches.len(), 2);
        assert!(!round.is_complete());
    }

    #[tokio::test]
    async fn match_result_updates_standings_once_and_ignores_duplicates() {
        let harness = harness();
        start_test_league(&harness, 4).await;
        let referee_token = {
            let registry = harness.state.registry.read().await;
            registry.referees["REF01"].auth_token.clone()
        };

        let report = win_report(
            "R1M1",
            "R1",
            &harness.state.config.league_id,
            "P01",
            "P02",
        );
        let message = Message::new(
            Sender::referee("REF01"),
            "R1M1",
            referee_token.clone(),
            MessagePayload::MatchResultReport(report.clone()),
        );
        let result = call_mcp(&harness.state, message).await;
        assert_eq!(result["status"], "success");

        let snapshot = harness.state.standings_repo.load().unwrap();
        let version_after_first = snapshot.version;
        let p01 = snapshot
            .standings
            .iter()
            .find(|e| e.player_id == "P01")
            .unwrap();
        assert_eq!((p01.played, p01.wins, p01.points), (1, 1, 3));

        // Standings broadcast went out to all four players.
        let standings_updates = harness
            .notifier
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| matches!(p, MessagePayload::LeagueStandingsUpdate(_)))
            .count();
        assert_eq!(standings_updates, 4);

        // The duplicate is acknowledged but changes nothing.
        let message = Message::new(
            Sender::referee("REF01"),
            "R1M1",
            referee_token,
            MessagePayload::MatchResultReport(report),
        );
        let result = call_mcp(&harness.state, message).await;
        assert_eq!(result["status"], "duplicate_ignored");
        assert_eq!(
            harness.state.standings_repo.load().unwrap().version,
            version_after_first
        );
    }

    #[tokio::test]
    async fn invalid_token_is_rejected_with_league_error_and_no_state_change() {
        let harness = harness();
        start_test_league(&harness, 4).await;
        let version_before = harness.state.standings_repo.load().unwrap().version;

        let report = win_report(
            "R1M1",
            "R1",
            &harness.state.config.league_id,
            "P01",
            "P02",
        );
        let message = Message::new(
            Sender::referee("REF01"),
            "R1M1",
            "not-a-jwt",
            MessagePayload::MatchResultReport(report),
        );
        let result = call_mcp(&harness.state, message).await;
        assert_eq!(result["message_type"], "LEAGUE_ERROR");
        assert_eq!(result["error_code"], "AUTH_TOKEN_INVALID");
        assert_eq!(
            harness.state.standings_repo.load().unwrap().version,
            version_before
        );
    }

    #[tokio::test]
    async fn empty_token_is_rejected_as_missing() {
        let harness = harness();
        start_test_league(&harness, 4).await;

        let report = win_report(
            "R1M1",
            "R1",
            &harness.state.config.league_id,
            "P01",
            "P02",
        );
        let message = Message::new(
            Sender::referee("REF01"),
            "R1M1",
            "",
            MessagePayload::MatchResultReport(report),
        );
        let result = call_mcp(&harness.state, message).await;
        assert_eq!(result["message_type"], "LEAGUE_ERROR");
        assert_eq!(result["error_code"], "AUTH_TOKEN_MISSING");
    }

    #[tokio::test]
    async fn report_for_unknown_player_is_rejected() {
        let harness = harness();
        start_test_league(&harness, 4).await;
        let referee_token = {
            let registry = harness.state.registry.read().await;
            registry.referees["REF01"].auth_token.clone()
        };

        let report = win_report(
            "R1M1",
            "R1",
            &harness.state.config.league_id,
            "P99",
            "P02",
        );
        let message = Message::new(
            Sender::referee("REF01"),
            "R1M1",
            referee_token,
            MessagePayload::MatchResultReport(report),
        );
        let result = call_mcp(&harness.state, message).await;
        assert_eq!(result["error_code"], "PLAYER_NOT_FOUND");
    }

    #[tokio::test]
    async fn final_result_completes_round_and_league() {
        let harness = harness();
        start_test_league(&harness, 2).await;
        let referee_token = {
            let registry = harness.state.registry.read().await;
            registry.referees["REF01"].auth_token.clone()
        };

        let report = win_report(
            "R1M1",
            "R1",
            &harness.state.config.league_id,
            "P01",
            "P02",
        );
        let message = Message::new(
            Sender::referee("REF01"),
            "R1M1",
            referee_token,
            MessagePayload::MatchResultReport(report),
        );
        call_mcp(&harness.state, message).await;

        assert_eq!(harness.state.league.read().await.phase, LeaguePhase::Closed);

        let types = harness.notifier.message_types();
        assert!(types.contains(&"ROUND_ANNOUNCEMENT"));
        assert!(types.contains(&"LEAGUE_STANDINGS_UPDATE"));
        assert!(types.contains(&"ROUND_COMPLETED"));
        assert!(types.contains(&"LEAGUE_COMPLETED"));

        let sent = harness.notifier.sent.lock().unwrap();
        let completed = sent
            .iter()
            .find_map(|(_, p)| match p {
                MessagePayload::LeagueCompleted(c) => Some(c.clone()),
                _ => None,
            })
            .expect("league completion broadcast");
        assert_eq!(completed.champion.player_id, "P01");
        assert_eq!(completed.total_rounds, 1);
        assert_eq!(completed.total_matches, 1);
        assert_eq!(completed.final_standings[0].rank, 1);

        let round = harness.state.rounds_repo.get_round("R1").unwrap().unwrap();
        assert_eq!(round.status, league_sdk::repos::RoundStatus::Completed);
    }

    #[tokio::test]
    async fn completed_round_announces_the_next_one() {
        let harness = harness();
        start_test_league(&harness, 4).await;
        let referee_token = {
            let registry = harness.state.registry.read().await;
            registry.referees["REF01"].auth_token.clone()
        };

        for match_id in ["R1M1", "R1M2"] {
            let round = harness.state.rounds_repo.get_round("R1").unwrap().unwrap();
            let planned = round
                .matches
                .iter()
                .find(|m| m.match_id == match_id)
                .unwrap()
                .clone();
            let report = win_report(
                match_id,
                "R1",
                &harness.state.config.league_id,
                &planned.player_a_id,
                &planned.player_b_id,
            );
            let message = Message::new(
                Sender::referee("REF01"),
                match_id,
                referee_token.clone(),
                MessagePayload::MatchResultReport(report),
            );
            call_mcp(&harness.state, message).await;
        }

        // Round two announced to all four players and its matches dispatched.
        let sent = harness.notifier.sent.lock().unwrap();
        let round_two_announcements = sent
            .iter()
            .filter(|(_, p)| {
                matches!(p, MessagePayload::RoundAnnouncement(a) if a.round_id == "R2")
            })
            .count();
        assert_eq!(round_two_announcements, 4);
        drop(sent);

        let dispatched = harness.dispatcher.dispatched.lock().unwrap();
        assert_eq!(dispatched.iter().filter(|r| r.round_id == "R2").count(), 2);
        assert_eq!(harness.state.league.read().await.current_round, 1);
    }

    #[tokio::test]
    async fn broadcast_failure_does_not_abort_the_round() {
        let harness = harness_with(
            RecordingNotifier::failing_for("http://localhost:9002/mcp"),
            LeagueConfig::default(),
        );
        start_test_league(&harness, 2).await;
        let referee_token = {
            let registry = harness.state.registry.read().await;
            registry.referees["REF01"].auth_token.clone()
        };

        let report = win_report(
            "R1M1",
            "R1",
            &harness.state.config.league_id,
            "P01",
            "P02",
        );
        let message = Message::new(
            Sender::referee("REF01"),
            "R1M1",
            referee_token,
            MessagePayload::MatchResultReport(report),
        );
        let result = call_mcp(&harness.state, message).await;
        assert_eq!(result["status"], "success");
        assert_eq!(harness.state.league.read().await.phase, LeaguePhase::Closed);
    }

    #[tokio::test]
    async fn unsupported_message_type_gets_a_json_rpc_error() {
        let harness = harness();
        let message = Message::new(
            Sender::player("P01"),
            "conv",
            "",
            MessagePayload::GameJoinAck(GameJoinAck {
                match_id: "R1M1".to_string(),
                accept: true,
                arrival_timestamp: chrono::Utc::now(),
            }),
        );
        let (status, Json(body)) =
            mcp_handler(State(harness.state.clone()), Json(rpc_request(message))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn malformed_envelope_gets_invalid_params() {
        let harness = harness();
        let request = json!({
            "jsonrpc": "2.0",
            "method": "register_player",
            "params": {"protocol": "league.v1"},
            "id": 7,
        });
        let (status, Json(body)) = mcp_handler(State(harness.state.clone()), Json(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], -32602);
        assert_eq!(body["id"], 7);
    }

    #[test]
    fn admin_base_strips_the_mcp_suffix() {
        assert_eq!(admin_base("http://localhost:8001/mcp"), "http://localhost:8001");
        assert_eq!(admin_base("http://localhost:8001/mcp/"), "http://localhost:8001");
        assert_eq!(admin_base("http://localhost:8001"), "http://localhost:8001");
    }
}
