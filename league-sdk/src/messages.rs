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

//! The `league.v2` message catalogue: one envelope shared by every message
//! plus sixteen typed payloads, carried flattened in a single JSON object on
//! the JSON-RPC `params`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const PROTOCOL_VERSION: &str = "league.v2";

pub const DEFAULT_GAME_TYPE: &str = "even_odd";

/// The three agent classes that speak the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Player,
    Referee,
    LeagueManager,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Player => "player",
            Role::Referee => "referee",
            Role::LeagueManager => "league_manager",
        }
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "player" => Ok(Role::Player),
            "referee" => Ok(Role::Referee),
            "league_manager" => Ok(Role::LeagueManager),
            other => Err(ProtocolError::BadSender(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire identity `<role>:<agent_id>`, e.g. `player:P01`.
///
/// A bare `league_manager` (no id) is accepted on ingress; egress always uses
/// the qualified form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub role: Role,
    pub agent_id: String,
}

impl Sender {
    pub fn new(role: Role, agent_id: impl Into<String>) -> Self {
        Self {
            role,
            agent_id: agent_id.into(),
        }
    }

    pub fn player(agent_id: impl Into<String>) -> Self {
        Self::new(Role::Player, agent_id)
    }

    pub fn referee(agent_id: impl Into<String>) -> Self {
        Self::new(Role::Referee, agent_id)
    }

    pub fn manager(agent_id: impl Into<String>) -> Self {
        Self::new(Role::LeagueManager, agent_id)
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.agent_id)
    }
}

impl FromStr for Sender {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((role, agent_id)) = s.split_once(':') {
            if agent_id.is_empty() {
                return Err(ProtocolError::BadSender(s.to_string()));
            }
            return Ok(Self {
                role: role.parse()?,
                agent_id: agent_id.to_string(),
            });
        }
        if s == "league_manager" {
            return Ok(Self {
                role: Role::LeagueManager,
                agent_id: String::new(),
            });
        }
        Err(ProtocolError::BadSender(s.to_string()))
    }
}

impl Serialize for Sender {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Sender {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Envelope fields present on every protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    pub conversation_id: String,
    #[serde(default)]
    pub auth_token: String,
}

impl Envelope {
    pub fn new(sender: Sender, conversation_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            sender,
            timestamp: Utc::now(),
            conversation_id: conversation_id.into(),
            auth_token: auth_token.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    Even,
    Odd,
}

impl Parity {
    pub fn as_str(self) -> &'static str {
        match self {
            Parity::Even => "even",
            Parity::Odd => "odd",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    Win,
    Draw,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchRole {
    PlayerA,
    PlayerB,
}

/// Stable error code strings shared across the protocol (§7 taxonomy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TimeoutError,
    InvalidChoice,
    MissingRequiredField,
    ConnectionError,
    AuthTokenMissing,
    AuthTokenInvalid,
    PlayerNotFound,
    LeagueNotFound,
    PlayerNotRegistered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefereeMeta {
    pub display_name: String,
    pub version: String,
    pub game_types: Vec<String>,
    pub contact_endpoint: String,
    pub max_concurrent_matches: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerMeta {
    pub display_name: String,
    pub version: String,
    pub game_types: Vec<String>,
    pub contact_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchInfo {
    pub match_id: String,
    pub game_type: String,
    #[serde(rename = "player_A_id")]
    pub player_a_id: String,
    #[serde(rename = "player_B_id")]
    pub player_b_id: String,
    pub referee_endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandingEntry {
    pub rank: u32,
    pub player_id: String,
    pub display_name: String,
    pub played: u32,
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
    pub points: i64,
}

/// Outcome of a single match, including the per-player score map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameResult {
    pub status: GameStatus,
    pub winner_player_id: Option<String>,
    pub drawn_number: Option<i64>,
    pub number_parity: Option<Parity>,
    pub choices: Option<BTreeMap<String, Parity>>,
    pub reason: String,
    pub score: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParityCallContext {
    pub opponent_id: String,
    pub round_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefereeRegisterRequest {
    pub referee_meta: RefereeMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefereeRegisterResponse {
    pub status: RegistrationStatus,
    pub referee_id: Option<String>,
    pub auth_token: Option<String>,
    pub league_id: Option<String>,
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeagueRegisterRequest {
    pub player_meta: PlayerMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeagueRegisterResponse {
    pub status: RegistrationStatus,
    pub player_id: Option<String>,
    pub auth_token: Option<String>,
    pub league_id: Option<String>,
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundAnnouncement {
    pub round_id: String,
    pub league_id: String,
    pub matches: Vec<MatchInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundCompleted {
    pub round_id: String,
    pub league_id: String,
    pub completed_matches: Vec<String>,
    pub next_round_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameInvitation {
    pub match_id: String,
    pub game_type: String,
    pub role_in_match: MatchRole,
    pub opponent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameJoinAck {
    pub match_id: String,
    pub accept: bool,
    pub arrival_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChooseParityCall {
    pub match_id: String,
    pub game_type: String,
    pub deadline: DateTime<Utc>,
    pub context: ParityCallContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChooseParityResponse {
    pub match_id: String,
    pub parity_choice: Parity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameOver {
    pub match_id: String,
    pub game_result: GameResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResultReport {
    pub match_id: String,
    pub round_id: String,
    pub league_id: String,
    pub result: GameResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeagueStandingsUpdate {
    pub league_id: String,
    pub round_id: String,
    pub standings: Vec<StandingEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeagueCompleted {
    pub league_id: String,
    pub total_rounds: u32,
    pub total_matches: u32,
    pub champion: StandingEntry,
    pub final_standings: Vec<StandingEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeagueError {
    pub error_code: ErrorCode,
    pub error_description: String,
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameError {
    pub match_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub affected_player: Option<String>,
    pub action_required: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub consequence: Option<String>,
}

/// The sixteen payloads, tagged by `message_type`. Routing a message is a
/// total match over this enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePayload {
    RefereeRegisterRequest(RefereeRegisterRequest),
    RefereeRegisterResponse(RefereeRegisterResponse),
    LeagueRegisterRequest(LeagueRegisterRequest),
    LeagueRegisterResponse(LeagueRegisterResponse),
    RoundAnnouncement(RoundAnnouncement),
    RoundCompleted(RoundCompleted),
    GameInvitation(GameInvitation),
    GameJoinAck(GameJoinAck),
    ChooseParityCall(ChooseParityCall),
    ChooseParityResponse(ChooseParityResponse),
    GameOver(GameOver),
    MatchResultReport(MatchResultReport),
    LeagueStandingsUpdate(LeagueStandingsUpdate),
    LeagueCompleted(LeagueCompleted),
    LeagueError(LeagueError),
    GameError(GameError),
}

impl MessagePayload {
    pub fn message_type(&self) -> &'static str {
        match self {
            MessagePayload::RefereeRegisterRequest(_) => "REFEREE_REGISTER_REQUEST",
            MessagePayload::RefereeRegisterResponse(_) => "REFEREE_REGISTER_RESPONSE",
            MessagePayload::LeagueRegisterRequest(_) => "LEAGUE_REGISTER_REQUEST",
            MessagePayload::LeagueRegisterResponse(_) => "LEAGUE_REGISTER_RESPONSE",
            MessagePayload::RoundAnnouncement(_) => "ROUND_ANNOUNCEMENT",
            MessagePayload::RoundCompleted(_) => "ROUND_COMPLETED",
            MessagePayload::GameInvitation(_) => "GAME_INVITATION",
            MessagePayload::GameJoinAck(_) => "GAME_JOIN_ACK",
            MessagePayload::ChooseParityCall(_) => "CHOOSE_PARITY_CALL",
            MessagePayload::ChooseParityResponse(_) => "CHOOSE_PARITY_RESPONSE",
            MessagePayload::GameOver(_) => "GAME_OVER",
            MessagePayload::MatchResultReport(_) => "MATCH_RESULT_REPORT",
            MessagePayload::LeagueStandingsUpdate(_) => "LEAGUE_STANDINGS_UPDATE",
            MessagePayload::LeagueCompleted(_) => "LEAGUE_COMPLETED",
            MessagePayload::LeagueError(_) => "LEAGUE_ERROR",
            MessagePayload::GameError(_) => "GAME_ERROR",
        }
    }

    /// JSON-RPC method a payload travels on when sent as a request. The two
    /// registration responses only ever travel as RPC results.
    pub fn rpc_method(&self) -> Option<&'static str> {
        match self {
            MessagePayload::RefereeRegisterRequest(_) => Some("register_referee"),
            MessagePayload::LeagueRegisterRequest(_) => Some("register_player"),
            MessagePayload::MatchResultReport(_) => Some("report_match_result"),
            MessagePayload::RoundAnnouncement(_) => Some("notify_round"),
            MessagePayload::RoundCompleted(_) => Some("notify_round_completed"),
            MessagePayload::LeagueCompleted(_) => Some("notify_league_completed"),
            MessagePayload::LeagueStandingsUpdate(_) => Some("notify_standings_update"),
            MessagePayload::GameInvitation(_) => Some("game_invitation"),
            MessagePayload::GameJoinAck(_) => Some("game_join_ack"),
            MessagePayload::ChooseParityCall(_) => Some("choose_parity_call"),
            MessagePayload::ChooseParityResponse(_) => Some("choose_parity_response"),
            MessagePayload::GameOver(_) => Some("game_over"),
            MessagePayload::LeagueError(_) => Some("league_error"),
            MessagePayload::GameError(_) => Some("game_error"),
            MessagePayload::RefereeRegisterResponse(_)
            | MessagePayload::LeagueRegisterResponse(_) => None,
        }
    }
}

/// A complete protocol message: envelope and payload flattened into one
/// JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(flatten)]
    pub payload: MessagePayload,
}

impl Message {
    pub fn new(
        sender: Sender,
        conversation_id: impl Into<String>,
        auth_token: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            envelope: Envelope::new(sender, conversation_id, auth_token),
            payload,
        }
    }

    pub fn into_params(self) -> serde_json::Value {
        serde_json::to_value(self).expect("protocol message serializes")
    }
}

/// Admin dispatch contract between the manager and a referee. Travels on the
/// referee's `/admin/run_match` route, outside the `league.v2` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMatchRequest {
    pub match_id: String,
    pub round_id: String,
    pub league_id: String,
    pub game_type: String,
    pub player_a_id: String,
    pub player_b_id: String,
    pub player_a_endpoint: String,
    pub player_b_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMatchResponse {
    pub accepted: bool,
    pub match_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    WrongProtocol(String),
    BadTimestamp(String),
    BadSender(String),
    Schema(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::WrongProtocol(got) => write!(f, "unsupported protocol '{got}'"),
            ProtocolError::BadTimestamp(got) => {
                write!(f, "timestamp '{got}' is not a UTC instant with Z suffix")
            }
            ProtocolError::BadSender(got) => write!(f, "sender '{got}' is not '<role>:<id>'"),
            ProtocolError::Schema(detail) => write!(f, "payload schema violation: {detail}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Decode and validate one inbound message. The envelope is validated
/// universally; the payload is validated against the schema selected by
/// `message_type`.
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Schema(e.to_string()))?;
    decode_value(value)
}

/// Same as [`decode`] for an already-parsed JSON-RPC `params` value.
pub fn decode_value(value: serde_json::Value) -> Result<Message, ProtocolError> {
    let object = value
        .as_object()
        .ok_or_else(|| ProtocolError::Schema("message must be a JSON object".to_string()))?;

    match object.get("protocol").and_then(serde_json::Value::as_str) {
        Some(PROTOCOL_VERSION) => {}
        Some(other) => return Err(ProtocolError::WrongProtocol(other.to_string())),
        None => return Err(ProtocolError::WrongProtocol("<missing>".to_string())),
    }

    let raw_timestamp = object
        .get("timestamp")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProtocolError::BadTimestamp("<missing>".to_string()))?;
    if !raw_timestamp.ends_with('Z') || DateTime::parse_from_rfc3339(raw_timestamp).is_err() {
        return Err(ProtocolError::BadTimestamp(raw_timestamp.to_string()));
    }

    let raw_sender = object
        .get("sender")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProtocolError::BadSender("<missing>".to_string()))?;
    let _: Sender = raw_sender.parse()?;

    serde_json::from_value(value).map_err(|e| ProtocolError::Schema(e.to_string()))
}
