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

//! Shared SDK for the Even/Odd league: the `league.v2` message catalogue,
//! auth tokens, the JSON-RPC transport client, the JSONL audit logger, file
//! repositories, configuration, and the game rules.

pub mod auth;
pub mod config;
pub mod game;
pub mod logger;
pub mod messages;
pub mod repos;
pub mod rpc;

pub use auth::{AuthError, Claims, TokenService};
pub use config::LeagueConfig;
pub use game::EvenOddRules;
pub use logger::JsonlLogger;
pub use messages::{
    Envelope, ErrorCode, GameResult, GameStatus, Message, MessagePayload, Parity, ProtocolError,
    Role, Sender, PROTOCOL_VERSION,
};
pub use rpc::{RpcClient, RpcClientConfig, RpcError};
