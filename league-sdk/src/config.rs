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

//! League configuration. Built once at process start from an optional YAML
//! file (`LEAGUE_CONFIG_PATH`, with `${VAR}` expansion) plus environment
//! overrides, then passed into components by value. Immutable after start.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CONFIG_PATH_ENV: &str = "LEAGUE_CONFIG_PATH";
pub const LEAGUE_ID_ENV: &str = "LEAGUE_ID";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub join_ack_sec: u64,
    pub move_sec: u64,
    pub generic_sec: u64,
    pub http_sec: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            join_ack_sec: 5,
            move_sec: 30,
            generic_sec: 10,
            http_sec: 5,
        }
    }
}

impl TimeoutsConfig {
    pub fn join_ack(&self) -> Duration {
        Duration::from_secs(self.join_ack_sec)
    }

    pub fn move_timeout(&self) -> Duration {
        Duration::from_secs(self.move_sec)
    }

    pub fn generic(&self) -> Duration {
        Duration::from_secs(self.generic_sec)
    }

    pub fn http(&self) -> Duration {
        Duration::from_secs(self.http_sec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_base_sec: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_sec: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout_sec: u64,
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_sec: 30,
            half_open_probes: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub win_points: i64,
    pub draw_points: i64,
    pub loss_points: i64,
    pub technical_loss_points: i64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            win_points: 3,
            draw_points: 1,
            loss_points: 0,
            technical_loss_points: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeagueRules {
    pub game_type: String,
    pub min_players: usize,
    pub max_players: usize,
    pub number_range: [i64; 2],
    pub draw_on_both_wrong: bool,
}

impl Default for LeagueRules {
    fn default() -> Self {
        Self {
            game_type: "even_odd".to_string(),
            min_players: 2,
            max_players: 16,
            number_range: [0, 99],
            draw_on_both_wrong: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeagueConfig {
    pub league_id: String,
    pub timeouts: TimeoutsConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub scoring: ScoringConfig,
    pub rules: LeagueRules,
    pub token_expiry_hours: i64,
}

impl Default for LeagueConfig {
    fn default() -> Self {
        Self {
            league_id: "league_2026_even_odd".to_string(),
            timeouts: TimeoutsConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            scoring: ScoringConfig::default(),
            rules: LeagueRules::default(),
            token_expiry_hours: 24,
        }
    }
}

impl LeagueConfig {
    /// Loads the YAML file named by `LEAGUE_CONFIG_PATH` if present, then
    /// applies environment overrides. Any problem with the file falls back to
    /// defaults with a warning rather than refusing to start.
    pub fn load() -> Self {
        let mut config = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .and_then(|path| match std::fs::read_to_string(&path) {
                Ok(raw) => Self::parse_yaml(&path, &raw),
                Err(error) => {
                    warn!(path = %path, %error, "failed to read league config file");
                    None
                }
            })
            .unwrap_or_default();

        if let Ok(league_id) = std::env::var(LEAGUE_ID_ENV)
            && !league_id.trim().is_empty()
        {
            config.league_id = league_id.trim().to_string();
        }

        config
    }

    fn parse_yaml(path: &str, raw: &str) -> Option<Self> {
        let expanded = expand_env_vars(raw);
        match serde_yaml::from_str::<Self>(&expanded) {
            Ok(config) => Some(config),
            Err(error) => {
                warn!(path = %path, %error, "failed to parse league config yaml");
                None
            }
        }
    }

    pub fn rpc_client_config(&self) -> crate::rpc::RpcClientConfig {
        crate::rpc::RpcClientConfig {
            max_attempts: self.retry.max_retries,
            backoff_base: Duration::from_secs(self.retry.backoff_base_sec),
            http_timeout: self.timeouts.http(),
            breaker_failure_threshold: self.circuit_breaker.failure_threshold,
            breaker_open_timeout: Duration::from_secs(self.circuit_breaker.open_timeout_sec),
            breaker_half_open_probes: self.circuit_breaker.half_open_probes,
        }
    }
}

static ENV_VAR_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Replace `${VAR_NAME}` placeholders with environment variable values.
/// Unset variables expand to nothing, which lets optional keys fall back to
/// their serde defaults when the document is parsed.
pub fn expand_env_vars(input: &str) -> String {
    let pattern = ENV_VAR_PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("pattern compiles"));

    let mut expanded = String::with_capacity(input.len());
    let mut cursor = 0;
    for captures in pattern.captures_iter(input) {
        let placeholder = captures.get(0).expect("whole match always present");
        expanded.push_str(&input[cursor..placeholder.start()]);
        if let Ok(value) = std::env::var(&captures[1]) {
            expanded.push_str(&value);
        }
        cursor = placeholder.end();
    }
    expanded.push_str(&input[cursor..]);
    expanded
}

/// Read a socket bind address from an environment variable with a default.
pub fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<std::net::SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {var_name} '{value}': {e}"))
}
