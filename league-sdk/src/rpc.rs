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

//! Outbound JSON-RPC 2.0 over HTTP POST: one call with per-request timeout,
//! bounded retry with exponential backoff, and a per-endpoint circuit
//! breaker shared by every caller in the process.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    Timeout,
    Transport(String),
    Rpc { code: i64, message: String },
    CircuitOpen,
}

impl RpcError {
    /// Transport-class failures are retried and trip the breaker; RPC-level
    /// errors are neither.
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Timeout | RpcError::Transport(_))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Timeout => write!(f, "request timed out"),
            RpcError::Transport(detail) => write!(f, "transport error: {detail}"),
            RpcError::Rpc { code, message } => write!(f, "JSON-RPC error {code}: {message}"),
            RpcError::CircuitOpen => write!(f, "circuit breaker open"),
        }
    }
}

impl std::error::Error for RpcError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_probes_used: u32,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_probes_used: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub http_timeout: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_open_timeout: Duration,
    pub breaker_half_open_probes: u32,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            http_timeout: Duration::from_secs(5),
            breaker_failure_threshold: 5,
            breaker_open_timeout: Duration::from_secs(30),
            breaker_half_open_probes: 1,
        }
    }
}

pub struct RpcClient {
    client: reqwest::Client,
    config: RpcClientConfig,
    breakers: Mutex<HashMap<String, BreakerEntry>>,
    next_request_id: AtomicU64,
}

impl RpcClient {
    pub fn new(config: RpcClientConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            breakers: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// One JSON-RPC call. Timeouts and transport failures are retried with
    /// exponential backoff (base, 2x, 4x, ...); RPC-level errors are returned
    /// as-is on the first occurrence.
    pub async fn call(
        &self,
        endpoint: &str,
        method: &str,
        params: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, RpcError> {
        let request_timeout = timeout.unwrap_or(self.config.http_timeout);

        let mut last_error = RpcError::Transport("no attempt made".to_string());
        for attempt in 0..self.config.max_attempts {
            if !self.admit(endpoint) {
                return Err(RpcError::CircuitOpen);
            }

            match self
                .execute(endpoint, method, params.clone(), request_timeout)
                .await
            {
                Ok(result) => {
                    self.on_success(endpoint);
                    debug!(endpoint, method, attempt = attempt + 1, "rpc call succeeded");
                    return Ok(result);
                }
                Err(error) if error.is_transport() => {
                    self.on_failure(endpoint);
                    warn!(
                        endpoint,
                        method,
                        attempt = attempt + 1,
                        max_attempts = self.config.max_attempts,
                        error = %error,
                        "rpc call failed; will retry if attempts remain"
                    );
                    last_error = error;
                    if attempt + 1 < self.config.max_attempts {
                        tokio::time::sleep(self.config.backoff_base * 2u32.pow(attempt)).await;
                    }
                }
                Err(error) => {
                    // The peer answered; the breaker stays closed.
                    self.on_success(endpoint);
                    return Err(error);
                }
            }
        }

        Err(last_error)
    }

    async fn execute(
        &self,
        endpoint: &str,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_request_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .client
            .post(endpoint)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout
                } else {
                    RpcError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(RpcError::Transport(format!("HTTP {status}: {body}")));
        }

        let rpc_response: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| RpcError::Transport(e.to_string()))?;

        if let Some(error) = rpc_response.get("error") {
            return Err(RpcError::Rpc {
                code: error.get("code").and_then(serde_json::Value::as_i64).unwrap_or(-32603),
                message: error
                    .get("message")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        Ok(rpc_response
            .get("result")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    fn admit(&self, endpoint: &str) -> bool {
        let mut breakers = self.breakers.lock().expect("breaker map poisoned");
        let entry = breakers.entry(endpoint.to_string()).or_default();
        match entry.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.breaker_open_timeout {
                    entry.state = CircuitState::HalfOpen;
                    entry.half_open_probes_used = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if entry.half_open_probes_used < self.config.breaker_half_open_probes {
                    entry.half_open_probes_used += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self, endpoint: &str) {
        let mut breakers = self.breakers.lock().expect("breaker map poisoned");
        let entry = breakers.entry(endpoint.to_string()).or_default();
        *entry = BreakerEntry::default();
    }

    fn on_failure(&self, endpoint: &str) {
        let mut breakers = self.breakers.lock().expect("breaker map poisoned");
        let entry = breakers.entry(endpoint.to_string()).or_default();
        entry.consecutive_failures += 1;
        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Instant::now());
                entry.half_open_probes_used = 0;
            }
            CircuitState::Closed => {
                if entry.consecutive_failures >= self.config.breaker_failure_threshold {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(Instant::now());
                    warn!(endpoint, failures = entry.consecutive_failures, "circuit opened");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn circuit_state(&self, endpoint: &str) -> CircuitState {
        let breakers = self.breakers.lock().expect("breaker map poisoned");
        breakers
            .get(endpoint)
            .map(|entry| entry.state)
            .unwrap_or(CircuitState::Closed)
    }
}
