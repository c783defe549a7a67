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

//! Bearer tokens scoped to `(agent_id, league_id, role)`.
//!
//! Tokens are HS256 JWTs. The library verifies the signature; expiry is
//! checked by this module against an explicit `now` so validation is
//! deterministic under test.

use std::fmt;

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messages::{ErrorCode, Role};

pub const AUTH_SECRET_ENV: &str = "LEAGUE_AUTH_SECRET";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub league_id: String,
    pub role: Role,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    Missing,
    Invalid(String),
}

impl AuthError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AuthError::Missing => ErrorCode::AuthTokenMissing,
            AuthError::Invalid(_) => ErrorCode::AuthTokenInvalid,
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Missing => write!(f, "auth token missing"),
            AuthError::Invalid(detail) => write!(f, "auth token invalid: {detail}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Issues and validates league bearer tokens with a process-wide symmetric
/// secret.
#[derive(Clone)]
pub struct TokenService {
    secret: String,
    expiry_hours: i64,
}

impl TokenService {
    pub fn new(secret: impl Into<String>, expiry_hours: i64) -> Self {
        Self {
            secret: secret.into(),
            expiry_hours,
        }
    }

    /// Reads the signing secret from `LEAGUE_AUTH_SECRET`. Falls back to an
    /// ephemeral random secret, which only works when issuer and verifier
    /// share the process.
    pub fn from_env(expiry_hours: i64) -> Self {
        let secret = match std::env::var(AUTH_SECRET_ENV) {
            Ok(secret) if !secret.trim().is_empty() => secret,
            _ => {
                tracing::warn!(
                    env = AUTH_SECRET_ENV,
                    "auth secret not set; using an ephemeral process-local secret"
                );
                Uuid::new_v4().to_string()
            }
        };
        Self::new(secret, expiry_hours)
    }

    pub fn issue(&self, agent_id: &str, league_id: &str, role: Role) -> anyhow::Result<String> {
        self.issue_at(agent_id, league_id, role, Utc::now().timestamp())
    }

    pub fn issue_at(
        &self,
        agent_id: &str,
        league_id: &str,
        role: Role,
        now: i64,
    ) -> anyhow::Result<String> {
        let claims = Claims {
            sub: agent_id.to_string(),
            league_id: league_id.to_string(),
            role,
            iat: now,
            nbf: now,
            exp: now + Duration::hours(self.expiry_hours).num_seconds(),
            jti: Uuid::new_v4().simple().to_string(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;
        Ok(token)
    }

    pub fn validate(
        &self,
        token: &str,
        expected_agent_id: Option<&str>,
        expected_league_id: Option<&str>,
    ) -> Result<Claims, AuthError> {
        self.validate_at(token, expected_agent_id, expected_league_id, Utc::now().timestamp())
    }

    pub fn validate_at(
        &self,
        token: &str,
        expected_agent_id: Option<&str>,
        expected_league_id: Option<&str>,
        now: i64,
    ) -> Result<Claims, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::Missing);
        }

        // Signature only; time claims are checked below with zero leeway.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.required_spec_claims = ["sub", "exp"].iter().map(|s| s.to_string()).collect();

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| AuthError::Invalid(e.to_string()))?;
        let claims = data.claims;

        if now < claims.nbf {
            return Err(AuthError::Invalid("token not yet valid".to_string()));
        }
        if now >= claims.exp {
            return Err(AuthError::Invalid("token expired".to_string()));
        }
        if let Some(agent_id) = expected_agent_id
            && claims.sub != agent_id
        {
            return Err(AuthError::Invalid(format!(
                "token subject '{}' does not match sender '{}'",
                claims.sub, agent_id
            )));
        }
        if let Some(league_id) = expected_league_id
            && claims.league_id != league_id
        {
            return Err(AuthError::Invalid(format!(
                "token league '{}' does not match '{}'",
                claims.league_id, league_id
            )));
        }

        Ok(claims)
    }
}
