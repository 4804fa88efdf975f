//! License tier extractor.
//!
//! Reads `Authorization: Bearer <token>`. A token signed by this server
//! and not yet expired grants its plan; anything else (no header, bad
//! signature, expired, malformed) is the free tier. The automation API
//! key is accepted as an unmetered privileged credential.

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;
use kiln_core::license::{LicenseClaims, Plan};

use crate::state::AppState;

/// The caller's verified license.
#[derive(Debug, Clone)]
pub struct LicenseTier {
    pub claims: LicenseClaims,
    /// The raw token, kept as the key for metered usage.
    pub token: Option<String>,
    /// Authenticated with the automation API key.
    pub automation: bool,
}

impl LicenseTier {
    pub fn free() -> Self {
        Self {
            claims: LicenseClaims::free(),
            token: None,
            automation: false,
        }
    }

    /// The automation identity: privileged, never metered.
    pub fn automation() -> Self {
        Self {
            claims: LicenseClaims {
                plan: Plan::Pro,
                ..LicenseClaims::free()
            },
            token: None,
            automation: true,
        }
    }

    pub fn plan(&self) -> Plan {
        self.claims.plan
    }

    pub fn is_pro(&self) -> bool {
        self.claims.is_pro()
    }

    /// `(token, limit)` for a metered pro token.
    pub fn metered(&self) -> Option<(&str, u32)> {
        if self.automation || !self.claims.is_metered() {
            return None;
        }
        Some((self.token.as_deref()?, self.claims.limit?))
    }
}

/// The bearer credential from the `Authorization` header, if any.
pub fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<AppState> for LicenseTier {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts) else {
            return Ok(LicenseTier::free());
        };
        if token == state.config.external_api_key {
            return Ok(LicenseTier::automation());
        }
        let claims = state.signer.verify(token, Utc::now());
        Ok(LicenseTier {
            claims,
            token: Some(token.to_string()),
            automation: false,
        })
    }
}
