//! Signed license tokens and metered-use accounting.
//!
//! Token format: `base64(json claims) "." base64(hmac_sha256(body))`, where
//! `body` is the first segment verbatim. Verification fails closed: any
//! parse, signature or expiry problem yields the unprivileged tier.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::PolicyError;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Issued tokens stay valid for this many days.
pub const TOKEN_VALIDITY_DAYS: i64 = 30;

/// Default number of uses for a metered key.
pub const DEFAULT_METERED_LIMIT: u32 = 50;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// License tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
}

/// Decoded token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseClaims {
    pub plan: Plan,
    /// Expiry as milliseconds since the Unix epoch.
    pub exp: i64,
    /// Present on metered keys only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Which activation key minted the token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl LicenseClaims {
    pub fn free() -> Self {
        Self {
            plan: Plan::Free,
            exp: 0,
            limit: None,
            key: None,
        }
    }

    pub fn is_pro(&self) -> bool {
        self.plan == Plan::Pro
    }

    pub fn is_metered(&self) -> bool {
        self.is_pro() && self.limit.is_some()
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Issues and verifies license tokens with a server-side secret.
#[derive(Clone)]
pub struct LicenseSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for LicenseSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseSigner").finish_non_exhaustive()
    }
}

impl LicenseSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Mint a token for `plan`, valid for [`TOKEN_VALIDITY_DAYS`] from `now`.
    pub fn issue(
        &self,
        plan: Plan,
        limit: Option<u32>,
        key: Option<String>,
        now: Timestamp,
    ) -> String {
        let claims = LicenseClaims {
            plan,
            exp: (now + chrono::Duration::days(TOKEN_VALIDITY_DAYS)).timestamp_millis(),
            limit,
            key,
        };
        // Serializing a plain struct of strings and integers cannot fail.
        let json = serde_json::to_vec(&claims).unwrap_or_default();
        let body = BASE64.encode(json);
        let sig = BASE64.encode(self.mac(&body).finalize().into_bytes());
        format!("{body}.{sig}")
    }

    /// Decode and check a token. Anything short of a valid, unexpired,
    /// correctly signed token yields [`LicenseClaims::free`].
    pub fn verify(&self, token: &str, now: Timestamp) -> LicenseClaims {
        self.try_verify(token, now).unwrap_or_else(LicenseClaims::free)
    }

    fn try_verify(&self, token: &str, now: Timestamp) -> Option<LicenseClaims> {
        let (body, sig) = token.split_once('.')?;
        let sig = BASE64.decode(sig).ok()?;
        self.mac(body).verify_slice(&sig).ok()?;
        let claims: LicenseClaims = serde_json::from_slice(&BASE64.decode(body).ok()?).ok()?;
        (claims.exp > now.timestamp_millis()).then_some(claims)
    }

    fn mac(&self, body: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(body.as_bytes());
        mac
    }
}

// ---------------------------------------------------------------------------
// Metered use
// ---------------------------------------------------------------------------

/// Result of a metered-use decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MeterOutcome {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
}

/// Remaining-use counters for metered tokens, keyed by the token itself.
///
/// A token's counter starts at its embedded limit the first time it is
/// seen. In-memory only; a restart resets every counter.
#[derive(Debug, Default)]
pub struct UsageMeter {
    remaining: Mutex<HashMap<String, u32>>,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decrement the counter for `token`, refusing once it reaches zero.
    pub fn consume(&self, token: &str, limit: u32) -> MeterOutcome {
        let mut map = self.remaining.lock().unwrap_or_else(PoisonError::into_inner);
        let left = map.entry(token.to_string()).or_insert(limit);
        if *left == 0 {
            return MeterOutcome {
                allowed: false,
                remaining: 0,
                limit,
            };
        }
        *left -= 1;
        MeterOutcome {
            allowed: true,
            remaining: *left,
            limit,
        }
    }

    /// Like [`consume`](Self::consume) but as a policy decision.
    pub fn charge(&self, token: &str, limit: u32) -> Result<MeterOutcome, PolicyError> {
        let outcome = self.consume(token, limit);
        if outcome.allowed {
            Ok(outcome)
        } else {
            Err(PolicyError::LimitReached {
                remaining: outcome.remaining,
                limit,
            })
        }
    }

    /// Seed a counter for a freshly issued token.
    pub fn prime(&self, token: &str, limit: u32) {
        self.remaining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.to_string(), limit);
    }

    pub fn remaining(&self, token: &str) -> Option<u32> {
        self.remaining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .copied()
    }
}
