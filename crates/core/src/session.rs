//! Session identity and per-session storage namespaces.
//!
//! A session id is client-chosen, which makes it untrusted input that ends
//! up in filesystem paths. [`SessionId`] can only be constructed through
//! [`SessionId::parse`], so holding one is proof that it matched the
//! grammar and is safe to join onto a directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Reserved session used by the automation API. Exempt from expiry.
pub const AUTOMATION_SESSION: &str = "sid_ext_gen";

/// Longest accepted filename.
pub const MAX_FILENAME_LEN: usize = 255;

/// Subdirectory names inside a session namespace.
pub const REFERENCES_DIR: &str = "references";
pub const ASSETS_DIR: &str = "loras";

static SESSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^sid_[a-z0-9_-]{5,50}$").expect("session id pattern is valid")
});

static FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]+$").expect("filename pattern is valid"));

// ---------------------------------------------------------------------------
// Session id
// ---------------------------------------------------------------------------

/// A validated session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Validate `raw` against the session grammar.
    ///
    /// Malformed input is rejected outright, never repaired.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        if is_valid_session_id(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(CoreError::Validation("Invalid session ID".into()))
        }
    }

    /// The reserved automation session.
    pub fn automation() -> Self {
        Self(AUTOMATION_SESSION.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_automation(&self) -> bool {
        self.0 == AUTOMATION_SESSION
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

pub fn is_valid_session_id(raw: &str) -> bool {
    SESSION_RE.is_match(raw)
}

// ---------------------------------------------------------------------------
// Filenames
// ---------------------------------------------------------------------------

/// Check a client-supplied filename that refers to an existing file.
///
/// The grammar excludes path separators; names containing `..` are refused
/// as well.
pub fn validate_filename(name: &str) -> Result<(), CoreError> {
    if is_valid_filename(name) {
        Ok(())
    } else {
        Err(CoreError::Validation(format!("Invalid filename: {name:?}")))
    }
}

pub fn is_valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FILENAME_LEN
        && name != "."
        && !name.contains("..")
        && FILENAME_RE.is_match(name)
}

/// Derive a storable name for a brand-new file (an upload or download).
///
/// Disallowed characters become `_`. Only used when the server picks the
/// name; references to existing files go through [`validate_filename`].
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let mut cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", ".");
    }
    while cleaned.starts_with('.') {
        cleaned.remove(0);
    }
    cleaned.truncate(MAX_FILENAME_LEN);
    if cleaned.is_empty() {
        cleaned.push_str("file");
    }
    cleaned
}

// ---------------------------------------------------------------------------
// Storage namespaces
// ---------------------------------------------------------------------------

/// Filesystem layout for per-session data.
///
/// ```text
/// <sessions_root>/<sid>/references/   uploaded reference images
/// <sessions_root>/<sid>/loras/        imported weight assets
/// <outputs_root>/<sid>/               rendered images
/// ```
///
/// Directories are created lazily on first use.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions_root: PathBuf,
    outputs_root: PathBuf,
}

impl SessionStore {
    pub fn new(sessions_root: impl Into<PathBuf>, outputs_root: impl Into<PathBuf>) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            outputs_root: outputs_root.into(),
        }
    }

    pub fn sessions_root(&self) -> &Path {
        &self.sessions_root
    }

    pub fn outputs_root(&self) -> &Path {
        &self.outputs_root
    }

    pub fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.sessions_root.join(session.as_str())
    }

    pub async fn references_dir(&self, session: &SessionId) -> std::io::Result<PathBuf> {
        ensure_dir(self.session_dir(session).join(REFERENCES_DIR)).await
    }

    pub async fn assets_dir(&self, session: &SessionId) -> std::io::Result<PathBuf> {
        ensure_dir(self.session_dir(session).join(ASSETS_DIR)).await
    }

    pub async fn outputs_dir(&self, session: &SessionId) -> std::io::Result<PathBuf> {
        ensure_dir(self.outputs_root.join(session.as_str())).await
    }

    /// Path of a reference image inside the session namespace.
    ///
    /// Fails on a malformed filename; does not check existence.
    pub async fn reference_path(
        &self,
        session: &SessionId,
        filename: &str,
    ) -> Result<PathBuf, CoreError> {
        validate_filename(filename)?;
        let dir = self
            .references_dir(session)
            .await
            .map_err(|e| CoreError::Internal(format!("references dir: {e}")))?;
        Ok(dir.join(filename))
    }

    /// Path of an output image, for serving back to its owner.
    pub fn output_path(&self, session: &SessionId, filename: &str) -> Result<PathBuf, CoreError> {
        validate_filename(filename)?;
        Ok(self.outputs_root.join(session.as_str()).join(filename))
    }
}

async fn ensure_dir(path: PathBuf) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(&path).await?;
    Ok(path)
}
