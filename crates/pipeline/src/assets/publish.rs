//! Making session-private assets visible to the engine.
//!
//! The engine only scans the shared asset folder, so a session file is
//! linked there under a session-prefixed name. Publication is followed by
//! a refresh and a bounded wait until the engine actually advertises the
//! new names.

use std::path::{Path, PathBuf};

use kiln_comfyui::backoff::BackoffConfig;
use kiln_comfyui::catalog::AssetCatalog;
use kiln_core::session::SessionId;

use super::AssetError;

/// Prefix of every name the gateway links into the shared folder.
pub const SESSION_LINK_PREFIX: &str = "sess_";

/// Ends the owner part of a link name. Valid in filenames but never in a
/// session id, so no session's prefix is a prefix of another's.
pub const OWNER_SEPARATOR: char = '.';

/// Shared-folder name for a session asset: `sess_<sid>.<filename>`.
pub fn published_name(session: &SessionId, filename: &str) -> String {
    format!("{}{filename}", owner_prefix(session))
}

fn owner_prefix(session: &SessionId) -> String {
    format!("{SESSION_LINK_PREFIX}{session}{OWNER_SEPARATOR}")
}

/// Whether `name` is a link that `session` published.
pub fn is_published_by(session: &SessionId, name: &str) -> bool {
    name.starts_with(&owner_prefix(session))
}

/// How an asset was made visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Symlink,
    HardLink,
    /// The workflow references the session file by absolute path.
    AbsolutePath,
    /// A link with this name was already in place.
    Existing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// The name to put in a loader node.
    pub workflow_name: String,
    pub kind: LinkKind,
}

/// Link `source` into `shared_root` as `sess_<sid>.<filename>`.
///
/// Tries a symlink, then a hard link. Referencing the file by absolute
/// path is only allowed when `allow_absolute` is set; otherwise failure
/// to link is an error.
pub async fn publish_session_asset(
    source: &Path,
    shared_root: &Path,
    session: &SessionId,
    filename: &str,
    allow_absolute: bool,
) -> Result<Publication, AssetError> {
    let name = published_name(session, filename);
    let link: PathBuf = shared_root.join(&name);

    if tokio::fs::symlink_metadata(&link).await.is_ok() {
        return Ok(Publication {
            workflow_name: name,
            kind: LinkKind::Existing,
        });
    }

    #[cfg(unix)]
    match tokio::fs::symlink(source, &link).await {
        Ok(()) => {
            tracing::debug!(session_id = %session, link = %name, "Published asset via symlink");
            return Ok(Publication {
                workflow_name: name,
                kind: LinkKind::Symlink,
            });
        }
        Err(e) => {
            tracing::debug!(session_id = %session, error = %e, "Symlink failed, trying hard link");
        }
    }

    match tokio::fs::hard_link(source, &link).await {
        Ok(()) => {
            tracing::debug!(session_id = %session, link = %name, "Published asset via hard link");
            Ok(Publication {
                workflow_name: name,
                kind: LinkKind::HardLink,
            })
        }
        Err(e) if allow_absolute => {
            tracing::warn!(
                session_id = %session,
                error = %e,
                "Linking failed, referencing asset by absolute path",
            );
            Ok(Publication {
                workflow_name: source.to_string_lossy().into_owned(),
                kind: LinkKind::AbsolutePath,
            })
        }
        Err(e) => {
            tracing::error!(session_id = %session, file = %filename, error = %e, "Could not publish asset");
            Err(AssetError::PublishFailed(filename.to_string()))
        }
    }
}

/// Result of waiting for the engine to advertise freshly published names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    Confirmed,
    /// Polling ran out while these names were still missing.
    TimedOut { missing: Vec<String> },
    /// Every attempt to read the catalog failed.
    Failed(String),
}

/// Refresh the catalog, then poll until every name in `names` is listed.
pub async fn await_visibility(
    catalog: &dyn AssetCatalog,
    names: &[String],
    backoff: &BackoffConfig,
) -> Visibility {
    if names.is_empty() {
        return Visibility::Confirmed;
    }
    if let Err(e) = catalog.refresh().await {
        tracing::warn!(error = %e, "Asset refresh request failed");
    }

    let mut delays = backoff.delays();
    let mut missing: Vec<String> = names.to_vec();
    let mut last_error: Option<String> = None;
    let mut any_success = false;

    loop {
        match catalog.advertised_assets().await {
            Ok(listed) => {
                any_success = true;
                missing.retain(|n| !listed.contains(n));
                if missing.is_empty() {
                    return Visibility::Confirmed;
                }
            }
            Err(e) => last_error = Some(e.to_string()),
        }
        match delays.next() {
            Some(wait) => tokio::time::sleep(wait).await,
            None => break,
        }
    }

    match last_error {
        Some(message) if !any_success => Visibility::Failed(message),
        _ => Visibility::TimedOut { missing },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeCatalog;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn sid() -> SessionId {
        SessionId::parse("sid_publish1").unwrap()
    }

    fn quick() -> BackoffConfig {
        BackoffConfig::fixed(Duration::from_millis(5), 3)
    }

    // ---- Test: linking ----

    #[tokio::test]
    async fn session_asset_is_linked_under_prefixed_name() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("mine.safetensors");
        std::fs::write(&source, b"weights").unwrap();
        let shared = tmp.path().join("shared");
        std::fs::create_dir(&shared).unwrap();

        let publication = publish_session_asset(&source, &shared, &sid(), "mine.safetensors", false)
            .await
            .unwrap();
        assert_eq!(publication.workflow_name, "sess_sid_publish1.mine.safetensors");
        assert_matches!(publication.kind, LinkKind::Symlink | LinkKind::HardLink);
        assert_eq!(
            std::fs::read(shared.join(&publication.workflow_name)).unwrap(),
            b"weights"
        );

        let again = publish_session_asset(&source, &shared, &sid(), "mine.safetensors", false)
            .await
            .unwrap();
        assert_eq!(again.kind, LinkKind::Existing);
    }

    #[tokio::test]
    async fn unlinkable_asset_fails_unless_absolute_paths_allowed() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("missing.safetensors");
        let shared = tmp.path().join("no-such-dir");

        assert_matches!(
            publish_session_asset(&source, &shared, &sid(), "missing.safetensors", false).await,
            Err(AssetError::PublishFailed(_))
        );

        let publication = publish_session_asset(&source, &shared, &sid(), "missing.safetensors", true)
            .await
            .unwrap();
        assert_eq!(publication.kind, LinkKind::AbsolutePath);
        assert_eq!(publication.workflow_name, source.to_string_lossy());
    }

    // ---- Test: visibility ----

    #[tokio::test]
    async fn names_appearing_after_refresh_are_confirmed() {
        let catalog = FakeCatalog::with_assets(&["base.safetensors"]);
        catalog.appear_on_refresh(&["sess_sid_publish1.a.safetensors"]);

        let outcome = await_visibility(
            &catalog,
            &["sess_sid_publish1.a.safetensors".to_string()],
            &quick(),
        )
        .await;
        assert_eq!(outcome, Visibility::Confirmed);
        assert_eq!(catalog.refresh_count(), 1);
    }

    #[tokio::test]
    async fn never_listed_names_time_out() {
        let catalog = FakeCatalog::with_assets(&[]);
        let outcome = await_visibility(&catalog, &["ghost.safetensors".to_string()], &quick()).await;
        assert_eq!(
            outcome,
            Visibility::TimedOut {
                missing: vec!["ghost.safetensors".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn unreachable_catalog_is_a_failure() {
        let catalog = FakeCatalog::with_assets(&[]);
        catalog.set_failing(true);
        let outcome = await_visibility(&catalog, &["x.safetensors".to_string()], &quick()).await;
        assert_matches!(outcome, Visibility::Failed(_));
    }

    #[tokio::test]
    async fn nothing_to_wait_for_skips_the_refresh() {
        let catalog = FakeCatalog::with_assets(&[]);
        assert_eq!(await_visibility(&catalog, &[], &quick()).await, Visibility::Confirmed);
        assert_eq!(catalog.refresh_count(), 0);
    }
}
