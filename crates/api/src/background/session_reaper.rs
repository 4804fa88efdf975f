//! Periodic removal of abandoned session namespaces.
//!
//! A session directory untouched for [`SESSION_TTL`] is deleted together
//! with the `sess_<sid>.*` links it published into the shared asset
//! folder. The automation session is never reaped.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use kiln_core::session::SessionId;
use kiln_pipeline::assets::publish::is_published_by;
use tokio_util::sync::CancellationToken;

/// Idle time after which a session namespace is removed.
pub const SESSION_TTL: Duration = Duration::from_secs(8 * 3600);

/// How often the reaper runs.
const REAP_INTERVAL: Duration = Duration::from_secs(3600); // 1 hour

/// Run the reaper loop until `cancel` is triggered. The first sweep runs
/// immediately.
pub async fn run(sessions_root: PathBuf, shared_root: PathBuf, cancel: CancellationToken) {
    tracing::info!(
        ttl_hours = SESSION_TTL.as_secs() / 3600,
        interval_secs = REAP_INTERVAL.as_secs(),
        "Session reaper started"
    );

    let mut interval = tokio::time::interval(REAP_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Session reaper stopping");
                break;
            }
            _ = interval.tick() => {
                match sweep(&sessions_root, &shared_root, SESSION_TTL, SystemTime::now()).await {
                    Ok(0) => tracing::debug!("Session reaper: nothing expired"),
                    Ok(reaped) => tracing::info!(reaped, "Session reaper: removed expired sessions"),
                    Err(e) => tracing::error!(error = %e, "Session reaper: sweep failed"),
                }
            }
        }
    }
}

/// Remove every session under `sessions_root` idle for longer than `ttl`
/// as of `now`. Returns how many were removed.
///
/// Entries that are not valid session ids are left alone.
pub async fn sweep(
    sessions_root: &Path,
    shared_root: &Path,
    ttl: Duration,
    now: SystemTime,
) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(sessions_root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut reaped = 0;
    while let Some(entry) = entries.next_entry().await? {
        let Some(session) = entry
            .file_name()
            .to_str()
            .and_then(|name| SessionId::parse(name).ok())
        else {
            continue;
        };
        if session.is_automation() {
            continue;
        }

        let modified = entry.metadata().await?.modified()?;
        let idle = now.duration_since(modified).unwrap_or_default();
        if idle <= ttl {
            continue;
        }

        tracing::info!(session_id = %session, idle_secs = idle.as_secs(), "Removing expired session");
        if let Err(e) = remove_published_links(shared_root, &session).await {
            tracing::error!(session_id = %session, error = %e, "Failed to remove published asset links");
        }
        tokio::fs::remove_dir_all(entry.path()).await?;
        reaped += 1;
    }
    Ok(reaped)
}

async fn remove_published_links(shared_root: &Path, session: &SessionId) -> std::io::Result<()> {
    let mut entries = match tokio::fs::read_dir(shared_root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| is_published_by(session, name))
        {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}
