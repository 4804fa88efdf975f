use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_comfyui::backoff::BackoffConfig;
use kiln_comfyui::catalog::AssetCatalog;
use kiln_core::generation::AssetSpec;
use kiln_core::session::{validate_filename, SessionId, SessionStore};

use super::download::{
    guess_filename, inject_civitai_token, validate_download_url, DownloadedAsset, Downloader,
};
use super::progress::{ImportProgress, ProgressTracker, DEDUP_TTL, FINISHED_TTL};
use super::publish::{
    await_visibility, is_published_by, publish_session_asset, LinkKind, Visibility,
    SESSION_LINK_PREFIX,
};
use super::{has_asset_extension, AssetError};

#[derive(Debug, Clone)]
pub struct AssetResolverConfig {
    /// Folder the engine scans for assets.
    pub shared_root: PathBuf,
    /// Fall back to absolute paths when linking fails.
    pub allow_absolute_paths: bool,
    pub civitai_token: Option<String>,
    /// Poll schedule while waiting for published names to be advertised.
    pub visibility_backoff: BackoffConfig,
}

impl AssetResolverConfig {
    pub fn new(shared_root: impl Into<PathBuf>) -> Self {
        Self {
            shared_root: shared_root.into(),
            allow_absolute_paths: false,
            civitai_token: None,
            visibility_backoff: BackoffConfig::fixed(Duration::from_secs(1), 15),
        }
    }
}

/// An asset ready to be placed in a loader node.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAsset {
    pub workflow_name: String,
    pub strength_model: f64,
    pub strength_clip: f64,
}

/// Finds, fetches and publishes the assets a generation asks for.
pub struct AssetResolver {
    catalog: Arc<dyn AssetCatalog>,
    store: Arc<SessionStore>,
    downloader: Downloader,
    progress: Arc<ProgressTracker>,
    config: AssetResolverConfig,
}

impl AssetResolver {
    pub fn new(
        catalog: Arc<dyn AssetCatalog>,
        store: Arc<SessionStore>,
        downloader: Downloader,
        config: AssetResolverConfig,
    ) -> Self {
        Self {
            catalog,
            store,
            downloader,
            progress: Arc::new(ProgressTracker::new()),
            config,
        }
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn shared_root(&self) -> &Path {
        &self.config.shared_root
    }

    pub fn allow_absolute_paths(&self) -> bool {
        self.config.allow_absolute_paths
    }

    /// Resolve `specs` in order.
    ///
    /// Anything newly published is waited on once at the end. A wait that
    /// runs out is logged and the chain is returned anyway; the engine
    /// rejects the graph later if the asset really is missing.
    pub async fn resolve_chain(
        &self,
        session: &SessionId,
        specs: &[AssetSpec],
    ) -> Result<Vec<ResolvedAsset>, AssetError> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        let advertised = match self.catalog.advertised_assets().await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list engine assets, resolving from disk");
                Vec::new()
            }
        };

        let mut chain = Vec::with_capacity(specs.len());
        let mut awaiting = Vec::new();
        for spec in specs {
            let (workflow_name, needs_refresh) =
                self.resolve_one(session, spec, &advertised).await?;
            tracing::debug!(session_id = %session, asset = %workflow_name, "Asset resolved");
            if needs_refresh {
                awaiting.push(workflow_name.clone());
            }
            chain.push(ResolvedAsset {
                workflow_name,
                strength_model: spec.model_strength(),
                strength_clip: spec.clip_strength(),
            });
        }

        match await_visibility(
            self.catalog.as_ref(),
            &awaiting,
            &self.config.visibility_backoff,
        )
        .await
        {
            Visibility::Confirmed => {}
            Visibility::TimedOut { missing } => {
                tracing::warn!(
                    session_id = %session,
                    ?missing,
                    "Assets not yet advertised by the engine, submitting anyway",
                );
            }
            Visibility::Failed(message) => return Err(AssetError::VisibilityFailed(message)),
        }
        Ok(chain)
    }

    /// Returns the loader name and whether the engine must rescan for it.
    async fn resolve_one(
        &self,
        session: &SessionId,
        spec: &AssetSpec,
        advertised: &[String],
    ) -> Result<(String, bool), AssetError> {
        if let Some(name) = spec.requested_filename() {
            if is_foreign_link(session, name) {
                tracing::warn!(session_id = %session, asset = %name, "Rejected another session's asset");
                return Err(AssetError::NotFound(name.to_string()));
            }
            if advertised.iter().any(|a| a == name) {
                return Ok((name.to_string(), false));
            }
            validate_filename(name).map_err(|_| AssetError::InvalidFilename(name.to_string()))?;

            if file_exists(&self.config.shared_root.join(name)).await {
                return Ok((name.to_string(), true));
            }
            let session_file = self.store.assets_dir(session).await?.join(name);
            if file_exists(&session_file).await {
                return self.publish(session, &session_file, name).await;
            }
            if spec.url.is_none() {
                return Err(AssetError::NotFound(name.to_string()));
            }
        }

        let Some(url) = spec.url.as_deref() else {
            return Err(AssetError::NotFound("asset has neither a filename nor a URL".into()));
        };
        let guessed = validate_download_url(url)
            .ok()
            .and_then(|u| guess_filename(spec.requested_filename(), &u));
        if let Some(name) = guessed {
            if !is_foreign_link(session, &name) && advertised.iter().any(|a| *a == name) {
                tracing::debug!(session_id = %session, asset = %name, "URL asset already advertised by the engine");
                return Ok((name, false));
            }
        }
        let asset = self
            .import_url(session, url, spec.requested_filename())
            .await?;
        if asset.path.starts_with(&self.config.shared_root) {
            return Ok((asset.filename, true));
        }
        self.publish(session, &asset.path, &asset.filename).await
    }

    async fn publish(
        &self,
        session: &SessionId,
        source: &Path,
        filename: &str,
    ) -> Result<(String, bool), AssetError> {
        let publication = publish_session_asset(
            source,
            &self.config.shared_root,
            session,
            filename,
            self.config.allow_absolute_paths,
        )
        .await?;
        let needs_refresh = publication.kind != LinkKind::AbsolutePath;
        Ok((publication.workflow_name, needs_refresh))
    }

    /// Download `raw_url` into the session's asset folder.
    ///
    /// A file already present under the expected name (in the session or
    /// shared folder) is returned without fetching. Progress for the
    /// session is kept current throughout and left in a terminal state.
    pub async fn import_url(
        &self,
        session: &SessionId,
        raw_url: &str,
        filename: Option<&str>,
    ) -> Result<DownloadedAsset, AssetError> {
        let result = self.fetch_into_session(session, raw_url, filename).await;
        match &result {
            Ok(asset) => {
                let ttl = if asset.deduplicated { DEDUP_TTL } else { FINISHED_TTL };
                self.progress
                    .finish(session, ImportProgress::done(asset.bytes), ttl);
            }
            Err(e) => {
                tracing::warn!(session_id = %session, error = %e, "Asset import failed");
                self.progress
                    .finish(session, ImportProgress::failed(e.to_string()), FINISHED_TTL);
            }
        }
        result
    }

    async fn fetch_into_session(
        &self,
        session: &SessionId,
        raw_url: &str,
        filename: Option<&str>,
    ) -> Result<DownloadedAsset, AssetError> {
        let mut url = validate_download_url(raw_url)?;
        let dest = self.store.assets_dir(session).await?;

        if let Some(guess) = guess_filename(filename, &url) {
            for dir in [dest.as_path(), self.config.shared_root.as_path()] {
                let candidate = dir.join(&guess);
                if let Ok(meta) = tokio::fs::metadata(&candidate).await {
                    tracing::info!(session_id = %session, asset = %guess, "Asset already present, skipping download");
                    return Ok(DownloadedAsset {
                        filename: guess,
                        path: candidate,
                        bytes: meta.len(),
                        deduplicated: true,
                    });
                }
            }
        }

        inject_civitai_token(&mut url, self.config.civitai_token.as_deref());
        tracing::info!(session_id = %session, host = ?url.host_str(), "Downloading asset");
        self.progress
            .update(session, ImportProgress::downloading(0, 0));

        let progress = Arc::clone(&self.progress);
        let sid = session.clone();
        let on_progress = move |bytes: u64, total: u64| {
            progress.update(&sid, ImportProgress::downloading(bytes, total));
        };
        self.downloader
            .fetch(&url, filename, &dest, &on_progress)
            .await
    }

    /// Asset names a session may reference: shared files plus its own.
    ///
    /// Other sessions' published links are never listed.
    pub async fn list_available(&self, session: Option<&SessionId>) -> Result<Vec<String>, AssetError> {
        let mut names = BTreeSet::new();
        for name in asset_files(&self.config.shared_root).await? {
            if !name.starts_with(SESSION_LINK_PREFIX) {
                names.insert(name);
            }
        }
        if let Some(session) = session {
            let dir = self.store.session_dir(session).join(kiln_core::session::ASSETS_DIR);
            names.extend(asset_files(&dir).await?);
        }
        Ok(names.into_iter().collect())
    }
}

/// A `sess_` name that belongs to some other session.
fn is_foreign_link(session: &SessionId, name: &str) -> bool {
    name.starts_with(SESSION_LINK_PREFIX) && !is_published_by(session, name)
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

async fn asset_files(dir: &Path) -> Result<Vec<String>, AssetError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if has_asset_extension(&name) {
            names.push(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::download::DownloadLimits;
    use crate::assets::progress::ImportStatus;
    use crate::test_support::{serve, Canned, FakeCatalog};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        catalog: Arc<FakeCatalog>,
        store: Arc<SessionStore>,
        resolver: AssetResolver,
        shared: PathBuf,
    }

    fn fixture(advertised: &[&str]) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let shared = tmp.path().join("USER_LORA");
        std::fs::create_dir_all(&shared).unwrap();
        let store = Arc::new(SessionStore::new(
            tmp.path().join("sessions"),
            tmp.path().join("outputs"),
        ));
        let catalog = Arc::new(FakeCatalog::with_assets(advertised));
        let config = AssetResolverConfig {
            visibility_backoff: BackoffConfig::fixed(Duration::from_millis(5), 3),
            ..AssetResolverConfig::new(&shared)
        };
        let downloader = Downloader::new(DownloadLimits {
            max_bytes: 10_000,
            min_bytes: 10,
        })
        .unwrap();
        let resolver = AssetResolver::new(catalog.clone(), Arc::clone(&store), downloader, config);
        Fixture {
            _tmp: tmp,
            catalog,
            store,
            resolver,
            shared,
        }
    }

    fn sid() -> SessionId {
        SessionId::parse("sid_resolver1").unwrap()
    }

    fn named(name: &str) -> AssetSpec {
        AssetSpec {
            filename: Some(name.into()),
            ..Default::default()
        }
    }

    // ---- Test: lookup order ----

    #[tokio::test]
    async fn advertised_asset_is_used_as_is() {
        let fx = fixture(&["detail.safetensors"]);
        let chain = fx
            .resolver
            .resolve_chain(&sid(), &[named("detail.safetensors")])
            .await
            .unwrap();
        assert_eq!(chain[0].workflow_name, "detail.safetensors");
        assert_eq!(fx.catalog.refresh_count(), 0);
    }

    #[tokio::test]
    async fn session_asset_is_published_and_awaited() {
        let fx = fixture(&[]);
        let dir = fx.store.assets_dir(&sid()).await.unwrap();
        std::fs::write(dir.join("mine.safetensors"), b"weights").unwrap();
        fx.catalog
            .appear_on_refresh(&["sess_sid_resolver1.mine.safetensors"]);

        let chain = fx
            .resolver
            .resolve_chain(&sid(), &[named("mine.safetensors")])
            .await
            .unwrap();
        assert_eq!(chain[0].workflow_name, "sess_sid_resolver1.mine.safetensors");
        assert!(fx.shared.join("sess_sid_resolver1.mine.safetensors").exists());
        assert_eq!(fx.catalog.refresh_count(), 1);
    }

    #[tokio::test]
    async fn unadvertised_asset_still_resolves_after_wait_runs_out() {
        let fx = fixture(&[]);
        std::fs::write(fx.shared.join("late.safetensors"), b"w").unwrap();
        let chain = fx
            .resolver
            .resolve_chain(&sid(), &[named("late.safetensors")])
            .await
            .unwrap();
        assert_eq!(chain[0].workflow_name, "late.safetensors");
    }

    #[tokio::test]
    async fn missing_asset_without_url_is_not_found() {
        let fx = fixture(&[]);
        assert_matches!(
            fx.resolver
                .resolve_chain(&sid(), &[named("nowhere.safetensors")])
                .await,
            Err(AssetError::NotFound(name)) if name == "nowhere.safetensors"
        );
    }

    #[tokio::test]
    async fn other_sessions_links_are_off_limits() {
        let fx = fixture(&["sess_sid_someone.x.safetensors"]);
        assert_matches!(
            fx.resolver
                .resolve_chain(&sid(), &[named("sess_sid_someone.x.safetensors")])
                .await,
            Err(AssetError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn prefix_sharing_session_cannot_use_anothers_link() {
        let alice = SessionId::parse("sid_alice").unwrap();
        let alice_x = SessionId::parse("sid_alice_x").unwrap();
        let theirs = super::super::publish::published_name(&alice_x, "private.safetensors");
        assert!(is_foreign_link(&alice, &theirs));
        assert!(!is_foreign_link(&alice_x, &theirs));

        let fx = fixture(&[theirs.as_str()]);
        assert_matches!(
            fx.resolver.resolve_chain(&alice, &[named(&theirs)]).await,
            Err(AssetError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn url_asset_already_advertised_is_not_downloaded() {
        let fx = fixture(&["style.safetensors"]);
        let spec = AssetSpec {
            url: Some("https://example.com/files/style.safetensors".into()),
            ..Default::default()
        };
        let chain = fx.resolver.resolve_chain(&sid(), &[spec]).await.unwrap();
        assert_eq!(chain[0].workflow_name, "style.safetensors");
        assert_eq!(fx.catalog.refresh_count(), 0);
        assert!(!fx.store.assets_dir(&sid()).await.unwrap().join("style.safetensors").exists());
    }

    #[tokio::test]
    async fn chain_keeps_request_order_and_strengths() {
        let fx = fixture(&["a.safetensors", "b.safetensors"]);
        let specs = [
            AssetSpec {
                strength: Some(0.5),
                ..named("b.safetensors")
            },
            AssetSpec {
                strength_model: Some(99.0),
                strength_clip: Some(-0.25),
                ..named("a.safetensors")
            },
        ];
        let chain = fx.resolver.resolve_chain(&sid(), &specs).await.unwrap();
        let names: Vec<_> = chain.iter().map(|a| a.workflow_name.as_str()).collect();
        assert_eq!(names, ["b.safetensors", "a.safetensors"]);
        assert_eq!((chain[0].strength_model, chain[0].strength_clip), (0.5, 0.5));
        assert_eq!((chain[1].strength_model, chain[1].strength_clip), (10.0, -0.25));
    }

    // ---- Test: downloads ----

    #[tokio::test]
    async fn same_url_twice_downloads_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let base = serve(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Canned::ok(vec![3u8; 400])
        })
        .await;

        let fx = fixture(&[]);
        fx.catalog
            .appear_on_refresh(&["sess_sid_resolver1.style.safetensors"]);
        let spec = AssetSpec {
            filename: Some("style".into()),
            url: Some("https://example.com/ignored".into()),
            ..Default::default()
        };
        // The blocked-host guard would refuse the loopback test server, so
        // the first import goes through the downloader directly.
        let dest = fx.store.assets_dir(&sid()).await.unwrap();
        let url = reqwest::Url::parse(&format!("{base}/style")).unwrap();
        fx.resolver
            .downloader
            .fetch(&url, Some("style"), &dest, &|_, _| {})
            .await
            .unwrap();

        for _ in 0..2 {
            let chain = fx.resolver.resolve_chain(&sid(), &[spec.clone()]).await.unwrap();
            assert_eq!(chain[0].workflow_name, "sess_sid_resolver1.style.safetensors");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let stored: Vec<_> = std::fs::read_dir(&dest).unwrap().collect();
        assert_eq!(stored.len(), 1);
        assert_eq!(fx.resolver.progress().get(&sid()).status, ImportStatus::Done);
    }

    #[tokio::test]
    async fn blocked_import_leaves_error_progress() {
        let fx = fixture(&[]);
        let err = fx
            .resolver
            .import_url(&sid(), "http://169.254.169.254/latest", None)
            .await
            .unwrap_err();
        assert_matches!(err, AssetError::BlockedHost(_));

        let progress = fx.resolver.progress().get(&sid());
        assert_eq!(progress.status, ImportStatus::Error);
        assert!(progress.error.unwrap().contains("blocked"));
    }

    // ---- Test: listing ----

    #[tokio::test]
    async fn listing_merges_shared_and_own_files() {
        let fx = fixture(&[]);
        std::fs::write(fx.shared.join("global.safetensors"), b"w").unwrap();
        std::fs::write(fx.shared.join("sess_sid_other1.x.safetensors"), b"w").unwrap();
        std::fs::write(fx.shared.join("notes.txt"), b"w").unwrap();
        let dir = fx.store.assets_dir(&sid()).await.unwrap();
        std::fs::write(dir.join("own.bin"), b"w").unwrap();

        let names = fx.resolver.list_available(Some(&sid())).await.unwrap();
        assert_eq!(names, ["global.safetensors", "own.bin"]);

        let anonymous = fx.resolver.list_available(None).await.unwrap();
        assert_eq!(anonymous, ["global.safetensors"]);
    }
}
