//! Guarded, streamed downloads of third-party weight files.
//!
//! Guards, in the order they apply:
//!
//! 1. URL: http(s) only, bounded length, host not loopback/private/link-local
//!    (checked on the literal hostname, no DNS). Every redirect hop is held
//!    to the same rule.
//! 2. Response headers: non-2xx status, `text/html` content type, or a
//!    declared length over the ceiling abort before anything touches disk.
//! 3. Body: the first bytes are sniffed for markup; a running counter
//!    aborts once the ceiling is passed.
//! 4. Result: files under the floor are discarded.
//!
//! Bytes land in `tmp_<uuid>.part` and are renamed into place only after
//! every guard passed.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use kiln_core::session::{sanitize_filename, MAX_FILENAME_LEN};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::Url;
use tokio::io::AsyncWriteExt;

use super::{has_asset_extension, AssetError, DEFAULT_ASSET_EXTENSION};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const MAX_ASSET_BYTES: u64 = 2 * 1024 * 1024 * 1024;
pub const MIN_ASSET_BYTES: u64 = 1024 * 1024;
pub const MAX_URL_LEN: usize = 2048;
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Redirect hops followed before the download is abandoned.
const MAX_REDIRECTS: usize = 10;

/// Bytes inspected for markup at the start of the body.
const SNIFF_LEN: usize = 100;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; kiln-asset-fetcher/0.1)";

const BLOCKED_HOST_PREFIXES: &[&str] = &[
    "localhost", "127.", "::1", "0.0.0.0", "10.", "172.16.", "172.17.", "172.18.", "172.19.",
    "172.20.", "172.21.", "172.22.", "172.23.", "172.24.", "172.25.", "172.26.", "172.27.",
    "172.28.", "172.29.", "172.30.", "172.31.", "192.168.", "169.254.", "fc00:", "fe80:",
];

// ---------------------------------------------------------------------------
// URL and name helpers
// ---------------------------------------------------------------------------

/// Parse and vet a client-supplied download URL.
pub fn validate_download_url(raw: &str) -> Result<Url, AssetError> {
    let raw = raw.trim();
    if raw.len() > MAX_URL_LEN {
        return Err(AssetError::UrlTooLong(MAX_URL_LEN));
    }
    let url = Url::parse(raw).map_err(|e| AssetError::InvalidUrl(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AssetError::UnsupportedScheme);
    }
    let host = url
        .host_str()
        .ok_or_else(|| AssetError::InvalidUrl("URL has no host".into()))?;
    if is_blocked_host(host) {
        return Err(AssetError::BlockedHost(host.to_string()));
    }
    Ok(url)
}

/// Vet a redirect target; `visited` counts the URLs already requested.
fn check_redirect(next: &Url, visited: usize) -> Result<(), AssetError> {
    if visited > MAX_REDIRECTS {
        return Err(AssetError::InvalidUrl(format!(
            "more than {MAX_REDIRECTS} redirects"
        )));
    }
    if !matches!(next.scheme(), "http" | "https") {
        return Err(AssetError::UnsupportedScheme);
    }
    let host = next
        .host_str()
        .ok_or_else(|| AssetError::InvalidUrl("redirect target has no host".into()))?;
    if is_blocked_host(host) {
        return Err(AssetError::BlockedHost(host.to_string()));
    }
    Ok(())
}

/// Report a redirect refused by [`check_redirect`] as the guard error
/// itself rather than a transport failure.
fn send_error(e: reqwest::Error) -> AssetError {
    if e.is_redirect() {
        let refused = std::error::Error::source(&e).and_then(|s| s.downcast_ref::<AssetError>());
        match refused {
            Some(AssetError::BlockedHost(host)) => return AssetError::BlockedHost(host.clone()),
            Some(AssetError::UnsupportedScheme) => return AssetError::UnsupportedScheme,
            Some(AssetError::InvalidUrl(msg)) => return AssetError::InvalidUrl(msg.clone()),
            _ => {}
        }
    }
    AssetError::Request(e)
}

/// Literal-hostname SSRF check.
pub fn is_blocked_host(host: &str) -> bool {
    let host = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();

    if BLOCKED_HOST_PREFIXES.iter().any(|p| host.starts_with(p))
        || host.ends_with(".local")
        || host.ends_with(".localhost")
    {
        return true;
    }

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        Ok(IpAddr::V6(v6)) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || first & 0xfe00 == 0xfc00
                || first & 0xffc0 == 0xfe80
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_blocked_host(&v4.to_string()))
        }
        Err(_) => false,
    }
}

/// Add the CivitAI API token to civitai.com URLs that lack one.
pub fn inject_civitai_token(url: &mut Url, token: Option<&str>) {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return;
    };
    let is_civitai = url
        .host_str()
        .is_some_and(|h| h == "civitai.com" || h.ends_with(".civitai.com"));
    if is_civitai && !url.query_pairs().any(|(k, _)| k == "token") {
        url.query_pairs_mut().append_pair("token", token);
        tracing::debug!(host = ?url.host_str(), "Injected CivitAI token");
    }
}

/// Markup signature in the first bytes of a body.
pub fn looks_like_markup(head: &[u8]) -> bool {
    let head = &head[..head.len().min(SNIFF_LEN)];
    let text = String::from_utf8_lossy(head).to_ascii_lowercase();
    text.contains("<!doctype") || text.contains("<html")
}

/// `filename` parameter of a Content-Disposition header.
pub fn filename_from_disposition(header: &str) -> Option<String> {
    let (_, rest) = header.split_once("filename=")?;
    let name = rest
        .trim_start_matches('"')
        .split(['"', ';'])
        .next()?
        .trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Best guess at the stored name before anything is fetched.
///
/// Used for the dedup pre-check: the requested name, else the last path
/// segment of the URL.
pub fn guess_filename(requested: Option<&str>, url: &Url) -> Option<String> {
    let raw = requested
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .or_else(|| url_basename(url))?;
    Some(finish_filename(&raw))
}

/// Stored name: requested, else Content-Disposition, else URL path.
pub fn derive_filename(requested: Option<&str>, disposition: Option<&str>, url: &Url) -> String {
    let raw = requested
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .or_else(|| disposition.and_then(filename_from_disposition))
        .or_else(|| url_basename(url))
        .unwrap_or_default();
    finish_filename(&raw)
}

fn url_basename(url: &Url) -> Option<String> {
    url.path_segments()?
        .next_back()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn finish_filename(raw: &str) -> String {
    let mut name = if raw.trim().is_empty() {
        format!("model_{}", unix_millis())
    } else {
        sanitize_filename(raw)
    };
    if !has_asset_extension(&name) {
        name.push('.');
        name.push_str(DEFAULT_ASSET_EXTENSION);
    }
    if name.len() > MAX_FILENAME_LEN {
        let keep = MAX_FILENAME_LEN - DEFAULT_ASSET_EXTENSION.len() - 1;
        name.truncate(keep);
        name.push('.');
        name.push_str(DEFAULT_ASSET_EXTENSION);
    }
    name
}

fn unix_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

// ---------------------------------------------------------------------------
// Downloader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct DownloadLimits {
    pub max_bytes: u64,
    pub min_bytes: u64,
}

impl Default for DownloadLimits {
    fn default() -> Self {
        Self {
            max_bytes: MAX_ASSET_BYTES,
            min_bytes: MIN_ASSET_BYTES,
        }
    }
}

/// A file that is now present in the destination folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedAsset {
    pub filename: String,
    pub path: PathBuf,
    pub bytes: u64,
    /// Already present; nothing was written.
    pub deduplicated: bool,
}

pub struct Downloader {
    client: reqwest::Client,
    limits: DownloadLimits,
}

impl Downloader {
    pub fn new(limits: DownloadLimits) -> Result<Self, AssetError> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::custom(|attempt| {
                let verdict = check_redirect(attempt.url(), attempt.previous().len());
                match verdict {
                    Ok(()) => attempt.follow(),
                    Err(e) => {
                        tracing::warn!(target_url = %attempt.url(), error = %e, "Refused download redirect");
                        attempt.error(e)
                    }
                }
            }))
            .build()?;
        Ok(Self { client, limits })
    }

    pub fn limits(&self) -> DownloadLimits {
        self.limits
    }

    /// Fetch `url` into `dest_dir`.
    ///
    /// `url` must already have passed [`validate_download_url`].
    /// `on_progress(bytes, total)` is called after every chunk; `total` is
    /// zero when the server did not declare a length.
    pub async fn fetch(
        &self,
        url: &Url,
        requested_name: Option<&str>,
        dest_dir: &Path,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<DownloadedAsset, AssetError> {
        let response = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "*/*")
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AssetError::HttpStatus(status.as_u16()));
        }

        let content_type = header_str(&response, CONTENT_TYPE).unwrap_or_default();
        if content_type.contains("text/html") {
            tracing::warn!(host = ?url.host_str(), %content_type, "Download returned HTML");
            return Err(AssetError::MarkupPayload);
        }

        let declared = response.content_length();
        if declared.is_some_and(|len| len > self.limits.max_bytes) {
            tracing::warn!(host = ?url.host_str(), ?declared, "Declared size over limit");
            return Err(AssetError::TooLarge {
                limit: self.limits.max_bytes,
            });
        }

        let disposition = header_str(&response, CONTENT_DISPOSITION);
        let filename = derive_filename(requested_name, disposition.as_deref(), url);
        let final_path = dest_dir.join(&filename);
        if let Ok(meta) = tokio::fs::metadata(&final_path).await {
            return Ok(DownloadedAsset {
                filename,
                path: final_path,
                bytes: meta.len(),
                deduplicated: true,
            });
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let temp_path = dest_dir.join(format!("tmp_{}.part", uuid::Uuid::new_v4()));
        let written = self
            .stream_to(response, &temp_path, declared.unwrap_or(0), on_progress)
            .await
            .and_then(|bytes| {
                if bytes < self.limits.min_bytes {
                    Err(AssetError::TooSmall { bytes })
                } else {
                    Ok(bytes)
                }
            });

        let bytes = match written {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        tracing::info!(filename = %filename, bytes, "Asset downloaded");
        Ok(DownloadedAsset {
            filename,
            path: final_path,
            bytes,
            deduplicated: false,
        })
    }

    async fn stream_to(
        &self,
        response: reqwest::Response,
        path: &Path,
        total: u64,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<u64, AssetError> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut head: Vec<u8> = Vec::with_capacity(SNIFF_LEN);
        let mut bytes = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if head.len() < SNIFF_LEN {
                let take = (SNIFF_LEN - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..take]);
                if looks_like_markup(&head) {
                    return Err(AssetError::MarkupPayload);
                }
            }
            bytes += chunk.len() as u64;
            if bytes > self.limits.max_bytes {
                return Err(AssetError::TooLarge {
                    limit: self.limits.max_bytes,
                });
            }
            file.write_all(&chunk).await?;
            on_progress(bytes, total);
        }
        file.flush().await?;
        Ok(bytes)
    }
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
