//! Streamed multipart uploads.
//!
//! File parts are written chunk by chunk to a scratch file under
//! `<DATA_DIR>/tmp_uploads`, enforcing the byte ceiling as they arrive.
//! The scratch file is removed when the [`TempUpload`] is dropped unless it
//! was [`persist`](TempUpload::persist)ed first.

use std::path::{Path, PathBuf};

use axum::extract::Multipart;
use kiln_core::error::CoreError;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, AppResult};

/// Name of the multipart part carrying the file.
pub const FILE_FIELD: &str = "file";

/// Name of the multipart part carrying the session id.
pub const SESSION_FIELD: &str = "session_id";

/// A received file part, still in scratch space.
#[derive(Debug)]
pub struct TempUpload {
    /// Client-supplied filename, unsanitised.
    pub original_name: String,
    pub bytes: u64,
    path: PathBuf,
    persisted: bool,
}

impl TempUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the upload to `dest`.
    pub async fn persist(mut self, dest: &Path) -> std::io::Result<()> {
        if tokio::fs::rename(&self.path, dest).await.is_err() {
            // Scratch space may sit on another filesystem.
            tokio::fs::copy(&self.path, dest).await?;
            let _ = tokio::fs::remove_file(&self.path).await;
        }
        self.persisted = true;
        Ok(())
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// The parts of an upload form this server understands.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub session_id: Option<String>,
    pub file: Option<TempUpload>,
}

impl UploadForm {
    pub fn require_file(&mut self) -> AppResult<TempUpload> {
        self.file
            .take()
            .ok_or_else(|| AppError::Core(CoreError::Validation("No file uploaded".into())))
    }
}

/// Read a multipart form, streaming its file part to `scratch_dir`.
///
/// `on_progress` receives the session id (when its part came first) and
/// the running byte count. Unknown parts are skipped. A file larger than
/// `max_bytes` is rejected mid-stream.
pub async fn receive(
    multipart: &mut Multipart,
    scratch_dir: &Path,
    max_bytes: u64,
    on_progress: &(dyn Fn(Option<&str>, u64) + Send + Sync),
) -> AppResult<UploadForm> {
    let mut form = UploadForm::default();
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Malformed multipart body: {e}")))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some(SESSION_FIELD) => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Malformed session_id part: {e}")))?;
                form.session_id = Some(text.trim().to_string());
            }
            Some(FILE_FIELD) if form.file.is_none() => {
                tokio::fs::create_dir_all(scratch_dir).await?;
                let mut upload = TempUpload {
                    original_name: field.file_name().unwrap_or_default().to_string(),
                    bytes: 0,
                    path: scratch_dir.join(format!("upload_{}.part", uuid::Uuid::new_v4())),
                    persisted: false,
                };
                let mut file = tokio::fs::File::create(&upload.path).await?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Upload interrupted: {e}")))?
                {
                    upload.bytes += chunk.len() as u64;
                    if upload.bytes > max_bytes {
                        return Err(AppError::PayloadTooLarge(format!(
                            "File exceeds the {} MB limit",
                            max_bytes / (1024 * 1024)
                        )));
                    }
                    file.write_all(&chunk).await?;
                    on_progress(form.session_id.as_deref(), upload.bytes);
                }
                file.flush().await?;
                form.file = Some(upload);
            }
            _ => {}
        }
    }
    Ok(form)
}
