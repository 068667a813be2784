//! File service: answers requests on the bus from a set of watched roots.
//!
//! Every request gets exactly one correlated text response, except
//! `get-file`, which is answered with a `file-info` header followed by a
//! binary frame holding the file contents.

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use relay_core::{
    BinaryResponse, EventBus, FileEntry, Request, RequestId, RequestKind, Response, ResponseBody,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default cap on the size of a file sent by `get-file`.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 8 * 1024 * 1024;

/// Why a file request failed. The message is sent back to the client.
#[derive(Debug, Error)]
pub enum FileError {
    /// The root is not one of the watched roots.
    #[error("unknown root: {0}")]
    UnknownRoot(String),
    /// The relative path escapes its root.
    #[error("path outside root: {0}")]
    OutsideRoot(String),
    /// `get-file` on something that is not a regular file.
    #[error("not a file: {0}")]
    NotAFile(String),
    /// The file is larger than the configured maximum.
    #[error("file too large: {path} ({size} bytes, limit {max})")]
    TooLarge {
        /// Requested path.
        path: String,
        /// Size on disk.
        size: u64,
        /// Configured maximum.
        max: u64,
    },
    /// Filesystem error.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Serves directory listings and file contents below watched roots.
pub struct FileService {
    roots: Vec<PathBuf>,
    max_file_size: u64,
    bus: EventBus,
}

impl FileService {
    /// Create a service over `roots`.
    pub fn new(roots: Vec<PathBuf>, bus: EventBus) -> Self {
        Self {
            roots,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            bus,
        }
    }

    /// Refuse `get-file` for files larger than `bytes`.
    #[must_use]
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Subscribe to requests and serve until `cancel` fires or the bus
    /// closes.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let requests = self.bus.subscribe_requests();
        tokio::spawn(self.run(requests, cancel))
    }

    #[instrument(skip_all, name = "file_service")]
    async fn run(self, mut requests: broadcast::Receiver<Request>, cancel: CancellationToken) {
        info!(
            roots = self.roots.len(),
            max_file_size = self.max_file_size,
            "file service running"
        );
        loop {
            let request = tokio::select! {
                () = cancel.cancelled() => break,
                request = requests.recv() => request,
            };
            match request {
                Ok(request) => self.handle(request).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "file service lagged, requests skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("file service stopped");
    }

    /// Answer one request on the bus.
    pub async fn handle(&self, request: Request) {
        let id = request.id;
        debug!(request_id = %id, kind = request.kind.name(), "handling request");
        let result = match request.kind {
            RequestKind::Ping => Ok(ResponseBody::Pong),
            RequestKind::ListWatches => Ok(ResponseBody::WatchList {
                watches: self.roots.iter().map(|r| r.display().to_string()).collect(),
            }),
            RequestKind::ListFiles { root, prefix } => self
                .list_files(&root, prefix.as_deref().unwrap_or(""))
                .await
                .map(|files| ResponseBody::FileList { root, files }),
            RequestKind::GetFile { root, path } => match self.read_file(&root, &path).await {
                Ok(data) => {
                    self.send_file(id, path, data);
                    return;
                }
                Err(e) => Err(e),
            },
        };

        let body = result.unwrap_or_else(|e| {
            warn!(request_id = %id, error = %e, "file request failed");
            ResponseBody::Error {
                message: e.to_string(),
            }
        });
        let _ = self.bus.publish_response(Response::reply(id, body));
    }

    fn send_file(&self, id: RequestId, path: String, data: Bytes) {
        let size = data.len() as u64;
        let _ = self
            .bus
            .publish_response(Response::reply(id, ResponseBody::FileInfo { path, size }));
        let _ = self.bus.publish_binary(BinaryResponse::new(id, data));
    }

    async fn list_files(&self, root: &str, prefix: &str) -> Result<Vec<FileEntry>, FileError> {
        let dir = self.resolve(root, prefix).await?;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            files.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn read_file(&self, root: &str, path: &str) -> Result<Bytes, FileError> {
        let file = self.resolve(root, path).await?;
        let meta = tokio::fs::metadata(&file).await?;
        if !meta.is_file() {
            return Err(FileError::NotAFile(path.to_string()));
        }
        if meta.len() > self.max_file_size {
            return Err(FileError::TooLarge {
                path: path.to_string(),
                size: meta.len(),
                max: self.max_file_size,
            });
        }
        Ok(Bytes::from(tokio::fs::read(&file).await?))
    }

    /// Join `relative` onto a watched root and follow symlinks, refusing
    /// anything that ends up outside it.
    async fn resolve(&self, root: &str, relative: &str) -> Result<PathBuf, FileError> {
        let base = self
            .roots
            .iter()
            .find(|r| r.as_path() == Path::new(root))
            .ok_or_else(|| FileError::UnknownRoot(root.to_string()))?;

        let rel = Path::new(relative);
        if !rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(FileError::OutsideRoot(relative.to_string()));
        }

        let base = tokio::fs::canonicalize(base).await?;
        let resolved = tokio::fs::canonicalize(base.join(rel)).await?;
        if !resolved.starts_with(&base) {
            return Err(FileError::OutsideRoot(relative.to_string()));
        }
        Ok(resolved)
    }
}
