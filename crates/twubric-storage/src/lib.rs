//! Durable snapshot slot + HTTP feed fetch utilities for the twubric board.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use twubric_core::Record;
use uuid::Uuid;

pub const CRATE_NAME: &str = "twubric-storage";

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub record_count: usize,
    /// The slot already held byte-identical content, nothing was written.
    pub unchanged: bool,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("reading snapshot {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding snapshot {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("writing snapshot {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One named JSON slot on disk holding the full record list.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    slot: String,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, slot: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            slot: slot.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn slot_path(&self) -> PathBuf {
        self.root.join(format!("{}.json", self.slot))
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `Ok(None)` when the slot has never been written.
    pub async fn read(&self) -> Result<Option<Vec<Record>>, PersistenceError> {
        let path = self.slot_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistenceError::Read { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| PersistenceError::Decode { path, source })
    }

    /// Overwrite the slot wholesale using an atomic temp-file rename.
    pub async fn write(&self, records: &[Record]) -> Result<StoredSnapshot, PersistenceError> {
        let bytes = serde_json::to_vec_pretty(records)?;
        let content_hash = Self::sha256_hex(&bytes);
        let path = self.slot_path();
        let write_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| PersistenceError::Write { path, source }
        };

        if let Ok(existing) = fs::read(&path).await {
            if Self::sha256_hex(&existing) == content_hash {
                debug!(path = %path.display(), "snapshot unchanged; skipping write");
                return Ok(StoredSnapshot {
                    content_hash,
                    path,
                    byte_size: bytes.len(),
                    record_count: records.len(),
                    unchanged: true,
                });
            }
        }

        fs::create_dir_all(&self.root)
            .await
            .map_err(write_err(&self.root))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.{}.tmp", self.slot, Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(write_err(&temp_path))?;
        let mut written = file.write_all(&bytes).await;
        if written.is_ok() {
            written = file.flush().await;
        }
        drop(file);
        if let Err(source) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(PersistenceError::Write {
                path: temp_path,
                source,
            });
        }

        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(PersistenceError::Write { path, source });
        }

        Ok(StoredSnapshot {
            content_hash,
            path,
            byte_size: bytes.len(),
            record_count: records.len(),
            unchanged: false,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// No timeout unless set; a fetch is a single attempt either way.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub status: StatusCode,
    pub final_url: String,
    pub records: Vec<Record>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} {status_text} for {url}")]
    HttpStatus {
        status: u16,
        status_text: String,
        url: String,
    },
    #[error("decoding feed body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::Decode { .. } => None,
        }
    }
}

/// Fetches the record feed from one fixed URL.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    url: String,
}

impl FeedFetcher {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One GET, no retries. Non-2xx statuses fail with the status text.
    pub async fn fetch(&self) -> Result<FetchedFeed, FetchError> {
        let span = info_span!("feed_fetch", url = %self.url);
        self.fetch_once().instrument(span).await
    }

    async fn fetch_once(&self) -> Result<FetchedFeed, FetchError> {
        let resp = self.client.get(&self.url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?;
        let records = serde_json::from_slice::<Vec<Record>>(&body).map_err(|source| {
            FetchError::Decode {
                url: final_url.clone(),
                source,
            }
        })?;
        debug!(records = records.len(), bytes = body.len(), "feed fetched");
        Ok(FetchedFeed {
            status,
            final_url,
            records,
        })
    }
}
