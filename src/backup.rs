// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Local Backup of Failed Messages
//!
//! Messages that exhausted their retries are appended, one JSON record per line, to
//! `<base>/<folder>/<yyyy-MM-dd>/<routing key>.txt`. Appends to the same file are
//! mutually exclusive across every sink of the process.

use crate::errors::AmqpError;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, OnceLock},
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

/// Folder of messages the broker refused to accept.
pub const PUBLISH_FAILED_FOLDER: &str = "publish_failed";
/// Folder of messages no consumer managed to process.
pub const CONSUME_FAILED_FOLDER: &str = "consume_failed";

/// Writes failed messages of one side (publish or consume) below a base directory.
#[derive(Debug, Clone)]
pub struct BackupSink {
    base: PathBuf,
    folder: &'static str,
}

impl BackupSink {
    pub fn new(base: impl Into<PathBuf>, folder: &'static str) -> Self {
        BackupSink {
            base: base.into(),
            folder,
        }
    }

    pub fn publish_failed(base: impl Into<PathBuf>) -> Self {
        Self::new(base, PUBLISH_FAILED_FOLDER)
    }

    pub fn consume_failed(base: impl Into<PathBuf>) -> Self {
        Self::new(base, CONSUME_FAILED_FOLDER)
    }

    /// Today's backup file for `routing_key`. Path separators in the key are
    /// replaced so the file always lands in the date folder.
    pub fn path(&self, routing_key: &str) -> PathBuf {
        let file_name: String = routing_key
            .chars()
            .map(|c| match c {
                '/' | '\\' | '\0' => '_',
                c => c,
            })
            .collect();

        self.base
            .join(self.folder)
            .join(chrono::Local::now().format("%Y-%m-%d").to_string())
            .join(format!("{file_name}.txt"))
    }
}

type PathLocks = HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>;

fn locks() -> MutexGuard<'static, PathLocks> {
    static LOCKS: OnceLock<Mutex<PathLocks>> = OnceLock::new();

    LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn path_lock(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    locks().entry(path.to_path_buf()).or_default().clone()
}

/// Drops the lock of `path` once no writer holds or waits on it.
fn release_path_lock(path: &Path, lock: Arc<tokio::sync::Mutex<()>>) {
    let mut locks = locks();
    drop(lock);
    if locks.get(path).is_some_and(|l| Arc::strong_count(l) == 1) {
        locks.remove(path);
    }
}

/// Appends one line to `path`, creating its directory on demand.
pub(crate) async fn append_line(path: &Path, line: &str) -> Result<(), AmqpError> {
    let failure = |err: std::io::Error| {
        error!(error = err.to_string(), path = %path.display(), "failure to write backup");
        AmqpError::BackupError(path.display().to_string())
    };

    if let Some(directory) = path.parent() {
        tokio::fs::create_dir_all(directory).await.map_err(failure)?;
    }

    let lock = path_lock(path);
    let written = {
        let _guard = lock.lock().await;
        write_line(path, line).await.map_err(failure)
    };
    release_path_lock(path, lock);
    written?;

    debug!(path = %path.display(), "message backed up");
    Ok(())
}

async fn write_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    file.write_all(format!("{line}\n").as_bytes()).await?;
    file.flush().await
}
