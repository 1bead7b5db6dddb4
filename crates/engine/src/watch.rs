// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Landing-directory watcher.
//!
//! Polls the landing tree for files matching a glob and emits a
//! [`StableFile`] once a file's mtime has been quiet for the
//! configured window. The landing tree is read-only to the core:
//! nothing here renames, rewrites, or deletes.

use crate::EngineError;
use contimg_core::{Clock, IngestConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A file whose mtime survived the quiet period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableFile {
    pub path: PathBuf,
    pub mtime_ms: u64,
    pub size: u64,
}

#[derive(Debug)]
struct WatchEntry {
    mtime_ms: u64,
    size: u64,
    last_change: Instant,
    last_seen: Instant,
    emitted: bool,
}

/// Handle to a running watcher task.
pub struct WatcherHandle {
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Poll-based file watcher.
pub struct FileWatcher;

impl FileWatcher {
    /// Start watching. Fails fast when the root is missing at startup;
    /// a root that disappears later is logged and retried.
    pub fn start<C: Clock>(
        config: IngestConfig,
        clock: C,
    ) -> Result<(WatcherHandle, mpsc::Receiver<StableFile>), EngineError> {
        if !config.input_dir.is_dir() {
            return Err(EngineError::WatchRootMissing(config.input_dir.clone()));
        }
        let pattern =
            glob::Pattern::new(&config.pattern).map_err(|e| EngineError::BadPattern {
                pattern: config.pattern.clone(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(1024);
        let task = tokio::spawn(watch_loop(config, pattern, clock, tx));
        Ok((WatcherHandle { task }, rx))
    }
}

async fn watch_loop<C: Clock>(
    config: IngestConfig,
    pattern: glob::Pattern,
    clock: C,
    tx: mpsc::Sender<StableFile>,
) {
    let mut entries: HashMap<PathBuf, WatchEntry> = HashMap::new();
    info!(
        root = %config.input_dir.display(),
        pattern = %config.pattern,
        quiet_s = config.file_stability_quiet.as_secs_f64(),
        "file watcher started"
    );

    loop {
        let root = config.input_dir.clone();
        let pat = pattern.clone();
        let scan = tokio::task::spawn_blocking(move || scan_tree(&root, &pat)).await;

        let now = clock.now();
        match scan {
            Ok(Ok(found)) => {
                for (path, mtime_ms, size) in found {
                    match entries.get_mut(&path) {
                        None => {
                            entries.insert(
                                path,
                                WatchEntry {
                                    mtime_ms,
                                    size,
                                    last_change: now,
                                    last_seen: now,
                                    emitted: false,
                                },
                            );
                        }
                        Some(entry) => {
                            entry.last_seen = now;
                            if entry.mtime_ms != mtime_ms || entry.size != size {
                                // Still being written; restart the quiet window.
                                entry.mtime_ms = mtime_ms;
                                entry.size = size;
                                entry.last_change = now;
                                entry.emitted = false;
                            }
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                // Transient scan failure (including a vanished root):
                // log and retry next tick.
                warn!(error = %e, "landing scan failed, retrying next tick");
            }
            Err(e) => {
                warn!(error = %e, "landing scan task failed");
            }
        }

        for (path, entry) in entries.iter_mut() {
            if !entry.emitted
                && now.duration_since(entry.last_change) >= config.file_stability_quiet
            {
                debug!(path = %path.display(), "file stable");
                entry.emitted = true;
                let stable = StableFile {
                    path: path.clone(),
                    mtime_ms: entry.mtime_ms,
                    size: entry.size,
                };
                if tx.send(stable).await.is_err() {
                    info!("stable-file receiver dropped, watcher exiting");
                    return;
                }
            }
        }

        // Evict entries not seen for a long time (deleted upstream).
        entries.retain(|path, entry| {
            let keep = now.duration_since(entry.last_seen) < config.forget_after;
            if !keep {
                debug!(path = %path.display(), "evicting forgotten file");
            }
            keep
        });

        tokio::time::sleep(config.scan_interval).await;
    }
}

/// Walk `root` collecting `(path, mtime_ms, size)` for files whose
/// name matches `pattern`.
fn scan_tree(root: &Path, pattern: &glob::Pattern) -> std::io::Result<Vec<(PathBuf, u64, u64)>> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "unreadable directory entry");
                    continue;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };

            if file_type.is_dir() {
                stack.push(path);
                continue;
            }

            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| pattern.matches(name));
            if !matches {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "stat failed");
                    continue;
                }
            };
            let mtime_ms = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);

            found.push((path, mtime_ms, metadata.len()));
        }
    }

    Ok(found)
}

#[cfg(test)]
#[path = "watch_tests.rs"]
mod tests;
