// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
//! A local, disk-backed cache of content-addressed blobs, sharded by the first two hex
//! characters of each blob's fingerprint so no single directory accumulates too many entries.
//! Entries are ref-counted: a caller that wants a blob to survive concurrent eviction pins it
//! first, then materializes it (typically as a hard link into an execution directory), then
//! unpins it. Unpinned entries are reclaimed oldest-unpinned-first once the cache's byte budget
//! is exceeded. Concurrent requests for the same not-yet-cached blob are coalesced onto a single
//! fetch from the remote CAS.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hashing::{Digest, Fingerprint};
use parking_lot::Mutex;
use rpc_client::RemoteCas;
use tokio::sync::OnceCell;

struct Entry {
    size_bytes: usize,
    ref_count: usize,
    // `None` while pinned (ref_count > 0); set to the instant the last pin was released once
    // ref_count returns to zero, so eviction can pick the least-recently-released entry first.
    last_released_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    entries: HashMap<Fingerprint, Entry>,
    total_bytes: usize,
}

/// An RAII guard keeping a blob pinned in the cache. Dropping it releases the pin; the cache
/// does not become eligible for eviction of this blob until the guard is dropped.
pub struct Pin {
    cache: Cache,
    fingerprint: Fingerprint,
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.cache.unpin(self.fingerprint);
    }
}

/// A sharded, ref-counted, size-bounded local CAS cache.
#[derive(Clone)]
pub struct Cache {
    root: PathBuf,
    max_size_bytes: usize,
    remote: Arc<dyn RemoteCas>,
    state: Arc<Mutex<State>>,
    // One OnceCell per fingerprint currently being fetched from the remote CAS, so that
    // concurrent callers asking for the same blob share a single fetch.
    in_flight: Arc<Mutex<HashMap<Fingerprint, Arc<OnceCell<Result<(), String>>>>>>,
}

impl Cache {
    pub fn new(root: impl Into<PathBuf>, max_size_bytes: usize, remote: Arc<dyn RemoteCas>) -> Self {
        Cache {
            root: root.into(),
            max_size_bytes,
            remote,
            state: Arc::new(Mutex::new(State::default())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn shard_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        self.root.join(&hex[0..2])
    }

    /// The on-disk path at which a blob's bytes are (or will be) stored.
    pub fn content_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.shard_dir(fingerprint).join(fingerprint.to_hex())
    }

    /// Inserts a blob the caller already holds in memory (e.g. a freshly computed command or
    /// directory digest), writing it to disk via a temp-file-then-rename so concurrent readers
    /// never observe a partial file.
    pub async fn put(&self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        if bytes.len() != digest.size_bytes {
            return Err(format!(
                "digest claimed size {} but blob was {} bytes",
                digest.size_bytes,
                bytes.len()
            ));
        }
        self.write_to_disk(&digest.hash, &bytes).await?;
        self.admit(digest.hash, digest.size_bytes);
        Ok(())
    }

    async fn write_to_disk(&self, fingerprint: &Fingerprint, bytes: &Bytes) -> Result<(), String> {
        let dir = self.shard_dir(fingerprint);
        let dest = self.content_path(fingerprint);
        let bytes = bytes.clone();
        let dir_clone = dir.clone();
        tokio::task::spawn_blocking(move || -> Result<(), String> {
            std::fs::create_dir_all(&dir_clone)
                .map_err(|e| format!("failed to create cache shard {}: {e}", dir_clone.display()))?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir_clone)
                .map_err(|e| format!("failed to create temp file in {}: {e}", dir_clone.display()))?;
            use std::io::Write;
            tmp.write_all(&bytes)
                .map_err(|e| format!("failed to write temp file: {e}"))?;
            tmp.persist(&dest)
                .map_err(|e| format!("failed to persist cache entry {}: {e}", dest.display()))?;
            Ok(())
        })
        .await
        .map_err(|e| format!("cache write task panicked: {e}"))?
    }

    fn admit(&self, fingerprint: Fingerprint, size_bytes: usize) {
        let mut state = self.state.lock();
        if !state.entries.contains_key(&fingerprint) {
            state.total_bytes += size_bytes;
            state.entries.insert(
                fingerprint,
                Entry {
                    size_bytes,
                    ref_count: 0,
                    last_released_at: Some(Instant::now()),
                },
            );
        }
    }

    /// Ensures a blob is present locally (fetching from the remote CAS if necessary, coalescing
    /// concurrent fetches of the same fingerprint) and returns a pin keeping it resident until
    /// dropped.
    pub async fn load(&self, digest: Digest) -> Result<Pin, String> {
        if !self.content_path(&digest.hash).exists() {
            self.fetch_coalesced(digest).await?;
        }
        self.evict_if_needed(digest.size_bytes, Some(digest.hash));
        self.pin(digest.hash, digest.size_bytes);
        Ok(Pin {
            cache: self.clone(),
            fingerprint: digest.hash,
        })
    }

    async fn fetch_coalesced(&self, digest: Digest) -> Result<(), String> {
        let cell = {
            let mut in_flight = self.in_flight.lock();
            in_flight
                .entry(digest.hash)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_init(move || async move {
                log::debug!("fetching {} from the remote CAS", digest.hash);
                let bytes = self
                    .remote
                    .load(digest)
                    .await?
                    .ok_or_else(|| format!("blob {} not found in remote CAS", digest.hash))?;
                if bytes.len() != digest.size_bytes {
                    return Err(format!(
                        "remote CAS returned {} bytes for digest claiming size {}",
                        bytes.len(),
                        digest.size_bytes
                    ));
                }
                self.write_to_disk(&digest.hash, &bytes).await?;
                self.admit(digest.hash, digest.size_bytes);
                Ok(())
            })
            .await
            .clone();

        self.in_flight.lock().remove(&digest.hash);
        result
    }

    fn pin(&self, fingerprint: Fingerprint, size_bytes: usize) {
        let mut state = self.state.lock();
        let entry = state.entries.entry(fingerprint).or_insert_with(|| Entry {
            size_bytes,
            ref_count: 0,
            last_released_at: None,
        });
        entry.ref_count += 1;
        entry.last_released_at = None;
    }

    fn unpin(&self, fingerprint: Fingerprint) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&fingerprint) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                entry.last_released_at = Some(Instant::now());
            }
        }
    }

    /// Evicts unpinned entries, oldest-released-first, until there is room for `incoming_bytes`
    /// more (optionally excluding `keep` from eviction, since it's about to be pinned).
    fn evict_if_needed(&self, incoming_bytes: usize, keep: Option<Fingerprint>) {
        let mut to_delete = Vec::new();
        {
            let mut state = self.state.lock();
            while state.total_bytes + incoming_bytes > self.max_size_bytes {
                let victim = state
                    .entries
                    .iter()
                    .filter(|(fp, e)| e.ref_count == 0 && Some(**fp) != keep)
                    .filter_map(|(fp, e)| e.last_released_at.map(|t| (*fp, t, e.size_bytes)))
                    .min_by_key(|(_, t, _)| *t);
                let Some((fp, _, size)) = victim else {
                    // Nothing left that can be safely evicted; let the cache grow past budget
                    // rather than delete a pinned blob out from under a running action.
                    break;
                };
                state.entries.remove(&fp);
                state.total_bytes -= size;
                to_delete.push(fp);
            }
        }
        for fp in &to_delete {
            let path = self.content_path(fp);
            let _ = std::fs::remove_file(path);
        }
        if !to_delete.is_empty() {
            log::debug!("evicted {} unpinned cache entries to stay under budget", to_delete.len());
        }
    }

    /// Hard-links the cached content for `digest` into `dest`, creating parent directories as
    /// needed. The caller must hold a `Pin` for `digest` for the duration of this call.
    pub fn link_into(&self, digest: Digest, dest: &Path) -> Result<(), String> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
        }
        let src = self.content_path(&digest.hash);
        match std::fs::hard_link(&src, dest) {
            Ok(()) => Ok(()),
            // Hard-linking twice to the same destination in a retried materialization is fine.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(format!(
                "failed to hard link {} to {}: {e}",
                src.display(),
                dest.display()
            )),
        }
    }

    pub fn current_size_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }
}
