// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
//! The worker's only view of the outside world: a content-addressed blob store and an
//! operation queue, each expressed as an `async_trait` so that production code never has to
//! know whether it is talking to a real RPC endpoint or an in-memory stand-in. Wire encoding
//! and transport (gRPC, HTTP, or otherwise) are deliberately left to whatever concrete type a
//! deployment plugs in here; this crate only defines the boundary and a pair of in-memory
//! doubles for tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hashing::{Digest, Fingerprint};
use parking_lot::Mutex;
use remote_protocol::{ActionResult, Operation, Stage};

/// The content-addressed blob store that backs actions, commands, directories and file
/// contents, plus the action cache keyed by an action's own digest. Implementations may batch,
/// retry, or cache internally; callers only see blobs in and blobs out.
#[async_trait]
pub trait RemoteCas: Send + Sync {
    /// Fetches one blob's bytes by digest, or `None` if the CAS doesn't have it.
    async fn load(&self, digest: Digest) -> Result<Option<Bytes>, String>;

    /// Uploads one blob, keyed by its own digest.
    async fn store(&self, digest: Digest, bytes: Bytes) -> Result<(), String>;

    /// Returns the subset of `digests` that the CAS does not already have, so callers can skip
    /// re-uploading blobs it already holds.
    async fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>, String>;

    /// Looks up a previously cached result for an action, keyed by the action's own digest.
    async fn get_action_result(&self, action_digest: Digest) -> Result<Option<ActionResult>, String>;

    /// Records an action's result in the action cache, keyed by the action's own digest.
    async fn put_action_result(&self, action_digest: Digest, result: ActionResult) -> Result<(), String>;
}

/// The queue of operations a worker pulls actions from and reports progress back to.
#[async_trait]
pub trait OperationQueue: Send + Sync {
    /// Claims the next queued operation matching this worker's capabilities, if any is
    /// available. Claiming an operation does not yet advance its stage; the worker does that
    /// itself via `put_operation` once it begins materializing inputs.
    async fn take_operation(&self) -> Result<Option<Operation>, String>;

    /// Publishes an updated view of an operation: its stage, and once `Completed`, its result.
    /// Returns `false` if the queue is no longer interested in this operation (it has reassigned
    /// or abandoned it), in which case the caller must not proceed past this point.
    async fn put_operation(&self, operation: Operation) -> Result<bool, String>;

    /// A liveness check: confirms the queue still considers this operation assigned to the
    /// calling worker. A `false` result means the queue has reassigned or abandoned it and the
    /// worker should stop running it.
    async fn poll_operation(&self, name: &str) -> Result<bool, String>;
}

/// An in-memory `RemoteCas` double for tests, grounded on the same shape of blob table a real
/// CAS exposes: a map from fingerprint to bytes, with no eviction.
#[derive(Clone, Default)]
pub struct StubCas {
    blobs: Arc<Mutex<HashMap<Fingerprint, Bytes>>>,
    action_results: Arc<Mutex<HashMap<Digest, ActionResult>>>,
}

impl StubCas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates the store with a blob, as a real CAS would already hold it before the
    /// worker starts.
    pub fn with_blob(self, digest: Digest, bytes: Bytes) -> Self {
        self.blobs.lock().insert(digest.hash, bytes);
        self
    }

    pub fn contains(&self, digest: Digest) -> bool {
        self.blobs.lock().contains_key(&digest.hash)
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RemoteCas for StubCas {
    async fn load(&self, digest: Digest) -> Result<Option<Bytes>, String> {
        Ok(self.blobs.lock().get(&digest.hash).cloned())
    }

    async fn store(&self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        if bytes.len() != digest.size_bytes {
            return Err(format!(
                "digest claimed size {} but blob was {} bytes",
                digest.size_bytes,
                bytes.len()
            ));
        }
        self.blobs.lock().insert(digest.hash, bytes);
        Ok(())
    }

    async fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>, String> {
        let blobs = self.blobs.lock();
        Ok(digests
            .iter()
            .filter(|d| !blobs.contains_key(&d.hash))
            .copied()
            .collect())
    }

    async fn get_action_result(&self, action_digest: Digest) -> Result<Option<ActionResult>, String> {
        Ok(self.action_results.lock().get(&action_digest).cloned())
    }

    async fn put_action_result(&self, action_digest: Digest, result: ActionResult) -> Result<(), String> {
        self.action_results.lock().insert(action_digest, result);
        Ok(())
    }
}

/// An in-memory `OperationQueue` double for tests: a fixed backlog of operations to hand out via
/// `take_operation`, plus a log of everything `put_operation` received, so tests can assert on
/// the sequence of stage transitions a worker produced.
#[derive(Clone, Default)]
pub struct StubQueue {
    inner: Arc<Mutex<StubQueueState>>,
}

#[derive(Default)]
struct StubQueueState {
    backlog: Vec<Operation>,
    published: Vec<Operation>,
    abandoned: std::collections::HashSet<String>,
    reject_next_put: bool,
}

impl StubQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(self, operation: Operation) -> Self {
        self.inner.lock().backlog.push(operation);
        self
    }

    /// Marks an operation as abandoned by the queue: subsequent `poll_operation` calls for it
    /// report `false`, simulating a queue that reassigned the work elsewhere.
    pub fn abandon(&self, name: &str) {
        self.inner.lock().abandoned.insert(name.to_string());
    }

    /// Causes the next `put_operation` call to report that the queue is no longer interested,
    /// simulating a server-side cancellation race between a worker claiming an operation and the
    /// server reassigning it before the worker publishes `Executing`.
    pub fn reject_next_put(self) -> Self {
        self.inner.lock().reject_next_put = true;
        self
    }

    pub fn published(&self) -> Vec<Operation> {
        self.inner.lock().published.clone()
    }

    /// The most recent published result for an operation, if one completed.
    pub fn result_for(&self, name: &str) -> Option<ActionResult> {
        self.inner
            .lock()
            .published
            .iter()
            .rev()
            .find(|op| op.name == name && op.metadata.stage == Stage::Completed)
            .and_then(|op| op.response.clone())
    }
}

#[async_trait]
impl OperationQueue for StubQueue {
    async fn take_operation(&self) -> Result<Option<Operation>, String> {
        Ok(self.inner.lock().backlog.pop())
    }

    async fn put_operation(&self, operation: Operation) -> Result<bool, String> {
        let mut state = self.inner.lock();
        state.published.push(operation);
        if state.reject_next_put {
            state.reject_next_put = false;
            return Ok(false);
        }
        Ok(true)
    }

    async fn poll_operation(&self, name: &str) -> Result<bool, String> {
        Ok(!self.inner.lock().abandoned.contains(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_protocol::ExecuteOperationMetadata;

    fn digest_of(bytes: &[u8]) -> Digest {
        Digest::of_bytes(bytes)
    }

    #[tokio::test]
    async fn stub_cas_round_trips_a_blob() {
        let cas = StubCas::new();
        let bytes = Bytes::from_static(b"hello action");
        let digest = digest_of(&bytes);
        cas.store(digest, bytes.clone()).await.unwrap();
        assert_eq!(cas.load(digest).await.unwrap(), Some(bytes));
    }

    #[tokio::test]
    async fn stub_cas_rejects_size_mismatch() {
        let cas = StubCas::new();
        let digest = Digest::new(digest_of(b"x").hash, 5);
        assert!(cas.store(digest, Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn stub_cas_find_missing_reports_only_absent_digests() {
        let bytes = Bytes::from_static(b"present");
        let present = digest_of(&bytes);
        let absent = digest_of(b"absent");
        let cas = StubCas::new().with_blob(present, bytes);
        let missing = cas.find_missing(&[present, absent]).await.unwrap();
        assert_eq!(missing, vec![absent]);
    }

    #[tokio::test]
    async fn stub_queue_hands_out_backlog_and_records_publications() {
        let action_digest = digest_of(b"action");
        let op = Operation::new("op-1".to_string(), action_digest);
        let queue = StubQueue::new().with_operation(op.clone());

        let taken = queue.take_operation().await.unwrap().unwrap();
        assert_eq!(taken.name, "op-1");
        assert!(queue.take_operation().await.unwrap().is_none());

        let mut completed = taken;
        completed.metadata = ExecuteOperationMetadata {
            stage: Stage::Completed,
            ..completed.metadata
        };
        completed.done = true;
        completed.response = Some(ActionResult {
            exit_code: 0,
            ..Default::default()
        });
        queue.put_operation(completed).await.unwrap();

        assert_eq!(queue.published().len(), 1);
        assert_eq!(queue.result_for("op-1").unwrap().exit_code, 0);
    }

    #[tokio::test]
    async fn stub_queue_poll_reflects_abandonment() {
        let queue = StubQueue::new();
        assert!(queue.poll_operation("op-1").await.unwrap());
        queue.abandon("op-1");
        assert!(!queue.poll_operation("op-1").await.unwrap());
    }

    #[tokio::test]
    async fn stub_queue_reject_next_put_applies_once() {
        let queue = StubQueue::new().reject_next_put();
        let op = Operation::new("op-1".to_string(), digest_of(b"action"));
        assert!(!queue.put_operation(op.clone()).await.unwrap());
        assert!(queue.put_operation(op).await.unwrap());
    }

    #[tokio::test]
    async fn stub_cas_round_trips_an_action_result() {
        let cas = StubCas::new();
        let action_digest = digest_of(b"action");
        assert!(cas.get_action_result(action_digest).await.unwrap().is_none());

        let result = ActionResult {
            exit_code: 0,
            ..Default::default()
        };
        cas.put_action_result(action_digest, result.clone())
            .await
            .unwrap();
        assert_eq!(
            cas.get_action_result(action_digest).await.unwrap(),
            Some(result)
        );
    }
}
