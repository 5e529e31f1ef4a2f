// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
//! Drives one operation through its lifecycle: claim it from the queue, fetch its action and
//! command, materialize its inputs, then advance its stage to `Executing` only once that
//! materialization has succeeded. A queue that declines that `Executing` publish is treated as
//! having cancelled the operation already, so the command is never spawned. Otherwise the action
//! runs, its result is cached (unless the action asked not to be), and a `Completed` stage
//! carrying the result is published. While an action runs, a background liveness poll confirms
//! the queue still considers the operation assigned to this worker; if the queue abandons it, the
//! in-flight command is dropped (and, through `ManagedChild`'s `Drop` impl, killed) rather than
//! left to finish unobserved.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cas_cache::Cache;
use executor::{ExecutionHarness, OutputPolicy};
use hashing::Digest;
use materializer::Materializer;
use remote_protocol::{Action, ActionResult, Command, Operation, Stage};
use rpc_client::{OperationQueue, RemoteCas};

pub struct Coordinator {
    queue: Arc<dyn OperationQueue>,
    remote_cas: Arc<dyn RemoteCas>,
    cache: Cache,
    exec_root: PathBuf,
    output_policy: OutputPolicy,
    liveness_poll_interval: Duration,
}

impl Coordinator {
    pub fn new(
        queue: Arc<dyn OperationQueue>,
        remote_cas: Arc<dyn RemoteCas>,
        cache: Cache,
        exec_root: PathBuf,
        output_policy: OutputPolicy,
        liveness_poll_interval: Duration,
    ) -> Self {
        Coordinator {
            queue,
            remote_cas,
            cache,
            exec_root,
            output_policy,
            liveness_poll_interval,
        }
    }

    /// Claims and fully processes one operation, if any is available. Returns `false` when the
    /// queue had nothing to offer, so the caller knows to back off before polling again.
    pub async fn run_once(&self) -> Result<bool, String> {
        let Some(mut operation) = self.queue.take_operation().await? else {
            return Ok(false);
        };

        log::info!("claimed operation {}", operation.name);

        let outcome = self.execute(&operation).await;
        let response = match outcome {
            Ok(None) => {
                log::info!("operation {} was cancelled before execution began", operation.name);
                return Ok(true);
            }
            Ok(Some(result)) => result,
            Err(error) => {
                log::error!("operation {} failed: {error}", operation.name);
                ActionResult {
                    exit_code: -1,
                    stderr_raw: Some(error.into_bytes()),
                    ..Default::default()
                }
            }
        };

        operation.metadata.stage = Stage::Completed;
        operation.done = true;
        operation.response = Some(response);
        let name = operation.name.clone();
        self.queue.put_operation(operation).await?;
        log::info!("completed operation {name}");
        Ok(true)
    }

    /// Fetches and runs the operation's action. Returns `Ok(None)` if the queue reports it is no
    /// longer interested in this operation once materialization finishes and the worker tries to
    /// publish `Executing` — a server-side cancellation that happened while this worker was still
    /// preparing the work, so no command is ever spawned.
    async fn execute(&self, operation: &Operation) -> Result<Option<ActionResult>, String> {
        let action = self.fetch_action(operation.metadata.action_digest).await?;
        let command = self.fetch_command(action.command_digest).await?;

        let workdir = self.exec_root.join(sanitize_for_path(&operation.name));
        let materializer = Materializer::new(self.cache.clone());
        materializer
            .materialize(action.input_root_digest, &workdir)
            .await?;
        materializer
            .create_output_parents(&workdir, &action.output_files)
            .await?;

        let mut executing = operation.clone();
        executing.metadata.stage = Stage::Executing;
        let still_wanted = self.queue.put_operation(executing).await?;
        if !still_wanted {
            let _ = tokio::fs::remove_dir_all(&workdir).await;
            return Ok(None);
        }

        let harness = ExecutionHarness::new(self.cache.clone());
        let result = tokio::select! {
            result = harness.run(&action, &command, &workdir, self.output_policy) => result,
            () = self.watch_liveness(&operation.name) => {
                Err(format!("operation {} was abandoned by the queue", operation.name))
            }
        }?;

        self.upload_outputs(&result).await?;
        if !action.do_not_cache {
            self.remote_cas
                .put_action_result(operation.metadata.action_digest, result.clone())
                .await?;
        }
        let _ = tokio::fs::remove_dir_all(&workdir).await;
        Ok(Some(result))
    }

    async fn watch_liveness(&self, name: &str) {
        loop {
            tokio::time::sleep(self.liveness_poll_interval).await;
            match self.queue.poll_operation(name).await {
                Ok(true) => continue,
                Ok(false) => return,
                Err(error) => {
                    log::warn!("liveness poll for {name} failed, will retry: {error}");
                }
            }
        }
    }

    async fn fetch_action(&self, digest: Digest) -> Result<Action, String> {
        let bytes = self.load_and_read(digest).await?;
        Action::from_bytes(&bytes)
    }

    async fn fetch_command(&self, digest: Digest) -> Result<Command, String> {
        let bytes = self.load_and_read(digest).await?;
        Command::from_bytes(&bytes)
    }

    async fn load_and_read(&self, digest: Digest) -> Result<Vec<u8>, String> {
        let pin = self.cache.load(digest).await?;
        let bytes = tokio::fs::read(self.cache.content_path(&digest.hash))
            .await
            .map_err(|e| format!("failed to read cached blob {}: {e}", digest.hash))?;
        drop(pin);
        Ok(bytes)
    }

    /// Pushes every blob the executor chose to insert into the local cache (stdout, stderr, and
    /// output file contents above their inline limits) up to the remote CAS, so the operation's
    /// result digests resolve for whoever reads them next.
    async fn upload_outputs(&self, result: &ActionResult) -> Result<(), String> {
        let mut digests: Vec<Digest> = Vec::new();
        digests.extend(result.stdout_digest);
        digests.extend(result.stderr_digest);
        digests.extend(result.output_files.iter().filter_map(|f| f.digest));

        for digest in digests {
            let bytes = tokio::fs::read(self.cache.content_path(&digest.hash))
                .await
                .map_err(|e| format!("failed to read cached blob {}: {e}", digest.hash))?;
            self.remote_cas.store(digest, bytes.into()).await?;
        }
        Ok(())
    }
}

fn sanitize_for_path(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use remote_protocol::{CasInsertionControl, CasInsertionPolicy, Directory};
    use rpc_client::{StubCas, StubQueue};
    use std::collections::BTreeMap;

    fn always_policy() -> OutputPolicy {
        let always = CasInsertionControl::new(10_000, CasInsertionPolicy::AlwaysInsert);
        OutputPolicy {
            stdout: always,
            stderr: always,
            output_files: always,
        }
    }

    async fn seed_action(remote: &StubCas, cache: &Cache, argv: Vec<&str>, do_not_cache: bool) -> Digest {
        let command = Command {
            argv: argv.into_iter().map(str::to_string).collect(),
            env: BTreeMap::new(),
        };
        let command_bytes = Bytes::from(command.to_bytes());
        let command_digest = Digest::of_bytes(&command_bytes);
        cache.put(command_digest, command_bytes.clone()).await.unwrap();
        remote
            .store(command_digest, command_bytes)
            .await
            .unwrap();

        let empty_dir = Directory::default();
        let input_root_digest = empty_dir.digest();
        let dir_bytes = Bytes::from(empty_dir.to_bytes());
        cache.put(input_root_digest, dir_bytes.clone()).await.unwrap();
        remote.store(input_root_digest, dir_bytes).await.unwrap();

        let action = Action {
            command_digest,
            input_root_digest,
            output_files: vec![],
            output_directories: vec![],
            timeout: None,
            do_not_cache,
        };
        let action_bytes = Bytes::from(action.to_bytes());
        let action_digest = Digest::of_bytes(&action_bytes);
        cache.put(action_digest, action_bytes.clone()).await.unwrap();
        remote.store(action_digest, action_bytes).await.unwrap();
        action_digest
    }

    #[tokio::test]
    async fn run_once_executes_a_queued_operation_to_completion() {
        let remote = StubCas::new();
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path().join("cache"), 10_000_000, Arc::new(remote.clone()));
        let action_digest =
            seed_action(&remote, &cache, vec!["/bin/sh", "-c", "echo from-test"], false).await;

        let queue = StubQueue::new().with_operation(Operation::new("op-1".to_string(), action_digest));
        let exec_root = dir.path().join("exec");
        let coordinator = Coordinator::new(
            Arc::new(queue.clone()),
            Arc::new(remote.clone()),
            cache,
            exec_root,
            always_policy(),
            Duration::from_secs(60),
        );

        let found_work = coordinator.run_once().await.unwrap();
        assert!(found_work);

        let result = queue.result_for("op-1").unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout_raw.unwrap(), b"from-test\n");

        let published = queue.published();
        assert_eq!(published[0].metadata.stage, Stage::Executing);
        assert_eq!(published[1].metadata.stage, Stage::Completed);

        let cached = remote.get_action_result(action_digest).await.unwrap();
        assert_eq!(cached.unwrap().exit_code, 0);
    }

    #[tokio::test]
    async fn do_not_cache_suppresses_the_action_cache_write() {
        let remote = StubCas::new();
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path().join("cache"), 10_000_000, Arc::new(remote.clone()));
        let action_digest = seed_action(&remote, &cache, vec!["/bin/sh", "-c", "true"], true).await;

        let queue = StubQueue::new().with_operation(Operation::new("op-1".to_string(), action_digest));
        let coordinator = Coordinator::new(
            Arc::new(queue.clone()),
            Arc::new(remote.clone()),
            cache,
            dir.path().join("exec"),
            always_policy(),
            Duration::from_secs(60),
        );

        assert!(coordinator.run_once().await.unwrap());
        assert!(queue.result_for("op-1").is_some());
        assert!(remote.get_action_result(action_digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queue_declining_the_executing_publish_aborts_without_running_the_command() {
        let remote = StubCas::new();
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path().join("cache"), 10_000_000, Arc::new(remote.clone()));
        let action_digest =
            seed_action(&remote, &cache, vec!["/bin/sh", "-c", "echo should-not-run"], false).await;

        let queue = StubQueue::new()
            .with_operation(Operation::new("op-1".to_string(), action_digest))
            .reject_next_put();
        let coordinator = Coordinator::new(
            Arc::new(queue.clone()),
            Arc::new(remote.clone()),
            cache,
            dir.path().join("exec"),
            always_policy(),
            Duration::from_secs(60),
        );

        assert!(coordinator.run_once().await.unwrap());

        let published = queue.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].metadata.stage, Stage::Executing);
        assert!(queue.result_for("op-1").is_none());
        assert!(remote.get_action_result(action_digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_once_returns_false_when_queue_is_empty() {
        let remote = Arc::new(StubCas::new());
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path().join("cache"), 10_000_000, remote.clone());
        let queue = StubQueue::new();
        let coordinator = Coordinator::new(
            Arc::new(queue),
            remote,
            cache,
            dir.path().join("exec"),
            always_policy(),
            Duration::from_secs(60),
        );
        assert!(!coordinator.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn missing_action_blob_completes_the_operation_as_a_failure() {
        let remote = Arc::new(StubCas::new());
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path().join("cache"), 10_000_000, remote.clone());
        let bogus_digest = Digest::of_bytes(b"never stored");
        let queue = StubQueue::new().with_operation(Operation::new("op-2".to_string(), bogus_digest));
        let coordinator = Coordinator::new(
            Arc::new(queue.clone()),
            remote,
            cache,
            dir.path().join("exec"),
            always_policy(),
            Duration::from_secs(60),
        );

        assert!(coordinator.run_once().await.unwrap());
        let result = queue.result_for("op-2").unwrap();
        assert_eq!(result.exit_code, -1);
    }
}
