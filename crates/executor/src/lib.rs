// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
//! Runs one `Command` to completion inside a prepared execution directory, enforcing the
//! action's timeout, draining stdout/stderr concurrently with the child running, and packaging
//! captured output according to each stream's `CasInsertionControl`.

mod children;

use std::path::{Path, PathBuf};
use std::time::Duration;

use cas_cache::Cache;
use children::ManagedChild;
use hashing::Digest;
use remote_protocol::{Action, ActionResult, CasInsertionControl, Command, OutputFile};
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;

/// The conventional shell exit code for a process killed by a signal (128 + signal number);
/// used as the `exit_code` reported for an action forcibly terminated after its timeout.
const TIMED_OUT_EXIT_CODE: i32 = 128 + libc::SIGTERM;

/// The policy controlling how captured stdout, stderr, and each declared output file are
/// packaged into the final `ActionResult`.
#[derive(Clone, Copy)]
pub struct OutputPolicy {
    pub stdout: CasInsertionControl,
    pub stderr: CasInsertionControl,
    pub output_files: CasInsertionControl,
}

pub struct ExecutionHarness {
    cache: Cache,
}

impl ExecutionHarness {
    pub fn new(cache: Cache) -> Self {
        ExecutionHarness { cache }
    }

    /// Runs `command` inside `workdir`, honoring `action`'s timeout and output declarations.
    ///
    /// `action.output_directories` is rejected outright: this worker only materializes and
    /// captures individual declared files, never whole output trees.
    pub async fn run(
        &self,
        action: &Action,
        command: &Command,
        workdir: &Path,
        policy: OutputPolicy,
    ) -> Result<ActionResult, String> {
        if !action.output_directories.is_empty() {
            return Err(
                "output_directories is not supported by this worker; the action was aborted"
                    .to_string(),
            );
        }

        let mut tokio_command = TokioCommand::new(
            command
                .argv
                .first()
                .ok_or_else(|| "command had an empty argv".to_string())?,
        );
        tokio_command.args(&command.argv[1..]);
        tokio_command.current_dir(workdir);
        tokio_command.env_clear();
        tokio_command.envs(&command.env);

        let mut child = ManagedChild::spawn(tokio_command)
            .map_err(|e| format!("failed to spawn command: {e}"))?;

        let mut stdout_pipe = child
            .child_mut()
            .stdout
            .take()
            .ok_or_else(|| "child had no stdout pipe".to_string())?;
        let mut stderr_pipe = child
            .child_mut()
            .stderr
            .take()
            .ok_or_else(|| "child had no stderr pipe".to_string())?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let exit_code = match action.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.child_mut().wait()).await {
                Ok(status) => exit_code_of(status.map_err(|e| format!("failed to wait for command: {e}"))?),
                Err(_elapsed) => {
                    log::warn!("action exceeded its {timeout:?} timeout; terminating");
                    child.graceful_shutdown(Duration::from_millis(100)).await;
                    TIMED_OUT_EXIT_CODE
                }
            },
            None => exit_code_of(
                child
                    .child_mut()
                    .wait()
                    .await
                    .map_err(|e| format!("failed to wait for command: {e}"))?,
            ),
        };

        let stdout_bytes = stdout_task.await.map_err(|e| format!("stdout drain task panicked: {e}"))?;
        let stderr_bytes = stderr_task.await.map_err(|e| format!("stderr drain task panicked: {e}"))?;

        let (stdout_raw, stdout_digest) = self.package_stream(&stdout_bytes, policy.stdout).await?;
        let (stderr_raw, stderr_digest) = self.package_stream(&stderr_bytes, policy.stderr).await?;

        let mut output_files = Vec::new();
        for relative_path in &action.output_files {
            let output = self
                .collect_output_file(workdir, relative_path, policy.output_files)
                .await?;
            output_files.push(output);
        }

        Ok(ActionResult {
            exit_code,
            output_files,
            stdout_raw,
            stdout_digest,
            stderr_raw,
            stderr_digest,
        })
    }

    async fn package_stream(
        &self,
        bytes: &[u8],
        policy: CasInsertionControl,
    ) -> Result<(Option<Vec<u8>>, Option<Digest>), String> {
        if bytes.is_empty() {
            return Ok((None, None));
        }
        let raw = policy.should_inline(bytes.len()).then(|| bytes.to_vec());
        let digest = if policy.should_insert(bytes.len()) {
            let digest = Digest::of_bytes(bytes);
            self.cache.put(digest, bytes::Bytes::copy_from_slice(bytes)).await?;
            Some(digest)
        } else {
            None
        };
        Ok((raw, digest))
    }

    async fn collect_output_file(
        &self,
        workdir: &Path,
        relative_path: &str,
        policy: CasInsertionControl,
    ) -> Result<OutputFile, String> {
        let absolute: PathBuf = workdir.join(relative_path);
        let bytes = tokio::fs::read(&absolute)
            .await
            .map_err(|e| format!("declared output file {relative_path} was not produced: {e}"))?;
        let is_executable = is_executable_file(&absolute).await?;
        let (content, digest) = self.package_stream(&bytes, policy).await?;
        Ok(OutputFile {
            path: relative_path.to_string(),
            is_executable,
            content,
            digest,
        })
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

#[cfg(unix)]
async fn is_executable_file(path: &Path) -> Result<bool, String> {
    use std::os::unix::fs::PermissionsExt;
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("failed to stat {}: {e}", path.display()))?;
    Ok(meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
async fn is_executable_file(_path: &Path) -> Result<bool, String> {
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_protocol::CasInsertionPolicy;
    use rpc_client::StubCas;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn harness() -> (tempfile::TempDir, ExecutionHarness) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 10_000_000, Arc::new(StubCas::new()));
        (dir, ExecutionHarness::new(cache))
    }

    fn default_policy() -> OutputPolicy {
        let always = CasInsertionControl::new(1_000, CasInsertionPolicy::AlwaysInsert);
        OutputPolicy {
            stdout: always,
            stderr: always,
            output_files: always,
        }
    }

    fn action(output_files: Vec<String>, timeout: Option<Duration>) -> Action {
        Action {
            command_digest: hashing::EMPTY_DIGEST,
            input_root_digest: hashing::EMPTY_DIGEST,
            output_files,
            output_directories: vec![],
            timeout,
            do_not_cache: false,
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let (workdir, harness) = harness();
        let action = action(vec![], None);
        let command = Command {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), "echo hello".to_string()],
            env: BTreeMap::new(),
        };
        let result = harness.run(&action, &command, workdir.path(), default_policy()).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout_raw.unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn reports_nonzero_exit_code() {
        let (workdir, harness) = harness();
        let action = action(vec![], None);
        let command = Command {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), "exit 7".to_string()],
            env: BTreeMap::new(),
        };
        let result = harness.run(&action, &command, workdir.path(), default_policy()).await.unwrap();
        assert_eq!(result.exit_code, 7);
    }

    #[tokio::test]
    async fn collects_declared_output_file() {
        let (workdir, harness) = harness();
        let action = action(vec!["out.txt".to_string()], None);
        let command = Command {
            argv: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo contents > out.txt".to_string(),
            ],
            env: BTreeMap::new(),
        };
        let result = harness.run(&action, &command, workdir.path(), default_policy()).await.unwrap();
        assert_eq!(result.output_files.len(), 1);
        assert_eq!(result.output_files[0].path, "out.txt");
        assert_eq!(result.output_files[0].content.as_deref(), Some(&b"contents\n"[..]));
    }

    #[tokio::test]
    async fn missing_declared_output_file_is_an_error() {
        let (workdir, harness) = harness();
        let action = action(vec!["missing.txt".to_string()], None);
        let command = Command {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()],
            env: BTreeMap::new(),
        };
        assert!(harness.run(&action, &command, workdir.path(), default_policy()).await.is_err());
    }

    #[tokio::test]
    async fn output_directories_aborts_the_action() {
        let (workdir, harness) = harness();
        let mut action = action(vec![], None);
        action.output_directories.push("out_dir".to_string());
        let command = Command {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()],
            env: BTreeMap::new(),
        };
        assert!(harness.run(&action, &command, workdir.path(), default_policy()).await.is_err());
    }

    #[tokio::test]
    async fn timeout_forcibly_terminates_a_hanging_command() {
        let (workdir, harness) = harness();
        let action = action(vec![], Some(Duration::from_millis(100)));
        let command = Command {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
            env: BTreeMap::new(),
        };
        let result = harness.run(&action, &command, workdir.path(), default_policy()).await.unwrap();
        assert_eq!(result.exit_code, TIMED_OUT_EXIT_CODE);
    }

    #[tokio::test]
    async fn empty_stream_is_omitted_entirely() {
        let (workdir, harness) = harness();
        let action = action(vec![], None);
        let command = Command {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()],
            env: BTreeMap::new(),
        };
        let result = harness.run(&action, &command, workdir.path(), default_policy()).await.unwrap();
        assert!(result.stdout_raw.is_none());
        assert!(result.stdout_digest.is_none());
        assert!(result.stderr_raw.is_none());
        assert!(result.stderr_digest.is_none());
    }

    #[tokio::test]
    async fn environment_is_fully_replaced_not_merged() {
        let (workdir, harness) = harness();
        let action = action(vec![], None);
        let mut env = BTreeMap::new();
        env.insert("ONLY_VAR".to_string(), "set".to_string());
        let command = Command {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), "env".to_string()],
            env,
        };
        let result = harness.run(&action, &command, workdir.path(), default_policy()).await.unwrap();
        let stdout = String::from_utf8(result.stdout_raw.unwrap()).unwrap();
        assert_eq!(stdout.trim(), "ONLY_VAR=set");
    }
}
