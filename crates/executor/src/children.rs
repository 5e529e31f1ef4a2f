// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
//! A child process placed in its own process group, so that killing it on timeout or on drop
//! also kills anything it forked without the worker having to track descendants itself.

use std::io;
use std::process::Stdio;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

/// Wraps a [`tokio::process::Child`] spawned into a new session (and therefore a new process
/// group), with kill-on-drop enabled so a worker crash or panic can't orphan a runaway command.
pub struct ManagedChild {
    child: Child,
    pgid: Pid,
}

impl ManagedChild {
    pub fn spawn(mut command: Command) -> io::Result<ManagedChild> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // SAFETY: setsid() is async-signal-safe and this closure runs in the forked child
        // before exec, touching no shared state.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(io::Error::from)?;
                Ok(())
            });
        }

        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("spawned child had no pid"))?;
        Ok(ManagedChild {
            child,
            pgid: Pid::from_raw(pid as i32),
        })
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Sends SIGTERM to the whole process group, waits briefly for a clean exit, and escalates
    /// to SIGKILL if the group is still alive.
    pub async fn graceful_shutdown(&mut self, grace_period: std::time::Duration) {
        let _ = signal::killpg(self.pgid, Signal::SIGTERM);
        if tokio::time::timeout(grace_period, self.child.wait())
            .await
            .is_err()
        {
            let _ = signal::killpg(self.pgid, Signal::SIGKILL);
            let _ = self.child.wait().await;
        }
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        let _ = signal::killpg(self.pgid, Signal::SIGKILL);
    }
}
