/*
 * Copyright 2026 The Quarry Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{
    fmt, fs, io,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    process,
    time::Instant,
};

use crate::goal::{GoalId, WeakGoal};

/// One readable stream of a child, detached from `std::process` so it
/// can be polled and read independently of reaping.
pub(crate) struct ChildStream {
    pub fd: RawFd,
    pub file: fs::File,
}

/// Owning handle to a spawned child process together with its piped
/// output streams. Dropping an unreaped handle kills and reaps the
/// process, so a handle can never leak a running child.
pub struct ChildProcess {
    child: process::Child,
    streams: Vec<ChildStream>,
    reaped: bool,
}

impl ChildProcess {
    /// Takes over a freshly spawned child. Its piped stdout/stderr (when
    /// present) become the readable streams the scheduler multiplexes.
    pub fn new(mut child: process::Child) -> ChildProcess {
        let mut streams = Vec::new();
        if let Some(out) = child.stdout.take() {
            let file = fs::File::from(OwnedFd::from(out));
            streams.push(ChildStream { fd: file.as_raw_fd(), file });
        }
        if let Some(err) = child.stderr.take() {
            let file = fs::File::from(OwnedFd::from(err));
            streams.push(ChildStream { fd: file.as_raw_fd(), file });
        }
        ChildProcess {
            child,
            streams,
            reaped: false,
        }
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.streams.iter().map(|s| s.fd).collect()
    }

    pub(crate) fn stream(&self, fd: RawFd) -> Option<&ChildStream> {
        self.streams.iter().find(|s| s.fd == fd)
    }

    pub fn kill(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
        }
    }

    /// Waits for the process to exit and reaps it.
    pub fn wait(&mut self) -> io::Result<process::ExitStatus> {
        let status = self.child.wait()?;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.child.id())
            .field("streams", &self.streams.len())
            .field("reaped", &self.reaped)
            .finish()
    }
}

/// Registry record for one running child.
pub(crate) struct Child {
    pub goal_id: GoalId,
    pub goal: WeakGoal,
    pub process: ChildProcess,
    /// Streams that have not yet reached EOF; shrinks as streams close.
    pub fds: Vec<RawFd>,
    pub time_started: Instant,
    pub last_output: Instant,
    pub in_build_slot: bool,
    pub respect_timeouts: bool,
}

#[cfg(test)]
mod test {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn piped_streams_become_pollable_fds() {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let mut process = ChildProcess::new(child);
        assert_eq!(process.fds().len(), 2);
        assert!(process.wait().unwrap().success());
    }

    #[test]
    fn dropping_an_unreaped_handle_kills_the_child() {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 60")
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let pid = child.id();
        drop(ChildProcess::new(child));
        // The child was killed and reaped, so probing it (signal 0) must
        // fail with ESRCH.
        let probe = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None);
        assert!(probe.is_err());
    }
}
