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

//! The readiness primitive behind the scheduler's wait phase: block on
//! the union of child streams and a deadline, then classify reads. This
//! is the POSIX backend (`poll(2)`); a port would swap this module for
//! one over kqueue or completion ports and keep the same two entry
//! points.

use std::{
    convert::TryFrom,
    fs,
    io::{self, Read},
    os::fd::{BorrowedFd, RawFd},
    time::Duration,
};

use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};

pub(crate) enum PollOutcome {
    /// A signal arrived; the caller re-checks for cancellation and
    /// re-evaluates.
    Interrupted,
    /// Streams with a pending event: readable bytes, EOF, or an error
    /// condition that a read will surface.
    Ready(Vec<RawFd>),
}

/// Blocks until any source has an event or the timeout elapses. `None`
/// waits indefinitely.
pub(crate) fn wait_for_readable(
    sources: &[(RawFd, BorrowedFd<'_>)],
    timeout: Option<Duration>,
) -> io::Result<PollOutcome> {
    let timeout = match timeout {
        None => PollTimeout::NONE,
        Some(t) => {
            let millis = t.as_millis().min(i32::MAX as u128) as i32;
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
        }
    };
    let mut fds: Vec<PollFd> = sources
        .iter()
        .map(|(_, fd)| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();
    match poll(&mut fds, timeout) {
        Err(Errno::EINTR) => Ok(PollOutcome::Interrupted),
        Err(errno) => Err(io::Error::from(errno)),
        Ok(_) => {
            let ready = sources
                .iter()
                .zip(&fds)
                .filter(|(_, pollfd)| pollfd.revents().map_or(false, |r| !r.is_empty()))
                .map(|((fd, _), _)| *fd)
                .collect();
            Ok(PollOutcome::Ready(ready))
        }
    }
}

pub(crate) enum ReadOutcome {
    Eof,
    /// EINTR mid-read; skip the stream for this cycle.
    Interrupted,
    Data(usize),
}

/// One bounded read from a child stream. A zero-length read and EIO (how
/// a closed pseudo-terminal reports) both mean EOF.
pub(crate) fn read_stream(mut file: &fs::File, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    match file.read(buf) {
        Ok(0) => Ok(ReadOutcome::Eof),
        Ok(n) => Ok(ReadOutcome::Data(n)),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::Interrupted),
        Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => Ok(ReadOutcome::Eof),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::fd::{AsFd, AsRawFd};
    use std::process::{Command, Stdio};
    use std::time::Instant;

    #[test]
    fn timeout_elapses_with_no_sources() {
        let start = Instant::now();
        match wait_for_readable(&[], Some(Duration::from_millis(50))).unwrap() {
            PollOutcome::Ready(fds) => assert!(fds.is_empty()),
            PollOutcome::Interrupted => {}
        }
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn child_output_reports_readable_then_eof() {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("printf hello")
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let out = child.stdout.take().unwrap();
        let file = fs::File::from(std::os::fd::OwnedFd::from(out));
        let fd = file.as_raw_fd();

        let sources = [(fd, file.as_fd())];
        let ready = match wait_for_readable(&sources, Some(Duration::from_secs(5))).unwrap() {
            PollOutcome::Ready(fds) => fds,
            PollOutcome::Interrupted => panic!("unexpected EINTR"),
        };
        assert_eq!(ready, vec![fd]);

        let mut buf = [0u8; 4096];
        match read_stream(&file, &mut buf).unwrap() {
            ReadOutcome::Data(n) => assert_eq!(&buf[..n], b"hello"),
            _ => panic!("expected data"),
        }
        match read_stream(&file, &mut buf).unwrap() {
            ReadOutcome::Eof => {}
            _ => panic!("expected EOF"),
        }
        child.wait().unwrap();
    }
}
