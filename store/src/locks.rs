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
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};

/// Exclusive advisory locks over a set of (to-be-created) store paths,
/// taken on `<path>.lock` side files. Dropping the value releases every
/// lock. flock(2) locks are per open file description, so contention is
/// detected both across processes and between goals in one worker.
pub struct PathLocks {
    locks: Vec<Flock<fs::File>>,
    paths: Vec<PathBuf>,
}

impl PathLocks {
    /// Attempts to lock all of `paths` without blocking. Returns `None`
    /// if any of them is held elsewhere; in that case no lock is
    /// retained.
    pub fn try_lock(paths: &[PathBuf]) -> io::Result<Option<PathLocks>> {
        // Sorted acquisition keeps the failure behavior stable when two
        // holders want overlapping sets.
        let mut sorted: Vec<&PathBuf> = paths.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut locks = Vec::with_capacity(sorted.len());
        for path in &sorted {
            let lock_path = lock_file_name(path);
            let file = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&lock_path)?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => locks.push(lock),
                Err((_, Errno::EAGAIN)) => return Ok(None),
                Err((_, errno)) => return Err(io::Error::from(errno)),
            }
        }
        Ok(Some(PathLocks {
            locks,
            paths: sorted.into_iter().cloned().collect(),
        }))
    }
}

impl fmt::Debug for PathLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathLocks")
            .field("paths", &self.paths)
            .field("held", &self.locks.len())
            .finish()
    }
}

fn lock_file_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn second_holder_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let target = vec![dir.path().join("out")];
        let first = PathLocks::try_lock(&target).unwrap();
        assert!(first.is_some());
        assert!(PathLocks::try_lock(&target).unwrap().is_none());
        drop(first);
        assert!(PathLocks::try_lock(&target).unwrap().is_some());
    }

    #[test]
    fn overlapping_sets_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let first = PathLocks::try_lock(&[a.clone()]).unwrap().unwrap();
        assert!(PathLocks::try_lock(&[b.clone(), a.clone()]).unwrap().is_none());
        drop(first);
        assert!(PathLocks::try_lock(&[b, a]).unwrap().is_some());
    }
}
