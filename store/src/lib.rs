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

//! Vocabulary types for a content-addressed store and the interfaces the
//! build scheduler consumes: the [`Store`] itself and the
//! [`Substituter`]s it may fetch already-built paths from.

use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
    process,
};

use thiserror::Error;

pub mod derivation;
pub mod hash;
pub mod local;
pub mod locks;
pub mod path;

pub use derivation::{BuildMode, Derivation, DerivationOutput, RepairFlag};
pub use hash::{hash_path, Hash, HashAlgo};
pub use local::LocalStore;
pub use locks::PathLocks;
pub use path::StorePath;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid store path name '{0}'")]
    InvalidStorePath(String),
    #[error("path '{0}' is not valid")]
    NotValid(StorePath),
    #[error("store path '{0}' is not a derivation")]
    NotADerivation(StorePath),
    #[error("error reading derivation '{path}'")]
    BadDerivation {
        path: StorePath,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Metadata recorded for a valid store path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathInfo {
    pub path: StorePath,
    pub nar_hash: Hash,
    pub nar_size: u64,
    pub references: BTreeSet<StorePath>,
}

/// What a substituter advertises about a path it can provide.
#[derive(Debug, Clone, PartialEq)]
pub struct SubstitutablePathInfo {
    pub nar_hash: Hash,
    pub nar_size: u64,
    pub references: BTreeSet<StorePath>,
}

/// The store handle the scheduler consumes. Interior mutability is the
/// implementor's business; the scheduler calls it re-entrantly from one
/// thread.
pub trait Store {
    fn store_dir(&self) -> &Path;

    /// The real filesystem location of a store path.
    fn to_real_path(&self, path: &StorePath) -> PathBuf {
        self.store_dir().join(path.name())
    }

    fn print_store_path(&self, path: &StorePath) -> String {
        self.to_real_path(path).display().to_string()
    }

    /// Whether metadata is registered for `path`. Validity is about
    /// registration, not about the bytes on disk being intact.
    fn is_valid_path(&self, path: &StorePath) -> bool;

    fn query_path_info(&self, path: &StorePath) -> Result<PathInfo, StoreError>;

    fn register_valid_path(&self, info: PathInfo);

    fn read_derivation(&self, path: &StorePath) -> Result<Derivation, StoreError>;

    fn path_exists(&self, path: &StorePath) -> bool {
        self.to_real_path(path).exists()
    }

    /// Rehashes the on-disk contents of `path`.
    fn hash_path(&self, algo: HashAlgo, path: &StorePath) -> Result<(Hash, u64), StoreError> {
        Ok(hash::hash_path(algo, &self.to_real_path(path))?)
    }

    /// Non-blocking exclusive locks on the given store paths, or `None`
    /// when any of them is held by another goal or process.
    fn try_lock_paths(&self, paths: &[StorePath]) -> Result<Option<PathLocks>, StoreError> {
        let real: Vec<PathBuf> = paths.iter().map(|p| self.to_real_path(p)).collect();
        Ok(PathLocks::try_lock(&real)?)
    }

    /// Advisory hint that now is a good moment for opportunistic garbage
    /// collection.
    fn auto_gc(&self, _block: bool) {}

    /// The GC low-water mark in bytes; zero disables the periodic GC
    /// nudge.
    fn min_free(&self) -> u64 {
        0
    }
}

/// A source of already-built store paths. Transports are out of scope
/// here; a substituter hands the scheduler a child process whose exit
/// status reports the outcome and whose piped stdout doubles as its
/// progress stream.
pub trait Substituter {
    fn name(&self) -> &str;

    fn query_substitutable(&self, path: &StorePath) -> Option<SubstitutablePathInfo>;

    /// Spawns the transfer of `path` to `dest`. stdout must be piped.
    fn spawn_fetch(&self, path: &StorePath, dest: &Path) -> io::Result<process::Child>;
}
