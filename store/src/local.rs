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
    cell::RefCell,
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use crate::{
    derivation::Derivation,
    hash::{self, Hash, HashAlgo},
    path::StorePath,
    PathInfo, Store, StoreError,
};

/// A filesystem-backed store with in-memory metadata. Enough store for
/// the scheduler's tests and demos; validity is not persisted across
/// instances.
pub struct LocalStore {
    root: PathBuf,
    infos: RefCell<HashMap<StorePath, PathInfo>>,
    min_free: u64,
}

impl LocalStore {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<LocalStore> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(LocalStore {
            root,
            infos: RefCell::new(HashMap::new()),
            min_free: 0,
        })
    }

    pub fn with_min_free(mut self, bytes: u64) -> LocalStore {
        self.min_free = bytes;
        self
    }

    /// Writes `contents` to `path` and registers it. Fixture helper for
    /// tests and demos.
    pub fn add_text(&self, path: &StorePath, contents: &[u8]) -> Result<PathInfo, StoreError> {
        let real = self.to_real_path(path);
        fs::write(&real, contents)?;
        let (nar_hash, nar_size) = hash::hash_path(HashAlgo::Sha256, &real)?;
        let info = PathInfo {
            path: path.clone(),
            nar_hash,
            nar_size,
            references: Default::default(),
        };
        self.register_valid_path(info.clone());
        Ok(info)
    }

    /// Serializes a derivation into the store and registers it. The
    /// derivation's store path is derived from its contents, so equal
    /// recipes land on equal paths.
    pub fn add_derivation(&self, drv: &Derivation) -> Result<StorePath, StoreError> {
        let json = serde_json::to_vec_pretty(drv).map_err(|source| StoreError::BadDerivation {
            path: StorePath::new(format!("{}.drv", drv.name)).expect("derivation names are path-safe"),
            source,
        })?;
        let digest = Hash::of_bytes(HashAlgo::Sha256, &json);
        let path = StorePath::new(format!("{}-{}.drv", &digest.to_hex()[..8], drv.name))?;
        let real = self.to_real_path(&path);
        fs::write(&real, &json)?;
        let (nar_hash, nar_size) = hash::hash_path(HashAlgo::Sha256, &real)?;
        self.register_valid_path(PathInfo {
            path: path.clone(),
            nar_hash,
            nar_size,
            references: Default::default(),
        });
        Ok(path)
    }
}

impl Store for LocalStore {
    fn store_dir(&self) -> &Path {
        &self.root
    }

    fn is_valid_path(&self, path: &StorePath) -> bool {
        self.infos.borrow().contains_key(path)
    }

    fn query_path_info(&self, path: &StorePath) -> Result<PathInfo, StoreError> {
        self.infos
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotValid(path.clone()))
    }

    fn register_valid_path(&self, info: PathInfo) {
        self.infos.borrow_mut().insert(info.path.clone(), info);
    }

    fn read_derivation(&self, path: &StorePath) -> Result<Derivation, StoreError> {
        if !path.name().ends_with(".drv") {
            return Err(StoreError::NotADerivation(path.clone()));
        }
        let bytes = fs::read(self.to_real_path(path))?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::BadDerivation {
            path: path.clone(),
            source,
        })
    }

    fn auto_gc(&self, block: bool) {
        tracing::trace!(block, "auto-GC nudge ignored");
    }

    fn min_free(&self) -> u64 {
        self.min_free
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    #[test]
    fn add_text_registers_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let path = StorePath::new("abc123-greeting").unwrap();
        assert!(!store.is_valid_path(&path));
        let info = store.add_text(&path, b"hello").unwrap();
        assert!(store.is_valid_path(&path));
        assert!(store.path_exists(&path));
        let (rehash, _) = store.hash_path(HashAlgo::Sha256, &path).unwrap();
        assert_eq!(info.nar_hash, rehash);
    }

    #[test]
    fn derivations_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let drv = Derivation {
            name: "trivial".to_owned(),
            builder: "/bin/sh".to_owned(),
            args: vec!["-c".to_owned(), ": > \"$out\"".to_owned()],
            env: BTreeMap::new(),
            outputs: {
                let mut outputs = BTreeMap::new();
                outputs.insert(
                    "out".to_owned(),
                    crate::DerivationOutput {
                        path: StorePath::new("abc123-trivial").unwrap(),
                        expected_hash: None,
                    },
                );
                outputs
            },
            input_drvs: BTreeMap::new(),
            input_srcs: BTreeSet::new(),
        };
        let path = store.add_derivation(&drv).unwrap();
        assert!(path.name().ends_with("-trivial.drv"));
        assert_eq!(store.read_derivation(&path).unwrap(), drv);

        let not_a_drv = StorePath::new("abc123-not-a-drv").unwrap();
        assert!(matches!(
            store.read_derivation(&not_a_drv),
            Err(StoreError::NotADerivation(_))
        ));
    }
}
