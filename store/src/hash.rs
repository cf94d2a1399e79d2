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
    os::unix::ffi::OsStrExt,
    os::unix::fs::PermissionsExt,
    path::Path,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgo {
    Sha256,
}

impl HashAlgo {
    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgo::Sha256 => "sha256",
        }
    }
}

/// A content hash. The all-zero hash is a valid value meaning "any
/// contents"; see `Hash::is_null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash {
    pub algo: HashAlgo,
    pub bytes: [u8; 32],
}

impl Hash {
    pub fn null(algo: HashAlgo) -> Hash {
        Hash { algo, bytes: [0; 32] }
    }

    pub fn is_null(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    pub fn of_bytes(algo: HashAlgo, data: &[u8]) -> Hash {
        match algo {
            HashAlgo::Sha256 => {
                let mut bytes = [0; 32];
                bytes.copy_from_slice(&Sha256::digest(data));
                Hash { algo, bytes }
            }
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo.as_str(), self.to_hex())
    }
}

/// Hashes a canonical serialization of the filesystem object at `path`
/// (regular file contents plus the executable bit, directory entries in
/// sorted order, symlink targets). Returns the hash together with the
/// total size of the serialized object.
pub fn hash_path(algo: HashAlgo, path: &Path) -> io::Result<(Hash, u64)> {
    match algo {
        HashAlgo::Sha256 => {
            let mut hasher = Sha256::new();
            let size = feed_path(&mut hasher, path)?;
            let mut bytes = [0; 32];
            bytes.copy_from_slice(&hasher.finalize());
            Ok((Hash { algo, bytes }, size))
        }
    }
}

fn feed_path(hasher: &mut Sha256, path: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    let ty = meta.file_type();
    if ty.is_symlink() {
        let target = fs::read_link(path)?;
        let target = target.as_os_str().as_bytes();
        hasher.update(b"link(");
        hasher.update(target);
        hasher.update(b")");
        Ok(target.len() as u64)
    } else if ty.is_dir() {
        let mut entries: Vec<_> = fs::read_dir(path)?.collect::<io::Result<_>>()?;
        // Entry order must not depend on the filesystem.
        entries.sort_by_key(|e| e.file_name());
        hasher.update(b"dir(");
        let mut size = 0;
        for entry in entries {
            hasher.update(b"entry(");
            hasher.update(entry.file_name().as_bytes());
            hasher.update(b"=");
            size += feed_path(hasher, &entry.path())?;
            hasher.update(b")");
        }
        hasher.update(b")");
        Ok(size)
    } else {
        let executable = meta.permissions().mode() & 0o100 != 0;
        hasher.update(if executable { &b"xfile("[..] } else { &b"file("[..] });
        let mut file = fs::File::open(path)?;
        let size = io::copy(&mut file, hasher)?;
        hasher.update(b")");
        Ok(size)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn null_hash_matches_nothing_else() {
        let null = Hash::null(HashAlgo::Sha256);
        assert!(null.is_null());
        assert!(!Hash::of_bytes(HashAlgo::Sha256, b"x").is_null());
    }

    #[test]
    fn file_hash_depends_on_contents() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, "hello").unwrap();
        fs::write(&b, "hello").unwrap();
        let (ha, size) = hash_path(HashAlgo::Sha256, &a).unwrap();
        let (hb, _) = hash_path(HashAlgo::Sha256, &b).unwrap();
        assert_eq!(ha, hb);
        assert_eq!(size, 5);

        fs::write(&b, "world").unwrap();
        let (hb, _) = hash_path(HashAlgo::Sha256, &b).unwrap();
        assert_ne!(ha, hb);
    }

    #[test]
    fn directory_hash_covers_entry_names() {
        let dir = tempfile::tempdir().unwrap();
        let d1 = dir.path().join("d1");
        let d2 = dir.path().join("d2");
        fs::create_dir(&d1).unwrap();
        fs::create_dir(&d2).unwrap();
        let mut f = fs::File::create(d1.join("one")).unwrap();
        f.write_all(b"contents").unwrap();
        let mut f = fs::File::create(d2.join("two")).unwrap();
        f.write_all(b"contents").unwrap();
        let (h1, _) = hash_path(HashAlgo::Sha256, &d1).unwrap();
        let (h2, _) = hash_path(HashAlgo::Sha256, &d2).unwrap();
        assert_ne!(h1, h2);
    }
}
