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

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::StoreError;

/// The base name of a path inside the store directory, e.g.
/// `7rjj86a1-hello-2.10`. The store itself knows how to turn this into a
/// real filesystem location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorePath(String);

impl StorePath {
    pub fn new(name: impl Into<String>) -> Result<StorePath, StoreError> {
        let name = name.into();
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(StoreError::InvalidStorePath(name));
        }
        Ok(StorePath(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_separators_and_dots() {
        assert!(StorePath::new("abc123-hello").is_ok());
        assert!(StorePath::new("").is_err());
        assert!(StorePath::new(".").is_err());
        assert!(StorePath::new("..").is_err());
        assert!(StorePath::new("nested/path").is_err());
    }

    #[test]
    fn displays_as_base_name() {
        let p = StorePath::new("abc123-hello").unwrap();
        assert_eq!(p.to_string(), "abc123-hello");
        assert_eq!(p.name(), "abc123-hello");
    }
}
