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

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{hash::Hash, path::StorePath};

/// How a derivation should be realised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Normal,
    /// Re-realise outputs whose on-disk contents no longer match their
    /// recorded hash.
    Repair,
    /// Rebuild valid outputs into a scratch location and compare against
    /// the recorded contents.
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairFlag {
    NoRepair,
    Repair,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivationOutput {
    pub path: StorePath,
    /// For fixed-output derivations: the hash the produced contents must
    /// have.
    #[serde(default)]
    pub expected_hash: Option<Hash>,
}

/// A build recipe: inputs, a builder invocation, and the outputs it
/// promises to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Derivation {
    pub name: String,
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, DerivationOutput>,
    /// Derivations whose named outputs must be realised before this one
    /// can build.
    pub input_drvs: BTreeMap<StorePath, BTreeSet<String>>,
    /// Store paths that must be present (substituted if necessary).
    pub input_srcs: BTreeSet<StorePath>,
}

impl Derivation {
    /// The outputs selected by `wanted`; the empty set selects all of
    /// them.
    pub fn outputs_for<'a>(
        &'a self,
        wanted: &BTreeSet<String>,
    ) -> Vec<(&'a str, &'a DerivationOutput)> {
        self.outputs
            .iter()
            .filter(|(name, _)| wanted.is_empty() || wanted.contains(*name))
            .map(|(name, output)| (name.as_str(), output))
            .collect()
    }

    pub fn output_paths(&self) -> Vec<StorePath> {
        self.outputs.values().map(|o| o.path.clone()).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn drv_with_outputs(names: &[&str]) -> Derivation {
        Derivation {
            name: "example".to_owned(),
            builder: "/bin/sh".to_owned(),
            args: vec![],
            env: BTreeMap::new(),
            outputs: names
                .iter()
                .map(|n| {
                    (
                        (*n).to_owned(),
                        DerivationOutput {
                            path: StorePath::new(format!("abc-{}", n)).unwrap(),
                            expected_hash: None,
                        },
                    )
                })
                .collect(),
            input_drvs: BTreeMap::new(),
            input_srcs: BTreeSet::new(),
        }
    }

    #[test]
    fn empty_wanted_set_selects_all_outputs() {
        let drv = drv_with_outputs(&["dev", "out"]);
        assert_eq!(drv.outputs_for(&BTreeSet::new()).len(), 2);
        let mut wanted = BTreeSet::new();
        wanted.insert("out".to_owned());
        let selected = drv.outputs_for(&wanted);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0, "out");
    }

    #[test]
    fn round_trips_through_json() {
        let drv = drv_with_outputs(&["out"]);
        let json = serde_json::to_string(&drv).unwrap();
        let back: Derivation = serde_json::from_str(&json).unwrap();
        assert_eq!(drv, back);
    }
}
