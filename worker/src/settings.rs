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

/// Read-only snapshot of the settings the scheduler consults. How these
/// are loaded is the embedder's business.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Upper bound on concurrently running local builders. Zero means
    /// "never build locally".
    pub max_build_jobs: u32,
    /// Seconds a builder may stay silent before it is timed out. Zero
    /// disables the check.
    pub max_silent_time: u64,
    /// Seconds a builder may run in total. Zero disables the check.
    pub build_timeout: u64,
    /// Seconds between re-checks of goals polling for a lock.
    pub poll_interval: u64,
    /// Keep driving the remaining top goals after one of them fails.
    pub keep_going: bool,
    /// Build locally when substitution fails outright.
    pub try_fallback: bool,
    /// Names of configured remote build machines. Only consulted for the
    /// "no build slots" diagnostic; remote building itself is out of
    /// scope.
    pub remote_machines: Vec<String>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            max_build_jobs: num_cpus::get() as u32,
            max_silent_time: 0,
            build_timeout: 0,
            poll_interval: 5,
            keep_going: false,
            try_fallback: false,
            remote_machines: Vec::new(),
        }
    }
}
