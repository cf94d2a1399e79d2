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

//! The quarry build worker: a single-threaded cooperative scheduler
//! that drives *goals* (derivation builds, store-path substitutions) to
//! completion. It overlaps I/O from many child processes, shares
//! sub-goals between dependents, bounds local build concurrency, and
//! enforces per-child silence and wall-clock timeouts.
//!
//! The caller constructs a [`Worker`] over a [`quarry_store::Store`],
//! creates top-level goals through the goal factories, and calls
//! [`Worker::run`]. Afterwards the failure flags and
//! [`Worker::exit_status`] describe what happened.

pub mod child;
pub mod derivation;
pub mod goal;
pub mod interrupt;
mod io;
pub mod settings;
mod status;
pub mod substitution;
pub mod worker;

pub use child::ChildProcess;
pub use derivation::DerivationGoal;
pub use goal::{ExitCode, Goal, GoalCommon, GoalId, GoalKind, GoalPtr, WeakGoal};
pub use interrupt::{Interrupted, InterruptFlag};
pub use settings::Settings;
pub use substitution::SubstitutionGoal;
pub use worker::{Worker, WorkerError};

#[cfg(test)]
mod property_tests;
