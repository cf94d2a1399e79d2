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

use std::{collections::VecDeque, os::fd::RawFd, rc::Rc};

use quarry_store::{
    Hash, PathInfo, PathLocks, RepairFlag, StorePath, SubstitutablePathInfo, Substituter,
};

use crate::{
    child::ChildProcess,
    goal::{ExitCode, Goal, GoalCommon},
    worker::Worker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    TryNext,
    ReferencesValid,
    TryToRun,
    Finished,
}

/// Fetches one already-built store path from the first substituter that
/// has it, realising the advertised references first.
pub struct SubstitutionGoal {
    common: GoalCommon,
    path: StorePath,
    repair: RepairFlag,
    /// Expected content hash, when the requester knows one.
    ca: Option<Hash>,
    state: State,
    /// Substituters not tried yet.
    subs: VecDeque<Rc<dyn Substituter>>,
    /// The substituter the current attempt runs against.
    current: Option<Rc<dyn Substituter>>,
    info: Option<SubstitutablePathInfo>,
    /// Whether some substituter claimed the path and then failed, as
    /// opposed to nobody claiming it at all.
    substituter_failed: bool,
    lock: Option<PathLocks>,
}

impl SubstitutionGoal {
    pub(crate) fn new(
        common: GoalCommon,
        path: StorePath,
        repair: RepairFlag,
        ca: Option<Hash>,
    ) -> SubstitutionGoal {
        SubstitutionGoal {
            common,
            path,
            repair,
            ca,
            state: State::Init,
            subs: VecDeque::new(),
            current: None,
            info: None,
            substituter_failed: false,
            lock: None,
        }
    }

    fn finish(&mut self, worker: &mut Worker, result: ExitCode, message: Option<String>) {
        if let Some(message) = message {
            tracing::debug!(goal = %self.common.name, "{}", message);
            self.common.error = Some(message);
        }
        self.lock = None;
        self.current = None;
        self.am_done(worker, result);
    }
}

impl Goal for SubstitutionGoal {
    fn common(&self) -> &GoalCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut GoalCommon {
        &mut self.common
    }

    fn work(&mut self, worker: &mut Worker) -> anyhow::Result<()> {
        loop {
            match self.state {
                State::Init => {
                    if self.repair == RepairFlag::NoRepair
                        && worker.store().is_valid_path(&self.path)
                    {
                        self.finish(worker, ExitCode::Success, None);
                        return Ok(());
                    }
                    self.subs = worker.substituters().iter().cloned().collect();
                    self.state = State::TryNext;
                }

                State::TryNext => {
                    let sub = match self.subs.pop_front() {
                        None => {
                            // None left. If no substituter even claimed
                            // the path, the requester should build it
                            // instead.
                            let (result, message) = if self.substituter_failed {
                                (
                                    ExitCode::Failed,
                                    Some(format!(
                                        "could not substitute path '{}' from any substituter",
                                        worker.store().print_store_path(&self.path)
                                    )),
                                )
                            } else {
                                (ExitCode::NoSubstituters, None)
                            };
                            self.finish(worker, result, message);
                            return Ok(());
                        }
                        Some(sub) => sub,
                    };

                    let info = match sub.query_substitutable(&self.path) {
                        None => continue,
                        Some(info) => info,
                    };
                    if let Some(expected) = self.ca {
                        if !expected.is_null() && !info.nar_hash.is_null()
                            && info.nar_hash != expected
                        {
                            // This copy would not verify; try elsewhere.
                            self.trace("substituter advertises different contents");
                            continue;
                        }
                    }

                    tracing::debug!(
                        goal = %self.common.name,
                        "substituter '{}' has '{}'",
                        sub.name(),
                        self.path
                    );
                    self.current = Some(sub);

                    // Realise the rest of the advertised closure first.
                    let references = info.references.clone();
                    self.info = Some(info);
                    for reference in references {
                        if reference != self.path && !worker.store().is_valid_path(&reference) {
                            let goal = worker.make_substitution_goal(
                                &reference,
                                RepairFlag::NoRepair,
                                None,
                            );
                            self.add_waitee(goal);
                        }
                    }
                    self.state = State::ReferencesValid;
                    if !self.common.waitees.is_empty() {
                        return Ok(());
                    }
                }

                State::ReferencesValid => {
                    if self.common.nr_failed != 0 {
                        let result = if self.common.nr_no_substituters == self.common.nr_failed
                            || self.common.nr_incomplete_closure > 0
                        {
                            ExitCode::IncompleteClosure
                        } else {
                            ExitCode::Failed
                        };
                        self.finish(
                            worker,
                            result,
                            Some(format!(
                                "some references of path '{}' could not be realised",
                                worker.store().print_store_path(&self.path)
                            )),
                        );
                        return Ok(());
                    }
                    self.state = State::TryToRun;
                    let me = self.common.self_ref.clone();
                    worker.wake_up(me);
                    return Ok(());
                }

                State::TryToRun => {
                    if self.repair == RepairFlag::NoRepair
                        && worker.store().is_valid_path(&self.path)
                    {
                        // Someone else produced the path while we were
                        // queued.
                        self.finish(worker, ExitCode::Success, None);
                        return Ok(());
                    }

                    // Substitutions are cheap, so one may run even when
                    // local builds are disabled; beyond that they share
                    // the build-slot throttle.
                    let ceiling = worker.settings().max_build_jobs.max(1);
                    if worker.nr_local_builds() >= ceiling {
                        worker.wait_for_build_slot(&self.common.cell());
                        return Ok(());
                    }

                    if self.lock.is_none() {
                        match worker.store().try_lock_paths(&[self.path.clone()])? {
                            Some(lock) => self.lock = Some(lock),
                            None => {
                                // A building goal holds the path; its
                                // completion is the event to wait for.
                                self.trace("path is locked by another goal; waiting");
                                worker.wait_for_any_goal(&self.common.cell());
                                return Ok(());
                            }
                        }
                    }

                    let sub = self.current.clone().expect("substituter chosen in TryNext");
                    let dest = worker.store().to_real_path(&self.path);
                    tracing::info!(
                        "fetching '{}' from '{}'",
                        worker.store().print_store_path(&self.path),
                        sub.name()
                    );
                    let child = match sub.spawn_fetch(&self.path, &dest) {
                        Ok(child) => child,
                        Err(err) => {
                            tracing::debug!(
                                goal = %self.common.name,
                                "substituter '{}' failed to start: {}",
                                sub.name(),
                                err
                            );
                            self.substituter_failed = true;
                            self.state = State::TryNext;
                            continue;
                        }
                    };
                    let occupies_slot = worker.settings().max_build_jobs > 0;
                    worker.child_started(
                        &self.common.cell(),
                        ChildProcess::new(child),
                        occupies_slot,
                        false,
                    );
                    self.state = State::Finished;
                    return Ok(());
                }

                State::Finished => {
                    let cell = self.common.cell();
                    let mut process = worker
                        .child_terminated(&cell, true)
                        .expect("a fetching goal has a registered child");
                    let status = process.wait()?;
                    drop(process);

                    let fetched = status.success() && worker.store().path_exists(&self.path);
                    if !fetched {
                        tracing::debug!(
                            goal = %self.common.name,
                            "fetch of '{}' failed with {}",
                            self.path,
                            status
                        );
                        self.substituter_failed = true;
                        self.state = State::TryNext;
                        continue;
                    }

                    let expected = self.info.as_ref().expect("info recorded in TryNext").nar_hash;
                    let (produced, nar_size) = worker.store().hash_path(expected.algo, &self.path)?;
                    if !expected.is_null() && produced != expected {
                        tracing::warn!(
                            "hash mismatch in path '{}' fetched from '{}'",
                            worker.store().print_store_path(&self.path),
                            self.current.as_ref().map_or("?", |s| s.name())
                        );
                        self.substituter_failed = true;
                        self.state = State::TryNext;
                        continue;
                    }

                    let references = self
                        .info
                        .as_ref()
                        .expect("info recorded in TryNext")
                        .references
                        .clone();
                    worker.store().register_valid_path(PathInfo {
                        path: self.path.clone(),
                        nar_hash: produced,
                        nar_size,
                        references,
                    });
                    worker.mark_contents_good(self.path.clone());
                    self.finish(worker, ExitCode::Success, None);
                    return Ok(());
                }
            }
        }
    }

    fn handle_child_output(&mut self, _fd: RawFd, data: &[u8]) {
        tracing::trace!(goal = %self.common.name, "{} progress bytes", data.len());
    }

    fn handle_eof(&mut self, worker: &mut Worker, _fd: RawFd) {
        self.trace("fetch stream closed");
        let me = self.common.self_ref.clone();
        worker.wake_up(me);
    }

    fn timed_out(&mut self, worker: &mut Worker, reason: anyhow::Error) {
        // Registered with respect_timeouts = false, so this only fires
        // for embedders that flip that choice.
        let cell = self.common.cell();
        if let Some(mut process) = worker.child_terminated(&cell, true) {
            process.kill();
            let _ = process.wait();
        }
        worker.note_timed_out();
        self.finish(worker, ExitCode::Failed, Some(format!("{:#}", reason)));
    }
}
