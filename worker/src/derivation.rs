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
    collections::BTreeSet,
    fs, io,
    os::fd::RawFd,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::Context;

use quarry_store::{
    hash, BuildMode, Derivation, DerivationOutput, HashAlgo, PathInfo, PathLocks, RepairFlag,
    StorePath,
};

use crate::{
    child::ChildProcess,
    goal::{ExitCode, Goal, GoalCommon},
    worker::Worker,
};

/// How much of the builder's output is retained for failure messages.
const LOG_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    LoadDerivation,
    HaveDerivation,
    OutputsSubstituted,
    InputsRealised,
    TryToBuild,
    BuildDone,
}

/// Realises one derivation: substitutes what it can, realises the
/// inputs, then runs the builder under a build slot.
pub struct DerivationGoal {
    common: GoalCommon,
    drv_path: StorePath,
    /// Output names to realise; empty means all of them.
    wanted_outputs: BTreeSet<String>,
    build_mode: BuildMode,
    drv: Option<Derivation>,
    state: State,
    output_locks: Option<PathLocks>,
    scratch_dir: Option<ScratchDir>,
    /// Builder streams that have not reached EOF yet; the build is over
    /// when the last one closes.
    open_streams: usize,
    log_tail: Vec<u8>,
}

impl DerivationGoal {
    pub(crate) fn new(
        common: GoalCommon,
        drv_path: StorePath,
        wanted_outputs: BTreeSet<String>,
        build_mode: BuildMode,
        drv: Option<Derivation>,
    ) -> DerivationGoal {
        let state = if drv.is_some() {
            // An in-memory derivation skips the load states.
            State::HaveDerivation
        } else {
            State::Init
        };
        DerivationGoal {
            common,
            drv_path,
            wanted_outputs,
            build_mode,
            drv,
            state,
            output_locks: None,
            scratch_dir: None,
            open_streams: 0,
            log_tail: Vec::new(),
        }
    }

    fn drv(&self) -> &Derivation {
        self.drv.as_ref().expect("derivation is loaded in this state")
    }

    /// The wanted outputs that still need to be produced. In repair
    /// mode a registered output with corrupt contents counts as
    /// missing.
    fn missing_outputs(&self, worker: &mut Worker) -> Vec<DerivationOutput> {
        let repair = self.build_mode == BuildMode::Repair;
        let mut missing = Vec::new();
        for (_, output) in self.drv().outputs_for(&self.wanted_outputs) {
            let valid = worker.store().is_valid_path(&output.path)
                && (!repair || worker.path_contents_good(&output.path));
            if !valid {
                missing.push(output.clone());
            }
        }
        missing
    }

    /// Finishes the goal, releasing the locks and the scratch space.
    fn done(&mut self, worker: &mut Worker, result: ExitCode, message: Option<String>) {
        if let Some(message) = message {
            tracing::error!(goal = %self.common.name, "{}", message);
            self.common.error = Some(message);
        }
        self.output_locks = None;
        self.scratch_dir = None;
        self.am_done(worker, result);
    }

    fn try_to_build(&mut self, worker: &mut Worker) -> anyhow::Result<()> {
        let out_paths = self.drv().output_paths();

        if self.output_locks.is_none() {
            match worker.store().try_lock_paths(&out_paths)? {
                Some(locks) => self.output_locks = Some(locks),
                None => {
                    // Another goal or process is producing these
                    // outputs; poll until the locks free up.
                    self.trace("waiting for lock on outputs");
                    worker.wait_for_a_while(&self.common.cell());
                    return Ok(());
                }
            }
        }

        // The previous holder may have built the outputs already.
        if self.build_mode == BuildMode::Normal && self.missing_outputs(worker).is_empty() {
            self.done(worker, ExitCode::Success, None);
            return Ok(());
        }

        if worker.nr_local_builds() >= worker.settings().max_build_jobs {
            // Don't sit on the locks while parked.
            self.output_locks = None;
            worker.wait_for_build_slot(&self.common.cell());
            return Ok(());
        }

        self.start_builder(worker)?;
        self.state = State::BuildDone;
        Ok(())
    }

    fn start_builder(&mut self, worker: &mut Worker) -> anyhow::Result<()> {
        let (name, builder, args, env, outputs) = {
            let drv = self.drv();
            (
                drv.name.clone(),
                drv.builder.clone(),
                drv.args.clone(),
                drv.env.clone(),
                drv.outputs.clone(),
            )
        };

        let cell = self.common.cell();
        let scratch = ScratchDir::create(worker.store().store_dir(), &name, cell.id.to_string())
            .context("creating build scratch directory")?;

        let mut command = Command::new(&builder);
        command
            .args(&args)
            .env_clear()
            .envs(&env)
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (output_name, output) in &outputs {
            let dest = self.output_destination(worker, output);
            if self.build_mode != BuildMode::Check {
                // Clear leftovers of interrupted or corrupt builds.
                remove_path(&dest)?;
            }
            command.env(output_name, &dest);
        }

        tracing::info!(
            "building '{}'",
            worker.store().print_store_path(&self.drv_path)
        );
        let child = command
            .spawn()
            .with_context(|| format!("spawning builder '{}'", builder))?;
        let process = ChildProcess::new(child);
        self.open_streams = process.fds().len();
        worker.child_started(&cell, process, true, true);
        self.scratch_dir = Some(scratch);
        Ok(())
    }

    /// Where the builder must write this output: the real store location
    /// or, for check builds, a scratch sibling that is compared and
    /// discarded.
    fn output_destination(&self, worker: &mut Worker, output: &DerivationOutput) -> PathBuf {
        let real = worker.store().to_real_path(&output.path);
        if self.build_mode == BuildMode::Check {
            let mut name = real.into_os_string();
            name.push(".check");
            PathBuf::from(name)
        } else {
            real
        }
    }

    fn build_done(&mut self, worker: &mut Worker) -> anyhow::Result<()> {
        let cell = self.common.cell();
        let mut process = worker
            .child_terminated(&cell, true)
            .expect("a building goal has a registered child");
        let status = process.wait().context("reaping builder")?;
        drop(process);
        tracing::debug!(goal = %self.common.name, "builder finished: {}", status);

        if !status.success() {
            worker.note_permanent_failure();
            let tail = String::from_utf8_lossy(&self.log_tail).into_owned();
            let mut message = format!(
                "builder for '{}' failed with {}",
                worker.store().print_store_path(&self.drv_path),
                status
            );
            if !tail.trim().is_empty() {
                message.push_str(&format!("; last log lines:\n{}", tail.trim_end()));
            }
            self.done(worker, ExitCode::Failed, Some(message));
            return Ok(());
        }

        if self.register_outputs(worker)? {
            self.done(worker, ExitCode::Success, None);
        }
        Ok(())
    }

    /// Verifies and registers the produced outputs. Returns `false` when
    /// the goal was already failed (hash or determinism mismatch).
    fn register_outputs(&mut self, worker: &mut Worker) -> anyhow::Result<bool> {
        let outputs = self.drv().outputs.clone();
        for (output_name, output) in outputs {
            let dest = self.output_destination(worker, &output);
            if !dest.exists() {
                worker.note_permanent_failure();
                self.done(
                    worker,
                    ExitCode::Failed,
                    Some(format!(
                        "builder for '{}' failed to produce output '{}' at '{}'",
                        worker.store().print_store_path(&self.drv_path),
                        output_name,
                        dest.display()
                    )),
                );
                return Ok(false);
            }

            let algo = output.expected_hash.map_or(HashAlgo::Sha256, |h| h.algo);
            let (produced_hash, nar_size) =
                hash::hash_path(algo, &dest).context("hashing build output")?;

            if let Some(expected) = output.expected_hash {
                if !expected.is_null() && produced_hash != expected {
                    worker.note_hash_mismatch();
                    self.done(
                        worker,
                        ExitCode::Failed,
                        Some(format!(
                            "hash mismatch in fixed-output derivation '{}': expected {}, got {}",
                            worker.store().print_store_path(&self.drv_path),
                            expected,
                            produced_hash
                        )),
                    );
                    return Ok(false);
                }
            }

            if self.build_mode == BuildMode::Check {
                let recorded = worker.store().query_path_info(&output.path)?.nar_hash;
                remove_path(&dest)?;
                if produced_hash != recorded {
                    worker.note_check_mismatch();
                    self.done(
                        worker,
                        ExitCode::Failed,
                        Some(format!(
                            "derivation '{}' may not be deterministic: output '{}' differs",
                            worker.store().print_store_path(&self.drv_path),
                            worker.store().print_store_path(&output.path)
                        )),
                    );
                    return Ok(false);
                }
            } else {
                worker.store().register_valid_path(PathInfo {
                    path: output.path.clone(),
                    nar_hash: produced_hash,
                    nar_size,
                    references: BTreeSet::new(),
                });
                worker.mark_contents_good(output.path.clone());
            }
        }
        Ok(true)
    }
}

impl Goal for DerivationGoal {
    fn common(&self) -> &GoalCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut GoalCommon {
        &mut self.common
    }

    fn add_wanted_outputs(&mut self, outputs: &BTreeSet<String>) {
        // Empty already means "all outputs"; there is nothing to add.
        if self.wanted_outputs.is_empty() {
            return;
        }
        if outputs.is_empty() {
            self.wanted_outputs.clear();
        } else {
            self.wanted_outputs.extend(outputs.iter().cloned());
        }
        // A goal past output selection treats this as a hint only; the
        // extra outputs are produced anyway, just not waited upon.
    }

    fn work(&mut self, worker: &mut Worker) -> anyhow::Result<()> {
        loop {
            match self.state {
                State::Init => {
                    if !worker.store().is_valid_path(&self.drv_path) {
                        // The derivation file itself may be
                        // substitutable.
                        let sub = worker.make_substitution_goal(
                            &self.drv_path,
                            RepairFlag::NoRepair,
                            None,
                        );
                        self.add_waitee(sub);
                        self.state = State::LoadDerivation;
                        return Ok(());
                    }
                    self.state = State::LoadDerivation;
                }

                State::LoadDerivation => {
                    if self.common.nr_failed != 0
                        || !worker.store().is_valid_path(&self.drv_path)
                    {
                        self.done(
                            worker,
                            ExitCode::Failed,
                            Some(format!(
                                "cannot build missing derivation '{}'",
                                worker.store().print_store_path(&self.drv_path)
                            )),
                        );
                        return Ok(());
                    }
                    let drv = worker.store().read_derivation(&self.drv_path)?;
                    self.drv = Some(drv);
                    self.state = State::HaveDerivation;
                }

                State::HaveDerivation => {
                    let missing = self.missing_outputs(worker);
                    if self.build_mode == BuildMode::Check {
                        if !missing.is_empty() {
                            self.done(
                                worker,
                                ExitCode::Failed,
                                Some(format!(
                                    "some outputs of '{}' are not valid, so checking is not possible",
                                    worker.store().print_store_path(&self.drv_path)
                                )),
                            );
                            return Ok(());
                        }
                    } else {
                        if missing.is_empty() {
                            self.done(worker, ExitCode::Success, None);
                            return Ok(());
                        }
                        // Try to fetch the missing outputs before
                        // falling back to a local build.
                        if self.build_mode == BuildMode::Normal
                            || self.build_mode == BuildMode::Repair
                        {
                            let repair = if self.build_mode == BuildMode::Repair {
                                RepairFlag::Repair
                            } else {
                                RepairFlag::NoRepair
                            };
                            for output in missing {
                                let sub = worker.make_substitution_goal(
                                    &output.path,
                                    repair,
                                    output.expected_hash,
                                );
                                self.add_waitee(sub);
                            }
                        }
                    }
                    self.state = State::OutputsSubstituted;
                    if !self.common.waitees.is_empty() {
                        return Ok(());
                    }
                }

                State::OutputsSubstituted => {
                    // Failures beyond "no substituter" and "incomplete
                    // closure" are real transfer errors.
                    let hard_failures = self.common.nr_failed
                        - self.common.nr_no_substituters
                        - self.common.nr_incomplete_closure;
                    if hard_failures > 0 && !worker.settings().try_fallback {
                        self.done(
                            worker,
                            ExitCode::Failed,
                            Some(format!(
                                "some substitutes for the outputs of derivation '{}' failed; enable fallback to build from source",
                                worker.store().print_store_path(&self.drv_path)
                            )),
                        );
                        return Ok(());
                    }
                    self.common.reset_waitee_counters();

                    if self.build_mode != BuildMode::Check
                        && self.missing_outputs(worker).is_empty()
                    {
                        self.done(worker, ExitCode::Success, None);
                        return Ok(());
                    }

                    // Build it ourselves: realise every input first.
                    let (input_drvs, input_srcs) = {
                        let drv = self.drv();
                        (drv.input_drvs.clone(), drv.input_srcs.clone())
                    };
                    for (input_drv, wanted) in input_drvs {
                        let goal =
                            worker.make_derivation_goal(&input_drv, &wanted, BuildMode::Normal);
                        self.add_waitee(goal);
                    }
                    for input_src in input_srcs {
                        let goal =
                            worker.make_substitution_goal(&input_src, RepairFlag::NoRepair, None);
                        self.add_waitee(goal);
                    }
                    self.state = State::InputsRealised;
                    if !self.common.waitees.is_empty() {
                        return Ok(());
                    }
                }

                State::InputsRealised => {
                    if self.common.nr_failed != 0 {
                        let nr_failed = self.common.nr_failed;
                        self.done(
                            worker,
                            ExitCode::Failed,
                            Some(format!(
                                "cannot build derivation '{}': {} dependencies couldn't be built",
                                worker.store().print_store_path(&self.drv_path),
                                nr_failed
                            )),
                        );
                        return Ok(());
                    }
                    self.state = State::TryToBuild;
                    let me = self.common.self_ref.clone();
                    worker.wake_up(me);
                    return Ok(());
                }

                State::TryToBuild => return self.try_to_build(worker),

                State::BuildDone => return self.build_done(worker),
            }
        }
    }

    fn handle_child_output(&mut self, _fd: RawFd, data: &[u8]) {
        self.log_tail.extend_from_slice(data);
        if self.log_tail.len() > LOG_TAIL_BYTES {
            let cut = self.log_tail.len() - LOG_TAIL_BYTES;
            self.log_tail.drain(..cut);
        }
    }

    fn handle_eof(&mut self, worker: &mut Worker, _fd: RawFd) {
        self.open_streams = self.open_streams.saturating_sub(1);
        if self.open_streams == 0 {
            // The last pipe closed, so the builder is gone.
            self.trace("got EOF from the builder");
            let me = self.common.self_ref.clone();
            worker.wake_up(me);
        }
    }

    fn timed_out(&mut self, worker: &mut Worker, reason: anyhow::Error) {
        let cell = self.common.cell();
        if let Some(mut process) = worker.child_terminated(&cell, true) {
            process.kill();
            let _ = process.wait();
        }
        worker.note_timed_out();
        self.done(worker, ExitCode::Failed, Some(format!("{:#}", reason)));
    }
}

/// Working directory for one builder invocation, removed when the goal
/// lets go of it.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(parent: &Path, name: &str, tag: String) -> io::Result<ScratchDir> {
        let path = parent.join(format!(".build-{}-{}", name, tag));
        fs::create_dir_all(&path)?;
        Ok(ScratchDir { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
        Ok(meta) => {
            if meta.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            }
        }
    }
}
