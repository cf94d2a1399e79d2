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
    collections::{BTreeSet, HashMap},
    io,
    os::fd::{AsFd, RawFd},
    rc::Rc,
    time::{Duration, Instant},
};

use thiserror::Error;

use quarry_store::{BuildMode, Hash, RepairFlag, Store, StorePath, Substituter};

use crate::{
    child::{Child, ChildProcess},
    derivation::DerivationGoal,
    goal::{new_goal, ExitCode, Goal, GoalCommon, GoalId, GoalKind, GoalPtr, WeakGoal, WeakGoals},
    interrupt::{Interrupted, InterruptFlag},
    io::{read_stream, wait_for_readable, PollOutcome, ReadOutcome},
    settings::Settings,
    status::Printer,
    substitution::SubstitutionGoal,
};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    #[error("unable to start any build; either increase the number of build jobs or enable remote builds")]
    Starved,
    #[error("unable to start any build; remote machines may not have all required system features")]
    StarvedWithMachines,
    #[error("{goal}: read from child failed")]
    ChildRead {
        goal: String,
        #[source]
        source: io::Error,
    },
    #[error("waiting for input")]
    Poll(#[source] io::Error),
}

/// The build worker: drives a set of top-level goals to completion,
/// overlapping child-process I/O with progress on other goals.
///
/// Scheduling is single-threaded and cooperative. Goals advance in
/// discrete `work` steps; the only blocking call is the wait phase,
/// which multiplexes child streams and deadlines.
pub struct Worker {
    store: Rc<dyn Store>,
    substituters: Vec<Rc<dyn Substituter>>,
    settings: Settings,
    interrupt: InterruptFlag,

    /// The goals the caller asked for. The run loop ends when this set
    /// empties; clearing it is how fail-fast tears everything down.
    top_goals: Vec<GoalPtr>,
    /// Goals to step in the next cycle.
    awake: WeakGoals,
    /// Goals waiting for a build slot.
    wanting_to_build: WeakGoals,
    /// Goals waiting until any goal finishes.
    waiting_for_any_goal: WeakGoals,
    /// Goals re-checked every `poll_interval` seconds (lock polling).
    waiting_for_a_while: WeakGoals,
    last_woken_up: Option<Instant>,

    derivation_goals: HashMap<StorePath, WeakGoal>,
    substitution_goals: HashMap<StorePath, WeakGoal>,
    next_goal_id: u64,

    children: Vec<Child>,
    nr_local_builds: u32,
    peak_local_builds: u32,

    path_contents_good: HashMap<StorePath, bool>,

    permanent_failure: bool,
    timed_out: bool,
    hash_mismatch: bool,
    check_mismatch: bool,

    status: Printer,
}

impl Worker {
    pub fn new(store: Rc<dyn Store>, settings: Settings) -> Worker {
        Worker {
            store,
            substituters: Vec::new(),
            settings,
            interrupt: InterruptFlag::new(),
            top_goals: Vec::new(),
            awake: WeakGoals::default(),
            wanting_to_build: WeakGoals::default(),
            waiting_for_any_goal: WeakGoals::default(),
            waiting_for_a_while: WeakGoals::default(),
            last_woken_up: None,
            derivation_goals: HashMap::new(),
            substitution_goals: HashMap::new(),
            next_goal_id: 0,
            children: Vec::new(),
            nr_local_builds: 0,
            peak_local_builds: 0,
            path_contents_good: HashMap::new(),
            permanent_failure: false,
            timed_out: false,
            hash_mismatch: false,
            check_mismatch: false,
            status: Printer::default(),
        }
    }

    pub fn add_substituter(&mut self, substituter: Rc<dyn Substituter>) {
        self.substituters.push(substituter);
    }

    pub fn store(&self) -> &dyn Store {
        &*self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn substituters(&self) -> &[Rc<dyn Substituter>] {
        &self.substituters
    }

    /// The cancellation token this worker consults. Clone it to wire up
    /// a signal handler.
    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    pub fn nr_local_builds(&self) -> u32 {
        self.nr_local_builds
    }

    /// High-water mark of concurrently held build slots.
    pub fn peak_local_builds(&self) -> u32 {
        self.peak_local_builds
    }

    fn next_id(&mut self) -> GoalId {
        self.next_goal_id += 1;
        GoalId(self.next_goal_id)
    }

    /// Registers a goal of an embedder-defined flavor and wakes it.
    pub fn make_goal<G>(
        &mut self,
        kind: GoalKind,
        key: StorePath,
        name: String,
        build: impl FnOnce(GoalCommon) -> G,
    ) -> GoalPtr
    where
        G: Goal + 'static,
    {
        let id = self.next_id();
        let goal = new_goal(id, kind, key, name.clone(), move |me| {
            build(GoalCommon::new(me, name))
        });
        self.wake_up(Rc::downgrade(&goal));
        goal
    }

    /// Idempotent factory for derivation goals. A live goal for
    /// `drv_path` is reused and its wanted-output set extended.
    pub fn make_derivation_goal(
        &mut self,
        drv_path: &StorePath,
        wanted_outputs: &BTreeSet<String>,
        build_mode: BuildMode,
    ) -> GoalPtr {
        self.make_derivation_goal_common(drv_path, wanted_outputs, build_mode, None)
    }

    /// Like `make_derivation_goal`, but for a derivation supplied as an
    /// in-memory value rather than read from the store.
    pub fn make_basic_derivation_goal(
        &mut self,
        drv_path: &StorePath,
        drv: quarry_store::Derivation,
        wanted_outputs: &BTreeSet<String>,
        build_mode: BuildMode,
    ) -> GoalPtr {
        self.make_derivation_goal_common(drv_path, wanted_outputs, build_mode, Some(drv))
    }

    fn make_derivation_goal_common(
        &mut self,
        drv_path: &StorePath,
        wanted_outputs: &BTreeSet<String>,
        build_mode: BuildMode,
        drv: Option<quarry_store::Derivation>,
    ) -> GoalPtr {
        if let Some(existing) = lookup(&self.derivation_goals, drv_path) {
            existing.borrow_mut().add_wanted_outputs(wanted_outputs);
            return existing;
        }
        let id = self.next_id();
        let name = format!("building of '{}'", self.store.print_store_path(drv_path));
        let goal = new_goal(
            id,
            GoalKind::Derivation,
            drv_path.clone(),
            name.clone(),
            move |me| {
                DerivationGoal::new(
                    GoalCommon::new(me, name),
                    drv_path.clone(),
                    wanted_outputs.clone(),
                    build_mode,
                    drv,
                )
            },
        );
        self.derivation_goals
            .insert(drv_path.clone(), Rc::downgrade(&goal));
        self.wake_up(Rc::downgrade(&goal));
        goal
    }

    /// Idempotent factory for substitution goals, keyed on `path`.
    pub fn make_substitution_goal(
        &mut self,
        path: &StorePath,
        repair: RepairFlag,
        ca: Option<Hash>,
    ) -> GoalPtr {
        if let Some(existing) = lookup(&self.substitution_goals, path) {
            return existing;
        }
        let id = self.next_id();
        let name = format!("substitution of '{}'", self.store.print_store_path(path));
        let goal = new_goal(
            id,
            GoalKind::Substitution,
            path.clone(),
            name.clone(),
            move |me| {
                SubstitutionGoal::new(GoalCommon::new(me, name), path.clone(), repair, ca)
            },
        );
        self.substitution_goals
            .insert(path.clone(), Rc::downgrade(&goal));
        self.wake_up(Rc::downgrade(&goal));
        goal
    }

    /// Removes a finished goal from its registry and from the top set.
    /// A failed top goal without keep-going clears all top goals, which
    /// tears down everything only they kept alive. Always wakes the
    /// goals waiting for "any goal" to finish.
    pub fn remove_goal(&mut self, goal: &GoalPtr, result: ExitCode) {
        let registry = match goal.kind {
            GoalKind::Derivation => Some(&mut self.derivation_goals),
            GoalKind::Substitution => Some(&mut self.substitution_goals),
            GoalKind::Other => None,
        };
        if let Some(registry) = registry {
            let matches = registry
                .get(&goal.key)
                .and_then(|w| w.upgrade())
                .map_or(false, |g| g.id == goal.id);
            if matches {
                registry.remove(&goal.key);
            }
        }

        if let Some(pos) = self.top_goals.iter().position(|g| g.id == goal.id) {
            self.top_goals.remove(pos);
            if result == ExitCode::Failed && !self.settings.keep_going {
                self.top_goals.clear();
            }
        }

        for sleeper in self.waiting_for_any_goal.take_raw() {
            self.wake_up(sleeper);
        }
    }

    /// Schedules a goal for the next step cycle.
    pub fn wake_up(&mut self, goal: WeakGoal) {
        if let Some(g) = goal.upgrade() {
            tracing::debug!(goal = %g.name, "woken up");
            self.awake.insert(goal);
        }
    }

    /// Registers a spawned child for `goal`. The registry owns the
    /// process handle until `child_terminated` hands it back.
    pub fn child_started(
        &mut self,
        goal: &GoalPtr,
        process: ChildProcess,
        in_build_slot: bool,
        respect_timeouts: bool,
    ) {
        let now = Instant::now();
        let fds = process.fds();
        self.status.started(&goal.name);
        self.children.push(Child {
            goal_id: goal.id,
            goal: Rc::downgrade(goal),
            process,
            fds,
            time_started: now,
            last_output: now,
            in_build_slot,
            respect_timeouts,
        });
        if in_build_slot {
            self.nr_local_builds += 1;
            self.peak_local_builds = self.peak_local_builds.max(self.nr_local_builds);
        }
        debug_assert!(!(in_build_slot && self.settings.max_build_jobs == 0));
        debug_assert!(
            self.settings.max_build_jobs == 0 || self.nr_local_builds <= self.settings.max_build_jobs
        );
        self.assert_slot_invariant();
    }

    /// Unregisters `goal`'s child, releasing its build slot, and returns
    /// the process handle so the goal can reap it. `wake_sleepers` moves
    /// every goal waiting for a slot back to the awake set; they race
    /// for the freed slot and the losers re-park.
    pub fn child_terminated(&mut self, goal: &GoalPtr, wake_sleepers: bool) -> Option<ChildProcess> {
        let pos = self.children.iter().position(|c| c.goal_id == goal.id)?;
        let child = self.children.remove(pos);
        if child.in_build_slot {
            assert!(self.nr_local_builds > 0);
            self.nr_local_builds -= 1;
        }
        self.status.finished(&goal.name);

        if wake_sleepers {
            for sleeper in self.wanting_to_build.take_raw() {
                self.wake_up(sleeper);
            }
        }
        self.assert_slot_invariant();
        Some(child.process)
    }

    fn assert_slot_invariant(&self) {
        debug_assert_eq!(
            self.nr_local_builds as usize,
            self.children.iter().filter(|c| c.in_build_slot).count()
        );
    }

    /// Wakes the goal immediately when a build slot is free, otherwise
    /// parks it until one is released.
    pub fn wait_for_build_slot(&mut self, goal: &GoalPtr) {
        tracing::debug!("wait for build slot");
        if self.nr_local_builds < self.settings.max_build_jobs {
            self.wake_up(Rc::downgrade(goal));
        } else {
            self.wanting_to_build.insert(Rc::downgrade(goal));
        }
    }

    /// Parks the goal until any goal finishes.
    pub fn wait_for_any_goal(&mut self, goal: &GoalPtr) {
        tracing::debug!("wait for any goal");
        self.waiting_for_any_goal.insert(Rc::downgrade(goal));
    }

    /// Parks the goal until the next periodic re-check.
    pub fn wait_for_a_while(&mut self, goal: &GoalPtr) {
        tracing::debug!("wait for a while");
        self.waiting_for_a_while.insert(Rc::downgrade(goal));
    }

    /// Drives the given top-level goals until all of them finished, a
    /// fatal failure tore the rest down, or the interrupt token fired.
    /// Afterwards the caller reads the failure flags and
    /// [`Worker::exit_status`].
    pub fn run(&mut self, top_goals: impl IntoIterator<Item = GoalPtr>) -> Result<(), WorkerError> {
        for goal in top_goals {
            if !self.top_goals.iter().any(|g| g.id == goal.id) {
                self.top_goals.push(goal);
            }
        }

        let result = self.run_loop();
        if result.is_ok() && self.settings.keep_going {
            // With keep-going every goal ran to a terminal state, so
            // nothing may be left behind.
            assert!(self.awake.is_empty());
            assert!(self.wanting_to_build.is_empty());
            assert!(self.children.is_empty());
        }
        self.teardown();
        result
    }

    fn run_loop(&mut self) -> Result<(), WorkerError> {
        tracing::debug!("entered goal loop");
        loop {
            self.interrupt.check()?;

            self.store.auto_gc(false);

            // Step phase: drain the awake set, in stable order. Goals
            // woken during a round land in the next snapshot.
            while !self.awake.is_empty() && !self.top_goals.is_empty() {
                let mut round = self.awake.drain_live();
                round.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
                for goal in round {
                    self.interrupt.check()?;
                    self.step(&goal);
                    if self.top_goals.is_empty() {
                        break; // stuff may have been cancelled
                    }
                }
            }

            if self.top_goals.is_empty() {
                break;
            }

            // Wait phase.
            if !self.children.is_empty() || !self.waiting_for_a_while.is_empty() {
                self.wait_for_input()?;
            } else {
                if self.awake.is_empty() && self.settings.max_build_jobs == 0 {
                    return Err(if self.settings.remote_machines.is_empty() {
                        WorkerError::Starved
                    } else {
                        WorkerError::StarvedWithMachines
                    });
                }
                assert!(!self.awake.is_empty(), "scheduler stalled with no runnable goals");
            }
        }
        Ok(())
    }

    /// Steps one goal. An `Err` from `work` is that goal's failure, not
    /// the loop's: it is recorded on the goal and propagated through the
    /// waiter graph.
    fn step(&mut self, goal: &GoalPtr) {
        debug_assert!(goal.borrow().exit_code() == ExitCode::Busy);
        let result = goal.borrow_mut().work(self);
        if let Err(err) = result {
            tracing::error!(goal = %goal.name, "goal failed: {:#}", err);
            let mut inner = goal.borrow_mut();
            inner.common_mut().error = Some(format!("{:#}", err));
            if inner.exit_code() == ExitCode::Busy {
                inner.am_done(self, ExitCode::Failed);
            }
        }
    }

    /// Kills whatever fail-fast or interruption left running and clears
    /// the queues. A clean keep-going run reaches this with everything
    /// already empty.
    fn teardown(&mut self) {
        while let Some(mut child) = self.children.pop() {
            if child.in_build_slot {
                self.nr_local_builds -= 1;
            }
            child.process.kill();
        }
        debug_assert_eq!(self.nr_local_builds, 0);
        self.top_goals.clear();
        self.awake.clear();
        self.wanting_to_build.clear();
        self.waiting_for_any_goal.clear();
        self.waiting_for_a_while.clear();
        self.last_woken_up = None;
    }

    /// The earliest deadline the wait phase must wake for: the GC nudge
    /// when the store keeps a free-space floor, the silence and
    /// wall-clock budgets of each child, and the periodic poll queue
    /// (whose bookkeeping this updates). `None` means the wait may block
    /// indefinitely.
    fn next_deadline(&mut self, before: Instant) -> Option<Instant> {
        let mut nearest: Option<Instant> = None;

        // Periodically wake up to see whether the store wants to GC.
        if self.store.min_free() != 0 {
            nearest = min_deadline(nearest, before + Duration::from_secs(10));
        }
        for child in &self.children {
            if !child.respect_timeouts {
                continue;
            }
            if self.settings.max_silent_time != 0 {
                nearest = min_deadline(
                    nearest,
                    child.last_output + Duration::from_secs(self.settings.max_silent_time),
                );
            }
            if self.settings.build_timeout != 0 {
                nearest = min_deadline(
                    nearest,
                    child.time_started + Duration::from_secs(self.settings.build_timeout),
                );
            }
        }
        if !self.waiting_for_a_while.is_empty() {
            let last = match self.last_woken_up {
                Some(t) if t <= before => t,
                _ => before,
            };
            self.last_woken_up = Some(last);
            nearest = min_deadline(
                nearest,
                last + Duration::from_secs(self.settings.poll_interval),
            );
        } else {
            self.last_woken_up = None;
        }
        nearest
    }

    /// Blocks until a child stream has data or closed, or the earliest
    /// deadline fires; then dispatches bytes, EOFs, and timeouts to the
    /// owning goals.
    fn wait_for_input(&mut self) -> Result<(), WorkerError> {
        tracing::trace!("waiting for children");

        let before = Instant::now();
        let nearest = self.next_deadline(before);

        // Whole-second granularity, and never a busy-loop.
        let timeout = nearest.map(|deadline| {
            deadline
                .saturating_duration_since(before)
                .max(Duration::from_secs(1))
        });
        if let Some(t) = timeout {
            tracing::trace!("sleeping at most {} seconds", t.as_secs());
        }

        let ready: Vec<RawFd> = {
            let mut sources = Vec::new();
            for child in &self.children {
                for fd in &child.fds {
                    if let Some(stream) = child.process.stream(*fd) {
                        sources.push((*fd, stream.file.as_fd()));
                    }
                }
            }
            match wait_for_readable(&sources, timeout).map_err(WorkerError::Poll)? {
                PollOutcome::Interrupted => return Ok(()),
                PollOutcome::Ready(fds) => fds,
            }
        };

        let after = Instant::now();

        let snapshot: Vec<(GoalId, WeakGoal)> = self
            .children
            .iter()
            .map(|c| (c.goal_id, c.goal.clone()))
            .collect();

        for (goal_id, weak) in snapshot {
            self.interrupt.check()?;

            let goal = match weak.upgrade() {
                Some(goal) => goal,
                None => {
                    // The owning goal was torn down; the child must not
                    // outlive it.
                    self.drop_orphaned_child(goal_id);
                    continue;
                }
            };

            let fds = match self.child(goal_id) {
                Some(child) => child.fds.clone(),
                None => continue,
            };
            let mut buf = [0u8; 4096];
            for fd in fds {
                if !ready.contains(&fd) {
                    continue;
                }
                let outcome = {
                    let child = match self.child(goal_id) {
                        Some(child) => child,
                        None => break,
                    };
                    let stream = match child.process.stream(fd) {
                        Some(stream) => stream,
                        None => continue,
                    };
                    read_stream(&stream.file, &mut buf)
                };
                match outcome {
                    Ok(ReadOutcome::Eof) => {
                        tracing::debug!(goal = %goal.name, "got EOF");
                        goal.borrow_mut().handle_eof(self, fd);
                        if let Some(child) = self.child_mut(goal_id) {
                            child.fds.retain(|f| *f != fd);
                        }
                    }
                    Ok(ReadOutcome::Interrupted) => {}
                    Ok(ReadOutcome::Data(len)) => {
                        tracing::trace!(goal = %goal.name, "read {} bytes", len);
                        if let Some(child) = self.child_mut(goal_id) {
                            child.last_output = after;
                        }
                        goal.borrow_mut().handle_child_output(fd, &buf[..len]);
                    }
                    Err(source) => {
                        return Err(WorkerError::ChildRead {
                            goal: goal.name.clone(),
                            source,
                        })
                    }
                }
            }

            // Timeouts, delivered at most once: a timed-out goal leaves
            // `Busy` and its child record is gone.
            if let Some(child) = self.child(goal_id) {
                let respect = child.respect_timeouts;
                let last_output = child.last_output;
                let time_started = child.time_started;
                let busy = goal.borrow().exit_code() == ExitCode::Busy;
                let max_silent = self.settings.max_silent_time;
                let build_timeout = self.settings.build_timeout;
                if busy
                    && respect
                    && max_silent != 0
                    && after.duration_since(last_output) >= Duration::from_secs(max_silent)
                {
                    let reason = anyhow::anyhow!(
                        "{} timed out after {} seconds of silence",
                        goal.name,
                        max_silent
                    );
                    goal.borrow_mut().timed_out(self, reason);
                } else if busy
                    && respect
                    && build_timeout != 0
                    && after.duration_since(time_started) >= Duration::from_secs(build_timeout)
                {
                    let reason =
                        anyhow::anyhow!("{} timed out after {} seconds", goal.name, build_timeout);
                    goal.borrow_mut().timed_out(self, reason);
                }
            }
        }

        if !self.waiting_for_a_while.is_empty() {
            let due = self
                .last_woken_up
                .map_or(false, |t| t + Duration::from_secs(self.settings.poll_interval) <= after);
            if due {
                self.last_woken_up = Some(after);
                for sleeper in self.waiting_for_a_while.take_raw() {
                    self.wake_up(sleeper);
                }
            }
        }

        Ok(())
    }

    fn child(&self, goal_id: GoalId) -> Option<&Child> {
        self.children.iter().find(|c| c.goal_id == goal_id)
    }

    fn child_mut(&mut self, goal_id: GoalId) -> Option<&mut Child> {
        self.children.iter_mut().find(|c| c.goal_id == goal_id)
    }

    fn drop_orphaned_child(&mut self, goal_id: GoalId) {
        if let Some(pos) = self.children.iter().position(|c| c.goal_id == goal_id) {
            let mut child = self.children.remove(pos);
            if child.in_build_slot {
                self.nr_local_builds -= 1;
            }
            child.process.kill();
        }
    }

    /// Whether the on-disk contents of `path` still match its recorded
    /// hash. Memoized for the run; an all-zero recorded hash matches
    /// anything.
    pub fn path_contents_good(&mut self, path: &StorePath) -> bool {
        if let Some(cached) = self.path_contents_good.get(path) {
            return *cached;
        }
        tracing::info!("checking path '{}'...", self.store.print_store_path(path));
        let good = match self.store.query_path_info(path) {
            Err(_) => false,
            Ok(info) => {
                if !self.store.path_exists(path) {
                    false
                } else {
                    match self.store.hash_path(info.nar_hash.algo, path) {
                        Err(_) => false,
                        Ok((current, _)) => info.nar_hash.is_null() || info.nar_hash == current,
                    }
                }
            }
        };
        self.path_contents_good.insert(path.clone(), good);
        if !good {
            tracing::error!(
                "path '{}' is corrupted or missing!",
                self.store.print_store_path(path)
            );
        }
        good
    }

    pub fn mark_contents_good(&mut self, path: StorePath) {
        self.path_contents_good.insert(path, true);
    }

    pub fn note_permanent_failure(&mut self) {
        self.permanent_failure = true;
    }

    pub fn note_timed_out(&mut self) {
        self.timed_out = true;
    }

    pub fn note_hash_mismatch(&mut self) {
        self.hash_mismatch = true;
    }

    pub fn note_check_mismatch(&mut self) {
        self.check_mismatch = true;
    }

    pub fn permanent_failure(&self) -> bool {
        self.permanent_failure
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn hash_mismatch(&self) -> bool {
        self.hash_mismatch
    }

    pub fn check_mismatch(&self) -> bool {
        self.check_mismatch
    }

    /// Collapses the failure flags into a process exit code.
    pub fn exit_status(&self) -> u32 {
        // 0x60 marks a worker-originated failure; the low bits classify
        // it: 0x01 timeout, 0x02 output hash mismatch, 0x04 build
        // failure, 0x08 nondeterminism.
        let mut mask = 0;
        if self.permanent_failure || self.timed_out || self.hash_mismatch {
            mask |= 0x04;
        }
        if self.timed_out {
            mask |= 0x01;
        }
        if self.hash_mismatch {
            mask |= 0x02;
        }
        if self.check_mismatch {
            mask |= 0x08;
        }
        if mask != 0 {
            mask |= 0x60;
        }
        if mask != 0 {
            mask
        } else {
            1
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Strong edges between goals unwind before the worker itself
        // disappears.
        self.teardown();
    }
}

fn lookup(registry: &HashMap<StorePath, WeakGoal>, key: &StorePath) -> Option<GoalPtr> {
    registry.get(key).and_then(|w| w.upgrade())
}

fn min_deadline(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    match current {
        None => Some(candidate),
        Some(existing) => Some(existing.min(candidate)),
    }
}
