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
    cell::{Ref, RefCell, RefMut},
    fmt,
    os::fd::RawFd,
    rc::{Rc, Weak},
};

use quarry_store::StorePath;

use crate::worker::Worker;

/// Identity of a goal for the lifetime of one worker. Ordering ties are
/// broken by id so step order is stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GoalId(pub(crate) u64);

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Which registry a goal's key lives in. Stored next to the goal so
/// removal never needs a runtime type check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalKind {
    Derivation,
    Substitution,
    /// Goals outside the two keyed registries (embedders, tests).
    Other,
}

/// Terminal state of a goal. `Busy` is the only non-terminal value and a
/// goal never leaves a terminal value once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Busy,
    Success,
    Failed,
    /// No substituter could provide the path; the caller may build
    /// instead.
    NoSubstituters,
    /// The path itself was substitutable but part of its closure was
    /// not.
    IncompleteClosure,
}

impl ExitCode {
    /// Whether this terminal state counts as a failure for waitee
    /// bookkeeping.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ExitCode::Failed | ExitCode::NoSubstituters | ExitCode::IncompleteClosure
        )
    }
}

/// A goal's immutable identity lives outside the `RefCell`, so the
/// scheduler can order, deduplicate, and tear goals down without
/// touching a possibly-borrowed interior.
pub struct GoalCell<G: ?Sized> {
    pub id: GoalId,
    pub kind: GoalKind,
    /// Registry key: the derivation path or the substituted path.
    pub key: StorePath,
    pub name: String,
    goal: RefCell<G>,
}

pub type GoalPtr = Rc<GoalCell<dyn Goal>>;
pub type WeakGoal = Weak<GoalCell<dyn Goal>>;

impl<G: ?Sized> GoalCell<G> {
    pub fn borrow(&self) -> Ref<'_, G> {
        self.goal.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, G> {
        self.goal.borrow_mut()
    }
}

impl fmt::Debug for GoalCell<dyn Goal> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoalCell")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}

/// Constructs a goal whose interior knows its own cell through a weak
/// self reference.
pub(crate) fn new_goal<G>(
    id: GoalId,
    kind: GoalKind,
    key: StorePath,
    name: String,
    build: impl FnOnce(WeakGoal) -> G,
) -> GoalPtr
where
    G: Goal + 'static,
{
    let cell: Rc<GoalCell<G>> = Rc::new_cyclic(|me: &Weak<GoalCell<G>>| {
        let me: WeakGoal = me.clone();
        GoalCell {
            id,
            kind,
            key,
            name,
            goal: RefCell::new(build(me)),
        }
    });
    cell
}

/// The bookkeeping every goal flavor shares: the waiter/waitee edges,
/// failure counters for finished waitees, and the terminal state.
pub struct GoalCommon {
    pub(crate) self_ref: WeakGoal,
    pub(crate) name: String,
    pub(crate) waiters: Vec<WeakGoal>,
    pub(crate) waitees: Vec<GoalPtr>,
    pub(crate) exit_code: ExitCode,
    pub(crate) nr_failed: u32,
    pub(crate) nr_no_substituters: u32,
    pub(crate) nr_incomplete_closure: u32,
    pub(crate) error: Option<String>,
}

impl GoalCommon {
    pub fn new(self_ref: WeakGoal, name: impl Into<String>) -> GoalCommon {
        GoalCommon {
            self_ref,
            name: name.into(),
            waiters: Vec::new(),
            waitees: Vec::new(),
            exit_code: ExitCode::Busy,
            nr_failed: 0,
            nr_no_substituters: 0,
            nr_incomplete_closure: 0,
            error: None,
        }
    }

    /// The goal's own cell. The cell strictly outlives its interior, so
    /// the upgrade cannot fail while the goal is running.
    pub fn cell(&self) -> GoalPtr {
        self.self_ref.upgrade().expect("goal cell outlives its interior")
    }

    pub(crate) fn reset_waitee_counters(&mut self) {
        self.nr_failed = 0;
        self.nr_no_substituters = 0;
        self.nr_incomplete_closure = 0;
    }
}

/// The capability set the scheduler drives goals through. Concrete goal
/// flavors implement the required methods; the waiter-graph bookkeeping
/// is provided on top of [`GoalCommon`].
pub trait Goal {
    fn common(&self) -> &GoalCommon;

    fn common_mut(&mut self) -> &mut GoalCommon;

    /// One non-blocking step. On return the goal is either finished or
    /// parked: on a wait queue, or behind a child it registered.
    fn work(&mut self, worker: &mut Worker) -> anyhow::Result<()>;

    /// Bytes read from one of this goal's child streams, delivered
    /// verbatim.
    fn handle_child_output(&mut self, fd: RawFd, data: &[u8]);

    /// One of this goal's child streams closed.
    fn handle_eof(&mut self, worker: &mut Worker, fd: RawFd);

    /// The child exceeded its silence or wall-clock budget. Delivered at
    /// most once per child.
    fn timed_out(&mut self, worker: &mut Worker, reason: anyhow::Error);

    /// Extends the wanted-output set of a derivation goal. A hint: a
    /// goal that already selected its outputs may not honor it mid-run.
    fn add_wanted_outputs(&mut self, _outputs: &std::collections::BTreeSet<String>) {}

    fn name(&self) -> &str {
        &self.common().name
    }

    fn exit_code(&self) -> ExitCode {
        self.common().exit_code
    }

    fn error_message(&self) -> Option<&str> {
        self.common().error.as_deref()
    }

    fn trace(&self, msg: &str) {
        tracing::debug!(goal = %self.common().name, "{}", msg);
    }

    /// Registers `waitee` as a prerequisite: this goal owns the waitee
    /// and the waitee holds a non-owning back edge.
    fn add_waitee(&mut self, waitee: GoalPtr) {
        waitee
            .borrow_mut()
            .common_mut()
            .waiters
            .push(self.common().self_ref.clone());
        self.common_mut().waitees.push(waitee);
    }

    /// Called exactly once per registered waitee when it reaches a
    /// terminal state. Wakes this goal when the last waitee finished, or
    /// immediately on a fatal failure without keep-going.
    fn waitee_done(&mut self, worker: &mut Worker, waitee: &GoalPtr, result: ExitCode) {
        {
            let common = self.common_mut();
            let pos = common.waitees.iter().position(|g| g.id == waitee.id);
            debug_assert!(pos.is_some(), "waitee_done for an unregistered waitee");
            if let Some(pos) = pos {
                common.waitees.remove(pos);
            }
            if result.is_failure() {
                common.nr_failed += 1;
            }
            if result == ExitCode::NoSubstituters {
                common.nr_no_substituters += 1;
            }
            if result == ExitCode::IncompleteClosure {
                common.nr_incomplete_closure += 1;
            }
        }
        self.trace(&format!(
            "waitee '{}' done; {} left",
            waitee.name,
            self.common().waitees.len()
        ));

        let abandon = result == ExitCode::Failed && !worker.settings().keep_going;
        if self.common().waitees.is_empty() || abandon {
            // Unregister from the waitees we will no longer wait for.
            let me = self.common().self_ref.clone();
            let remaining = std::mem::take(&mut self.common_mut().waitees);
            for other in remaining {
                other
                    .borrow_mut()
                    .common_mut()
                    .waiters
                    .retain(|w| !w.ptr_eq(&me));
            }
            worker.wake_up(me);
        }
    }

    /// Finishes the goal: records the terminal state, notifies every
    /// waiter exactly once, and removes the goal from the worker.
    fn am_done(&mut self, worker: &mut Worker, result: ExitCode) {
        self.trace("done");
        assert!(
            self.common().exit_code == ExitCode::Busy,
            "goal finished twice"
        );
        assert!(result != ExitCode::Busy);
        self.common_mut().exit_code = result;

        let cell = self.common().cell();
        let waiters = std::mem::take(&mut self.common_mut().waiters);
        for waiter in waiters {
            if let Some(waiter) = waiter.upgrade() {
                waiter.borrow_mut().waitee_done(worker, &cell, result);
            }
        }
        worker.remove_goal(&cell, result);
    }
}

/// A set of non-owning goal references. Lapsed entries are skipped when
/// the set is drained; insertion deduplicates by goal identity.
#[derive(Debug, Default)]
pub struct WeakGoals {
    goals: Vec<WeakGoal>,
}

impl WeakGoals {
    pub fn insert(&mut self, goal: WeakGoal) {
        let id = match goal.upgrade() {
            Some(g) => g.id,
            None => return,
        };
        self.goals.retain(|w| w.upgrade().is_some());
        if self.goals.iter().any(|w| w.upgrade().map(|g| g.id) == Some(id)) {
            return;
        }
        self.goals.push(goal);
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }

    /// Empties the set, yielding the goals that are still live.
    pub fn drain_live(&mut self) -> Vec<GoalPtr> {
        self.goals.drain(..).filter_map(|w| w.upgrade()).collect()
    }

    /// Empties the set without upgrading.
    pub(crate) fn take_raw(&mut self) -> Vec<WeakGoal> {
        std::mem::take(&mut self.goals)
    }

    pub fn clear(&mut self) {
        self.goals.clear();
    }
}
