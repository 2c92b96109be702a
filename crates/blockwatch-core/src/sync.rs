//! Operation synchronizers.
//!
//! A synchronizer is the rendezvous between the controller thread that
//! performs a storage operation and the dispatcher thread that delivers the
//! uevent confirming it. Every guarded entity (a device, a format) owns one.
//!
//! The handshake runs under one shared lock (a [`SharedLock`]) passed in by
//! the caller as a guard; the synchronizer's condition variable releases and
//! reacquires that lock across suspension.
//!
//! Controller side:
//!
//! 1. `set_phase(Phase::Creating, true)` (stamps the validator floor)
//! 2. optionally `update_requirements(..)`
//! 3. perform the operation, then `ready_wait(guard, timeout)`
//! 4. local accounting
//! 5. `notify(guard)` then `wait(guard, ..)`
//! 6. `reset(guard)`
//!
//! Dispatcher side:
//!
//! 1. `wait_for_ready(guard, ..)`
//! 2. validate / mark matched, update identifiers
//! 3. `notify(guard)`, `wait(guard, ..)`, then `release(guard)`
//!
//! The ready latch establishes the rendezvous point before any wait/notify
//! pair is used, so the notifier can never signal before the waiter listens.
//! Notifications are counted, which makes waits immune to spurious wakeups.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::config::SyncConfig;
use crate::error::{EventError, EventResult};
use crate::event::Event;
use crate::flags::{OperationFlags, Phase};
use crate::validator::{EventValidator, RequiredValue};

const EVENT_LOG: &str = "blockwatch::event";

static NEXT_SYNC_ID: AtomicU64 = AtomicU64::new(0);

/// The process-wide lock guarding the model and every synchronizer handshake.
pub type SharedLock<T> = Arc<Mutex<T>>;

/// Shared handle to a synchronizer owned by an entity.
pub type SyncHandle = Arc<OperationSynchronizer>;

/// Whether kernel-event monitoring is on. When off, synchronization is a no-op.
#[derive(Debug, Clone, Default)]
pub struct MonitorSwitch(Arc<AtomicBool>);

impl MonitorSwitch {
    /// Create a switch in the given state.
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    /// Returns true while monitoring is enabled.
    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Turn monitoring on or off.
    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

/// Result of a blocking synchronizer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The other side signalled.
    Notified,
    /// The timeout elapsed without a signal.
    TimedOut,
    /// The synchronizer was reset while waiting.
    Cancelled,
    /// Synchronization is disabled (passthrough or monitoring off).
    Skipped,
}

impl WaitOutcome {
    /// Returns true if the wait ended without the other side responding.
    pub fn is_failure(&self) -> bool {
        matches!(self, WaitOutcome::TimedOut | WaitOutcome::Cancelled)
    }

    fn combine(outcomes: impl IntoIterator<Item = WaitOutcome>) -> WaitOutcome {
        let mut combined = WaitOutcome::Skipped;
        for outcome in outcomes {
            combined = match (combined, outcome) {
                (WaitOutcome::TimedOut, _) | (_, WaitOutcome::TimedOut) => WaitOutcome::TimedOut,
                (WaitOutcome::Cancelled, _) | (_, WaitOutcome::Cancelled) => WaitOutcome::Cancelled,
                (WaitOutcome::Skipped, WaitOutcome::Skipped) => WaitOutcome::Skipped,
                _ => WaitOutcome::Notified,
            };
        }
        combined
    }
}

/// Everything a new synchronizer needs: the monitoring switch and timing.
#[derive(Debug, Clone)]
pub struct SyncContext {
    monitor: MonitorSwitch,
    ready_poll: Duration,
    default_timeout: Option<Duration>,
}

impl SyncContext {
    /// Build a context from a monitoring switch and config.
    pub fn new(monitor: MonitorSwitch, config: &SyncConfig) -> Self {
        Self {
            monitor,
            ready_poll: config.ready_poll(),
            default_timeout: config.default_timeout(),
        }
    }

    /// The monitoring switch shared with the event manager.
    pub fn monitor(&self) -> &MonitorSwitch {
        &self.monitor
    }

    /// Controller-side timeout used when the caller passes none.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// A new single synchronizer.
    pub fn single(&self) -> SyncHandle {
        Arc::new(OperationSynchronizer::Single(SingleSync::new(
            self.clone(),
            false,
        )))
    }

    /// A new synchronizer that never blocks.
    pub fn passthrough(&self) -> SyncHandle {
        Arc::new(OperationSynchronizer::Single(SingleSync::new(
            self.clone(),
            true,
        )))
    }

    /// An aggregate over existing member synchronizers.
    pub fn group(&self, members: Vec<SyncHandle>) -> SyncHandle {
        Arc::new(OperationSynchronizer::Aggregate(SyncGroup::new(members)))
    }
}

#[derive(Debug, Default)]
struct SyncState {
    flags: OperationFlags,
    validator: EventValidator,
    ready: bool,
    matched: bool,
    notifications: u64,
}

/// Synchronizer guarding one entity.
#[derive(Debug)]
pub struct SingleSync {
    id: u64,
    passthrough: bool,
    ctx: SyncContext,
    state: Mutex<SyncState>,
    cv: Condvar,
}

impl SingleSync {
    fn new(ctx: SyncContext, passthrough: bool) -> Self {
        Self {
            id: NEXT_SYNC_ID.fetch_add(1, Ordering::Relaxed),
            passthrough,
            ctx,
            state: Mutex::new(SyncState::default()),
            cv: Condvar::new(),
        }
    }

    fn bypassed(&self) -> bool {
        self.passthrough || !self.ctx.monitor.is_enabled()
    }

    fn reset(&self) {
        debug!("resetting event sync {}", self.id);
        {
            let mut state = self.state.lock();
            state.flags.reset();
            state.validator.reset();
            state.ready = false;
            state.matched = false;
        }
        // wake anyone still parked on a handshake that no longer exists
        self.cv.notify_all();
    }

    fn set_phase(&self, phase: Phase, value: bool) -> EventResult<()> {
        let mut state = self.state.lock();
        state.flags.set(self.id, phase, value)?;
        if value {
            state.validator.set_timestamp_floor(Instant::now());
        }
        debug!(target: EVENT_LOG, "setting sync {} {} to {}", self.id, phase, value);
        Ok(())
    }

    fn validate(&self, event: &Event) -> bool {
        let mut state = self.state.lock();
        let valid = state.validator.validate(event);
        state.matched |= valid;
        valid
    }

    fn set_ready(&self) {
        self.state.lock().ready = true;
        self.cv.notify_all();
    }

    fn wait<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Option<Duration>,
    ) -> EventResult<WaitOutcome> {
        if self.bypassed() {
            return Ok(WaitOutcome::Skipped);
        }

        let start = {
            let state = self.state.lock();
            if !state.ready {
                return Err(EventError::ProtocolError(format!(
                    "wait called before sync {} is ready",
                    self.id
                )));
            }
            state.notifications
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            {
                let state = self.state.lock();
                if state.notifications != start {
                    return Ok(WaitOutcome::Notified);
                }
                if !state.ready {
                    return Ok(WaitOutcome::Cancelled);
                }
            }
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(guard, deadline).timed_out() {
                        let state = self.state.lock();
                        return Ok(if state.notifications != start {
                            WaitOutcome::Notified
                        } else {
                            WaitOutcome::TimedOut
                        });
                    }
                }
                None => self.cv.wait(guard),
            }
        }
    }

    fn notify(&self) -> EventResult<()> {
        if self.bypassed() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            if !state.ready {
                return Err(EventError::ProtocolError(format!(
                    "notify called before sync {} is ready",
                    self.id
                )));
            }
            state.notifications += 1;
        }
        debug!(target: EVENT_LOG, "notify {}", self.id);
        self.cv.notify_all();
        Ok(())
    }

    fn release(&self) {
        if self.bypassed() {
            return;
        }
        let mut state = self.state.lock();
        if state.ready {
            state.notifications += 1;
            drop(state);
            self.cv.notify_all();
        }
    }

    fn wait_for_ready<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.bypassed() {
                return WaitOutcome::Skipped;
            }
            {
                let state = self.state.lock();
                if state.ready {
                    return WaitOutcome::Notified;
                }
                if !state.flags.is_active() {
                    return WaitOutcome::Cancelled;
                }
            }

            let mut slice = self.ctx.ready_poll;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return WaitOutcome::TimedOut;
                }
                slice = slice.min(deadline - now);
            }
            // short bounded waits release the shared lock and keep reset and
            // monitoring shutdown observable
            self.cv.wait_for(guard, slice);
        }
    }
}

/// Aggregate over the synchronizers of a container's members.
///
/// Container-level changes surface as member-level change events, so the
/// only phase that can be set here is [`Phase::Changing`].
#[derive(Debug)]
pub struct SyncGroup {
    id: u64,
    members: Vec<SyncHandle>,
}

impl SyncGroup {
    fn new(members: Vec<SyncHandle>) -> Self {
        Self {
            id: NEXT_SYNC_ID.fetch_add(1, Ordering::Relaxed),
            members,
        }
    }

    /// Member synchronizers.
    pub fn members(&self) -> &[SyncHandle] {
        &self.members
    }
}

/// A synchronizer: one entity's, or an aggregate of several.
#[derive(Debug)]
pub enum OperationSynchronizer {
    /// Guards one device or format.
    Single(SingleSync),
    /// Forwards to every member.
    Aggregate(SyncGroup),
}

impl OperationSynchronizer {
    /// Unique id, used in logs.
    pub fn id(&self) -> u64 {
        match self {
            Self::Single(s) => s.id,
            Self::Aggregate(g) => g.id,
        }
    }

    /// Returns true for the aggregate form.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Aggregate(_))
    }

    /// Returns true if this synchronizer never blocks.
    pub fn is_passthrough(&self) -> bool {
        match self {
            Self::Single(s) => s.passthrough,
            Self::Aggregate(_) => false,
        }
    }

    /// Clear flags, requirements, ready latch and match state.
    ///
    /// The guard proves the caller holds the shared lock, so a parked
    /// waiter cannot miss the wakeup.
    pub fn reset<T>(&self, _guard: &MutexGuard<'_, T>) {
        self.reset_locked();
    }

    fn reset_locked(&self) {
        match self {
            Self::Single(s) => s.reset(),
            Self::Aggregate(g) => g.members.iter().for_each(|m| m.reset_locked()),
        }
    }

    /// Is an operation in progress that uses this synchronizer?
    pub fn is_active(&self) -> bool {
        match self {
            Self::Single(s) => s.state.lock().flags.is_active(),
            Self::Aggregate(g) => g.members.iter().any(|m| m.is_active()),
        }
    }

    /// Returns true once an event has been matched in the current cycle.
    pub fn is_matched(&self) -> bool {
        match self {
            Self::Single(s) => s.state.lock().matched,
            Self::Aggregate(g) => {
                !g.members.is_empty() && g.members.iter().all(|m| m.is_matched())
            }
        }
    }

    /// Active, not yet matched, and not an aggregate.
    pub fn awaiting_sync(&self) -> bool {
        match self {
            Self::Single(s) => {
                let state = s.state.lock();
                state.flags.is_active() && !state.matched
            }
            Self::Aggregate(_) => false,
        }
    }

    /// Returns true if `phase` is the active phase.
    pub fn phase(&self, phase: Phase) -> bool {
        match self {
            Self::Single(s) => s.state.lock().flags.get(phase),
            Self::Aggregate(g) => {
                phase == Phase::Changing && g.members.iter().any(|m| m.phase(Phase::Changing))
            }
        }
    }

    /// The currently active phase, if any.
    pub fn active_phase(&self) -> Option<Phase> {
        match self {
            Self::Single(s) => s.state.lock().flags.active(),
            Self::Aggregate(_) => self.phase(Phase::Changing).then_some(Phase::Changing),
        }
    }

    /// Set or clear a phase flag. Activating a phase stamps the validator floor.
    pub fn set_phase(&self, phase: Phase, value: bool) -> EventResult<()> {
        match self {
            Self::Single(s) => s.set_phase(phase, value),
            Self::Aggregate(g) => {
                if phase != Phase::Changing {
                    return Err(EventError::ProtocolError(format!(
                        "{} cannot be set on aggregate sync {}",
                        phase, g.id
                    )));
                }
                if value {
                    if let Some(active) = g.members.iter().find_map(|m| m.active_phase()) {
                        error!("flag {} is already active on aggregate sync {}", active, g.id);
                        return Err(EventError::SynchronizationConflict {
                            sync_id: g.id,
                            requested: phase,
                            active,
                        });
                    }
                }
                g.members
                    .iter()
                    .try_for_each(|m| m.set_phase(Phase::Changing, value))
            }
        }
    }

    /// Narrow the attributes an event must carry to match.
    pub fn update_requirements<I, K>(&self, requirements: I)
    where
        I: IntoIterator<Item = (K, RequiredValue)>,
        K: Into<String>,
    {
        let requirements: Vec<(String, RequiredValue)> = requirements
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect();
        self.apply_requirements(&requirements);
    }

    fn apply_requirements(&self, requirements: &[(String, RequiredValue)]) {
        match self {
            Self::Single(s) => s
                .state
                .lock()
                .validator
                .update_requirements(requirements.iter().cloned()),
            Self::Aggregate(g) => g
                .members
                .iter()
                .for_each(|m| m.apply_requirements(requirements)),
        }
    }

    /// Drop one attribute requirement.
    pub fn remove_requirement(&self, key: &str) {
        match self {
            Self::Single(s) => s.state.lock().validator.remove_requirement(key),
            Self::Aggregate(g) => g.members.iter().for_each(|m| m.remove_requirement(key)),
        }
    }

    /// Check `event` against the validator, latching `matched` on success.
    pub fn validate(&self, event: &Event) -> EventResult<bool> {
        match self {
            Self::Single(s) => Ok(s.validate(event)),
            Self::Aggregate(g) => Err(EventError::ProtocolError(format!(
                "validate called directly on aggregate sync {}",
                g.id
            ))),
        }
    }

    /// Record a match without consulting the validator.
    pub fn mark_matched(&self) {
        match self {
            Self::Single(s) => s.state.lock().matched = true,
            Self::Aggregate(g) => g.members.iter().for_each(|m| m.mark_matched()),
        }
    }

    /// Drop a match recorded by [`mark_matched`](Self::mark_matched).
    pub fn clear_matched(&self) {
        match self {
            Self::Single(s) => s.state.lock().matched = false,
            Self::Aggregate(g) => g.members.iter().for_each(|m| m.clear_matched()),
        }
    }

    /// Set the ready latch. Requires the shared lock.
    pub fn set_ready<T>(&self, _guard: &MutexGuard<'_, T>) {
        self.set_ready_locked();
    }

    fn set_ready_locked(&self) {
        match self {
            Self::Single(s) => s.set_ready(),
            Self::Aggregate(g) => g.members.iter().for_each(|m| m.set_ready_locked()),
        }
    }

    /// Clear the ready latch. Requires the shared lock.
    pub fn clear_ready<T>(&self, _guard: &MutexGuard<'_, T>) {
        self.clear_ready_locked();
    }

    fn clear_ready_locked(&self) {
        match self {
            Self::Single(s) => {
                s.state.lock().ready = false;
                s.cv.notify_all();
            }
            Self::Aggregate(g) => g.members.iter().for_each(|m| m.clear_ready_locked()),
        }
    }

    /// Returns true if the ready latch is set.
    pub fn is_ready(&self) -> bool {
        match self {
            Self::Single(s) => s.state.lock().ready,
            Self::Aggregate(g) => g.members.iter().all(|m| m.is_ready()),
        }
    }

    /// Block until notified, the timeout elapses, or the synchronizer is reset.
    ///
    /// Fails with [`EventError::ProtocolError`] before the ready latch is set.
    pub fn wait<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Option<Duration>,
    ) -> EventResult<WaitOutcome> {
        match self {
            Self::Single(s) => s.wait(guard, timeout),
            Self::Aggregate(g) => {
                let mut outcomes = Vec::with_capacity(g.members.len());
                for member in &g.members {
                    outcomes.push(member.wait(guard, timeout)?);
                }
                Ok(WaitOutcome::combine(outcomes))
            }
        }
    }

    /// Wake the thread waiting on this synchronizer.
    ///
    /// Fails with [`EventError::ProtocolError`] before the ready latch is set.
    /// The guard proves the caller holds the shared lock.
    pub fn notify<T>(&self, _guard: &MutexGuard<'_, T>) -> EventResult<()> {
        self.notify_locked()
    }

    fn notify_locked(&self) -> EventResult<()> {
        match self {
            Self::Single(s) => s.notify(),
            Self::Aggregate(g) => g.members.iter().try_for_each(|m| m.notify_locked()),
        }
    }

    /// Final signal of the dispatcher side: wakes a controller parked in its
    /// closing `wait`. A no-op once the controller has reset.
    pub fn release<T>(&self, _guard: &MutexGuard<'_, T>) {
        self.release_locked();
    }

    fn release_locked(&self) {
        match self {
            Self::Single(s) => s.release(),
            Self::Aggregate(g) => g.members.iter().for_each(|m| m.release_locked()),
        }
    }

    /// Dispatcher side: block until the controller has set the ready latch.
    ///
    /// Re-checks at the configured poll interval. Returns `Cancelled` if the
    /// operation is reset first.
    pub fn wait_for_ready<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        match self {
            Self::Single(s) => s.wait_for_ready(guard, timeout),
            Self::Aggregate(g) => WaitOutcome::combine(
                g.members
                    .iter()
                    .map(|m| m.wait_for_ready(guard, timeout))
                    .collect::<Vec<_>>(),
            ),
        }
    }

    /// Controller side: set the ready latch, then wait for the dispatcher.
    ///
    /// Without a `timeout`, the context's default timeout applies.
    pub fn ready_wait<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Option<Duration>,
    ) -> EventResult<WaitOutcome> {
        match self {
            Self::Single(s) => {
                if s.bypassed() {
                    return Ok(WaitOutcome::Skipped);
                }
                debug!(target: EVENT_LOG, "setting {} ready", s.id);
                s.set_ready();
                s.wait(guard, timeout.or(s.ctx.default_timeout))
            }
            Self::Aggregate(g) => {
                let mut outcomes = Vec::with_capacity(g.members.len());
                for member in &g.members {
                    outcomes.push(member.ready_wait(guard, timeout)?);
                }
                Ok(WaitOutcome::combine(outcomes))
            }
        }
    }

    /// Run the full controller side of the handshake after the operation has
    /// been performed: wait for confirmation, run `accounting`, hand control
    /// back to the dispatcher and wait for it to finish.
    ///
    /// Returns false if no confirming event arrived in time; `accounting` is
    /// not run in that case. The caller still owns `reset()`. Without a
    /// `timeout`, the context's default timeout applies.
    pub fn confirm<T, F>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Option<Duration>,
        accounting: F,
    ) -> EventResult<bool>
    where
        F: FnOnce(&mut T),
    {
        let timeout = timeout.or_else(|| self.default_timeout());
        let outcome = self.ready_wait(guard, timeout)?;
        if outcome.is_failure() {
            debug!(target: EVENT_LOG, "sync {} not confirmed: {:?}", self.id(), outcome);
            return Ok(false);
        }

        accounting(&mut **guard);

        if outcome == WaitOutcome::Skipped {
            return Ok(true);
        }
        self.notify(guard)?;
        self.wait(guard, timeout)?;
        Ok(true)
    }

    fn default_timeout(&self) -> Option<Duration> {
        match self {
            Self::Single(s) => s.ctx.default_timeout,
            Self::Aggregate(g) => g.members.iter().find_map(|m| m.default_timeout()),
        }
    }

    /// A freshly constructed, unarmed synchronizer of the same shape.
    ///
    /// Used when snapshotting an entity: live wait state is never shared
    /// with the copy. Aggregates get fresh copies of their members.
    pub fn fresh_copy(&self) -> OperationSynchronizer {
        match self {
            Self::Single(s) => Self::Single(SingleSync::new(s.ctx.clone(), s.passthrough)),
            Self::Aggregate(g) => Self::Aggregate(SyncGroup::new(
                g.members
                    .iter()
                    .map(|m| Arc::new(m.fresh_copy()))
                    .collect(),
            )),
        }
    }
}
