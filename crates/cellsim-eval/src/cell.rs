//! One named, time-stamped computed quantity.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use cellsim_common::{NodeId, Step};
use parking_lot::{Mutex, ReentrantMutex};
use smallvec::SmallVec;

use crate::history::ValueHistory;
use crate::traits::Equation;

/// Shared handle to a cell. Cells live as long as any handle does; the
/// object graph decides when they stop being reachable.
pub type CellRef = Arc<VariableCell>;

/// Process-unique cell identity, used as key by history stores.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

bitflags! {
    /// Classification flags fixed at construction time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CellFlags: u8 {
        /// Constant; never recomputed.
        const PARAMETER = 1 << 0;
        /// Caller-gated function rather than a per-step variable.
        const FUNCTION  = 1 << 1;
        /// May be fanned out over sibling instances.
        const PARALLEL  = 1 << 2;
        /// Every computed value is recorded in the history store.
        const PERSIST   = 1 << 3;
        const PLOT      = 1 << 4;
        const DEBUG     = 1 << 5;
    }
}

/// When a recomputed value should fire the debug hook.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DebugCondition {
    /// Every recomputation, but only while the engine runs in debug mode.
    Always,
    Equal(f64),
    Above(f64),
    Below(f64),
}

impl DebugCondition {
    pub fn holds(self, value: f64, debug_mode: bool) -> bool {
        match self {
            DebugCondition::Always => debug_mode,
            DebugCondition::Equal(v) => value == v,
            DebugCondition::Above(v) => value > v,
            DebugCondition::Below(v) => value < v,
        }
    }
}

/// Construction-time description of a cell, normally derived from the
/// model configuration.
#[derive(Debug, Clone)]
pub struct CellSpec {
    pub name: String,
    pub flags: CellFlags,
    pub max_lag: u32,
    pub initial: f64,
    pub initial_lags: SmallVec<[f64; 4]>,
    pub period: u32,
    pub period_jitter: u32,
    pub delay: u32,
    pub debug: Option<DebugCondition>,
}

impl CellSpec {
    /// Ordinary time-indexed variable keeping `max_lag` past values.
    pub fn variable(name: impl Into<String>, max_lag: u32) -> Self {
        Self {
            name: name.into(),
            flags: CellFlags::empty(),
            max_lag,
            initial: 0.0,
            initial_lags: SmallVec::new(),
            period: 1,
            period_jitter: 0,
            delay: 0,
            debug: None,
        }
    }

    pub fn parameter(name: impl Into<String>, value: f64) -> Self {
        let mut spec = Self::variable(name, 0);
        spec.flags |= CellFlags::PARAMETER;
        spec.initial = value;
        spec
    }

    pub fn function(name: impl Into<String>, max_lag: u32) -> Self {
        let mut spec = Self::variable(name, max_lag);
        spec.flags |= CellFlags::FUNCTION;
        spec
    }

    pub fn initial(mut self, value: f64) -> Self {
        self.initial = value;
        self
    }

    /// Initial lagged values, `lags[0]` being lag 1.
    pub fn lags(mut self, lags: &[f64]) -> Self {
        self.initial_lags = lags.iter().copied().collect();
        self
    }

    pub fn period(mut self, period: u32) -> Self {
        self.period = period.max(1);
        self
    }

    pub fn jitter(mut self, jitter: u32) -> Self {
        self.period_jitter = jitter;
        self
    }

    /// Postpone the first recomputation to step `1 + delay`.
    pub fn delay(mut self, delay: u32) -> Self {
        self.delay = delay;
        self
    }

    pub fn parallel(mut self) -> Self {
        self.flags |= CellFlags::PARALLEL;
        self
    }

    pub fn persist(mut self) -> Self {
        self.flags |= CellFlags::PERSIST;
        self
    }

    pub fn plotted(mut self) -> Self {
        self.flags |= CellFlags::PLOT;
        self
    }

    pub fn debug(mut self, condition: DebugCondition) -> Self {
        self.flags |= CellFlags::DEBUG;
        self.debug = Some(condition);
        self
    }
}

/// Per-cell computation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellProfile {
    pub computations: u64,
    /// Wall time spent inside the equation; only accumulated when the
    /// engine is configured with profiling on.
    pub elapsed: Duration,
}

#[derive(Debug)]
pub(crate) struct CellState {
    pub(crate) history: ValueHistory,
    pub(crate) last_update: Step,
    pub(crate) next_update: Step,
    pub(crate) under_computation: bool,
    pub(crate) profile: CellProfile,
}

impl CellState {
    /// Memoization fast path: already computed this step, or a periodic
    /// cell that is not due yet.
    #[inline]
    pub(crate) fn is_fresh(&self, step: Step) -> bool {
        self.last_update >= step || step < self.next_update
    }
}

pub struct VariableCell {
    id: CellId,
    name: Arc<str>,
    owner: NodeId,
    flags: CellFlags,
    period: u32,
    period_jitter: u32,
    debug: Option<DebugCondition>,
    equation: Option<Arc<dyn Equation>>,
    /// Held for the whole recomputation. Reentrant so that a self-request
    /// on the computing thread reaches the `under_computation` check
    /// instead of blocking on itself.
    pub(crate) compute: ReentrantMutex<()>,
    pub(crate) state: Mutex<CellState>,
}

impl VariableCell {
    pub fn new(owner: NodeId, spec: CellSpec, equation: Option<Arc<dyn Equation>>) -> Self {
        let history = ValueHistory::with_lags(spec.initial, &spec.initial_lags, spec.max_lag);
        Self {
            id: CellId::next(),
            name: Arc::from(spec.name),
            owner,
            flags: spec.flags,
            period: spec.period.max(1),
            period_jitter: spec.period_jitter,
            debug: spec.debug,
            equation,
            compute: ReentrantMutex::new(()),
            state: Mutex::new(CellState {
                history,
                last_update: 0,
                next_update: 1 + spec.delay as Step,
                under_computation: false,
                profile: CellProfile::default(),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> CellId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    #[inline]
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    #[inline]
    pub fn flags(&self) -> CellFlags {
        self.flags
    }

    pub fn is_parameter(&self) -> bool {
        self.flags.contains(CellFlags::PARAMETER)
    }

    pub fn is_function(&self) -> bool {
        self.flags.contains(CellFlags::FUNCTION)
    }

    pub fn eligible_for_parallel(&self) -> bool {
        self.flags.contains(CellFlags::PARALLEL)
    }

    pub fn persist_to_history(&self) -> bool {
        self.flags.contains(CellFlags::PERSIST)
    }

    pub fn plotted(&self) -> bool {
        self.flags.contains(CellFlags::PLOT)
    }

    pub fn debug_trigger(&self) -> bool {
        self.flags.contains(CellFlags::DEBUG)
    }

    pub fn debug_condition(&self) -> Option<DebugCondition> {
        self.debug
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    pub fn period_jitter(&self) -> u32 {
        self.period_jitter
    }

    pub(crate) fn is_periodic(&self) -> bool {
        self.period > 1 || self.period_jitter > 0
    }

    pub(crate) fn equation(&self) -> Option<&Arc<dyn Equation>> {
        self.equation.as_ref()
    }

    pub fn max_lag(&self) -> u32 {
        self.state.lock().history.depth()
    }

    /// Most recent value, without any recomputation.
    pub fn current(&self) -> f64 {
        self.state.lock().history.current()
    }

    pub fn last_update(&self) -> Step {
        self.state.lock().last_update
    }

    pub fn next_update(&self) -> Step {
        self.state.lock().next_update
    }

    pub fn is_under_computation(&self) -> bool {
        self.state.lock().under_computation
    }

    /// Whether a lag-0 request at `step` would be served from cache.
    pub fn is_fresh(&self, step: Step) -> bool {
        self.state.lock().is_fresh(step)
    }

    pub fn profile(&self) -> CellProfile {
        self.state.lock().profile
    }
}

impl std::fmt::Debug for VariableCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VariableCell")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("flags", &self.flags)
            .field("current", &state.history.current())
            .field("last_update", &state.last_update)
            .field("under_computation", &state.under_computation)
            .finish()
    }
}
