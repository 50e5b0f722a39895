//! The seam between the scheduler and the step-execution engine.
//!
//! The scheduler never interprets a continuation's internals: it drives a
//! [`Continuation`] until the engine reports a [`StepExit`], and the engine
//! reaches back through a [`Scope`] for the only two things it may touch
//! while running — the active context's namespaces and its budget clock.
//!
//! [`machine`] provides the bundled op-based engine; hosts embedding a real
//! language front-end implement [`Continuation`] over their own interpreter
//! and everything else in this crate works unchanged.

pub mod demos;
pub mod machine;

use crate::budget::BudgetSignal;
use crate::context::Context;
use crate::types::{GuestError, NamespaceHandle, Value};

/// Why a step loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum StepExit {
    /// The callable completed with a value.
    Return(Value),
    /// Cooperative yield with a value; resumable, send value injected.
    Yield(Value),
    /// Guest-requested pause with a value; resumable, send value injected.
    Pause(Value),
    /// Soft budget limit crossed at a check point; resumable.
    SoftLimit,
    /// Hard budget limit crossed at a check point.
    HardLimit,
    /// Unrecovered guest error.
    Raise(GuestError),
}

/// One suspended or running step loop.
///
/// `resume` runs from the saved suspension point until a stop condition,
/// injecting `send` at that point (implementations ignore `send` on the
/// first entry, when there is no suspension point to fill). Implementations
/// must call [`Scope::tick`] once per executed step and exit with
/// `SoftLimit`/`HardLimit` when it signals; a suspended state must be
/// re-enterable from exactly where it left off.
pub trait Continuation {
    fn resume(&mut self, scope: &mut Scope<'_>, send: Value) -> StepExit;
}

/// The window a running continuation gets onto the active context.
///
/// Holding a `Scope` does not pin the context handle anywhere else; the
/// scope is constructed by `resume` for one entry into the step loop and
/// dropped before the previous frame is restored.
pub struct Scope<'a> {
    context: &'a Context,
}

impl<'a> Scope<'a> {
    pub fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Charge one executed step against the active budget. A returned
    /// signal is mandatory: the step loop must wind down and exit with the
    /// matching `StepExit`. `Soft` is acknowledged here so it cannot signal
    /// again until the host clears it.
    pub fn tick(&mut self) -> Option<BudgetSignal> {
        self.context.with_budget_mut(|budget| {
            let signal = budget.step();
            if signal == Some(BudgetSignal::Soft) {
                budget.signal_soft();
            }
            signal
        })
    }

    pub fn locals(&self) -> NamespaceHandle {
        self.context.locals()
    }

    pub fn globals(&self) -> NamespaceHandle {
        self.context.globals()
    }

    /// True when native stack use since context load exceeds the configured
    /// reserve. Engines that recurse natively check this at call setup.
    pub fn stack_exceeded(&self) -> bool {
        self.context.stack_exceeded()
    }
}

/// Wrap a closure as a [`Continuation`]. Handy for hosts whose callable is
/// native code rather than an interpreted program, and for tests.
pub fn from_fn<F>(f: F) -> impl Continuation
where
    F: FnMut(&mut Scope<'_>, Value) -> StepExit,
{
    struct FnContinuation<F>(F);

    impl<F> Continuation for FnContinuation<F>
    where
        F: FnMut(&mut Scope<'_>, Value) -> StepExit,
    {
        fn resume(&mut self, scope: &mut Scope<'_>, send: Value) -> StepExit {
            (self.0)(scope, send)
        }
    }

    FnContinuation(f)
}
