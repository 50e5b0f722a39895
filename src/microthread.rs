//! Microthreads: suspendable execution frames and the resume protocol.
//!
//! A [`Microthread`] binds one callable to a private namespace/budget
//! snapshot. While the thread is suspended its snapshot is authoritative;
//! while it runs, the live values are the active context's, and `resume`
//! copies them back into the snapshot before anyone else can become
//! current. The save/restore discipline is strictly LIFO, which is what
//! makes nested resume safe: the most recently activated frame is always
//! fully unwound before control returns to whichever frame activated it.
//!
//! When no microthread is current, the active context's live fields belong
//! to the *fallback frame* — the ambient host activation. It is the save
//! target for the outermost `resume`, so after any resume chain unwinds the
//! host finds its context exactly as it left it.

use std::cell::RefCell;
use std::fmt;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::budget::CpuBudget;
use crate::context::{self, Context};
use crate::interp::{Continuation, Scope, StepExit};
use crate::types::{GuestError, NamespaceHandle, ResumeOutcome, ThreadStatus, Value};

/// Illegal resume attempts. These are host bugs: budget signals and guest
/// errors are reported as [`ResumeOutcome`]s, never through this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResumeError {
    #[error("no context is loaded on this thread")]
    NoContext,
    #[error("thread is not resumable from status {0}")]
    Terminal(ThreadStatus),
}

/// Snapshot of the fields a frame borrows from the active context while it
/// runs: the namespace roots and the budget counters.
struct SavedFrame {
    locals: NamespaceHandle,
    globals: NamespaceHandle,
    budget: CpuBudget,
}

impl SavedFrame {
    fn capture(ctx: &Context) -> Self {
        Self {
            locals: ctx.locals(),
            globals: ctx.globals(),
            budget: ctx.budget(),
        }
    }

    fn restore(self, ctx: &Context) {
        ctx.set_locals(self.locals);
        ctx.set_globals(self.globals);
        ctx.set_budget(self.budget);
    }
}

thread_local! {
    static CURRENT: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Name of the microthread currently running on this thread, or `None`
/// when the fallback frame is current.
pub fn current() -> Option<String> {
    CURRENT.with(|stack| stack.borrow().last().cloned())
}

/// Depth of the active resume nesting on this thread.
pub fn resume_depth() -> usize {
    CURRENT.with(|stack| stack.borrow().len())
}

/// One suspendable call stack bound to a callable.
pub struct Microthread {
    name: String,
    callable: Box<dyn Continuation>,
    status: ThreadStatus,
    last_result: Value,
    last_error: Option<GuestError>,
    locals: NamespaceHandle,
    globals: NamespaceHandle,
    budget: CpuBudget,
}

impl Microthread {
    /// Bind `callable` to a fresh frame: empty locals, globals shared with
    /// the active context (if one is loaded), zeroed budget, status
    /// `Ready`. Argument binding is the callable's own concern.
    pub fn new(name: impl Into<String>, callable: Box<dyn Continuation>) -> Self {
        let (globals, budget) = match context::active() {
            Some(ctx) => (
                ctx.globals(),
                CpuBudget::new(ctx.budget().max_check_interval()),
            ),
            None => (NamespaceHandle::new(), CpuBudget::default()),
        };
        Self {
            name: name.into(),
            callable,
            status: ThreadStatus::Ready,
            last_result: Value::Null,
            last_error: None,
            locals: NamespaceHandle::new(),
            globals,
            budget,
        }
    }

    /// [`Microthread::new`] with a generated name.
    pub fn spawn(callable: Box<dyn Continuation>) -> Self {
        Self::new(Uuid::new_v4().to_string(), callable)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    /// Value carried by the last resume outcome (`Null` when there was
    /// none).
    pub fn last_result(&self) -> &Value {
        &self.last_result
    }

    /// The guest error behind the last `Exception` outcome.
    pub fn last_error(&self) -> Option<&GuestError> {
        self.last_error.as_ref()
    }

    // ---- per-thread budget snapshot ----
    //
    // The snapshot is authoritative only while the thread is not running;
    // resume installs it into the active context and copies it back out.

    pub fn set_hard_limit(&mut self, n: u64) {
        self.budget.set_hard_limit(n);
    }

    pub fn set_soft_limit(&mut self, n: u64) {
        self.budget.set_soft_limit(n);
    }

    pub fn set_safe_limit(&mut self, n: u64) {
        self.budget.set_safe_limit(n);
    }

    pub fn usage(&self) -> u64 {
        self.budget.usage()
    }

    pub fn clear_usage(&mut self) {
        self.budget.clear_usage();
    }

    pub fn clear_soft(&mut self) {
        self.budget.clear_soft();
    }

    pub fn budget(&self) -> &CpuBudget {
        &self.budget
    }

    pub fn budget_mut(&mut self) -> &mut CpuBudget {
        &mut self.budget
    }

    /// Run the thread until it stops again.
    ///
    /// `send` is injected at the suspension point when resuming from
    /// `Yield` or `SoftPause`; from `Ready` there is no suspension point
    /// and it is ignored. The call is transparent with respect to ambient
    /// state: whatever frame and context were active before the call are
    /// active again when it returns, whichever outcome it reports.
    pub fn resume(&mut self, send: Value) -> Result<(ResumeOutcome, Value), ResumeError> {
        match self.status {
            ThreadStatus::Ready | ThreadStatus::Yield | ThreadStatus::SoftPause => {}
            ThreadStatus::HardPause => {
                if self.budget.hard_exceeded() {
                    // Budget period still exhausted: report it again
                    // without executing a single step.
                    return Ok((ResumeOutcome::HardPause, Value::Null));
                }
                // The host cleared the condition; the thread is resumable.
            }
            status => return Err(ResumeError::Terminal(status)),
        }
        let ctx = context::active().ok_or(ResumeError::NoContext)?;

        let saved = SavedFrame::capture(&ctx);
        self.install(&ctx);
        CURRENT.with(|stack| stack.borrow_mut().push(self.name.clone()));
        self.status = ThreadStatus::Running;
        debug!(thread = %self.name, depth = resume_depth(), "resume enter");

        let exit = if ctx.stack_exceeded() {
            StepExit::Raise(GuestError::new("native stack reserve exhausted"))
        } else {
            let mut scope = Scope::new(&ctx);
            self.callable.resume(&mut scope, send)
        };

        let (outcome, result) = self.settle(exit);
        self.snapshot_back(&ctx);
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
        saved.restore(&ctx);

        debug!(
            thread = %self.name,
            outcome = %outcome,
            usage = self.budget.usage(),
            "resume exit"
        );
        Ok((outcome, result))
    }

    /// Copy this thread's snapshot into the active context.
    fn install(&self, ctx: &Context) {
        ctx.set_locals(self.locals.clone());
        ctx.set_globals(self.globals.clone());
        ctx.set_budget(self.budget.clone());
    }

    /// Copy the live fields back into this thread's snapshot.
    fn snapshot_back(&mut self, ctx: &Context) {
        self.locals = ctx.locals();
        self.globals = ctx.globals();
        self.budget = ctx.budget();
    }

    /// Classify a step-loop exit into an outcome, updating status and the
    /// last-result fields.
    fn settle(&mut self, exit: StepExit) -> (ResumeOutcome, Value) {
        self.last_error = None;
        let (outcome, status, result) = match exit {
            StepExit::Return(value) => (ResumeOutcome::Stop, ThreadStatus::Stop, value),
            StepExit::Yield(value) => (ResumeOutcome::Yield, ThreadStatus::Yield, value),
            StepExit::Pause(value) => (ResumeOutcome::SoftPause, ThreadStatus::SoftPause, value),
            StepExit::SoftLimit => (
                ResumeOutcome::SoftPause,
                ThreadStatus::SoftPause,
                Value::Null,
            ),
            StepExit::HardLimit => (
                ResumeOutcome::HardPause,
                ThreadStatus::HardPause,
                Value::Null,
            ),
            StepExit::Raise(err) => {
                let value = serde_json::to_value(&err)
                    .unwrap_or_else(|_| Value::String(err.message.clone()));
                self.last_error = Some(err);
                (ResumeOutcome::Exception, ThreadStatus::Exception, value)
            }
        };
        self.status = status;
        self.last_result = result.clone();
        (outcome, result)
    }
}

impl fmt::Debug for Microthread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Microthread")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("usage", &self.budget.usage())
            .finish()
    }
}

impl fmt::Display for Microthread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<microthread {} status={}>", self.name, self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::interp::from_fn;
    use serde_json::json;

    struct LoadedContext {
        ctx: Context,
    }

    impl LoadedContext {
        fn new() -> Self {
            let ctx = Context::create(&Config::default());
            ctx.load().unwrap();
            Self { ctx }
        }
    }

    impl Drop for LoadedContext {
        fn drop(&mut self) {
            let _ = self.ctx.store();
        }
    }

    #[test]
    fn immediate_return_stops_with_value() {
        let _guard = LoadedContext::new();
        let mut thread = Microthread::new(
            "t",
            Box::new(from_fn(|_, _| StepExit::Return(json!(42)))),
        );

        let (outcome, value) = thread.resume(Value::Null).unwrap();
        assert_eq!(outcome, ResumeOutcome::Stop);
        assert_eq!(value, json!(42));
        assert_eq!(thread.status(), ThreadStatus::Stop);
    }

    #[test]
    fn resume_without_context_is_an_error() {
        let mut thread = Microthread::new(
            "t",
            Box::new(from_fn(|_, _| StepExit::Return(Value::Null))),
        );
        assert_eq!(thread.resume(Value::Null), Err(ResumeError::NoContext));
        // The failed attempt must not consume the thread's readiness.
        assert_eq!(thread.status(), ThreadStatus::Ready);
    }

    #[test]
    fn resume_on_terminal_thread_is_an_error() {
        let _guard = LoadedContext::new();
        let mut thread = Microthread::new(
            "t",
            Box::new(from_fn(|_, _| StepExit::Return(Value::Null))),
        );
        thread.resume(Value::Null).unwrap();

        assert_eq!(
            thread.resume(Value::Null),
            Err(ResumeError::Terminal(ThreadStatus::Stop))
        );
    }

    #[test]
    fn guest_error_becomes_exception_outcome() {
        let _guard = LoadedContext::new();
        let mut thread = Microthread::new(
            "t",
            Box::new(from_fn(|_, _| {
                StepExit::Raise(GuestError::new("boom"))
            })),
        );

        let (outcome, value) = thread.resume(Value::Null).unwrap();
        assert_eq!(outcome, ResumeOutcome::Exception);
        assert_eq!(value["message"], json!("boom"));
        assert_eq!(thread.last_error().unwrap().message, "boom");
        assert_eq!(thread.status(), ThreadStatus::Exception);
    }

    #[test]
    fn spawn_generates_a_name() {
        let thread = Microthread::spawn(Box::new(from_fn(|_, _| {
            StepExit::Return(Value::Null)
        })));
        assert!(!thread.name().is_empty());
    }

    #[test]
    fn current_is_tracked_during_resume() {
        let _guard = LoadedContext::new();
        assert_eq!(current(), None);

        let mut thread = Microthread::new(
            "tracked",
            Box::new(from_fn(|_, _| {
                assert_eq!(current().as_deref(), Some("tracked"));
                assert_eq!(resume_depth(), 1);
                StepExit::Return(Value::Null)
            })),
        );
        thread.resume(Value::Null).unwrap();

        assert_eq!(current(), None);
        assert_eq!(resume_depth(), 0);
    }

    #[test]
    fn display_includes_name_and_status() {
        let thread = Microthread::new(
            "shown",
            Box::new(from_fn(|_, _| StepExit::Return(Value::Null))),
        );
        assert_eq!(format!("{thread}"), "<microthread shown status=ready>");
    }
}
