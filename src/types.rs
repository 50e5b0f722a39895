use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Guest values are plain JSON values; the host decides how to map them
/// onto its own types.
pub type Value = JsonValue;

/// A namespace is a string-keyed dict of guest values (locals or globals).
pub type Namespace = HashMap<String, Value>;

/// Shared handle to a namespace.
///
/// Namespaces are swapped between a context and its microthreads by handle,
/// so identity survives suspension: a binding written while a thread runs is
/// visible through every handle to the same dict.
#[derive(Debug, Clone, Default)]
pub struct NamespaceHandle(Rc<RefCell<Namespace>>);

impl NamespaceHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Namespace) -> Self {
        Self(Rc::new(RefCell::new(map)))
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.borrow().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.0.borrow_mut().insert(name.into(), value);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.0.borrow_mut().remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// True when both handles refer to the same underlying dict.
    pub fn ptr_eq(&self, other: &NamespaceHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Lifecycle status of a microthread.
///
/// `Ready → Running → {Yield, SoftPause, HardPause, Stop, Exception}`.
/// `Yield` and `SoftPause` transition back to `Running` on the next resume.
/// `Stop` and `Exception` are terminal. `HardPause` is terminal until the
/// host clears the budget condition that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Ready,
    Running,
    Yield,
    SoftPause,
    HardPause,
    Stop,
    Exception,
}

impl ThreadStatus {
    /// Statuses from which `resume` may legally run the thread.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            ThreadStatus::Ready | ThreadStatus::Yield | ThreadStatus::SoftPause
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ThreadStatus::Stop | ThreadStatus::Exception)
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreadStatus::Ready => "ready",
            ThreadStatus::Running => "running",
            ThreadStatus::Yield => "yield",
            ThreadStatus::SoftPause => "soft_pause",
            ThreadStatus::HardPause => "hard_pause",
            ThreadStatus::Stop => "stop",
            ThreadStatus::Exception => "exception",
        };
        f.write_str(s)
    }
}

/// Why a `resume` call returned.
///
/// `Yield` and `SoftPause` mean the thread can be resumed again; `SoftPause`
/// additionally tells the host a soft budget limit (or a guest-requested
/// pause) is waiting on its decision. `HardPause` means the budget period is
/// exhausted. `Stop` and `Exception` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeOutcome {
    Stop,
    Exception,
    Yield,
    SoftPause,
    HardPause,
}

impl fmt::Display for ResumeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResumeOutcome::Stop => "stop",
            ResumeOutcome::Exception => "exception",
            ResumeOutcome::Yield => "yield",
            ResumeOutcome::SoftPause => "soft_pause",
            ResumeOutcome::HardPause => "hard_pause",
        };
        f.write_str(s)
    }
}

/// An error raised by guest code.
///
/// Guest errors are reported to the host as the `Exception` outcome of
/// `resume`; they never unwind into the host's native stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestError {
    pub message: String,
    pub value: Option<Value>,
}

impl GuestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            value: None,
        }
    }

    pub fn with_value(message: impl Into<String>, value: Value) -> Self {
        Self {
            message: message.into(),
            value: Some(value),
        }
    }
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn namespace_handles_share_identity() {
        let a = NamespaceHandle::new();
        let b = a.clone();

        a.set("x", json!(1));
        assert_eq!(b.get("x"), Some(json!(1)));
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&NamespaceHandle::new()));
    }

    #[test]
    fn status_machine_classification() {
        assert!(ThreadStatus::Ready.is_resumable());
        assert!(ThreadStatus::Yield.is_resumable());
        assert!(ThreadStatus::SoftPause.is_resumable());
        assert!(!ThreadStatus::HardPause.is_resumable());
        assert!(!ThreadStatus::Stop.is_resumable());

        assert!(ThreadStatus::Stop.is_terminal());
        assert!(ThreadStatus::Exception.is_terminal());
        assert!(!ThreadStatus::HardPause.is_terminal());
    }

    #[test]
    fn outcome_serializes_lowercase() {
        let s = serde_json::to_string(&ResumeOutcome::SoftPause).unwrap();
        assert_eq!(s, "\"soft_pause\"");
    }
}
