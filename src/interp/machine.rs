//! Bundled op-based step machine.
//!
//! A deliberately small engine behind the [`Continuation`] seam: programs
//! are flat op lists built programmatically (the language front-end is an
//! external collaborator), execution state is an explicit value stack plus a
//! program counter, and every executed op charges exactly one budget tick.
//! Because the state is explicit, the machine suspends mid-program and
//! re-enters from the same point, with a send-value slot filled at
//! yield/pause suspension points.

use serde::{Deserialize, Serialize};

use super::{Continuation, Scope, StepExit};
use crate::budget::BudgetSignal;
use crate::types::{GuestError, Value};

/// One machine instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Op {
    /// Push a constant.
    Const(Value),
    /// Push a variable (locals first, then globals).
    Load(String),
    /// Pop into a local variable.
    Assign(String),
    Add,
    Sub,
    Mul,
    /// Consume `n` steps without other effect; suspendable mid-way.
    Work(u64),
    /// Unconditional jump to an op index.
    Jump(usize),
    /// Pop an integer, jump when it is zero.
    JumpIfZero(usize),
    /// Pop a value and yield it; the send value is pushed on resume.
    YieldTop,
    /// Pop a value and request a soft pause carrying it; the send value is
    /// pushed on resume.
    PauseTop,
    /// Pop a value and raise it as a guest error.
    RaiseTop,
    /// Pop the return value and stop.
    Return,
}

/// An executable op list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub ops: Vec<Op>,
}

impl Program {
    pub fn new(ops: Vec<Op>) -> Self {
        Self { ops }
    }
}

/// Suspendable execution state of one [`Program`].
///
/// Running past the last op completes with `null`, so straight-line
/// programs do not need a trailing `Return`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramState {
    program: Program,
    pc: usize,
    stack: Vec<Value>,
    work_left: Option<u64>,
    awaiting_send: bool,
}

/// Result of executing one op.
enum Step {
    Continue,
    Exit(StepExit),
}

impl ProgramState {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            pc: 0,
            stack: Vec::new(),
            work_left: None,
            awaiting_send: false,
        }
    }

    fn pop(&mut self) -> Result<Value, GuestError> {
        self.stack
            .pop()
            .ok_or_else(|| GuestError::new("value stack underflow"))
    }

    fn pop_int(&mut self) -> Result<i64, GuestError> {
        let value = self.pop()?;
        value
            .as_i64()
            .ok_or_else(|| GuestError::with_value("expected an integer", value))
    }

    fn exec(&mut self, scope: &mut Scope<'_>, op: Op) -> Step {
        match op {
            Op::Const(value) => {
                self.stack.push(value);
                self.pc += 1;
            }
            Op::Load(name) => {
                let value = scope
                    .locals()
                    .get(&name)
                    .or_else(|| scope.globals().get(&name));
                match value {
                    Some(value) => {
                        self.stack.push(value);
                        self.pc += 1;
                    }
                    None => {
                        return Step::Exit(StepExit::Raise(GuestError::new(format!(
                            "undefined variable: {name}"
                        ))))
                    }
                }
            }
            Op::Assign(name) => match self.pop() {
                Ok(value) => {
                    scope.locals().set(name, value);
                    self.pc += 1;
                }
                Err(err) => return Step::Exit(StepExit::Raise(err)),
            },
            Op::Add | Op::Sub | Op::Mul => {
                let rhs = match self.pop_int() {
                    Ok(n) => n,
                    Err(err) => return Step::Exit(StepExit::Raise(err)),
                };
                let lhs = match self.pop_int() {
                    Ok(n) => n,
                    Err(err) => return Step::Exit(StepExit::Raise(err)),
                };
                let result = match op {
                    Op::Add => lhs.wrapping_add(rhs),
                    Op::Sub => lhs.wrapping_sub(rhs),
                    _ => lhs.wrapping_mul(rhs),
                };
                self.stack.push(Value::from(result));
                self.pc += 1;
            }
            Op::Work(n) => {
                let left = self.work_left.unwrap_or(n);
                if left <= 1 {
                    self.work_left = None;
                    self.pc += 1;
                } else {
                    self.work_left = Some(left - 1);
                }
            }
            Op::Jump(target) => {
                self.pc = target;
            }
            Op::JumpIfZero(target) => match self.pop_int() {
                Ok(0) => self.pc = target,
                Ok(_) => self.pc += 1,
                Err(err) => return Step::Exit(StepExit::Raise(err)),
            },
            Op::YieldTop => match self.pop() {
                Ok(value) => {
                    self.pc += 1;
                    self.awaiting_send = true;
                    return Step::Exit(StepExit::Yield(value));
                }
                Err(err) => return Step::Exit(StepExit::Raise(err)),
            },
            Op::PauseTop => match self.pop() {
                Ok(value) => {
                    self.pc += 1;
                    self.awaiting_send = true;
                    return Step::Exit(StepExit::Pause(value));
                }
                Err(err) => return Step::Exit(StepExit::Raise(err)),
            },
            Op::RaiseTop => match self.pop() {
                Ok(value) => {
                    let message = value
                        .as_str()
                        .map(str::to_owned)
                        .unwrap_or_else(|| "guest error".to_owned());
                    return Step::Exit(StepExit::Raise(GuestError::with_value(message, value)));
                }
                Err(err) => return Step::Exit(StepExit::Raise(err)),
            },
            Op::Return => match self.pop() {
                Ok(value) => return Step::Exit(StepExit::Return(value)),
                Err(err) => return Step::Exit(StepExit::Raise(err)),
            },
        }
        Step::Continue
    }
}

impl Continuation for ProgramState {
    fn resume(&mut self, scope: &mut Scope<'_>, send: Value) -> StepExit {
        if self.awaiting_send {
            self.stack.push(send);
            self.awaiting_send = false;
        }
        loop {
            match scope.tick() {
                Some(BudgetSignal::Hard) => return StepExit::HardLimit,
                Some(BudgetSignal::Soft) => return StepExit::SoftLimit,
                None => {}
            }
            let Some(op) = self.program.ops.get(self.pc).cloned() else {
                return StepExit::Return(Value::Null);
            };
            match self.exec(scope, op) {
                Step::Continue => continue,
                Step::Exit(exit) => return exit,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::Context;
    use serde_json::json;

    struct Fixture {
        ctx: Context,
    }

    impl Fixture {
        fn new() -> Self {
            let ctx = Context::create(&Config::default());
            ctx.load().unwrap();
            Self { ctx }
        }

        fn resume(&self, state: &mut ProgramState, send: Value) -> StepExit {
            let mut scope = Scope::new(&self.ctx);
            state.resume(&mut scope, send)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = self.ctx.store();
        }
    }

    #[test]
    fn arithmetic_and_return() {
        let fx = Fixture::new();
        let mut state = ProgramState::new(Program::new(vec![
            Op::Const(json!(6)),
            Op::Const(json!(7)),
            Op::Mul,
            Op::Return,
        ]));

        assert_eq!(fx.resume(&mut state, Value::Null), StepExit::Return(json!(42)));
    }

    #[test]
    fn running_off_the_end_returns_null() {
        let fx = Fixture::new();
        let mut state = ProgramState::new(Program::new(vec![Op::Const(json!(1))]));

        assert_eq!(fx.resume(&mut state, Value::Null), StepExit::Return(Value::Null));
    }

    #[test]
    fn undefined_variable_raises() {
        let fx = Fixture::new();
        let mut state = ProgramState::new(Program::new(vec![Op::Load("missing".into())]));

        match fx.resume(&mut state, Value::Null) {
            StepExit::Raise(err) => assert_eq!(err.message, "undefined variable: missing"),
            other => panic!("expected raise, got {other:?}"),
        }
    }

    #[test]
    fn countdown_loop_terminates() {
        let fx = Fixture::new();
        // n = 3; while n != 0 { n = n - 1 }; return "done"
        let mut state = ProgramState::new(Program::new(vec![
            Op::Const(json!(3)),
            Op::Assign("n".into()),
            Op::Load("n".into()),
            Op::JumpIfZero(9),
            Op::Load("n".into()),
            Op::Const(json!(1)),
            Op::Sub,
            Op::Assign("n".into()),
            Op::Jump(2),
            Op::Const(json!("done")),
            Op::Return,
        ]));

        assert_eq!(
            fx.resume(&mut state, Value::Null),
            StepExit::Return(json!("done"))
        );
        assert_eq!(fx.ctx.locals().get("n"), Some(json!(0)));
    }

    #[test]
    fn yield_injects_send_value() {
        let fx = Fixture::new();
        let mut state = ProgramState::new(Program::new(vec![
            Op::Const(json!(1)),
            Op::YieldTop,
            Op::Const(json!(1)),
            Op::Add,
            Op::Return,
        ]));

        assert_eq!(fx.resume(&mut state, Value::Null), StepExit::Yield(json!(1)));
        assert_eq!(fx.resume(&mut state, json!(2)), StepExit::Return(json!(3)));
    }

    #[test]
    fn work_suspends_under_hard_limit_and_resumes() {
        let fx = Fixture::new();
        fx.ctx.with_budget_mut(|budget| {
            budget.set_hard_limit(10);
        });
        let mut state = ProgramState::new(Program::new(vec![
            Op::Work(50),
            Op::Const(json!("finished")),
            Op::Return,
        ]));

        assert_eq!(fx.resume(&mut state, Value::Null), StepExit::HardLimit);
        let consumed = fx.ctx.budget().usage();
        assert!(consumed >= 10);

        // Lifting the limit reopens the budget period; the program picks up
        // where it stopped.
        fx.ctx.with_budget_mut(|budget| budget.set_hard_limit(0));
        assert_eq!(
            fx.resume(&mut state, Value::Null),
            StepExit::Return(json!("finished"))
        );
    }

    #[test]
    fn soft_limit_exits_once_then_execution_continues() {
        let fx = Fixture::new();
        fx.ctx.with_budget_mut(|budget| {
            budget.set_soft_limit(5);
        });
        let mut state = ProgramState::new(Program::new(vec![
            Op::Work(30),
            Op::Const(json!("ok")),
            Op::Return,
        ]));

        assert_eq!(fx.resume(&mut state, Value::Null), StepExit::SoftLimit);
        // The signal was acknowledged; without clearing it, the rest of the
        // program runs to completion.
        assert_eq!(fx.resume(&mut state, Value::Null), StepExit::Return(json!("ok")));
    }
}
