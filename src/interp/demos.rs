//! Named demo programs for the CLI host.
//!
//! Each demo is a small op-list program exercising one scheduler behavior:
//! completion, yielding, guest pauses, budget exhaustion, guest errors.

use serde_json::json;

use super::machine::{Op, Program};

/// A named demo program with a one-line description.
pub struct Demo {
    pub name: &'static str,
    pub description: &'static str,
    build: fn() -> Program,
}

impl Demo {
    pub fn program(&self) -> Program {
        (self.build)()
    }
}

/// All demos, in listing order.
pub fn all() -> &'static [Demo] {
    DEMOS
}

/// Look a demo up by name.
pub fn by_name(name: &str) -> Option<&'static Demo> {
    DEMOS.iter().find(|demo| demo.name == name)
}

static DEMOS: &[Demo] = &[
    Demo {
        name: "answer",
        description: "returns 42 immediately",
        build: answer,
    },
    Demo {
        name: "yielder",
        description: "yields 1, yields send+1, returns the last send value",
        build: yielder,
    },
    Demo {
        name: "pauser",
        description: "pauses with \"checkpoint\", returns the send value",
        build: pauser,
    },
    Demo {
        name: "counter",
        description: "counts down from 25 doing a unit of work per round",
        build: counter,
    },
    Demo {
        name: "spinner",
        description: "loops forever; pair with --hard-limit",
        build: spinner,
    },
    Demo {
        name: "faulty",
        description: "raises a guest error",
        build: faulty,
    },
];

fn answer() -> Program {
    Program::new(vec![Op::Const(json!(42)), Op::Return])
}

fn yielder() -> Program {
    Program::new(vec![
        Op::Const(json!(1)),
        Op::YieldTop,
        // send value is on the stack
        Op::Const(json!(1)),
        Op::Add,
        Op::YieldTop,
        Op::Return,
    ])
}

fn pauser() -> Program {
    Program::new(vec![
        Op::Const(json!("checkpoint")),
        Op::PauseTop,
        Op::Return,
    ])
}

fn counter() -> Program {
    Program::new(vec![
        Op::Const(json!(25)),
        Op::Assign("n".into()),
        // loop head
        Op::Load("n".into()),
        Op::JumpIfZero(10),
        Op::Work(4),
        Op::Load("n".into()),
        Op::Const(json!(1)),
        Op::Sub,
        Op::Assign("n".into()),
        Op::Jump(2),
        // loop exit
        Op::Const(json!("done")),
        Op::Return,
    ])
}

fn spinner() -> Program {
    Program::new(vec![Op::Jump(0)])
}

fn faulty() -> Program {
    Program::new(vec![Op::Const(json!("boom")), Op::RaiseTop])
}
