//! Fuzz target for statistic expression parsing.
//!
//! Parses arbitrary text against a small device tree; parsing may fail but
//! must never panic, and a parsed expression must evaluate.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use st_core::{Clock, CounterBehavior, Expression, Scheduler, TreeNode};

#[derive(Debug, Arbitrary)]
struct Input {
    text: String,
    increments: u8,
}

fuzz_target!(|input: Input| {
    let sched = Scheduler::new();
    let root = TreeNode::root("top", Clock::new("core", 1, &sched));
    let Ok(c0) = root.add_child(TreeNode::counter("c0", "counter", CounterBehavior::Normal)) else {
        return;
    };
    let _ = root.add_child(TreeNode::parameter("p", "parameter", 3.0));
    c0.increment(u64::from(input.increments));

    if let Ok(expr) = Expression::parse(&input.text, &root) {
        let _ = expr.evaluate();
    }
});
