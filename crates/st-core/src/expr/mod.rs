//! Arithmetic expressions over device-tree statistics.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('-' | '+') unary | primary
//! primary := number | '(' expr ')' | ident | ident '(' args ')'
//! ```
//!
//! Identifiers resolve, in order, to named constants (`pi`, `e`, `inf`,
//! `nan`), simulator variables (`ticks`, `cycles`, `freq_mhz`), bound
//! reference variables, then dotted device-tree paths. Tree paths wrap a
//! [`StatisticInstance`] so the variable carries its own window.

mod functions;
mod parser;

pub use functions::{BinaryFn, TernaryFn, UnaryFn};

use crate::sched::{Clock, Scheduler};
use crate::stat::StatisticInstance;
use crate::tree::TreeNode;
use st_common::{Error, Result, Tick, TICK_MAX};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Externally owned values an expression may read by name.
#[derive(Debug, Clone, Default)]
pub struct ReferenceVariables {
    vars: BTreeMap<String, Rc<Cell<f64>>>,
}

impl ReferenceVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, cell: Rc<Cell<f64>>) {
        self.vars.insert(name.into(), cell);
    }

    pub fn get(&self, name: &str) -> Option<&Rc<Cell<f64>>> {
        self.vars.get(name)
    }
}

/// Windowed simulator variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimVarKind {
    Ticks,
    Cycles,
    FreqMhz,
}

impl SimVarKind {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "ticks" => Some(SimVarKind::Ticks),
            "cycles" => Some(SimVarKind::Cycles),
            "freq_mhz" => Some(SimVarKind::FreqMhz),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SimVarKind::Ticks => "ticks",
            SimVarKind::Cycles => "cycles",
            SimVarKind::FreqMhz => "freq_mhz",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SimVar {
    kind: SimVarKind,
    clock: Rc<Clock>,
    start: Tick,
    end: Tick,
    accumulate: bool,
    started: bool,
}

impl SimVar {
    fn new(kind: SimVarKind, clock: Rc<Clock>) -> Self {
        let start = clock.scheduler().current_tick();
        Self {
            kind,
            clock,
            start,
            end: TICK_MAX,
            accumulate: false,
            started: false,
        }
    }

    fn evaluate(&self) -> f64 {
        let now = self.clock.scheduler().current_tick();
        let end = if self.end == TICK_MAX { now } else { self.end };
        match self.kind {
            SimVarKind::Ticks => end.saturating_sub(self.start) as f64,
            SimVarKind::Cycles => self
                .clock
                .ticks_to_cycles(end)
                .saturating_sub(self.clock.ticks_to_cycles(self.start)) as f64,
            SimVarKind::FreqMhz => self.clock.frequency_mhz(),
        }
    }

    fn start(&mut self) {
        if !(self.accumulate && self.started) {
            self.start = self.clock.scheduler().current_tick();
        }
        self.started = true;
        self.end = TICK_MAX;
    }

    fn end(&mut self) {
        self.end = self.clock.scheduler().current_tick();
    }
}

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    fn precedence(&self) -> u8 {
        match self {
            BinOp::Add | BinOp::Sub => 1,
            BinOp::Mul | BinOp::Div => 2,
        }
    }

    fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Const(f64),
    SimVar(SimVar),
    Var {
        location: String,
        si: Box<StatisticInstance>,
    },
    Ref {
        name: String,
        cell: Rc<Cell<f64>>,
    },
    Neg(Box<Node>),
    Binary {
        op: BinOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Unary {
        func: UnaryFn,
        arg: Box<Node>,
    },
    Call2 {
        func: BinaryFn,
        a: Box<Node>,
        b: Box<Node>,
    },
    Call3 {
        func: TernaryFn,
        a: Box<Node>,
        b: Box<Node>,
        c: Box<Node>,
    },
}

impl Node {
    fn evaluate(&self) -> f64 {
        match self {
            Node::Const(v) => *v,
            Node::SimVar(var) => var.evaluate(),
            Node::Var { si, .. } => si.raw_value(),
            Node::Ref { cell, .. } => cell.get(),
            Node::Neg(inner) => -inner.evaluate(),
            Node::Binary { op, lhs, rhs } => op.apply(lhs.evaluate(), rhs.evaluate()),
            Node::Unary { func, arg } => func.apply(arg.evaluate()),
            Node::Call2 { func, a, b } => func.apply(a.evaluate(), b.evaluate()),
            Node::Call3 { func, a, b, c } => func.apply(a.evaluate(), b.evaluate(), c.evaluate()),
        }
    }

    fn visit_mut(&mut self, f: &mut dyn FnMut(&mut Node) -> Result<()>) -> Result<()> {
        f(self)?;
        match self {
            Node::Neg(inner) | Node::Unary { arg: inner, .. } => inner.visit_mut(f),
            Node::Binary { lhs, rhs, .. } => {
                lhs.visit_mut(f)?;
                rhs.visit_mut(f)
            }
            Node::Call2 { a, b, .. } => {
                a.visit_mut(f)?;
                b.visit_mut(f)
            }
            Node::Call3 { a, b, c, .. } => {
                a.visit_mut(f)?;
                b.visit_mut(f)?;
                c.visit_mut(f)
            }
            Node::Const(_) | Node::SimVar(_) | Node::Var { .. } | Node::Ref { .. } => Ok(()),
        }
    }

    fn visit(&self, f: &mut dyn FnMut(&Node)) {
        f(self);
        match self {
            Node::Neg(inner) | Node::Unary { arg: inner, .. } => inner.visit(f),
            Node::Binary { lhs, rhs, .. } => {
                lhs.visit(f);
                rhs.visit(f);
            }
            Node::Call2 { a, b, .. } => {
                a.visit(f);
                b.visit(f);
            }
            Node::Call3 { a, b, c, .. } => {
                a.visit(f);
                b.visit(f);
                c.visit(f);
            }
            Node::Const(_) | Node::SimVar(_) | Node::Var { .. } | Node::Ref { .. } => {}
        }
    }
}

/// A parsed, evaluable expression.
#[derive(Clone)]
pub struct Expression {
    text: String,
    root: Node,
    scheduler: Option<Rc<Scheduler>>,
}

impl Expression {
    /// Parse `text` with paths resolved relative to `context`.
    pub fn parse(text: &str, context: &Rc<TreeNode>) -> Result<Self> {
        let mut used = Vec::new();
        Self::parse_with(text, context, &mut used, &ReferenceVariables::default())
    }

    /// Parse with an explicit already-used list (cycle detection) and bound
    /// reference variables.
    pub fn parse_with(
        text: &str,
        context: &Rc<TreeNode>,
        used: &mut Vec<Rc<TreeNode>>,
        refs: &ReferenceVariables,
    ) -> Result<Self> {
        let root = parser::Parser::new(text, context, used, refs)?.parse()?;
        Ok(Self {
            text: text.trim().to_string(),
            root,
            scheduler: context.clock().map(|c| Rc::clone(c.scheduler())),
        })
    }

    /// A constant expression.
    pub fn constant(value: f64) -> Self {
        Self {
            text: st_common::format_number(value, true, st_common::DEFAULT_DECIMAL_PLACES),
            root: Node::Const(value),
            scheduler: None,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Scheduler of the context the expression was parsed in.
    pub fn scheduler(&self) -> Option<&Rc<Scheduler>> {
        self.scheduler.as_ref()
    }

    /// Current value. Never fails; expired sources evaluate to NaN.
    pub fn evaluate(&self) -> f64 {
        self.root.evaluate()
    }

    /// Restart every variable's window.
    pub fn start(&mut self) -> Result<()> {
        self.root.visit_mut(&mut |node| match node {
            Node::SimVar(var) => {
                var.start();
                Ok(())
            }
            Node::Var { si, .. } => si.start(),
            _ => Ok(()),
        })
    }

    /// Close every variable's window.
    pub fn end(&mut self) -> Result<()> {
        self.root.visit_mut(&mut |node| match node {
            Node::SimVar(var) => {
                var.end();
                Ok(())
            }
            Node::Var { si, .. } => si.end(),
            _ => Ok(()),
        })
    }

    pub fn set_accumulate(&mut self, accumulate: bool) {
        // Infallible visitor; the Result is always Ok.
        let _ = self.root.visit_mut(&mut |node| {
            match node {
                Node::SimVar(var) => var.accumulate = accumulate,
                Node::Var { si, .. } => si.set_accumulate(accumulate),
                _ => {}
            }
            Ok(())
        });
    }

    /// Union of the clocks of every variable.
    pub fn clocks(&self) -> Vec<Rc<Clock>> {
        let mut out: Vec<Rc<Clock>> = Vec::new();
        let mut add = |clock: Rc<Clock>| {
            if !out.iter().any(|c| Rc::ptr_eq(c, &clock)) {
                out.push(clock);
            }
        };
        self.root.visit(&mut |node| match node {
            Node::SimVar(var) => add(Rc::clone(&var.clock)),
            Node::Var { si, .. } => si.clocks().into_iter().for_each(&mut add),
            _ => {}
        });
        out
    }

    /// True only if every leaf supports compression.
    pub fn supports_compression(&self) -> bool {
        let mut all = true;
        self.root.visit(&mut |node| match node {
            Node::Var { si, .. } => all &= si.supports_compression(),
            Node::Ref { .. } => all = false,
            _ => {}
        });
        all
    }

    /// Locations of the tree variables, in source order.
    pub fn variables(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.root.visit(&mut |node| {
            if let Node::Var { location, .. } = node {
                out.push(location.clone());
            }
        });
        out
    }

    /// Names of bound reference variables used.
    pub fn references(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.root.visit(&mut |node| {
            if let Node::Ref { name, .. } = node {
                out.push(name.clone());
            }
        });
        out
    }

    /// Whether any tree variable's source has been destroyed.
    pub fn has_expired_source(&self) -> bool {
        let mut expired = false;
        self.root.visit(&mut |node| {
            if let Node::Var { si, .. } = node {
                expired |= si.is_expired();
            }
        });
        expired
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression")
            .field("text", &self.text)
            .field("variables", &self.variables())
            .finish()
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Parse error helper carrying the token position.
pub(crate) fn parse_error(text: &str, pos: usize, msg: impl fmt::Display) -> Error {
    Error::parse(format!("{} at position {} in '{}'", msg, pos, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{Clock, Scheduler};
    use crate::tree::{CounterBehavior, TreeNode};

    struct Fixture {
        sched: Rc<Scheduler>,
        root: Rc<TreeNode>,
        c0: Rc<TreeNode>,
    }

    fn fixture() -> Fixture {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 2, &sched));
        let c0 = root
            .add_child(TreeNode::counter("c0", "events", CounterBehavior::Normal))
            .unwrap();
        root.add_child(TreeNode::parameter("width", "issue width", 4.0))
            .unwrap();
        Fixture { sched, root, c0 }
    }

    fn eval(f: &Fixture, text: &str) -> f64 {
        Expression::parse(text, &f.root).unwrap().evaluate()
    }

    #[test]
    fn test_precedence_and_functions() {
        let f = fixture();
        assert_eq!(eval(&f, "1 + 2 * 3"), 7.0);
        assert_eq!(eval(&f, "(1 + 2) * 3"), 9.0);
        assert_eq!(eval(&f, "-2 * -3"), 6.0);
        assert_eq!(eval(&f, "10 / 4 - 1"), 1.5);
        assert_eq!(eval(&f, "max(1, width) + min(2, 3)"), 6.0);
        assert_eq!(eval(&f, "cond(0, 1, 2)"), 2.0);
        assert_eq!(eval(&f, "ifnan(nan, 3)"), 3.0);
        assert_eq!(eval(&f, "pow(2, 10)"), 1024.0);
        assert_eq!(eval(&f, "1.5e2"), 150.0);
        assert!(eval(&f, "inf") > 1e300);
        assert!((eval(&f, "pi") - std::f64::consts::PI).abs() < 1e-12);
        assert_eq!(eval(&f, "isnan(0 / 0)"), 1.0);
    }

    #[test]
    fn test_counter_variables_are_windowed() {
        let f = fixture();
        f.c0.increment(10);
        let mut expr = Expression::parse("c0 * 2", &f.root).unwrap();
        assert_eq!(expr.evaluate(), 0.0);
        f.c0.increment(3);
        assert_eq!(expr.evaluate(), 6.0);
        expr.start().unwrap();
        assert_eq!(expr.evaluate(), 0.0);
        assert_eq!(expr.variables(), vec!["top.c0".to_string()]);
        assert!(expr.supports_compression());
        assert_eq!(expr.clocks().len(), 1);
    }

    #[test]
    fn test_sim_variables() {
        let f = fixture();
        let mut expr = Expression::parse("cycles + freq_mhz * 0", &f.root).unwrap();
        f.sched.run_until(10);
        assert_eq!(expr.evaluate(), 5.0);
        expr.start().unwrap();
        f.sched.run_until(14);
        assert_eq!(expr.evaluate(), 2.0);
        assert_eq!(eval(&f, "freq_mhz"), 500000.0);
    }

    #[test]
    fn test_reference_variables() {
        let f = fixture();
        let cell = Rc::new(Cell::new(2.5));
        let mut refs = ReferenceVariables::new();
        refs.bind("scale", Rc::clone(&cell));
        let expr = Expression::parse_with("scale * 2", &f.root, &mut Vec::new(), &refs).unwrap();
        assert_eq!(expr.evaluate(), 5.0);
        cell.set(1.0);
        assert_eq!(expr.evaluate(), 2.0);
        assert!(!expr.supports_compression());
    }

    #[test]
    fn test_parse_errors() {
        let f = fixture();
        let err = Expression::parse("1 + 2 )", &f.root).unwrap_err();
        assert!(err.to_string().contains("unparsed remainder"), "{}", err);
        let err = Expression::parse("nosuch + 1", &f.root).unwrap_err();
        assert!(err.to_string().contains("nosuch"));
        let err = Expression::parse("max(1)", &f.root).unwrap_err();
        assert!(err.to_string().contains("max"));
        assert!(Expression::parse("(1 + 2", &f.root).is_err());
        assert!(Expression::parse("", &f.root).is_err());
        assert!(Expression::parse("1 $ 2", &f.root).is_err());
    }

    #[test]
    fn test_statistic_def_cycles_are_rejected() {
        let f = fixture();
        f.root
            .add_child(TreeNode::statistic_def("a", "", "b + 1"))
            .unwrap();
        f.root
            .add_child(TreeNode::statistic_def("b", "", "a * 2"))
            .unwrap();
        f.root
            .add_child(TreeNode::statistic_def("ok", "", "c0 + width"))
            .unwrap();
        let err = Expression::parse("a", &f.root).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("top.b") && msg.contains("top.a"), "{}", msg);
        assert!(Expression::parse("ok + ok", &f.root).is_ok());
    }
}
