//! Trigger expression language.
//!
//! ```text
//! core0.rob.retired >= 1000 && notif.phase == 2
//! (t0.start || 50 ns) && fetch.stalls >= 10
//! ```
//!
//! Atoms are joined by `&&` or `||`; one group may not mix the two without
//! parentheses. `Display` renders the canonical form, and parsing the
//! canonical form yields the same expression.

use st_common::{CompareOp, Error, Result, Tick};
use std::fmt;

/// Edge of a tagged trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    Start,
    Stop,
}

impl Edge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Edge::Start => "start",
            Edge::Stop => "stop",
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of a time atom. One tick is one picosecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Ps,
    Ns,
    Us,
    Ms,
    S,
}

impl TimeUnit {
    pub fn lookup(text: &str) -> Option<Self> {
        Some(match text {
            "ps" => TimeUnit::Ps,
            "ns" => TimeUnit::Ns,
            "us" => TimeUnit::Us,
            "ms" => TimeUnit::Ms,
            "s" => TimeUnit::S,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Ps => "ps",
            TimeUnit::Ns => "ns",
            TimeUnit::Us => "us",
            TimeUnit::Ms => "ms",
            TimeUnit::S => "s",
        }
    }

    pub fn ticks_per_unit(&self) -> Tick {
        match self {
            TimeUnit::Ps => 1,
            TimeUnit::Ns => 1_000,
            TimeUnit::Us => 1_000_000,
            TimeUnit::Ms => 1_000_000_000,
            TimeUnit::S => st_common::TICKS_PER_SECOND,
        }
    }
}

/// One trigger condition.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerAtom {
    /// `<counter-path> >= <threshold>`
    Counter { path: String, threshold: u64 },
    /// `notif.<channel> <op> <value>`
    Notification { channel: String, op: CompareOp, value: f64 },
    /// `<tag>.start` / `<tag>.stop`
    Reference { tag: String, edge: Edge },
    /// `<count>` or `<clock> <count>`: cycles from arming.
    Cycles { clock: Option<String>, count: u64 },
    /// `<value> <unit>`: time from arming.
    Time { value: u64, unit: TimeUnit },
    /// `<name> <count>`: cycles when `name` is a clock, otherwise a counter
    /// advancing by `count` from arming.
    Period { name: String, count: u64 },
}

impl TriggerAtom {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerAtom::Counter { .. } | TriggerAtom::Period { .. } => TriggerKind::Counter,
            TriggerAtom::Notification { .. } => TriggerKind::Notification,
            TriggerAtom::Reference { .. } => TriggerKind::Reference,
            TriggerAtom::Cycles { .. } => TriggerKind::Cycle,
            TriggerAtom::Time { .. } => TriggerKind::Time,
        }
    }

    /// Time atom target in ticks.
    pub fn time_ticks(&self) -> Option<Tick> {
        match self {
            TriggerAtom::Time { value, unit } => Some(value.saturating_mul(unit.ticks_per_unit())),
            _ => None,
        }
    }

    fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::parse("empty trigger condition"));
        }
        if let Some(op_pos) = text.find(['=', '!', '<', '>']) {
            let lhs = text[..op_pos].trim();
            let (op, rhs) = CompareOp::strip_prefix(&text[op_pos..]).ok_or_else(|| {
                Error::parse(format!("unknown comparison operator in trigger '{}'", text))
            })?;
            let rhs = rhs.trim();
            if lhs.is_empty() {
                return Err(Error::parse(format!("trigger '{}' has nothing to compare", text)));
            }
            let value: f64 = rhs.parse().map_err(|_| {
                Error::parse(format!("trigger '{}' compares against '{}', which is not a number", text, rhs))
            })?;
            if let Some(channel) = lhs.strip_prefix("notif.") {
                if channel.is_empty() {
                    return Err(Error::parse(format!("trigger '{}' names no notification channel", text)));
                }
                return Ok(TriggerAtom::Notification {
                    channel: channel.to_string(),
                    op,
                    value,
                });
            }
            if op != CompareOp::Ge {
                return Err(Error::parse(format!(
                    "counter trigger '{}' uses '{}'; counter triggers only support '>='",
                    text,
                    op.as_str()
                )));
            }
            if value < 0.0 || value.fract() != 0.0 || !value.is_finite() {
                return Err(Error::parse(format!(
                    "counter trigger '{}' needs a non-negative integer threshold",
                    text
                )));
            }
            return Ok(TriggerAtom::Counter {
                path: lhs.to_string(),
                threshold: value as u64,
            });
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        match words.as_slice() {
            [single] => {
                if let Ok(count) = single.parse::<u64>() {
                    return Ok(TriggerAtom::Cycles { clock: None, count });
                }
                for edge in [Edge::Start, Edge::Stop] {
                    let suffix = format!(".{}", edge.as_str());
                    if let Some(tag) = single.strip_suffix(suffix.as_str()) {
                        if !tag.is_empty() {
                            return Ok(TriggerAtom::Reference {
                                tag: tag.to_string(),
                                edge,
                            });
                        }
                    }
                }
                Err(Error::parse(format!(
                    "cannot interpret trigger '{}': expected a comparison, a cycle count or '<tag>.start' / '<tag>.stop'",
                    text
                )))
            }
            [first, second] => {
                if let Ok(value) = first.parse::<u64>() {
                    let unit = TimeUnit::lookup(second).ok_or_else(|| {
                        Error::parse(format!(
                            "unknown time unit '{}' in trigger '{}' (expected ps, ns, us, ms or s)",
                            second, text
                        ))
                    })?;
                    if value == 0 {
                        return Err(Error::parse(format!("time trigger '{}' must be greater than zero", text)));
                    }
                    return Ok(TriggerAtom::Time { value, unit });
                }
                let count = second.parse::<u64>().map_err(|_| {
                    Error::parse(format!("trigger '{}': '{}' is not a count", text, second))
                })?;
                Ok(TriggerAtom::Period {
                    name: first.to_string(),
                    count,
                })
            }
            _ => Err(Error::parse(format!("cannot interpret trigger '{}'", text))),
        }
    }
}

impl fmt::Display for TriggerAtom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerAtom::Counter { path, threshold } => write!(f, "{} >= {}", path, threshold),
            TriggerAtom::Notification { channel, op, value } => {
                write!(f, "notif.{} {} {}", channel, op.as_str(), value)
            }
            TriggerAtom::Reference { tag, edge } => write!(f, "{}.{}", tag, edge),
            TriggerAtom::Cycles { clock: None, count } => write!(f, "{}", count),
            TriggerAtom::Cycles {
                clock: Some(clock),
                count,
            } => write!(f, "{} {}", clock, count),
            TriggerAtom::Time { value, unit } => write!(f, "{} {}", value, unit.as_str()),
            TriggerAtom::Period { name, count } => write!(f, "{} {}", name, count),
        }
    }
}

/// Classification used by introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Counter,
    Cycle,
    Time,
    Notification,
    Reference,
}

/// Number of atoms of each kind in an expression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerKindCounts {
    pub counter: usize,
    pub cycle: usize,
    pub time: usize,
    pub notification: usize,
    pub reference: usize,
}

/// A parsed trigger expression.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerExpr {
    Atom(TriggerAtom),
    And(Vec<TriggerExpr>),
    Or(Vec<TriggerExpr>),
}

const MIXED_OPERATORS: &str =
    "&& and || in the same expression without first grouping terms with parentheses";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Joiner {
    And,
    Or,
}

#[derive(Debug)]
enum Token {
    Open,
    Close,
    Join(Joiner),
    Text(String),
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    let flush = |current: &mut String, out: &mut Vec<Token>| {
        if !current.trim().is_empty() {
            out.push(Token::Text(current.trim().to_string()));
        }
        current.clear();
    };
    while let Some(c) = chars.next() {
        match c {
            '(' | ')' => {
                flush(&mut current, &mut out);
                out.push(if c == '(' { Token::Open } else { Token::Close });
            }
            '&' | '|' => {
                if chars.peek() != Some(&c) {
                    return Err(Error::parse(format!(
                        "single '{}' in trigger '{}'; use '{}{}'",
                        c, text, c, c
                    )));
                }
                chars.next();
                flush(&mut current, &mut out);
                out.push(Token::Join(if c == '&' { Joiner::And } else { Joiner::Or }));
            }
            _ => current.push(c),
        }
    }
    flush(&mut current, &mut out);
    Ok(out)
}

/// Structure-only tree; atoms are interpreted after the whole expression
/// is known to be well formed.
enum Raw {
    Text(String),
    Group(Option<Joiner>, Vec<Raw>),
}

struct StructureParser<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl StructureParser<'_> {
    fn group(&mut self, nested: bool) -> Result<Raw> {
        let mut terms = Vec::new();
        let mut joiner: Option<Joiner> = None;
        let mut expect_term = true;
        loop {
            let Some(tok) = self.tokens.get(self.pos) else {
                if nested {
                    return Err(Error::parse(format!("unbalanced '(' in trigger '{}'", self.text)));
                }
                break;
            };
            self.pos += 1;
            match tok {
                Token::Text(t) if expect_term => {
                    terms.push(Raw::Text(t.clone()));
                    expect_term = false;
                }
                Token::Open if expect_term => {
                    terms.push(self.group(true)?);
                    expect_term = false;
                }
                Token::Close if !expect_term && nested => break,
                Token::Close if !nested => {
                    return Err(Error::parse(format!("unbalanced ')' in trigger '{}'", self.text)));
                }
                Token::Join(j) if !expect_term => {
                    match joiner {
                        Some(prev) if prev != *j => return Err(Error::parse(MIXED_OPERATORS)),
                        _ => joiner = Some(*j),
                    }
                    expect_term = true;
                }
                _ => {
                    return Err(Error::parse(format!("malformed trigger expression '{}'", self.text)));
                }
            }
        }
        if expect_term {
            return Err(Error::parse(format!("trigger '{}' ends with an operator or is empty", self.text)));
        }
        Ok(Raw::Group(joiner, terms))
    }
}

fn build(raw: Raw) -> Result<TriggerExpr> {
    match raw {
        Raw::Text(t) => Ok(TriggerExpr::Atom(TriggerAtom::parse(&t)?)),
        Raw::Group(joiner, terms) => {
            let mut parts = terms.into_iter().map(build).collect::<Result<Vec<_>>>()?;
            if parts.len() == 1 {
                return Ok(parts.remove(0));
            }
            Ok(match joiner {
                Some(Joiner::Or) => TriggerExpr::Or(parts),
                _ => TriggerExpr::And(parts),
            })
        }
    }
}

impl TriggerExpr {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parser = StructureParser {
            text,
            tokens: tokenize(text)?,
            pos: 0,
        };
        let raw = parser.group(false)?;
        build(raw)
    }

    /// Atoms in depth-first order; positions index the truth vectors
    /// passed to `evaluate`.
    pub fn atoms(&self) -> Vec<&TriggerAtom> {
        let mut out = Vec::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<&'a TriggerAtom>) {
        match self {
            TriggerExpr::Atom(a) => out.push(a),
            TriggerExpr::And(parts) | TriggerExpr::Or(parts) => {
                for p in parts {
                    p.collect_atoms(out);
                }
            }
        }
    }

    /// Evaluate with one truth value per atom (depth-first order).
    pub fn evaluate(&self, truth: &[bool]) -> bool {
        let mut next = 0;
        self.eval_from(truth, &mut next)
    }

    fn eval_from(&self, truth: &[bool], next: &mut usize) -> bool {
        match self {
            TriggerExpr::Atom(_) => {
                let v = truth.get(*next).copied().unwrap_or(false);
                *next += 1;
                v
            }
            // Every operand is visited so atom positions stay aligned.
            TriggerExpr::And(parts) => parts
                .iter()
                .map(|p| p.eval_from(truth, next))
                .fold(true, |acc, v| acc && v),
            TriggerExpr::Or(parts) => parts
                .iter()
                .map(|p| p.eval_from(truth, next))
                .fold(false, |acc, v| acc || v),
        }
    }

    pub fn kind_counts(&self) -> TriggerKindCounts {
        let mut counts = TriggerKindCounts::default();
        for atom in self.atoms() {
            match atom.kind() {
                TriggerKind::Counter => counts.counter += 1,
                TriggerKind::Cycle => counts.cycle += 1,
                TriggerKind::Time => counts.time += 1,
                TriggerKind::Notification => counts.notification += 1,
                TriggerKind::Reference => counts.reference += 1,
            }
        }
        counts
    }

    /// Tags referenced by `<tag>.start` / `<tag>.stop` atoms.
    pub fn referenced_tags(&self) -> Vec<(String, Edge)> {
        self.atoms()
            .into_iter()
            .filter_map(|a| match a {
                TriggerAtom::Reference { tag, edge } => Some((tag.clone(), *edge)),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for TriggerExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (parts, sep) = match self {
            TriggerExpr::Atom(a) => return write!(f, "{}", a),
            TriggerExpr::And(parts) => (parts, " && "),
            TriggerExpr::Or(parts) => (parts, " || "),
        };
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                f.write_str(sep)?;
            }
            match part {
                TriggerExpr::Atom(a) => write!(f, "{}", a)?,
                group => write!(f, "({})", group)?,
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for TriggerExpr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TriggerExpr::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn atom(text: &str) -> TriggerAtom {
        TriggerAtom::parse(text).unwrap()
    }

    #[test]
    fn test_atom_forms() {
        assert_eq!(
            atom("top.core0.retired >= 100"),
            TriggerAtom::Counter {
                path: "top.core0.retired".into(),
                threshold: 100
            }
        );
        assert_eq!(
            atom("notif.A != 99"),
            TriggerAtom::Notification {
                channel: "A".into(),
                op: CompareOp::Ne,
                value: 99.0
            }
        );
        assert_eq!(
            atom("t0.stop"),
            TriggerAtom::Reference {
                tag: "t0".into(),
                edge: Edge::Stop
            }
        );
        assert_eq!(atom("250"), TriggerAtom::Cycles { clock: None, count: 250 });
        assert_eq!(
            atom("3 ns").time_ticks(),
            Some(3_000)
        );
        assert_eq!(
            atom("core_clk 10"),
            TriggerAtom::Period {
                name: "core_clk".into(),
                count: 10
            }
        );
    }

    #[test]
    fn test_counter_only_supports_ge() {
        for op in ["==", "!=", "<", "<=", ">"] {
            let err = TriggerAtom::parse(&format!("c0 {} 5", op)).unwrap_err();
            assert!(err.to_string().contains("only support '>='"), "{}", err);
        }
    }

    #[test]
    fn test_time_errors() {
        assert!(TriggerAtom::parse("0 ns").unwrap_err().to_string().contains("greater than zero"));
        assert!(TriggerAtom::parse("10 fortnights").unwrap_err().to_string().contains("unknown time unit"));
    }

    #[test]
    fn test_mixed_and_or_requires_parentheses() {
        let err = TriggerExpr::parse("A == 5 && B > 4 || C < 89").unwrap_err();
        assert!(err
            .to_string()
            .contains("&& and || in the same expression without first grouping terms with parentheses"));
        let ok = TriggerExpr::parse("(notif.A == 5 && c1 >= 4) || notif.C < 89").unwrap();
        assert!(matches!(ok, TriggerExpr::Or(ref parts) if parts.len() == 2));
    }

    #[test]
    fn test_structure_errors() {
        assert!(TriggerExpr::parse("").is_err());
        assert!(TriggerExpr::parse("c0 >= 1 &&").is_err());
        assert!(TriggerExpr::parse("(c0 >= 1").is_err());
        assert!(TriggerExpr::parse("c0 >= 1)").is_err());
        assert!(TriggerExpr::parse("c0 >= 1 & c1 >= 2").is_err());
    }

    #[test]
    fn test_evaluate_and_counts() {
        let e = TriggerExpr::parse("t0.start && (c0 >= 3 || notif.x == 1) && 5 ns").unwrap();
        assert_eq!(e.atoms().len(), 4);
        assert!(!e.evaluate(&[true, false, false, true]));
        assert!(e.evaluate(&[true, false, true, true]));
        let counts = e.kind_counts();
        assert_eq!(counts.reference, 1);
        assert_eq!(counts.counter, 1);
        assert_eq!(counts.notification, 1);
        assert_eq!(counts.time, 1);
        assert_eq!(e.referenced_tags(), vec![("t0".to_string(), Edge::Start)]);
    }

    #[test]
    fn test_display_is_canonical() {
        let e = TriggerExpr::parse("  ( c0>=3 ||notif.x==1.5)&&t0.start ").unwrap();
        assert_eq!(e.to_string(), "(c0 >= 3 || notif.x == 1.5) && t0.start");
    }

    fn arb_atom() -> impl Strategy<Value = TriggerAtom> {
        let name = "[a-z][a-z0-9_]{0,5}(\\.[a-z][a-z0-9_]{0,5}){0,2}";
        prop_oneof![
            (name, 0u64..10_000).prop_map(|(path, threshold)| TriggerAtom::Counter { path, threshold }),
            ("[A-Za-z][A-Za-z0-9_]{0,6}", 0usize..6, -1000i32..1000).prop_map(|(channel, op, v)| {
                TriggerAtom::Notification {
                    channel,
                    op: CompareOp::LEXICAL_ORDER[op],
                    value: v as f64 / 4.0,
                }
            }),
            ("[a-z][a-z0-9]{0,4}", any::<bool>()).prop_map(|(tag, start)| TriggerAtom::Reference {
                tag,
                edge: if start { Edge::Start } else { Edge::Stop }
            }),
            (0u64..1_000_000).prop_map(|count| TriggerAtom::Cycles { clock: None, count }),
            (1u64..1000, 0usize..5).prop_map(|(value, u)| TriggerAtom::Time {
                value,
                unit: [TimeUnit::Ps, TimeUnit::Ns, TimeUnit::Us, TimeUnit::Ms, TimeUnit::S][u]
            }),
        ]
    }

    fn arb_expr() -> impl Strategy<Value = TriggerExpr> {
        let leaf = arb_atom().prop_map(TriggerExpr::Atom);
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 2..4).prop_map(TriggerExpr::And),
                prop::collection::vec(inner, 2..4).prop_map(TriggerExpr::Or),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_display_reparses_to_fixed_point(expr in arb_expr()) {
            let text = expr.to_string();
            let reparsed = TriggerExpr::parse(&text).unwrap();
            prop_assert_eq!(reparsed.to_string(), text);
        }
    }
}
