//! Comparison operators shared by trigger atoms and visibility filters.

use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Operators in the order a tokenizer must try them (two-character forms first).
    pub const LEXICAL_ORDER: [CompareOp; 6] = [
        CompareOp::Eq,
        CompareOp::Ne,
        CompareOp::Le,
        CompareOp::Ge,
        CompareOp::Lt,
        CompareOp::Gt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    pub fn apply<T: PartialOrd>(&self, lhs: T, rhs: T) -> bool {
        match self {
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Le => lhs <= rhs,
            CompareOp::Gt => lhs > rhs,
            CompareOp::Ge => lhs >= rhs,
        }
    }

    /// Split a leading operator off `text`, returning the operator and the rest.
    pub fn strip_prefix(text: &str) -> Option<(CompareOp, &str)> {
        CompareOp::LEXICAL_ORDER
            .iter()
            .find_map(|op| text.strip_prefix(op.as_str()).map(|rest| (*op, rest)))
    }
}

impl FromStr for CompareOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "==" => Ok(CompareOp::Eq),
            "!=" => Ok(CompareOp::Ne),
            "<" => Ok(CompareOp::Lt),
            "<=" => Ok(CompareOp::Le),
            ">" => Ok(CompareOp::Gt),
            ">=" => Ok(CompareOp::Ge),
            other => Err(format!("unknown comparison operator: {}", other)),
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply() {
        assert!(CompareOp::Ge.apply(5, 5));
        assert!(!CompareOp::Gt.apply(5, 5));
        assert!(CompareOp::Ne.apply(54.0, 99.0));
    }

    #[test]
    fn test_strip_prefix_prefers_two_char_ops() {
        let (op, rest) = CompareOp::strip_prefix(">= 10").unwrap();
        assert_eq!(op, CompareOp::Ge);
        assert_eq!(rest, " 10");
        let (op, _) = CompareOp::strip_prefix("<3").unwrap();
        assert_eq!(op, CompareOp::Lt);
        assert!(CompareOp::strip_prefix("=3").is_none());
    }
}
