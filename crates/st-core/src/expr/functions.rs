//! Built-in expression functions.

/// Arity-1 functions. Predicates return 1.0 / 0.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryFn {
    Abs,
    Sqrt,
    Floor,
    Ceil,
    Round,
    Log,
    Log2,
    Log10,
    Exp,
    IsNan,
    IsInf,
}

impl UnaryFn {
    pub fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "abs" => UnaryFn::Abs,
            "sqrt" => UnaryFn::Sqrt,
            "floor" => UnaryFn::Floor,
            "ceil" => UnaryFn::Ceil,
            "round" => UnaryFn::Round,
            "log" => UnaryFn::Log,
            "log2" => UnaryFn::Log2,
            "log10" => UnaryFn::Log10,
            "exp" => UnaryFn::Exp,
            "isnan" => UnaryFn::IsNan,
            "isinf" => UnaryFn::IsInf,
            _ => return None,
        })
    }

    pub fn apply(&self, x: f64) -> f64 {
        match self {
            UnaryFn::Abs => x.abs(),
            UnaryFn::Sqrt => x.sqrt(),
            UnaryFn::Floor => x.floor(),
            UnaryFn::Ceil => x.ceil(),
            UnaryFn::Round => x.round(),
            UnaryFn::Log => x.ln(),
            UnaryFn::Log2 => x.log2(),
            UnaryFn::Log10 => x.log10(),
            UnaryFn::Exp => x.exp(),
            UnaryFn::IsNan => bool_value(x.is_nan()),
            UnaryFn::IsInf => bool_value(x.is_infinite()),
        }
    }
}

/// Arity-2 functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFn {
    Min,
    Max,
    Pow,
    Fmod,
    /// `ifnan(x, fallback)`
    IfNan,
}

impl BinaryFn {
    pub fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "min" => BinaryFn::Min,
            "max" => BinaryFn::Max,
            "pow" => BinaryFn::Pow,
            "fmod" => BinaryFn::Fmod,
            "ifnan" => BinaryFn::IfNan,
            _ => return None,
        })
    }

    pub fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            BinaryFn::Min => a.min(b),
            BinaryFn::Max => a.max(b),
            BinaryFn::Pow => a.powf(b),
            BinaryFn::Fmod => a % b,
            BinaryFn::IfNan => {
                if a.is_nan() {
                    b
                } else {
                    a
                }
            }
        }
    }
}

/// Arity-3 functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TernaryFn {
    /// `cond(c, a, b)`: `a` when `c` is non-zero, else `b`.
    Cond,
}

impl TernaryFn {
    pub fn lookup(name: &str) -> Option<Self> {
        match name {
            "cond" => Some(TernaryFn::Cond),
            _ => None,
        }
    }

    pub fn apply(&self, c: f64, a: f64, b: f64) -> f64 {
        match self {
            TernaryFn::Cond => {
                if c != 0.0 && !c.is_nan() {
                    a
                } else {
                    b
                }
            }
        }
    }
}

fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Arity of a function name, if it is a built-in.
pub(crate) fn arity(name: &str) -> Option<usize> {
    if UnaryFn::lookup(name).is_some() {
        Some(1)
    } else if BinaryFn::lookup(name).is_some() {
        Some(2)
    } else if TernaryFn::lookup(name).is_some() {
        Some(3)
    } else {
        None
    }
}

/// Named constants.
pub(crate) fn constant(name: &str) -> Option<f64> {
    match name {
        "pi" => Some(std::f64::consts::PI),
        "e" => Some(std::f64::consts::E),
        "inf" => Some(f64::INFINITY),
        "nan" => Some(f64::NAN),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_arity() {
        assert_eq!(arity("sqrt"), Some(1));
        assert_eq!(arity("fmod"), Some(2));
        assert_eq!(arity("cond"), Some(3));
        assert_eq!(arity("c0"), None);
    }

    #[test]
    fn test_nan_handling() {
        assert_eq!(BinaryFn::IfNan.apply(f64::NAN, 7.0), 7.0);
        assert_eq!(BinaryFn::IfNan.apply(1.0, 7.0), 1.0);
        assert_eq!(TernaryFn::Cond.apply(f64::NAN, 1.0, 2.0), 2.0);
        assert_eq!(UnaryFn::IsInf.apply(f64::NEG_INFINITY), 1.0);
    }
}
