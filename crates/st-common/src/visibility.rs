//! Visibility levels and statistic classes.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How prominently a counter, parameter or statistic should be reported.
///
/// Levels are ordered; autopopulation and reduced output filter on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Hidden,
    Support,
    Detail,
    #[default]
    Normal,
    Summary,
    Critical,
}

impl Visibility {
    /// All levels in ascending order.
    pub const ALL: [Visibility; 6] = [
        Visibility::Hidden,
        Visibility::Support,
        Visibility::Detail,
        Visibility::Normal,
        Visibility::Summary,
        Visibility::Critical,
    ];

    /// Numeric level written into structured documents.
    pub fn level(&self) -> u32 {
        match self {
            Visibility::Hidden => 0,
            Visibility::Support => 1000,
            Visibility::Detail => 2000,
            Visibility::Normal => 3000,
            Visibility::Summary => 4000,
            Visibility::Critical => 5000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Hidden => "hidden",
            Visibility::Support => "support",
            Visibility::Detail => "detail",
            Visibility::Normal => "normal",
            Visibility::Summary => "summary",
            Visibility::Critical => "critical",
        }
    }

    /// Map a stored numeric level back to the nearest named level at or below it.
    pub fn from_level(level: u32) -> Self {
        Visibility::ALL
            .iter()
            .rev()
            .find(|v| v.level() <= level)
            .copied()
            .unwrap_or(Visibility::Hidden)
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hidden" => Ok(Visibility::Hidden),
            "support" => Ok(Visibility::Support),
            "detail" => Ok(Visibility::Detail),
            "normal" => Ok(Visibility::Normal),
            "summary" => Ok(Visibility::Summary),
            "critical" => Ok(Visibility::Critical),
            other => Err(format!("unknown visibility level: {}", other)),
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Statistic class: the framework default or a user-defined tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatClass {
    #[default]
    Default,
    User(String),
}

impl StatClass {
    pub fn as_str(&self) -> &str {
        match self {
            StatClass::Default => "default",
            StatClass::User(name) => name,
        }
    }
}

impl std::fmt::Display for StatClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(Visibility::Hidden < Visibility::Support);
        assert!(Visibility::Summary < Visibility::Critical);
        assert_eq!(Visibility::Normal.level(), 3000);
    }

    #[test]
    fn test_parse_round_trip() {
        for vis in Visibility::ALL {
            assert_eq!(vis.as_str().parse::<Visibility>().unwrap(), vis);
        }
        assert!("loud".parse::<Visibility>().is_err());
    }

    #[test]
    fn test_from_level_snaps_down() {
        assert_eq!(Visibility::from_level(3500), Visibility::Normal);
        assert_eq!(Visibility::from_level(0), Visibility::Hidden);
        assert_eq!(Visibility::from_level(99_999), Visibility::Critical);
    }

    #[test]
    fn test_class_display() {
        assert_eq!(StatClass::Default.to_string(), "default");
        assert_eq!(StatClass::User("power".into()).to_string(), "power");
    }
}
