//! Trigger blocks attached to reports and subreports.
//!
//! A trigger block is a small map of well-known keys to trigger expressions:
//!
//! ```yaml
//! trigger:
//!   tag: t0
//!   start: core0.rob.retired >= 1000
//!   stop: t1.stop
//!   update-cycles: 500
//! ```
//!
//! The text is kept verbatim here; the trigger engine in `st-core` parses it.

use crate::validate::{scalar_string, ValidationError, ValidationResult};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Recognized trigger keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TriggerKey {
    Tag,
    Start,
    Stop,
    UpdateCount,
    UpdateCycles,
    UpdateTime,
    UpdateWhenever,
    Whenever,
    OnDemand,
}

impl TriggerKey {
    pub const ALL: [TriggerKey; 9] = [
        TriggerKey::Tag,
        TriggerKey::Start,
        TriggerKey::Stop,
        TriggerKey::UpdateCount,
        TriggerKey::UpdateCycles,
        TriggerKey::UpdateTime,
        TriggerKey::UpdateWhenever,
        TriggerKey::Whenever,
        TriggerKey::OnDemand,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKey::Tag => "tag",
            TriggerKey::Start => "start",
            TriggerKey::Stop => "stop",
            TriggerKey::UpdateCount => "update-count",
            TriggerKey::UpdateCycles => "update-cycles",
            TriggerKey::UpdateTime => "update-time",
            TriggerKey::UpdateWhenever => "update-whenever",
            TriggerKey::Whenever => "whenever",
            TriggerKey::OnDemand => "on-demand",
        }
    }

    /// Periodic update keys; at most one may be present.
    pub fn is_periodic_update(&self) -> bool {
        matches!(
            self,
            TriggerKey::UpdateCount | TriggerKey::UpdateCycles | TriggerKey::UpdateTime
        )
    }
}

impl std::str::FromStr for TriggerKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TriggerKey::ALL
            .iter()
            .find(|k| k.as_str() == s.trim())
            .copied()
            .ok_or_else(|| format!("unknown trigger key: {}", s))
    }
}

impl std::fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Verbatim trigger text keyed by [`TriggerKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerBlock {
    entries: BTreeMap<TriggerKey, String>,
}

fn notif_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bnotif\.([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex"))
}

impl TriggerBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `trigger:` mapping.
    pub fn from_yaml(value: &serde_yaml::Value) -> ValidationResult<Self> {
        let mapping = value
            .as_mapping()
            .ok_or_else(|| ValidationError::invalid("trigger", "expected a mapping"))?;

        let mut block = TriggerBlock::new();
        for (k, v) in mapping {
            let key_text = scalar_string(k, "trigger")?;
            let key: TriggerKey =
                key_text
                    .parse()
                    .map_err(|_| ValidationError::UnknownKey {
                        key: key_text.clone(),
                        context: "trigger".to_string(),
                    })?;
            let text = scalar_string(v, key.as_str())?;
            if text.trim().is_empty() {
                return Err(ValidationError::invalid(key.as_str(), "trigger text is empty"));
            }
            block.entries.insert(key, text);
        }
        block.validate()?;
        Ok(block)
    }

    /// Builder-style insert, mostly for programmatic descriptors.
    pub fn with(mut self, key: TriggerKey, text: impl Into<String>) -> Self {
        self.entries.insert(key, text.into());
        self
    }

    pub fn validate(&self) -> ValidationResult<()> {
        let periodic: Vec<_> = self
            .entries
            .keys()
            .filter(|k| k.is_periodic_update())
            .map(|k| k.as_str())
            .collect();
        if periodic.len() > 1 {
            return Err(ValidationError::invalid(
                "trigger",
                format!("only one periodic update trigger is allowed, found {}", periodic.join(", ")),
            ));
        }
        if self.entries.contains_key(&TriggerKey::UpdateWhenever) && periodic.is_empty() {
            return Err(ValidationError::invalid(
                "update-whenever",
                "requires one of update-count, update-cycles or update-time",
            ));
        }
        Ok(())
    }

    pub fn get(&self, key: TriggerKey) -> Option<&str> {
        self.entries.get(&key).map(String::as_str)
    }

    pub fn contains(&self, key: TriggerKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn tag(&self) -> Option<&str> {
        self.get(TriggerKey::Tag).map(str::trim)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TriggerKey, &str)> {
        self.entries.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Trigger text with all whitespace removed, so equivalent spellings compare equal.
    pub fn trimmed(&self, key: TriggerKey) -> Option<String> {
        self.get(key)
            .map(|text| text.chars().filter(|c| !c.is_whitespace()).collect())
    }

    /// Notification channels referenced by the trigger text under `key`.
    pub fn notification_channels(&self, key: TriggerKey) -> Vec<String> {
        let Some(text) = self.get(key) else {
            return Vec::new();
        };
        if key == TriggerKey::OnDemand {
            let name = text.trim().trim_start_matches("notif.");
            return vec![name.to_string()];
        }
        notif_regex()
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Periodic update key present in the block, if any.
    pub fn periodic_update(&self) -> Option<(TriggerKey, &str)> {
        self.entries
            .iter()
            .find(|(k, _)| k.is_periodic_update())
            .map(|(k, v)| (*k, v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ValidationResult<TriggerBlock> {
        let value: serde_yaml::Value = serde_yaml::from_str(text).unwrap();
        TriggerBlock::from_yaml(&value)
    }

    #[test]
    fn test_parse_block() {
        let block = parse("tag: t0\nstart: core.c0 >= 5\nupdate-cycles: 10\n").unwrap();
        assert_eq!(block.tag(), Some("t0"));
        assert_eq!(block.get(TriggerKey::Start), Some("core.c0 >= 5"));
        assert_eq!(block.get(TriggerKey::UpdateCycles), Some("10"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = parse("begin: c0 >= 5\n").unwrap_err();
        assert!(matches!(err, ValidationError::UnknownKey { .. }));
    }

    #[test]
    fn test_two_periodic_updates_rejected() {
        assert!(parse("update-cycles: 10\nupdate-time: 5 ns\n").is_err());
    }

    #[test]
    fn test_update_whenever_needs_periodic() {
        assert!(parse("update-whenever: notif.go == 1\n").is_err());
        assert!(parse("update-whenever: notif.go == 1\nupdate-cycles: 2\n").is_ok());
    }

    #[test]
    fn test_trimmed_text() {
        let block = TriggerBlock::new().with(TriggerKey::Start, "  c0 >=   5 &&  notif.A == 1 ");
        assert_eq!(block.trimmed(TriggerKey::Start).unwrap(), "c0>=5&&notif.A==1");
    }

    #[test]
    fn test_notification_channels() {
        let block = TriggerBlock::new()
            .with(TriggerKey::Start, "notif.A != 99 || notif.B_2 == 1")
            .with(TriggerKey::OnDemand, "dump_now");
        assert_eq!(block.notification_channels(TriggerKey::Start), vec!["A", "B_2"]);
        assert_eq!(block.notification_channels(TriggerKey::OnDemand), vec!["dump_now"]);
        assert!(block.notification_channels(TriggerKey::Stop).is_empty());
    }
}
