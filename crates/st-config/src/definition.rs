//! Report definition documents.
//!
//! A definition lists what a report contains, relative to a context node in
//! the simulator's device tree:
//!
//! ```yaml
//! name: Core Stats
//! style:
//!   decimal_places: 3
//! content:
//!   top.core*:                      # context; wildcards capture %1..%N
//!     rob.retired: retired_%1       # "<expression>": "<statistic name>"
//!     "rob.retired / cycles": ipc_%1
//!     subreport:
//!       name: Fetch %1
//!       trigger:
//!         start: fetch.stalls >= 10
//!       content:
//!         fetch.stalls: stalls
//!     autopopulate:
//!       attributes: "!=vis:hidden && >=vis:normal"
//! ```
//!
//! Mapping order is preserved; it determines column order in every output.

use crate::trigger_block::TriggerBlock;
use crate::validate::{scalar_string, ValidationError, ValidationResult};
use serde_yaml::{Mapping, Value};
use st_common::{CompareOp, Visibility};
use std::collections::BTreeMap;
use std::path::Path;

/// Top-level definition keys.
const DEFINITION_KEYS: &[&str] = &["name", "style", "pattern", "trigger", "content"];

/// A parsed report definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportDefinition {
    pub name: Option<String>,
    pub style: BTreeMap<String, String>,
    /// Default context pattern when no descriptor supplies one.
    pub pattern: Option<String>,
    pub trigger: Option<TriggerBlock>,
    pub content: Vec<ContentEntry>,
}

/// One entry of a `content` block.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentEntry {
    /// A statistic expression with an optional display name.
    Stat {
        expression: String,
        name: Option<String>,
    },
    /// A nested context: entries resolve relative to `location`.
    Context {
        location: String,
        entries: Vec<ContentEntry>,
    },
    Subreport(SubreportDef),
    Autopopulate(AutopopulateDef),
}

/// A `subreport` block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubreportDef {
    pub name: String,
    pub style: BTreeMap<String, String>,
    pub trigger: Option<TriggerBlock>,
    pub content: Vec<ContentEntry>,
}

/// An `autopopulate` block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutopopulateDef {
    pub filter: VisibilityFilter,
    /// Maximum device-tree depth walked below the context.
    pub max_recursion_depth: Option<u32>,
    /// Maximum subreport nesting created while walking.
    pub max_report_depth: Option<u32>,
}

/// One `<op>vis:<level>` term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityTerm {
    pub op: CompareOp,
    pub level: Visibility,
}

/// Conjunction of visibility terms, e.g. `!=vis:hidden && >=vis:normal`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityFilter {
    pub terms: Vec<VisibilityTerm>,
}

impl Default for VisibilityFilter {
    fn default() -> Self {
        Self {
            terms: vec![VisibilityTerm {
                op: CompareOp::Ge,
                level: Visibility::Normal,
            }],
        }
    }
}

impl VisibilityFilter {
    /// Parse an `attributes` string.
    pub fn parse(text: &str) -> ValidationResult<Self> {
        let mut terms = Vec::new();
        for raw in text.split("&&") {
            let term = raw.trim();
            if term.is_empty() {
                return Err(ValidationError::invalid("attributes", "empty term"));
            }
            let (op, rest) = CompareOp::strip_prefix(term).ok_or_else(|| {
                ValidationError::invalid(
                    "attributes",
                    format!("term '{}' must start with a comparison operator", term),
                )
            })?;
            let level_text = rest.trim().strip_prefix("vis:").ok_or_else(|| {
                ValidationError::invalid(
                    "attributes",
                    format!("term '{}' must compare against vis:<level>", term),
                )
            })?;
            let level: Visibility = level_text
                .parse()
                .map_err(|e: String| ValidationError::invalid("attributes", e))?;
            terms.push(VisibilityTerm { op, level });
        }
        Ok(Self { terms })
    }

    pub fn matches(&self, vis: Visibility) -> bool {
        self.terms.iter().all(|t| t.op.apply(vis, t.level))
    }
}

/// Replace `%1`..`%N` with the captured wildcard groups.
///
/// Higher indices are substituted first so `%12` is not read as `%1` + `2`.
pub fn apply_replacements(text: &str, replacements: &[String]) -> String {
    let mut out = text.to_string();
    for (idx, value) in replacements.iter().enumerate().rev() {
        out = out.replace(&format!("%{}", idx + 1), value);
    }
    out
}

impl ReportDefinition {
    /// Parse a definition from YAML text.
    pub fn from_yaml_str(text: &str) -> ValidationResult<Self> {
        let value: Value = serde_yaml::from_str(text)?;
        Self::from_value(&value)
    }

    /// Load a definition file.
    pub fn from_file(path: &Path) -> ValidationResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ValidationError::IoError(format!("{}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_value(value: &Value) -> ValidationResult<Self> {
        let mapping = value
            .as_mapping()
            .ok_or_else(|| ValidationError::ParseError("definition must be a mapping".into()))?;
        Self::from_mapping(mapping, DEFINITION_KEYS, "definition")
    }

    /// Parse the definition keys of `mapping`, rejecting any key outside `allowed`.
    pub(crate) fn from_mapping(
        mapping: &Mapping,
        allowed: &[&str],
        context: &str,
    ) -> ValidationResult<Self> {
        let mut def = ReportDefinition::default();
        for (k, v) in mapping {
            let key = scalar_string(k, context)?;
            if !allowed.contains(&key.as_str()) {
                return Err(ValidationError::UnknownKey {
                    key,
                    context: context.to_string(),
                });
            }
            match key.as_str() {
                "name" => def.name = Some(scalar_string(v, "name")?),
                "style" => def.style = parse_style(v)?,
                "pattern" => def.pattern = Some(scalar_string(v, "pattern")?),
                "trigger" => def.trigger = Some(TriggerBlock::from_yaml(v)?),
                "content" => def.content = parse_content(v)?,
                // Remaining allowed keys belong to the caller (descriptor fields).
                _ => {}
            }
        }
        Ok(def)
    }

    /// Count statistic entries, including those in nested contexts and subreports.
    pub fn stat_count(&self) -> usize {
        fn count(entries: &[ContentEntry]) -> usize {
            entries
                .iter()
                .map(|e| match e {
                    ContentEntry::Stat { .. } => 1,
                    ContentEntry::Context { entries, .. } => count(entries),
                    ContentEntry::Subreport(sr) => count(&sr.content),
                    ContentEntry::Autopopulate(_) => 0,
                })
                .sum()
        }
        count(&self.content)
    }
}

pub(crate) fn parse_style(value: &Value) -> ValidationResult<BTreeMap<String, String>> {
    let mapping = value
        .as_mapping()
        .ok_or_else(|| ValidationError::invalid("style", "expected a mapping"))?;
    let mut style = BTreeMap::new();
    for (k, v) in mapping {
        style.insert(scalar_string(k, "style")?, scalar_string(v, "style")?);
    }
    Ok(style)
}

pub(crate) fn parse_content(value: &Value) -> ValidationResult<Vec<ContentEntry>> {
    match value {
        Value::Mapping(mapping) => parse_content_mapping(mapping),
        Value::Sequence(items) => {
            let mut entries = Vec::new();
            for item in items {
                entries.extend(parse_content(item)?);
            }
            Ok(entries)
        }
        Value::Null => Ok(Vec::new()),
        _ => Err(ValidationError::invalid("content", "expected a mapping or sequence")),
    }
}

fn parse_content_mapping(mapping: &Mapping) -> ValidationResult<Vec<ContentEntry>> {
    let mut entries = Vec::new();
    for (k, v) in mapping {
        let key = scalar_string(k, "content")?;
        match key.as_str() {
            "subreport" => match v {
                Value::Sequence(items) => {
                    for item in items {
                        entries.push(ContentEntry::Subreport(parse_subreport(item)?));
                    }
                }
                _ => entries.push(ContentEntry::Subreport(parse_subreport(v)?)),
            },
            "autopopulate" => entries.push(ContentEntry::Autopopulate(parse_autopopulate(v)?)),
            _ => match v {
                Value::Mapping(_) | Value::Sequence(_) => entries.push(ContentEntry::Context {
                    location: key,
                    entries: parse_content(v)?,
                }),
                Value::Null => entries.push(ContentEntry::Stat {
                    expression: key,
                    name: None,
                }),
                _ => {
                    let name = scalar_string(v, &key)?;
                    entries.push(ContentEntry::Stat {
                        expression: key,
                        name: if name.trim().is_empty() { None } else { Some(name) },
                    });
                }
            },
        }
    }
    Ok(entries)
}

fn parse_subreport(value: &Value) -> ValidationResult<SubreportDef> {
    let mapping = value
        .as_mapping()
        .ok_or_else(|| ValidationError::invalid("subreport", "expected a mapping"))?;
    let mut def = SubreportDef::default();
    let mut named = false;
    for (k, v) in mapping {
        let key = scalar_string(k, "subreport")?;
        match key.as_str() {
            "name" => {
                def.name = scalar_string(v, "name")?;
                named = true;
            }
            "style" => def.style = parse_style(v)?,
            "trigger" => def.trigger = Some(TriggerBlock::from_yaml(v)?),
            "content" => def.content = parse_content(v)?,
            _ => {
                return Err(ValidationError::UnknownKey {
                    key,
                    context: "subreport".to_string(),
                })
            }
        }
    }
    if !named || def.name.trim().is_empty() {
        return Err(ValidationError::MissingField("subreport.name".into()));
    }
    Ok(def)
}

fn parse_autopopulate(value: &Value) -> ValidationResult<AutopopulateDef> {
    let mut def = AutopopulateDef::default();
    match value {
        Value::Bool(true) | Value::Null => {}
        Value::String(attrs) => def.filter = VisibilityFilter::parse(attrs)?,
        Value::Mapping(mapping) => {
            for (k, v) in mapping {
                let key = scalar_string(k, "autopopulate")?;
                match key.as_str() {
                    "attributes" => {
                        def.filter = VisibilityFilter::parse(&scalar_string(v, "attributes")?)?
                    }
                    "max_recursion_depth" => def.max_recursion_depth = Some(parse_u32(v, &key)?),
                    "max_report_depth" => def.max_report_depth = Some(parse_u32(v, &key)?),
                    _ => {
                        return Err(ValidationError::UnknownKey {
                            key,
                            context: "autopopulate".to_string(),
                        })
                    }
                }
            }
        }
        _ => {
            return Err(ValidationError::invalid(
                "autopopulate",
                "expected true, an attributes string or a mapping",
            ))
        }
    }
    Ok(def)
}

fn parse_u32(value: &Value, field: &str) -> ValidationResult<u32> {
    scalar_string(value, field)?
        .trim()
        .parse()
        .map_err(|_| ValidationError::invalid(field, "expected a non-negative integer"))
}
