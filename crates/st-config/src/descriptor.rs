//! Report descriptors.
//!
//! A descriptor binds a location pattern in the device tree to a report
//! definition, an output destination, a format and an optional trigger block:
//!
//! ```yaml
//! content:
//!   - report:
//!       pattern: top.core0
//!       def_file: core_stats.yaml
//!       dest_file: core0.csv
//!       format: csv
//!       trigger:
//!         start: top.core0.rob.retired >= 1000
//!         update-cycles: 100
//!   - report:
//!       pattern: top
//!       content:
//!         top.core0.rob.retired: retired
//!       dest_file: "1"
//! ```
//!
//! A destination of `1` means standard output.

use crate::definition::{parse_content, parse_style, ReportDefinition};
use crate::resolve::DefinitionSearchPath;
use crate::trigger_block::{TriggerBlock, TriggerKey};
use crate::validate::{scalar_string, ValidationError, ValidationResult};
use crate::STDOUT_DESTINATION;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Keys accepted inside a `report` block.
const REPORT_KEYS: &[&str] = &[
    "name",
    "pattern",
    "def_file",
    "dest_file",
    "format",
    "skip",
    "trigger",
    "style",
    "content",
    "subreport",
    "autopopulate",
];

/// Output format of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReportFormat {
    #[default]
    Csv,
    CsvCumulative,
    Json,
    JsonReduced,
    JsonDetail,
    StatsMapping,
    Text,
    /// Fixed-width record database.
    Columnar,
}

impl ReportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportFormat::Csv => "csv",
            ReportFormat::CsvCumulative => "csv_cumulative",
            ReportFormat::Json => "json",
            ReportFormat::JsonReduced => "json_reduced",
            ReportFormat::JsonDetail => "json_detail",
            ReportFormat::StatsMapping => "stats_mapping",
            ReportFormat::Text => "text",
            ReportFormat::Columnar => "columnar",
        }
    }

    /// Guess a format from the destination's extension.
    pub fn infer_from_destination(dest: &str) -> Self {
        let lower = dest.to_lowercase();
        if lower.ends_with(".csv") {
            ReportFormat::Csv
        } else if lower.ends_with(".json") {
            ReportFormat::Json
        } else if lower.ends_with(".parquet") || lower.ends_with(".db") {
            ReportFormat::Columnar
        } else {
            ReportFormat::Text
        }
    }

    /// Whether the format writes one record per report update.
    ///
    /// The structured formats are written once when the report is saved.
    pub fn supports_updates(&self) -> bool {
        matches!(
            self,
            ReportFormat::Csv | ReportFormat::CsvCumulative | ReportFormat::Columnar
        )
    }

    /// Whether statistics in reports of this format accumulate across restarts.
    pub fn is_cumulative(&self) -> bool {
        matches!(self, ReportFormat::CsvCumulative)
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(ReportFormat::Csv),
            "csv_cumulative" => Ok(ReportFormat::CsvCumulative),
            "json" => Ok(ReportFormat::Json),
            "json_reduced" => Ok(ReportFormat::JsonReduced),
            "json_detail" => Ok(ReportFormat::JsonDetail),
            "stats_mapping" => Ok(ReportFormat::StatsMapping),
            "text" | "txt" => Ok(ReportFormat::Text),
            "columnar" | "parquet" => Ok(ReportFormat::Columnar),
            other => Err(format!("unknown report format: {}", other)),
        }
    }
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Binding of (pattern, definition, destination, format) to optional triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportDescriptor {
    /// Device-tree location pattern the definition is instantiated against.
    pub pattern: String,
    pub def_file: Option<PathBuf>,
    /// Output path, or `1` for standard output.
    pub dest_file: String,
    pub format: ReportFormat,
    pub triggers: TriggerBlock,
    /// Definition given inline in the descriptor instead of via `def_file`.
    pub inline: Option<ReportDefinition>,
    pub name: Option<String>,
    pub skip: bool,
    /// Directory of the descriptor document, for resolving `def_file`.
    pub source_dir: Option<PathBuf>,
}

impl ReportDescriptor {
    pub fn new(
        pattern: impl Into<String>,
        def_file: Option<PathBuf>,
        dest_file: impl Into<String>,
        format: ReportFormat,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            def_file,
            dest_file: dest_file.into(),
            format,
            triggers: TriggerBlock::new(),
            inline: None,
            name: None,
            skip: false,
            source_dir: None,
        }
    }

    /// Descriptor with an inline definition.
    pub fn inline(
        pattern: impl Into<String>,
        definition: ReportDefinition,
        dest_file: impl Into<String>,
        format: ReportFormat,
    ) -> Self {
        let mut desc = Self::new(pattern, None, dest_file, format);
        desc.inline = Some(definition);
        desc
    }

    pub fn with_trigger(mut self, key: TriggerKey, text: impl Into<String>) -> Self {
        self.triggers = self.triggers.with(key, text);
        self
    }

    pub fn writes_to_stdout(&self) -> bool {
        self.dest_file.trim() == STDOUT_DESTINATION
    }

    /// Load or return the report definition for this descriptor.
    pub fn definition(&self, search: &DefinitionSearchPath) -> ValidationResult<ReportDefinition> {
        let mut def = if let Some(inline) = &self.inline {
            inline.clone()
        } else {
            let file = self
                .def_file
                .as_ref()
                .ok_or_else(|| ValidationError::MissingField("def_file".into()))?;
            let mut search = search.clone();
            if let Some(dir) = &self.source_dir {
                search.push_fallback(dir.clone());
            }
            let path = search.resolve(file).ok_or_else(|| {
                ValidationError::IoError(format!(
                    "definition file '{}' not found in {}",
                    file.display(),
                    search
                ))
            })?;
            debug!(path = %path.display(), "Loading report definition");
            ReportDefinition::from_file(&path)?
        };
        if let Some(name) = &self.name {
            def.name = Some(name.clone());
        }
        Ok(def)
    }

    /// Display name: explicit name, else definition name, else the pattern.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.inline.as_ref().and_then(|d| d.name.clone()))
            .unwrap_or_else(|| self.pattern.clone())
    }

    // ------------------------------------------------------------------
    // Trigger inspection
    // ------------------------------------------------------------------

    pub fn has_any_trigger(&self) -> bool {
        self.triggers.iter().any(|(k, _)| k != TriggerKey::Tag)
    }

    pub fn has_start_trigger(&self) -> bool {
        self.triggers.contains(TriggerKey::Start)
    }

    pub fn has_stop_trigger(&self) -> bool {
        self.triggers.contains(TriggerKey::Stop)
    }

    pub fn has_update_trigger(&self) -> bool {
        self.triggers.periodic_update().is_some()
            || self.triggers.contains(TriggerKey::UpdateWhenever)
    }

    pub fn has_toggle_trigger(&self) -> bool {
        self.triggers.contains(TriggerKey::Whenever)
    }

    pub fn has_on_demand_trigger(&self) -> bool {
        self.triggers.contains(TriggerKey::OnDemand)
    }

    /// Whether the start trigger listens on notification `channel`.
    pub fn has_start_trigger_on_notification(&self, channel: &str) -> bool {
        self.triggers
            .notification_channels(TriggerKey::Start)
            .iter()
            .any(|c| c == channel)
    }

    /// Whitespace-stripped text of the `key` trigger.
    pub fn trigger_text(&self, key: TriggerKey) -> Option<String> {
        self.triggers.trimmed(key)
    }

    pub fn start_notification_channel(&self) -> Option<String> {
        self.triggers
            .notification_channels(TriggerKey::Start)
            .into_iter()
            .next()
    }

    pub fn stop_notification_channel(&self) -> Option<String> {
        self.triggers
            .notification_channels(TriggerKey::Stop)
            .into_iter()
            .next()
    }

    /// Channel gating periodic updates (`update-whenever`), if any.
    pub fn update_notification_channel(&self) -> Option<String> {
        self.triggers
            .notification_channels(TriggerKey::UpdateWhenever)
            .into_iter()
            .next()
    }

    fn from_report_block(mapping: &Mapping, source_dir: Option<&Path>) -> ValidationResult<Self> {
        let mut pattern = None;
        let mut def_file = None;
        let mut dest_file = None;
        let mut format = None;
        let mut skip = false;
        let mut name = None;
        let mut inline_keys = Mapping::new();

        for (k, v) in mapping {
            let key = scalar_string(k, "report")?;
            if !REPORT_KEYS.contains(&key.as_str()) {
                return Err(ValidationError::UnknownKey {
                    key,
                    context: "report".to_string(),
                });
            }
            match key.as_str() {
                "pattern" => pattern = Some(scalar_string(v, "pattern")?),
                "def_file" => def_file = Some(PathBuf::from(scalar_string(v, "def_file")?)),
                "dest_file" => dest_file = Some(scalar_string(v, "dest_file")?),
                "format" => {
                    let text = scalar_string(v, "format")?;
                    format = Some(
                        text.parse::<ReportFormat>()
                            .map_err(|e| ValidationError::invalid("format", e))?,
                    );
                }
                "skip" => skip = parse_skip(v)?,
                "name" => name = Some(scalar_string(v, "name")?),
                _ => {
                    inline_keys.insert(k.clone(), v.clone());
                }
            }
        }

        let dest_file = dest_file.ok_or_else(|| ValidationError::MissingField("dest_file".into()))?;
        let format = format.unwrap_or_else(|| ReportFormat::infer_from_destination(&dest_file));

        // trigger/style stay with the descriptor; content-like keys form the inline definition.
        let mut triggers = TriggerBlock::new();
        if let Some(t) = inline_keys.remove("trigger") {
            triggers = TriggerBlock::from_yaml(&t)?;
        }

        let mut inline = None;
        let has_content = ["content", "subreport", "autopopulate"]
            .iter()
            .any(|k| inline_keys.contains_key(*k));
        let style = inline_keys.remove("style");
        if has_content {
            if def_file.is_some() {
                return Err(ValidationError::invalid(
                    "report",
                    "def_file and inline content are mutually exclusive",
                ));
            }
            let mut def = ReportDefinition {
                name: name.clone(),
                ..Default::default()
            };
            let mut content_map = Mapping::new();
            for (k, v) in &inline_keys {
                match k.as_str() {
                    Some("content") => def.content.extend(parse_content(v)?),
                    _ => {
                        content_map.insert(k.clone(), v.clone());
                    }
                }
            }
            if !content_map.is_empty() {
                def.content.extend(parse_content(&Value::Mapping(content_map))?);
            }
            if let Some(style) = &style {
                def.style = parse_style(style)?;
            }
            inline = Some(def);
        } else if def_file.is_none() {
            return Err(ValidationError::MissingField("def_file".into()));
        }

        let pattern = pattern
            .or_else(|| inline.as_ref().and_then(|d| d.pattern.clone()))
            .ok_or_else(|| ValidationError::MissingField("pattern".into()))?;

        Ok(Self {
            pattern,
            def_file,
            dest_file,
            format,
            triggers,
            inline,
            name,
            skip,
            source_dir: source_dir.map(Path::to_path_buf),
        })
    }
}

fn parse_skip(value: &Value) -> ValidationResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(ValidationError::invalid("skip", "expected a boolean or 0/1")),
        },
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ValidationError::invalid("skip", "expected a boolean or 0/1")),
        },
        _ => Err(ValidationError::invalid("skip", "expected a boolean or 0/1")),
    }
}

/// Parse a descriptor document. Descriptors marked `skip` are dropped.
pub fn parse_descriptors(text: &str, source_dir: Option<&Path>) -> ValidationResult<Vec<ReportDescriptor>> {
    let doc: Value = serde_yaml::from_str(text)?;
    let blocks = match &doc {
        Value::Mapping(m) => match m.get("content") {
            Some(content) => content.clone(),
            None => doc.clone(),
        },
        Value::Sequence(_) => doc.clone(),
        Value::Null => return Ok(Vec::new()),
        _ => return Err(ValidationError::ParseError("descriptor document must be a mapping".into())),
    };

    let items: Vec<Value> = match blocks {
        Value::Sequence(items) => items,
        other => vec![other],
    };

    let mut descriptors = Vec::new();
    for item in &items {
        let mapping = item
            .as_mapping()
            .ok_or_else(|| ValidationError::invalid("content", "expected report blocks"))?;
        for (k, v) in mapping {
            let key = scalar_string(k, "content")?;
            if key != "report" {
                return Err(ValidationError::UnknownKey {
                    key,
                    context: "descriptor content".to_string(),
                });
            }
            let block = v
                .as_mapping()
                .ok_or_else(|| ValidationError::invalid("report", "expected a mapping"))?;
            let desc = ReportDescriptor::from_report_block(block, source_dir)?;
            if desc.skip {
                debug!(pattern = %desc.pattern, dest = %desc.dest_file, "Skipping report descriptor");
                continue;
            }
            descriptors.push(desc);
        }
    }
    Ok(descriptors)
}

/// Load and parse a descriptor file.
pub fn load_descriptors(path: &Path) -> ValidationResult<Vec<ReportDescriptor>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ValidationError::IoError(format!("{}: {}", path.display(), e)))?;
    parse_descriptors(&text, path.parent())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
content:
  - report:
      pattern: top.core0
      def_file: core_stats.yaml
      dest_file: core0.csv
      trigger:
        start: "notif.go   == 1"
        stop: top.core0.c0 >= 100
        update-cycles: 10
  - report:
      pattern: top
      dest_file: "1"
      format: json_reduced
      content:
        top.core0.c0: c0
  - report:
      pattern: top
      def_file: unused.yaml
      dest_file: skipped.csv
      skip: 1
"#;

    #[test]
    fn test_parse_document() {
        let descs = parse_descriptors(DOC, None).unwrap();
        assert_eq!(descs.len(), 2);

        let first = &descs[0];
        assert_eq!(first.pattern, "top.core0");
        assert_eq!(first.format, ReportFormat::Csv);
        assert!(first.has_start_trigger());
        assert!(first.has_stop_trigger());
        assert!(first.has_update_trigger());
        assert!(!first.has_toggle_trigger());
        assert!(first.has_start_trigger_on_notification("go"));
        assert!(!first.has_start_trigger_on_notification("stop"));
        assert_eq!(first.trigger_text(TriggerKey::Start).as_deref(), Some("notif.go==1"));
        assert_eq!(first.start_notification_channel().as_deref(), Some("go"));
        assert_eq!(first.stop_notification_channel(), None);

        let second = &descs[1];
        assert!(second.writes_to_stdout());
        assert_eq!(second.format, ReportFormat::JsonReduced);
        assert!(second.inline.is_some());
        assert!(!second.has_any_trigger());
    }

    #[test]
    fn test_missing_dest_file() {
        let err = parse_descriptors("content:\n  report:\n    pattern: top\n    def_file: a.yaml\n", None)
            .unwrap_err();
        assert!(matches!(err, ValidationError::MissingField(ref f) if f == "dest_file"));
    }

    #[test]
    fn test_def_file_and_inline_conflict() {
        let doc = "content:\n  report:\n    pattern: top\n    def_file: a.yaml\n    dest_file: x.csv\n    content:\n      c0: c0\n";
        assert!(parse_descriptors(doc, None).is_err());
    }

    #[test]
    fn test_format_inference() {
        assert_eq!(ReportFormat::infer_from_destination("out.JSON"), ReportFormat::Json);
        assert_eq!(ReportFormat::infer_from_destination("stats.parquet"), ReportFormat::Columnar);
        assert_eq!(ReportFormat::infer_from_destination("1"), ReportFormat::Text);
        assert!("csv_cumulative".parse::<ReportFormat>().unwrap().is_cumulative());
        assert!("yaml".parse::<ReportFormat>().is_err());
    }

    #[test]
    fn test_update_support() {
        assert!(ReportFormat::Csv.supports_updates());
        assert!(ReportFormat::Columnar.supports_updates());
        assert!(!ReportFormat::Json.supports_updates());
    }
}
