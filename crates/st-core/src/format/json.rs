//! Structured documents: `json`, `json_reduced`, `json_detail` and
//! `stats_mapping`.
//!
//! Written once at finish. Report objects carry an `ordered_keys` array
//! because object keys are emitted sorted.

use super::{grouped_members, json_number, member_key, Destination, FormatContext, ReportFormatter};
use crate::report::{Report, Style, STYLE_OMIT_ZERO_VALUES};
use crate::stat::StatisticInstance;
use serde_json::{json, Map, Value};
use st_common::{Result, Visibility};
use st_config::ReportFormat;

/// Version tag written under `siminfo.json_report_version`.
pub const JSON_REPORT_VERSION: &str = "2.1";

/// Level of detail per statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonStyle {
    /// `{desc, vis, val}` per statistic; grouped context counters.
    Full,
    /// Bare values; zeros dropped when `omit_zero_values` is set.
    Reduced,
    /// Full metadata per statistic; context-counter members are not repeated.
    Detail,
}

pub struct JsonFormatter {
    dest: Destination,
    style: JsonStyle,
}

impl JsonFormatter {
    pub fn new(dest: &str, style: JsonStyle) -> Self {
        Self {
            dest: Destination::parse(dest),
            style,
        }
    }

    /// The complete document for `report`.
    pub fn document(&self, report: &Report, ctx: &FormatContext) -> Result<Value> {
        let stats = self.report_value(report, &Style::new())?;
        let vis: Map<String, Value> = Visibility::ALL
            .iter()
            .map(|v| (v.as_str().to_string(), json!(v.level())))
            .collect();
        Ok(json!({
            "report_metadata": metadata_value(report, ctx),
            "siminfo": siminfo_value(ctx),
            "vis": vis,
            "Statistics": { report.name(): stats },
        }))
    }

    fn stat_value(&self, si: &StatisticInstance) -> Result<Value> {
        let val = json_number(si.get_value()?);
        Ok(match self.style {
            JsonStyle::Reduced => val,
            JsonStyle::Full => json!({
                "desc": si.desc(),
                "vis": si.visibility().level(),
                "val": val,
            }),
            JsonStyle::Detail => json!({
                "desc": si.desc(),
                "vis": si.visibility().level(),
                "class": si.class().as_str(),
                "location": si.location(),
                "expression": si.expression_string(),
                "start_tick": si.start_tick(),
                "val": val,
            }),
        })
    }

    fn report_value(&self, report: &Report, inherited: &Style) -> Result<Value> {
        let style = report.effective_style(inherited);
        let omit_zero = self.style == JsonStyle::Reduced && Report::style_flag(&style, STYLE_OMIT_ZERO_VALUES);
        let printed = grouped_members(report);
        let groups = report.context_groups();
        let stats = report.statistics();

        let mut obj = Map::new();
        let mut ordered = Vec::new();
        for (idx, stat) in stats.iter().enumerate() {
            if printed.contains(&idx) {
                continue;
            }
            let value = match (self.style, groups.get(&idx)) {
                (JsonStyle::Full | JsonStyle::Reduced, Some(members)) => {
                    let mut group = Map::new();
                    let mut keys = Vec::new();
                    for m in members {
                        let member = &stats[*m];
                        let key = member_key(&stat.name, &member.name).to_string();
                        group.insert(key.clone(), self.stat_value(&member.si)?);
                        keys.push(Value::String(key));
                    }
                    group.insert("agg".to_string(), self.stat_value(&stat.si)?);
                    if self.style == JsonStyle::Full {
                        keys.push(Value::String("agg".into()));
                        group.insert("ordered_keys".to_string(), Value::Array(keys));
                    }
                    Value::Object(group)
                }
                _ => {
                    let value = self.stat_value(&stat.si)?;
                    if omit_zero && value.as_f64() == Some(0.0) {
                        continue;
                    }
                    value
                }
            };
            obj.insert(stat.name.clone(), value);
            ordered.push(Value::String(stat.name.clone()));
        }
        for sub in report.subreports() {
            obj.insert(sub.name().to_string(), self.report_value(sub, &style)?);
            ordered.push(Value::String(sub.name().to_string()));
        }
        obj.insert("ordered_keys".to_string(), Value::Array(ordered));
        Ok(Value::Object(obj))
    }
}

impl ReportFormatter for JsonFormatter {
    fn format(&self) -> ReportFormat {
        match self.style {
            JsonStyle::Full => ReportFormat::Json,
            JsonStyle::Reduced => ReportFormat::JsonReduced,
            JsonStyle::Detail => ReportFormat::JsonDetail,
        }
    }

    fn write_header(&mut self, _report: &Report, _ctx: &FormatContext) -> Result<()> {
        Ok(())
    }

    fn write_update(&mut self, _report: &Report, _ctx: &FormatContext) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, report: &Report, ctx: &FormatContext) -> Result<()> {
        let doc = self.document(report, ctx)?;
        let mut text = serde_json::to_string_pretty(&doc)?;
        text.push('\n');
        self.dest.write_all(&text)
    }
}

/// Two maps between column headers and statistic locations.
pub struct StatsMappingFormatter {
    dest: Destination,
}

impl StatsMappingFormatter {
    pub fn new(dest: &str) -> Self {
        Self {
            dest: Destination::parse(dest),
        }
    }

    pub fn document(&self, report: &Report, ctx: &FormatContext) -> Value {
        let mut to_location = Map::new();
        let mut to_header = Map::new();
        for (header, si) in report.flatten() {
            to_location.insert(header.clone(), Value::String(si.location().to_string()));
            to_header.insert(si.location().to_string(), Value::String(header));
        }
        json!({
            "Column-header-to-StatisticInstance": to_location,
            "StatisticInstance-to-Column-header": to_header,
            "siminfo": siminfo_value(ctx),
        })
    }
}

impl ReportFormatter for StatsMappingFormatter {
    fn format(&self) -> ReportFormat {
        ReportFormat::StatsMapping
    }

    fn write_header(&mut self, _report: &Report, _ctx: &FormatContext) -> Result<()> {
        Ok(())
    }

    fn write_update(&mut self, _report: &Report, _ctx: &FormatContext) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, report: &Report, ctx: &FormatContext) -> Result<()> {
        let mut text = serde_json::to_string_pretty(&self.document(report, ctx))?;
        text.push('\n');
        self.dest.write_all(&text)
    }
}

fn siminfo_value(ctx: &FormatContext) -> Value {
    let info = &ctx.siminfo;
    json!({
        "name": info.name,
        "sim_version": info.sim_version,
        "sparta_version": info.framework_version,
        "json_report_version": JSON_REPORT_VERSION,
        "reproduction": info.reproduction,
    })
}

fn metadata_value(report: &Report, ctx: &FormatContext) -> Value {
    let mut meta: Map<String, Value> = ctx
        .metadata
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    meta.insert("report_name".into(), Value::String(report.name().to_string()));
    meta.insert("start_tick".into(), Value::String(report.start_tick().to_string()));
    meta.insert("end_tick".into(), Value::String(report.end_tick().to_string()));
    if let Some(info) = report.info() {
        meta.insert("info".into(), Value::String(info.to_string()));
    }
    Value::Object(meta)
}
