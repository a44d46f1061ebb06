//! Descriptor loading against real files on disk.
//!
//! Covers:
//! - def_file resolution through the descriptor directory and SIMTEL_REPORT_DEF_PATH
//! - Inline definitions with subreports and autopopulate at report-block level
//! - Skipped descriptors

use st_config::resolve::{DefinitionSource, ENV_REPORT_DEF_PATH};
use st_config::{
    load_descriptors, ContentEntry, DefinitionSearchPath, ReportFormat, TriggerKey,
    ValidationError,
};
use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tempfile::TempDir;

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

struct EnvGuard {
    key: &'static str,
    saved: Option<String>,
}

impl EnvGuard {
    fn new(key: &'static str) -> Self {
        Self {
            key,
            saved: env::var(key).ok(),
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.saved {
            Some(val) => env::set_var(self.key, val),
            None => env::remove_var(self.key),
        }
    }
}

fn with_env_lock<T>(f: impl FnOnce() -> T) -> T {
    let _guard = ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .expect("env lock poisoned");
    f()
}

const CORE_DEF: &str = r#"
name: Core
content:
  top.core*:
    c0: c0_%1
"#;

fn write(path: &Path, text: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, text).expect("write file");
}

#[test]
fn test_def_file_found_next_to_descriptor() {
    let dir = TempDir::new().unwrap();
    write(&dir.path().join("core.yaml"), CORE_DEF);
    write(
        &dir.path().join("reports.yaml"),
        "content:\n  report:\n    pattern: top\n    def_file: core.yaml\n    dest_file: out.csv\n",
    );

    let descs = load_descriptors(&dir.path().join("reports.yaml")).unwrap();
    assert_eq!(descs.len(), 1);
    assert_eq!(descs[0].source_dir.as_deref(), Some(dir.path()));

    let def = descs[0].definition(&DefinitionSearchPath::new()).unwrap();
    assert_eq!(def.name.as_deref(), Some("Core"));
    assert_eq!(def.stat_count(), 1);
}

#[test]
fn test_def_file_found_through_env_path() {
    with_env_lock(|| {
        let _guard = EnvGuard::new(ENV_REPORT_DEF_PATH);
        let defs = TempDir::new().unwrap();
        write(&defs.path().join("shared").join("core.yaml"), CORE_DEF);
        env::set_var(
            ENV_REPORT_DEF_PATH,
            format!("/nonexistent:{}", defs.path().join("shared").display()),
        );

        let search = DefinitionSearchPath::from_env();
        let (path, source) = search.resolve_with_source(Path::new("core.yaml")).unwrap();
        assert_eq!(source, DefinitionSource::Environment);
        assert!(path.ends_with("shared/core.yaml"));
    });
}

#[test]
fn test_missing_def_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    write(
        &dir.path().join("reports.yaml"),
        "content:\n  report:\n    pattern: top\n    def_file: missing.yaml\n    dest_file: out.csv\n",
    );
    let descs = load_descriptors(&dir.path().join("reports.yaml")).unwrap();
    let err = descs[0].definition(&DefinitionSearchPath::new()).unwrap_err();
    assert!(matches!(err, ValidationError::IoError(_)));
}

#[test]
fn test_inline_definition_at_report_level() {
    let dir = TempDir::new().unwrap();
    write(
        &dir.path().join("reports.yaml"),
        r#"
content:
  - report:
      name: Inline
      pattern: top
      dest_file: inline.json
      style:
        decimal_places: 2
      trigger:
        tag: t0
        start: notif.go == 1
        on-demand: notif.dump
      content:
        c0: first
      subreport:
        name: Nested
        content:
          c1: second
      autopopulate: true
  - report:
      pattern: top
      def_file: core.yaml
      dest_file: skipped.csv
      skip: true
"#,
    );

    let descs = load_descriptors(&dir.path().join("reports.yaml")).unwrap();
    assert_eq!(descs.len(), 1);
    let desc = &descs[0];
    assert_eq!(desc.format, ReportFormat::Json);
    assert_eq!(desc.display_name(), "Inline");
    assert!(desc.has_on_demand_trigger());
    assert_eq!(desc.triggers.tag(), Some("t0"));
    assert_eq!(
        desc.triggers.notification_channels(TriggerKey::OnDemand),
        vec!["dump"]
    );

    let def = desc.definition(&DefinitionSearchPath::new()).unwrap();
    assert_eq!(def.style.get("decimal_places").map(String::as_str), Some("2"));
    assert_eq!(def.content.len(), 3);
    assert!(matches!(def.content[0], ContentEntry::Stat { .. }));
    assert!(matches!(def.content[1], ContentEntry::Subreport(_)));
    assert!(matches!(def.content[2], ContentEntry::Autopopulate(_)));
}

#[test]
fn test_unknown_report_key_rejected() {
    let dir = TempDir::new().unwrap();
    write(
        &dir.path().join("bad.yaml"),
        "content:\n  report:\n    pattern: top\n    def_flie: core.yaml\n    dest_file: out.csv\n",
    );
    let err = load_descriptors(&dir.path().join("bad.yaml")).unwrap_err();
    assert!(matches!(err, ValidationError::UnknownKey { .. }));
}
