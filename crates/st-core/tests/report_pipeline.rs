//! Report pipeline tests: descriptor files through formatted output,
//! archives and live streams.
//!
//! Covers:
//! - Descriptor file with a `def_file` reference producing a CSV report
//! - JSON document written at save
//! - Archive growth per update, offline reads and replay
//! - Stream rows consumed on another thread

mod support;

use st_config::{ReportFormat, TriggerKey};
use st_core::{ArchiveController, ArchiveReplay, OfflineArchiveController, ReportStatus};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use support::sim_harness::{every_cycle, ramp, SimHarness};
use tempfile::tempdir;

const COUNTERS_DEF: &str = "name: counters\ncontent:\n  c0: c0\n  \"c0 * 2\": double\n";

fn write_descriptor_file(dir: &Path, dest: &Path) -> std::path::PathBuf {
    fs::write(dir.join("counters.yaml"), COUNTERS_DEF).unwrap();
    let descriptor = format!(
        r#"
content:
  - report:
      name: counters
      pattern: top
      def_file: counters.yaml
      dest_file: {}
      trigger:
        update-cycles: 1
"#,
        dest.display()
    );
    let path = dir.join("reports.yaml");
    fs::write(&path, descriptor).unwrap();
    path
}

// ============================================================================
// Text formats
// ============================================================================

mod text_formats {
    use super::*;

    #[test]
    fn test_descriptor_file_to_csv() {
        let h = SimHarness::new();
        let dir = tempdir().unwrap();
        let out = dir.path().join("counters.csv");
        let descriptors = write_descriptor_file(dir.path(), &out);

        let mut repo = h.repository();
        assert_eq!(repo.load_descriptor_file(&descriptors).unwrap(), 1);
        repo.finalize().unwrap();
        let live = repo.report("counters").unwrap();
        assert_eq!(live.format(), ReportFormat::Csv);

        h.run_until(5);
        repo.save_reports().unwrap();
        assert_eq!(live.status(), ReportStatus::Saved);

        let text = fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("# name=counters, start=0 "), "{}", lines[0]);
        assert!(lines[0].contains(&format!("end={:<20},", 5)));
        assert!(lines[0].contains("report_format=csv, sim_name=harness"));
        assert_eq!(lines[1], "c0,double");
        assert_eq!(&lines[2..], ["0,0", "1,2", "2,4", "3,6", "4,8"]);
    }

    #[test]
    fn test_per_update_format_without_updates_writes_one_row() {
        let h = SimHarness::new();
        let dir = tempdir().unwrap();
        let out = dir.path().join("final.csv");
        let def = st_config::ReportDefinition::from_yaml_str("name: final\ncontent:\n  c0: c0\n").unwrap();
        let mut repo = h.repository();
        repo.add_descriptor(st_config::ReportDescriptor::inline(
            "top",
            def,
            out.to_str().unwrap(),
            ReportFormat::Csv,
        ));
        repo.finalize().unwrap();

        h.run_until(4);
        repo.save_reports().unwrap();

        let text = fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(&lines[1..], ["c0", "4"]);
    }

    #[test]
    fn test_json_document_at_save() {
        let h = SimHarness::new();
        let dir = tempdir().unwrap();
        let out = dir.path().join("counters.json");
        let mut repo = h.repository();
        repo.add_descriptor(
            every_cycle(COUNTERS_DEF, out.to_str().unwrap(), ReportFormat::Json)
                .with_trigger(TriggerKey::Start, "c0 >= 2"),
        );
        repo.finalize().unwrap();

        h.run_until(6);
        repo.save_reports().unwrap();

        let doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        let stats = &doc["Statistics"]["counters"];
        assert_eq!(stats["c0"]["val"], serde_json::json!(4));
        assert_eq!(stats["c0"]["desc"], serde_json::json!("first counter"));
        assert_eq!(stats["double"]["val"], serde_json::json!(8));
        assert_eq!(doc["siminfo"]["name"], serde_json::json!("harness"));
    }
}

// ============================================================================
// Archives
// ============================================================================

mod archives {
    use super::*;

    #[test]
    fn test_archive_grows_one_row_per_update_and_replays() {
        let h = SimHarness::new();
        let dir = tempdir().unwrap();
        let mut repo = h.repository();
        repo.add_descriptor(every_cycle(COUNTERS_DEF, "1", ReportFormat::Text));
        repo.enable_archives(dir.path().join("archives")).unwrap();
        repo.finalize().unwrap();
        let live = repo.report("counters").unwrap();
        let arch = live.archive_dir().unwrap();
        let leaves = live.report().leaf_count() as u64;
        assert_eq!(leaves, 2);

        for k in 1..=6u64 {
            h.run_for(1);
            live.synchronize_archive().unwrap();
            let len = fs::metadata(arch.join(st_core::archive::VALUES_FILE)).unwrap().len();
            assert_eq!(len, k * leaves * 8, "after update {}", k);
        }

        let series = live.archive_series(1).unwrap();
        assert_eq!(*series.data().unwrap(), vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);

        let offline = OfflineArchiveController::open(&arch).unwrap();
        assert!(offline.is_read_only());
        assert_eq!(offline.row_count().unwrap(), 6);
        assert_eq!(*offline.series(0).unwrap().data().unwrap(), ramp(&[6]));

        let mut replay = ArchiveReplay::open(&arch, &h.sched).unwrap();
        replay.seek(3).unwrap();
        assert_eq!(replay.report().collect_values().unwrap(), vec![3.0, 6.0]);
        assert_eq!(replay.current_row(), Some(3));
    }

    #[test]
    fn test_saved_archive_copy_is_independent() {
        let h = SimHarness::new();
        let dir = tempdir().unwrap();
        let mut repo = h.repository();
        repo.add_descriptor(every_cycle(COUNTERS_DEF, "1", ReportFormat::Text));
        repo.enable_archives(dir.path().join("archives")).unwrap();
        repo.finalize().unwrap();
        let live = repo.report("counters").unwrap();

        h.run_until(3);
        let copy = dir.path().join("copy");
        live.save_archive_to(&copy).unwrap();
        h.run_until(8);
        live.synchronize_archive().unwrap();

        let offline = OfflineArchiveController::open(&copy).unwrap();
        assert_eq!(offline.row_count().unwrap(), 3);
    }
}

// ============================================================================
// Streams
// ============================================================================

mod streams {
    use super::*;

    #[test]
    fn test_consumer_thread_receives_rows_in_order() {
        let h = SimHarness::new();
        let mut repo = h.repository();
        repo.add_descriptor(every_cycle(COUNTERS_DEF, "1", ReportFormat::Text));
        repo.finalize().unwrap();
        let listener = repo.report("counters").unwrap().add_stream_listener("consumer").unwrap();

        let consumer = thread::spawn(move || {
            let mut rows = VecDeque::new();
            let deadline = Instant::now() + Duration::from_secs(10);
            while rows.len() < 12 && Instant::now() < deadline {
                if listener.get_buffered_stream_data(&mut rows) == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            rows
        });
        h.run_until(12);

        let rows = consumer.join().unwrap();
        assert_eq!(rows.len(), 12);
        for (k, row) in rows.iter().enumerate() {
            assert_eq!(row, &vec![k as f64, 2.0 * k as f64]);
        }
    }

    #[test]
    fn test_listeners_each_receive_every_row() {
        let h = SimHarness::new();
        let mut repo = h.repository();
        repo.add_descriptor(every_cycle(COUNTERS_DEF, "1", ReportFormat::Text));
        repo.finalize().unwrap();
        let live = repo.report("counters").unwrap();
        let first = live.add_stream_listener("first").unwrap();
        let second = live.add_stream_listener("second").unwrap();

        h.run_until(4);

        assert_eq!(first.pending(), 4);
        assert_eq!(second.pending(), 4);
    }
}
