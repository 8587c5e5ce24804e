//! Library lifecycle integration tests: imports, category operations, and
//! index consistency under concurrent mutation.

mod helpers;

use helpers::{status_probe, TestLibrary};
use probemgr_server::import::{import_folder, import_text};
use probemgr_server::parser;
use probemgr_server::types::UNCATEGORIZED;

#[test]
fn rename_category_moves_probe_and_file() {
    let t = TestLibrary::with_files(&[("web/sqli/probe.yaml", &status_probe("p1", "P1", "high"))]);
    let lib = &t.library;

    lib.rename_category("web/sqli", "webapp/sql-injection").unwrap();

    assert!(lib.get_by_category("web/sqli").is_empty());
    let moved = lib.get_by_category("webapp/sql-injection");
    assert_eq!(moved.len(), 1);
    let full = lib.get_by_id("p1").unwrap();
    assert!(full.file_path.starts_with(t.root().join("webapp/sql-injection")));
    assert!(full.file_path.exists());
}

#[test]
fn duplicate_name_import_is_renamed_on_disk() {
    let t = TestLibrary::empty();
    import_text(&t.library, &status_probe("a", "Test", "low"), Some("c1")).unwrap();
    let second = import_text(&t.library, &status_probe("b", "Test", "low"), Some("c1")).unwrap();

    assert_eq!(second.name, "Test_1");
    // The serialized file reflects the renamed info.name and the fresh id.
    let on_disk = std::fs::read_to_string(&second.file_path).unwrap();
    let parsed = parser::parse(&on_disk).unwrap();
    assert_eq!(parsed.name, "Test_1");
    assert_eq!(parsed.id, second.id);
}

#[test]
fn every_indexed_probe_round_trips_from_disk() {
    let t = TestLibrary::with_files(&[
        ("a.yaml", &status_probe("p-a", "A", "info")),
        ("web/b.yaml", &status_probe("p-b", "B", "high")),
        ("web/sqli/c.yaml", &status_probe("p-c", "C", "critical")),
    ]);
    for probe in t.library.get_all() {
        assert!(probe.file_path.exists(), "{} missing on disk", probe.id);
        let text = std::fs::read_to_string(&probe.file_path).unwrap();
        assert_eq!(parser::parse(&text).unwrap().id, probe.id);
    }
}

#[test]
fn import_export_equivalence() {
    let t = TestLibrary::empty();
    let original =
        import_text(&t.library, &status_probe("orig", "Original", "high"), Some("web")).unwrap();
    let exported = t.library.get_by_id(&original.id).unwrap().content.unwrap();

    let reimported = import_text(&t.library, &exported, Some("web")).unwrap();
    assert_ne!(reimported.id, original.id, "import must assign a fresh id");
    assert_eq!(reimported.severity, original.severity);
    assert_eq!(reimported.category, original.category);
    // The name collides with the original and picks up a suffix.
    assert_eq!(reimported.name, "Original_1");
    let full = t.library.get_by_id(&reimported.id).unwrap();
    assert_eq!(full.requests, t.library.get_by_id(&original.id).unwrap().requests);
}

#[test]
fn folder_import_reports_and_indexes() {
    let t = TestLibrary::empty();
    let src = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(src.path().join("net/ssh")).unwrap();
    std::fs::write(src.path().join("net/ssh/ok.yaml"), status_probe("ok", "Ok", "low")).unwrap();
    std::fs::write(src.path().join("bad.yaml"), "no id here: true\n").unwrap();

    let report = import_folder(&t.library, src.path()).unwrap();
    assert_eq!(report.success, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(t.library.get_by_category("net/ssh").len(), 1);
}

#[test]
fn category_counts_include_uncategorized() {
    let t = TestLibrary::with_files(&[
        ("top.yaml", &status_probe("top", "Top", "info")),
        ("web/w.yaml", &status_probe("w", "W", "info")),
    ]);
    let counts = t.library.list_with_counts();
    assert_eq!(counts[0].path, UNCATEGORIZED);
    assert_eq!(counts[0].count, 1);
    assert!(counts.iter().any(|c| c.path == "web" && c.count == 1));

    let stats = t.library.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_severity.get("info"), Some(&2));
}

#[test]
fn concurrent_disjoint_mutations_keep_indices_consistent() {
    let t = TestLibrary::empty();
    let lib = &t.library;

    // Phase 1: 8 threads import 5 probes each into their own category.
    std::thread::scope(|scope| {
        for thread in 0..8usize {
            let lib = lib.clone();
            scope.spawn(move || {
                for i in 0..5usize {
                    let yaml = status_probe(&format!("t{thread}-p{i}"), "N", "low");
                    import_text(&lib, &yaml, Some(&format!("cat{thread}"))).unwrap();
                }
            });
        }
    });
    assert_eq!(lib.get_all().len(), 40);

    // Phase 2: every thread deletes two of its own probes.
    let victims: Vec<String> = (0..8)
        .flat_map(|thread| {
            let mut ids: Vec<String> = lib
                .get_by_category(&format!("cat{thread}"))
                .into_iter()
                .map(|p| p.id)
                .collect();
            ids.truncate(2);
            ids
        })
        .collect();
    std::thread::scope(|scope| {
        for id in &victims {
            let lib = lib.clone();
            scope.spawn(move || lib.delete(id).unwrap());
        }
    });

    let remaining = lib.get_all();
    assert_eq!(remaining.len(), 40 - 16);
    // Index consistency: category buckets agree with the primary map.
    for thread in 0..8 {
        let cat = format!("cat{thread}");
        let via_bucket = lib.get_by_category(&cat);
        let via_scan: Vec<_> = remaining.iter().filter(|p| p.category == cat).collect();
        assert_eq!(via_bucket.len(), via_scan.len(), "bucket drift in {cat}");
        assert_eq!(via_bucket.len(), 3);
    }
    for probe in &remaining {
        assert!(probe.file_path.exists());
    }
}
