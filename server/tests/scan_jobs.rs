//! End-to-end scan scenarios against in-process mock targets.

mod helpers;

use axum::routing::get;
use axum::Router;
use helpers::target::MockTarget;
use helpers::{status_probe, word_and_probe, TestLibrary};
use probemgr_server::scanner::ScanOrchestrator;
use probemgr_server::settings::Settings;
use probemgr_server::types::{JobState, JobStatus, ScanOptions, Severity};
use std::sync::{Arc, RwLock};
use std::time::Duration;

fn orchestrator(t: &TestLibrary) -> Arc<ScanOrchestrator> {
    let settings = Arc::new(RwLock::new(Settings::default()));
    Arc::new(ScanOrchestrator::new(t.library.clone(), settings).expect("orchestrator"))
}

async fn wait_terminal(scanner: &ScanOrchestrator, id: u64) -> JobStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = scanner.status(id).expect("job status");
        if status.state.is_terminal() {
            return status;
        }
        assert!(tokio::time::Instant::now() < deadline, "job {id} never finished: {status:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_probe_status_match() {
    let t = TestLibrary::with_files(&[("web/hit.yaml", &status_probe("hit", "Hit", "high"))]);
    let scanner = orchestrator(&t);
    let target = MockTarget::serve(Router::new().route("/", get(|| async { "OK" }))).await;

    let job = scanner
        .start_scan(vec![target.url()], vec!["hit".to_string()], ScanOptions::default())
        .unwrap();
    let status = wait_terminal(&scanner, job).await;

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.total, 1);
    assert_eq!(status.completed, 1);
    assert_eq!(status.found, 1);
    assert!(status.completed_at.is_some());

    let results = scanner.results(job).unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.job_id, job);
    assert_eq!(result.probe_id, "hit");
    assert_eq!(result.severity, Severity::High);
    assert!(result.matched_evidence.contains("Status: 200"), "{}", result.matched_evidence);
    assert!(result.request_text.starts_with("GET "));
    assert!(result.response_text.starts_with("HTTP/1.1 200"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn word_and_matcher_misses_on_partial_body() {
    let t = TestLibrary::with_files(&[(
        "web/words.yaml",
        &word_and_probe("words", &["alpha", "omega"]),
    )]);
    let scanner = orchestrator(&t);
    let target =
        MockTarget::serve(Router::new().route("/", get(|| async { "alpha only" }))).await;

    let job = scanner
        .start_scan(vec![target.url()], vec!["words".to_string()], ScanOptions::default())
        .unwrap();
    let status = wait_terminal(&scanner, job).await;

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.completed, 1);
    assert_eq!(status.found, 0);
    assert!(scanner.results(job).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_freezes_progress_and_results() {
    let files: Vec<(String, String)> = (0..4)
        .map(|i| (format!("p{i}.yaml"), status_probe(&format!("p{i}"), "P", "info")))
        .collect();
    let refs: Vec<(&str, &str)> =
        files.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
    let t = TestLibrary::with_files(&refs);
    let scanner = orchestrator(&t);

    let target = MockTarget::serve(Router::new().route(
        "/",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            "slow"
        }),
    ))
    .await;

    // 50 targets × 4 probes = 200 pairs.
    let targets = vec![target.url(); 50];
    let probe_ids = (0..4).map(|i| format!("p{i}")).collect();
    let options = ScanOptions {
        concurrency: Some(4),
        rate_limit: Some(0),
        ..ScanOptions::default()
    };
    let job = scanner.start_scan(targets, probe_ids, options).unwrap();

    // Let some pairs complete before pulling the plug.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = scanner.status(job).unwrap();
        if status.completed >= 5 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "scan made no progress");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stopped = scanner.stop_scan(job).unwrap();
    assert_eq!(stopped.state, JobState::Stopped);
    assert!(stopped.completed_at.is_some());
    assert!(stopped.completed >= 5 && stopped.completed < stopped.total);

    // Frozen: no counter movement, no new results after stop returns.
    let results_at_stop = scanner.results(job).unwrap().len();
    let completed_at_stop = scanner.status(job).unwrap().completed;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(scanner.results(job).unwrap().len(), results_at_stop);
    let after = scanner.status(job).unwrap();
    assert_eq!(after.completed, completed_at_stop);
    assert_eq!(after.state, JobState::Stopped);

    // Stopping a terminal job is a no-op.
    let again = scanner.stop_scan(job).unwrap();
    assert_eq!(again.state, JobState::Stopped);
    assert_eq!(again.completed, completed_at_stop);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_probe_ids_are_dropped() {
    let t = TestLibrary::with_files(&[("ok.yaml", &status_probe("ok", "Ok", "info"))]);
    let scanner = orchestrator(&t);
    let target = MockTarget::serve(Router::new().route("/", get(|| async { "hi" }))).await;

    let job = scanner
        .start_scan(
            vec![target.url()],
            vec!["ok".to_string(), "ghost".to_string()],
            ScanOptions::default(),
        )
        .unwrap();
    let status = wait_terminal(&scanner, job).await;
    assert_eq!(status.total, 1, "unknown id must not contribute pairs");
    assert_eq!(status.probe_ids, vec!["ok".to_string()]);

    // All ids unknown: nothing to scan.
    assert!(scanner
        .start_scan(vec![target.url()], vec!["ghost".to_string()], ScanOptions::default())
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn network_error_counts_as_no_match() {
    let t = TestLibrary::with_files(&[("ok.yaml", &status_probe("ok", "Ok", "info"))]);
    let scanner = orchestrator(&t);

    // Nothing listens here; connection is refused immediately.
    let job = scanner
        .start_scan(
            vec!["http://127.0.0.1:9".to_string()],
            vec!["ok".to_string()],
            ScanOptions { timeout: Some(2), ..ScanOptions::default() },
        )
        .unwrap();
    let status = wait_terminal(&scanner, job).await;

    assert_eq!(status.state, JobState::Completed, "a bad pair must not fail the job");
    assert_eq!(status.completed, 1);
    assert_eq!(status.found, 0);
    assert!(status.error.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_listing_and_missing_job_queries() {
    let t = TestLibrary::with_files(&[("ok.yaml", &status_probe("ok", "Ok", "info"))]);
    let scanner = orchestrator(&t);
    let target = MockTarget::serve(Router::new().route("/", get(|| async { "hi" }))).await;

    assert!(scanner.status(42).is_err());
    assert!(scanner.results(42).is_err());
    assert!(scanner.stop_scan(42).is_err());

    let first = scanner
        .start_scan(vec![target.url()], vec!["ok".to_string()], ScanOptions::default())
        .unwrap();
    let second = scanner
        .start_scan(vec![target.url()], vec!["ok".to_string()], ScanOptions::default())
        .unwrap();
    assert!(second > first, "job ids are monotonic");
    wait_terminal(&scanner, first).await;
    wait_terminal(&scanner, second).await;

    let jobs = scanner.all_jobs();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.windows(2).all(|w| w[0].id < w[1].id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_response_is_truncated_not_buffered() {
    let t = TestLibrary::with_files(&[(
        "big.yaml",
        &word_and_probe("big", &["padpadpad"]),
    )]);
    let scanner = orchestrator(&t);

    // 2 MiB body, double the read bound.
    let target = MockTarget::serve(
        Router::new().route("/", get(|| async { "padpadpad".repeat(240_000) })),
    )
    .await;

    let job = scanner
        .start_scan(vec![target.url()], vec!["big".to_string()], ScanOptions::default())
        .unwrap();
    let status = wait_terminal(&scanner, job).await;

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.found, 1, "the needle sits inside the read bound");
    let results = scanner.results(job).unwrap();
    // Stored evidence is capped far below the read bound.
    assert!(results[0].response_text.len() < 8 * 1024, "{}", results[0].response_text.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raw_request_probe_round_trip() {
    let raw_probe = r#"id: raw-login
info:
  name: Raw Login
  severity: medium
http:
  - raw:
      - |
        POST {{BaseURL}}/login HTTP/1.1
        Host: {{Hostname}}
        Content-Type: application/x-www-form-urlencoded

        user=admin
    matchers:
      - type: word
        part: body
        words:
          - "welcome"
"#;
    let t = TestLibrary::with_files(&[("raw.yaml", raw_probe)]);
    let scanner = orchestrator(&t);
    let target = MockTarget::serve(
        Router::new().route("/login", axum::routing::post(|| async { "welcome admin" })),
    )
    .await;

    let job = scanner
        .start_scan(vec![target.url()], vec!["raw-login".to_string()], ScanOptions::default())
        .unwrap();
    let status = wait_terminal(&scanner, job).await;
    assert_eq!(status.found, 1);
    let results = scanner.results(job).unwrap();
    assert!(results[0].request_text.starts_with("POST "));
}
