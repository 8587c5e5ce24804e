//! Scan orchestrator: job lifecycle, concurrent dispatch, progress, results.
//!
//! A job is a (targets × probes) matrix consumed by a pool of workers off a
//! shared queue. Workers are cancellation-aware at every suspension point:
//! the rate-limiter acquire, the HTTP send, and between pairs. Recoverable
//! failures (network errors, malformed probes) count as "no match" — a
//! single bad pair never fails the job.

use crate::error::{Error, Result};
use crate::library::ProbeLibrary;
use crate::matcher::{self, CapturedResponse};
use crate::ratelimit::RateLimiter;
use crate::settings::Settings;
use crate::types::*;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::redirect::Policy;
use reqwest::Url;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_USER_AGENT: &str = concat!("probemgr/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Job handle
// ---------------------------------------------------------------------------

/// Mutable job fields, all behind one lock so counter updates and state
/// transitions are observed together: a reader that sees
/// `completed == total` is guaranteed to also see a terminal state.
struct JobProgress {
    state: JobState,
    completed: usize,
    found: usize,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    results_capped: bool,
}

pub struct JobHandle {
    id: u64,
    targets: Vec<String>,
    probe_ids: Vec<String>,
    total: usize,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    progress: Mutex<JobProgress>,
    results: Mutex<Vec<ScanResult>>,
}

impl JobHandle {
    fn snapshot(&self) -> JobStatus {
        let p = self.progress.lock().unwrap();
        JobStatus {
            id: self.id,
            state: p.state,
            total: self.total,
            completed: p.completed,
            found: p.found,
            started_at: self.started_at,
            completed_at: p.completed_at,
            error: p.error.clone(),
            targets: self.targets.clone(),
            probe_ids: self.probe_ids.clone(),
        }
    }

    /// Record one fully processed pair. Appends findings, advances the
    /// counters, and performs the Running → Completed transition on the
    /// final pair — all under the progress lock. After a stop the job is
    /// frozen: late pairs neither append results nor advance counters.
    fn record_pair(&self, findings: Vec<ScanResult>) {
        let matched = !findings.is_empty();
        let mut p = self.progress.lock().unwrap();
        if p.state != JobState::Running {
            return;
        }
        if matched {
            let mut log = self.results.lock().unwrap();
            for result in findings {
                if log.len() < MAX_RESULTS_PER_JOB {
                    log.push(result);
                } else if !p.results_capped {
                    p.results_capped = true;
                    warn!(job = self.id, cap = MAX_RESULTS_PER_JOB,
                          "Result log capped, further findings are counted but dropped");
                }
            }
        }
        p.completed += 1;
        if matched {
            p.found += 1;
        }
        if p.completed == self.total {
            p.state = JobState::Completed;
            p.completed_at = Some(Utc::now());
        }
    }

    /// Transition to a terminal state unless already terminal.
    fn finalize(&self, state: JobState, error: Option<String>) {
        let mut p = self.progress.lock().unwrap();
        if p.state.is_terminal() {
            return;
        }
        p.state = state;
        p.error = error;
        p.completed_at = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Effective per-job parameters after merging options with settings.
#[derive(Clone, Copy)]
struct JobConfig {
    concurrency: usize,
    timeout: Duration,
    rate_limit: u32,
    bulk_size: usize,
}

pub struct ScanOrchestrator {
    library: Arc<ProbeLibrary>,
    settings: Arc<RwLock<Settings>>,
    client: reqwest::Client,
    jobs: DashMap<u64, Arc<JobHandle>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl ScanOrchestrator {
    /// Build the orchestrator and its shared HTTP client. The proxy setting
    /// is wired here; an unparseable proxy URL is a construction error.
    pub fn new(library: Arc<ProbeLibrary>, settings: Arc<RwLock<Settings>>) -> Result<Self> {
        let snapshot = settings.read().unwrap().clone();
        let mut builder = reqwest::Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(snapshot.timeout))
            .danger_accept_invalid_certs(true);
        if !snapshot.proxy_url.is_empty() {
            let proxy = reqwest::Proxy::all(&snapshot.proxy_url)
                .map_err(|e| Error::InvalidArgument(format!("bad proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Internal(format!("http client construction failed: {e}")))?;
        Ok(Self {
            library,
            settings,
            client,
            jobs: DashMap::new(),
            next_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Submit a scan over `targets × probe_ids`. Unresolvable probe ids are
    /// dropped silently; zero remaining probes or targets is an error.
    /// Returns the job id immediately; execution runs on spawned tasks.
    pub fn start_scan(
        &self,
        targets: Vec<String>,
        probe_ids: Vec<String>,
        options: ScanOptions,
    ) -> Result<u64> {
        let targets: Vec<String> = targets
            .into_iter()
            .map(|t| normalize_target(&t))
            .filter(|t| !t.is_empty())
            .collect();
        if targets.is_empty() {
            return Err(Error::InvalidArgument("no targets given".into()));
        }

        let mut probes: Vec<Probe> = Vec::new();
        for id in &probe_ids {
            match self.library.get_meta(id) {
                Some(meta) => probes.push(meta),
                None => debug!(probe = id.as_str(), "Dropping unknown probe id"),
            }
        }
        if probes.is_empty() {
            return Err(Error::InvalidArgument("no resolvable probes given".into()));
        }

        let defaults = self.settings.read().unwrap().clone();
        let config = JobConfig {
            concurrency: options.concurrency.unwrap_or(defaults.concurrency).max(1),
            timeout: Duration::from_secs(options.timeout.unwrap_or(defaults.timeout).max(1)),
            rate_limit: options.rate_limit.unwrap_or(defaults.rate_limit),
            bulk_size: options.bulk_size.unwrap_or(defaults.bulk_size).max(1),
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job = Arc::new(JobHandle {
            id,
            total: targets.len() * probes.len(),
            probe_ids: probes.iter().map(|p| p.id.clone()).collect(),
            targets,
            started_at: Utc::now(),
            cancel: self.shutdown.child_token(),
            progress: Mutex::new(JobProgress {
                state: JobState::Pending,
                completed: 0,
                found: 0,
                completed_at: None,
                error: None,
                results_capped: false,
            }),
            results: Mutex::new(Vec::new()),
        });
        self.jobs.insert(id, Arc::clone(&job));

        let library = Arc::clone(&self.library);
        let client = self.client.clone();
        tokio::spawn(run_job(job, library, client, probes, config));
        Ok(id)
    }

    /// Fire the job's cancellation token and freeze it in `stopped`.
    /// Stopping a terminal job is a no-op returning the current snapshot.
    pub fn stop_scan(&self, id: u64) -> Result<JobStatus> {
        let job = self.job(id)?;
        job.finalize(JobState::Stopped, None);
        job.cancel.cancel();
        info!(job = id, "Scan stopped");
        Ok(job.snapshot())
    }

    pub fn status(&self, id: u64) -> Result<JobStatus> {
        Ok(self.job(id)?.snapshot())
    }

    pub fn results(&self, id: u64) -> Result<Vec<ScanResult>> {
        let job = self.job(id)?;
        let log = job.results.lock().unwrap();
        Ok(log.clone())
    }

    pub fn all_jobs(&self) -> Vec<JobStatus> {
        let mut jobs: Vec<JobStatus> = self.jobs.iter().map(|j| j.snapshot()).collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Cancel every running job. Called on process shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for job in self.jobs.iter() {
            job.finalize(JobState::Stopped, None);
        }
        info!("All running scans cancelled");
    }

    fn job(&self, id: u64) -> Result<Arc<JobHandle>> {
        self.jobs
            .get(&id)
            .map(|j| Arc::clone(&j))
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }
}

// ---------------------------------------------------------------------------
// Job execution
// ---------------------------------------------------------------------------

async fn run_job(
    job: Arc<JobHandle>,
    library: Arc<ProbeLibrary>,
    client: reqwest::Client,
    probes: Vec<Probe>,
    config: JobConfig,
) {
    {
        let mut p = job.progress.lock().unwrap();
        if p.state != JobState::Pending {
            return; // stopped before it started
        }
        p.state = JobState::Running;
    }

    // Probe bodies come off disk on a blocking thread. A probe that fails to
    // load keeps its metadata and zero request specs; its pairs complete as
    // non-matches.
    let loaded: Vec<Arc<Probe>> = match tokio::task::spawn_blocking(move || {
        probes
            .into_iter()
            .map(|meta| match library.get_by_id(&meta.id) {
                Ok(full) => Arc::new(full),
                Err(e) => {
                    warn!(probe = meta.id.as_str(), error = %e, "Could not load probe body");
                    Arc::new(meta)
                }
            })
            .collect()
    })
    .await
    {
        Ok(loaded) => loaded,
        Err(e) => {
            job.cancel.cancel();
            job.finalize(JobState::Failed, Some(format!("probe load failed: {e}")));
            return;
        }
    };

    // Queue filled target-major in bulk_size batches.
    let mut pairs: VecDeque<(Arc<str>, Arc<Probe>)> = VecDeque::with_capacity(job.total);
    for batch in job.targets.chunks(config.bulk_size) {
        for target in batch {
            for probe in &loaded {
                pairs.push_back((Arc::from(target.as_str()), Arc::clone(probe)));
            }
        }
    }
    let queue = Arc::new(Mutex::new(pairs));
    let limiter = Arc::new(RateLimiter::new(config.rate_limit));

    let workers = config.concurrency.min(job.total);
    info!(job = job.id, total = job.total, workers = workers, "Scan started");

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        handles.push(tokio::spawn(run_worker(
            Arc::clone(&job),
            Arc::clone(&queue),
            Arc::clone(&limiter),
            client.clone(),
            config.timeout,
        )));
    }

    let mut panic_error: Option<String> = None;
    for handle in handles {
        if let Err(e) = handle.await {
            if e.is_panic() && panic_error.is_none() {
                panic_error = Some(format!("worker panicked: {e}"));
                job.cancel.cancel();
            }
        }
    }

    if let Some(error) = panic_error {
        job.finalize(JobState::Failed, Some(error));
    } else if job.cancel.is_cancelled() {
        job.finalize(JobState::Stopped, None);
    } else {
        // Normally the final record_pair already flipped the job to
        // Completed; this covers the empty-queue edge.
        job.finalize(JobState::Completed, None);
    }

    let status = job.snapshot();
    info!(
        job = job.id,
        state = ?status.state,
        completed = status.completed,
        found = status.found,
        "Scan finished"
    );
}

async fn run_worker(
    job: Arc<JobHandle>,
    queue: Arc<Mutex<VecDeque<(Arc<str>, Arc<Probe>)>>>,
    limiter: Arc<RateLimiter>,
    client: reqwest::Client,
    timeout: Duration,
) {
    loop {
        if job.cancel.is_cancelled() {
            break;
        }
        let pair = queue.lock().unwrap().pop_front();
        let Some((target, probe)) = pair else { break };
        if limiter.acquire(&job.cancel).await.is_err() {
            break;
        }
        match process_pair(&client, &job, &target, &probe, timeout).await {
            // Cancelled mid-flight: the pair is abandoned and does not
            // advance the completed counter.
            None => break,
            Some(findings) => job.record_pair(findings),
        }
    }
}

/// Dispatch every request spec of one probe against one target.
///
/// Returns `None` only when cancellation interrupted the pair; every error
/// path is a processed non-match.
async fn process_pair(
    client: &reqwest::Client,
    job: &JobHandle,
    target: &str,
    probe: &Probe,
    timeout: Duration,
) -> Option<Vec<ScanResult>> {
    let base = match Url::parse(target) {
        Ok(url) => url,
        Err(e) => {
            debug!(target = target, error = %e, "Unparseable target");
            return Some(Vec::new());
        }
    };

    let mut findings = Vec::new();
    for spec in &probe.requests {
        let prepared = match prepare_requests(spec, &base) {
            Ok(reqs) => reqs,
            Err(e) => {
                debug!(probe = probe.id.as_str(), error = %e, "Bad request spec");
                continue;
            }
        };
        for request in prepared {
            let outcome = tokio::select! {
                biased;
                _ = job.cancel.cancelled() => return None,
                r = execute(client, &request, timeout) => r,
            };
            let captured = match outcome {
                Ok(captured) => captured,
                Err(e) => {
                    debug!(target = target, probe = probe.id.as_str(), error = %e,
                           "Request failed");
                    continue;
                }
            };
            let (matched, evidence) =
                matcher::evaluate(&spec.matchers, spec.matchers_condition, &captured);
            if matched {
                findings.push(build_result(job, probe, target, evidence, &request, &captured));
            }
        }
    }
    Some(findings)
}

// ---------------------------------------------------------------------------
// Request construction
// ---------------------------------------------------------------------------

/// A concrete request ready for dispatch, with its rendered text kept for
/// evidence.
struct PreparedRequest {
    method: String,
    url: Url,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl PreparedRequest {
    fn render(&self) -> String {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.url);
        for (k, v) in &self.headers {
            out.push_str(&format!("{k}: {v}\r\n"));
        }
        out.push_str("\r\n");
        if let Some(body) = &self.body {
            out.push_str(body);
        }
        out
    }
}

/// Expand a request spec into concrete requests for one target: one per path
/// template, or one for a raw block.
fn prepare_requests(spec: &RequestSpec, base: &Url) -> Result<Vec<PreparedRequest>> {
    if let Some(raw) = &spec.raw {
        return Ok(vec![prepare_raw(raw, base)?]);
    }
    let mut out = Vec::with_capacity(spec.paths.len());
    for path in &spec.paths {
        let rendered = substitute_placeholders(path, base);
        let url = resolve_url(&rendered, base)?;
        let user_headers: Vec<(String, String)> = spec
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), substitute_placeholders(v, base)))
            .collect();
        out.push(PreparedRequest {
            method: spec.method.clone(),
            url,
            headers: merge_headers(&user_headers),
            body: spec.body.as_deref().map(|b| substitute_placeholders(b, base)),
        });
    }
    Ok(out)
}

/// Parse a raw HTTP template: request line, header lines, blank line, body.
fn prepare_raw(raw: &str, base: &Url) -> Result<PreparedRequest> {
    let rendered = substitute_placeholders(raw, base);
    let text = rendered.replace("\r\n", "\n");
    let mut lines = text.lines();

    let request_line = lines
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::Parse("raw request is empty".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::Parse("raw request has no method".into()))?
        .to_ascii_uppercase();
    let path = parts.next().unwrap_or("/");
    let url = resolve_url(path, base)?;

    let mut headers: Vec<(String, String)> = Vec::new();
    let mut body = String::new();
    let mut in_body = false;
    for line in lines {
        if in_body {
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(line);
        } else if line.trim().is_empty() {
            in_body = true;
        } else if let Some((name, value)) = line.split_once(':') {
            // The connection host comes from the URL.
            if !name.trim().eq_ignore_ascii_case("host") {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
    }

    Ok(PreparedRequest {
        method,
        url,
        headers: merge_headers(&headers),
        body: if body.is_empty() { None } else { Some(body) },
    })
}

/// Replace the templating placeholders with values derived from the target.
fn substitute_placeholders(template: &str, base: &Url) -> String {
    let base_url = base.as_str().trim_end_matches('/');
    let host = base.host_str().unwrap_or_default();
    let hostname = match base.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let root_url = format!("{}://{hostname}", base.scheme());
    template
        .replace("{{BaseURL}}", base_url)
        .replace("{{RootURL}}", &root_url)
        .replace("{{Hostname}}", &hostname)
}

fn resolve_url(rendered: &str, base: &Url) -> Result<Url> {
    if rendered.starts_with("http://") || rendered.starts_with("https://") {
        Url::parse(rendered).map_err(|e| Error::Parse(format!("bad url `{rendered}`: {e}")))
    } else {
        base.join(rendered)
            .map_err(|e| Error::Parse(format!("bad path `{rendered}`: {e}")))
    }
}

/// Default headers first, then user headers, which override by name.
fn merge_headers(user: &[(String, String)]) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = vec![
        ("User-Agent".to_string(), DEFAULT_USER_AGENT.to_string()),
        ("Accept".to_string(), "*/*".to_string()),
        ("Connection".to_string(), "close".to_string()),
    ];
    for (name, value) in user {
        if let Some(existing) = merged.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            existing.1 = value.clone();
        } else {
            merged.push((name.clone(), value.clone()));
        }
    }
    merged
}

/// Targets without a scheme are dispatched over plain http.
fn normalize_target(target: &str) -> String {
    let t = target.trim();
    if t.is_empty() {
        return String::new();
    }
    if t.starts_with("http://") || t.starts_with("https://") {
        t.to_string()
    } else {
        format!("http://{t}")
    }
}

// ---------------------------------------------------------------------------
// Dispatch and capture
// ---------------------------------------------------------------------------

/// Send one request and read up to [`MAX_RESPONSE_READ`] bytes of the body.
async fn execute(
    client: &reqwest::Client,
    request: &PreparedRequest,
    timeout: Duration,
) -> Result<CapturedResponse> {
    let method: reqwest::Method = request
        .method
        .parse()
        .map_err(|_| Error::Parse(format!("bad method `{}`", request.method)))?;

    let mut builder = client.request(method, request.url.clone()).timeout(timeout);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }

    let mut response = builder.send().await.map_err(|e| Error::Network(e.to_string()))?;
    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
        .collect();

    let mut body = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = MAX_RESPONSE_READ - body.len();
                if chunk.len() >= remaining {
                    body.extend_from_slice(&chunk[..remaining]);
                    break;
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => return Err(Error::Network(e.to_string())),
        }
    }

    Ok(CapturedResponse { status, headers, body })
}

fn build_result(
    job: &JobHandle,
    probe: &Probe,
    target: &str,
    evidence: String,
    request: &PreparedRequest,
    captured: &CapturedResponse,
) -> ScanResult {
    let mut response_text =
        format!("HTTP/1.1 {}\r\n{}\r\n", captured.status, captured.header_text());
    let body = captured.body_text();
    let mut end = body.len().min(STORED_RESPONSE_CAP);
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    response_text.push_str(&body[..end]);

    ScanResult {
        id: uuid::Uuid::new_v4().to_string(),
        job_id: job.id,
        probe_id: probe.id.clone(),
        probe_name: probe.name.clone(),
        severity: probe.severity,
        host: target.to_string(),
        matched_evidence: evidence,
        extracted_data: String::new(),
        timestamp: Utc::now(),
        request_text: request.render(),
        response_text,
    }
}
