use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of response bytes read off the wire per request.
pub const MAX_RESPONSE_READ: usize = 1024 * 1024;

/// Maximum number of response bytes stored in a result's evidence.
pub const STORED_RESPONSE_CAP: usize = 2048;

/// Redirect hops followed before a request is abandoned.
pub const MAX_REDIRECTS: usize = 10;

/// Category paths are at most this many slash-delimited segments deep.
pub const MAX_CATEGORY_DEPTH: usize = 3;

/// Results retained per job; matches past the cap still count as found.
pub const MAX_RESULTS_PER_JOB: usize = 10_000;

/// Characters that may not appear in a category segment.
pub const CATEGORY_FORBIDDEN_CHARS: &[char] = &['\\', ':', '*', '?', '"', '<', '>', '|'];

/// Display name for probes living directly under the library root.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Category assigned to imported probes that declare none.
pub const DEFAULT_CATEGORY: &str = "custom";

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Probe severity, ordered most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Info
    }
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }

    /// Parse a severity keyword. Unknown strings are `None` so the parser can
    /// report them as a diagnostic rather than silently defaulting.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            "info" | "information" | "informative" => Some(Severity::Info),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Matchers
// ---------------------------------------------------------------------------

/// Aggregation mode across a matcher's values or a request's matchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    And,
    Or,
}

impl Default for Condition {
    fn default() -> Self {
        Condition::Or
    }
}

/// Response part a matcher inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    StatusCode,
    Header,
    Body,
    All,
}

/// Matcher variant with the value list appropriate to its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
    Status(Vec<u16>),
    Word(Vec<String>),
    Regex(Vec<String>),
    Binary(Vec<String>),
    Dsl(Vec<String>),
}

impl MatcherKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            MatcherKind::Status(_) => "status",
            MatcherKind::Word(_) => "word",
            MatcherKind::Regex(_) => "regex",
            MatcherKind::Binary(_) => "binary",
            MatcherKind::Dsl(_) => "dsl",
        }
    }

    /// Default response part when the probe does not name one.
    pub fn default_part(&self) -> Part {
        match self {
            MatcherKind::Status(_) => Part::StatusCode,
            MatcherKind::Word(_) | MatcherKind::Regex(_) => Part::Body,
            MatcherKind::Binary(_) => Part::Body,
            MatcherKind::Dsl(_) => Part::All,
        }
    }
}

/// A single boolean predicate over an HTTP response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matcher {
    pub kind: MatcherKind,
    pub part: Part,
    pub condition: Condition,
    pub negative: bool,
}

// ---------------------------------------------------------------------------
// Request specs
// ---------------------------------------------------------------------------

/// One HTTP request template inside a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub method: String,
    /// Path templates; each is dispatched against every target.
    pub paths: Vec<String>,
    /// Ordered header list, applied after the scanner's default headers.
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Verbatim HTTP request template. When set, the structured fields above
    /// are ignored for dispatch.
    pub raw: Option<String>,
    pub matchers: Vec<Matcher>,
    pub matchers_condition: Condition,
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// A detection template: metadata plus one or more request specs.
///
/// The library index holds probes with `content == None`; `get_by_id`
/// populates `content` and `requests` from disk on demand.
#[derive(Debug, Clone, Serialize)]
pub struct Probe {
    pub id: String,
    pub name: String,
    pub author: String,
    pub severity: Severity,
    pub description: String,
    pub references: Vec<String>,
    pub tags: BTreeSet<String>,
    /// Slash-delimited category path; empty means uncategorized. Mirrors the
    /// on-disk directory and is kept aligned by `save`.
    pub category: String,
    pub file_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Raw declarative text; absent in the metadata index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Parsed request specs; empty until content is loaded.
    #[serde(skip)]
    pub requests: Vec<RequestSpec>,
}

impl Probe {
    /// Category rendered for listings: the reserved name for the empty path.
    pub fn display_category(&self) -> &str {
        if self.category.is_empty() {
            UNCATEGORIZED
        } else {
            &self.category
        }
    }
}

// ---------------------------------------------------------------------------
// Scan jobs
// ---------------------------------------------------------------------------

/// Job lifecycle state. Terminal states are frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Stopped)
    }
}

/// Per-scan overrides for the orchestrator defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Worker pool size within the job.
    pub concurrency: Option<usize>,
    /// Per-request timeout in seconds.
    pub timeout: Option<u64>,
    /// Outgoing requests per second across the job's workers.
    pub rate_limit: Option<u32>,
    /// Queue fill chunk size (advisory).
    pub bulk_size: Option<usize>,
}

/// Read-only snapshot of a job, served by the status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: u64,
    pub state: JobState,
    pub total: usize,
    pub completed: usize,
    pub found: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub targets: Vec<String>,
    pub probe_ids: Vec<String>,
}

/// One finding: a matcher-positive outcome for a (target, probe) pair.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub id: String,
    pub job_id: u64,
    pub probe_id: String,
    pub probe_name: String,
    pub severity: Severity,
    pub host: String,
    pub matched_evidence: String,
    pub extracted_data: String,
    pub timestamp: DateTime<Utc>,
    pub request_text: String,
    pub response_text: String,
}

// ---------------------------------------------------------------------------
// Library stats
// ---------------------------------------------------------------------------

/// Counts served to the operator dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct LibraryStats {
    pub total: usize,
    pub by_category: std::collections::BTreeMap<String, usize>,
    pub by_severity: std::collections::BTreeMap<String, usize>,
}

/// One category row in `list_with_counts`.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryCount {
    pub path: String,
    pub count: usize,
}

/// Outcome of a folder import: per-file failures do not abort the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// HTTP façade state
// ---------------------------------------------------------------------------

/// Axum application state shared by all API handlers.
#[derive(Clone)]
pub struct AppContext {
    pub library: Arc<crate::library::ProbeLibrary>,
    pub scanner: Arc<crate::scanner::ScanOrchestrator>,
    pub settings: Arc<std::sync::RwLock<crate::settings::Settings>>,
}

// ---------------------------------------------------------------------------
// Category path validation
// ---------------------------------------------------------------------------

/// Validate a category path: at most three non-empty segments, none
/// containing a forbidden character. The empty path (uncategorized) passes.
pub fn validate_category(path: &str) -> Result<(), crate::error::Error> {
    use crate::error::Error;

    if path.is_empty() {
        return Ok(());
    }
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() > MAX_CATEGORY_DEPTH {
        return Err(Error::InvalidArgument(format!(
            "category `{path}` exceeds {MAX_CATEGORY_DEPTH} segments"
        )));
    }
    for seg in segments {
        if seg.trim().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "category `{path}` contains an empty segment"
            )));
        }
        if let Some(bad) = seg.chars().find(|c| CATEGORY_FORBIDDEN_CHARS.contains(c)) {
            return Err(Error::InvalidArgument(format!(
                "category segment `{seg}` contains forbidden character `{bad}`"
            )));
        }
    }
    Ok(())
}
