//! Probe document parser and serializer.
//!
//! One proper YAML parser serves both the library index and the scanner:
//! a typed raw document is deserialized with serde_yaml, then converted to
//! the domain [`Probe`] with per-field diagnostics. The module is pure — no
//! filesystem or network I/O.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::Utc;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Raw document shape (wire format)
// ---------------------------------------------------------------------------

/// Scalar-or-sequence of strings; YAML authors use both freely.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
enum StringList {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl StringList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringList::None => Vec::new(),
            StringList::One(s) => vec![s],
            StringList::Many(v) => v,
        }
    }
}

/// Scalar-or-sequence of integers, for `status` value lists.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
enum IntList {
    #[default]
    None,
    One(u16),
    Many(Vec<u16>),
}

impl IntList {
    fn into_vec(self) -> Vec<u16> {
        match self {
            IntList::None => Vec::new(),
            IntList::One(n) => vec![n],
            IntList::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawProbe {
    id: Option<String>,
    #[serde(default)]
    info: RawInfo,
    #[serde(default)]
    http: Vec<RawRequest>,
    /// Legacy section name; used only when `http` is absent.
    #[serde(default)]
    requests: Vec<RawRequest>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInfo {
    name: Option<String>,
    author: Option<String>,
    severity: Option<String>,
    description: Option<String>,
    #[serde(default)]
    reference: StringList,
    #[serde(default)]
    tags: StringList,
    /// Declared category; import may use it when no explicit one is given.
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRequest {
    method: Option<String>,
    #[serde(default)]
    path: StringList,
    /// Ordered mapping; serde_yaml preserves document order.
    headers: Option<Mapping>,
    body: Option<String>,
    #[serde(default)]
    raw: StringList,
    #[serde(default)]
    matchers: Vec<RawMatcher>,
    #[serde(rename = "matchers-condition", alias = "matchers_condition")]
    matchers_condition: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMatcher {
    #[serde(rename = "type")]
    kind: String,
    part: Option<String>,
    condition: Option<String>,
    #[serde(default)]
    negative: bool,
    #[serde(default)]
    status: IntList,
    #[serde(default)]
    words: StringList,
    #[serde(default)]
    regex: StringList,
    #[serde(default)]
    binary: StringList,
    #[serde(default)]
    dsl: StringList,
}

// ---------------------------------------------------------------------------
// Parse
// ---------------------------------------------------------------------------

/// Parse probe text into a fully populated [`Probe`].
///
/// `content` carries the original text and `requests` the parsed specs.
/// Category, file path, and timestamps are the caller's concern; the
/// declared `info.category` (if any) is surfaced in `probe.category`.
pub fn parse(text: &str) -> Result<Probe> {
    let raw: RawProbe =
        serde_yaml::from_str(text).map_err(|e| Error::Parse(format!("invalid yaml: {e}")))?;

    let id = raw
        .id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Parse("missing required field `id`".into()))?;
    validate_id(id)?;

    let severity = match raw.info.severity.as_deref() {
        None => Severity::default(),
        Some(s) => Severity::parse(s)
            .ok_or_else(|| Error::Parse(format!("unknown severity `{s}`")))?,
    };

    let entries = if raw.http.is_empty() { raw.requests } else { raw.http };
    let mut requests = Vec::with_capacity(entries.len());
    for (i, entry) in entries.into_iter().enumerate() {
        convert_request(entry, i, &mut requests)?;
    }

    let now = Utc::now();
    Ok(Probe {
        id: id.to_string(),
        name: raw.info.name.unwrap_or_else(|| id.to_string()),
        author: raw.info.author.unwrap_or_default(),
        severity,
        description: raw.info.description.unwrap_or_default(),
        references: raw
            .info
            .reference
            .into_vec()
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect(),
        tags: normalize_tags(raw.info.tags),
        category: raw.info.category.unwrap_or_default(),
        file_path: PathBuf::new(),
        created_at: now,
        updated_at: now,
        content: Some(text.to_string()),
        requests,
    })
}

/// Parse only what the library index needs: metadata, no retained content.
///
/// The whole document must still parse — the library refuses to index a
/// probe whose request or matcher sections are invalid.
pub fn parse_metadata(text: &str) -> Result<Probe> {
    let mut probe = parse(text)?;
    probe.content = None;
    probe.requests = Vec::new();
    Ok(probe)
}

/// Probe ids double as filenames; reject separators and reserved characters.
fn validate_id(id: &str) -> Result<()> {
    if id.chars().any(|c| {
        c == '/' || c.is_whitespace() || CATEGORY_FORBIDDEN_CHARS.contains(&c)
    }) {
        return Err(Error::Parse(format!("id `{id}` contains a forbidden character")));
    }
    Ok(())
}

/// Flatten a scalar CSV or a list into a trimmed set of non-empty tags.
fn normalize_tags(tags: StringList) -> BTreeSet<String> {
    tags.into_vec()
        .iter()
        .flat_map(|t| t.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn convert_request(entry: RawRequest, index: usize, out: &mut Vec<RequestSpec>) -> Result<()> {
    let matchers_condition = match entry.matchers_condition.as_deref() {
        None => Condition::default(),
        Some(c) => parse_condition(c)
            .ok_or_else(|| Error::Parse(format!("request {index}: unknown matchers-condition `{c}`")))?,
    };

    let mut matchers = Vec::with_capacity(entry.matchers.len());
    for m in entry.matchers {
        matchers.push(convert_matcher(m, index)?);
    }

    let headers = entry
        .headers
        .map(|m| {
            m.into_iter()
                .map(|(k, v)| (yaml_scalar_to_string(&k), yaml_scalar_to_string(&v)))
                .collect()
        })
        .unwrap_or_default();

    let raws = entry.raw.into_vec();
    if !raws.is_empty() {
        // Each raw block is its own request spec sharing the matcher list.
        for raw in raws {
            out.push(RequestSpec {
                method: String::new(),
                paths: Vec::new(),
                headers: Vec::new(),
                body: None,
                raw: Some(raw),
                matchers: matchers.clone(),
                matchers_condition,
            });
        }
        return Ok(());
    }

    let paths = entry.path.into_vec();
    if paths.is_empty() {
        return Err(Error::Parse(format!("request {index}: neither `path` nor `raw` given")));
    }

    out.push(RequestSpec {
        method: entry.method.as_deref().unwrap_or("GET").trim().to_ascii_uppercase(),
        paths,
        headers,
        body: entry.body,
        raw: None,
        matchers,
        matchers_condition,
    });
    Ok(())
}

fn convert_matcher(m: RawMatcher, request_index: usize) -> Result<Matcher> {
    let kind = match m.kind.as_str() {
        "status" => MatcherKind::Status(m.status.into_vec()),
        "word" => MatcherKind::Word(m.words.into_vec()),
        "regex" => MatcherKind::Regex(m.regex.into_vec()),
        "binary" => MatcherKind::Binary(m.binary.into_vec()),
        "dsl" => MatcherKind::Dsl(m.dsl.into_vec()),
        other => {
            return Err(Error::Parse(format!(
                "request {request_index}: unknown matcher type `{other}`"
            )))
        }
    };

    let empty = match &kind {
        MatcherKind::Status(v) => v.is_empty(),
        MatcherKind::Word(v)
        | MatcherKind::Regex(v)
        | MatcherKind::Binary(v)
        | MatcherKind::Dsl(v) => v.is_empty(),
    };
    if empty {
        return Err(Error::Parse(format!(
            "request {request_index}: `{}` matcher has no values",
            kind.type_name()
        )));
    }

    let part = match m.part.as_deref() {
        None => kind.default_part(),
        Some(p) => parse_part(p).ok_or_else(|| {
            Error::Parse(format!("request {request_index}: unknown matcher part `{p}`"))
        })?,
    };

    let condition = match m.condition.as_deref() {
        None => Condition::default(),
        Some(c) => parse_condition(c).ok_or_else(|| {
            Error::Parse(format!("request {request_index}: unknown matcher condition `{c}`"))
        })?,
    };

    Ok(Matcher { kind, part, condition, negative: m.negative })
}

fn parse_condition(s: &str) -> Option<Condition> {
    match s.trim().to_ascii_lowercase().as_str() {
        "and" => Some(Condition::And),
        "or" => Some(Condition::Or),
        _ => None,
    }
}

fn parse_part(s: &str) -> Option<Part> {
    match s.trim().to_ascii_lowercase().as_str() {
        "status" | "status_code" => Some(Part::StatusCode),
        "header" | "headers" => Some(Part::Header),
        "body" => Some(Part::Body),
        "all" => Some(Part::All),
        _ => None,
    }
}

fn yaml_scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim_end().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Serialize
// ---------------------------------------------------------------------------

/// Re-emit a probe as YAML text.
///
/// Reparsing the output yields the same metadata and request specs
/// (formatting aside). Used by export fallback and the round-trip tests.
pub fn serialize(probe: &Probe) -> Result<String> {
    let mut doc = Mapping::new();
    doc.insert(Value::from("id"), Value::from(probe.id.clone()));

    let mut info = Mapping::new();
    info.insert(Value::from("name"), Value::from(probe.name.clone()));
    if !probe.author.is_empty() {
        info.insert(Value::from("author"), Value::from(probe.author.clone()));
    }
    info.insert(Value::from("severity"), Value::from(probe.severity.as_str()));
    if !probe.description.is_empty() {
        info.insert(Value::from("description"), Value::from(probe.description.clone()));
    }
    if !probe.references.is_empty() {
        info.insert(
            Value::from("reference"),
            Value::Sequence(probe.references.iter().map(|r| Value::from(r.clone())).collect()),
        );
    }
    if !probe.tags.is_empty() {
        info.insert(
            Value::from("tags"),
            Value::Sequence(probe.tags.iter().map(|t| Value::from(t.clone())).collect()),
        );
    }
    doc.insert(Value::from("info"), Value::Mapping(info));

    if !probe.requests.is_empty() {
        let entries: Vec<Value> = probe.requests.iter().map(request_to_value).collect();
        doc.insert(Value::from("http"), Value::Sequence(entries));
    }

    serde_yaml::to_string(&Value::Mapping(doc))
        .map_err(|e| Error::Internal(format!("yaml serialization failed: {e}")))
}

fn request_to_value(req: &RequestSpec) -> Value {
    let mut m = Mapping::new();
    if let Some(raw) = &req.raw {
        m.insert(Value::from("raw"), Value::Sequence(vec![Value::from(raw.clone())]));
    } else {
        m.insert(Value::from("method"), Value::from(req.method.clone()));
        m.insert(
            Value::from("path"),
            Value::Sequence(req.paths.iter().map(|p| Value::from(p.clone())).collect()),
        );
        if !req.headers.is_empty() {
            let mut headers = Mapping::new();
            for (k, v) in &req.headers {
                headers.insert(Value::from(k.clone()), Value::from(v.clone()));
            }
            m.insert(Value::from("headers"), Value::Mapping(headers));
        }
        if let Some(body) = &req.body {
            m.insert(Value::from("body"), Value::from(body.clone()));
        }
    }
    if req.matchers_condition == Condition::And {
        m.insert(Value::from("matchers-condition"), Value::from("and"));
    }
    if !req.matchers.is_empty() {
        m.insert(
            Value::from("matchers"),
            Value::Sequence(req.matchers.iter().map(matcher_to_value).collect()),
        );
    }
    Value::Mapping(m)
}

fn matcher_to_value(m: &Matcher) -> Value {
    let mut out = Mapping::new();
    out.insert(Value::from("type"), Value::from(m.kind.type_name()));
    match &m.kind {
        MatcherKind::Status(v) => {
            out.insert(
                Value::from("status"),
                Value::Sequence(v.iter().map(|n| Value::from(*n as u64)).collect()),
            );
        }
        MatcherKind::Word(v) => {
            out.insert(
                Value::from("words"),
                Value::Sequence(v.iter().map(|s| Value::from(s.clone())).collect()),
            );
        }
        MatcherKind::Regex(v) => {
            out.insert(
                Value::from("regex"),
                Value::Sequence(v.iter().map(|s| Value::from(s.clone())).collect()),
            );
        }
        MatcherKind::Binary(v) => {
            out.insert(
                Value::from("binary"),
                Value::Sequence(v.iter().map(|s| Value::from(s.clone())).collect()),
            );
        }
        MatcherKind::Dsl(v) => {
            out.insert(
                Value::from("dsl"),
                Value::Sequence(v.iter().map(|s| Value::from(s.clone())).collect()),
            );
        }
    }
    if m.part != m.kind.default_part() {
        let part = match m.part {
            Part::StatusCode => "status_code",
            Part::Header => "header",
            Part::Body => "body",
            Part::All => "all",
        };
        out.insert(Value::from("part"), Value::from(part));
    }
    if m.condition == Condition::And {
        out.insert(Value::from("condition"), Value::from("and"));
    }
    if m.negative {
        out.insert(Value::from("negative"), Value::from(true));
    }
    Value::Mapping(out)
}

/// Rewrite `id` and `info.name` inside existing probe text, preserving every
/// other field and the document's structure. Import uses this after a
/// collision rename so the stored text reflects the final identity.
pub fn rewrite_identity(text: &str, id: &str, name: &str) -> Result<String> {
    let mut doc: Value =
        serde_yaml::from_str(text).map_err(|e| Error::Parse(format!("invalid yaml: {e}")))?;

    let map = doc
        .as_mapping_mut()
        .ok_or_else(|| Error::Parse("probe document is not a mapping".into()))?;
    map.insert(Value::from("id"), Value::from(id));

    let info = map
        .entry(Value::from("info"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    let info = info
        .as_mapping_mut()
        .ok_or_else(|| Error::Parse("`info` is not a mapping".into()))?;
    info.insert(Value::from("name"), Value::from(name));

    serde_yaml::to_string(&doc).map_err(|e| Error::Internal(format!("yaml rewrite failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
id: exposed-admin
info:
  name: Exposed Admin Panel
  author: ops
  severity: high
  description: Admin panel reachable without auth
  reference:
    - https://example.com/advisory
  tags: panel,exposure
http:
  - method: GET
    path:
      - "{{BaseURL}}/admin"
    headers:
      X-Probe: "1"
    matchers-condition: and
    matchers:
      - type: status
        status:
          - 200
      - type: word
        part: body
        words:
          - "Dashboard"
"#;

    #[test]
    fn parses_basic_probe() {
        let p = parse(BASIC).unwrap();
        assert_eq!(p.id, "exposed-admin");
        assert_eq!(p.name, "Exposed Admin Panel");
        assert_eq!(p.severity, Severity::High);
        assert_eq!(p.references.len(), 1);
        assert!(p.tags.contains("panel") && p.tags.contains("exposure"));
        assert_eq!(p.requests.len(), 1);
        let req = &p.requests[0];
        assert_eq!(req.method, "GET");
        assert_eq!(req.headers, vec![("X-Probe".to_string(), "1".to_string())]);
        assert_eq!(req.matchers_condition, Condition::And);
        assert_eq!(req.matchers.len(), 2);
        assert_eq!(req.matchers[0].kind, MatcherKind::Status(vec![200]));
    }

    #[test]
    fn missing_id_is_hard_failure() {
        let err = parse("info:\n  name: x\n").unwrap_err();
        assert!(err.to_string().contains("id"), "{err}");
    }

    #[test]
    fn metadata_defaults() {
        let p = parse("id: bare\n").unwrap();
        assert_eq!(p.severity, Severity::Info);
        assert!(p.tags.is_empty());
        assert!(p.references.is_empty());
        assert_eq!(p.name, "bare");
        assert!(p.requests.is_empty());
    }

    #[test]
    fn tags_accept_list_or_csv() {
        let csv = parse("id: a\ninfo:\n  tags: one, two ,two\n").unwrap();
        let list = parse("id: a\ninfo:\n  tags:\n    - one\n    - two\n").unwrap();
        assert_eq!(csv.tags, list.tags);
        assert_eq!(csv.tags.len(), 2);
    }

    #[test]
    fn unknown_matcher_type_is_diagnosed() {
        let text = "id: a\nhttp:\n  - method: GET\n    path: [\"{{BaseURL}}/\"]\n    matchers:\n      - type: xpath\n        words: [x]\n";
        let err = parse(text).unwrap_err();
        assert!(err.to_string().contains("xpath"), "{err}");
    }

    #[test]
    fn unknown_severity_is_diagnosed() {
        let err = parse("id: a\ninfo:\n  severity: catastrophic\n").unwrap_err();
        assert!(err.to_string().contains("catastrophic"), "{err}");
    }

    #[test]
    fn legacy_requests_section() {
        let text = "id: a\nrequests:\n  - method: POST\n    path: [\"{{BaseURL}}/login\"]\n";
        let p = parse(text).unwrap();
        assert_eq!(p.requests.len(), 1);
        assert_eq!(p.requests[0].method, "POST");
    }

    #[test]
    fn raw_block_short_circuits_structured_fields() {
        let text = "id: a\nhttp:\n  - raw:\n      - |\n        GET /x HTTP/1.1\n        Host: {{Hostname}}\n";
        let p = parse(text).unwrap();
        assert_eq!(p.requests.len(), 1);
        assert!(p.requests[0].raw.as_deref().unwrap().starts_with("GET /x"));
        assert!(p.requests[0].paths.is_empty());
    }

    #[test]
    fn request_without_path_or_raw_is_rejected() {
        let err = parse("id: a\nhttp:\n  - method: GET\n").unwrap_err();
        assert!(err.to_string().contains("path"), "{err}");
    }

    #[test]
    fn matcher_without_values_is_rejected() {
        let text =
            "id: a\nhttp:\n  - path: [\"{{BaseURL}}/\"]\n    matchers:\n      - type: word\n";
        assert!(parse(text).is_err());
    }

    #[test]
    fn serialize_round_trips() {
        let original = parse(BASIC).unwrap();
        let emitted = serialize(&original).unwrap();
        let reparsed = parse(&emitted).unwrap();
        assert_eq!(reparsed.id, original.id);
        assert_eq!(reparsed.name, original.name);
        assert_eq!(reparsed.severity, original.severity);
        assert_eq!(reparsed.references, original.references);
        assert_eq!(reparsed.tags, original.tags);
        assert_eq!(reparsed.requests, original.requests);
    }

    #[test]
    fn rewrite_identity_preserves_other_fields() {
        let rewritten = rewrite_identity(BASIC, "new-id", "Renamed").unwrap();
        let p = parse(&rewritten).unwrap();
        assert_eq!(p.id, "new-id");
        assert_eq!(p.name, "Renamed");
        assert_eq!(p.severity, Severity::High);
        assert_eq!(p.requests.len(), 1);
        assert_eq!(p.requests[0].matchers.len(), 2);
    }
}
