//! Matcher evaluation over captured HTTP exchanges.
//!
//! Pure: the scanner captures a bounded response, this module scores it.
//! Evidence strings are best-effort summaries for the operator; the boolean
//! verdict is the contract.

use crate::dsl::{self, DslContext};
use crate::types::*;
use dashmap::DashMap;
use regex::Regex;
use std::borrow::Cow;
use std::sync::{Arc, OnceLock};
use tracing::warn;

// ---------------------------------------------------------------------------
// Captured response
// ---------------------------------------------------------------------------

/// An HTTP response as seen by the matchers: status, parsed headers, and a
/// body already truncated to the read bound.
#[derive(Debug, Clone, Default)]
pub struct CapturedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedResponse {
    pub fn header_text(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.headers {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
        out
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Text a matcher's `part` selector resolves to.
    pub fn part_text(&self, part: Part) -> String {
        match part {
            Part::StatusCode => self.status.to_string(),
            Part::Header => self.header_text(),
            Part::Body => self.body_text().into_owned(),
            Part::All => format!("{}\r\n{}", self.header_text(), self.body_text()),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a matcher list under its aggregation condition.
///
/// An empty list is the conservative sentinel: true iff status == 200, so a
/// misauthored probe does not fire on every response.
pub fn evaluate(
    matchers: &[Matcher],
    condition: Condition,
    resp: &CapturedResponse,
) -> (bool, String) {
    if matchers.is_empty() {
        let matched = resp.status == 200;
        return (matched, if matched { "Status: 200".to_string() } else { String::new() });
    }

    let mut evidence: Vec<String> = Vec::new();
    let mut all = true;
    let mut any = false;
    for matcher in matchers {
        let (ok, detail) = eval_matcher(matcher, resp);
        if ok {
            any = true;
            if let Some(d) = detail {
                evidence.push(d);
            }
        } else {
            all = false;
        }
    }

    let matched = match condition {
        Condition::And => all,
        Condition::Or => any,
    };
    (matched, if matched { evidence.join("; ") } else { String::new() })
}

/// Per-matcher verdict plus an evidence line when it contributes.
fn eval_matcher(matcher: &Matcher, resp: &CapturedResponse) -> (bool, Option<String>) {
    let (raw_verdict, detail) = match &matcher.kind {
        MatcherKind::Status(codes) => {
            let hit = codes.contains(&resp.status);
            (hit, format!("Status: {}", resp.status))
        }
        MatcherKind::Word(words) => {
            let text = resp.part_text(matcher.part);
            let hits: Vec<&String> = words.iter().filter(|w| text.contains(w.as_str())).collect();
            let verdict = match matcher.condition {
                Condition::And => hits.len() == words.len(),
                Condition::Or => !hits.is_empty(),
            };
            let shown = if hits.is_empty() { words.first() } else { hits.first().copied() };
            (verdict, format!("Word: {}", shown.map(String::as_str).unwrap_or("")))
        }
        MatcherKind::Regex(patterns) => {
            let text = resp.part_text(matcher.part);
            let mut hit_pattern: Option<&str> = None;
            let mut hits = 0usize;
            for pattern in patterns {
                let Some(re) = compiled(pattern) else { continue };
                if re.is_match(&text) {
                    hits += 1;
                    hit_pattern.get_or_insert(pattern);
                }
            }
            let verdict = match matcher.condition {
                Condition::And => hits == patterns.len(),
                Condition::Or => hits > 0,
            };
            let shown = hit_pattern.unwrap_or_else(|| {
                patterns.first().map(String::as_str).unwrap_or("")
            });
            (verdict, format!("Regex: {shown}"))
        }
        MatcherKind::Binary(needles) => {
            let mut hit_needle: Option<&str> = None;
            let mut hits = 0usize;
            for needle in needles {
                match hex::decode(needle.trim()) {
                    Ok(bytes) if !bytes.is_empty() => {
                        if find_subslice(&resp.body, &bytes) {
                            hits += 1;
                            hit_needle.get_or_insert(needle);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(needle = needle.as_str(), error = %e, "Bad binary matcher needle");
                    }
                }
            }
            let verdict = match matcher.condition {
                Condition::And => hits == needles.len(),
                Condition::Or => hits > 0,
            };
            let shown =
                hit_needle.unwrap_or_else(|| needles.first().map(String::as_str).unwrap_or(""));
            (verdict, format!("Binary: {shown}"))
        }
        MatcherKind::Dsl(expressions) => {
            let body = resp.body_text();
            let ctx = DslContext {
                status_code: resp.status,
                body: &body,
                headers: &resp.headers,
            };
            let mut hit_expr: Option<&str> = None;
            let mut hits = 0usize;
            for expr in expressions {
                match dsl::eval(expr, &ctx) {
                    Ok(true) => {
                        hits += 1;
                        hit_expr.get_or_insert(expr);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(expr = expr.as_str(), error = %e, "DSL expression rejected");
                    }
                }
            }
            let verdict = match matcher.condition {
                Condition::And => hits == expressions.len(),
                Condition::Or => hits > 0,
            };
            let shown =
                hit_expr.unwrap_or_else(|| expressions.first().map(String::as_str).unwrap_or(""));
            (verdict, format!("DSL: {shown}"))
        }
    };

    let verdict = if matcher.negative { !raw_verdict } else { raw_verdict };
    let evidence = if verdict {
        Some(if matcher.negative { format!("Negative {detail}") } else { detail })
    } else {
        None
    };
    (verdict, evidence)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Process-wide compiled regex cache. Invalid patterns are cached as `None`
/// so they are diagnosed once, not per response.
fn compiled(pattern: &str) -> Option<Arc<Regex>> {
    static CACHE: OnceLock<DashMap<String, Option<Arc<Regex>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(DashMap::new);
    if let Some(entry) = cache.get(pattern) {
        return entry.value().clone();
    }
    let compiled = match Regex::new(pattern) {
        Ok(re) => Some(Arc::new(re)),
        Err(e) => {
            warn!(pattern = pattern, error = %e, "Invalid regex matcher pattern");
            None
        }
    };
    cache.insert(pattern.to_string(), compiled.clone());
    compiled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> CapturedResponse {
        CapturedResponse {
            status,
            headers: vec![("Server".to_string(), "nginx".to_string())],
            body: body.as_bytes().to_vec(),
        }
    }

    fn word_matcher(words: &[&str], condition: Condition, negative: bool) -> Matcher {
        Matcher {
            kind: MatcherKind::Word(words.iter().map(|s| s.to_string()).collect()),
            part: Part::Body,
            condition,
            negative,
        }
    }

    #[test]
    fn status_matcher() {
        let m = Matcher {
            kind: MatcherKind::Status(vec![200, 301]),
            part: Part::StatusCode,
            condition: Condition::Or,
            negative: false,
        };
        let (ok, evidence) = evaluate(&[m.clone()], Condition::Or, &response(200, ""));
        assert!(ok);
        assert!(evidence.contains("Status: 200"));
        let (ok, _) = evaluate(&[m], Condition::Or, &response(404, ""));
        assert!(!ok);
    }

    #[test]
    fn word_and_requires_every_word() {
        let m = word_matcher(&["alpha", "omega"], Condition::And, false);
        let (ok, _) = evaluate(&[m.clone()], Condition::Or, &response(200, "alpha only"));
        assert!(!ok);
        let (ok, _) = evaluate(&[m], Condition::Or, &response(200, "alpha and omega"));
        assert!(ok);
    }

    #[test]
    fn word_or_needs_any() {
        let m = word_matcher(&["alpha", "omega"], Condition::Or, false);
        let (ok, evidence) = evaluate(&[m], Condition::Or, &response(200, "omega only"));
        assert!(ok);
        assert!(evidence.contains("Word: omega"));
    }

    #[test]
    fn negative_inverts_verdict() {
        let m = word_matcher(&["error"], Condition::Or, true);
        let (ok, evidence) = evaluate(&[m.clone()], Condition::Or, &response(200, "all good"));
        assert!(ok, "absent word with negative=true must match");
        assert!(evidence.contains("Negative"));
        let (ok, _) = evaluate(&[m], Condition::Or, &response(200, "an error occurred"));
        assert!(!ok);
    }

    #[test]
    fn regex_uses_real_engine() {
        let m = Matcher {
            kind: MatcherKind::Regex(vec![r"ver\d+\.\d+".to_string()]),
            part: Part::Body,
            condition: Condition::Or,
            negative: false,
        };
        let (ok, _) = evaluate(&[m.clone()], Condition::Or, &response(200, "ver1.24 ready"));
        assert!(ok);
        // Substring semantics would match this; a real engine must not.
        let (ok, _) = evaluate(&[m], Condition::Or, &response(200, r"literal ver\d+\.\d+"));
        assert!(!ok);
    }

    #[test]
    fn invalid_regex_is_a_non_match() {
        let m = Matcher {
            kind: MatcherKind::Regex(vec!["(unclosed".to_string()]),
            part: Part::Body,
            condition: Condition::Or,
            negative: false,
        };
        let (ok, _) = evaluate(&[m], Condition::Or, &response(200, "(unclosed"));
        assert!(!ok);
    }

    #[test]
    fn binary_searches_raw_body() {
        let m = Matcher {
            kind: MatcherKind::Binary(vec!["89504e47".to_string()]),
            part: Part::Body,
            condition: Condition::Or,
            negative: false,
        };
        let mut resp = response(200, "");
        resp.body = vec![0x00, 0x89, 0x50, 0x4e, 0x47, 0xff];
        let (ok, evidence) = evaluate(&[m], Condition::Or, &resp);
        assert!(ok);
        assert!(evidence.contains("Binary"));
    }

    #[test]
    fn header_part_sees_headers() {
        let m = Matcher {
            kind: MatcherKind::Word(vec!["nginx".to_string()]),
            part: Part::Header,
            condition: Condition::Or,
            negative: false,
        };
        let (ok, _) = evaluate(&[m], Condition::Or, &response(200, "no server name here"));
        assert!(ok);
    }

    #[test]
    fn dsl_matcher_evaluates_expressions() {
        let m = Matcher {
            kind: MatcherKind::Dsl(vec![
                "status_code == 200 && contains(body, 'token')".to_string()
            ]),
            part: Part::All,
            condition: Condition::Or,
            negative: false,
        };
        let (ok, _) = evaluate(&[m.clone()], Condition::Or, &response(200, "token=abc"));
        assert!(ok);
        let (ok, _) = evaluate(&[m], Condition::Or, &response(500, "token=abc"));
        assert!(!ok);
    }

    #[test]
    fn malformed_dsl_is_a_non_match() {
        let m = Matcher {
            kind: MatcherKind::Dsl(vec!["contains(".to_string()]),
            part: Part::All,
            condition: Condition::Or,
            negative: false,
        };
        let (ok, _) = evaluate(&[m], Condition::Or, &response(200, "anything"));
        assert!(!ok);
    }

    #[test]
    fn empty_matcher_list_sentinel() {
        let (ok, evidence) = evaluate(&[], Condition::Or, &response(200, "x"));
        assert!(ok);
        assert_eq!(evidence, "Status: 200");
        let (ok, _) = evaluate(&[], Condition::Or, &response(404, "x"));
        assert!(!ok);
    }

    #[test]
    fn and_aggregation_across_matchers() {
        let status = Matcher {
            kind: MatcherKind::Status(vec![200]),
            part: Part::StatusCode,
            condition: Condition::Or,
            negative: false,
        };
        let word = word_matcher(&["admin"], Condition::Or, false);
        let both = [status, word];
        let (ok, evidence) = evaluate(&both, Condition::And, &response(200, "admin panel"));
        assert!(ok);
        assert!(evidence.contains("Status: 200") && evidence.contains("Word: admin"));
        let (ok, _) = evaluate(&both, Condition::And, &response(200, "nothing"));
        assert!(!ok);
        let (ok, _) = evaluate(&both, Condition::Or, &response(200, "nothing"));
        assert!(ok, "or aggregation fires on the status matcher alone");
    }
}
