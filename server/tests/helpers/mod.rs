//! Test harness for library and scan integration tests.
//!
//! Builds probe libraries in temp dirs from inline YAML and spins up
//! in-process mock HTTP targets so scans run against real sockets without
//! leaving the host.

#![allow(dead_code)]

pub mod target;

use probemgr_server::library::ProbeLibrary;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestLibrary {
    pub library: Arc<ProbeLibrary>,
    _temp_dir: TempDir,
}

impl TestLibrary {
    /// Library over an empty temp root, loaded synchronously.
    pub fn empty() -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        let library = ProbeLibrary::open_blocking(temp_dir.path());
        Self { library, _temp_dir: temp_dir }
    }

    /// Library seeded with `(relative_path, yaml_text)` files.
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        for (rel, text) in files {
            let path = temp_dir.path().join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).expect("mkdir");
            }
            std::fs::write(&path, text).expect("write probe");
        }
        let library = ProbeLibrary::open_blocking(temp_dir.path());
        Self { library, _temp_dir: temp_dir }
    }

    pub fn root(&self) -> &Path {
        self._temp_dir.path()
    }
}

/// Probe that matches on a 200 status.
pub fn status_probe(id: &str, name: &str, severity: &str) -> String {
    format!(
        r#"id: {id}
info:
  name: {name}
  severity: {severity}
http:
  - method: GET
    path:
      - "{{{{BaseURL}}}}/"
    matchers:
      - type: status
        status:
          - 200
"#
    )
}

/// Probe requiring every listed word in the body.
pub fn word_and_probe(id: &str, words: &[&str]) -> String {
    let list = words.iter().map(|w| format!("          - \"{w}\"")).collect::<Vec<_>>().join("\n");
    format!(
        r#"id: {id}
info:
  name: {id}
  severity: medium
http:
  - method: GET
    path:
      - "{{{{BaseURL}}}}/"
    matchers:
      - type: word
        condition: and
        part: body
        words:
{list}
"#
    )
}
