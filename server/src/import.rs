//! Probe import: the single entry point for turning external probe text
//! into a stored, uniquely named library member, plus recursive folder
//! import that keeps going past bad files.

use crate::error::{Error, Result};
use crate::library::ProbeLibrary;
use crate::parser;
use crate::types::*;
use chrono::Utc;
use ignore::WalkBuilder;
use std::path::Path;
use tracing::{info, warn};

/// Import probe text into the library.
///
/// Category resolution: explicit parameter, then the probe's declared
/// category, then `custom`. Name collisions within the category are resolved
/// with `unique_name`; a renamed probe is re-serialized so the stored text
/// reflects the final identity. The stored probe always gets a fresh
/// library-unique id.
pub fn import_text(
    library: &ProbeLibrary,
    text: &str,
    category: Option<&str>,
) -> Result<Probe> {
    let mut probe = parser::parse(text)?;

    let category = match category {
        Some(c) if !c.is_empty() => c.to_string(),
        _ if !probe.category.is_empty() => probe.category.clone(),
        _ => DEFAULT_CATEGORY.to_string(),
    };
    validate_category(&category)?;

    let name = library.unique_name(&category, &probe.name);
    let id = uuid::Uuid::new_v4().to_string();
    probe.content = Some(parser::rewrite_identity(text, &id, &name)?);
    probe.id = id;
    probe.name = name;
    probe.category = category;
    probe.file_path = std::path::PathBuf::new();
    let now = Utc::now();
    probe.created_at = now;
    probe.updated_at = now;

    library.save(&mut probe)?;
    info!(id = probe.id.as_str(), name = probe.name.as_str(),
          category = probe.category.as_str(), "Probe imported");
    Ok(probe)
}

/// Recursively import every `.yaml`/`.yml` under `dir`.
///
/// The category of each file derives from its subpath relative to the import
/// root (at most three segments, invalid characters replaced with `_`); files
/// directly under the root land in a category named after the folder itself.
/// Failures are collected per file and never abort the batch.
pub fn import_folder(library: &ProbeLibrary, dir: &Path) -> Result<ImportReport> {
    if !dir.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "`{}` is not a directory",
            dir.display()
        )));
    }

    let mut report = ImportReport::default();
    for entry in WalkBuilder::new(dir)
        .hidden(true)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build()
        .flatten()
    {
        let path = entry.path();
        if !entry.file_type().is_some_and(|ft| ft.is_file())
            || !crate::library::is_probe_file(path)
        {
            continue;
        }
        let category = category_for_entry(dir, path);
        match std::fs::read_to_string(path) {
            Ok(text) => match import_text(library, &text, Some(&category)) {
                Ok(_) => report.success += 1,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Import failed");
                    report.failed += 1;
                    report.errors.push(format!("{}: {e}", path.display()));
                }
            },
            Err(e) => {
                report.failed += 1;
                report.errors.push(format!("{}: {e}", path.display()));
            }
        }
    }

    info!(success = report.success, failed = report.failed, dir = %dir.display(),
          "Folder import finished");
    Ok(report)
}

/// Category for an imported file: sanitized relative subpath, or the import
/// folder's basename for files at the top level.
fn category_for_entry(root: &Path, file: &Path) -> String {
    let segments: Vec<String> = file
        .parent()
        .and_then(|p| p.strip_prefix(root).ok())
        .map(|rel| {
            rel.components()
                .filter_map(|c| c.as_os_str().to_str())
                .map(sanitize_segment)
                .filter(|s| !s.is_empty())
                .take(MAX_CATEGORY_DEPTH)
                .collect()
        })
        .unwrap_or_default();

    if segments.is_empty() {
        root.file_name()
            .and_then(|n| n.to_str())
            .map(sanitize_segment)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string())
    } else {
        segments.join("/")
    }
}

/// Replace forbidden path characters with `_`.
fn sanitize_segment(segment: &str) -> String {
    segment
        .trim()
        .chars()
        .map(|c| if CATEGORY_FORBIDDEN_CHARS.contains(&c) { '_' } else { c })
        .collect()
}
