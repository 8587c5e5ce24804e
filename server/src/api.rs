//! HTTP API façade for the operator UI.
//!
//! One handler per operation; request/response bodies are typed structs and
//! failures map to a status code plus `{"error": message}` JSON.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::Error;
use crate::import;
use crate::parser;
use crate::settings::Settings;
use crate::types::*;

type ApiError = (StatusCode, Json<serde_json::Value>);
type ApiResult<T> = Result<T, ApiError>;

fn error_response(e: Error) -> ApiError {
    let status = match &e {
        Error::Parse(_) | Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) | Error::Cancelled => StatusCode::CONFLICT,
        Error::Network(_) => StatusCode::BAD_GATEWAY,
        Error::Io(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg.into() })))
}

/// Acquire the settings read lock, returning HTTP 500 if the lock is poisoned.
fn read_settings(
    ctx: &AppContext,
) -> Result<std::sync::RwLockReadGuard<'_, Settings>, ApiError> {
    ctx.settings.read().map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Internal server error" })),
        )
    })
}

/// Acquire the settings write lock, returning HTTP 500 if the lock is poisoned.
fn write_settings(
    ctx: &AppContext,
) -> Result<std::sync::RwLockWriteGuard<'_, Settings>, ApiError> {
    ctx.settings.write().map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Internal server error" })),
        )
    })
}

/// Assemble the full route table over the shared application state.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/api/probes", get(api_list_probes).post(api_create_probe))
        .route(
            "/api/probes/{id}",
            get(api_get_probe).put(api_update_probe).delete(api_delete_probe),
        )
        .route("/api/probes/{id}/export", get(api_export_probe))
        .route("/api/probes/import", post(api_import_text))
        .route("/api/probes/import-folder", post(api_import_folder))
        .route("/api/search", get(api_search))
        .route("/api/validate", post(api_validate))
        .route("/api/categories", get(api_list_categories).post(api_create_category))
        .route(
            "/api/categories/{*path}",
            put(api_rename_category).delete(api_delete_category),
        )
        .route("/api/stats", get(api_stats))
        .route("/api/scans", get(api_list_scans).post(api_start_scan))
        .route("/api/scans/{id}", get(api_scan_status))
        .route("/api/scans/{id}/results", get(api_scan_results))
        .route("/api/scans/{id}/stop", post(api_stop_scan))
        .route("/api/settings", get(api_get_settings).put(api_put_settings))
        .route("/api/settings/reload-templates", post(api_reload_templates))
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn api_health(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "library_loaded": ctx.library.is_loaded(),
    }))
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ListQuery {
    page: Option<usize>,
    size: Option<usize>,
    category: Option<String>,
    severity: Option<String>,
}

fn parse_severity(s: &str) -> ApiResult<Severity> {
    Severity::parse(s).ok_or_else(|| bad_request(format!("unknown severity `{s}`")))
}

async fn api_list_probes(
    State(ctx): State<AppContext>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    if let Some(cat) = &q.category {
        let probes = ctx.library.get_by_category(cat);
        let total = probes.len();
        return Ok(Json(json!({ "probes": probes, "total": total })));
    }
    if let Some(sev) = &q.severity {
        let probes = ctx.library.get_by_severity(parse_severity(sev)?);
        let total = probes.len();
        return Ok(Json(json!({ "probes": probes, "total": total })));
    }
    match (q.page, q.size) {
        (Some(page), size) => {
            let (probes, total) = ctx.library.get_paginated(page, size.unwrap_or(20));
            Ok(Json(json!({ "probes": probes, "total": total, "page": page })))
        }
        _ => {
            let probes = ctx.library.get_all();
            let total = probes.len();
            Ok(Json(json!({ "probes": probes, "total": total })))
        }
    }
}

async fn api_get_probe(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<Probe>> {
    ctx.library.get_by_id(&id).map(Json).map_err(error_response)
}

#[derive(Deserialize)]
struct ProbeBody {
    text: String,
    category: Option<String>,
}

/// Create a probe with the id it declares; duplicate ids are a conflict.
async fn api_create_probe(
    State(ctx): State<AppContext>,
    Json(body): Json<ProbeBody>,
) -> ApiResult<Json<Probe>> {
    let mut probe = parser::parse(&body.text).map_err(error_response)?;
    if ctx.library.get_meta(&probe.id).is_some() {
        return Err(error_response(Error::Conflict(format!(
            "probe `{}` already exists",
            probe.id
        ))));
    }
    probe.category = match body.category {
        Some(c) if !c.is_empty() => c,
        _ if !probe.category.is_empty() => probe.category,
        _ => DEFAULT_CATEGORY.to_string(),
    };
    ctx.library.save(&mut probe).map_err(error_response)?;
    Ok(Json(probe))
}

/// Full rewrite of an existing probe. The path id wins over the text's id.
async fn api_update_probe(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(body): Json<ProbeBody>,
) -> ApiResult<Json<Probe>> {
    let existing = ctx
        .library
        .get_meta(&id)
        .ok_or_else(|| error_response(Error::NotFound(format!("probe `{id}`"))))?;

    let mut probe = parser::parse(&body.text).map_err(error_response)?;
    let text = parser::rewrite_identity(&body.text, &id, &probe.name).map_err(error_response)?;
    probe.id = id;
    probe.content = Some(text);
    probe.category = match body.category {
        Some(c) if !c.is_empty() => c,
        _ => existing.category.clone(),
    };
    probe.file_path = existing.file_path.clone();
    probe.created_at = existing.created_at;
    ctx.library.save(&mut probe).map_err(error_response)?;
    Ok(Json(probe))
}

async fn api_delete_probe(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.library.delete(&id).map_err(error_response)?;
    Ok(Json(json!({ "deleted": id })))
}

async fn api_export_probe(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let probe = ctx.library.get_by_id(&id).map_err(error_response)?;
    let text = probe.content.unwrap_or_default();
    Ok(([("content-type", "application/yaml")], text))
}

async fn api_import_text(
    State(ctx): State<AppContext>,
    Json(body): Json<ProbeBody>,
) -> ApiResult<Json<Probe>> {
    import::import_text(&ctx.library, &body.text, body.category.as_deref())
        .map(Json)
        .map_err(error_response)
}

#[derive(Deserialize)]
struct ImportFolderBody {
    path: String,
}

async fn api_import_folder(
    State(ctx): State<AppContext>,
    Json(body): Json<ImportFolderBody>,
) -> ApiResult<Json<ImportReport>> {
    // Heavy filesystem walk; keep it off the async workers.
    let library = ctx.library.clone();
    let report = tokio::task::spawn_blocking(move || {
        import::import_folder(&library, std::path::Path::new(&body.path))
    })
    .await
    .map_err(|e| error_response(Error::Internal(format!("import task failed: {e}"))))?
    .map_err(error_response)?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: Option<String>,
    category: Option<String>,
    severity: Option<String>,
}

async fn api_search(
    State(ctx): State<AppContext>,
    Query(q): Query<SearchQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let severity = match &q.severity {
        Some(s) => Some(parse_severity(s)?),
        None => None,
    };
    let probes =
        ctx.library.search(q.q.as_deref().unwrap_or(""), q.category.as_deref(), severity);
    let total = probes.len();
    Ok(Json(json!({ "probes": probes, "total": total })))
}

#[derive(Deserialize)]
struct ValidateBody {
    text: String,
}

async fn api_validate(Json(body): Json<ValidateBody>) -> Json<serde_json::Value> {
    match parser::parse(&body.text) {
        Ok(probe) => Json(json!({ "valid": true, "id": probe.id })),
        Err(e) => Json(json!({ "valid": false, "diagnostic": e.to_string() })),
    }
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

async fn api_list_categories(State(ctx): State<AppContext>) -> Json<Vec<CategoryCount>> {
    Json(ctx.library.list_with_counts())
}

#[derive(Deserialize)]
struct CategoryBody {
    path: String,
}

async fn api_create_category(
    State(ctx): State<AppContext>,
    Json(body): Json<CategoryBody>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.library.create_category(&body.path).map_err(error_response)?;
    Ok(Json(json!({ "created": body.path })))
}

async fn api_delete_category(
    State(ctx): State<AppContext>,
    Path(path): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.library.delete_category(&path).map_err(error_response)?;
    Ok(Json(json!({ "deleted": path })))
}

#[derive(Deserialize)]
struct RenameBody {
    new: String,
}

async fn api_rename_category(
    State(ctx): State<AppContext>,
    Path(path): Path<String>,
    Json(body): Json<RenameBody>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.library.rename_category(&path, &body.new).map_err(error_response)?;
    Ok(Json(json!({ "renamed": path, "to": body.new })))
}

async fn api_stats(State(ctx): State<AppContext>) -> Json<LibraryStats> {
    Json(ctx.library.stats())
}

// ---------------------------------------------------------------------------
// Scans
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StartScanBody {
    targets: Vec<String>,
    probe_ids: Vec<String>,
    #[serde(default)]
    options: ScanOptions,
}

async fn api_start_scan(
    State(ctx): State<AppContext>,
    Json(body): Json<StartScanBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let job_id = ctx
        .scanner
        .start_scan(body.targets, body.probe_ids, body.options)
        .map_err(error_response)?;
    Ok(Json(json!({ "job_id": job_id })))
}

async fn api_stop_scan(
    State(ctx): State<AppContext>,
    Path(id): Path<u64>,
) -> ApiResult<Json<JobStatus>> {
    ctx.scanner.stop_scan(id).map(Json).map_err(error_response)
}

async fn api_scan_status(
    State(ctx): State<AppContext>,
    Path(id): Path<u64>,
) -> ApiResult<Json<JobStatus>> {
    ctx.scanner.status(id).map(Json).map_err(error_response)
}

async fn api_scan_results(
    State(ctx): State<AppContext>,
    Path(id): Path<u64>,
) -> ApiResult<Json<Vec<ScanResult>>> {
    ctx.scanner.results(id).map(Json).map_err(error_response)
}

async fn api_list_scans(State(ctx): State<AppContext>) -> Json<Vec<JobStatus>> {
    Json(ctx.scanner.all_jobs())
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

async fn api_get_settings(State(ctx): State<AppContext>) -> ApiResult<Json<Settings>> {
    Ok(Json(read_settings(&ctx)?.clone()))
}

/// Persist new settings and make them the live defaults for future scans.
/// The proxy and redirect policy of the shared HTTP client are fixed at
/// startup; a changed proxy takes effect on restart.
async fn api_put_settings(
    State(ctx): State<AppContext>,
    Json(new): Json<Settings>,
) -> ApiResult<Json<Settings>> {
    new.save().map_err(error_response)?;
    *write_settings(&ctx)? = new.clone();
    Ok(Json(new))
}

#[derive(Deserialize)]
struct ReloadBody {
    dir: Option<String>,
}

async fn api_reload_templates(
    State(ctx): State<AppContext>,
    Json(body): Json<ReloadBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let dir = body.dir.map(std::path::PathBuf::from);
    if let Some(d) = &dir {
        let mut settings = write_settings(&ctx)?;
        settings.templates_dir = d.clone();
        if let Err(e) = settings.save() {
            return Err(error_response(e));
        }
    }
    ctx.library.reload(dir);
    Ok(Json(json!({ "reloading": ctx.library.root().display().to_string() })))
}
