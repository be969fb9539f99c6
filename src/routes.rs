use std::io;

use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::access::{Access, AccessValidator, keys_match, require_global};
use crate::client::{DELETE_KEY_HEADER, UPLOAD_KEY_HEADER};
use crate::delete::DeleteOrchestrator;
use crate::error::{AppError, AppResult};
use crate::paths::{RelPath, sanitize_upload_path};
use crate::session::Viewer;
use crate::state::AppState;
use crate::storage::Storage;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/validate-key", post(validate_key))
        .route("/upload/{*path}", post(upload))
        .route("/files/{*path}", get(download))
        .route("/api/list", get(list))
        .route("/api/search", get(search))
        .route("/api/list-dirs", post(list_dirs))
        .route("/api/directories", get(directories))
        .route("/api/validate-upload-key", post(validate_upload_key))
        .route("/api/create-folder", post(create_folder))
        .route("/api/set-path-protection", post(set_path_protection))
        .route("/api/remove-path-protection", post(remove_path_protection))
        .route("/api/delete-items", post(delete_items))
        .route("/api/toggle-hidden", post(toggle_hidden))
        .route("/api/toggle-view-hidden", post(toggle_view_hidden))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct KeyedPath {
    path: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PathQuery {
    path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    q: String,
    path: String,
    recursive: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateFolderRequest {
    parent_path: String,
    folder_name: String,
    key: Option<String>,
    protection_password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProtectRequest {
    path: String,
    password: String,
    key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ToggleHiddenRequest {
    path: Option<String>,
    key: Option<String>,
    hide: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct KeyOnly {
    key: Option<String>,
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "public_dir": state.storage.root().display().to_string(),
    }))
}

/// Check a key for a protected path and remember the grant in the session.
pub async fn validate_key(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<KeyedPath>,
) -> Response {
    let reply = |status: StatusCode, kind: &str, message: &str| {
        (status, Json(json!({ "status": kind, "message": message })))
    };
    let (Some(raw), Some(key)) = (req.path, req.key) else {
        return reply(StatusCode::BAD_REQUEST, "error", "Missing path or key.").into_response();
    };
    let Ok(path) = RelPath::from_url(raw.trim_matches('/')) else {
        return reply(StatusCode::BAD_REQUEST, "error", "Invalid path.").into_response();
    };

    if !state.protection.is_protected(&path) {
        return reply(StatusCode::OK, "success", "Path is not protected.").into_response();
    }
    match AccessValidator::new(&state.protection).validate(&path, &key) {
        Access::Granted => {
            info!(path = %path, sessions = state.sessions.len(), "Session granted access");
            let (jar, ()) = state.sessions.update(jar, |viewer| viewer.grant(path));
            (jar, reply(StatusCode::OK, "success", "Access granted.")).into_response()
        }
        Access::Denied => reply(StatusCode::UNAUTHORIZED, "error", "Invalid access key.").into_response(),
    }
}

/// Stream a request body into the public tree.
pub async fn upload(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> AppResult<Response> {
    let rel = sanitize_upload_path(&raw)?;
    let dest = state.storage.confine(&rel)?;

    let dir = rel.parent().unwrap_or_default();
    let supplied = headers.get(UPLOAD_KEY_HEADER).and_then(|v| v.to_str().ok());
    AccessValidator::new(&state.protection).authorize_write(&dir, supplied, state.config.upload_key.as_deref())?;

    let length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    match length {
        None | Some(0) => return Err(AppError::BadRequest("Empty upload.".into())),
        Some(n) if n > state.config.max_upload_bytes as u64 => return Err(AppError::PayloadTooLarge),
        Some(_) => {}
    }
    if dest.is_dir() {
        return Err(AppError::BadRequest("Destination is an existing folder.".into()));
    }

    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));
    match state.storage.write_file(&rel, stream).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotADirectory => {
            return Err(AppError::BadRequest("Destination conflicts with an existing file.".into()));
        }
        Err(e) if e.kind() == io::ErrorKind::IsADirectory => {
            return Err(AppError::BadRequest("Destination is an existing folder.".into()));
        }
        Err(e) => return Err(e.into()),
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "message": "File uploaded successfully",
            "filename": rel.as_str(),
        })),
    )
        .into_response())
}

pub async fn download(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(raw): Path<String>,
) -> AppResult<Response> {
    let rel = RelPath::parse(&raw)?;
    let abs = state.storage.confine(&rel)?;
    let viewer = state.sessions.viewer(&jar);
    if !viewer.view_hidden && state.visibility.is_hidden(&rel) {
        return Err(AppError::NotFound("File not found.".into()));
    }
    if !viewer.can_open(&state.protection, &rel) {
        return Err(AppError::Forbidden("Access forbidden".into()));
    }

    let meta = match tokio::fs::metadata(&abs).await {
        Ok(meta) if meta.is_file() => meta,
        _ => return Err(AppError::NotFound("File not found.".into())),
    };
    let file = tokio::fs::File::open(&abs).await?;
    let body = Body::from_stream(tokio_util::io::ReaderStream::new(file));

    let mime = mime_guess::from_path(&abs).first_or_octet_stream().to_string();
    let disposition = format!(
        "inline; filename=\"{}\"",
        rel.file_name().unwrap_or("download").replace('"', "\\\"")
    );

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, meta.len().to_string()),
        ],
        body,
    )
        .into_response())
}

pub async fn list(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<PathQuery>,
) -> AppResult<Response> {
    let dir = RelPath::parse(&query.path)?;
    state.storage.confine(&dir)?;
    let viewer = state.sessions.viewer(&jar);
    if let Some(denied) = authentication_required(&state, &viewer, &dir) {
        return Ok(denied);
    }

    let listing = state.listing.clone();
    let (target, who) = (dir.clone(), viewer.clone());
    let entries = blocking(move || listing.list_directory(&target, &who)).await?;

    Ok(Json(json!({
        "path": dir.as_str(),
        "entries": entries,
        "is_hidden": state.visibility.is_hidden(&dir),
        "is_protected": state.protection.is_protected(&dir),
        "show_hidden": viewer.view_hidden,
    }))
    .into_response())
}

pub async fn search(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<SearchQuery>,
) -> AppResult<Response> {
    let needle = query.q.trim().to_string();
    if needle.is_empty() {
        return Err(AppError::BadRequest("Search query required.".into()));
    }
    let start = RelPath::parse(&query.path)?;
    state.storage.confine(&start)?;
    let viewer = state.sessions.viewer(&jar);
    if let Some(denied) = authentication_required(&state, &viewer, &start) {
        return Ok(denied);
    }

    let recursive = query.recursive.unwrap_or(true);
    let listing = state.listing.clone();
    let (from, term) = (start.clone(), needle.clone());
    let results = blocking(move || listing.find_by_name(&term, &from, recursive, &viewer)).await?;

    Ok(Json(json!({
        "query": needle,
        "path": start.as_str(),
        "recursive": recursive,
        "results": results,
    }))
    .into_response())
}

pub async fn list_dirs(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<PathQuery>,
) -> AppResult<Response> {
    let dir = RelPath::parse(req.path.trim_matches('/'))?;
    state.storage.confine(&dir)?;
    let viewer = state.sessions.viewer(&jar);
    if let Some(denied) = authentication_required(&state, &viewer, &dir) {
        return Ok(denied);
    }

    let listing = state.listing.clone();
    let target = dir.clone();
    let subdirs = blocking(move || listing.subdirectories(&target, &viewer)).await?;
    Ok(Json(json!({ "subdirs": subdirs, "current_path": dir.as_str() })).into_response())
}

pub async fn directories(State(state): State<AppState>, jar: CookieJar) -> AppResult<Json<Value>> {
    let viewer = state.sessions.viewer(&jar);
    let listing = state.listing.clone();
    let dirs = blocking(move || Ok(listing.all_directories(&viewer))).await?;
    Ok(Json(json!({ "directories": dirs })))
}

/// Lets a client find out whether its key will be accepted before sending
/// any file.
pub async fn validate_upload_key(
    State(state): State<AppState>,
    Json(req): Json<KeyedPath>,
) -> AppResult<Json<Value>> {
    let key = req.key.unwrap_or_default();
    if key.is_empty() {
        return Err(AppError::BadRequest("Upload key required.".into()));
    }
    let path = RelPath::parse(&req.path.unwrap_or_default())?;

    match state.protection.required_key(&path) {
        Some(required) if !keys_match(&key, &required) => {
            return Err(AppError::AuthDenied("Invalid key for this folder.".into()));
        }
        Some(_) => {}
        None => require_global(
            Some(&key),
            state.config.upload_key.as_deref(),
            "Server upload key not configured.",
            "Invalid upload key.",
        )?,
    }
    Ok(Json(json!({ "status": "success", "message": "Key valid." })))
}

pub async fn create_folder(
    State(state): State<AppState>,
    Json(req): Json<CreateFolderRequest>,
) -> AppResult<Response> {
    if req.folder_name.trim().is_empty() {
        return Err(AppError::BadRequest("Folder name required.".into()));
    }
    let Some(key) = req.key.filter(|k| !k.is_empty()) else {
        return Err(AppError::AuthDenied("API Key required.".into()));
    };
    require_global(
        Some(&key),
        state.config.upload_key.as_deref(),
        "Server upload key not configured.",
        "Invalid API Key.",
    )?;

    let parent = RelPath::parse(&req.parent_path)?;
    let created = state.storage.create_directory(&parent, &req.folder_name).await?;
    if let Some(password) = req.protection_password.filter(|p| !p.is_empty()) {
        if let Err(e) = state.protection.set_protection(&created, &password).await {
            // Roll back so the folder never exists unprotected.
            if let Err(undo) = state.storage.remove_recursive(&created).await {
                warn!(path = %created, error = %undo, "Could not remove folder after failed protection");
            }
            return Err(e);
        }
    }
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "success", "message": "Folder created successfully." })),
    )
        .into_response())
}

pub async fn set_path_protection(
    State(state): State<AppState>,
    Json(req): Json<ProtectRequest>,
) -> AppResult<Json<Value>> {
    if req.path.is_empty() {
        return Err(AppError::BadRequest("Path required.".into()));
    }
    if req.password.is_empty() {
        return Err(AppError::BadRequest("Protection password required.".into()));
    }
    let Some(key) = req.key.filter(|k| !k.is_empty()) else {
        return Err(AppError::AuthDenied("API Key required.".into()));
    };
    require_global(
        Some(&key),
        state.config.upload_key.as_deref(),
        "Server key not configured.",
        "Invalid API Key.",
    )?;

    let path = RelPath::parse(&req.path)?;
    if path.is_root() {
        return Err(AppError::BadRequest("Cannot protect root.".into()));
    }
    if state.storage.check_confined(&path).is_err() || !state.storage.exists(&path).await {
        return Err(AppError::NotFound("Path not found.".into()));
    }
    state.protection.set_protection(&path, &req.password).await?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("Path '{path}' is now protected."),
    })))
}

pub async fn remove_path_protection(
    State(state): State<AppState>,
    Json(req): Json<KeyedPath>,
) -> AppResult<Json<Value>> {
    require_global(
        req.key.as_deref().filter(|k| !k.is_empty()),
        state.config.upload_key.as_deref(),
        "Server key not configured.",
        "Invalid API Key.",
    )?;
    let path = RelPath::parse(&req.path.unwrap_or_default())?;
    if !state.protection.remove_protection(&path).await? {
        return Err(AppError::NotFound("Path is not protected.".into()));
    }
    Ok(Json(json!({
        "status": "success",
        "message": format!("Protection removed from '{path}'."),
    })))
}

pub async fn delete_items(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let supplied = headers.get(DELETE_KEY_HEADER).and_then(|v| v.to_str().ok());
    let configured = state.config.delete_key.as_deref();
    require_global(supplied, configured, "Deletion not configured.", "Invalid delete key.")?;

    let Some(items) = body.get("items_to_delete").and_then(Value::as_array) else {
        return Err(AppError::BadRequest("Invalid request body.".into()));
    };
    let orchestrator = DeleteOrchestrator::new(&*state.storage, &state.protection, &state.visibility);
    let report = orchestrator.delete_items(configured, supplied, items).await?;

    let status = if report.fail_count == 0 {
        StatusCode::OK
    } else {
        let partial = AppError::PartialBatchFailure {
            failed: report.fail_count,
            total: report.success_count + report.fail_count,
        };
        warn!(%partial, "Delete batch finished with failures");
        partial.status()
    };
    Ok((status, Json(report)).into_response())
}

pub async fn toggle_hidden(
    State(state): State<AppState>,
    Json(req): Json<ToggleHiddenRequest>,
) -> AppResult<Json<Value>> {
    let configured = state
        .config
        .hidden_key
        .as_deref()
        .ok_or(AppError::NotConfigured("Hidden feature not configured."))?;
    let (Some(raw), Some(key), Some(hide)) = (req.path, req.key, req.hide) else {
        return Err(AppError::BadRequest("Invalid request.".into()));
    };
    if !keys_match(&key, configured) {
        return Err(AppError::AuthDenied("Invalid key.".into()));
    }

    let path = RelPath::parse(&raw)?;
    if path.is_root() {
        return Err(AppError::BadRequest("Cannot hide root directory.".into()));
    }
    match state.storage.confine(&path) {
        Ok(abs) if abs.is_dir() => {}
        _ => return Err(AppError::NotFound("Invalid path.".into())),
    }
    state.visibility.set_hidden(&path, hide).await?;

    let action = if hide { "hidden" } else { "unhidden" };
    Ok(Json(json!({
        "status": "success",
        "message": format!("Folder '{path}' is now {action}."),
        "path": path.as_str(),
        "is_hidden": hide,
    })))
}

/// Flip the session's view-hidden flag.
pub async fn toggle_view_hidden(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<KeyOnly>,
) -> AppResult<Response> {
    require_global(
        req.key.as_deref(),
        state.config.hidden_key.as_deref(),
        "Hidden feature not configured.",
        "Invalid key.",
    )?;
    let (jar, show) = state.sessions.update(jar, |viewer| {
        viewer.view_hidden = !viewer.view_hidden;
        viewer.view_hidden
    });
    let message = if show {
        "Hidden folders are now visible."
    } else {
        "Hidden folders are now hidden."
    };
    Ok((
        jar,
        Json(json!({ "status": "success", "message": message, "show_hidden": show })),
    )
        .into_response())
}

fn authentication_required(state: &AppState, viewer: &Viewer, path: &RelPath) -> Option<Response> {
    if viewer.can_open(&state.protection, path) {
        return None;
    }
    Some(
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "Authentication required.",
                "requires_key": true,
                "path": path.as_str(),
            })),
        )
            .into_response(),
    )
}

async fn blocking<T, F>(f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Io(io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        temp: TempDir,
        app: Router,
        state: AppState,
    }

    impl TestApp {
        async fn new() -> Self {
            Self::with(|_| {}).await
        }

        async fn with(tweak: impl FnOnce(&mut ServerConfig)) -> Self {
            let temp = TempDir::new().unwrap();
            let mut config = ServerConfig {
                public_dir: temp.path().join("public"),
                host: "127.0.0.1".into(),
                port: 0,
                upload_key: Some("up".into()),
                delete_key: Some("del".into()),
                hidden_key: Some("hid".into()),
                folder_keys_config: temp.path().join("folder_keys.json"),
                visibility_config: temp.path().join("folder_visibility.json"),
                max_upload_bytes: 64,
                cors_origins: vec![],
            };
            tweak(&mut config);
            let state = AppState::new(config).await.unwrap();
            Self {
                app: router(state.clone()),
                state,
                temp,
            }
        }

        fn public(&self) -> std::path::PathBuf {
            self.temp.path().join("public")
        }

        fn write(&self, rel: &str, contents: &str) {
            let path = self.public().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }

        async fn send(&self, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
            let response = self.app.clone().oneshot(req).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let value = serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into()));
            (status, headers, value)
        }
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn with_cookie(mut req: Request<Body>, cookie: &str) -> Request<Body> {
        req.headers_mut().insert(header::COOKIE, cookie.parse().unwrap());
        req
    }

    fn session_cookie(headers: &HeaderMap) -> String {
        let raw = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        raw.split(';').next().unwrap().to_string()
    }

    fn upload_req(uri: &str, key: Option<&str>, body: &'static str) -> Request<Body> {
        let mut builder = Request::post(uri).header(header::CONTENT_LENGTH, body.len());
        if let Some(key) = key {
            builder = builder.header(UPLOAD_KEY_HEADER, key);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn protected_listing_needs_session_grant() {
        let t = TestApp::new().await;
        t.write("vault/secret.txt", "s");
        t.state
            .protection
            .set_protection(&RelPath::parse("vault").unwrap(), "open-sesame")
            .await
            .unwrap();

        let (status, _, body) = t.send(get("/api/list?path=vault")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({ "error": "Authentication required.", "requires_key": true, "path": "vault" }));

        let (status, _, body) = t
            .send(post_json("/validate-key", json!({ "path": "/vault/", "key": "nope" })))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid access key.");

        let (status, headers, body) = t
            .send(post_json("/validate-key", json!({ "path": "vault", "key": "open-sesame" })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        let cookie = session_cookie(&headers);

        let (status, _, body) = t.send(with_cookie(get("/api/list?path=vault"), &cookie)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["entries"][0]["name"], "secret.txt");

        let (status, _, body) = t.send(with_cookie(get("/files/vault/secret.txt"), &cookie)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("s".into()));
        let (status, _, _) = t.send(get("/files/vault/secret.txt")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn validate_key_on_open_path_and_missing_fields() {
        let t = TestApp::new().await;
        let (status, _, body) = t.send(post_json("/validate-key", json!({ "path": "x", "key": "" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Path is not protected.");
        let (status, _, body) = t.send(post_json("/validate-key", json!({ "path": "x" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Missing path or key.");
    }

    #[tokio::test]
    async fn upload_uses_folder_key_or_global_key() {
        let t = TestApp::new().await;
        t.write("vault/.keep", "");
        t.state
            .protection
            .set_protection(&RelPath::parse("vault").unwrap(), "vk")
            .await
            .unwrap();

        let (status, _, _) = t.send(upload_req("/upload/docs/a.txt", None, "hello")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _, body) = t.send(upload_req("/upload/docs/my%20notes.txt", Some("up"), "hello")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["filename"], "docs/my_notes.txt");
        assert_eq!(std::fs::read_to_string(t.public().join("docs/my_notes.txt")).unwrap(), "hello");

        let (status, _, _) = t.send(upload_req("/upload/vault/b.txt", Some("up"), "x")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _, _) = t.send(upload_req("/upload/vault/b.txt", Some("vk"), "x")).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn upload_rejects_bad_paths_empty_and_oversized_bodies() {
        let t = TestApp::new().await;
        let (status, _, _) = t.send(upload_req("/upload/../etc/passwd", Some("up"), "x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _, _) = t.send(upload_req("/upload/a.txt", Some("up"), "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let big = "x".repeat(100).leak();
        let (status, _, _) = t.send(upload_req("/upload/a.txt", Some("up"), big)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(!t.public().join("a.txt").exists());
    }

    #[tokio::test]
    async fn delete_reports_mixed_results_with_207() {
        let t = TestApp::new().await;
        t.write("a.txt", "a");
        let req = |key: &str| {
            Request::post("/api/delete-items")
                .header(header::CONTENT_TYPE, "application/json")
                .header(DELETE_KEY_HEADER, key)
                .body(Body::from(json!({ "items_to_delete": ["a.txt", "missing.txt"] }).to_string()))
                .unwrap()
        };

        let (status, _, body) = t.send(req("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid delete key.");
        assert!(t.public().join("a.txt").exists());

        let (status, _, body) = t.send(req("del")).await;
        assert_eq!(status, StatusCode::MULTI_STATUS);
        assert_eq!(
            body,
            json!({
                "success_count": 1,
                "fail_count": 1,
                "errors": [{ "path": "missing.txt", "error": "Item not found" }],
            })
        );
        assert!(!t.public().join("a.txt").exists());
    }

    #[tokio::test]
    async fn features_without_keys_answer_501() {
        let t = TestApp::with(|c| {
            c.delete_key = None;
            c.hidden_key = None;
        })
        .await;
        let delete = Request::post("/api/delete-items")
            .header(header::CONTENT_TYPE, "application/json")
            .header(DELETE_KEY_HEADER, "x")
            .body(Body::from(json!({ "items_to_delete": ["a"] }).to_string()))
            .unwrap();
        let (status, _, body) = t.send(delete).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body["error"], "Deletion not configured.");

        let (status, _, _) = t.send(post_json("/api/toggle-view-hidden", json!({ "key": "x" }))).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        let (status, _, _) = t
            .send(post_json("/api/toggle-hidden", json!({ "path": "a", "key": "x", "hide": true })))
            .await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn hidden_folders_leave_listings_until_revealed() {
        let t = TestApp::new().await;
        t.write("docs/internal/report.pdf", "r");
        t.write("docs/readme.txt", "r");

        let (status, _, body) = t
            .send(post_json("/api/toggle-hidden", json!({ "path": "docs/internal", "key": "hid", "hide": true })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Folder 'docs/internal' is now hidden.");

        let (_, _, body) = t.send(get("/api/list?path=docs")).await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 1);
        let (status, _, _) = t.send(get("/files/docs/internal/report.pdf")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = t.send(post_json("/api/toggle-view-hidden", json!({ "key": "bad" }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, headers, body) = t.send(post_json("/api/toggle-view-hidden", json!({ "key": "hid" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["show_hidden"], true);
        let cookie = session_cookie(&headers);

        let (_, _, body) = t.send(with_cookie(get("/api/list?path=docs"), &cookie)).await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 2);
        assert_eq!(body["show_hidden"], true);

        let (status, _, body) = t
            .send(post_json("/api/toggle-hidden", json!({ "path": "", "key": "hid", "hide": true })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Cannot hide root directory.");
    }

    #[tokio::test]
    async fn create_folder_and_protect_paths() {
        let t = TestApp::new().await;
        let (status, _, body) = t
            .send(post_json(
                "/api/create-folder",
                json!({ "parent_path": "", "folder_name": "Team Share", "key": "up", "protection_password": "pw" }),
            ))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["message"], "Folder created successfully.");
        assert!(t.state.protection.is_protected(&RelPath::parse("Team_Share").unwrap()));

        let (status, _, body) = t
            .send(post_json("/api/create-folder", json!({ "folder_name": "x" })))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "API Key required.");

        let (status, _, body) = t
            .send(post_json("/api/set-path-protection", json!({ "path": "ghost", "password": "p", "key": "up" })))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Path not found.");

        t.write("photos/a.jpg", "a");
        let (status, _, body) = t
            .send(post_json("/api/set-path-protection", json!({ "path": "photos", "password": "p", "key": "up" })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Path 'photos' is now protected.");
        let saved = std::fs::read_to_string(t.temp.path().join("folder_keys.json")).unwrap();
        assert!(saved.contains("\"photos\""));

        let unprotect = |key: &str| post_json("/api/remove-path-protection", json!({ "path": "photos", "key": key }));
        let (status, _, _) = t.send(unprotect("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _, _) = t.send(unprotect("up")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!t.state.protection.is_protected(&RelPath::parse("photos/a.jpg").unwrap()));
        let (status, _, _) = t.send(unprotect("up")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_onto_existing_folder_is_rejected() {
        let t = TestApp::new().await;
        t.write("docs/a.txt", "a");
        let (status, _, _) = t.send(upload_req("/upload/docs", Some("up"), "x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(t.public().join("docs/a.txt").exists());
    }

    #[tokio::test]
    async fn create_folder_rolls_back_when_protection_cannot_be_saved() {
        let t = TestApp::with(|c| {
            let keys = c.public_dir.with_file_name("keys_dir");
            std::fs::create_dir_all(keys.join("occupied")).unwrap();
            c.folder_keys_config = keys;
        })
        .await;
        let create = |password: Option<&str>| {
            post_json(
                "/api/create-folder",
                json!({ "parent_path": "", "folder_name": "Secret", "key": "up", "protection_password": password }),
            )
        };

        let (status, _, body) = t.send(create(Some("pw"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to save configuration.");
        assert!(!t.public().join("Secret").exists());

        let (status, _, _) = t.send(create(None)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(t.public().join("Secret").is_dir());
    }

    #[tokio::test]
    async fn upload_key_validation_messages() {
        let t = TestApp::new().await;
        t.write("vault/.keep", "");
        t.state
            .protection
            .set_protection(&RelPath::parse("vault").unwrap(), "vk")
            .await
            .unwrap();
        let check = |path: &str, key: &str| post_json("/api/validate-upload-key", json!({ "path": path, "key": key }));

        let (status, _, body) = t.send(check("", "")).await;
        assert_eq!((status, body["error"].clone()), (StatusCode::BAD_REQUEST, json!("Upload key required.")));
        let (status, _, body) = t.send(check("vault", "up")).await;
        assert_eq!((status, body["error"].clone()), (StatusCode::UNAUTHORIZED, json!("Invalid key for this folder.")));
        let (status, _, _) = t.send(check("vault/sub", "vk")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, body) = t.send(check("docs", "nope")).await;
        assert_eq!((status, body["error"].clone()), (StatusCode::UNAUTHORIZED, json!("Invalid upload key.")));
        let (status, _, body) = t.send(check("docs", "up")).await;
        assert_eq!((status, body["message"].clone()), (StatusCode::OK, json!("Key valid.")));
    }

    #[tokio::test]
    async fn search_directories_and_health() {
        let t = TestApp::new().await;
        t.write("music/Song One.mp3", "m");
        t.write("music/live/song-two.mp3", "m");

        let (status, _, body) = t.send(get("/api/search?q=SONG&path=music")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"].as_array().unwrap().len(), 2);
        let (_, _, body) = t.send(get("/api/search?q=song&path=music&recursive=false")).await;
        assert_eq!(body["results"].as_array().unwrap().len(), 1);

        let (_, _, body) = t.send(get("/api/directories")).await;
        assert_eq!(body["directories"], json!(["music", "music/live"]));

        let (_, _, body) = t.send(post_json("/api/list-dirs", json!({ "path": "/music/" }))).await;
        assert_eq!(body["subdirs"], json!([{ "name": "live", "is_protected": false }]));

        let (status, _, body) = t.send(get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
