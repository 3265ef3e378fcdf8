//! HTTP boundary: the upload-pack endpoint and the streaming glue between
//! the orchestrator and the response body.

use std::convert::Infallible;
use std::io::Read as _;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use base64::Engine as _;
use bytes::Bytes;
use git_http::errors::GitHttpError;
use git_http::negotiation::UploadPackInput;
use metrics::counter;
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt as _, once};

use crate::config::Config;
use crate::pack_cache::PackCacheCleaner;
use crate::upload_pack::UploadPackHandler;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cleaner: Arc<PackCacheCleaner>,
    pub sema: Option<Arc<Semaphore>>,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        let cleaner = Arc::new(PackCacheCleaner::new(&config));
        let sema = match config.upload_pack_sema {
            0 => None,
            permits => Some(Arc::new(Semaphore::new(permits))),
        };
        AppState {
            config,
            cleaner,
            sema,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/{*path}", post(git_handler))
        .with_state(state)
}

/// POST /<repo_path>/git-upload-pack
///
/// The orchestrator runs as a detached task feeding a bounded channel; the
/// channel is the response body. Boundary errors raised before the first
/// byte map to an HTTP status, anything later travels in-band as pkt-line
/// `ERR` frames.
async fn git_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(repo_path) = path.strip_suffix("/git-upload-pack") else {
        // passthrough routes are not this proxy's business
        return GitHttpError::NotFound.into_response();
    };
    if let Err(reason) = validate_repo_path(repo_path) {
        return GitHttpError::BadRequest(reason).into_response();
    }

    let auth = basic_auth(&headers).unwrap_or_default();
    let protocol_version = protocol_version(&headers);

    let bytes = match axum::body::to_bytes(body, state.config.git_max_body).await {
        Ok(bytes) => bytes,
        Err(_) => return GitHttpError::BadRequest("invalid request body".into()).into_response(),
    };
    let bytes = match decode_body(&headers, bytes) {
        Ok(bytes) => bytes,
        Err(reason) => return GitHttpError::BadRequest(reason).into_response(),
    };

    counter!("git_cdn.requests_total").increment(1);
    let parsed = UploadPackInput::parse(bytes, protocol_version);

    let (tx, mut rx) = mpsc::channel::<Bytes>(16);
    let mut handler = UploadPackHandler::new(
        repo_path,
        &auth,
        protocol_version,
        tx,
        state.sema.clone(),
        state.config.clone(),
        state.cleaner.clone(),
    );
    let task = tokio::spawn(async move {
        let result = handler.run(&parsed).await;
        if let Err(err) = &result {
            tracing::warn!(%err, "upload-pack request failed");
        }
        result
    });

    match rx.recv().await {
        Some(first) => {
            // The task stays detached from the response: a client that goes
            // away mid-stream must not abort a cache write in progress.
            let stream = once(Ok::<_, Infallible>(first)).chain(ReceiverStream::new(rx).map(Ok));
            upload_pack_response(Body::from_stream(stream))
        }
        None => match task.await {
            // degenerate negotiation: empty body, empty answer
            Ok(Ok(())) => upload_pack_response(Body::empty()),
            Ok(Err(err)) => err.into_response(),
            Err(join_err) => {
                tracing::error!(%join_err, "upload-pack task panicked");
                GitHttpError::internal("upload-pack task failed").into_response()
            }
        },
    }
}

fn upload_pack_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-git-upload-pack-result")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .expect("response build")
}

fn validate_repo_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("empty repository path".to_string());
    }
    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(format!("invalid repository path {path}"));
    }
    Ok(())
}

/// `Authorization: Basic <base64 user:token>`; anything malformed reads as
/// anonymous and the upstream decides.
fn basic_auth(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    String::from_utf8(decoded).ok()
}

fn protocol_version(headers: &HeaderMap) -> u8 {
    match headers.get("Git-Protocol").and_then(|v| v.to_str().ok()) {
        Some(value) if value.contains("version=2") => 2,
        _ => 1,
    }
}

fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Bytes, String> {
    let gzip = matches!(
        headers.get(header::CONTENT_ENCODING).map(|v| v.to_str()),
        Some(Ok("gzip"))
    );
    if !gzip {
        return Ok(body);
    }
    let mut decoded = Vec::new();
    flate2::read::GzDecoder::new(&body[..])
        .read_to_end(&mut decoded)
        .map_err(|err| format!("invalid gzip body: {err}"))?;
    Ok(decoded.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use std::io::Write as _;
    use tower::ServiceExt as _;
    use url::Url;

    fn test_state(workdir: &std::path::Path) -> AppState {
        AppState::new(Arc::new(Config::new(
            workdir.to_path_buf(),
            Url::parse("https://gitlab.example.com/").unwrap(),
        )))
    }

    #[tokio::test]
    async fn non_upload_pack_routes_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(
                Request::post("/group/project.git/info/refs")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn traversal_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(
                Request::post("/a/../b.git/git-upload-pack")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_negotiation_gets_empty_ok() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(
                Request::post("/group/project.git/git-upload-pack")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("application/x-git-upload-pack-result")
        );
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn basic_auth_decodes_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            "Basic dXNlcjp0b2tlbg==".parse().unwrap(),
        );
        assert_eq!(basic_auth(&headers).as_deref(), Some("user:token"));

        headers.insert(header::AUTHORIZATION, "Bearer xyz".parse().unwrap());
        assert!(basic_auth(&headers).is_none());
    }

    #[test]
    fn protocol_version_from_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(protocol_version(&headers), 1);
        headers.insert("Git-Protocol", "version=2".parse().unwrap());
        assert_eq!(protocol_version(&headers), 2);
    }

    #[test]
    fn gzip_bodies_are_decoded() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"0000").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        let decoded = decode_body(&headers, Bytes::from(compressed)).unwrap();
        assert_eq!(&decoded[..], b"0000");

        assert!(decode_body(&headers, Bytes::from_static(b"not gzip")).is_err());
    }
}
