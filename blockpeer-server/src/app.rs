use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use blockpeer_cache::{BlockCache, BlockId, ContentKey};
use blockpeer_proxy::{File, LocalStore, MirrorRequest, PrefetchHandle, RemoteReader};
use blockpeer_router::Router;
use http::{header, Method, Response, StatusCode};
use log::{error, info, warn};
use pingora::apps::http_app::ServeHttp;
use pingora::protocols::http::ServerSession;
use uuid::Uuid;

use crate::error::ServeError;
use crate::util::{response_no_body, response_string};

const BLOBS_PREFIX: &str = "/blobs/";
const V2_PREFIX: &str = "/v2/";

/// Top-level `ServeHttp` app: dispatches by method+path the way
/// `peserver::worker::HttpRunnerApp` does, fronting the two surfaces spec.md
/// §6 names — `/blobs/*url` (block cache, peer-facing) and `/v2/*` (mirror
/// proxy, whole-response, consumed by the local container runtime).
///
/// `Clone` so the same app can back both the plain and TLS listeners
/// (spec.md §6: HTTP API served on both) as two independent `Service`s.
#[derive(Clone)]
pub struct PeerdApp {
    pub cache: BlockCache,
    pub router: Arc<dyn Router>,
    pub local_store: Arc<dyn LocalStore>,
    pub remote: Arc<RemoteReader>,
    pub prefetch: PrefetchHandle,
    pub resolve_timeout: Duration,
    pub resolve_retries: usize,
}

fn correlation_id(req: &http::request::Parts) -> String {
    req.headers
        .get(blockpeer_proxy::CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Parses `Range: bytes=a-b`, returning the start offset. Absent header
/// starts at 0, per spec.md §6.
fn range_start(headers: &http::HeaderMap) -> Result<u64, ServeError> {
    let Some(value) = headers.get(header::RANGE) else {
        return Ok(0);
    };
    let value = value
        .to_str()
        .map_err(|_| ServeError::BadRequest("invalid Range header".to_string()))?;
    let spec = value
        .strip_prefix("bytes=")
        .ok_or_else(|| ServeError::BadRequest("unsupported Range unit".to_string()))?;
    let start = spec
        .split('-')
        .next()
        .ok_or_else(|| ServeError::BadRequest("empty Range".to_string()))?;
    start
        .parse::<u64>()
        .map_err(|_| ServeError::BadRequest("malformed Range start".to_string()))
}

/// Parses the (optional) end offset out of `Range: bytes=a-b`. `None` means
/// either no Range header, or an open-ended range (`bytes=a-`) — read to
/// end of object either way.
fn range_end(headers: &http::HeaderMap) -> Result<Option<u64>, ServeError> {
    let Some(value) = headers.get(header::RANGE) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| ServeError::BadRequest("invalid Range header".to_string()))?;
    let spec = value
        .strip_prefix("bytes=")
        .ok_or_else(|| ServeError::BadRequest("unsupported Range unit".to_string()))?;
    let mut parts = spec.splitn(2, '-');
    let _start = parts.next();
    let end = parts.next().unwrap_or("").trim();
    if end.is_empty() {
        return Ok(None);
    }
    end.parse::<u64>()
        .map(Some)
        .map_err(|_| ServeError::BadRequest("malformed Range end".to_string()))
}

impl PeerdApp {
    async fn handle_blobs(
        &self,
        session: &mut ServerSession,
        head_only: bool,
    ) -> Result<Response<Vec<u8>>, ServeError> {
        let (key, peer_mode, has_range, start, requested_end) = {
            let req: &http::request::Parts = session.req_header();
            let key_str = req
                .uri
                .path()
                .strip_prefix(BLOBS_PREFIX)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    ServeError::BadRequest("missing content key in /blobs path".to_string())
                })?;
            let key = ContentKey::parse(key_str)
                .map_err(|e| ServeError::BadRequest(format!("bad content key: {e}")))?;
            let peer_mode = req
                .headers
                .get(blockpeer_proxy::PEER_HEADER)
                .map(|v| v == "true")
                .unwrap_or(false);
            let has_range = req.headers.contains_key(header::RANGE);
            let start = range_start(&req.headers)?;
            let requested_end = range_end(&req.headers)?;
            (key, peer_mode, has_range, start, requested_end)
        };
        let aligned = BlockId::align(start);

        let file = File::open(
            key.clone(),
            peer_mode,
            aligned,
            self.cache.clone(),
            self.remote.clone(),
            self.local_store.clone(),
            self.prefetch.clone(),
        )
        .await
        .map_err(ServeError::Proxy)?;

        let total_size = file.size().await.map_err(ServeError::Proxy)?;

        if head_only {
            return Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, total_size)
                .body(Vec::new())
                .expect("static response is always well-formed"));
        }

        // The File façade hands back one block per call; a GET covering more
        // than one block (the common whole-object case, or a multi-block
        // Range) has to loop it like a reader rather than take the first
        // block as the entire response. Peer requests are pinned to the
        // single aligned block they asked for (spec §4.4), so that loop
        // runs exactly once for them.
        let end_inclusive = requested_end
            .unwrap_or(total_size.saturating_sub(1))
            .min(total_size.saturating_sub(1));
        let mut bytes = Vec::new();
        let mut pos = start.min(total_size);
        while total_size > 0 && pos <= end_inclusive {
            let want = end_inclusive - pos + 1;
            let chunk = file.read(pos, want).await.map_err(ServeError::Proxy)?;
            if chunk.is_empty() {
                break;
            }
            pos += chunk.len() as u64;
            bytes.extend_from_slice(&chunk);
            if peer_mode {
                break;
            }
        }

        let status = if has_range {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };
        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_LENGTH, bytes.len())
            .header(header::CONTENT_TYPE, "application/octet-stream");
        if status == StatusCode::PARTIAL_CONTENT {
            builder = builder.header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, start + bytes.len() as u64, total_size),
            );
        }
        Ok(builder
            .body(bytes)
            .expect("static response is always well-formed"))
    }

    async fn handle_v2(
        &self,
        session: &mut ServerSession,
        correlation_id: &str,
    ) -> Result<Response<Vec<u8>>, ServeError> {
        let req = session.req_header();
        let method = req.method.clone();
        let path_and_query = req
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| req.uri.path().to_string());
        let key = derive_v2_key(req.uri.path());
        let reference_kind = blockpeer_proxy::ReferenceKind::from_path(req.uri.path());

        let request = MirrorRequest {
            key,
            method,
            path_and_query,
            reference_kind,
        };

        let outcome = blockpeer_proxy::mirror_handle(
            self.router.clone(),
            request,
            correlation_id,
            self.resolve_timeout,
            self.resolve_retries,
        )
        .await
        .map_err(ServeError::Proxy)?;

        let mut builder = Response::builder().status(outcome.status);
        for (name, value) in outcome.headers.iter() {
            builder = builder.header(name, value);
        }
        Ok(builder
            .body(outcome.body.to_vec())
            .expect("upstream response is always well-formed"))
    }
}

/// The path segment identifying the manifest/blob: everything after
/// `/v2/<name>/manifests/` or `/v2/<name>/blobs/`, matching the original's
/// `fill()` treatment of the trailing reference/digest segment.
fn derive_v2_key(path: &str) -> String {
    path.rsplit('/').next().unwrap_or("").to_string()
}

#[async_trait]
impl ServeHttp for PeerdApp {
    async fn response(&self, session: &mut ServerSession) -> Response<Vec<u8>> {
        let start = Instant::now();
        let (correlation_id, path, method) = {
            let req_parts: &http::request::Parts = session.req_header();
            (
                correlation_id(req_parts),
                req_parts.uri.path().to_string(),
                req_parts.method.clone(),
            )
        };

        let result = match (&method, path.as_str()) {
            (&Method::GET, "/healthz") => Ok(response_string(StatusCode::OK, "ok")),
            (&Method::GET, p) if p.starts_with(BLOBS_PREFIX) => {
                self.handle_blobs(session, false).await
            }
            (&Method::HEAD, p) if p.starts_with(BLOBS_PREFIX) => {
                self.handle_blobs(session, true).await
            }
            (&Method::GET, p) if p.starts_with(V2_PREFIX) => {
                self.handle_v2(session, &correlation_id).await
            }
            _ => Ok(response_no_body(StatusCode::NOT_FOUND)),
        };

        let mut response = result.unwrap_or_else(|e: ServeError| e.into());
        response.headers_mut().insert(
            blockpeer_proxy::CORRELATION_ID_HEADER,
            correlation_id.parse().expect("uuid is a valid header value"),
        );

        let status = response.status();
        let elapsed = start.elapsed();
        let log_line = format!(
            "[{correlation_id}] {method} {path} -> {status} in {:?}",
            elapsed
        );
        if status.is_server_error() {
            error!("{log_line}");
        } else if status.is_client_error() {
            warn!("{log_line}");
        } else {
            info!("{log_line}");
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_start_defaults_to_zero_when_absent() {
        let headers = http::HeaderMap::new();
        assert_eq!(range_start(&headers).unwrap(), 0);
    }

    #[test]
    fn range_start_parses_bytes_unit() {
        let mut headers = http::HeaderMap::new();
        headers.insert(header::RANGE, "bytes=1048576-2097151".parse().unwrap());
        assert_eq!(range_start(&headers).unwrap(), 1_048_576);
    }

    #[test]
    fn range_start_rejects_other_units() {
        let mut headers = http::HeaderMap::new();
        headers.insert(header::RANGE, "chunks=0-1".parse().unwrap());
        assert!(range_start(&headers).is_err());
    }

    #[test]
    fn range_end_absent_without_header() {
        let headers = http::HeaderMap::new();
        assert_eq!(range_end(&headers).unwrap(), None);
    }

    #[test]
    fn range_end_parses_closed_range() {
        let mut headers = http::HeaderMap::new();
        headers.insert(header::RANGE, "bytes=1048576-2097151".parse().unwrap());
        assert_eq!(range_end(&headers).unwrap(), Some(2_097_151));
    }

    #[test]
    fn range_end_open_ended_is_none() {
        let mut headers = http::HeaderMap::new();
        headers.insert(header::RANGE, "bytes=1048576-".parse().unwrap());
        assert_eq!(range_end(&headers).unwrap(), None);
    }

    #[test]
    fn derive_v2_key_takes_last_path_segment() {
        assert_eq!(
            derive_v2_key("/v2/myimage/manifests/latest"),
            "latest"
        );
        assert_eq!(
            derive_v2_key("/v2/myimage/blobs/sha256:abcd"),
            "sha256:abcd"
        );
    }
}
