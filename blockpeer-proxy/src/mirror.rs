use std::sync::Arc;
use std::time::{Duration, Instant};

use blockpeer_router::Router;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use log::{debug, info};

use crate::error::Error;
use crate::metrics::{PEER_DISCOVERY_SECONDS, PEER_RESPONSE_BYTES, PEER_RESPONSE_SECONDS};
use crate::{CORRELATION_ID_HEADER, PEER_HEADER};
use futures::StreamExt;

/// A request the Mirror Proxy forwards verbatim to whichever peer answers
/// first with 200, mirroring the Go original's manual reverse proxy over
/// `/v2/*` (grounded on `pkg/discovery/content/registry/mirror.go`).
pub struct MirrorRequest {
    /// The resolve key derived from the path: the manifest/blob digest, or
    /// the `repository:reference` pair when the path names a tag.
    pub key: String,
    pub method: Method,
    /// Path and query exactly as received, replayed unchanged against each
    /// candidate peer's `http_host`.
    pub path_and_query: String,
    /// Whether the path names a manifest or a blob, replacing the
    /// original's `RefTypeCtxKey`. `None` when the path matches neither
    /// (unrecognized `/v2/*` route) and no default should be applied.
    pub reference_kind: Option<ReferenceKind>,
}

/// Distinguishes `/v2/<name>/manifests/<reference>` from
/// `/v2/<name>/blobs/<digest>`, used only to fill in `Content-Type` when a
/// relayed peer response doesn't carry one of its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    Manifest,
    Blob,
}

impl ReferenceKind {
    pub fn from_path(path: &str) -> Option<ReferenceKind> {
        if path.contains("/manifests/") {
            Some(ReferenceKind::Manifest)
        } else if path.contains("/blobs/") {
            Some(ReferenceKind::Blob)
        } else {
            None
        }
    }

    fn default_content_type(self) -> &'static str {
        match self {
            ReferenceKind::Manifest => "application/vnd.oci.image.manifest.v1+json",
            ReferenceKind::Blob => "application/octet-stream",
        }
    }
}

/// A fully-buffered upstream response. Unlike the Go original's
/// `ModifyResponse`/`ErrorHandler` pair — which can fire after the client
/// has already started receiving a body — this crate only ever returns a
/// response once a peer's reply is fully read, so a peer that fails
/// mid-stream simply makes this peer ineligible rather than corrupting a
/// response already in flight. See DESIGN.md.
pub struct MirrorOutcome {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Resolve → iterate candidate peers → first 200 wins (spec §4.3).
///
/// - Empty `key` is a caller error (§4.3's "neither digest nor tag could be
///   parsed from the path").
/// - The whole resolve-and-iterate attempt is bounded by `resolve_timeout`;
///   firing before any peer answers is surfaced as `Error::PeerNotFound`
///   (404), matching "peer not found" in the Go original's timeout path.
/// - Running out of candidates without timing out is `Error::ResolverExhausted`
///   (500), matching the original's "resolver exhausted".
pub async fn handle(
    router: Arc<dyn Router>,
    request: MirrorRequest,
    correlation_id: &str,
    resolve_timeout: Duration,
    resolve_retries: usize,
) -> Result<MirrorOutcome, Error> {
    if request.key.is_empty() {
        return Err(Error::BadRequest(
            "neither digest nor reference provided".to_string(),
        ));
    }

    match tokio::time::timeout(
        resolve_timeout,
        iterate_peers(router, request, correlation_id, resolve_retries),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::PeerNotFound),
    }
}

async fn iterate_peers(
    router: Arc<dyn Router>,
    request: MirrorRequest,
    correlation_id: &str,
    resolve_retries: usize,
) -> Result<MirrorOutcome, Error> {
    let discovery_start = Instant::now();
    let mut stream = router.resolve(&request.key, false, resolve_retries).await;
    let mut first_peer = true;

    while let Some(endpoint) = stream.next().await {
        if first_peer {
            PEER_DISCOVERY_SECONDS
                .with_label_values(&[&endpoint.peer_id.to_string()])
                .observe(discovery_start.elapsed().as_secs_f64());
            first_peer = false;
        }

        let client = router.net().client_for(&endpoint.peer_id);
        let url = format!("{}{}", endpoint.http_host, request.path_and_query);
        let attempt_start = Instant::now();

        let resp = match client
            .request(request.method.clone(), &url)
            .header(PEER_HEADER, "true")
            .header(CORRELATION_ID_HEADER, correlation_id)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                debug!(
                    "[{correlation_id}] peer {} mirror request failed, trying next: {e}",
                    endpoint.peer_id
                );
                continue;
            }
        };

        // No bytes are forwarded for a non-200 upstream response (spec §4.3
        // invariant): only a clean 200 is read and returned.
        if resp.status() != StatusCode::OK {
            debug!(
                "[{correlation_id}] peer {} returned {}, trying next",
                endpoint.peer_id,
                resp.status()
            );
            continue;
        }

        let mut headers = resp.headers().clone();
        if !headers.contains_key(http::header::CONTENT_TYPE) {
            if let Some(kind) = request.reference_kind {
                headers.insert(
                    http::header::CONTENT_TYPE,
                    kind.default_content_type()
                        .parse()
                        .expect("static content type is a valid header value"),
                );
            }
        }
        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(e) => {
                debug!(
                    "[{correlation_id}] peer {} body read failed, trying next: {e}",
                    endpoint.peer_id
                );
                continue;
            }
        };

        PEER_RESPONSE_SECONDS
            .with_label_values(&[&endpoint.peer_id.to_string(), &request.key, "mirror"])
            .observe(attempt_start.elapsed().as_secs_f64());
        PEER_RESPONSE_BYTES
            .with_label_values(&[&endpoint.peer_id.to_string(), &request.key, "mirror"])
            .inc_by(body.len() as u64);
        info!(
            "[{correlation_id}] mirrored key={} from peer={} bytes={}",
            request.key,
            endpoint.peer_id,
            body.len()
        );

        return Ok(MirrorOutcome {
            status: StatusCode::OK,
            headers,
            body,
        });
    }

    Err(Error::ResolverExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockpeer_router::{MockRouter, PeerId};
    use std::collections::HashMap;

    #[test]
    fn reference_kind_from_path() {
        assert_eq!(
            ReferenceKind::from_path("/v2/myimage/manifests/latest"),
            Some(ReferenceKind::Manifest)
        );
        assert_eq!(
            ReferenceKind::from_path("/v2/myimage/blobs/sha256:abcd"),
            Some(ReferenceKind::Blob)
        );
        assert_eq!(ReferenceKind::from_path("/v2/"), None);
    }

    #[tokio::test]
    async fn empty_key_is_bad_request() {
        let router: Arc<dyn Router> = Arc::new(MockRouter::new(
            PeerId("self".to_string()),
            "http://self",
            HashMap::new(),
        ));
        let request = MirrorRequest {
            key: String::new(),
            method: Method::GET,
            path_and_query: "/v2/foo/manifests/latest".to_string(),
            reference_kind: Some(ReferenceKind::Manifest),
        };
        let err = handle(router, request, "corr-1", Duration::from_millis(100), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn unresolvable_key_is_resolver_exhausted() {
        // MockRouter closes an unseeded key's stream immediately (no
        // candidates), well inside the resolve_timeout window, so this
        // exercises spec §8 scenario 4 ("resolver yields no endpoints,
        // closes, mirror returns 500") rather than the timeout path.
        let router: Arc<dyn Router> = Arc::new(MockRouter::new(
            PeerId("self".to_string()),
            "http://self",
            HashMap::new(),
        ));
        let request = MirrorRequest {
            key: "sha256:unknown".to_string(),
            method: Method::GET,
            path_and_query: "/v2/foo/blobs/sha256:unknown".to_string(),
            reference_kind: Some(ReferenceKind::Blob),
        };
        let err = handle(router, request, "corr-2", Duration::from_millis(50), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResolverExhausted));
    }

    /// A router whose `resolve` stream never yields and never closes, to
    /// exercise the outer `tokio::time::timeout` firing before the
    /// resolver does (the genuine "peer resolution timed out" path).
    struct StuckRouter {
        net: Arc<dyn blockpeer_router::Net>,
    }

    #[async_trait::async_trait]
    impl Router for StuckRouter {
        async fn provide(&self, _keys: &[String]) -> Result<(), blockpeer_router::Error> {
            Ok(())
        }

        async fn resolve(
            &self,
            _key: &str,
            _allow_self: bool,
            _max_retries: usize,
        ) -> blockpeer_router::ResolveStream {
            Box::pin(futures::stream::pending())
        }

        async fn resolve_with_negative_cache_callback(
            &self,
            key: &str,
            allow_self: bool,
            max_retries: usize,
        ) -> (
            blockpeer_router::ResolveStream,
            blockpeer_router::NegativeCacheCallback,
        ) {
            (self.resolve(key, allow_self, max_retries).await, Box::new(|| {}))
        }

        fn lookup_key(&self, _key: &str) -> Vec<blockpeer_router::PeerEndpoint> {
            Vec::new()
        }

        fn net(&self) -> Arc<dyn blockpeer_router::Net> {
            self.net.clone()
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn stuck_resolver_times_out_as_peer_not_found() {
        let router: Arc<dyn Router> = Arc::new(StuckRouter {
            net: Arc::new(blockpeer_router::SharedClientNet::new()),
        });
        let request = MirrorRequest {
            key: "sha256:unknown".to_string(),
            method: Method::GET,
            path_and_query: "/v2/foo/blobs/sha256:unknown".to_string(),
            reference_kind: Some(ReferenceKind::Blob),
        };
        let err = handle(router, request, "corr-3", Duration::from_millis(20), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerNotFound));
    }
}
