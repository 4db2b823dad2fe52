use http::StatusCode;
use serde::Serialize;

use crate::util::response_json;

/// Error taxonomy seen at the HTTP boundary: either a proxy-crate failure
/// or a request this server itself rejects before reaching the proxy.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Proxy(#[from] blockpeer_proxy::Error),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ServeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServeError::Proxy(e) => e.status_code(),
            ServeError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl From<ServeError> for http::Response<Vec<u8>> {
    fn from(err: ServeError) -> Self {
        let status = err.status_code();
        response_json(
            status,
            ErrorBody {
                error: err.to_string(),
            },
        )
        .unwrap_or_else(|_| {
            http::Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Vec::new())
                .expect("static response is always well-formed")
        })
    }
}
