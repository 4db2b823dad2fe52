use http::StatusCode;

/// Error taxonomy from spec §7, collapsed to one enum shared by the file
/// façade and the mirror proxy. Mirrors `peoci::ocidist::Error` /
/// `peoci::ocidist_cache::Error` in shape: one flat enum, a `Display` impl,
/// and (here) a `status_code()` used by the server crate the way
/// `peserver::worker::Error` implements `From<Error> for StatusCode`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no provider found for {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("resolver exhausted without finding a peer")]
    ResolverExhausted,
    #[error("peer resolution timed out")]
    PeerNotFound,
    #[error("fill failed: {0}")]
    Fill(#[from] blockpeer_cache::Error),
    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::ResolverExhausted => StatusCode::INTERNAL_SERVER_ERROR,
            Error::PeerNotFound => StatusCode::NOT_FOUND,
            Error::Fill(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
