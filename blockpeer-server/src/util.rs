use http::{Response, StatusCode};
use serde::Serialize;

pub fn response_no_body(status: StatusCode) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_LENGTH, 0)
        .body(Vec::new())
        .expect("static response is always well-formed")
}

pub fn response_string(status: StatusCode, body: impl Into<String>) -> Response<Vec<u8>> {
    let body: Vec<u8> = body.into().into_bytes();
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(http::header::CONTENT_LENGTH, body.len())
        .body(body)
        .expect("static response is always well-formed")
}

pub fn response_bytes(
    status: StatusCode,
    content_type: &str,
    body: Vec<u8>,
) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, content_type)
        .header(http::header::CONTENT_LENGTH, body.len())
        .body(body)
        .expect("static response is always well-formed")
}

pub fn response_json<T: Serialize>(
    status: StatusCode,
    value: T,
) -> Result<Response<Vec<u8>>, serde_json::Error> {
    let body = serde_json::to_vec(&value)?;
    Ok(response_bytes(status, "application/json", body))
}

pub fn setup_logs(level: &str) {
    let level = match level {
        "debug" => "debug",
        "warn" => "warn",
        "error" | "fatal" | "panic" => "error",
        _ => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}
