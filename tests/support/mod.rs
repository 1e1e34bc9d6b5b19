#![allow(dead_code)]

pub mod error;
pub mod mock;
pub mod server;

pub static DEFAULT_USER_AGENT: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Read a request body to the end, as a string.
pub async fn body_string(req: http::Request<hyper::body::Incoming>) -> String {
    use http_body_util::BodyExt;

    let bytes = req
        .into_body()
        .collect()
        .await
        .expect("request body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}
