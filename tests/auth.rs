mod support;
use support::server;

use std::collections::HashMap;

use ferry::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use ferry::{Client, Realm, StatusCode};
use md5::{Digest, Md5};

fn challenge(value: &str) -> http::Response<String> {
    http::Response::builder()
        .status(401)
        .header(WWW_AUTHENTICATE, value)
        .body(String::new())
        .unwrap()
}

fn md5_hex(data: &str) -> String {
    Md5::digest(data.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Split `Digest k=v, k="v"` into its parameters.
fn digest_params(header: &str) -> HashMap<String, String> {
    let rest = header.strip_prefix("Digest ").expect("digest scheme");
    rest.split(", ")
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap();
            (k.to_owned(), v.trim_matches('"').to_owned())
        })
        .collect()
}

#[tokio::test]
async fn basic_answers_a_challenge() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        match req.headers().get(AUTHORIZATION) {
            None => challenge("Basic realm=\"test\""),
            Some(value) => {
                // alice:secret
                assert_eq!(value, "Basic YWxpY2U6c2VjcmV0");
                http::Response::new("welcome".to_owned())
            }
        }
    });

    let client = Client::builder()
        .realm(Realm::basic("alice", "secret"))
        .build()
        .unwrap();
    let res = client
        .get(format!("http://{}/private", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text(), "welcome");
}

#[tokio::test]
async fn basic_preemptive_sends_credentials_up_front() {
    let server = server::http(move |req| async move {
        assert_eq!(req.headers()[AUTHORIZATION], "Basic YWxpY2U6c2VjcmV0");
        http::Response::default()
    });

    let res = Client::new()
        .get(format!("http://{}/private", server.addr()))
        .realm(Realm::basic("alice", "secret").preemptive(true))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn second_rejection_is_terminal() {
    let server = server::http(move |_req| async move { challenge("Basic realm=\"test\"") });

    let err = Client::new()
        .get(format!("http://{}/private", server.addr()))
        .realm(Realm::basic("alice", "wrong"))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
    assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
}

#[tokio::test]
async fn preemptive_basic_rejection_is_terminal() {
    let server = server::http(move |req| async move {
        assert!(req.headers().contains_key(AUTHORIZATION));
        challenge("Basic realm=\"test\"")
    });

    let err = Client::new()
        .get(format!("http://{}/private", server.addr()))
        .realm(Realm::basic("alice", "wrong").preemptive(true))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
}

#[tokio::test]
async fn challenge_without_realm_is_returned() {
    let server = server::http(move |_req| async move { challenge("Basic realm=\"test\"") });

    let res = Client::new()
        .get(format!("http://{}/private", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn digest_qop_auth() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        let Some(value) = req.headers().get(AUTHORIZATION) else {
            return challenge(
                "Digest realm=\"realm\", nonce=\"nonce\", qop=\"auth\", opaque=\"opaque\"",
            );
        };
        let params = digest_params(value.to_str().unwrap());
        assert_eq!(params["username"], "user");
        assert_eq!(params["realm"], "realm");
        assert_eq!(params["nonce"], "nonce");
        assert_eq!(params["uri"], "/foo");
        assert_eq!(params["qop"], "auth");
        assert_eq!(params["nc"], "00000001");
        assert_eq!(params["opaque"], "opaque");

        let ha1 = md5_hex("user:realm:pass");
        let ha2 = md5_hex("GET:/foo");
        let expected = md5_hex(&format!(
            "{ha1}:nonce:{}:{}:auth:{ha2}",
            params["nc"], params["cnonce"]
        ));
        assert_eq!(params["response"], expected);

        http::Response::new("ok".to_owned())
    });

    let res = Client::new()
        .get(format!("http://{}/foo", server.addr()))
        .realm(Realm::digest("user", "pass"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text(), "ok");
}

#[tokio::test]
async fn digest_without_qop() {
    let server = server::http(move |req| async move {
        let Some(value) = req.headers().get(AUTHORIZATION) else {
            return challenge("Digest realm=\"realm\", nonce=\"legacy\"");
        };
        let params = digest_params(value.to_str().unwrap());
        assert!(!params.contains_key("qop"));
        assert!(!params.contains_key("nc"));

        let ha1 = md5_hex("user:realm:pass");
        let ha2 = md5_hex("GET:/old");
        assert_eq!(params["response"], md5_hex(&format!("{ha1}:legacy:{ha2}")));

        http::Response::default()
    });

    let res = Client::new()
        .get(format!("http://{}/old", server.addr()))
        .realm(Realm::digest("user", "pass"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn digest_preemptive_reuses_the_nonce() {
    let server = server::http(move |req| async move {
        let Some(value) = req.headers().get(AUTHORIZATION) else {
            return challenge("Digest realm=\"realm\", nonce=\"n1\", qop=\"auth\"");
        };
        let params = digest_params(value.to_str().unwrap());
        http::Response::new(params["nc"].clone())
    });

    let client = Client::builder()
        .realm(Realm::digest("user", "pass").preemptive(true))
        .build()
        .unwrap();
    let url = format!("http://{}/a", server.addr());

    assert_eq!(client.get(&url).send().await.unwrap().text(), "00000001");
    assert_eq!(client.get(&url).send().await.unwrap().text(), "00000002");
    assert_eq!(client.get(&url).send().await.unwrap().text(), "00000003");
}

#[tokio::test]
async fn malformed_digest_challenge() {
    let server = server::http(move |_req| async move { challenge("Digest realm=\"realm\"") });

    let err = Client::new()
        .get(format!("http://{}/", server.addr()))
        .realm(Realm::digest("user", "pass"))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_malformed_challenge());
}
