mod support;
use support::server;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ferry::header::{HeaderMap, HeaderValue, CONNECTION, HOST, USER_AGENT};
use ferry::keep_alive::NeverKeepAlive;
use ferry::{Client, Listener, Outcome, PartitionKey, StatusCode};

#[tokio::test]
async fn auto_headers() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.method(), "GET");
        assert_eq!(req.headers()[USER_AGENT], support::DEFAULT_USER_AGENT);
        assert_eq!(req.headers()["x-default"], "yes");
        assert!(req.headers().contains_key(HOST));

        http::Response::new("hello".to_owned())
    });

    let mut defaults = HeaderMap::new();
    defaults.insert("x-default", HeaderValue::from_static("yes"));
    let client = Client::builder().default_headers(defaults).build().unwrap();

    let url = format!("http://{}/1", server.addr());
    let res = client.get(&url).send().await.expect("response");

    assert_eq!(res.url().as_str(), &url);
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text(), "hello");
}

#[tokio::test]
async fn request_headers_win_over_defaults() {
    let server = server::http(move |req| async move {
        assert_eq!(req.headers()[USER_AGENT], "custom/1.0");
        http::Response::default()
    });

    let res = Client::new()
        .get(format!("http://{}/ua", server.addr()))
        .header(USER_AGENT, "custom/1.0")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn post_body() {
    let server = server::http(move |req| async move {
        assert_eq!(req.method(), "POST");
        assert_eq!(req.headers()["content-length"], "5");
        let body = support::body_string(req).await;
        assert_eq!(body, "hello");
        http::Response::default()
    });

    let res = Client::new()
        .post(format!("http://{}/echo", server.addr()))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn virtual_host_is_sent_as_host() {
    let server = server::http(move |req| async move {
        assert_eq!(req.headers()[HOST], "example.test");
        http::Response::default()
    });

    let res = Client::new()
        .get(format!("http://{}/vhost", server.addr()))
        .virtual_host("example.test")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn ipv6_literal_host() {
    if std::net::TcpListener::bind("[::1]:0").is_err() {
        // no IPv6 loopback here
        return;
    }

    let server = server::http_at("[::1]:0", move |req| async move {
        assert_eq!(req.uri(), "/v6");
        http::Response::new("over v6".to_owned())
    });
    let port = server.addr().port();

    let res = Client::new()
        .get(format!("http://[::1]:{port}/v6"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text(), "over v6");
}

#[tokio::test]
async fn connections_are_reused() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async { http::Response::new("ok".to_owned()) });
    let client = Client::new();
    let url = format!("http://{}/", server.addr());

    for _ in 0..3 {
        let res = client.get(&url).send().await.unwrap();
        assert_eq!(res.text(), "ok");
    }

    let stats = client.stats();
    assert_eq!(stats.total_connection_count(), 1);
    assert_eq!(stats.total_idle_connection_count(), 1);
    assert_eq!(stats.total_active_connection_count(), 0);
}

#[tokio::test]
async fn concurrent_requests_pool_then_expire() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        http::Response::new("ok".to_owned())
    });

    let client = Client::builder()
        .pool_idle_timeout(Duration::from_millis(300))
        .pool_cleaner_period(Duration::from_millis(50))
        .build()
        .unwrap();
    let url = format!("http://{}/", server.addr());

    let requests = (0..4).map(|_| client.get(&url).send());
    for res in futures_util::future::join_all(requests).await {
        assert_eq!(res.unwrap().status(), StatusCode::OK);
    }

    let stats = client.stats();
    assert_eq!(stats.total_idle_connection_count(), 4);
    assert_eq!(stats.total_active_connection_count(), 0);

    let host = "127.0.0.1";
    let per_host = stats.stats_per_host()[host];
    assert_eq!(per_host.host_idle_connection_count(), 4);

    tokio::time::sleep(Duration::from_millis(700)).await;

    let stats = client.stats();
    assert_eq!(stats.total_idle_connection_count(), 0);
    assert_eq!(stats.total_connection_count(), 0);
}

#[tokio::test]
async fn keep_alive_off_closes_connections() {
    let server = server::http(move |_req| async { http::Response::default() });
    let client = Client::builder()
        .keep_alive_strategy(NeverKeepAlive)
        .build()
        .unwrap();

    let res = client
        .get(format!("http://{}/", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(client.stats().total_connection_count(), 0);
}

#[tokio::test]
async fn connection_close_is_not_pooled() {
    let server = server::http(move |_req| async {
        http::Response::builder()
            .header(CONNECTION, "close")
            .body(String::new())
            .unwrap()
    });
    let client = Client::new();

    client
        .get(format!("http://{}/", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(client.stats().total_idle_connection_count(), 0);
}

#[tokio::test]
async fn flush_host_drops_idle_connections() {
    let server = server::http(move |_req| async { http::Response::default() });
    let client = Client::new();

    client
        .get(format!("http://{}/", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(client.stats().total_idle_connection_count(), 1);

    assert_eq!(client.flush_host("127.0.0.1"), 1);
    assert_eq!(client.stats().total_connection_count(), 0);
}

#[tokio::test]
async fn connect_failure_is_a_connect_error() {
    let _ = env_logger::try_init();

    // bind then drop to find a port nobody listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = Client::builder().max_request_retries(1).build().unwrap();
    let url = format!("http://127.0.0.1:{port}/");
    let err = client.get(&url).send().await.unwrap_err();

    assert!(err.is_connect(), "{err:?}");
    assert!(!err.is_timeout());
    assert_eq!(err.url().map(|u| u.as_str()), Some(url.as_str()));
}

#[tokio::test]
async fn https_is_not_supported_by_the_default_transport() {
    let err = Client::builder()
        .max_request_retries(0)
        .build()
        .unwrap()
        .get("https://localhost/")
        .send()
        .await
        .unwrap_err();
    assert!(err.is_connect());
}

#[tokio::test]
async fn pool_exhausted_rejects_before_connecting() {
    let server = server::http(move |_req| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        http::Response::default()
    });
    let client = Client::builder().max_connections(1).build().unwrap();
    let url = format!("http://{}/", server.addr());

    let first = tokio::spawn(client.get(&url).send());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client.get(&url).send().await.unwrap_err();
    assert!(err.is_pool_exhausted());

    assert_eq!(first.await.unwrap().unwrap().status(), StatusCode::OK);
    // the permit came back with the pooled connection
    assert!(client.get(&url).send().await.is_ok());
}

#[tokio::test]
async fn closed_client_fails_requests() {
    let server = server::http(move |_req| async { http::Response::default() });
    let client = Client::new();
    let url = format!("http://{}/", server.addr());

    client.get(&url).send().await.unwrap();
    client.close();

    assert_eq!(client.stats().total_connection_count(), 0);
    let err = client.get(&url).send().await.unwrap_err();
    assert!(err.is_closed());
}

struct Recorder {
    chunks: AtomicUsize,
    completed: AtomicUsize,
    pooled: AtomicUsize,
}

impl Recorder {
    fn new() -> Arc<Recorder> {
        Arc::new(Recorder {
            chunks: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            pooled: AtomicUsize::new(0),
        })
    }
}

impl Listener for Recorder {
    fn on_body_chunk(&self, _chunk: &Bytes) -> Outcome {
        self.chunks.fetch_add(1, Ordering::SeqCst);
        Outcome::Continue
    }

    fn on_complete(&self, _response: &ferry::Response) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connection_pooled(&self, _key: &PartitionKey) {
        self.pooled.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn listener_sees_the_exchange() {
    let server = server::http(move |_req| async { http::Response::new("body".to_owned()) });
    let recorder = Recorder::new();

    let res = Client::new()
        .get(format!("http://{}/", server.addr()))
        .listener_arc(recorder.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(res.text(), "body");
    assert!(recorder.chunks.load(Ordering::SeqCst) >= 1);
    assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.pooled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn listener_abort_returns_partial_response() {
    struct AbortOnHeaders;

    impl Listener for AbortOnHeaders {
        fn on_headers(&self, headers: &HeaderMap) -> Outcome {
            if headers.contains_key("x-stop") {
                Outcome::Abort
            } else {
                Outcome::Continue
            }
        }
    }

    let server = server::http(move |_req| async {
        http::Response::builder()
            .header("x-stop", "1")
            .body("never read".to_owned())
            .unwrap()
    });
    let client = Client::new();

    let res = client
        .get(format!("http://{}/", server.addr()))
        .listener(AbortOnHeaders)
        .send()
        .await
        .unwrap();

    assert!(res.is_aborted());
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.bytes().is_empty());
    // an aborted exchange never goes back to the pool
    assert_eq!(client.stats().total_connection_count(), 0);
}

#[tokio::test]
async fn listener_error_fails_the_request() {
    struct Reject;

    impl Listener for Reject {
        fn on_status(&self, status: StatusCode) -> Outcome {
            if status.is_server_error() {
                Outcome::err("server error")
            } else {
                Outcome::Continue
            }
        }
    }

    let server = server::http(move |_req| async {
        http::Response::builder()
            .status(500)
            .body(String::new())
            .unwrap()
    });

    let err = Client::new()
        .get(format!("http://{}/", server.addr()))
        .listener(Reject)
        .send()
        .await
        .unwrap_err();

    assert!(err.is_request());
    assert_eq!(support::error::inspect(err).last().unwrap(), "server error");
}
