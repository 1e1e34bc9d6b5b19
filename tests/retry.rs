mod support;
use support::mock::{ok, MockTransport};
use support::server;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ferry::transport::SendError;
use ferry::{retry, Client, Listener, StatusCode, Url};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn unwritten_request_is_retried() {
    let _ = env_logger::try_init();

    let transport = MockTransport::new(|n, _req| {
        if n == 0 {
            Err(SendError::new("connection reset", false))
        } else {
            Ok(ok("second time"))
        }
    });
    let client = Client::builder().transport(transport.clone()).build().unwrap();

    let res = client
        .post("http://example.test/submit")
        .body("data")
        .send()
        .await
        .unwrap();
    assert_eq!(res.text(), "second time");
    assert_eq!(transport.sends(), 2);
    assert_eq!(transport.connects(), 2);
}

#[tokio::test]
async fn written_post_is_not_retried() {
    let transport = MockTransport::new(|_, _| Err(SendError::new("connection reset", true)));
    let client = Client::builder().transport(transport.clone()).build().unwrap();

    let err = client
        .post("http://example.test/submit")
        .body("data")
        .send()
        .await
        .unwrap_err();
    assert!(err.is_remotely_closed());
    assert_eq!(transport.sends(), 1);
}

#[tokio::test]
async fn written_idempotent_request_is_retried() {
    let transport = MockTransport::new(|n, _| {
        if n < 2 {
            Err(SendError::new("connection reset", true))
        } else {
            Ok(ok("done"))
        }
    });
    let client = Client::builder().transport(transport.clone()).build().unwrap();

    let res = client.put("http://example.test/item").send().await.unwrap();
    assert_eq!(res.text(), "done");
    assert_eq!(transport.sends(), 3);
}

#[tokio::test]
async fn retries_are_bounded() {
    let transport = MockTransport::refusing();
    let client = Client::builder()
        .transport(transport.clone())
        .max_request_retries(3)
        .build()
        .unwrap();

    let err = client.get("http://example.test/").send().await.unwrap_err();
    assert!(err.is_connect());
    assert_eq!(transport.connects(), 4);
}

#[tokio::test]
async fn never_retry() {
    let transport = MockTransport::new(|_, _| Err(SendError::new("reset", false)));
    let client = Client::builder()
        .transport(transport.clone())
        .retry(retry::never())
        .build()
        .unwrap();

    let err = client.get("http://example.test/").send().await.unwrap_err();
    assert!(err.is_remotely_closed());
    assert_eq!(transport.sends(), 1);
}

#[tokio::test]
async fn scoped_retries_only_apply_to_their_host() {
    let transport = MockTransport::new(|_, _| Err(SendError::new("reset", false)));
    let client = Client::builder()
        .transport(transport.clone())
        .retry(retry::for_host("retry.test").no_budget().max_retries_per_request(1))
        .build()
        .unwrap();

    client.get("http://other.test/").send().await.unwrap_err();
    assert_eq!(transport.sends(), 1);

    client.get("http://retry.test/").send().await.unwrap_err();
    assert_eq!(transport.sends(), 3);
}

#[tokio::test]
async fn custom_classifier() {
    let transport = MockTransport::new(|n, _| {
        if n == 0 {
            Err(SendError::new("reset", true))
        } else {
            Ok(ok("again"))
        }
    });
    let client = Client::builder()
        .transport(transport.clone())
        .retry(
            retry::for_host("example.test")
                .no_budget()
                .classify_fn(|req_rep| req_rep.retryable()),
        )
        .build()
        .unwrap();

    // replaying a written POST is the classifier's call here
    let res = client.post("http://example.test/").send().await.unwrap();
    assert_eq!(res.text(), "again");
}

#[tokio::test]
async fn listener_is_told_about_retries() {
    struct Retries(AtomicU32);

    impl Listener for Retries {
        fn on_retry(&self, _url: &Url, retries: u32) {
            self.0.store(retries, Ordering::SeqCst);
        }
    }

    let transport = MockTransport::new(|n, _| {
        if n < 2 {
            Err(SendError::new("reset", false))
        } else {
            Ok(ok(""))
        }
    });
    let client = Client::builder().transport(transport).build().unwrap();
    let retries = Arc::new(Retries(AtomicU32::new(0)));

    client
        .get("http://example.test/")
        .listener_arc(retries.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(retries.0.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stale_pooled_connection_is_replaced() {
    let _ = env_logger::try_init();

    // answers one request per connection, then hangs up without saying so
    let server = server::raw(|mut io| async move {
        let mut buf = [0u8; 1024];
        let _ = io.read(&mut buf).await;
        let _ = io
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .await;
    });
    let client = Client::new();
    let url = format!("http://{}/", server.addr());

    for _ in 0..3 {
        let res = client.get(&url).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
