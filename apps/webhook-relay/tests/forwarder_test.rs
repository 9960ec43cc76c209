use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Bytes};
use axum::extract::Request;
use axum::http::header::HOST;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::Router;
use relay_bus::{Delivery, LocalBroker, OutboundMessage};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webhook_relay::messaging::{ConnectionManager, Envelope, EnvelopeSink, Publisher, Subscriber, EXCHANGE};
use webhook_relay::transmitter::{Forwarder, ForwarderSettings, StopReason};
use webhook_relay::RelayError;

struct Captured {
    method: String,
    path: String,
    headers: HeaderMap,
    body: Bytes,
}

async fn capture_server() -> (Uri, String, mpsc::UnboundedReceiver<Captured>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().fallback(move |request: Request| {
        let tx = tx.clone();
        async move {
            let (parts, body) = request.into_parts();
            let body = to_bytes(body, usize::MAX).await.unwrap_or_default();
            let _ = tx.send(Captured {
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
                headers: parts.headers,
                body,
            });
            StatusCode::ACCEPTED
        }
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let authority = listener.local_addr().expect("addr").to_string();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let uri = format!("http://{authority}/inbox").parse().expect("uri");
    (uri, authority, rx)
}

fn envelope() -> Envelope {
    Envelope {
        method: "POST".into(),
        host: "original.example.com".into(),
        path: "/orders/42".into(),
        headers: BTreeMap::from([
            ("Content-Type".to_string(), vec!["application/json".to_string()]),
            ("X-Multi".to_string(), vec!["one".to_string(), "two".to_string()]),
        ]),
        body: "{\"id\":42}".into(),
        body_encoding: None,
        headers_encoding: None,
    }
}

fn delivery(envelope: &Envelope) -> Delivery {
    Delivery {
        exchange: EXCHANGE.into(),
        routing_key: envelope.routing_key(),
        content_type: Some("application/json".into()),
        body: Bytes::from(envelope.encode().expect("encode")),
    }
}

fn settings(destination: Uri, extra_headers: bool, preserve_host: bool) -> ForwarderSettings {
    ForwarderSettings {
        destination,
        extra_headers,
        preserve_host,
        insecure: false,
    }
}

#[test_timeout::tokio_timeout_test]
async fn headers_and_host_follow_the_flags() {
    let (uri, authority, mut captured) = capture_server().await;

    for (extra_headers, preserve_host) in [(false, false), (true, false), (false, true), (true, true)] {
        let forwarder =
            Forwarder::new(settings(uri.clone(), extra_headers, preserve_host)).expect("forwarder");
        let status = forwarder.forward(&delivery(&envelope())).await.expect("forward");
        assert_eq!(status, StatusCode::ACCEPTED);

        let request = captured.recv().await.expect("captured request");
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/inbox");
        assert_eq!(request.body.as_ref(), b"{\"id\":42}");
        let multi: Vec<_> = request.headers.get_all("x-multi").iter().collect();
        assert_eq!(multi, ["one", "two"]);

        let original_path = request.headers.get("relay-original-path");
        let original_host = request.headers.get("relay-original-host");
        if extra_headers {
            assert_eq!(original_path.expect("path header"), "/orders/42");
            assert_eq!(original_host.expect("host header"), "original.example.com");
        } else {
            assert!(original_path.is_none());
            assert!(original_host.is_none());
        }

        let host = request.headers.get(HOST).expect("host");
        if preserve_host {
            assert_eq!(host, "original.example.com");
        } else {
            assert_eq!(host, authority.as_str());
        }
    }
}

#[test_timeout::tokio_timeout_test]
async fn binary_bodies_arrive_intact() {
    let (uri, _, mut captured) = capture_server().await;
    let forwarder = Forwarder::new(settings(uri, false, false)).expect("forwarder");
    let mut binary = envelope();
    binary.set_body(&[0xff, 0x00, 0xfe, 0x10]);

    forwarder.forward(&delivery(&binary)).await.expect("forward");

    let request = captured.recv().await.expect("captured request");
    assert_eq!(request.body.as_ref(), b"\xff\x00\xfe\x10");
}

#[test_timeout::tokio_timeout_test]
async fn unreachable_destination_is_a_forward_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let uri: Uri = format!("http://{addr}/").parse().expect("uri");
    let forwarder = Forwarder::new(settings(uri, true, false)).expect("forwarder");

    assert!(matches!(
        forwarder.forward(&delivery(&envelope())).await,
        Err(RelayError::Forward(_))
    ));
}

#[test_timeout::tokio_timeout_test]
async fn loop_skips_junk_and_ends_with_the_stream() {
    let (uri, _, mut captured) = capture_server().await;
    let broker = LocalBroker::new();
    let connections = ConnectionManager::new(Arc::new(broker.clone()));
    connections.init("amqp://test").await.expect("init");
    let publisher = Publisher::new(&connections).await.expect("publisher");
    let stream = Subscriber::new(&connections, "#")
        .await
        .expect("subscriber")
        .subscribe()
        .await
        .expect("subscribe");

    let raw = connections
        .publisher_connection()
        .expect("connection")
        .open_channel()
        .await
        .expect("channel");
    raw.publish(EXCHANGE, "junk", OutboundMessage::new("application/json", "not json"))
        .await
        .expect("publish junk");
    publisher.publish(&envelope()).await.expect("publish");

    let forwarder = Forwarder::new(settings(uri, true, false)).expect("forwarder");
    let run = tokio::spawn(async move { forwarder.run(stream, CancellationToken::new()).await });

    let request = captured.recv().await.expect("captured request");
    assert_eq!(request.headers["relay-original-path"], "/orders/42");

    connections.close_all().await;
    assert_eq!(run.await.expect("join"), StopReason::StreamClosed);
}

#[test_timeout::tokio_timeout_test]
async fn loop_stops_on_shutdown() {
    let broker = LocalBroker::new();
    let connections = ConnectionManager::new(Arc::new(broker.clone()));
    connections.init("amqp://test").await.expect("init");
    let subscriber = Subscriber::new(&connections, "#").await.expect("subscriber");
    let queue = subscriber.queue().to_string();
    let stream = subscriber.subscribe().await.expect("subscribe");

    let forwarder = Forwarder::new(settings(
        Uri::from_static("http://127.0.0.1:9/"),
        true,
        false,
    ))
    .expect("forwarder");
    let token = CancellationToken::new();
    let run = tokio::spawn({
        let token = token.clone();
        async move { forwarder.run(stream, token).await }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    assert_eq!(run.await.expect("join"), StopReason::Shutdown);
    assert!(!broker.queue_exists(&queue));
    connections.close_all().await;
}
