use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;

use serde::Deserialize;

use netqueue::request::TypedList;
use netqueue::{Dispatcher, DispatcherConfig, Method, Request, RequestError};

/// 单次应答的本地 HTTP 服务，返回收到的完整请求文本。
fn serve_once(response: Vec<u8>) -> (u16, thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server failed");
    let port = listener.local_addr().expect("read local addr failed").port();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept failed");
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let read = stream.read(&mut buf).unwrap_or(0);
            if read == 0 {
                break;
            }
            received.extend_from_slice(&buf[..read]);
            if request_complete(&received) {
                break;
            }
        }

        stream.write_all(&response).expect("write response failed");
        stream.flush().expect("flush failed");
        String::from_utf8_lossy(&received).to_string()
    });

    (port, server)
}

fn request_complete(received: &[u8]) -> bool {
    let text = String::from_utf8_lossy(received);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text[..header_end]
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    received.len() >= header_end + 4 + content_length
}

fn http_response(status_line: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line,
        body.len(),
        body
    )
    .into_bytes()
}

fn http_dispatcher() -> Dispatcher {
    let config = DispatcherConfig {
        worker_threads: 1,
        ..DispatcherConfig::default()
    };
    Dispatcher::with_http(config).expect("dispatcher init failed")
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
struct Event {
    e_id: String,
    title: String,
}

#[tokio::test]
async fn form_post_round_trips_through_http() {
    let body = r#"{"error_code":0,"reason":"Success","result":"[{\"e_id\":\"7\",\"title\":\"launch\"}]"}"#;
    let (port, server) = serve_once(http_response("200 OK", body));
    let dispatcher = http_dispatcher();

    let events = dispatcher
        .submit(
            Request::enveloped(
                Method::Post,
                format!("http://127.0.0.1:{}/queryEvent", port),
                TypedList::<Event>::new(),
            )
            .param("date", "1/1"),
        )
        .await
        .expect("http request failed");

    let raw_request = server.join().expect("server thread panicked");
    assert!(raw_request.starts_with("POST /queryEvent"));
    assert!(raw_request.to_ascii_lowercase().contains("content-type: application/x-www-form-urlencoded"));
    assert!(raw_request.ends_with("date=1%2F1"));
    assert_eq!(
        events,
        vec![Event {
            e_id: "7".into(),
            title: "launch".into(),
        }]
    );
}

#[tokio::test]
async fn get_params_are_sent_in_query() {
    let (port, server) = serve_once(http_response("200 OK", "plain"));
    let dispatcher = http_dispatcher();

    let text = dispatcher
        .submit(Request::text(Method::Get, format!("http://127.0.0.1:{}/search", port)).param("q", "rust lang"))
        .await
        .expect("http request failed");

    let raw_request = server.join().expect("server thread panicked");
    assert!(raw_request.starts_with("GET /search?q=rust+lang "));
    assert_eq!(text, "plain");
}

#[tokio::test]
async fn server_error_status_is_classified() {
    let (port, server) = serve_once(http_response("404 Not Found", ""));
    let dispatcher = http_dispatcher();

    let result = dispatcher
        .submit(Request::text(Method::Get, format!("http://127.0.0.1:{}/gone", port)))
        .await;

    server.join().expect("server thread panicked");
    assert!(matches!(result, Err(RequestError::TransportIo { transient: false, .. })));
}

#[tokio::test]
async fn unreachable_host_reports_connect_failure() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind failed");
        listener.local_addr().expect("read local addr failed").port()
    };
    let dispatcher = http_dispatcher();

    let result = dispatcher
        .submit(
            Request::text(Method::Get, format!("http://127.0.0.1:{}/", port))
                .retry_policy(netqueue::RetryPolicy::new(std::time::Duration::from_secs(2), 1, 1.0).expect("valid policy")),
        )
        .await;

    assert!(result.is_err());
    assert_ne!(result, Err(RequestError::Cancelled));
}
