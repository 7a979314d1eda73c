use fcgx_core::record::{FCGI_MAX_CONNS, FCGI_MPXS_CONNS};
use fcgx_core::responder::{read_request, write_response, RequestLimits};
use fcgxd::session::{execute, query_values};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

/// In-process worker: answers every request with its `REQ_TAG` param as a
/// header and its stdin as the body.
async fn spawn_mock_worker() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let Ok(req) = read_request(&mut rd, &mut wr, &RequestLimits::default()).await
                else {
                    return;
                };
                let tag = req.params.get("REQ_TAG").cloned().unwrap_or_default();
                let mut out = format!("Content-Type: text/plain\nX-Tag: {tag}\n\n").into_bytes();
                out.extend_from_slice(&req.stdin);
                let stderr = format!("seen {tag}");
                write_response(&mut wr, req.request_id, &out, stderr.as_bytes(), 0)
                    .await
                    .unwrap();
                let mut buf = [0u8; 256];
                while matches!(rd.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });
    addr
}

fn tagged(tag: &str) -> HashMap<String, String> {
    HashMap::from([
        ("REQ_TAG".to_string(), tag.to_string()),
        ("REQUEST_METHOD".to_string(), "POST".to_string()),
    ])
}

#[tokio::test]
async fn large_bodies_round_trip() {
    let addr = spawn_mock_worker().await;
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let mut reader = body.as_slice();
    let mut errors = Vec::new();
    let resp = execute(addr, &tagged("big"), &mut reader, &mut errors)
        .await
        .unwrap();
    assert_eq!(resp.status, "200 OK");
    assert_eq!(resp.header("x-tag"), Some("big"));
    assert_eq!(&resp.body[..], &body[..]);
    assert_eq!(errors, b"seen big");
}

#[tokio::test]
async fn concurrent_sessions_stay_separate() {
    let addr = spawn_mock_worker().await;
    let mut tasks = Vec::new();
    for i in 0..16 {
        tasks.push(tokio::spawn(async move {
            let tag = format!("req-{i}");
            let body = tag.repeat(2_000);
            let mut reader = body.as_bytes();
            let mut errors = Vec::new();
            let resp = execute(addr, &tagged(&tag), &mut reader, &mut errors)
                .await
                .unwrap();
            (tag, body, resp, errors)
        }));
    }
    for task in tasks {
        let (tag, body, resp, errors) = task.await.unwrap();
        assert_eq!(resp.header("x-tag"), Some(tag.as_str()));
        assert_eq!(&resp.body[..], body.as_bytes());
        assert_eq!(errors, format!("seen {tag}").into_bytes());
    }
}

#[tokio::test]
async fn get_values_are_answered() {
    let addr = spawn_mock_worker().await;
    let values = query_values(addr, &[FCGI_MAX_CONNS, FCGI_MPXS_CONNS, "UNKNOWN_VAR"])
        .await
        .unwrap();
    assert_eq!(values.get(FCGI_MAX_CONNS).map(String::as_str), Some("1"));
    assert_eq!(values.get(FCGI_MPXS_CONNS).map(String::as_str), Some("0"));
    assert!(!values.contains_key("UNKNOWN_VAR"));
}
