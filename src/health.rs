//! Minimal HTTP health probe.
//!
//! Serves the latest aggregated status payload as JSON on every request.
//! The scheduler refreshes the shared payload once per loop; the probe never
//! touches live slot state.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::logging::{json_log, obj, v_num, v_str};

pub type SharedStatus = Arc<Mutex<serde_json::Value>>;

pub fn new_shared_status() -> SharedStatus {
    Arc::new(Mutex::new(serde_json::json!({"status": "starting"})))
}

pub async fn bind(port: u16) -> Result<(TcpListener, u16)> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let bound = listener.local_addr()?.port();
    json_log(
        "health",
        obj(&[
            ("status", v_str("listening")),
            ("port", v_num(f64::from(bound))),
        ]),
    );
    Ok((listener, bound))
}

pub async fn serve(listener: TcpListener, status: SharedStatus) {
    loop {
        let (mut sock, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => continue,
        };
        let status = status.clone();
        tokio::spawn(async move {
            // Drain the request head; the response is the same either way.
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;

            let body = status
                .lock()
                .map(|s| s.to_string())
                .unwrap_or_else(|_| "{}".to_string());
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = sock.write_all(resp.as_bytes()).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_probe_serves_status_json() {
        let status = new_shared_status();
        *status.lock().unwrap() = serde_json::json!({"mode": "RUNNING", "slots": 2});

        let (listener, port) = bind(0).await.unwrap();
        tokio::spawn(serve(listener, status));

        let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        sock.write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut resp = Vec::new();
        sock.read_to_end(&mut resp).await.unwrap();
        let text = String::from_utf8_lossy(&resp);

        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("application/json"));
        assert!(text.contains("\"mode\":\"RUNNING\""));
    }
}
