use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    events_ingress: AtomicU64,
    events_egress: AtomicU64,
    messages_relayed: AtomicU64,
    messages_rejected: AtomicU64,
    calls_started: AtomicU64,
    calls_rejected: AtomicU64,
    calls_ended: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_ingress(&self) {
        self.events_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.events_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_message_relayed(&self) {
        self.messages_relayed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_started(&self) {
        self.calls_started.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_rejected(&self) {
        self.calls_rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_ended(&self) {
        self.calls_ended.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE duochat_connections_active gauge\nduochat_connections_active {}\n# TYPE duochat_events_ingress counter\nduochat_events_ingress {}\n# TYPE duochat_events_egress counter\nduochat_events_egress {}\n# TYPE duochat_messages_relayed counter\nduochat_messages_relayed {}\n# TYPE duochat_messages_rejected counter\nduochat_messages_rejected {}\n# TYPE duochat_calls_started counter\nduochat_calls_started {}\n# TYPE duochat_calls_rejected counter\nduochat_calls_rejected {}\n# TYPE duochat_calls_ended counter\nduochat_calls_ended {}\n",
            self.connections_active.load(Ordering::SeqCst),
            self.events_ingress.load(Ordering::SeqCst),
            self.events_egress.load(Ordering::SeqCst),
            self.messages_relayed.load(Ordering::SeqCst),
            self.messages_rejected.load(Ordering::SeqCst),
            self.calls_started.load(Ordering::SeqCst),
            self.calls_rejected.load(Ordering::SeqCst),
            self.calls_ended.load(Ordering::SeqCst),
        )
    }
}

/// Minimal plaintext exporter. Answers every request on the metrics bind
/// with the current counter snapshot and closes the socket.
pub async fn serve_metrics(bind: String, metrics: Arc<Metrics>) {
    let listener = match TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(address = %bind, "metrics bind failed: {}", err);
            return;
        }
    };
    info!(address = %bind, "metrics endpoint listening");
    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                debug!("metrics accept failed: {}", err);
                continue;
            }
        };
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut head = [0u8; 1024];
            let _ = stream.read(&mut head).await;
            let body = metrics.encode_prometheus();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}
