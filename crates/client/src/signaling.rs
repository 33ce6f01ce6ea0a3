use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use driveway_protocol::SignalingMessage;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::supervisor::{Event, Generation};
use crate::transport::{EventTx, SendError, SignalingLink};

/// How long `close` waits for the connection task before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Controller frames are short words; anything bigger is not ours.
const MAX_MESSAGE_SIZE: usize = 4096;

/// Why the connection loop ended without an error.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    /// `close` was called.
    Local,
    /// The controller closed the socket or the stream ended.
    Remote,
}

/// WebSocket signaling channel of one session.
pub(crate) struct WsSignaling {
    generation: Generation,
    outbox: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
    shutdown: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Start connecting to `url`. Progress is reported on `events`.
pub(crate) fn open(
    url: String,
    tls_cert_path: Option<String>,
    generation: Generation,
    events: EventTx,
) -> WsSignaling {
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let open = Arc::new(AtomicBool::new(false));

    let task = tokio::spawn(run(
        url,
        tls_cert_path,
        generation,
        events,
        Arc::clone(&open),
        outbox_rx,
        shutdown_rx,
    ));

    WsSignaling {
        generation,
        outbox,
        open,
        shutdown: std::sync::Mutex::new(Some(shutdown_tx)),
        task: tokio::sync::Mutex::new(Some(task)),
    }
}

async fn run(
    url: String,
    tls_cert_path: Option<String>,
    generation: Generation,
    events: EventTx,
    open: Arc<AtomicBool>,
    mut outbox_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    info!(generation, url = %redact_token(&url), "Connecting signaling channel");

    let result = connect_and_handle(
        &url,
        tls_cert_path.as_deref(),
        generation,
        &events,
        &open,
        &mut outbox_rx,
        &mut shutdown_rx,
    )
    .await;
    open.store(false, Ordering::Release);

    let reason = match result {
        Ok(Exit::Local) => {
            debug!(generation, "Signaling channel closed");
            return;
        }
        Ok(Exit::Remote) => "closed by controller".to_string(),
        Err(e) => format!("{e:#}"),
    };
    warn!(generation, reason, "Signaling channel lost");
    let _ = events.send(Event::SignalingFailed { generation, reason });
}

/// Build a TLS connector, pinning the controller certificate if a cert path is
/// provided. Falls back to system roots if no cert path is given.
fn build_tls_connector(tls_cert_path: Option<&str>) -> tokio_tungstenite::Connector {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Failed to load a platform certificate: {e}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        match std::fs::read(cert_path) {
            Ok(pem_data) => {
                let certs: Vec<_> = rustls_pemfile::certs(&mut pem_data.as_slice())
                    .filter_map(|r| r.ok())
                    .collect();
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        warn!("Failed to add pinned cert to root store: {e}");
                    } else {
                        info!("Pinned controller certificate from {cert_path}");
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Failed to read TLS cert from {cert_path}: {e}, falling back to system roots"
                );
            }
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    tokio_tungstenite::Connector::Rustls(Arc::new(tls_config))
}

async fn connect_and_handle(
    url: &str,
    tls_cert_path: Option<&str>,
    generation: Generation,
    events: &EventTx,
    open: &AtomicBool,
    outbox_rx: &mut mpsc::UnboundedReceiver<String>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> anyhow::Result<Exit> {
    let connector = url
        .starts_with("wss://")
        .then(|| build_tls_connector(tls_cert_path));
    let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_MESSAGE_SIZE);

    let connect =
        tokio_tungstenite::connect_async_tls_with_config(url, Some(ws_config), false, connector);
    let (ws_stream, _) = tokio::select! {
        result = connect => result.context("WebSocket connection failed")?,
        _ = &mut *shutdown_rx => return Ok(Exit::Local),
    };

    open.store(true, Ordering::Release);
    let _ = events.send(Event::SignalingOpened { generation });
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            biased;

            Some(text) = outbox_rx.recv() => {
                ws_tx.send(Message::Text(text.into())).await?;
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match SignalingMessage::parse(text.as_str()) {
                            Some(message) => {
                                let _ = events.send(Event::Signal { generation, message });
                            }
                            None => debug!(generation, frame = text.as_str(), "Ignoring unknown frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(Exit::Remote),
                    Some(Err(e)) => return Err(e.into()),
                    _ => {}
                }
            }
            _ = &mut *shutdown_rx => {
                open.store(false, Ordering::Release);
                // Frames queued before close still go out, ahead of the close frame.
                while let Ok(text) = outbox_rx.try_recv() {
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        debug!(generation, "Queued frame not sent: {e}");
                        return Ok(Exit::Local);
                    }
                }
                if let Err(e) = ws_tx.send(Message::Close(None)).await {
                    debug!(generation, "Close frame not sent: {e}");
                }
                return Ok(Exit::Local);
            }
        }
    }
}

/// The token is a credential; keep it out of logs.
fn redact_token(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let mut parts: Vec<&str> = rest.split('/').collect();
    if parts.len() > 1 {
        parts[1] = "***";
    }
    format!("{scheme}://{}", parts.join("/"))
}

#[async_trait]
impl SignalingLink for WsSignaling {
    fn send(&self, text: &str) -> Result<(), SendError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(SendError::NotOpen);
        }
        self.outbox
            .send(text.to_string())
            .map_err(|_| SendError::Closed)
    }

    async fn close(&self) {
        if let Some(shutdown) = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = shutdown.send(());
        }

        let Some(mut task) = self.task.lock().await.take() else {
            return;
        };
        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            warn!(generation = self.generation, "Signaling task did not exit, aborting");
            task.abort();
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_token_segment() {
        assert_eq!(
            redact_token("ws://gate.example.com:8080/s3cret/ws"),
            "ws://gate.example.com:8080/***/ws"
        );
        assert_eq!(redact_token("not a url"), "not a url");
    }

    #[tokio::test]
    async fn send_before_open_fails_without_panicking() {
        let (events, _rx) = mpsc::unbounded_channel();
        // Port 9 (discard) on loopback: the connection is refused or hangs,
        // either way the channel never reports open here.
        let link = open("ws://127.0.0.1:9/tok/ws".to_string(), None, 1, events);
        assert!(matches!(link.send("blur"), Err(SendError::NotOpen)));
        link.close().await;
        link.close().await;
        assert!(matches!(link.send("focus"), Err(SendError::NotOpen)));
    }

    #[tokio::test]
    async fn refused_connection_reports_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (events, mut rx) = mpsc::unbounded_channel();
        let link = open(format!("ws://{addr}/tok/ws"), None, 7, events);
        match rx.recv().await {
            Some(Event::SignalingFailed { generation: 7, .. }) => {}
            other => panic!("expected SignalingFailed, got {other:?}"),
        }
        link.close().await;
    }

    #[tokio::test]
    async fn parses_frames_and_sends_notices() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("ping".into())).await.unwrap();
            ws.send(Message::Text("hello".into())).await.unwrap();
            ws.send(Message::Text("gateconnect".into())).await.unwrap();
            let received = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text.to_string(),
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected {other:?}"),
                }
            };
            ws.close(None).await.ok();
            received
        });

        let (events, mut rx) = mpsc::unbounded_channel();
        let link = open(format!("ws://{addr}/tok/ws"), None, 3, events);

        assert_eq!(
            rx.recv().await,
            Some(Event::SignalingOpened { generation: 3 })
        );
        assert_eq!(
            rx.recv().await,
            Some(Event::Signal {
                generation: 3,
                message: SignalingMessage::Ping,
            })
        );
        // "hello" is dropped silently.
        assert_eq!(
            rx.recv().await,
            Some(Event::Signal {
                generation: 3,
                message: SignalingMessage::Connected(driveway_protocol::Actuator::Gate),
            })
        );

        link.send("blur").unwrap();
        assert_eq!(server.await.unwrap(), "blur");

        match rx.recv().await {
            Some(Event::SignalingFailed { generation: 3, .. }) => {}
            other => panic!("expected SignalingFailed, got {other:?}"),
        }
        link.close().await;
    }

    #[tokio::test]
    async fn notice_sent_right_before_close_is_delivered() {
        for _ in 0..20 {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let server = tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let mut received = Vec::new();
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Text(text) => received.push(text.to_string()),
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                received
            });

            let (events, mut rx) = mpsc::unbounded_channel();
            let link = open(format!("ws://{addr}/tok/ws"), None, 1, events);
            assert_eq!(
                rx.recv().await,
                Some(Event::SignalingOpened { generation: 1 })
            );

            link.send("inactive").unwrap();
            link.close().await;

            assert_eq!(server.await.unwrap(), vec!["inactive"]);
        }
    }
}
