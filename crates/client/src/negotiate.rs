use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use driveway_protocol::{ControllerConfig, SdpError, rewrite_answer};
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub(crate) enum NegotiationError {
    #[error("peer connection: {0}")]
    Peer(#[from] webrtc::Error),
    #[error("no local description after setting the offer")]
    NoLocalDescription,
    #[error("negotiation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("controller answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("answer is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("answer is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Sdp(#[from] SdpError),
    #[error("negotiation timed out after {0:?}")]
    Timeout(Duration),
}

/// Out-of-band offer/answer exchange with the controller's HTTP endpoint.
pub(crate) struct NegotiationClient {
    http: Client,
    url: String,
    hostname: String,
    timeout: Duration,
}

impl NegotiationClient {
    pub(crate) fn new(controller: &ControllerConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: controller.negotiation_url(),
            hostname: controller.hostname().to_string(),
            timeout,
        })
    }

    /// POST the offer and return the rewritten answer SDP.
    pub(crate) async fn exchange(&self, offer_sdp: &str) -> Result<String, NegotiationError> {
        debug!(url = %self.url, "Posting SDP offer");
        let resp = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(CACHE_CONTROL, "no-cache")
            .body(form_body(offer_sdp))
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NegotiationError::Status { status, body });
        }

        let body = resp.text().await.map_err(|e| self.request_error(e))?;
        decode_answer(&body, &self.hostname)
    }

    fn request_error(&self, e: reqwest::Error) -> NegotiationError {
        if e.is_timeout() {
            NegotiationError::Timeout(self.timeout)
        } else {
            NegotiationError::Http(e)
        }
    }
}

/// `data=<urlencoded base64 SDP>`
pub(crate) fn form_body(sdp: &str) -> String {
    format!("data={}", urlencoding::encode(&STANDARD.encode(sdp)))
}

/// Decode the controller's base64 answer and point its candidates at `hostname`.
pub(crate) fn decode_answer(body: &str, hostname: &str) -> Result<String, NegotiationError> {
    let raw = STANDARD.decode(body.trim())?;
    let sdp = String::from_utf8(raw)?;
    Ok(rewrite_answer(&sdp, hostname)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A controller negotiation endpoint on loopback.
    async fn endpoint() -> (TcpListener, NegotiationClient) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let controller = ControllerConfig {
            host: "127.0.0.1".to_string(),
            token: "tok".to_string(),
            negotiation_port: port,
            ..Default::default()
        };
        let client = NegotiationClient::new(&controller, Duration::from_millis(500)).unwrap();
        (listener, client)
    }

    /// Read one request and answer it. Returns the lowercased head and the body.
    async fn answer_once(listener: TcpListener, status: &str, body: String) -> (String, String) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before request head");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let length: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .map(|v| v.trim().parse().unwrap())
            .unwrap_or(0);
        while buf.len() < head_end + length {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before request body");
            buf.extend_from_slice(&chunk[..n]);
        }
        let request_body = String::from_utf8_lossy(&buf[head_end..head_end + length]).into_owned();

        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();
        (head, request_body)
    }

    #[test]
    fn form_body_escapes_base64_alphabet() {
        // '+' and '/' and '=' must not reach the server unescaped.
        let body = form_body("v=0\r\n\u{fb}\u{ff}");
        assert!(body.starts_with("data="));
        let value = &body["data=".len()..];
        assert!(!value.contains('+'));
        assert!(!value.contains('/'));
        assert!(!value.contains('='));

        let decoded = urlencoding::decode(value).unwrap();
        let sdp = STANDARD.decode(decoded.as_bytes()).unwrap();
        assert_eq!(sdp, "v=0\r\n\u{fb}\u{ff}".as_bytes());
    }

    #[test]
    fn decode_answer_rewrites_candidates() {
        let answer = "v=0\r\na=candidate:1 1 udp 2130706431 192.168.1.20 50000 typ host\r\na=end-of-candidates\r\n";
        let body = format!("{}\n", STANDARD.encode(answer));
        let sdp = decode_answer(&body, "gate.example.com").unwrap();
        assert_eq!(
            sdp,
            "v=0\r\na=candidate:1 1 udp 2130706431 gate.example.com 50000 typ host\r\na=end-of-candidates\r\n"
        );
    }

    #[test]
    fn decode_answer_rejects_garbage() {
        assert!(matches!(
            decode_answer("not base64!", "gate.example.com"),
            Err(NegotiationError::Decode(_))
        ));
    }

    #[test]
    fn decode_answer_fails_closed_without_candidates() {
        let body = STANDARD.encode("v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        assert!(matches!(
            decode_answer(&body, "gate.example.com"),
            Err(NegotiationError::Sdp(SdpError::MissingCandidates))
        ));
    }

    #[test]
    fn client_targets_negotiation_port() {
        let controller = ControllerConfig {
            host: "gate.example.com:8080".to_string(),
            token: "tok".to_string(),
            ..Default::default()
        };
        let client = NegotiationClient::new(&controller, Duration::from_secs(5)).unwrap();
        assert_eq!(client.url, "http://gate.example.com:8031/tok");
        assert_eq!(client.hostname, "gate.example.com");
    }

    #[tokio::test]
    async fn exchange_posts_form_and_rewrites_answer() {
        let (listener, client) = endpoint().await;
        let answer = "v=0\r\na=candidate:1 1 udp 2130706431 192.168.1.20 50000 typ host\r\na=end-of-candidates\r\n";
        let server = tokio::spawn(answer_once(listener, "200 OK", STANDARD.encode(answer)));

        let offer = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n";
        let sdp = client.exchange(offer).await.unwrap();
        assert_eq!(
            sdp,
            "v=0\r\na=candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host\r\na=end-of-candidates\r\n"
        );

        let (head, body) = server.await.unwrap();
        assert!(head.starts_with("post /tok http/1.1"));
        assert!(head.contains("content-type: application/x-www-form-urlencoded"));
        assert!(head.contains("cache-control: no-cache"));
        assert_eq!(body, form_body(offer));
    }

    #[tokio::test]
    async fn error_status_is_a_negotiation_error() {
        let (listener, client) = endpoint().await;
        let server = tokio::spawn(answer_once(
            listener,
            "500 Internal Server Error",
            "boom".to_string(),
        ));

        match client.exchange("v=0\r\n").await {
            Err(NegotiationError::Status { status, body }) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "boom");
            }
            other => panic!("expected Status error, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn stalled_exchange_times_out() {
        let (listener, client) = endpoint().await;
        // Accept and never answer.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        match client.exchange("v=0\r\n").await {
            Err(NegotiationError::Timeout(after)) => {
                assert_eq!(after, Duration::from_millis(500));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        server.abort();
    }
}
