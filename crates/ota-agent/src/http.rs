//! HTTP transport built on reqwest

use std::time::Duration;

use async_trait::async_trait;
use ota_updater::error::TransportError;
use ota_updater::transport::{Transport, TransportConfig, TransportStream};
use parking_lot::Mutex;
use tracing::{debug, trace};

const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Downloads firmware images with HTTP GET.
///
/// The client is kept between attempts and rebuilt only when the transport
/// settings change, so keep-alive connections are reused across polls.
#[derive(Default)]
pub struct HttpTransport {
    client: Mutex<Option<(TransportConfig, reqwest::Client)>>,
}

impl HttpTransport {
    /// Transport with no client built yet
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, config: &TransportConfig) -> Result<reqwest::Client, TransportError> {
        let mut cached = self.client.lock();
        if let Some((built_for, client)) = cached.as_ref()
            && built_for.timeout == config.timeout
            && built_for.keep_alive == config.keep_alive
        {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().connect_timeout(config.timeout);
        builder = if config.keep_alive {
            builder.tcp_keepalive(TCP_KEEPALIVE)
        } else {
            builder.pool_max_idle_per_host(0)
        };
        let client = builder.build().map_err(|e| TransportError::Open {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;

        *cached = Some((config.clone(), client.clone()));
        Ok(client)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(
        &self,
        config: &TransportConfig,
    ) -> Result<Box<dyn TransportStream>, TransportError> {
        let client = self.client(config)?;
        let send = client.get(&config.url).send();
        let response = match tokio::time::timeout(config.timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(TransportError::Open {
                    url: config.url.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(TransportError::Open {
                    url: config.url.clone(),
                    reason: format!("no response within {:?}", config.timeout),
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        let content_length = response.content_length();
        debug!(url = %config.url, ?content_length, "Download started");

        Ok(Box::new(HttpStream {
            response: Some(response),
            pending: Vec::new(),
            pos: 0,
            received: 0,
            content_length,
            ended: false,
            read_timeout: config.timeout,
        }))
    }
}

/// An in-flight HTTP download
struct HttpStream {
    response: Option<reqwest::Response>,
    pending: Vec<u8>,
    pos: usize,
    received: u64,
    content_length: Option<u64>,
    ended: bool,
    read_timeout: Duration,
}

impl HttpStream {
    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let rest = self.pending.get(self.pos..).unwrap_or_default();
        let n = rest.len().min(buf.len());
        if let (Some(dst), Some(src)) = (buf.get_mut(..n), rest.get(..n)) {
            dst.copy_from_slice(src);
        }
        self.pos = self.pos.saturating_add(n);
        n
    }
}

#[async_trait]
impl TransportStream for HttpStream {
    /// Fill `buf` from as many body chunks as it takes. A short count only
    /// happens at the end of the body.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut filled = 0;
        loop {
            let n = self.drain_pending(buf.get_mut(filled..).unwrap_or_default());
            filled = filled.saturating_add(n);
            if filled == buf.len() || self.ended {
                return Ok(filled);
            }
            let Some(response) = self.response.as_mut() else {
                return Ok(filled);
            };

            let chunk = match tokio::time::timeout(self.read_timeout, response.chunk()).await {
                Ok(Ok(chunk)) => chunk,
                Ok(Err(e)) if e.is_timeout() => {
                    return Err(TransportError::Read(format!("timed out: {e}")));
                }
                Ok(Err(e)) => return Err(TransportError::Read(e.to_string())),
                Err(_) => {
                    return Err(TransportError::Read(format!(
                        "no data within {:?}",
                        self.read_timeout
                    )));
                }
            };

            match chunk {
                Some(bytes) => {
                    trace!(len = bytes.len(), filled, "Body chunk received");
                    self.received = self.received.saturating_add(bytes.len() as u64);
                    self.pending = bytes.to_vec();
                    self.pos = 0;
                }
                None => self.ended = true,
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.ended && self.content_length.is_none_or(|len| self.received >= len)
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    async fn close(&mut self) {
        self.response = None;
        self.pending.clear();
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileStore;
    use crate::config::default_partitions;
    use ota_test_helpers::fixtures::ImageBuilder;
    use ota_test_helpers::{must, must_some};
    use ota_updater::config::OtaConfig;
    use ota_updater::orchestrator::{UpdateOrchestrator, UpdateState};
    use ota_updater::partition::PartitionStore;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: String) -> TransportConfig {
        TransportConfig {
            url,
            timeout: Duration::from_secs(5),
            keep_alive: true,
        }
    }

    async fn read_all(stream: &mut dyn TransportStream, buf_len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; buf_len];
        loop {
            let n = must(stream.read(&mut buf).await);
            if n == 0 {
                return out;
            }
            out.extend_from_slice(buf.get(..n).unwrap_or_default());
        }
    }

    #[tokio::test]
    async fn test_body_is_read_in_buffer_sized_pieces() {
        let server = MockServer::start().await;
        let body: Vec<u8> = (0..5_000u32).map(|i| (i % 251) as u8).collect();
        Mock::given(method("GET"))
            .and(path("/app.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let transport = HttpTransport::new();
        let mut stream = must(transport.open(&config(format!("{}/app.bin", server.uri()))).await);

        assert_eq!(stream.content_length(), Some(5_000));
        let mut first = vec![0u8; 1024];
        let n = must(stream.read(&mut first).await);
        assert_eq!(n, 1024);
        assert!(!stream.is_complete());

        let mut received = first.get(..n).unwrap_or_default().to_vec();
        received.extend(read_all(stream.as_mut(), 1024).await);
        assert_eq!(received, body);
        assert!(stream.is_complete());
        stream.close().await;
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let transport = HttpTransport::new();
        let result = transport.open(&config(format!("{}/missing.bin", server.uri()))).await;
        assert!(matches!(result, Err(TransportError::Status(404))));
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_to_open() {
        let transport = HttpTransport::new();
        let mut cfg = config("http://127.0.0.1:9/app.bin".to_string());
        cfg.timeout = Duration::from_millis(500);

        let result = transport.open(&cfg).await;
        assert!(matches!(result, Err(TransportError::Open { .. })));
    }

    #[tokio::test]
    async fn test_empty_body_is_complete() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let transport = HttpTransport::new();
        let mut stream = must(transport.open(&config(format!("{}/app.bin", server.uri()))).await);
        let mut buf = [0u8; 64];
        assert_eq!(must(stream.read(&mut buf).await), 0);
        assert!(stream.is_complete());
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let transport = HttpTransport::new();
        let mut cfg = config(format!("{}/app.bin", server.uri()));
        cfg.timeout = Duration::from_millis(200);

        let result = transport.open(&cfg).await;
        assert!(matches!(result, Err(TransportError::Open { .. })));
    }

    /// How the raw server ends the response after writing `parts`
    #[derive(Clone, Copy)]
    enum Ending {
        Close,
        Stall,
    }

    /// Serve one response for `body`, sending `parts` as separate TCP writes
    /// with `gap` in between. `parts` are byte counts into `body`.
    async fn serve_in_parts(
        body: Vec<u8>,
        parts: Vec<usize>,
        gap: Duration,
        ending: Ending,
    ) -> SocketAddr {
        let listener = must(TcpListener::bind("127.0.0.1:0").await);
        let addr = must(listener.local_addr());
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0u8; 512];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(buf.get(..n).unwrap_or_default()),
                }
            }

            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            let mut offset: usize = 0;
            for len in parts {
                let end = offset.saturating_add(len).min(body.len());
                let part = body.get(offset..end).unwrap_or_default();
                if socket.write_all(part).await.is_err() || socket.flush().await.is_err() {
                    return;
                }
                offset = end;
                tokio::time::sleep(gap).await;
            }
            if matches!(ending, Ending::Stall) {
                std::future::pending::<()>().await;
            }
        });
        addr
    }

    fn seeded_store(dir: &std::path::Path, running_version: &str) -> Arc<FileStore> {
        let store = must(FileStore::open(dir, default_partitions()));
        let running = store.running_partition();
        must(std::fs::write(
            store.image_path(&running),
            ImageBuilder::new(running_version).payload(512).build(),
        ));
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_short_first_frame_still_fills_the_buffer() {
        let body: Vec<u8> = (0..3_000u32).map(|i| (i % 251) as u8).collect();
        let gap = Duration::from_millis(100);
        let addr = serve_in_parts(body.clone(), vec![100, 2_900], gap, Ending::Close).await;

        let transport = HttpTransport::new();
        let mut stream = must(transport.open(&config(format!("http://{addr}/app.bin"))).await);

        let mut first = vec![0u8; 1024];
        assert_eq!(must(stream.read(&mut first).await), 1024);
        assert_eq!(first.as_slice(), body.get(..1024).unwrap_or_default());

        let mut received = first;
        received.extend(read_all(stream.as_mut(), 1024).await);
        assert_eq!(received, body);
        assert!(stream.is_complete());
    }

    #[tokio::test]
    async fn test_image_with_split_header_is_committed() {
        let dir = must(tempfile::tempdir());
        let store = seeded_store(dir.path(), "1.0.0");
        let image = ImageBuilder::new("1.1.0").payload(4_000).build();
        let rest = image.len().saturating_sub(100);
        let gap = Duration::from_millis(100);
        let addr = serve_in_parts(image.clone(), vec![100, rest], gap, Ending::Close).await;

        let mut orchestrator = must(UpdateOrchestrator::new(
            store.clone(),
            Arc::new(HttpTransport::new()),
            OtaConfig::with_url(format!("http://{addr}/app.bin")),
        ));
        let report = must(orchestrator.run_attempt().await);

        assert_eq!(report.version, "1.1.0");
        assert_eq!(report.bytes_written, image.len() as u64);
        assert_eq!(must(std::fs::read(store.image_path(&report.target))), image);
    }

    #[tokio::test]
    async fn test_shutdown_mid_download_releases_the_session() {
        let dir = must(tempfile::tempdir());
        let store = seeded_store(dir.path(), "1.0.0");
        let image = ImageBuilder::new("1.1.0").payload(4_000).build();
        let gap = Duration::from_millis(10);
        let addr = serve_in_parts(image, vec![2_000], gap, Ending::Stall).await;

        let mut ota = OtaConfig::with_url(format!("http://{addr}/app.bin"));
        ota.poll_interval_ms = 10;
        ota.timeout_ms = 300;
        let mut orchestrator = must(UpdateOrchestrator::new(
            store.clone(),
            Arc::new(HttpTransport::new()),
            ota,
        ));
        let mut events = orchestrator.subscribe();
        let streaming = async move {
            while let Ok(event) = events.recv().await {
                if event.state == UpdateState::Streaming {
                    return;
                }
            }
        };

        assert!(orchestrator.run_until(streaming).await.is_none());

        assert!(!dir.path().join("ota_1.bin.part").exists());
        assert!(!dir.path().join("ota_1.bin").exists());
        assert_eq!(store.configured_boot_partition().label, "ota_0");
        let target = must_some(store.next_update_partition(None), "no update slot");
        let handle = must(store.begin_write(&target).await);
        store.abort_write(handle).await;
    }
}
