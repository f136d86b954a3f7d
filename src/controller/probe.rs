//! HTTP latency probe through the proxy core
//!
//! Issues a single HTTP/1.1 GET over a connection dialed by the core and
//! reports the elapsed wall clock. No body is sent, redirects are not
//! followed; 200 and 204 count as success. The HTTPS leg uses rustls with
//! the bundled webpki roots.

use crate::callback::HostCallbacks;
use crate::dialer::{Destination, ProtectedDialer};
use crate::engine::{EngineFactory, ProxyEngine};
use crate::resolver::SystemResolver;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Default measurement target, a no-content endpoint.
const DEFAULT_PROBE_URL: &str = "https://www.google.com/generate_204";

/// Whole-probe deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(12);

/// TLS handshake sub-deadline.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(6);

/// App-config type names the standalone measurement path retains. Everything
/// else — inbounds above all — is dropped so the throwaway core never binds
/// a listening port.
const PROBE_RETAINED_APPS: [&str; 3] = [
    "core.app.proxyman.OutboundConfig",
    "core.app.dispatcher.Config",
    "core.app.log.Config",
];

/// Probe errors
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe failed: {0}")]
    Failed(String),

    #[error("probe timed out")]
    Timeout,
}

/// Time one GET through `engine`. Empty `url` means the default target.
pub(crate) async fn measure_engine_delay(
    engine: &dyn ProxyEngine,
    url: &str,
) -> Result<i64, ProbeError> {
    let url = if url.is_empty() { DEFAULT_PROBE_URL } else { url };
    let target = ProbeUrl::parse(url)?;

    let start = Instant::now();
    let status = timeout(PROBE_TIMEOUT, fetch_status(engine, &target))
        .await
        .map_err(|_| ProbeError::Timeout)??;

    match status {
        200 | 204 => {
            let elapsed = start.elapsed().as_millis() as i64;
            debug!(url, status, elapsed, "probe succeeded");
            Ok(elapsed)
        }
        other => Err(ProbeError::Failed(format!("unexpected status {other}"))),
    }
}

/// Measure latency through a short-lived core built from `config_json`.
///
/// The configuration is stripped down first: the inbound list is emptied and
/// only the outbound, dispatcher, and log app entries survive. The core is
/// built, started, probed once, and closed; the controller mutex is not
/// involved.
pub async fn measure_outbound_delay(
    factory: &dyn EngineFactory,
    callbacks: Arc<dyn HostCallbacks>,
    config_json: &str,
    url: &str,
) -> Result<i64, ProbeError> {
    let config = strip_for_probe(config_json)?;

    let dialer = Arc::new(ProtectedDialer::new(
        callbacks,
        Arc::new(SystemResolver::new()),
    ));
    let engine = factory
        .build(&config, dialer)
        .map_err(|err| ProbeError::Failed(err.to_string()))?;
    engine
        .start()
        .await
        .map_err(|err| ProbeError::Failed(err.to_string()))?;

    let result = measure_engine_delay(engine.as_ref(), url).await;

    if let Err(err) = engine.close().await {
        warn!(%err, "measurement core close failed");
    }
    result
}

/// Empty the inbound list and drop every app entry except the retained
/// types. Skipping this would make the throwaway measurement core bind the
/// configuration's listening ports.
fn strip_for_probe(config_json: &str) -> Result<String, ProbeError> {
    let mut config: serde_json::Value = serde_json::from_str(config_json)
        .map_err(|err| ProbeError::Failed(format!("invalid config: {err}")))?;
    let obj = config
        .as_object_mut()
        .ok_or_else(|| ProbeError::Failed("config is not an object".into()))?;

    obj.insert("inbound".into(), serde_json::Value::Array(Vec::new()));

    if let Some(apps) = obj.get_mut("app").and_then(|a| a.as_array_mut()) {
        apps.retain(|app| {
            app.get("type")
                .and_then(|t| t.as_str())
                .is_some_and(|ty| PROBE_RETAINED_APPS.contains(&ty))
        });
    }

    serde_json::to_string(&config).map_err(|err| ProbeError::Failed(err.to_string()))
}

async fn fetch_status(engine: &dyn ProxyEngine, target: &ProbeUrl) -> Result<u16, ProbeError> {
    let dest = Destination::tcp(target.host.clone(), target.port);
    let conn = engine
        .dial(&dest)
        .await
        .map_err(|err| ProbeError::Failed(err.to_string()))?;

    if target.tls {
        let connector = tls_connector()?;
        let name = ServerName::try_from(target.host.clone())
            .map_err(|_| ProbeError::Failed(format!("invalid server name {}", target.host)))?;
        let stream = timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(name, conn))
            .await
            .map_err(|_| ProbeError::Timeout)?
            .map_err(|err| ProbeError::Failed(format!("tls handshake: {err}")))?;
        request_status(stream, target).await
    } else {
        request_status(conn, target).await
    }
}

async fn request_status<S>(mut stream: S, target: &ProbeUrl) -> Result<u16, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        target.path,
        target.host_header()
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|err| ProbeError::Failed(err.to_string()))?;

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .await
        .map_err(|err| ProbeError::Failed(err.to_string()))?;

    parse_status_line(&status_line)
}

fn parse_status_line(line: &str) -> Result<u16, ProbeError> {
    // e.g. "HTTP/1.1 204 No Content"
    let mut parts = line.split_whitespace();
    parts
        .next()
        .filter(|version| version.starts_with("HTTP/"))
        .ok_or_else(|| ProbeError::Failed(format!("malformed status line {line:?}")))?;
    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| ProbeError::Failed(format!("malformed status line {line:?}")))
}

fn tls_connector() -> Result<TlsConnector, ProbeError> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|err| ProbeError::Failed(err.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Minimal parsed form of a probe URL.
struct ProbeUrl {
    tls: bool,
    host: String,
    port: u16,
    path: String,
}

impl ProbeUrl {
    fn parse(url: &str) -> Result<Self, ProbeError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| ProbeError::Failed(format!("unsupported url {url:?}")))?;
        let tls = match scheme {
            "http" => false,
            "https" => true,
            other => return Err(ProbeError::Failed(format!("unsupported scheme {other:?}"))),
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(ProbeError::Failed(format!("unsupported url {url:?}")));
        }

        let default_port = if tls { 443 } else { 80 };
        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let (host, rest) = v6
                .split_once(']')
                .ok_or_else(|| ProbeError::Failed(format!("unsupported url {url:?}")))?;
            let port = match rest.strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| ProbeError::Failed(format!("bad port in {url:?}")))?,
                None => default_port,
            };
            (host.to_string(), port)
        } else if let Some((host, port)) = authority.rsplit_once(':') {
            let port = port
                .parse()
                .map_err(|_| ProbeError::Failed(format!("bad port in {url:?}")))?;
            (host.to_string(), port)
        } else {
            (authority.to_string(), default_port)
        };

        Ok(Self {
            tls,
            host,
            port,
            path: path.to_string(),
        })
    }

    fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        let bracketed = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            bracketed
        } else {
            format!("{bracketed}:{}", self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AsyncConn, EngineError, StatsRegistry};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    struct LoopbackEngine {
        addr: Option<SocketAddr>,
    }

    #[async_trait]
    impl ProxyEngine for LoopbackEngine {
        async fn start(&self) -> Result<(), EngineError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), EngineError> {
            Ok(())
        }
        fn stats(&self) -> Option<Arc<dyn StatsRegistry>> {
            None
        }
        async fn dial(&self, _dest: &Destination) -> Result<Box<dyn AsyncConn>, EngineError> {
            match self.addr {
                Some(addr) => {
                    let stream = TcpStream::connect(addr)
                        .await
                        .map_err(|e| EngineError::Dial(e.to_string()))?;
                    Ok(Box::new(stream) as Box<dyn AsyncConn>)
                }
                // a dial that never completes, for deadline tests
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    async fn serve_once(response: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream.write_all(response.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn probe_accepts_204() {
        let addr = serve_once("HTTP/1.1 204 No Content\r\n\r\n").await;
        let engine = LoopbackEngine { addr: Some(addr) };
        let url = format!("http://127.0.0.1:{}/generate_204", addr.port());

        let elapsed = measure_engine_delay(&engine, &url).await.unwrap();
        assert!(elapsed >= 0);
    }

    #[tokio::test]
    async fn probe_rejects_other_statuses() {
        let addr = serve_once("HTTP/1.1 404 Not Found\r\n\r\n").await;
        let engine = LoopbackEngine { addr: Some(addr) };
        let url = format!("http://127.0.0.1:{}/missing", addr.port());

        let err = measure_engine_delay(&engine, &url).await.unwrap_err();
        assert!(matches!(err, ProbeError::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_times_out_on_a_stalled_dial() {
        let engine = LoopbackEngine { addr: None };
        let err = measure_engine_delay(&engine, "http://stalled.example/")
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout));
    }

    #[test]
    fn probe_url_parsing() {
        let url = ProbeUrl::parse("https://www.google.com/generate_204").unwrap();
        assert!(url.tls);
        assert_eq!(url.host, "www.google.com");
        assert_eq!(url.port, 443);
        assert_eq!(url.path, "/generate_204");
        assert_eq!(url.host_header(), "www.google.com");

        let url = ProbeUrl::parse("http://example.com:8080").unwrap();
        assert!(!url.tls);
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/");
        assert_eq!(url.host_header(), "example.com:8080");

        let url = ProbeUrl::parse("http://[2001:db8::1]:8080/x").unwrap();
        assert_eq!(url.host, "2001:db8::1");
        assert_eq!(url.host_header(), "[2001:db8::1]:8080");

        assert!(ProbeUrl::parse("ftp://example.com/").is_err());
        assert!(ProbeUrl::parse("not a url").is_err());
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(parse_status_line("HTTP/1.1 204 No Content\r\n").unwrap(), 204);
        assert_eq!(parse_status_line("HTTP/1.0 200 OK\r\n").unwrap(), 200);
        assert!(parse_status_line("SSH-2.0-OpenSSH\r\n").is_err());
        assert!(parse_status_line("HTTP/1.1 abc\r\n").is_err());
    }

    #[test]
    fn probe_config_keeps_only_essential_apps() {
        let config = r#"{
            "inbound": [{"type": "core.inbound.Config", "listen": "127.0.0.1:1080"}],
            "app": [
                {"type": "core.app.proxyman.OutboundConfig"},
                {"type": "core.app.proxyman.InboundConfig"},
                {"type": "core.app.dispatcher.Config"},
                {"type": "core.app.stats.Config"},
                {"type": "core.app.log.Config"}
            ]
        }"#;

        let stripped: serde_json::Value =
            serde_json::from_str(&strip_for_probe(config).unwrap()).unwrap();

        assert_eq!(stripped["inbound"], serde_json::json!([]));
        let kept: Vec<&str> = stripped["app"]
            .as_array()
            .unwrap()
            .iter()
            .map(|app| app["type"].as_str().unwrap())
            .collect();
        assert_eq!(
            kept,
            [
                "core.app.proxyman.OutboundConfig",
                "core.app.dispatcher.Config",
                "core.app.log.Config"
            ]
        );
    }

    #[test]
    fn probe_config_rejects_garbage() {
        assert!(strip_for_probe("not json").is_err());
        assert!(strip_for_probe("[1, 2]").is_err());
    }
}
