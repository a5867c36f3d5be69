//! Prometheus endpoint scraper
//!
//! This module fetches the Prometheus formatted metrics page of the target
//! node and turns each response into a [`Snapshot`].
//!

pub mod parser;

use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use metrics::counter;
use tracing::{debug, info, trace, warn};

use crate::config::{Config, Endpoint, Scheme};

use self::parser::{Parser, Snapshot};

#[derive(Debug, thiserror::Error)]
/// Errors produced by [`Scraper`]
pub enum Error {
    /// The local hostname could not be read
    #[error("Failed to read hostname: {0}")]
    Hostname(#[from] nix::Error),
    /// The hostname is not valid UTF-8
    #[error("Hostname is not valid UTF-8")]
    HostnameEncoding,
    /// DNS lookup failed
    #[error("Failed to resolve {host}: {source}")]
    Resolve {
        /// Host being resolved
        host: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
    /// DNS lookup returned no IPv4 address
    #[error("No IPv4 address found for {0}")]
    NoAddress(String),
    /// Reading the TLS client identity failed
    #[error("Failed to read {path:?}: {source}")]
    ReadIdentity {
        /// File being read
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The endpoint answered with a non-success status
    #[error("{uri} returned status {status}")]
    Status {
        /// Scraped URI
        uri: String,
        /// HTTP status code
        status: u16,
    },
    /// The response is not valid exposition text
    #[error(transparent)]
    Parse(#[from] parser::Error),
}

/// Fetches and parses the metrics page of one endpoint
#[derive(Debug)]
pub struct Scraper {
    client: reqwest::Client,
    uri: String,
    parser: Parser,
}

impl Scraper {
    /// Create a new [`Scraper`] from configuration
    ///
    /// Resolves the endpoint host and, for https endpoints, loads the client
    /// identity from the TLS directory if one is present for that host.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be resolved, the identity files
    /// cannot be read, or the HTTP client cannot be built.
    pub async fn new(config: &Config) -> Result<Self, Error> {
        let endpoint = &config.endpoint;
        let host = resolve_host(endpoint.host.as_deref(), endpoint.port).await?;
        let client = build_client(endpoint, &host).await?;
        let uri = endpoint.uri(&host);
        info!("Scraping {uri}");

        Ok(Self {
            client,
            uri,
            parser: Parser::new(&config.prefixes),
        })
    }

    /// Create a [`Scraper`] for an explicit URI with a default HTTP client
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_uri(uri: impl Into<String>, parser: Parser, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            uri: uri.into(),
            parser,
        })
    }

    /// The scraped URI
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Fetch the raw metrics page
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the status is not a success.
    pub async fn fetch(&self) -> Result<String, Error> {
        self.fetch_text().await.inspect_err(record_failure)
    }

    /// Fetch and parse one [`Snapshot`]
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch fails or the response does not parse.
    pub async fn snapshot(&self) -> Result<Snapshot, Error> {
        let snapshot = async {
            let text = self.fetch_text().await?;
            Ok::<_, Error>(self.parser.parse_text(&text)?)
        }
        .await
        .inspect_err(record_failure)?;

        counter!("samples_accepted").increment(snapshot.len() as u64);
        debug!(
            "Parsed {} samples at timestamp {:?}",
            snapshot.len(),
            snapshot.timestamp()
        );
        Ok(snapshot)
    }

    async fn fetch_text(&self) -> Result<String, Error> {
        counter!("scrape_requests").increment(1);
        let resp = self.client.get(&self.uri).send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Status {
                uri: self.uri.clone(),
                status: status.as_u16(),
            });
        }

        let text = resp.text().await?;
        counter!("scrape_bytes").increment(text.len() as u64);
        trace!("Read {} bytes from {}", text.len(), self.uri);
        Ok(text)
    }
}

fn record_failure(e: &Error) {
    counter!("scrape_failures").increment(1);
    warn!("Scrape failed: {e}");
}

/// Resolve the host to scrape
///
/// A configured host is used verbatim. Otherwise the local hostname is
/// resolved and its first IPv4 address is used, which is also the name the
/// node's TLS identity files are keyed by.
///
/// # Errors
///
/// Returns an error if the hostname cannot be read or has no IPv4 address.
pub async fn resolve_host(configured: Option<&str>, port: u16) -> Result<String, Error> {
    if let Some(host) = configured {
        return Ok(host.to_string());
    }

    let hostname = nix::unistd::gethostname()?
        .into_string()
        .map_err(|_| Error::HostnameEncoding)?;
    let addrs = tokio::net::lookup_host((hostname.as_str(), port))
        .await
        .map_err(|source| Error::Resolve {
            host: hostname.clone(),
            source,
        })?;

    let ip = addrs
        .map(|addr| addr.ip())
        .find(IpAddr::is_ipv4)
        .ok_or_else(|| Error::NoAddress(hostname.clone()))?;
    debug!("Resolved {hostname} to {ip}");
    Ok(ip.to_string())
}

async fn build_client(endpoint: &Endpoint, host: &str) -> Result<reqwest::Client, Error> {
    let mut builder = reqwest::Client::builder().timeout(endpoint.timeout());

    if endpoint.scheme == Scheme::Https {
        builder = builder.danger_accept_invalid_certs(endpoint.tls.accept_invalid_certs);
        if let Some(identity) = load_identity(endpoint, host).await? {
            builder = builder.identity(identity);
        }
    }

    Ok(builder.build()?)
}

async fn load_identity(endpoint: &Endpoint, host: &str) -> Result<Option<reqwest::Identity>, Error> {
    let (cert_path, key_path) = endpoint.tls.identity_paths(host);
    if !exists(&cert_path).await? || !exists(&key_path).await? {
        debug!("No client identity at {cert_path:?}, continuing without one");
        return Ok(None);
    }

    let cert = read(cert_path).await?;
    let key = read(key_path).await?;
    Ok(Some(reqwest::Identity::from_pkcs8_pem(&cert, &key)?))
}

async fn exists(path: &Path) -> Result<bool, Error> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|source| Error::ReadIdentity {
            path: path.to_path_buf(),
            source,
        })
}

async fn read(path: PathBuf) -> Result<Vec<u8>, Error> {
    tokio::fs::read(&path)
        .await
        .map_err(|source| Error::ReadIdentity { path, source })
}

#[allow(clippy::needless_raw_string_hashes)]
#[cfg(test)]
mod tests {
    use super::*;
    use metrics::Key;
    use metrics_util::{
        CompositeKey, MetricKind,
        debugging::{DebugValue, DebuggingRecorder},
    };
    use warp::Filter;

    const SCRAPE: &str = r#"# HELP log_sync_latency Sync latency
# TYPE log_sync_latency_sum counter
log_sync_latency_sum{table_name="warehouse",exported_instance="n1"} 434852 1706682229466
log_sync_latency_count{table_name="warehouse",exported_instance="n1"} 50 1706682229466
handler_latency_yb_tserver_count{table_name="warehouse"} 10 1706682229466
"#;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build runtime")
    }

    async fn serve(body: &'static str, status: warp::http::StatusCode) -> String {
        let server = warp::serve(
            warp::path("prometheus-metrics").map(move || warp::reply::with_status(body, status)),
        );
        let (addr, serve_fut) = server.bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serve_fut);
        format!("http://{addr}/prometheus-metrics")
    }

    fn counter_value(
        snapshot: &std::collections::HashMap<
            CompositeKey,
            (
                Option<metrics::Unit>,
                Option<metrics::SharedString>,
                DebugValue,
            ),
        >,
        name: &'static str,
    ) -> Option<u64> {
        match snapshot.get(&CompositeKey::new(MetricKind::Counter, Key::from_static_name(name))) {
            Some((_, _, DebugValue::Counter(v))) => Some(*v),
            _ => None,
        }
    }

    #[test]
    fn snapshot_from_endpoint() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let snapshot = metrics::with_local_recorder(&recorder, || {
            runtime().block_on(async {
                let uri = serve(SCRAPE, warp::http::StatusCode::OK).await;
                let scraper = Scraper::with_uri(uri, Parser::default(), Duration::from_secs(5))
                    .expect("client should build");
                scraper.snapshot().await
            })
        })
        .expect("scrape should succeed");

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.timestamp(), Some(1_706_682_229_466));

        #[allow(clippy::mutable_key_type)]
        let metrics = snapshotter.snapshot().into_hashmap();
        assert_eq!(counter_value(&metrics, "scrape_requests"), Some(1));
        assert_eq!(counter_value(&metrics, "samples_accepted"), Some(2));
        assert_eq!(
            counter_value(&metrics, "scrape_bytes"),
            Some(SCRAPE.len() as u64)
        );
    }

    #[test]
    fn non_success_status_is_an_error() {
        let result = runtime().block_on(async {
            let uri = serve("", warp::http::StatusCode::SERVICE_UNAVAILABLE).await;
            let scraper = Scraper::with_uri(uri, Parser::default(), Duration::from_secs(5))
                .expect("client should build");
            scraper.snapshot().await
        });
        assert!(matches!(result, Err(Error::Status { status: 503, .. })));
    }

    #[test]
    fn failures_are_counted() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let (refused, malformed) = metrics::with_local_recorder(&recorder, || {
            runtime().block_on(async {
                let listener =
                    std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
                let addr = listener.local_addr().expect("local addr");
                drop(listener);
                let scraper = Scraper::with_uri(
                    format!("http://{addr}/prometheus-metrics"),
                    Parser::default(),
                    Duration::from_secs(5),
                )
                .expect("client should build");
                let refused = scraper.snapshot().await;

                let uri = serve(
                    "log_sync_latency_sum{table_name=\"t1\"} 1 1000\r\n",
                    warp::http::StatusCode::OK,
                )
                .await;
                let scraper = Scraper::with_uri(uri, Parser::default(), Duration::from_secs(5))
                    .expect("client should build");
                (refused, scraper.snapshot().await)
            })
        });

        assert!(matches!(refused, Err(Error::Http(_))));
        assert!(matches!(
            malformed,
            Err(Error::Parse(parser::Error::MalformedLine { .. }))
        ));

        #[allow(clippy::mutable_key_type)]
        let metrics = snapshotter.snapshot().into_hashmap();
        assert_eq!(counter_value(&metrics, "scrape_requests"), Some(2));
        assert_eq!(counter_value(&metrics, "scrape_failures"), Some(2));
        assert_eq!(counter_value(&metrics, "samples_accepted"), None);
    }

    #[test]
    fn malformed_response_is_an_error() {
        let result = runtime().block_on(async {
            let uri = serve(
                "log_sync_latency_sum{table_name=\"t1\"} notanumber 1000\n",
                warp::http::StatusCode::OK,
            )
            .await;
            let scraper = Scraper::with_uri(uri, Parser::default(), Duration::from_secs(5))
                .expect("client should build");
            scraper.snapshot().await
        });
        assert!(matches!(
            result,
            Err(Error::Parse(parser::Error::MalformedLine { .. }))
        ));
    }

    #[test]
    fn configured_host_is_used_verbatim() {
        let host = runtime()
            .block_on(resolve_host(Some("db-1.internal"), 9000))
            .expect("configured host needs no lookup");
        assert_eq!(host, "db-1.internal");
    }

    #[test]
    fn missing_identity_is_skipped() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut endpoint = Endpoint::default();
        endpoint.scheme = Scheme::Https;
        endpoint.tls.directory = Some(dir.path().to_path_buf());

        let identity = runtime()
            .block_on(load_identity(&endpoint, "127.0.0.1"))
            .expect("absent identity is not an error");
        assert!(identity.is_none());
    }
}
