use crate::{RegistryClient, RegistryConfig, RegistryError, VersionInfo};
use depkeep_schema::{Digest, Version};
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct PackageListing {
    versions: Vec<VersionInfo>,
}

/// HTTP registry client.
///
/// Expects a simple REST API:
/// - `GET /packages/<name>` returns `{"versions": [...]}`
/// - `GET /packages/<name>/<version>/<platform>/hash` returns `sha256:<hex>`
/// - `GET /packages/<name>/<version>/<platform>/artifact` returns the artifact bytes
///
/// Transport errors, 429 and 5xx responses are `Unavailable` and go through
/// the configured retry policy.
pub struct HttpRegistry {
    config: RegistryConfig,
    agent: ureq::Agent,
}

impl HttpRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs.max(1))))
            .build()
            .into();
        Self { config, agent }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn package_url(&self, name: &str) -> String {
        format!("{}/packages/{name}", self.config.url)
    }

    fn artifact_url(&self, name: &str, version: &Version, platform: &str, leaf: &str) -> String {
        format!("{}/packages/{name}/{version}/{platform}/{leaf}", self.config.url)
    }

    /// GET with retries. `Ok(None)` means the server answered 404.
    fn do_get(&self, url: &str) -> Result<Option<Vec<u8>>, RegistryError> {
        self.config.retry.run(url, || self.get_once(url))
    }

    fn get_once(&self, url: &str) -> Result<Option<Vec<u8>>, RegistryError> {
        tracing::debug!("GET {url}");
        let mut req = self
            .agent
            .get(url)
            .header("X-Depkeep-Protocol", &crate::PROTOCOL_VERSION.to_string());
        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = match req.call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(code)) => return classify_status(code, url),
            Err(e) => return Err(RegistryError::Unavailable(format!("{url}: {e}"))),
        };

        let code = resp.status().as_u16();
        if code >= 300 {
            return classify_status(code, url);
        }

        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| RegistryError::Unavailable(format!("{url}: {e}")))?;
        Ok(Some(body))
    }
}

fn classify_status(code: u16, url: &str) -> Result<Option<Vec<u8>>, RegistryError> {
    match code {
        404 => Ok(None),
        429 | 500..=599 => Err(RegistryError::Unavailable(format!("HTTP {code} for {url}"))),
        _ => Err(RegistryError::Protocol(format!("HTTP {code} for {url}"))),
    }
}

impl RegistryClient for HttpRegistry {
    fn name(&self) -> &str {
        &self.config.url
    }

    fn fetch_versions(&self, name: &str) -> Result<Vec<VersionInfo>, RegistryError> {
        let url = self.package_url(name);
        let body = self
            .do_get(&url)?
            .ok_or_else(|| RegistryError::PackageNotFound(name.to_owned()))?;
        let listing: PackageListing = serde_json::from_slice(&body)
            .map_err(|e| RegistryError::Protocol(format!("invalid version listing for '{name}': {e}")))?;
        let mut versions = listing.versions;
        if versions.is_empty() {
            return Err(RegistryError::PackageNotFound(name.to_owned()));
        }
        versions.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(versions)
    }

    fn fetch_artifact_hash(
        &self,
        name: &str,
        version: &Version,
        platform: &str,
    ) -> Result<Digest, RegistryError> {
        let url = self.artifact_url(name, version, platform, "hash");
        let body = self.do_get(&url)?.ok_or_else(|| RegistryError::ArtifactNotFound {
            name: name.to_owned(),
            version: version.to_string(),
            platform: platform.to_owned(),
        })?;
        let text = String::from_utf8(body)
            .map_err(|e| RegistryError::Protocol(format!("hash for {name}@{version}: {e}")))?;
        text.trim()
            .parse()
            .map_err(|e| RegistryError::Protocol(format!("hash for {name}@{version}: {e}")))
    }

    fn fetch_artifact(
        &self,
        name: &str,
        version: &Version,
        platform: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let url = self.artifact_url(name, version, platform, "artifact");
        self.do_get(&url)?.ok_or_else(|| RegistryError::ArtifactNotFound {
            name: name.to_owned(),
            version: version.to_string(),
            platform: platform.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetryPolicy;
    use depkeep_schema::HashAlgorithm;
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    /// A captured HTTP request for header inspection.
    #[derive(Debug, Clone)]
    struct CapturedRequest {
        path: String,
        headers: HashMap<String, String>,
    }

    #[derive(Default)]
    struct Routes {
        bodies: HashMap<String, Vec<u8>>,
        /// Remaining 503 responses to serve before answering normally.
        outages: HashMap<String, usize>,
    }

    struct MockServer {
        addr: String,
        _handle: std::thread::JoinHandle<()>,
        routes: Arc<Mutex<Routes>>,
        requests: Arc<Mutex<Vec<CapturedRequest>>>,
    }

    impl MockServer {
        fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = format!("http://{}", listener.local_addr().unwrap());
            let routes: Arc<Mutex<Routes>> = Arc::new(Mutex::new(Routes::default()));
            let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));

            let routes_clone = Arc::clone(&routes);
            let requests_clone = Arc::clone(&requests);
            let handle = std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let routes = Arc::clone(&routes_clone);
                    let reqs = Arc::clone(&requests_clone);

                    std::thread::spawn(move || {
                        let mut reader = BufReader::new(stream.try_clone().unwrap());
                        let mut request_line = String::new();
                        if reader.read_line(&mut request_line).is_err() {
                            return;
                        }
                        let parts: Vec<&str> = request_line.trim().splitn(3, ' ').collect();
                        if parts.len() < 2 {
                            return;
                        }
                        let path = parts[1].to_owned();

                        let mut headers = HashMap::new();
                        loop {
                            let mut line = String::new();
                            if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                                break;
                            }
                            if let Some((k, v)) = line.trim().split_once(": ") {
                                headers.insert(k.to_lowercase(), v.to_owned());
                            }
                        }

                        reqs.lock().unwrap().push(CapturedRequest {
                            path: path.clone(),
                            headers,
                        });

                        let mut routes = routes.lock().unwrap();
                        let in_outage = match routes.outages.get_mut(&path) {
                            Some(remaining) if *remaining > 0 => {
                                *remaining -= 1;
                                true
                            }
                            _ => false,
                        };
                        let (status, body) = if in_outage {
                            ("503 Service Unavailable", Vec::new())
                        } else if let Some(body) = routes.bodies.get(&path) {
                            ("200 OK", body.clone())
                        } else {
                            ("404 Not Found", Vec::new())
                        };
                        drop(routes);

                        let head = format!(
                            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        );
                        let _ = stream.write_all(head.as_bytes());
                        let _ = stream.write_all(&body);
                        let _ = stream.flush();
                    });
                }
            });

            MockServer {
                addr,
                _handle: handle,
                routes,
                requests,
            }
        }

        fn serve(&self, path: &str, body: &[u8]) {
            self.routes
                .lock()
                .unwrap()
                .bodies
                .insert(path.to_owned(), body.to_vec());
        }

        fn fail_times(&self, path: &str, times: usize) {
            self.routes
                .lock()
                .unwrap()
                .outages
                .insert(path.to_owned(), times);
        }

        fn captured_requests(&self) -> Vec<CapturedRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn hits(&self, path: &str) -> usize {
            self.captured_requests()
                .iter()
                .filter(|r| r.path == path)
                .count()
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier_percent: 200,
        }
    }

    fn test_registry(url: &str) -> HttpRegistry {
        HttpRegistry::new(RegistryConfig::new(url).with_retry(fast_retry()))
    }

    const LISTING: &str = r#"{"versions": [
        {"version": "1.4.0", "published_at": "2024-05-01T00:00:00Z"},
        {"version": "1.2.0", "published_at": "2023-01-01T00:00:00Z"},
        {"version": "1.2.9", "yanked": true}
    ]}"#;

    #[test]
    fn fetch_versions_sorts_ascending() {
        let server = MockServer::start();
        server.serve("/packages/libA", LISTING.as_bytes());
        let registry = test_registry(&server.addr);

        let versions = registry.fetch_versions("libA").unwrap();
        let listed: Vec<String> = versions.iter().map(|v| v.version.to_string()).collect();
        assert_eq!(listed, vec!["1.2.0", "1.2.9", "1.4.0"]);
        assert!(versions[1].yanked);
    }

    #[test]
    fn unknown_package_is_not_found() {
        let server = MockServer::start();
        let registry = test_registry(&server.addr);
        assert!(matches!(
            registry.fetch_versions("ghost"),
            Err(RegistryError::PackageNotFound(name)) if name == "ghost"
        ));
    }

    #[test]
    fn empty_listing_is_not_found() {
        let server = MockServer::start();
        server.serve("/packages/empty", br#"{"versions": []}"#);
        let registry = test_registry(&server.addr);
        assert!(matches!(
            registry.fetch_versions("empty"),
            Err(RegistryError::PackageNotFound(_))
        ));
    }

    #[test]
    fn malformed_listing_is_protocol_error() {
        let server = MockServer::start();
        server.serve("/packages/bad", b"not json");
        let registry = test_registry(&server.addr);
        assert!(matches!(
            registry.fetch_versions("bad"),
            Err(RegistryError::Protocol(_))
        ));
    }

    #[test]
    fn fetch_hash_and_artifact() {
        let server = MockServer::start();
        let digest = Digest::compute(HashAlgorithm::Sha256, b"wheel");
        server.serve(
            "/packages/libA/1.2.0/any/hash",
            format!("{digest}\n").as_bytes(),
        );
        server.serve("/packages/libA/1.2.0/any/artifact", b"wheel");
        let registry = test_registry(&server.addr);

        let version = Version::new(1, 2, 0);
        assert_eq!(
            registry.fetch_artifact_hash("libA", &version, "any").unwrap(),
            digest
        );
        assert_eq!(
            registry.fetch_artifact("libA", &version, "any").unwrap(),
            b"wheel"
        );
        assert!(matches!(
            registry.fetch_artifact("libA", &version, "macos-arm64"),
            Err(RegistryError::ArtifactNotFound { .. })
        ));
    }

    #[test]
    fn transient_503_is_retried() {
        let server = MockServer::start();
        server.serve("/packages/libA", LISTING.as_bytes());
        server.fail_times("/packages/libA", 2);
        let registry = test_registry(&server.addr);

        assert_eq!(registry.fetch_versions("libA").unwrap().len(), 3);
        assert_eq!(server.hits("/packages/libA"), 3);
    }

    #[test]
    fn persistent_outage_surfaces_unavailable() {
        let server = MockServer::start();
        server.serve("/packages/libA", LISTING.as_bytes());
        server.fail_times("/packages/libA", 10);
        let registry = test_registry(&server.addr);

        let err = registry.fetch_versions("libA").unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(server.hits("/packages/libA"), 3);
    }

    #[test]
    fn connection_refused_is_unavailable() {
        let registry = HttpRegistry::new(
            RegistryConfig::new("http://127.0.0.1:1").with_retry(RetryPolicy::none()),
        );
        assert!(matches!(
            registry.fetch_versions("libA"),
            Err(RegistryError::Unavailable(_))
        ));
    }

    #[test]
    fn requests_include_protocol_and_auth_headers() {
        let server = MockServer::start();
        server.serve("/packages/libA", LISTING.as_bytes());
        let registry = HttpRegistry::new(
            RegistryConfig::new(&server.addr)
                .with_token("secret-token-42")
                .with_retry(fast_retry()),
        );
        registry.fetch_versions("libA").unwrap();

        let reqs = server.captured_requests();
        assert!(!reqs.is_empty());
        assert_eq!(
            reqs[0].headers.get("x-depkeep-protocol"),
            Some(&"1".to_owned())
        );
        assert_eq!(
            reqs[0].headers.get("authorization"),
            Some(&"Bearer secret-token-42".to_owned())
        );
    }

    #[test]
    fn no_auth_header_without_token() {
        let server = MockServer::start();
        server.serve("/packages/libA", LISTING.as_bytes());
        let registry = test_registry(&server.addr);
        registry.fetch_versions("libA").unwrap();

        let reqs = server.captured_requests();
        assert!(!reqs.is_empty());
        assert!(!reqs[0].headers.contains_key("authorization"));
    }

    #[test]
    fn fetch_version_finds_exact_entry() {
        let server = MockServer::start();
        server.serve("/packages/libA", LISTING.as_bytes());
        let registry = test_registry(&server.addr);
        let info = registry
            .fetch_version("libA", &Version::new(1, 4, 0))
            .unwrap();
        assert!(info.published_at.is_some());
        assert!(matches!(
            registry.fetch_version("libA", &Version::new(9, 0, 0)),
            Err(RegistryError::VersionNotFound { .. })
        ));
    }
}
