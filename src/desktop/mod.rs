//! Remote desktop backend: lifecycle, readiness and HTTP reverse proxy.
//!
//! The desktop runs in a container next to the gateway and is only reachable
//! with Basic credentials read from the secret store. [`DesktopProxy`] keeps a
//! `last_known_ready` flag so the hot path (every proxied request) does not
//! poll the backend; the flag is cleared whenever an upstream connection fails.

pub mod rewrite;
pub mod tunnel;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use base64::Engine;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    tungstenite::client::IntoClientRequest, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::auth::KEY_COOKIE;
use crate::config::DesktopConfig;
use crate::error::GatewayError;
use crate::secrets::SecretStore;

/// Backend WebSocket as returned by [`DesktopProxy::open_tunnel`].
pub type BackendSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Headers that describe one hop's framing and never cross the proxy.
static HOP_HEADERS: [HeaderName; 4] = [
    header::CONTENT_ENCODING,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// Client headers that are replaced (credentials) or would break rewriting
/// (compressed bodies).
static REQUEST_ONLY_HEADERS: [HeaderName; 3] =
    [header::HOST, header::AUTHORIZATION, header::ACCEPT_ENCODING];

/// Per-request timeout of a readiness check.
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// A fully buffered upstream response.
#[derive(Debug)]
pub struct ProxiedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for ProxiedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Cloneable handle to the desktop backend; clones share the readiness flag.
#[derive(Clone)]
pub struct DesktopProxy {
    config: Arc<DesktopConfig>,
    secrets: SecretStore,
    http: reqwest::Client,
    ready: Arc<AtomicBool>,
    /// Serializes readiness checks so a burst of requests polls once.
    ensure_lock: Arc<Mutex<()>>,
}

impl DesktopProxy {
    pub fn new(config: &DesktopConfig, secrets: SecretStore) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GatewayError::BackendUnavailable(format!("HTTP client: {e}")))?;
        Ok(Self {
            config: Arc::new(config.clone()),
            secrets,
            http,
            ready: Arc::new(AtomicBool::new(false)),
            ensure_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Mount path without a trailing slash.
    pub fn mount(&self) -> &str {
        self.config.mount()
    }

    fn docker(&self) -> Command {
        command_from(&self.config.docker_command)
    }

    /// `docker ps` check for the desktop container.
    pub async fn is_running(&self) -> bool {
        let filter = format!("name={}", self.config.container);
        let output = self
            .docker()
            .args(["ps", "--filter", &filter, "--format", "{{.Names}}"])
            .output()
            .await;
        match output {
            Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout)
                .lines()
                .any(|l| l.trim() == self.config.container),
            Ok(o) => {
                debug!("docker ps exited with {}", o.status);
                false
            }
            Err(e) => {
                warn!("docker ps failed: {e}");
                false
            }
        }
    }

    /// Bring the compose service up. Failures are logged; readiness polling
    /// decides whether the backend actually came up.
    pub async fn start(&self) {
        info!("Starting desktop service {}", self.config.compose_service);
        let output = command_from(&self.config.compose_command)
            .args(["up", "-d", &self.config.compose_service])
            .current_dir(&self.config.compose_dir)
            .output()
            .await;
        match output {
            Ok(o) if o.status.success() => {}
            Ok(o) => warn!(
                "compose up exited with {}: {}",
                o.status,
                String::from_utf8_lossy(&o.stderr).trim()
            ),
            Err(e) => warn!("compose up failed: {e}"),
        }
    }

    /// Start the backend if needed and poll it with the configured budget.
    pub async fn ensure_ready(&self) -> bool {
        self.ensure_ready_with(self.config.ready_attempts, self.config.ready_interval())
            .await
    }

    /// Start the backend if needed, then poll the status path until it answers
    /// with anything but a 5xx. Makes at most `attempts` requests.
    pub async fn ensure_ready_with(&self, attempts: u32, interval: Duration) -> bool {
        let _guard = self.ensure_lock.lock().await;
        self.poll_ready(attempts, interval).await
    }

    /// Cached readiness, falling back to a full [`ensure_ready`](Self::ensure_ready).
    pub async fn ready_for_forwarding(&self) -> bool {
        if self.is_ready() {
            return true;
        }
        let _guard = self.ensure_lock.lock().await;
        // Another request may have finished polling while this one waited.
        if self.is_ready() {
            return true;
        }
        self.poll_ready(self.config.ready_attempts, self.config.ready_interval())
            .await
    }

    async fn poll_ready(&self, attempts: u32, interval: Duration) -> bool {
        if !self.is_running().await {
            self.start().await;
        }

        let url = self.backend_url(&self.config.status_path, None);
        let password = self.secrets.desktop_credential().await;
        for attempt in 1..=attempts {
            let check = self
                .http
                .get(&url)
                .basic_auth(&self.config.user, password.as_deref())
                .timeout(CHECK_TIMEOUT)
                .send()
                .await;
            match check {
                Ok(resp) if !resp.status().is_server_error() => {
                    if !self.ready.swap(true, Ordering::Relaxed) {
                        info!("Desktop ready after {attempt} attempt(s)");
                    }
                    return true;
                }
                Ok(resp) => debug!("Desktop readiness check {attempt}/{attempts}: {}", resp.status()),
                Err(e) => debug!("Desktop readiness check {attempt}/{attempts}: {e}"),
            }
            tokio::time::sleep(interval).await;
        }

        if self.ready.swap(false, Ordering::Relaxed) {
            warn!("Desktop no longer ready");
        }
        warn!("Desktop not ready after {attempts} attempt(s)");
        false
    }

    /// `docker restart`, a fixed grace period, then [`ensure_ready`](Self::ensure_ready).
    pub async fn restart(&self) -> Result<(), GatewayError> {
        info!("Restarting desktop container {}", self.config.container);
        self.ready.store(false, Ordering::Relaxed);
        let output = self
            .docker()
            .args(["restart", &self.config.container])
            .output()
            .await
            .map_err(|e| GatewayError::BackendUnavailable(format!("docker restart: {e}")))?;
        if !output.status.success() {
            return Err(GatewayError::BackendUnavailable(format!(
                "docker restart exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tokio::time::sleep(self.config.restart_grace()).await;
        if self.ensure_ready().await {
            Ok(())
        } else {
            Err(GatewayError::BackendUnavailable(
                "desktop did not become ready after restart".to_string(),
            ))
        }
    }

    /// Forward one request to the backend and buffer the answer.
    ///
    /// `path` is relative to the mount (leading slash optional). Redirects are
    /// handed back to the client untouched.
    pub async fn forward_http(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<ProxiedResponse, GatewayError> {
        let password = self.secrets.desktop_credential().await.ok_or_else(|| {
            GatewayError::BackendUnavailable("desktop credential missing".to_string())
        })?;
        let url = self.backend_url(path, query);

        let upstream = self
            .http
            .request(method, &url)
            .headers(request_headers(headers))
            .basic_auth(&self.config.user, Some(password))
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() && self.ready.swap(false, Ordering::Relaxed) {
                    warn!("Desktop connection failed, marking not ready");
                }
                GatewayError::ProxyUpstreamError(e.to_string())
            })?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        for name in &HOP_HEADERS {
            response_headers.remove(name);
        }
        let rewritable = response_headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(rewrite::is_rewritable);

        let body = upstream
            .bytes()
            .await
            .map_err(|e| GatewayError::ProxyUpstreamError(e.to_string()))?;
        let body = if rewritable {
            let text = String::from_utf8_lossy(&body);
            Bytes::from(rewrite::rewrite_body(&text, self.mount()))
        } else {
            body
        };

        Ok(ProxiedResponse {
            status,
            headers: response_headers,
            body,
        })
    }

    /// Open a WebSocket to `path` on the backend with fresh credentials.
    pub async fn open_tunnel(&self, path: &str) -> Result<BackendSocket, GatewayError> {
        let password = self.secrets.desktop_credential().await.ok_or_else(|| {
            GatewayError::BackendUnavailable("desktop credential missing".to_string())
        })?;
        let url = websocket_url(&self.backend_url(path, None));

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::BackendUnavailable(format!("bad tunnel URL: {e}")))?;
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, basic_auth(&self.config.user, &password)?);

        let connector = if self.config.accept_invalid_certs {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| GatewayError::BackendUnavailable(format!("TLS: {e}")))?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let (socket, _response) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await
                .map_err(|e| {
                    self.ready.store(false, Ordering::Relaxed);
                    GatewayError::BackendUnavailable(format!("tunnel to {path}: {e}"))
                })?;
        info!("Desktop tunnel opened to {path}");
        Ok(socket)
    }

    fn backend_url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = format!(
            "{}/{}",
            self.config.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(q);
        }
        url
    }
}

fn command_from(argv: &[String]) -> Command {
    let (program, prefix) = argv
        .split_first()
        .map_or(("docker", &[][..]), |(p, rest)| (p.as_str(), rest));
    let mut cmd = Command::new(program);
    cmd.args(prefix)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    cmd
}

/// Client headers minus hop-by-hop and replaced ones. The gateway's own key
/// cookie is dropped so the backend never sees it.
fn request_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = incoming.clone();
    for name in HOP_HEADERS.iter().chain(REQUEST_ONLY_HEADERS.iter()) {
        headers.remove(name);
    }
    let cookies: Vec<String> = incoming
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .map(str::trim)
        .filter(|pair| !pair.is_empty() && pair.split('=').next() != Some(KEY_COOKIE))
        .map(ToString::to_string)
        .collect();
    headers.remove(header::COOKIE);
    if !cookies.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&cookies.join("; ")) {
            headers.insert(header::COOKIE, value);
        }
    }
    headers
}

fn basic_auth(user: &str, password: &str) -> Result<HeaderValue, GatewayError> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
    HeaderValue::from_str(&format!("Basic {encoded}"))
        .map_err(|_| GatewayError::BackendUnavailable("invalid desktop credential".to_string()))
}

fn websocket_url(http_url: &str) -> String {
    if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_url.to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use std::sync::atomic::AtomicU32;

    pub(crate) struct Backend {
        pub url: String,
        pub hits: Arc<AtomicU32>,
    }

    /// Local stand-in for the desktop: `/` answers 503 until `healthy_after`
    /// checks have been made, `/page` serves HTML, `/echo-headers` reflects the
    /// request headers, `/redirect` answers 302.
    pub(crate) async fn spawn_backend(healthy_after: u32) -> Backend {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new()
            .route(
                "/",
                get(move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        if n >= healthy_after {
                            StatusCode::OK
                        } else {
                            StatusCode::SERVICE_UNAVAILABLE
                        }
                    }
                }),
            )
            .route(
                "/page",
                get(|| async {
                    (
                        [(header::CONTENT_TYPE, "text/html")],
                        r#"<img src="/logo.png"><script>new WebSocket("wss://" + host)</script>"#,
                    )
                }),
            )
            .route(
                "/logo.png",
                get(|| async { ([(header::CONTENT_TYPE, "image/png")], "=\"/raw") }),
            )
            .route(
                "/echo-headers",
                get(|headers: HeaderMap| async move {
                    let mut lines: Vec<String> = headers
                        .iter()
                        .map(|(k, v)| format!("{k}: {}", v.to_str().unwrap_or("")))
                        .collect();
                    lines.sort();
                    lines.join("\n")
                }),
            )
            .route(
                "/redirect",
                get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/elsewhere")]) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Backend {
            url: format!("http://{addr}"),
            hits,
        }
    }

    pub(crate) fn proxy_for(url: &str, dir: &tempfile::TempDir) -> DesktopProxy {
        std::fs::write(dir.path().join("desk"), "s3cret\n").unwrap();
        let secrets = SecretStore::new(&crate::config::SecretsConfig {
            api_key_file: dir.path().join("api_key").display().to_string(),
            desktop_credential_file: dir.path().join("desk").display().to_string(),
        });
        let config = DesktopConfig {
            url: url.to_string(),
            container: "desk".to_string(),
            compose_dir: dir.path().display().to_string(),
            // Prints the container name whatever the arguments, so the `docker ps`
            // readiness check and `restart` both succeed.
            docker_command: vec!["/bin/sh".into(), "-c".into(), "echo desk".into()],
            compose_command: vec!["true".to_string()],
            ready_interval_ms: 10,
            restart_grace_ms: 10,
            ..DesktopConfig::default()
        };
        DesktopProxy::new(&config, secrets).unwrap()
    }

    #[tokio::test]
    async fn test_ensure_ready_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let backend = spawn_backend(3).await;
        let proxy = proxy_for(&backend.url, &dir);
        assert!(!proxy.is_ready());
        assert!(proxy.ensure_ready_with(5, Duration::from_millis(10)).await);
        assert!(proxy.is_ready());
        assert_eq!(backend.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_ensure_ready_exhausts_budget() {
        let dir = tempfile::tempdir().unwrap();
        let backend = spawn_backend(100).await;
        let proxy = proxy_for(&backend.url, &dir);
        let interval = Duration::from_millis(40);
        let started = std::time::Instant::now();
        assert!(!proxy.ensure_ready_with(4, interval).await);
        let elapsed = started.elapsed();
        assert_eq!(backend.hits.load(Ordering::SeqCst), 4);
        assert!(!proxy.is_ready());
        // One interval after each failed check, and nothing like a retry storm.
        assert!(elapsed >= interval * 4, "gave up after {elapsed:?}");
        assert!(elapsed < interval * 4 + Duration::from_secs(3), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_ensure_ready_unreachable_backend() {
        let dir = tempfile::tempdir().unwrap();
        // Bind and drop to get a port nothing listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let proxy = proxy_for(&format!("http://127.0.0.1:{port}"), &dir);
        assert!(!proxy.ensure_ready_with(2, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_is_running_matches_container_name() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = proxy_for("http://127.0.0.1:1", &dir);
        assert!(proxy.is_running().await);

        // `echo ps --filter name=desk ...` mentions the name but is not a match.
        let mut config = (*proxy.config).clone();
        config.docker_command = vec!["echo".into()];
        let proxy = DesktopProxy::new(&config, proxy.secrets.clone()).unwrap();
        assert!(!proxy.is_running().await);
    }

    #[tokio::test]
    async fn test_forward_rewrites_html_only() {
        let dir = tempfile::tempdir().unwrap();
        let backend = spawn_backend(1).await;
        let proxy = proxy_for(&backend.url, &dir);

        let page = proxy
            .forward_http(Method::GET, "/page", None, &HeaderMap::new(), Bytes::new())
            .await
            .unwrap();
        assert_eq!(page.status, StatusCode::OK);
        let text = String::from_utf8(page.body.to_vec()).unwrap();
        assert!(text.contains(r#"src="/proxy/logo.png""#));
        assert!(text.contains(r#"window.location.host + "/proxy/" + host"#));
        assert!(page.headers.get(header::CONTENT_LENGTH).is_none());

        let image = proxy
            .forward_http(Method::GET, "logo.png", None, &HeaderMap::new(), Bytes::new())
            .await
            .unwrap();
        assert_eq!(&image.body[..], b"=\"/raw");
    }

    #[tokio::test]
    async fn test_forward_injects_credentials_and_strips_headers() {
        let dir = tempfile::tempdir().unwrap();
        let backend = spawn_backend(1).await;
        let proxy = proxy_for(&backend.url, &dir);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer client-key"));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("termgate_key=client-key; session=abc"),
        );
        headers.insert("x-custom", HeaderValue::from_static("kept"));

        let resp = proxy
            .forward_http(Method::GET, "/echo-headers", None, &headers, Bytes::new())
            .await
            .unwrap();
        let seen = String::from_utf8(resp.body.to_vec()).unwrap();
        let expected = format!(
            "authorization: Basic {}",
            base64::engine::general_purpose::STANDARD.encode("kasm_user:s3cret")
        );
        assert!(seen.contains(&expected), "{seen}");
        assert!(!seen.contains("client-key"));
        assert!(!seen.contains("gzip"));
        assert!(seen.contains("cookie: session=abc"));
        assert!(seen.contains("x-custom: kept"));
    }

    #[tokio::test]
    async fn test_forward_does_not_follow_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let backend = spawn_backend(1).await;
        let proxy = proxy_for(&backend.url, &dir);
        let resp = proxy
            .forward_http(Method::GET, "/redirect", None, &HeaderMap::new(), Bytes::new())
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::FOUND);
        assert_eq!(resp.headers.get(header::LOCATION).unwrap(), "/elsewhere");
    }

    #[tokio::test]
    async fn test_forward_without_credential() {
        let dir = tempfile::tempdir().unwrap();
        let backend = spawn_backend(1).await;
        let proxy = proxy_for(&backend.url, &dir);
        std::fs::remove_file(dir.path().join("desk")).unwrap();
        let result = proxy
            .forward_http(Method::GET, "/page", None, &HeaderMap::new(), Bytes::new())
            .await;
        assert!(matches!(result, Err(GatewayError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_restart_runs_docker_then_polls() {
        let dir = tempfile::tempdir().unwrap();
        let backend = spawn_backend(1).await;
        let proxy = proxy_for(&backend.url, &dir);
        proxy.restart().await.unwrap();
        assert!(proxy.is_ready());

        let mut config = (*proxy.config).clone();
        config.docker_command = vec!["false".into()];
        let failing = DesktopProxy::new(&config, proxy.secrets.clone()).unwrap();
        assert!(matches!(
            failing.restart().await,
            Err(GatewayError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn test_websocket_url_scheme() {
        assert_eq!(websocket_url("https://h:6901/websockify"), "wss://h:6901/websockify");
        assert_eq!(websocket_url("http://h/ws"), "ws://h/ws");
    }
}
