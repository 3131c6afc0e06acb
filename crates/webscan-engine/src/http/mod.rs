//! Shared HTTP fabric
//!
//! One pooled client for every scanner in the process. All outbound
//! traffic funnels through [`HttpFabric::execute`], which applies, in
//! order: egress guardrails, request coalescing, the response cache,
//! per-host pacing, retries with backoff, and the response size cap,
//! while keeping the fabric counters current.
//!
//! Scanners never construct their own clients; uniform pacing and
//! guardrails depend on the single funnel.

pub mod cache;
pub mod coalesce;
pub mod guardrails;
pub mod metrics;
pub mod pacer;

pub use cache::{CacheLookup, CachedResponse, ResponseCache};
pub use guardrails::{is_blocked_ip, GuardedResolver, Guardrails};
pub use metrics::{HttpMetrics, HttpMetricsSnapshot};
pub use pacer::HostPacer;

use bytes::{Bytes, BytesMut};
use coalesce::{await_outcome, Flight, InflightMap};
use http::{HeaderMap, Method};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;
use webscan_core::retry::RetryConfig;
use webscan_core::{Error, HttpConfig, Result, ScanError, ScanErrorKind};

/// Per-request knobs. Most scanners use the defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Skip cache lookup and storage for this request
    pub bypass_cache: bool,
    /// Override the configured response size cap (None = configured)
    pub max_response_bytes: Option<u64>,
}

/// Response handed back to scanners.
#[derive(Debug, Clone)]
pub struct FabricResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Body reading stopped at the size cap
    pub truncated: bool,
    /// Served from the response cache (fresh hit or 304 revalidation)
    pub from_cache: bool,
}

impl FabricResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Taxonomy classification for callers that treat non-2xx as errors.
    pub fn error_kind(&self) -> Option<ScanErrorKind> {
        match self.status {
            200..=399 => None,
            429 => Some(ScanErrorKind::RateLimited),
            400..=499 => Some(ScanErrorKind::Status4xx),
            _ => Some(ScanErrorKind::Status5xx),
        }
    }

    fn from_cached(entry: CachedResponse) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers.clone(),
            body: entry.body.clone(),
            truncated: entry.truncated,
            from_cache: true,
        }
    }
}

type Outcome = std::result::Result<FabricResponse, ScanError>;

/// Process-wide HTTP client with pacing, caching, and guardrails.
pub struct HttpFabric {
    client: reqwest::Client,
    config: HttpConfig,
    guardrails: Guardrails,
    pacer: HostPacer,
    cache: ResponseCache,
    inflight: InflightMap<Outcome>,
    metrics: Arc<HttpMetrics>,
}

impl HttpFabric {
    /// Build the fabric and its underlying pooled client.
    pub fn new(config: HttpConfig) -> Result<Self> {
        let metrics = Arc::new(HttpMetrics::new());
        let guardrails = Guardrails::new(&config);

        let redirect_rails = guardrails.clone();
        let redirect_policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= 5 {
                return attempt.error("too many redirects");
            }
            // Each hop is re-vetted; a redirect into a blocked host or a
            // literal private address stops here.
            match redirect_rails.check_url(attempt.url()) {
                Ok(()) => attempt.follow(),
                Err(e) => attempt.error(e.to_string()),
            }
        });

        let resolver = Arc::new(GuardedResolver::new(
            guardrails.clone(),
            Arc::clone(&metrics),
        ));

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .redirect(redirect_policy)
            .dns_resolver(resolver)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            pacer: HostPacer::new(config.clone(), Arc::clone(&metrics)),
            cache: ResponseCache::new(Duration::from_secs(config.cache_ttl_seconds)),
            inflight: InflightMap::new(),
            guardrails,
            metrics,
            config,
        })
    }

    /// Counter handle, shared with the engine's `Metrics()` surface.
    pub fn metrics(&self) -> Arc<HttpMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Convenience GET with default options.
    pub async fn get(&self, cancel: &CancellationToken, url: &str) -> Outcome {
        self.execute(
            cancel,
            Method::GET,
            url,
            HeaderMap::new(),
            None,
            RequestOptions::default(),
        )
        .await
    }

    /// Issue a request through the full policy pipeline.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
        options: RequestOptions,
    ) -> Outcome {
        let url = Url::parse(url)
            .map_err(|e| ScanError::new(ScanErrorKind::Transport, format!("invalid URL: {}", e)))?;

        if let Err(e) = self.guardrails.check_url(&url) {
            HttpMetrics::inc(&self.metrics.egress_blocks);
            return Err(e);
        }

        let coalescable = (method == Method::GET || method == Method::HEAD)
            && body.is_none()
            && !options.bypass_cache;
        let cache_key = format!("{} {}", method, url);

        if coalescable {
            if let CacheLookup::Fresh(entry) = self.cache.lookup(&cache_key) {
                HttpMetrics::inc(&self.metrics.cache_hits);
                return Ok(FabricResponse::from_cached(entry));
            }
        }

        if !coalescable {
            return self
                .perform(cancel, &method, &url, &headers, &body, &options, &cache_key, false)
                .await;
        }

        let flight_key = flight_key(&method, &url, &headers);
        loop {
            match self.inflight.join(&flight_key) {
                Flight::Leader(guard) => {
                    let outcome = self
                        .perform(cancel, &method, &url, &headers, &body, &options, &cache_key, true)
                        .await;
                    guard.complete(outcome.clone());
                    return outcome;
                }
                Flight::Follower(rx) => match await_outcome(rx).await {
                    Some(outcome) => {
                        HttpMetrics::inc(&self.metrics.coalesced_requests);
                        return outcome;
                    }
                    // Leader cancelled before publishing; take over.
                    None => continue,
                },
            }
        }
    }

    /// Shut the fabric down: drop cached responses. The connection pool
    /// closes when the last clone of the client is dropped.
    pub fn shutdown(&self) {
        self.cache.clear();
    }

    #[allow(clippy::too_many_arguments)]
    async fn perform(
        &self,
        cancel: &CancellationToken,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: &Option<Bytes>,
        options: &RequestOptions,
        cache_key: &str,
        cacheable: bool,
    ) -> Outcome {
        let host = url
            .host_str()
            .ok_or_else(|| ScanError::egress_blocked("URL has no host"))?
            .to_string();
        let retry = RetryConfig::from_http(
            self.config.max_retries,
            self.config.backoff_base_seconds,
            self.config.backoff_max_seconds,
        );
        let cap = options
            .max_response_bytes
            .unwrap_or(self.config.max_response_bytes);

        let mut validators = if cacheable {
            match self.cache.lookup(cache_key) {
                CacheLookup::Stale {
                    etag,
                    last_modified,
                } => Some((etag, last_modified)),
                _ => None,
            }
        } else {
            None
        };

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ScanError::cancelled());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ScanError::cancelled()),
                _ = self.pacer.acquire(&host) => {}
            }

            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .headers(headers.clone());
            if let Some((etag, last_modified)) = &validators {
                if let Some(etag) = etag {
                    request = request.header(http::header::IF_NONE_MATCH, etag.as_str());
                }
                if let Some(last_modified) = last_modified {
                    request =
                        request.header(http::header::IF_MODIFIED_SINCE, last_modified.as_str());
                }
            }
            if let Some(body) = body {
                request = request.body(body.clone());
            }

            HttpMetrics::inc(&self.metrics.requests_sent);
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(ScanError::cancelled()),
                r = request.send() => r,
            };

            match response {
                Err(e) => {
                    if attempt < retry.max_attempts - 1 {
                        HttpMetrics::inc(&self.metrics.retries);
                        self.backoff(cancel, &retry, attempt).await?;
                        attempt += 1;
                        continue;
                    }
                    return Err(classify_reqwest_error(&e));
                }
                Ok(response) => {
                    let status = response.status();

                    if status == http::StatusCode::NOT_MODIFIED && validators.is_some() {
                        if let Some(entry) = self.cache.refresh(cache_key) {
                            HttpMetrics::inc(&self.metrics.cache_hits);
                            self.pacer.on_success(&host).await;
                            return Ok(FabricResponse::from_cached(entry));
                        }
                        // Entry evicted under us: refetch unconditionally
                        validators = None;
                        continue;
                    }

                    if status == http::StatusCode::TOO_MANY_REQUESTS
                        || status == http::StatusCode::SERVICE_UNAVAILABLE
                    {
                        let retry_after = parse_retry_after(response.headers());
                        if status == http::StatusCode::TOO_MANY_REQUESTS {
                            HttpMetrics::inc(&self.metrics.rate_limited);
                        }
                        self.pacer.on_throttled(&host, retry_after).await;

                        if attempt < retry.max_attempts - 1 {
                            HttpMetrics::inc(&self.metrics.retries);
                            // Retry-After is honored by the paused host
                            // bucket; the next acquire() waits it out.
                            self.backoff(cancel, &retry, attempt).await?;
                            attempt += 1;
                            continue;
                        }
                        let kind = if status == http::StatusCode::TOO_MANY_REQUESTS {
                            ScanErrorKind::RateLimited
                        } else {
                            ScanErrorKind::Status5xx
                        };
                        return Err(ScanError::new(
                            kind,
                            format!("{} from {} after {} attempts", status, host, attempt + 1),
                        ));
                    }

                    let transient_5xx = status.is_server_error()
                        && status != http::StatusCode::NOT_IMPLEMENTED
                        && status != http::StatusCode::HTTP_VERSION_NOT_SUPPORTED;
                    if transient_5xx && attempt < retry.max_attempts - 1 {
                        HttpMetrics::inc(&self.metrics.retries);
                        self.backoff(cancel, &retry, attempt).await?;
                        attempt += 1;
                        continue;
                    }

                    let response_headers = response.headers().clone();
                    let (bytes, truncated, dropped) = match read_capped(response, cap).await {
                        Ok(read) => read,
                        Err(e) => {
                            if attempt < retry.max_attempts - 1 {
                                HttpMetrics::inc(&self.metrics.retries);
                                self.backoff(cancel, &retry, attempt).await?;
                                attempt += 1;
                                continue;
                            }
                            return Err(classify_reqwest_error(&e));
                        }
                    };

                    if truncated {
                        HttpMetrics::add(&self.metrics.bytes_truncated, dropped.max(1));
                    }
                    if !status.is_server_error() {
                        self.pacer.on_success(&host).await;
                    }

                    if cacheable {
                        self.cache.store(
                            cache_key,
                            status.as_u16(),
                            &response_headers,
                            bytes.clone(),
                            truncated,
                        );
                    }

                    return Ok(FabricResponse {
                        status: status.as_u16(),
                        headers: response_headers,
                        body: bytes,
                        truncated,
                        from_cache: false,
                    });
                }
            }
        }
    }

    async fn backoff(
        &self,
        cancel: &CancellationToken,
        retry: &RetryConfig,
        attempt: u32,
    ) -> std::result::Result<(), ScanError> {
        let wait = retry.backoff_delay(attempt);
        tokio::select! {
            _ = cancel.cancelled() => Err(ScanError::cancelled()),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}

/// Coalescing identity: method, URL, and request headers that vary the
/// response.
fn flight_key(method: &Method, url: &Url, headers: &HeaderMap) -> String {
    let mut parts: Vec<String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| format!("{}={}", name.as_str().to_ascii_lowercase(), v))
        })
        .collect();
    parts.sort();
    format!("{} {} [{}]", method, url, parts.join(";"))
}

fn classify_reqwest_error(e: &reqwest::Error) -> ScanError {
    if e.is_timeout() {
        ScanError::new(ScanErrorKind::Timeout, format!("request timed out: {}", e))
    } else if error_chain_contains(e, "egress_blocked") {
        // Raised by the guarded resolver at connect time
        ScanError::egress_blocked(e.to_string())
    } else {
        ScanError::transport(e.to_string())
    }
}

/// Walk an error's source chain looking for a marker string.
fn error_chain_contains(e: &(dyn std::error::Error + 'static), needle: &str) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(e);
    while let Some(err) = current {
        if err.to_string().contains(needle) {
            return true;
        }
        current = err.source();
    }
    false
}

/// Parse `Retry-After` as delta-seconds or an HTTP date.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}

/// Read a body up to `cap` bytes. Returns (body, truncated, dropped),
/// where `dropped` counts received bytes discarded past the cap.
async fn read_capped(
    mut response: reqwest::Response,
    cap: u64,
) -> std::result::Result<(Bytes, bool, u64), reqwest::Error> {
    if cap == 0 {
        let bytes = response.bytes().await?;
        return Ok((bytes, false, 0));
    }

    let mut buf = BytesMut::new();
    let mut truncated = false;
    let mut dropped: u64 = 0;

    while let Some(chunk) = response.chunk().await? {
        let remaining = cap as usize - buf.len();
        if chunk.len() > remaining {
            buf.extend_from_slice(&chunk[..remaining]);
            dropped = (chunk.len() - remaining) as u64;
            truncated = true;
            break;
        }
        buf.extend_from_slice(&chunk);
    }

    Ok((buf.freeze(), truncated, dropped))
}
