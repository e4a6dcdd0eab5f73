//! Requests against registry replicas with round-robin failover

use async_trait::async_trait;
use registry_api::{Application, ApplicationEnvelope, Applications, ApplicationsEnvelope};
use registry_core::{HeartbeatError, InstanceRecord, InstanceStatus, RegistryError, Result, TransportError};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::metrics::RegistryMetrics;

/// One request as handed to an [`HttpBackend`]
#[derive(Clone, Debug, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

/// Status and raw body of a replica's answer
#[derive(Clone, Debug, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self { status, body: Vec::new() }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends a single HTTP request to a single replica
///
/// Implementations report connectivity problems as `Err` and return every
/// answered request, whatever its status, as `Ok`.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn send(&self, request: HttpRequest, timeout: Duration) -> std::result::Result<HttpResponse, TransportError>;
}

/// [`HttpBackend`] on a pooled reqwest client
#[derive(Clone, Debug, Default)]
pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn send(&self, request: HttpRequest, timeout: Duration) -> std::result::Result<HttpResponse, TransportError> {
        let url = request.url;
        let mut builder = self
            .client
            .request(request.method, &url)
            .timeout(timeout)
            .header(ACCEPT, "application/json");

        if let Some(body) = &request.body {
            builder = builder.header(CONTENT_TYPE, "application/json").json(body);
        }

        let map_err = |e: reqwest::Error, url: &str| {
            if e.is_timeout() {
                TransportError::Timeout { url: url.to_string() }
            } else {
                TransportError::Connect {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        };

        let response = builder.send().await.map_err(|e| map_err(e, &url))?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| map_err(e, &url))?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Ordered registry replica base URLs with a rotating cursor
///
/// The cursor always indexes a valid replica and moves forward, wrapping,
/// after a transport failure against the current one.
#[derive(Debug)]
pub struct RegistryEndpointSet {
    urls: Vec<String>,
    cursor: AtomicUsize,
}

impl RegistryEndpointSet {
    pub fn new<I, S>(urls: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let urls: Vec<String> = urls
            .into_iter()
            .map(Into::into)
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .collect();

        if urls.is_empty() {
            return Err(RegistryError::Config(
                "at least one registry URL is required".to_string(),
            ));
        }

        for url in &urls {
            validate_registry_url(url);
        }

        Ok(Self {
            urls,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Index of the preferred replica
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::SeqCst) % self.urls.len()
    }

    /// Preferred replica and its index
    pub fn current(&self) -> (usize, &str) {
        let index = self.cursor();
        (index, &self.urls[index])
    }

    /// Move past replica `observed`.
    ///
    /// A no-op when another caller already rotated away from it, so two
    /// concurrent failures against the same replica advance once.
    pub fn advance_from(&self, observed: usize) {
        let next = (observed + 1) % self.urls.len();
        let _ = self
            .cursor
            .compare_exchange(observed, next, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// Warn about replica URLs that commonly cause connection failures
fn validate_registry_url(url: &str) {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        warn!(
            "Registry URL '{}' does not start with http:// or https://; this may cause connection failures",
            url
        );
    }

    if !url.ends_with("/eureka") {
        warn!(
            "Registry URL '{}' does not end with '/eureka'; expected format: http://host:port/eureka/",
            url
        );
    }

    if url.contains("localhost") || url.contains("127.0.0.1") {
        warn!(
            "Registry URL '{}' uses localhost; this will not work from inside containers",
            url
        );
    }
}

/// Registry resource below a replica's base URL
///
/// Segments are percent-encoded when joined onto the base, so ids holding
/// `/`, `?` or spaces stay within their own segment.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourcePath {
    segments: Vec<String>,
    query: Option<(&'static str, String)>,
}

impl ResourcePath {
    /// `/apps`
    pub fn apps() -> Self {
        Self {
            segments: vec!["apps".to_string()],
            query: None,
        }
    }

    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn query(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.query = Some((key, value.into()));
        self
    }

    /// Full request URL against replica `base`
    pub fn url_for(&self, base: &str) -> std::result::Result<String, TransportError> {
        let invalid = |message: String| TransportError::Connect {
            url: base.to_string(),
            message,
        };

        let mut url = Url::parse(base).map_err(|e| invalid(format!("invalid registry URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| invalid("registry URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(&self.segments);

        if let Some((key, value)) = &self.query {
            url.query_pairs_mut().append_pair(key, value);
        }
        Ok(url.to_string())
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        if let Some((key, value)) = &self.query {
            write!(f, "?{}={}", key, value)?;
        }
        Ok(())
    }
}

/// Thin client over the registry replicas' REST surface
pub struct RegistryTransport {
    endpoints: RegistryEndpointSet,
    backend: Arc<dyn HttpBackend>,
    timeout: Duration,
    metrics: Option<RegistryMetrics>,
}

impl RegistryTransport {
    /// Create a transport backed by reqwest
    pub fn new<I, S>(urls: I, timeout: Duration) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_backend(urls, timeout, Arc::new(ReqwestBackend::new()))
    }

    pub fn with_backend<I, S>(urls: I, timeout: Duration, backend: Arc<dyn HttpBackend>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints = RegistryEndpointSet::new(urls)?;
        info!("Configured registry replica(s): {}", endpoints.urls().join(", "));

        Ok(Self {
            endpoints,
            backend,
            timeout,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: RegistryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn endpoints(&self) -> &RegistryEndpointSet {
        &self.endpoints
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn metrics(&self) -> Option<&RegistryMetrics> {
        self.metrics.as_ref()
    }

    /// Issue `method path` against the replicas, starting at the cursor.
    ///
    /// A 2xx answer returns immediately. A 404 is returned as
    /// [`TransportError::NotFound`] without trying other replicas. Any other
    /// failure rotates to the next replica, for at most one pass; the last
    /// error is returned when every replica failed.
    pub async fn request(
        &self,
        method: Method,
        path: &ResourcePath,
        body: Option<&Value>,
    ) -> std::result::Result<HttpResponse, TransportError> {
        let mut last_error = None;

        for _ in 0..self.endpoints.len() {
            let (index, base) = self.endpoints.current();

            let sent = match path.url_for(base) {
                Ok(url) => {
                    debug!("Registry {} request to {}", method, url);
                    let request = HttpRequest {
                        method: method.clone(),
                        url: url.clone(),
                        body: body.cloned(),
                    };
                    self.backend.send(request, self.timeout).await.map(|response| (url, response))
                }
                Err(e) => Err(e),
            };

            let error = match sent {
                Ok((_, response)) if response.is_success() => return Ok(response),
                Ok((url, response)) if response.status == 404 => {
                    debug!("Registry answered 404 for {}", url);
                    return Err(TransportError::NotFound { url });
                }
                Ok((url, response)) => {
                    warn!("Registry request to {} returned status {}", url, response.status);
                    TransportError::Status {
                        url,
                        status: response.status,
                    }
                }
                Err(e) => {
                    warn!("Registry request to {} failed: {}", base, e);
                    e
                }
            };

            if let Some(metrics) = &self.metrics {
                metrics.failovers_total.inc();
            }
            self.endpoints.advance_from(index);
            last_error = Some(error);
        }

        Err(last_error.unwrap_or(TransportError::NoEndpoints))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &ResourcePath) -> std::result::Result<T, TransportError> {
        let response = self.request(Method::GET, path, None).await?;
        serde_json::from_slice(&response.body).map_err(|e| TransportError::Decode {
            url: path.to_string(),
            message: e.to_string(),
        })
    }

    /// `POST /apps/{appName}`
    pub async fn register(&self, instance: &InstanceRecord) -> Result<()> {
        let path = ResourcePath::apps().segment(instance.app_name.as_str());
        let payload = instance.to_json()?;

        self.request(Method::POST, &path, Some(&payload))
            .await
            .map_err(RegistryError::Registration)?;

        info!(
            "Registered instance {} with registry at {}",
            instance.instance_id,
            self.endpoints.current().1
        );
        Ok(())
    }

    /// `PUT /apps/{appName}/{instanceId}?status=UP`
    pub async fn heartbeat(&self, app_name: &str, instance_id: &str) -> std::result::Result<(), HeartbeatError> {
        let path = ResourcePath::apps()
            .segment(app_name)
            .segment(instance_id)
            .query("status", "UP");

        match self.request(Method::PUT, &path, None).await {
            Ok(_) => {
                debug!("Heartbeat sent for {}", instance_id);
                Ok(())
            }
            Err(e) if e.is_not_found() => Err(HeartbeatError::InstanceNotFound {
                app: app_name.to_string(),
                instance_id: instance_id.to_string(),
            }),
            Err(e) => Err(HeartbeatError::Transport(e)),
        }
    }

    /// `DELETE /apps/{appName}/{instanceId}`
    pub async fn deregister(&self, app_name: &str, instance_id: &str) -> std::result::Result<(), TransportError> {
        let path = ResourcePath::apps().segment(app_name).segment(instance_id);
        self.request(Method::DELETE, &path, None).await?;
        info!("Deregistered instance {} from registry", instance_id);
        Ok(())
    }

    /// `PUT /apps/{appName}/{instanceId}/status?value={status}`
    pub async fn set_status(
        &self,
        app_name: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> std::result::Result<(), TransportError> {
        let path = ResourcePath::apps()
            .segment(app_name)
            .segment(instance_id)
            .segment("status")
            .query("value", status.to_string());
        self.request(Method::PUT, &path, None).await?;
        info!("Updated status for {} to {}", instance_id, status);
        Ok(())
    }

    /// `GET /apps/{appName}`
    pub async fn list_instances(&self, app_name: &str) -> std::result::Result<Application, TransportError> {
        let envelope: ApplicationEnvelope = self.get_json(&ResourcePath::apps().segment(app_name)).await?;
        Ok(envelope.application)
    }

    /// `GET /apps`
    pub async fn list_all_applications(&self) -> std::result::Result<Applications, TransportError> {
        let envelope: ApplicationsEnvelope = self.get_json(&ResourcePath::apps()).await?;
        Ok(envelope.applications)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{connect_error, json_reply, status, timeout, ScriptedBackend};
    use serde_json::json;

    const R1: &str = "http://r1:8761/eureka";
    const R2: &str = "http://r2:8761/eureka";
    const R3: &str = "http://r3:8761/eureka";

    fn transport(backend: &Arc<ScriptedBackend>, urls: &[&str]) -> RegistryTransport {
        RegistryTransport::with_backend(urls.iter().copied(), Duration::from_secs(1), backend.clone()).unwrap()
    }

    #[test]
    fn test_endpoint_set_trims_trailing_slash() {
        let set = RegistryEndpointSet::new(vec!["http://r1:8761/eureka/", " http://r2:8761/eureka "]).unwrap();
        assert_eq!(set.urls(), &[R1.to_string(), R2.to_string()]);
        assert_eq!(set.current(), (0, R1));
    }

    #[test]
    fn test_endpoint_set_requires_a_url() {
        assert!(RegistryEndpointSet::new(Vec::<String>::new()).is_err());
        assert!(RegistryEndpointSet::new(vec!["  "]).is_err());
    }

    #[test]
    fn test_endpoint_set_rotation_wraps() {
        let set = RegistryEndpointSet::new(vec![R1, R2]).unwrap();
        set.advance_from(0);
        assert_eq!(set.cursor(), 1);
        set.advance_from(1);
        assert_eq!(set.cursor(), 0);
    }

    #[test]
    fn test_endpoint_set_stale_rotation_is_ignored() {
        let set = RegistryEndpointSet::new(vec![R1, R2, R3]).unwrap();
        set.advance_from(0);
        // A second caller that also observed replica 0 must not skip replica 1
        set.advance_from(0);
        assert_eq!(set.cursor(), 1);
    }

    #[test]
    fn test_resource_path_joins_onto_base() {
        let orders = ResourcePath::apps().segment("ORDERS");
        assert_eq!(orders.url_for(R1).unwrap(), "http://r1:8761/eureka/apps/ORDERS");
        assert_eq!(ResourcePath::apps().url_for("http://r1/eureka/").unwrap(), "http://r1/eureka/apps");
        assert_eq!(ResourcePath::apps().url_for("http://r1:8761").unwrap(), "http://r1:8761/apps");
        assert_eq!(orders.to_string(), "/apps/ORDERS");
    }

    #[test]
    fn test_resource_path_encodes_reserved_characters() {
        let path = ResourcePath::apps()
            .segment("ORDERS")
            .segment("orders 1?x#y/z")
            .query("value", "UP");

        assert_eq!(
            path.url_for(R1).unwrap(),
            "http://r1:8761/eureka/apps/ORDERS/orders%201%3Fx%23y%2Fz?value=UP"
        );
    }

    #[test]
    fn test_resource_path_rejects_unusable_base() {
        let err = ResourcePath::apps().url_for("not a url").unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_heartbeat_for_id_with_reserved_characters() {
        let backend = ScriptedBackend::new();
        backend.on(Method::PUT, R1, status(200));
        backend.on(Method::DELETE, R1, status(200));
        let transport = transport(&backend, &[R1]);

        transport.heartbeat("ORDERS", "orders?status=DOWN").await.unwrap();
        transport.deregister("ORDERS", "orders/1").await.unwrap();

        let calls = backend.calls();
        assert_eq!(calls[0].url, format!("{}/apps/ORDERS/orders%3Fstatus=DOWN?status=UP", R1));
        assert_eq!(calls[1].url, format!("{}/apps/ORDERS/orders%2F1", R1));
    }

    #[tokio::test]
    async fn test_failover_to_second_replica_moves_cursor() {
        let backend = ScriptedBackend::new();
        backend.on(Method::GET, R1, timeout(R1));
        backend.on(Method::GET, R2, status(200));
        let transport = transport(&backend, &[R1, R2]);

        let response = transport.request(Method::GET, &ResourcePath::apps(), None).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.endpoints().cursor(), 1);
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_not_found_does_not_fail_over() {
        let backend = ScriptedBackend::new();
        backend.on(Method::PUT, R1, status(404));
        backend.on(Method::PUT, R2, status(200));
        let transport = transport(&backend, &[R1, R2]);

        let err = transport
            .request(
                Method::PUT,
                &ResourcePath::apps().segment("ORDERS").segment("orders-1").query("status", "UP"),
                None,
            )
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(backend.calls().len(), 1);
        assert_eq!(transport.endpoints().cursor(), 0);
    }

    #[tokio::test]
    async fn test_all_replicas_failing_returns_last_error() {
        let backend = ScriptedBackend::new();
        backend.on(Method::GET, R1, connect_error(R1));
        backend.on(Method::GET, R2, status(503));
        let transport = transport(&backend, &[R1, R2]);

        let err = transport.request(Method::GET, &ResourcePath::apps(), None).await.unwrap_err();

        assert_eq!(
            err,
            TransportError::Status {
                url: format!("{}/apps", R2),
                status: 503
            }
        );
        assert_eq!(backend.calls().len(), 2);
        // One full pass wraps the cursor back to where it started
        assert_eq!(transport.endpoints().cursor(), 0);
    }

    #[tokio::test]
    async fn test_request_starts_at_current_cursor() {
        let backend = ScriptedBackend::new();
        backend.on(Method::GET, R1, status(200));
        backend.on(Method::GET, R2, status(200));
        let transport = transport(&backend, &[R1, R2]);
        transport.endpoints().advance_from(0);

        transport.request(Method::GET, &ResourcePath::apps(), None).await.unwrap();

        assert!(backend.calls()[0].url.starts_with(R2));
    }

    #[tokio::test]
    async fn test_heartbeat_not_found_is_instance_not_found() {
        let backend = ScriptedBackend::new();
        backend.on(Method::PUT, R1, status(404));
        let transport = transport(&backend, &[R1]);

        let err = transport.heartbeat("ORDERS", "orders-1").await.unwrap_err();

        assert_eq!(
            err,
            HeartbeatError::InstanceNotFound {
                app: "ORDERS".to_string(),
                instance_id: "orders-1".to_string()
            }
        );
        assert_eq!(backend.calls()[0].url, format!("{}/apps/ORDERS/orders-1?status=UP", R1));
    }

    #[tokio::test]
    async fn test_heartbeat_unreachable_is_transport_error() {
        let backend = ScriptedBackend::new();
        backend.on(Method::PUT, R1, timeout(R1));
        let transport = transport(&backend, &[R1]);

        let err = transport.heartbeat("ORDERS", "orders-1").await.unwrap_err();
        assert!(matches!(err, HeartbeatError::Transport(TransportError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_register_posts_envelope() {
        let backend = ScriptedBackend::new();
        backend.on(Method::POST, R1, status(204));
        let transport = transport(&backend, &[R1]);
        let instance = InstanceRecord::builder("orders")
            .ip_address("10.0.0.5")
            .host_name("orders-host")
            .port(9001)
            .build()
            .unwrap();

        transport.register(&instance).await.unwrap();

        let call = &backend.calls()[0];
        assert_eq!(call.url, format!("{}/apps/ORDERS", R1));
        let body = call.body.as_ref().unwrap();
        assert_eq!(body["instance"]["instanceId"], "orders:10.0.0.5:9001");
    }

    #[tokio::test]
    async fn test_register_failure_is_registration_error() {
        let backend = ScriptedBackend::new();
        backend.on(Method::POST, R1, status(500));
        let transport = transport(&backend, &[R1]);
        let instance = InstanceRecord::builder("orders").ip_address("10.0.0.5").build().unwrap();

        let err = transport.register(&instance).await.unwrap_err();
        assert!(matches!(err, RegistryError::Registration(TransportError::Status { status: 500, .. })));
    }

    #[tokio::test]
    async fn test_set_status_path() {
        let backend = ScriptedBackend::new();
        backend.on(Method::PUT, R1, status(200));
        let transport = transport(&backend, &[R1]);

        transport
            .set_status("ORDERS", "orders-1", InstanceStatus::OutOfService)
            .await
            .unwrap();

        assert_eq!(
            backend.calls()[0].url,
            format!("{}/apps/ORDERS/orders-1/status?value=OUT_OF_SERVICE", R1)
        );
    }

    #[tokio::test]
    async fn test_list_instances_decodes_body() {
        let backend = ScriptedBackend::new();
        backend.on(
            Method::GET,
            R1,
            json_reply(json!({"application": {"name": "BILLING", "instance": {"instanceId": "b1", "ipAddr": "10.0.0.9", "status": "UP"}}})),
        );
        let transport = transport(&backend, &[R1]);

        let application = transport.list_instances("BILLING").await.unwrap();
        assert_eq!(application.name, "BILLING");
        assert_eq!(application.instances().len(), 1);
    }

    #[tokio::test]
    async fn test_list_instances_invalid_body_is_decode_error() {
        let backend = ScriptedBackend::new();
        backend.on(Method::GET, R1, status(200));
        let transport = transport(&backend, &[R1]);

        let err = transport.list_instances("BILLING").await.unwrap_err();
        assert!(matches!(err, TransportError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_failovers_are_counted() {
        let metrics = RegistryMetrics::new().unwrap();
        let backend = ScriptedBackend::new();
        backend.on(Method::GET, R1, timeout(R1));
        backend.on(Method::GET, R2, status(200));
        let transport = transport(&backend, &[R1, R2]).with_metrics(metrics.clone());

        transport.request(Method::GET, &ResourcePath::apps(), None).await.unwrap();
        assert_eq!(metrics.failovers_total.get(), 1);
    }
}
