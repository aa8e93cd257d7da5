use crate::config::NetworkConfig;
use crate::connectivity::{ConnectivityMonitor, EndpointRef};
use crate::health::{MetricsAggregator, OutcomeKind};
use crate::queue::{NewOperation, OfflineQueue, OperationReplayer, QueuedOperation};
use crate::retry::{RetryCause, RetryPolicy};
use crate::store::ResponseCache;
use crate::telemetry::RuntimeCounters;
use crate::transport::auth::{is_auth_failure, AuthProvider};
use crate::transport::backend::{send_with_timeout, BackendError, HttpBackend, HttpCall, HttpReply};
use crate::transport::error::{server_message, ErrorKind, TransportError};
use crate::transport::request::{ApiRequest, ApiResponse, ResponseSource};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use url::Url;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";
pub const OFFLINE_OPERATION_HEADER: &str = "X-Offline-Operation";
pub const OFFLINE_OPERATION_ID_HEADER: &str = "X-Offline-Operation-ID";

/// Collaborators the executor is wired to.
pub struct TransportDeps {
    pub monitor: ConnectivityMonitor,
    pub aggregator: MetricsAggregator,
    pub cache: ResponseCache,
    pub queue: OfflineQueue,
    pub backend: Arc<dyn HttpBackend>,
    pub auth: Arc<dyn AuthProvider>,
    pub counters: Arc<RuntimeCounters>,
}

#[derive(Clone)]
pub struct TransportExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    deps: TransportDeps,
    policy: RetryPolicy,
    timeout: Duration,
    offline_mode: bool,
}

/// A failed attempt that is eligible for retry.
#[derive(Debug)]
enum Failure {
    Server { status: u16, detail: Option<String> },
    Timeout,
    Network(String),
}

impl Failure {
    fn cause(&self) -> RetryCause {
        match self {
            Failure::Server { .. } => RetryCause::Server,
            Failure::Timeout => RetryCause::Timeout,
            Failure::Network(_) => RetryCause::Network,
        }
    }

    fn into_error(self) -> TransportError {
        match self {
            Failure::Server { status, detail } => {
                let error = TransportError::from_kind(ErrorKind::ServerError(status));
                match detail {
                    Some(detail) => error.with_detail(detail),
                    None => error,
                }
            }
            Failure::Timeout => TransportError::from_kind(ErrorKind::Timeout),
            Failure::Network(detail) => {
                TransportError::from_kind(ErrorKind::NetworkUnreachable).with_detail(detail)
            }
        }
    }
}

impl TransportExecutor {
    pub fn new(config: &NetworkConfig, deps: TransportDeps) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                deps,
                policy: RetryPolicy::from_config(config),
                timeout: config.timeout,
                offline_mode: config.offline_mode,
            }),
        }
    }

    pub fn with_policy(config: &NetworkConfig, deps: TransportDeps, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                deps,
                policy,
                timeout: config.timeout,
                offline_mode: config.offline_mode,
            }),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let request_id = generate_request_id();
        self.inner.deps.counters.inc_requests();
        let span = tracing::debug_span!(
            "request",
            request_id = %request_id,
            method = %request.method,
            path = %request.path
        );
        self.inner
            .execute(request, request_id)
            .instrument(span)
            .await
    }
}

#[async_trait]
impl OperationReplayer for TransportExecutor {
    async fn replay(&self, operation: &QueuedOperation) -> Result<ApiResponse, TransportError> {
        self.execute(operation.to_request()).await
    }
}

impl ExecutorInner {
    async fn execute(
        &self,
        request: ApiRequest,
        request_id: String,
    ) -> Result<ApiResponse, TransportError> {
        let deps = &self.deps;
        let safe = request.method.is_safe();
        let cache_key = safe.then(|| ResponseCache::key(&request.path, request.query.as_ref()));

        if !deps.monitor.is_device_online() {
            if request.is_replay() {
                return Err(self.offline_error(&request_id));
            }
            return match &cache_key {
                Some(key) => self
                    .cached_response(key, self.offline_mode, &request_id)
                    .ok_or_else(|| self.offline_error(&request_id)),
                None => self.enqueue(&request, &request_id),
            };
        }

        let token = deps.auth.token().await;
        let mut retry = 0u32;
        let mut fallback_used = false;

        loop {
            let endpoint = deps.monitor.current_endpoint();
            let call = self.build_call(&request, &endpoint, &request_id, token.as_deref());
            let tracking = deps.aggregator.start_tracking(endpoint.url.clone());

            let failure = match send_with_timeout(deps.backend.as_ref(), call).await {
                Ok(reply) if reply.is_success() => {
                    deps.aggregator.record_outcome(tracking, OutcomeKind::Success);
                    deps.monitor.record_success(&endpoint);
                    if let Some(key) = &cache_key {
                        if let Err(err) = deps.cache.put(key, &reply.body) {
                            tracing::warn!(key = %key, error = %err, "failed to cache response");
                        }
                    }
                    return Ok(ApiResponse {
                        status: reply.status,
                        data: reply.body,
                        source: ResponseSource::Network,
                        request_id,
                        endpoint: Some(endpoint),
                    });
                }
                Ok(reply) if (400..500).contains(&reply.status) => {
                    deps.aggregator.record_outcome(tracking, OutcomeKind::ClientError);
                    deps.monitor.record_success(&endpoint);
                    return Err(self.client_error(reply, &request_id).await);
                }
                Ok(reply) => {
                    deps.aggregator.record_outcome(tracking, OutcomeKind::ServerError);
                    Failure::Server {
                        status: reply.status,
                        detail: server_message(&reply.body),
                    }
                }
                Err(BackendError::Timeout(_)) => {
                    deps.aggregator.record_outcome(tracking, OutcomeKind::Timeout);
                    Failure::Timeout
                }
                Err(BackendError::Network(detail)) => {
                    deps.aggregator.record_outcome(tracking, OutcomeKind::NetworkError);
                    if !fallback_used {
                        fallback_used = true;
                        let next = deps.monitor.report_failure(&endpoint);
                        if next != endpoint {
                            crate::network_event!(
                                warn,
                                "endpoint_fallback",
                                endpoint = endpoint,
                                request_id = request_id,
                                next = next,
                            );
                            continue;
                        }
                    }
                    Failure::Network(detail)
                }
            };

            retry += 1;
            if safe && self.policy.should_retry(retry) {
                let delay = self.policy.delay_for(retry, failure.cause());
                deps.counters.inc_retries();
                crate::network_event!(
                    info,
                    "request_retry",
                    endpoint = endpoint,
                    request_id = request_id,
                    attempt = retry,
                    delay_ms = delay.as_millis(),
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return self.exhausted(failure, &request, cache_key.as_deref(), &request_id);
        }
    }

    fn exhausted(
        &self,
        failure: Failure,
        request: &ApiRequest,
        cache_key: Option<&str>,
        request_id: &str,
    ) -> Result<ApiResponse, TransportError> {
        if let Some(key) = cache_key {
            let eligible = self.offline_mode || !matches!(failure, Failure::Server { .. });
            if eligible {
                if let Some(cached) = self.cached_response(key, self.offline_mode, request_id) {
                    tracing::info!(request_id = %request_id, "serving cached response after failure");
                    return Ok(cached);
                }
            }
        } else if matches!(failure, Failure::Network(_)) && !request.is_replay() {
            return self.enqueue(request, request_id);
        }

        let error = failure.into_error().with_request_id(request_id);
        tracing::warn!(
            request_id = %request_id,
            kind = %error.kind,
            detail = error.detail.as_deref().unwrap_or(""),
            "request failed"
        );
        Err(error)
    }

    async fn client_error(&self, reply: HttpReply, request_id: &str) -> TransportError {
        let detail = server_message(&reply.body);
        if reply.status == 401 {
            match detail.as_deref() {
                Some(message) if is_auth_failure(message) => {
                    tracing::warn!(request_id = %request_id, reason = %message, "authentication rejected; forcing logout");
                    self.deps.auth.force_logout(message).await;
                }
                _ => {
                    tracing::info!(request_id = %request_id, "ambiguous 401; not logging out");
                }
            }
        }

        let error = TransportError::from_kind(ErrorKind::ClientError(reply.status))
            .with_request_id(request_id);
        match detail {
            Some(detail) => error.with_detail(detail),
            None => error,
        }
    }

    fn cached_response(
        &self,
        key: &str,
        allow_stale: bool,
        request_id: &str,
    ) -> Option<ApiResponse> {
        match self.deps.cache.get(key, allow_stale) {
            Ok(Some(cached)) => {
                self.deps.counters.record_cache_lookup(true);
                Some(ApiResponse {
                    status: 200,
                    data: cached.data,
                    source: ResponseSource::Cache {
                        stale: cached.stale,
                    },
                    request_id: request_id.to_string(),
                    endpoint: None,
                })
            }
            Ok(None) => {
                self.deps.counters.record_cache_lookup(false);
                None
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "cache lookup failed");
                None
            }
        }
    }

    fn enqueue(&self, request: &ApiRequest, request_id: &str) -> Result<ApiResponse, TransportError> {
        match self.deps.queue.enqueue(NewOperation::from_request(request)) {
            Ok(operation_id) => Ok(ApiResponse {
                status: 202,
                data: json!({
                    "queued": true,
                    "operationId": operation_id,
                    "message": "Saved offline; it will be sent when the connection is restored.",
                }),
                source: ResponseSource::Queued { operation_id },
                request_id: request_id.to_string(),
                endpoint: None,
            }),
            Err(err) => {
                tracing::error!(request_id = %request_id, error = %err, "failed to queue offline operation");
                Err(self.offline_error(request_id).with_detail(err.to_string()))
            }
        }
    }

    fn offline_error(&self, request_id: &str) -> TransportError {
        TransportError::from_kind(ErrorKind::Offline).with_request_id(request_id)
    }

    fn build_call(
        &self,
        request: &ApiRequest,
        endpoint: &EndpointRef,
        request_id: &str,
        token: Option<&str>,
    ) -> HttpCall {
        let mut headers = vec![
            ("Accept".to_string(), "application/json".to_string()),
            (REQUEST_ID_HEADER.to_string(), request_id.to_string()),
        ];
        if let Some(token) = token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        if let Some(replay) = request.replay {
            headers.push((OFFLINE_OPERATION_HEADER.to_string(), "true".to_string()));
            headers.push((
                OFFLINE_OPERATION_ID_HEADER.to_string(),
                replay.operation_id.to_string(),
            ));
        }
        headers.extend(request.headers.iter().cloned());

        HttpCall {
            method: request.method,
            url: resolve_url(endpoint, &request.path, request.query.as_ref()),
            headers,
            body: request.body.clone(),
            timeout: self.timeout,
        }
    }
}

/// `req_<epoch millis>_<10 random alphanumerics>`.
pub fn generate_request_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!(
        "req_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        suffix.to_ascii_lowercase()
    )
}

/// Joins `path` onto the endpoint and encodes a JSON object query as query pairs.
pub fn resolve_url(endpoint: &EndpointRef, path: &str, query: Option<&Value>) -> String {
    let joined = endpoint.join(path);
    let Some(Value::Object(params)) = query else {
        return joined;
    };
    if params.is_empty() {
        return joined;
    }
    let Ok(mut url) = Url::parse(&joined) else {
        return joined;
    };
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            match value {
                Value::Null => {}
                Value::String(text) => {
                    pairs.append_pair(key, text);
                }
                other => {
                    pairs.append_pair(key, &other.to_string());
                }
            }
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_prefixed_and_unique() {
        let first = generate_request_id();
        let second = generate_request_id();
        assert!(first.starts_with("req_"));
        assert_eq!(first.split('_').count(), 3);
        assert_ne!(first, second);
    }

    #[test]
    fn query_objects_become_pairs() {
        let endpoint = EndpointRef {
            position: 0,
            url: "http://localhost:5002".to_string(),
        };
        assert_eq!(
            resolve_url(&endpoint, "/quests", Some(&json!({"status": "active", "page": 2}))),
            "http://localhost:5002/quests?page=2&status=active"
        );
        assert_eq!(resolve_url(&endpoint, "/quests", None), "http://localhost:5002/quests");
    }
}
