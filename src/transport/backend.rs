use crate::error::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{RequestBuilder, Url};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use super::request::Method;

/// One wire attempt against a fully resolved URL.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpCall {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl HttpCall {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Value,
}

impl HttpReply {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// No HTTP response was received.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
}

#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn send(&self, call: HttpCall) -> Result<HttpReply, BackendError>;
}

/// Runs `call` under its own timeout regardless of what the backend enforces.
pub async fn send_with_timeout(
    backend: &dyn HttpBackend,
    call: HttpCall,
) -> Result<HttpReply, BackendError> {
    let timeout = call.timeout;
    match tokio::time::timeout(timeout, backend.send(call)).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(timeout)),
    }
}

#[derive(Clone, Debug)]
pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn send(&self, call: HttpCall) -> Result<HttpReply, BackendError> {
        let timeout = call.timeout;
        let request = build_request(&self.client, &call)
            .map_err(|err| BackendError::Network(err.to_string()))?;

        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify(err, timeout))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| classify(err, timeout))?;

        Ok(HttpReply {
            status,
            body: decode_body(&bytes),
        })
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(timeout)
    } else {
        BackendError::Network(err.to_string())
    }
}

fn build_request(client: &reqwest::Client, call: &HttpCall) -> Result<RequestBuilder> {
    let url = Url::parse(&call.url)
        .map_err(|err| crate::err!("invalid request url `{}`: {err}", call.url))?;
    let mut request = client.request(call.method.into(), url);

    for (name, value) in &call.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| crate::err!("invalid header name `{name}`: {err}"))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|err| crate::err!("invalid header value for `{name}`: {err}"))?;
        request = request.header(header_name, header_value);
    }

    match &call.body {
        None | Some(Value::Null) => {}
        Some(Value::String(text)) => {
            request = request
                .header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
                .body(text.clone());
        }
        Some(other) => request = request.json(other),
    }

    Ok(request)
}

/// JSON when the body parses as JSON, otherwise the lossy UTF-8 text.
pub fn decode_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice::<Value>(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
