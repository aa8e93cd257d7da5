#![allow(dead_code)]

use async_trait::async_trait;
use questlink::channel::{ChannelConnector, ChannelFault, ChannelSocket, CloseInfo, SocketEvent};
use questlink::transport::{AuthProvider, BackendError, HttpBackend, HttpCall, HttpReply};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// What the scripted backend answers for one call.
#[derive(Clone, Debug)]
pub enum Scripted {
    Reply(u16, Value),
    Timeout,
    Network(String),
}

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub call: HttpCall,
    pub at: Instant,
}

/// HTTP backend answering from per-URL scripts and recording every call.
#[derive(Clone, Debug)]
pub struct ScriptedBackend {
    inner: Arc<Mutex<BackendState>>,
}

#[derive(Debug)]
struct BackendState {
    scripts: Vec<(String, VecDeque<Scripted>)>,
    fallback: Scripted,
    calls: Vec<RecordedCall>,
}

impl ScriptedBackend {
    pub fn new(fallback: Scripted) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BackendState {
                scripts: Vec::new(),
                fallback,
                calls: Vec::new(),
            })),
        }
    }

    /// Queues `outcome` for the next call whose URL contains `fragment`.
    pub fn push(&self, fragment: &str, outcome: Scripted) {
        let mut state = self.inner.lock().expect("backend state");
        match state.scripts.iter_mut().find(|(key, _)| key == fragment) {
            Some((_, queue)) => queue.push_back(outcome),
            None => state
                .scripts
                .push((fragment.to_string(), VecDeque::from([outcome]))),
        }
    }

    pub fn set_fallback(&self, outcome: Scripted) {
        self.inner.lock().expect("backend state").fallback = outcome;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.inner.lock().expect("backend state").calls.clone()
    }

    pub fn calls_to(&self, fragment: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|recorded| recorded.call.url.contains(fragment))
            .collect()
    }
}

#[async_trait]
impl HttpBackend for ScriptedBackend {
    async fn send(&self, call: HttpCall) -> Result<HttpReply, BackendError> {
        let timeout = call.timeout;
        let outcome = {
            let mut state = self.inner.lock().expect("backend state");
            let scripted = state
                .scripts
                .iter_mut()
                .find(|(fragment, queue)| call.url.contains(fragment.as_str()) && !queue.is_empty())
                .and_then(|(_, queue)| queue.pop_front());
            let outcome = scripted.unwrap_or_else(|| state.fallback.clone());
            state.calls.push(RecordedCall {
                call,
                at: Instant::now(),
            });
            outcome
        };

        match outcome {
            Scripted::Reply(status, body) => Ok(HttpReply::new(status, body)),
            Scripted::Timeout => Err(BackendError::Timeout(timeout)),
            Scripted::Network(detail) => Err(BackendError::Network(detail)),
        }
    }
}

/// Token source that records forced logouts.
#[derive(Clone, Debug, Default)]
pub struct RecordingAuth {
    token: Arc<Mutex<Option<String>>>,
    logouts: Arc<Mutex<Vec<String>>>,
}

impl RecordingAuth {
    pub fn with_token(token: &str) -> Self {
        Self {
            token: Arc::new(Mutex::new(Some(token.to_string()))),
            logouts: Arc::default(),
        }
    }

    pub fn clear_token(&self) {
        *self.token.lock().expect("auth state") = None;
    }

    pub fn logouts(&self) -> Vec<String> {
        self.logouts.lock().expect("auth state").clone()
    }
}

#[async_trait]
impl AuthProvider for RecordingAuth {
    async fn token(&self) -> Option<String> {
        self.token.lock().expect("auth state").clone()
    }

    async fn force_logout(&self, reason: &str) {
        self.logouts
            .lock()
            .expect("auth state")
            .push(reason.to_string());
    }
}

/// How one channel connection attempt behaves.
#[derive(Clone, Debug)]
pub enum ConnectScript {
    /// Opens, delivers `inbound`, then closes with `close` after `close_after` (never if `None`).
    Open {
        inbound: Vec<String>,
        close_after: Option<Duration>,
        close: CloseInfo,
    },
    Fail(String),
    /// Never completes; the manager's connect timeout fires.
    Hang,
}

impl ConnectScript {
    pub fn stays_open() -> Self {
        ConnectScript::Open {
            inbound: Vec::new(),
            close_after: None,
            close: CloseInfo::new(1000, ""),
        }
    }

    pub fn closes_after(after: Duration, code: u16, reason: &str) -> Self {
        ConnectScript::Open {
            inbound: Vec::new(),
            close_after: Some(after),
            close: CloseInfo::new(code, reason),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectAttempt {
    pub url: String,
    pub at: Instant,
}

#[derive(Clone, Debug)]
pub struct ScriptedConnector {
    inner: Arc<Mutex<ConnectorState>>,
}

#[derive(Debug)]
struct ConnectorState {
    scripts: VecDeque<ConnectScript>,
    fallback: ConnectScript,
    attempts: Vec<ConnectAttempt>,
    sent: Arc<Mutex<Vec<String>>>,
    closes: Arc<Mutex<Vec<CloseInfo>>>,
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConnectorState {
                scripts: VecDeque::new(),
                fallback: ConnectScript::stays_open(),
                attempts: Vec::new(),
                sent: Arc::default(),
                closes: Arc::default(),
            })),
        }
    }
}

impl ScriptedConnector {
    pub fn push(&self, script: ConnectScript) {
        self.inner
            .lock()
            .expect("connector state")
            .scripts
            .push_back(script);
    }

    pub fn set_fallback(&self, script: ConnectScript) {
        self.inner.lock().expect("connector state").fallback = script;
    }

    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        self.inner.lock().expect("connector state").attempts.clone()
    }

    /// Every text frame written by the client, across connections.
    pub fn sent(&self) -> Vec<String> {
        let sent = self.inner.lock().expect("connector state").sent.clone();
        let frames = sent.lock().expect("sent frames").clone();
        frames
    }

    /// Closes initiated by the client.
    pub fn client_closes(&self) -> Vec<CloseInfo> {
        let closes = self.inner.lock().expect("connector state").closes.clone();
        let recorded = closes.lock().expect("close log").clone();
        recorded
    }
}

#[async_trait]
impl ChannelConnector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn ChannelSocket>, ChannelFault> {
        let (script, sent, closes) = {
            let mut state = self.inner.lock().expect("connector state");
            state.attempts.push(ConnectAttempt {
                url: url.to_string(),
                at: Instant::now(),
            });
            let script = state
                .scripts
                .pop_front()
                .unwrap_or_else(|| state.fallback.clone());
            (script, state.sent.clone(), state.closes.clone())
        };

        match script {
            ConnectScript::Open {
                inbound,
                close_after,
                close,
            } => Ok(Box::new(ScriptedSocket {
                inbound: inbound.into(),
                close_at: close_after.map(|after| Instant::now() + after),
                close,
                sent,
                closes,
                closed: false,
            })),
            ConnectScript::Fail(reason) => Err(ChannelFault::Connect(reason)),
            ConnectScript::Hang => std::future::pending().await,
        }
    }
}

struct ScriptedSocket {
    inbound: VecDeque<String>,
    close_at: Option<Instant>,
    close: CloseInfo,
    sent: Arc<Mutex<Vec<String>>>,
    closes: Arc<Mutex<Vec<CloseInfo>>>,
    closed: bool,
}

#[async_trait]
impl ChannelSocket for ScriptedSocket {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelFault> {
        if self.closed {
            return Err(ChannelFault::Send("socket closed".to_string()));
        }
        self.sent.lock().expect("sent frames").push(text);
        Ok(())
    }

    async fn next_event(&mut self) -> SocketEvent {
        if let Some(text) = self.inbound.pop_front() {
            return SocketEvent::Text(text);
        }
        match self.close_at {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.closed = true;
                SocketEvent::Closed(self.close.clone())
            }
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        self.closed = true;
        self.closes
            .lock()
            .expect("close log")
            .push(CloseInfo::new(code, reason));
    }
}
