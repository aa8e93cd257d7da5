use crate::connectivity::endpoints::EndpointRef;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectivityState {
    pub device_online: bool,
    pub selected_endpoint: EndpointRef,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Server reached by the last probe or request, and the aggregated health signal is good.
    pub healthy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    Unreachable,
    Unhealthy,
}

impl ChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeReason::Unreachable => "unreachable",
            ChangeReason::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
    ServerReachable {
        endpoint: EndpointRef,
    },
    ServerUnreachable {
        endpoint: EndpointRef,
    },
    EndpointChanged {
        from: EndpointRef,
        to: EndpointRef,
        reason: ChangeReason,
    },
    Error {
        message: String,
    },
}

impl ConnectivityEvent {
    /// Topic name listeners subscribe to.
    pub fn topic(&self) -> &'static str {
        match self {
            ConnectivityEvent::Online => "online",
            ConnectivityEvent::Offline => "offline",
            ConnectivityEvent::ServerReachable { .. } => "server-reachable",
            ConnectivityEvent::ServerUnreachable { .. } => "server-unreachable",
            ConnectivityEvent::EndpointChanged { .. } => "endpoint-changed",
            ConnectivityEvent::Error { .. } => "error",
        }
    }
}
