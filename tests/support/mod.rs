#![allow(dead_code)]

pub mod mocks;

use mocks::{RecordingAuth, Scripted, ScriptedBackend, ScriptedConnector};
use questlink::app::{Collaborators, NetworkAccess};
use questlink::config::NetworkConfig;
use questlink::store::{KeyValueStore, MemoryStore};
use std::sync::Arc;

pub const PRIMARY: &str = "http://primary.test";
pub const FALLBACK_A: &str = "http://fallback-a.test";
pub const FALLBACK_B: &str = "http://fallback-b.test";

pub fn test_config() -> NetworkConfig {
    NetworkConfig {
        primary_endpoint: PRIMARY.to_string(),
        fallback_endpoints: vec![FALLBACK_A.to_string(), FALLBACK_B.to_string()],
        ..NetworkConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub backend: ScriptedBackend,
    pub connector: ScriptedConnector,
    pub auth: RecordingAuth,
    pub access: NetworkAccess,
}

pub fn harness(config: NetworkConfig) -> Harness {
    harness_with_store(config, Arc::new(MemoryStore::new()))
}

pub fn harness_with_store(config: NetworkConfig, store: Arc<MemoryStore>) -> Harness {
    let backend = ScriptedBackend::new(Scripted::Network("connection refused".to_string()));
    let connector = ScriptedConnector::default();
    let auth = RecordingAuth::with_token("test-token");
    let shared: Arc<dyn KeyValueStore> = store.clone();
    let access = NetworkAccess::with_collaborators(
        config,
        Collaborators {
            store: shared,
            backend: Arc::new(backend.clone()),
            connector: Arc::new(connector.clone()),
            auth: Arc::new(auth.clone()),
        },
    )
    .expect("network access should build");

    Harness {
        store,
        backend,
        connector,
        auth,
        access,
    }
}
