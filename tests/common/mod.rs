//! Shared fakes for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use fleet_node_agent::agents::{HostMetrics, HostSample};
use fleet_node_agent::control_plane::{
    ControlPlane, ControlPlaneError, HealthReport, RegisterRequest, RemoteUser, TrafficReport,
};
use fleet_node_agent::proxy::{ProxyControl, ProxyError, ProxyReloader, UserCounters};
use fleet_node_agent::{AuthorizedUser, NodeIdentity};

pub const INBOUND: &str = "vless-in";

pub fn identity() -> NodeIdentity {
    NodeIdentity {
        id: None,
        name: "Edge AMS 1".to_string(),
        hostname: "ams1.example.net".to_string(),
        ip_address: "203.0.113.10".to_string(),
        port: 443,
        country: "Netherlands".to_string(),
        country_code: "NL".to_string(),
        city: Some("Amsterdam".to_string()),
        public_key: Some("pub".to_string()),
        short_id: Some("0123".to_string()),
        sni: "vk.com".to_string(),
        api_url: "http://node-agent:10085".to_string(),
    }
}

pub fn uid(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

pub fn remote(n: u128, active: bool) -> RemoteUser {
    RemoteUser {
        id: uid(n),
        label: format!("customer-{}", n),
        active,
        quota_bytes: None,
    }
}

/// Write a minimal proxy config with an empty managed inbound
pub fn write_proxy_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.json");
    let doc = json!({
        "log": {"loglevel": "warning"},
        "api": {"tag": "api", "services": ["HandlerService", "StatsService"]},
        "inbounds": [
            {"tag": "api", "listen": "127.0.0.1", "port": 10085, "protocol": "dokodemo-door"},
            {
                "tag": INBOUND,
                "port": 443,
                "protocol": "vless",
                "settings": {"clients": [], "decryption": "none"},
                "streamSettings": {"network": "tcp", "security": "reality"}
            }
        ],
        "outbounds": [{"protocol": "freedom", "tag": "direct"}]
    });
    std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    path
}

/// Client IDs listed for the managed inbound
pub fn config_client_ids(path: &Path) -> BTreeSet<Uuid> {
    let doc: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    doc["inbounds"]
        .as_array()
        .unwrap()
        .iter()
        .find(|i| i["tag"] == INBOUND)
        .unwrap()["settings"]["clients"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| Uuid::parse_str(c["id"].as_str().unwrap()).unwrap())
        .collect()
}

/// In-memory control plane
#[derive(Default)]
pub struct FakeControlPlane {
    pub users: Mutex<Vec<RemoteUser>>,
    pub register_calls: Mutex<Vec<RegisterRequest>>,
    pub health: Mutex<Vec<HealthReport>>,
    pub traffic: Mutex<Vec<TrafficReport>>,
    pub unauthorized: AtomicBool,
    pub fetch_fails: AtomicBool,
    issued: AtomicUsize,
}

impl FakeControlPlane {
    pub fn with_users(users: Vec<RemoteUser>) -> Self {
        let cp = Self::default();
        *cp.users.lock().unwrap() = users;
        cp
    }

    pub fn set_users(&self, users: Vec<RemoteUser>) {
        *self.users.lock().unwrap() = users;
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn register(&self, request: &RegisterRequest) -> Result<String, ControlPlaneError> {
        self.register_calls.lock().unwrap().push(request.clone());
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Unauthorized {
                status: StatusCode::FORBIDDEN,
            });
        }
        match &request.id {
            Some(id) => Ok(id.clone()),
            None => Ok(format!("node-{}", self.issued.fetch_add(1, Ordering::SeqCst) + 1)),
        }
    }

    async fn send_health(&self, report: &HealthReport) -> Result<(), ControlPlaneError> {
        self.health.lock().unwrap().push(report.clone());
        Ok(())
    }

    async fn send_traffic(&self, report: &TrafficReport) -> Result<(), ControlPlaneError> {
        self.traffic.lock().unwrap().push(report.clone());
        Ok(())
    }

    async fn fetch_users(&self, _node_id: &str) -> Result<Vec<RemoteUser>, ControlPlaneError> {
        if self.fetch_fails.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Timeout);
        }
        Ok(self.users.lock().unwrap().clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    Add(Uuid),
    Remove(Uuid),
}

/// Proxy control fake that records every mutating call
#[derive(Default)]
pub struct RecordingProxy {
    pub events: Mutex<Vec<ProxyEvent>>,
    pub live: Mutex<BTreeSet<Uuid>>,
    pub counters: Mutex<BTreeMap<String, UserCounters>>,
    /// Credentials whose calls fail with a transient error
    pub failing: Mutex<HashSet<Uuid>>,
    /// `Some(n)`: n more calls succeed, then the API reports itself unavailable
    pub remaining_calls: Mutex<Option<usize>>,
}

impl RecordingProxy {
    pub fn unavailable() -> Self {
        let proxy = Self::default();
        *proxy.remaining_calls.lock().unwrap() = Some(0);
        proxy
    }

    pub fn available_for(calls: usize) -> Self {
        let proxy = Self::default();
        *proxy.remaining_calls.lock().unwrap() = Some(calls);
        proxy
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    fn gate(&self, operation: &'static str, id: &Uuid) -> Result<(), ProxyError> {
        let mut remaining = self.remaining_calls.lock().unwrap();
        if let Some(n) = remaining.as_mut() {
            if *n == 0 {
                return Err(ProxyError::CapabilityUnavailable {
                    operation,
                    reason: "control API not listening".to_string(),
                });
            }
            *n -= 1;
        }
        if self.failing.lock().unwrap().contains(id) {
            return Err(ProxyError::Status {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "handler busy".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyControl for RecordingProxy {
    async fn add_user(&self, _tag: &str, user: &AuthorizedUser) -> Result<(), ProxyError> {
        self.gate("add_user", &user.id)?;
        self.events.lock().unwrap().push(ProxyEvent::Add(user.id));
        self.live.lock().unwrap().insert(user.id);
        Ok(())
    }

    async fn remove_user(&self, _tag: &str, id: &Uuid) -> Result<(), ProxyError> {
        self.gate("remove_user", id)?;
        self.events.lock().unwrap().push(ProxyEvent::Remove(*id));
        self.live.lock().unwrap().remove(id);
        Ok(())
    }

    async fn user_counters(&self) -> Result<BTreeMap<String, UserCounters>, ProxyError> {
        Ok(self.counters.lock().unwrap().clone())
    }

    async fn active_connections(&self, _tag: &str) -> Result<u64, ProxyError> {
        Ok(self.live.lock().unwrap().len() as u64)
    }
}

#[derive(Default)]
pub struct CountingReloader {
    pub reloads: AtomicUsize,
    pub fail: AtomicBool,
}

impl CountingReloader {
    pub fn count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyReloader for CountingReloader {
    async fn reload(&self) -> Result<(), ProxyError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProxyError::Reload {
                command: "systemctl restart xray".to_string(),
                reason: "exit status 1".to_string(),
            });
        }
        Ok(())
    }
}

pub struct FixedHost;

impl HostMetrics for FixedHost {
    fn sample(&self) -> HostSample {
        HostSample {
            cpu_percent: 3.0,
            memory_percent: 21.5,
        }
    }
}
