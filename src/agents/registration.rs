//! Registration
//!
//! Runs once at boot. Without a persisted ID the node registers and stores
//! the ID it is given; with one it upserts its record under that same ID.
//! Transient failures back off and retry; a rejected secret halts the agent.
//! Once the control plane has answered, only the local write is retried, so
//! a failing disk never leads to a second id-less registration.

use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::control_plane::{ControlPlane, ControlPlaneError, RegisterRequest};
use crate::retry::{retry_until_success, BackoffPolicy, RetryOutcome};
use crate::state::{NodeIdentity, StateStore, StoreError};

#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The control plane rejected the shared secret
    #[error("registration rejected: {0}")]
    Unauthorized(#[source] ControlPlaneError),

    #[error("registration failed: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("failed to persist node ID: {0}")]
    Persist(#[from] StoreError),

    #[error("registration cancelled before it succeeded")]
    Cancelled,
}

impl RegistrationError {
    fn is_fatal(&self) -> bool {
        matches!(self, RegistrationError::Unauthorized(_))
    }
}

pub struct Registrar {
    control_plane: Arc<dyn ControlPlane>,
    store: Arc<StateStore>,
}

impl Registrar {
    pub fn new(control_plane: Arc<dyn ControlPlane>, store: Arc<StateStore>) -> Self {
        Self {
            control_plane,
            store,
        }
    }

    /// One register/upsert call followed by one persist attempt. Returns the
    /// node ID in effect afterwards.
    pub async fn register_once(&self) -> Result<String, RegistrationError> {
        let identity = self.store.identity().await;
        let assigned = self.call(&identity).await?;
        let node_id = adopt(&identity, assigned);
        self.persist(&identity, &node_id).await?;
        Ok(node_id)
    }

    /// Register, retrying transient failures with `backoff` until success.
    ///
    /// The register call and the persist step are retried separately.
    pub async fn run(
        &self,
        backoff: &dyn BackoffPolicy,
        cancel: &CancellationToken,
    ) -> Result<String, RegistrationError> {
        let identity = self.store.identity().await;

        let assigned = retry_until_success(
            backoff,
            "register_node",
            cancel,
            RegistrationError::is_fatal,
            || self.call(&identity),
        )
        .await;

        let node_id = match assigned {
            Ok(assigned) => adopt(&identity, assigned),
            Err(RetryOutcome::Fatal(e)) => {
                error!(error = %e, "Registration failed permanently; agent cannot run unregistered");
                return Err(e);
            }
            Err(RetryOutcome::Cancelled(_)) => return Err(RegistrationError::Cancelled),
        };

        let persisted = retry_until_success(
            backoff,
            "persist_node_id",
            cancel,
            |_: &RegistrationError| false,
            || self.persist(&identity, &node_id),
        )
        .await;

        match persisted {
            Ok(()) => Ok(node_id),
            Err(RetryOutcome::Fatal(e)) => Err(e),
            Err(RetryOutcome::Cancelled(_)) => {
                error!(
                    node_id = %node_id,
                    "Shutting down before the assigned node ID was persisted; set NODE_ID to keep it"
                );
                Err(RegistrationError::Cancelled)
            }
        }
    }

    async fn call(&self, identity: &NodeIdentity) -> Result<String, RegistrationError> {
        let request = RegisterRequest::from(identity);
        self.control_plane.register(&request).await.map_err(|e| {
            if e.is_auth() {
                RegistrationError::Unauthorized(e)
            } else {
                RegistrationError::ControlPlane(e)
            }
        })
    }

    async fn persist(&self, identity: &NodeIdentity, node_id: &str) -> Result<(), RegistrationError> {
        match &identity.id {
            Some(existing) => {
                // A pre-seeded NODE_ID may not be on disk yet
                self.store.flush().await?;
                info!(node_id = %existing, "Node record upserted");
            }
            None => {
                self.store.set_node_id(node_id).await?;
                info!(node_id = %node_id, "Registered as new node");
            }
        }
        Ok(())
    }
}

/// The ID to run under: a persisted ID always wins over the one returned
fn adopt(identity: &NodeIdentity, assigned: String) -> String {
    match &identity.id {
        Some(existing) => {
            if *existing != assigned {
                warn!(
                    persisted = %existing,
                    returned = %assigned,
                    "Control plane returned a different ID on upsert; keeping persisted ID"
                );
            }
            existing.clone()
        }
        None => assigned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::{HealthReport, RemoteUser, TrafficReport};
    use crate::retry::FixedBackoff;
    use crate::state::tests_support::identity;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Fails `failures` times, then answers `id`
    struct FakeRegistry {
        calls: Mutex<Vec<RegisterRequest>>,
        failures: Mutex<u32>,
        unauthorized: bool,
        id: String,
    }

    impl FakeRegistry {
        fn new(id: &str, failures: u32, unauthorized: bool) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(failures),
                unauthorized,
                id: id.to_string(),
            }
        }
    }

    #[async_trait]
    impl ControlPlane for FakeRegistry {
        async fn register(&self, request: &RegisterRequest) -> Result<String, ControlPlaneError> {
            self.calls.lock().unwrap().push(request.clone());
            if self.unauthorized {
                return Err(ControlPlaneError::Unauthorized {
                    status: StatusCode::UNAUTHORIZED,
                });
            }
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ControlPlaneError::Timeout);
            }
            Ok(self.id.clone())
        }

        async fn send_health(&self, _: &HealthReport) -> Result<(), ControlPlaneError> {
            Ok(())
        }

        async fn send_traffic(&self, _: &TrafficReport) -> Result<(), ControlPlaneError> {
            Ok(())
        }

        async fn fetch_users(&self, _: &str) -> Result<Vec<RemoteUser>, ControlPlaneError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_first_registration_persists_id() {
        let dir = tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("s.json"), identity()).unwrap());
        let cp = Arc::new(FakeRegistry::new("node-9", 2, false));
        let registrar = Registrar::new(cp.clone(), store.clone());

        let id = registrar
            .run(&FixedBackoff(Duration::from_millis(1)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(id, "node-9");
        assert_eq!(store.identity().await.id.as_deref(), Some("node-9"));
        assert_eq!(cp.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_upsert_keeps_persisted_id() {
        let dir = tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("s.json"), identity()).unwrap());
        store.set_node_id("node-1").await.unwrap();

        let cp = Arc::new(FakeRegistry::new("node-2", 0, false));
        let registrar = Registrar::new(cp.clone(), store.clone());
        let id = registrar.register_once().await.unwrap();

        assert_eq!(id, "node-1");
        assert_eq!(store.identity().await.id.as_deref(), Some("node-1"));
        let calls = cp.calls.lock().unwrap();
        assert_eq!(calls[0].id.as_deref(), Some("node-1"));
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal() {
        let dir = tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("s.json"), identity()).unwrap());
        let cp = Arc::new(FakeRegistry::new("x", 0, true));
        let registrar = Registrar::new(cp.clone(), store.clone());

        let err = registrar
            .run(&FixedBackoff(Duration::from_millis(1)), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RegistrationError::Unauthorized(_)));
        assert_eq!(cp.calls.lock().unwrap().len(), 1);
        assert!(store.identity().await.id.is_none());
    }
}
