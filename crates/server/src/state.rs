// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `Services` aggregate: every process-wide singleton, owned by the
//! top-level server initializer and passed by reference, never global.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::auth::AuthStore;
use crate::bus::EventBus;
use crate::config::{home_dir, Config};
use crate::project::ProjectIndex;
use crate::provider::ProviderRegistry;
use crate::srp::limit::IdentityLimiter;
use crate::srp::resume::ResumeStore;
use crate::store::LogStore;
use crate::supervisor::{Supervisor, SupervisorConfig};

/// Shared application state handed to every handler.
pub struct Services {
    pub config: Config,
    pub bus: EventBus,
    pub store: Arc<LogStore>,
    pub projects: Arc<ProjectIndex>,
    pub supervisor: Arc<Supervisor>,
    pub auth: Arc<AuthStore>,
    pub limiter: Arc<IdentityLimiter>,
    pub resume: Arc<ResumeStore>,
    pub providers: Arc<ProviderRegistry>,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
    pub install_id: String,
    /// Random per-boot token marking in-process dispatch from the relay.
    /// Never leaves the process; requests carrying it skip cookie auth.
    pub internal_token: String,

    /// The fully-built router, re-entered by the relay for tunneled
    /// requests. Set once after construction.
    internal_router: parking_lot::RwLock<Option<axum::Router>>,
}

impl Services {
    pub fn build(config: Config) -> anyhow::Result<Arc<Self>> {
        let data_dir = config.resolved_data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let install_id = load_install_id(&data_dir)?;

        let bus = EventBus::new();
        let store = Arc::new(LogStore::new(config.sessions_root()));
        let projects = Arc::new(ProjectIndex::new(
            config.sessions_root(),
            home_dir(),
            Duration::from_millis(config.cache_ttl_ms),
        ));
        let providers = Arc::new(ProviderRegistry::new());
        let supervisor = Supervisor::new(
            SupervisorConfig {
                message_queue_cap: config.message_queue_cap,
                per_project_cap: config.per_project_cap,
                global_cap: config.global_cap,
                max_queue_size: config.max_queue_size,
                abort_grace: Duration::from_millis(config.abort_grace_ms),
                agent_cmd: config.agent_cmd.clone(),
                default_provider: config.provider.clone(),
            },
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&providers),
        );
        let auth = Arc::new(AuthStore::load(
            &data_dir,
            &config.profile_name,
            config.auth_enabled,
            config.auth_disabled,
        )?);
        let resume = if config.persist_remote_sessions {
            Arc::new(ResumeStore::persistent(data_dir.join("resume_sessions.json")))
        } else {
            Arc::new(ResumeStore::in_memory())
        };

        Ok(Arc::new(Self {
            config,
            bus,
            store,
            projects,
            supervisor,
            auth,
            limiter: Arc::new(IdentityLimiter::new()),
            resume,
            providers,
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
            install_id,
            internal_token: crate::auth::random_token(),
            internal_router: parking_lot::RwLock::new(None),
        }))
    }

    pub fn set_internal_router(&self, router: axum::Router) {
        *self.internal_router.write() = Some(router);
    }

    pub fn internal_router(&self) -> Option<axum::Router> {
        self.internal_router.read().clone()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// Stable uuid per installation, created on first boot.
fn load_install_id(data_dir: &Path) -> anyhow::Result<String> {
    let path = data_dir.join("install_id");
    match std::fs::read_to_string(&path) {
        Ok(id) if !id.trim().is_empty() => Ok(id.trim().to_owned()),
        _ => {
            let id = uuid::Uuid::new_v4().to_string();
            std::fs::write(&path, &id)?;
            Ok(id)
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
