//! SessionBuilder - セッションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: ポートが足りなければ `build()` が失敗する
//! - グローバルなシングルトンの代わりに、ポートを明示的に注入する

use std::sync::{Arc, Mutex};

use tracing::debug;

use super::config::SessionConfig;
use super::graph;
use super::handlers::SessionCore;
use super::heal::HealTracker;
use super::Session;
use crate::domain::SessionId;
use crate::fsm::BuildError;
use crate::ports::{Clock, DownloadProvider, HypervisorControl, SystemClock};
use crate::progress::FiniteTask;

/// SessionError はセッション構築・起動時のエラー
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("missing port: {0}. Register it on the SessionBuilder before build().")]
    MissingPort(&'static str),

    #[error("no tokio runtime available; call build() inside a runtime or pass a handle")]
    NoRuntime,

    #[error("invalid lifecycle graph: {0}")]
    Graph(#[from] BuildError),

    #[error("cannot spawn session worker: {0}")]
    Worker(#[from] std::io::Error),
}

/// SessionBuilder は Session を構築
///
/// # 使用例
/// ```ignore
/// let session = Session::builder(config)
///     .hypervisor(Arc::new(SimulatedHypervisor::new()))
///     .downloads(Arc::new(StaticDownloadProvider::new()))
///     .build()?;
/// ```
pub struct SessionBuilder {
    config: SessionConfig,
    hypervisor: Option<Arc<dyn HypervisorControl>>,
    downloads: Option<Arc<dyn DownloadProvider>>,
    clock: Arc<dyn Clock>,
    runtime: Option<tokio::runtime::Handle>,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            hypervisor: None,
            downloads: None,
            clock: Arc::new(SystemClock),
            runtime: None,
        }
    }

    pub fn hypervisor(mut self, hypervisor: Arc<dyn HypervisorControl>) -> Self {
        self.hypervisor = Some(hypervisor);
        self
    }

    pub fn downloads(mut self, downloads: Arc<dyn DownloadProvider>) -> Self {
        self.downloads = Some(downloads);
        self
    }

    /// Clock of the heal window. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runtime that drives downloads. Defaults to the current one.
    pub fn runtime(mut self, runtime: tokio::runtime::Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Wire the ports, build the lifecycle graph and bind a fresh progress
    /// tree. The worker is not started until `Session::open`.
    pub fn build(self) -> Result<Session, SessionError> {
        let hypervisor = self.hypervisor.ok_or(SessionError::MissingPort("hypervisor"))?;
        let downloads = self.downloads.ok_or(SessionError::MissingPort("downloads"))?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?,
        };

        let id = SessionId::generate();
        let core = Arc::new(SessionCore {
            id,
            config: self.config,
            hypervisor,
            downloads,
            clock: self.clock,
            runtime,
            heal: Mutex::new(HealTracker::default()),
            last_error: Mutex::new(None),
            boot_medium: Mutex::new(None),
        });

        let fsm = graph::build(&core, id.to_string())?;
        let progress = FiniteTask::new();
        fsm.use_progress(&progress, "Preparing session");
        debug!(session = %id, vm = %core.config.name, "session built");

        Ok(Session {
            core,
            fsm,
            progress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{SimulatedHypervisor, StaticDownloadProvider};

    #[tokio::test]
    async fn missing_hypervisor_fails_fast() {
        let result = SessionBuilder::new(SessionConfig::default())
            .downloads(Arc::new(StaticDownloadProvider::new()))
            .build();
        assert!(matches!(result, Err(SessionError::MissingPort("hypervisor"))));
    }

    #[tokio::test]
    async fn missing_downloads_fails_fast() {
        let result = SessionBuilder::new(SessionConfig::default())
            .hypervisor(Arc::new(SimulatedHypervisor::new()))
            .build();
        assert!(matches!(result, Err(SessionError::MissingPort("downloads"))));
    }

    #[test]
    fn outside_a_runtime_needs_a_handle() {
        let result = SessionBuilder::new(SessionConfig::default())
            .hypervisor(Arc::new(SimulatedHypervisor::new()))
            .downloads(Arc::new(StaticDownloadProvider::new()))
            .build();
        assert!(matches!(result, Err(SessionError::NoRuntime)));
    }

    #[tokio::test]
    async fn built_session_waits_at_entry() {
        let session = SessionBuilder::new(SessionConfig::default())
            .hypervisor(Arc::new(SimulatedHypervisor::new()))
            .downloads(Arc::new(StaticDownloadProvider::new()))
            .build()
            .unwrap();
        assert_eq!(session.state(), Some(crate::domain::SessionState::Entry));
        assert!(!session.fsm().is_running());
        assert!(session.id().to_string().starts_with("session-"));
    }
}
