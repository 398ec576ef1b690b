//! Session - VM ライフサイクルのセッション層
//!
//! A session owns one lifecycle machine (one worker thread) plus the ports
//! its actions talk to. Every public operation only picks a target state
//! and returns [`HvStatus::Scheduled`]; the outcome is observed through the
//! progress tree, [`Session::status`] or the `wait_*` helpers.
//!
//! # 設計原則
//! - 呼び出しはブロックしない（ルートの置き換えのみ）
//! - エラーは Error 状態を経由して自己回復を試みる
//! - 短時間に `heal_tries` を超えるエラーが続いたら Fatal で止まる

mod builder;
mod config;
mod graph;
mod handlers;
mod heal;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

pub use self::builder::{SessionBuilder, SessionError};
pub use self::config::{ConfigError, SessionConfig};
pub use self::handlers::SessionFault;

use self::handlers::SessionCore;
use crate::domain::{HvStatus, SessionId, SessionState};
use crate::fsm::{lock, Fsm};
use crate::observability::FsmStatus;
use crate::progress::FiniteTask;

pub struct Session {
    core: Arc<SessionCore>,
    fsm: Fsm,
    progress: FiniteTask,
}

impl Session {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    pub fn id(&self) -> SessionId {
        self.core.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    /// Start the worker and load the real VM state.
    pub fn open(&self) -> Result<HvStatus, SessionError> {
        self.fsm.start()?;
        info!(session = %self.core.id, vm = %self.core.config.name, "opening session");
        Ok(self.schedule(SessionState::UpdateSession))
    }

    pub fn start(&self) -> HvStatus {
        self.schedule(SessionState::Running)
    }

    pub fn pause(&self) -> HvStatus {
        self.schedule(SessionState::Paused)
    }

    pub fn resume(&self) -> HvStatus {
        self.schedule(SessionState::Running)
    }

    /// Power the VM off, keeping it registered.
    pub fn stop(&self) -> HvStatus {
        self.schedule(SessionState::PoweredOff)
    }

    pub fn hibernate(&self) -> HvStatus {
        self.schedule(SessionState::Saved)
    }

    /// Power off and unregister the VM.
    pub fn close(&self) -> HvStatus {
        self.schedule(SessionState::Destroyed)
    }

    pub fn reset(&self) -> HvStatus {
        HvStatus::NotImplemented
    }

    pub fn set_execution_cap(&self, _cap: u32) -> HvStatus {
        HvStatus::NotImplemented
    }

    /// Stop the worker. A running action is interrupted at its next yield
    /// point; the VM itself is left as it is.
    pub fn abort(&self) {
        warn!(session = %self.core.id, "aborting session");
        self.fsm.stop();
    }

    fn schedule(&self, target: SessionState) -> HvStatus {
        if !self.fsm.goto(target.id()) {
            warn!(
                session = %self.core.id,
                ?target,
                current = ?self.state(),
                "no route to target; keeping the current one"
            );
        }
        HvStatus::Scheduled
    }

    /// Root of the session progress tree. Restarted on every new route.
    pub fn progress(&self) -> &FiniteTask {
        &self.progress
    }

    /// Where the machine is now.
    pub fn state(&self) -> Option<SessionState> {
        SessionState::from_id(self.fsm.current_state())
    }

    /// Where the machine is heading.
    pub fn target(&self) -> Option<SessionState> {
        SessionState::from_id(self.fsm.target_state())
    }

    pub fn status(&self) -> FsmStatus {
        self.fsm.status()
    }

    pub fn last_error(&self) -> Option<SessionFault> {
        lock(&self.core.last_error).clone()
    }

    pub fn wait_for(&self, state: SessionState, timeout: Option<Duration>) -> bool {
        self.fsm.wait_for(state.id(), timeout)
    }

    /// Block until nothing is queued or running.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        self.fsm.wait_inactive(timeout)
    }

    pub async fn wait_for_async(&self, state: SessionState, timeout: Option<Duration>) -> bool {
        self.fsm.wait_for_async(state.id(), timeout).await
    }

    pub async fn wait_idle_async(&self, timeout: Option<Duration>) -> bool {
        self.fsm.wait_inactive_async(timeout).await
    }

    /// The underlying lifecycle machine.
    pub fn fsm(&self) -> &Fsm {
        &self.fsm
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.core.id)
            .field("vm", &self.core.config.name)
            .field("fsm", &self.fsm)
            .finish()
    }
}
