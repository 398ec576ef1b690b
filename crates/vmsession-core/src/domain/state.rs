//! State - セッションの状態とアクションの ID
//!
//! Graph node ids are plain integers (`StateId`) so that any FSM can be
//! declared; `SessionState` names the ids used by the VM session graph.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::fsm::StateId;

/// Node ids of the VM session lifecycle graph.
///
/// Ids below 100 are pure state markers, ids from 100 up carry an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Entry,
    Error,
    Destroyed,
    PoweredOff,
    Saved,
    Paused,
    Running,

    Initialize,
    UpdateSession,
    HandleError,
    CureError,
    CreateVm,
    ConfigureVm,
    DownloadMedia,
    PrepareBootMedium,
    ReleaseBootMedium,
    DestroyVm,
    PowerOffVm,
    DiscardState,
    Fatal,
    StartVm,
    SaveState,
    PauseVm,
    ResumeVm,
}

impl SessionState {
    pub const ALL: [SessionState; 24] = [
        SessionState::Entry,
        SessionState::Error,
        SessionState::Destroyed,
        SessionState::PoweredOff,
        SessionState::Saved,
        SessionState::Paused,
        SessionState::Running,
        SessionState::Initialize,
        SessionState::UpdateSession,
        SessionState::HandleError,
        SessionState::CureError,
        SessionState::CreateVm,
        SessionState::ConfigureVm,
        SessionState::DownloadMedia,
        SessionState::PrepareBootMedium,
        SessionState::ReleaseBootMedium,
        SessionState::DestroyVm,
        SessionState::PowerOffVm,
        SessionState::DiscardState,
        SessionState::Fatal,
        SessionState::StartVm,
        SessionState::SaveState,
        SessionState::PauseVm,
        SessionState::ResumeVm,
    ];

    pub fn id(self) -> StateId {
        match self {
            SessionState::Entry => 1,
            SessionState::Error => 2,
            SessionState::Destroyed => 3,
            SessionState::PoweredOff => 4,
            SessionState::Saved => 5,
            SessionState::Paused => 6,
            SessionState::Running => 7,
            SessionState::Initialize => 100,
            SessionState::UpdateSession => 101,
            SessionState::HandleError => 102,
            SessionState::CureError => 103,
            SessionState::CreateVm => 104,
            SessionState::ConfigureVm => 105,
            SessionState::DownloadMedia => 106,
            SessionState::PrepareBootMedium => 107,
            SessionState::ReleaseBootMedium => 108,
            SessionState::DestroyVm => 109,
            SessionState::PowerOffVm => 110,
            SessionState::DiscardState => 111,
            SessionState::Fatal => 112,
            SessionState::StartVm => 113,
            SessionState::SaveState => 114,
            SessionState::PauseVm => 115,
            SessionState::ResumeVm => 116,
        }
    }

    pub fn from_id(id: StateId) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.id() == id)
    }

    /// Is this a resting state (no action attached)?
    pub fn is_marker(self) -> bool {
        self.id() < 100
    }

    /// snake_case name, as used by serde.
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Entry => "entry",
            SessionState::Error => "error",
            SessionState::Destroyed => "destroyed",
            SessionState::PoweredOff => "powered_off",
            SessionState::Saved => "saved",
            SessionState::Paused => "paused",
            SessionState::Running => "running",
            SessionState::Initialize => "initialize",
            SessionState::UpdateSession => "update_session",
            SessionState::HandleError => "handle_error",
            SessionState::CureError => "cure_error",
            SessionState::CreateVm => "create_vm",
            SessionState::ConfigureVm => "configure_vm",
            SessionState::DownloadMedia => "download_media",
            SessionState::PrepareBootMedium => "prepare_boot_medium",
            SessionState::ReleaseBootMedium => "release_boot_medium",
            SessionState::DestroyVm => "destroy_vm",
            SessionState::PowerOffVm => "power_off_vm",
            SessionState::DiscardState => "discard_state",
            SessionState::Fatal => "fatal",
            SessionState::StartVm => "start_vm",
            SessionState::SaveState => "save_state",
            SessionState::PauseVm => "pause_vm",
            SessionState::ResumeVm => "resume_vm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown session state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for SessionState {
    type Err = UnknownState;

    /// Accepts the snake_case name or the numeric id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(id) = s.parse::<StateId>() {
            return Self::from_id(id).ok_or_else(|| UnknownState(s.to_string()));
        }
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
