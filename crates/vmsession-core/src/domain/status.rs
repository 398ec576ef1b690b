//! Status taxonomy shared by the hypervisor and download adapters.
//!
//! Every adapter call reports one of these small integer codes. Positive
//! values are non-error outcomes, negative values are failures.

use serde::{Deserialize, Serialize};

use crate::fsm::ActionError;

/// Result code of an adapter or session operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HvStatus {
    #[error("already exists")]
    AlreadyExists,
    #[error("scheduled")]
    Scheduled,
    #[error("ok")]
    Ok,
    #[error("create error")]
    CreateError,
    #[error("modify error")]
    ModifyError,
    #[error("control error")]
    ControlError,
    #[error("delete error")]
    DeleteError,
    #[error("query error")]
    QueryError,
    #[error("i/o error")]
    IoError,
    #[error("external error")]
    ExternalError,
    #[error("invalid state")]
    InvalidState,
    #[error("not found")]
    NotFound,
    #[error("not allowed")]
    NotAllowed,
    #[error("not supported")]
    NotSupported,
    #[error("not validated")]
    NotValidated,
    #[error("not trusted")]
    NotTrusted,
    #[error("still working")]
    StillWorking,
    #[error("usage error")]
    UsageError,
    #[error("not implemented")]
    NotImplemented,
}

impl HvStatus {
    const TABLE: [(HvStatus, i32); 19] = [
        (HvStatus::AlreadyExists, 2),
        (HvStatus::Scheduled, 1),
        (HvStatus::Ok, 0),
        (HvStatus::CreateError, -1),
        (HvStatus::ModifyError, -2),
        (HvStatus::ControlError, -3),
        (HvStatus::DeleteError, -4),
        (HvStatus::QueryError, -5),
        (HvStatus::IoError, -6),
        (HvStatus::ExternalError, -7),
        (HvStatus::InvalidState, -8),
        (HvStatus::NotFound, -9),
        (HvStatus::NotAllowed, -10),
        (HvStatus::NotSupported, -11),
        (HvStatus::NotValidated, -12),
        (HvStatus::NotTrusted, -13),
        (HvStatus::StillWorking, -14),
        (HvStatus::UsageError, -99),
        (HvStatus::NotImplemented, -100),
    ];

    /// Numeric wire value.
    pub fn code(self) -> i32 {
        Self::TABLE
            .iter()
            .find(|(status, _)| *status == self)
            .map(|(_, code)| *code)
            .unwrap_or(-100)
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(status, _)| *status)
    }

    /// OK, scheduled and already-exists are all successful outcomes.
    pub fn is_success(self) -> bool {
        self.code() >= 0
    }

    /// Failures that may go away by running the same command again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::CreateError
                | Self::ModifyError
                | Self::ControlError
                | Self::DeleteError
                | Self::QueryError
                | Self::IoError
                | Self::ExternalError
                | Self::StillWorking
        )
    }
}

/// Lets actions propagate adapter failures with `?`.
impl From<HvStatus> for ActionError {
    fn from(status: HvStatus) -> Self {
        ActionError::failed(status.to_string(), status.code())
    }
}
