use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::error::SyncErrorKind;

/// What a caller learns about a sync run.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Success {
        trades_imported: usize,
        balance: Option<f64>,
        equity: Option<f64>,
    },
    Failure {
        error_kind: SyncErrorKind,
        message: String,
    },
}

impl SyncOutcome {
    pub fn failure(error_kind: SyncErrorKind) -> Self {
        Self::Failure {
            error_kind,
            message: error_kind.user_message().to_string(),
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub const fn error_kind(&self) -> Option<SyncErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error_kind, .. } => Some(*error_kind),
        }
    }
}

impl Serialize for SyncOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Success {
                trades_imported,
                balance,
                equity,
            } => {
                let mut state = serializer.serialize_struct("SyncOutcome", 4)?;
                state.serialize_field("success", &true)?;
                state.serialize_field("tradesImported", trades_imported)?;
                state.serialize_field("balance", balance)?;
                state.serialize_field("equity", equity)?;
                state.end()
            }
            Self::Failure {
                error_kind,
                message,
            } => {
                let mut state = serializer.serialize_struct("SyncOutcome", 3)?;
                state.serialize_field("success", &false)?;
                state.serialize_field("errorKind", error_kind)?;
                state.serialize_field("message", message)?;
                state.end()
            }
        }
    }
}
