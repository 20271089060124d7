use foreman_core::{BackendError, CostExceeded};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid response after {attempts} attempts: {last_error}")]
    InvalidResponse { attempts: u32, last_error: String },

    #[error("no consensus: {confirm} matching answers not reached in {out_of} attempts")]
    NoConfirmation { confirm: u32, out_of: u32 },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid response schema: {0}")]
    Schema(String),

    #[error(transparent)]
    Aborted(#[from] CostExceeded),
}

impl From<BackendError> for GatewayError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Transport(message) => Self::Backend(message),
            BackendError::Aborted(cost) => Self::Aborted(cost),
        }
    }
}

impl GatewayError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidResponse { .. } => "invalid_response",
            Self::NoConfirmation { .. } => "no_confirmation",
            Self::Backend(_) => "backend",
            Self::Schema(_) => "schema",
            Self::Aborted(_) => "aborted",
        }
    }
}
