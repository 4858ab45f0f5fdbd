//! Error taxonomy for wallet sessions, bindings and actions

use ethers::types::TxHash;
use thiserror::Error;

/// Every failure the session layer can report.
///
/// None of these are fatal: connection and binding errors roll the session
/// back, polling errors keep the last value, action errors leave state as it
/// was. The user retries by repeating the action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No wallet provider available")]
    NoWallet,

    #[error("User rejected the request")]
    UserRejected,

    #[error("Invalid amount {input:?}: {reason}")]
    InvalidAmount { input: String, reason: String },

    #[error("Binding error: {0}")]
    Binding(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Transaction {hash:?} reverted")]
    TransactionReverted { hash: TxHash },

    #[error("Session is not connected")]
    NotConnected,

    #[error("A {0} transaction is already outstanding")]
    ActionInFlight(String),
}

impl SessionError {
    pub fn invalid_amount(input: &str, reason: impl Into<String>) -> Self {
        SessionError::InvalidAmount {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the user can fix this by trying again.
    pub fn is_user_retryable(&self) -> bool {
        !matches!(self, SessionError::NoWallet)
    }
}

impl From<ethers::abi::Error> for SessionError {
    fn from(err: ethers::abi::Error) -> Self {
        SessionError::Binding(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
