//! Core types shared across the session, read-model and actions

use ethers::types::{Address, TxHash};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sepolia testnet, the chain the staking contracts were deployed on
pub const SEPOLIA_CHAIN_ID: u64 = 11155111;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Rebinding,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

/// Events pushed by a wallet provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
}

/// On-chain values tracked by the read-model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    StakedBalance,
    RewardRate,
    EarnedReward,
    TokenBalance,
    Allowance,
}

impl Metric {
    pub fn all() -> Vec<Self> {
        vec![
            Self::StakedBalance,
            Self::RewardRate,
            Self::EarnedReward,
            Self::TokenBalance,
            Self::Allowance,
        ]
    }

    pub fn label(&self) -> &'static str {
        match self {
            Metric::StakedBalance => "Staked Amount",
            Metric::RewardRate => "Reward Rate",
            Metric::EarnedReward => "Earned Reward",
            Metric::TokenBalance => "Wallet Balance",
            Metric::Allowance => "Allowance",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// User-triggered write operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Approve,
    Stake,
    Withdraw,
    Claim,
}

impl ActionKind {
    /// Whether the action takes a human-entered amount
    pub fn takes_amount(&self) -> bool {
        !matches!(self, ActionKind::Claim)
    }

    /// Read-model entries invalidated by a confirmed transaction of this kind
    pub fn dependent_metrics(&self) -> Vec<Metric> {
        match self {
            ActionKind::Approve => vec![Metric::Allowance],
            ActionKind::Stake | ActionKind::Withdraw => vec![
                Metric::StakedBalance,
                Metric::TokenBalance,
                Metric::Allowance,
            ],
            ActionKind::Claim => vec![Metric::EarnedReward, Metric::TokenBalance],
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Approve => "approve",
            ActionKind::Stake => "stake",
            ActionKind::Withdraw => "withdraw",
            ActionKind::Claim => "claim",
        };
        f.write_str(name)
    }
}

/// Transaction outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Submitted write operation
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub kind: ActionKind,
    pub hash: TxHash,
    pub status: TxStatus,
}

/// Observable phases of a dispatched action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxPhase {
    Submitted { kind: ActionKind, hash: TxHash },
    Confirmed { kind: ActionKind, hash: TxHash },
    Reverted { kind: ActionKind, hash: TxHash },
}

/// One-shot, non-blocking notices for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ConnectFailed(String),
    RebindFailed(String),
    PollFailed { metric: Metric, error: String },
    ActionFailed { kind: ActionKind, error: String },
}

/// Human name of a chain, as shown in the navigation bar
pub fn network_name(chain_id: Option<u64>) -> &'static str {
    match chain_id {
        None => "Not connected",
        Some(SEPOLIA_CHAIN_ID) => "Sepolia",
        Some(_) => "Network Not Detected",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_name() {
        assert_eq!(network_name(None), "Not connected");
        assert_eq!(network_name(Some(11155111)), "Sepolia");
        assert_eq!(network_name(Some(1)), "Network Not Detected");
    }

    #[test]
    fn test_stake_invalidates_staked_balance() {
        assert!(ActionKind::Stake.dependent_metrics().contains(&Metric::StakedBalance));
        assert!(!ActionKind::Approve.dependent_metrics().contains(&Metric::StakedBalance));
    }
}
