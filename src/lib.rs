//! Staking wallet session
//!
//! Keeps a wallet connection, the contract bindings derived from it, and a
//! polled view of staking values consistent with whatever account and chain
//! the wallet currently reports.
//!
//! ## Architecture
//! - Provider: wallet seam (JSON-RPC or in-memory) with event subscription
//! - Binding: contract handles over human-readable interfaces
//! - Session: account/chain state machine, rebinding on every wallet event
//! - Read-model: per-metric polling, reset on every rebind
//! - Actions: approve, stake, withdraw, claim with dependent refreshes
//! - View: plain-text dashboard

pub mod actions;
pub mod amount;
pub mod binding;
pub mod config;
pub mod error;
pub mod logging;
pub mod provider;
pub mod read_model;
pub mod session;
pub mod types;
pub mod view;

pub use actions::{ActionDispatcher, Actions};
pub use config::Config;
pub use error::{Result, SessionError};
pub use provider::{InMemoryWallet, RpcWallet, SharedWallet, WalletProvider};
pub use read_model::ReadModel;
pub use session::{Session, SessionSnapshot};
pub use types::{ActionKind, Metric, Notification, SessionState, TxPhase, TxStatus};
pub use view::Dashboard;

use std::sync::Arc;
use tracing::info;

/// Session, read-model and dispatchers wired together
pub struct StakingClient {
    config: Arc<Config>,
    session: Session,
    read_model: Arc<ReadModel>,
    actions: Arc<Actions>,
}

impl StakingClient {
    pub fn new(config: Config, wallet: Option<SharedWallet>) -> Result<Self> {
        let config = Arc::new(config);
        let session = Session::create(config.clone(), wallet)?;
        let read_model = ReadModel::new(session.clone(), &config.polling);
        let actions = Arc::new(Actions::new(session.clone(), read_model.clone()));

        Ok(Self {
            config,
            session,
            read_model,
            actions,
        })
    }

    /// Start following the session, then connect the wallet
    pub async fn start(&self) -> Result<()> {
        info!("Starting staking client");
        self.read_model.start();
        self.session.connect().await
    }

    pub fn stop(&self) {
        self.session.disconnect();
        self.read_model.stop();
        info!("Staking client stopped");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn read_model(&self) -> &Arc<ReadModel> {
        &self.read_model
    }

    pub fn actions(&self) -> &Arc<Actions> {
        &self.actions
    }

    pub fn dispatcher(&self, kind: ActionKind) -> &ActionDispatcher {
        self.actions.get(kind)
    }

    pub fn dashboard(&self) -> Dashboard {
        Dashboard::capture(&self.session.snapshot(), &self.read_model)
    }
}

impl Drop for StakingClient {
    fn drop(&mut self) {
        self.read_model.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, U256};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_client_lifecycle() {
        let account = Address::repeat_byte(0xaa);
        let wallet = Arc::new(InMemoryWallet::new(types::SEPOLIA_CHAIN_ID).with_account(account));
        wallet.mint(account, U256::exp10(18) * 5);
        let config = Config::default().with_deployment(
            types::SEPOLIA_CHAIN_ID,
            &format!("{:?}", wallet.staking_address()),
            &format!("{:?}", wallet.token_address()),
        );

        let client = StakingClient::new(config, Some(wallet.clone())).unwrap();
        client.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(client.session().state(), SessionState::Connected);
        assert!(client.dashboard().to_string().contains("Wallet Balance: 5"));

        client.stop();
        assert_eq!(client.session().state(), SessionState::Disconnected);
        assert_eq!(wallet.listener_count(), 0);
        assert!(client.dashboard().to_string().contains("Connect Account"));
    }
}
