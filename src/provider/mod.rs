//! Wallet provider adapter
//!
//! `WalletProvider` is the seam to whatever brokers account access and
//! signing. `ProviderAdapter` wraps an optional provider (absent means no
//! wallet was found) and owns the listener registrations made through it.

pub mod events;
pub mod memory;
pub mod rpc;

pub use events::{EventEmitter, Listener, Subscription};
pub use memory::InMemoryWallet;
pub use rpc::RpcWallet;

use crate::error::{Result, SessionError};
use crate::types::WalletEvent;
use async_trait::async_trait;
use ethers::types::{Address, Bytes, TxHash};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Account access, chain state and transaction transport of a wallet
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Ask the user to authorize accounts; the first entry is the selected one
    async fn request_accounts(&self) -> Result<Vec<Address>>;

    async fn chain_id(&self) -> Result<u64>;

    /// Register for `accountsChanged` / `chainChanged`
    fn subscribe(&self, listener: Listener) -> Subscription;

    /// Read-only call against current chain state
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;

    /// Sign and broadcast a transaction from `from`
    async fn send_transaction(&self, from: Address, to: Address, data: Bytes) -> Result<TxHash>;

    /// Wait for the receipt; `true` on success status
    async fn wait_for_receipt(&self, hash: TxHash) -> Result<bool>;
}

/// Shared wallet handle
pub type SharedWallet = Arc<dyn WalletProvider>;

/// Connect/subscribe front end over an optional wallet
pub struct ProviderAdapter {
    wallet: Option<SharedWallet>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ProviderAdapter {
    pub fn new(wallet: Option<SharedWallet>) -> Self {
        Self {
            wallet,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn wallet(&self) -> Result<&SharedWallet> {
        self.wallet.as_ref().ok_or(SessionError::NoWallet)
    }

    /// Request account access; returns the selected account and chain id
    pub async fn connect(&self) -> Result<(Address, u64)> {
        let wallet = self.wallet()?;

        let accounts = wallet.request_accounts().await?;
        let account = accounts.first().copied().ok_or(SessionError::UserRejected)?;
        let chain_id = wallet.chain_id().await?;

        info!("Wallet authorized {:?} on chain {}", account, chain_id);
        Ok((account, chain_id))
    }

    pub fn on_accounts_changed<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(Vec<Address>) + Send + Sync + 'static,
    {
        self.register(Arc::new(move |event| {
            if let WalletEvent::AccountsChanged(accounts) = event {
                handler(accounts.clone());
            }
        }))
    }

    pub fn on_chain_changed<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.register(Arc::new(move |event| {
            if let WalletEvent::ChainChanged(chain_id) = event {
                handler(*chain_id);
            }
        }))
    }

    fn register(&self, listener: Listener) -> Result<()> {
        let subscription = self.wallet()?.subscribe(listener);
        self.subscriptions.lock().push(subscription);
        Ok(())
    }

    /// Remove every listener registered through this adapter
    pub fn dispose(&self) {
        let removed: Vec<Subscription> = self.subscriptions.lock().drain(..).collect();
        if !removed.is_empty() {
            debug!("Disposing {} wallet listeners", removed.len());
        }
    }

    pub fn listener_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

impl Drop for ProviderAdapter {
    fn drop(&mut self) {
        self.dispose();
    }
}
