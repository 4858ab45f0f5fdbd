//! JSON-RPC wallet backed by an ethers HTTP provider
//!
//! Accounts come from the node (`eth_requestAccounts`, EIP-1193 style wallets
//! such as Frame expose this over HTTP) or from a local private key. HTTP has
//! no push events, so account and chain changes are detected by polling.

use super::events::{EventEmitter, Listener, Subscription};
use super::WalletProvider;
use crate::config::WalletConfig;
use crate::error::{Result, SessionError};
use crate::types::WalletEvent;
use async_trait::async_trait;
use ethers::{
    middleware::SignerMiddleware,
    providers::{Http, Middleware, MiddlewareError, PendingTransaction, Provider},
    signers::{LocalWallet, Signer},
    types::{transaction::eip2718::TypedTransaction, Address, Bytes, TransactionRequest, TxHash, U64},
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// EIP-1193 "user rejected request"
const USER_REJECTED_CODE: i64 = 4001;
/// JSON-RPC "method not found": the node has no wallet behind it
const METHOD_NOT_FOUND_CODE: i64 = -32601;

fn classify<E: MiddlewareError>(err: E) -> SessionError {
    match err.as_error_response() {
        Some(resp) if resp.code == USER_REJECTED_CODE => SessionError::UserRejected,
        Some(resp) if resp.code == METHOD_NOT_FOUND_CODE => SessionError::NoWallet,
        _ => SessionError::Rpc(err.to_string()),
    }
}

/// Last polled chain and accounts; the first observation only sets the baseline
#[derive(Debug, Default)]
struct ChangeTracker {
    chain: Option<u64>,
    accounts: Option<Vec<Address>>,
}

impl ChangeTracker {
    fn chain(&mut self, id: u64) -> Option<WalletEvent> {
        let changed = self.chain.map_or(false, |prev| prev != id);
        self.chain = Some(id);
        changed.then_some(WalletEvent::ChainChanged(id))
    }

    fn accounts(&mut self, accounts: Vec<Address>) -> Option<WalletEvent> {
        let changed = self.accounts.as_ref().map_or(false, |prev| *prev != accounts);
        self.accounts = Some(accounts.clone());
        changed.then_some(WalletEvent::AccountsChanged(accounts))
    }

    fn reset(&mut self) {
        self.chain = None;
        self.accounts = None;
    }
}

/// Wallet over an HTTP JSON-RPC endpoint
pub struct RpcWallet {
    provider: Arc<Provider<Http>>,
    signer: Option<LocalWallet>,
    emitter: Arc<EventEmitter>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    event_poll_interval: Duration,
    confirmation_poll_interval: Duration,
}

impl RpcWallet {
    pub fn new(rpc_url: &str, config: &WalletConfig) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| SessionError::Rpc(format!("invalid rpc url {}: {}", rpc_url, e)))?;

        let signer = config
            .private_key
            .as_deref()
            .map(|key| key.trim_start_matches("0x").parse::<LocalWallet>())
            .transpose()
            .map_err(|e| SessionError::Binding(format!("invalid private key: {}", e)))?;

        if let Some(signer) = &signer {
            info!("Using local signer {:?}", signer.address());
        }

        Ok(Self {
            provider: Arc::new(provider),
            signer,
            emitter: Arc::new(EventEmitter::new()),
            watcher: Mutex::new(None),
            event_poll_interval: Duration::from_millis(config.event_poll_interval_ms.max(100)),
            confirmation_poll_interval: Duration::from_millis(
                config.confirmation_poll_interval_ms.max(100),
            ),
        })
    }

    /// Start the change watcher once, on the first subscription
    fn ensure_watcher(&self) {
        let mut watcher = self.watcher.lock();
        if watcher.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No tokio runtime; wallet change events disabled");
                return;
            }
        };

        let provider = self.provider.clone();
        let emitter = Arc::downgrade(&self.emitter);
        let remote_accounts = self.signer.is_none();
        let period = self.event_poll_interval;

        *watcher = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut tracker = ChangeTracker::default();

            loop {
                ticker.tick().await;
                let Some(live) = emitter.upgrade() else { break };
                if live.listener_count() == 0 {
                    // Whoever subscribes next starts from a fresh baseline
                    tracker.reset();
                    continue;
                }

                match provider.get_chainid().await {
                    Ok(id) => {
                        if let Some(event) = tracker.chain(id.as_u64()) {
                            debug!("{:?}", event);
                            live.emit(&event);
                        }
                    }
                    Err(e) => warn!("eth_chainId poll failed: {}", e),
                }

                if remote_accounts {
                    match provider.get_accounts().await {
                        Ok(accounts) => {
                            if let Some(event) = tracker.accounts(accounts) {
                                debug!("{:?}", event);
                                live.emit(&event);
                            }
                        }
                        Err(e) => warn!("eth_accounts poll failed: {}", e),
                    }
                }
            }
        }));
    }
}

impl Drop for RpcWallet {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl WalletProvider for RpcWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>> {
        if let Some(signer) = &self.signer {
            return Ok(vec![signer.address()]);
        }
        self.provider
            .request::<_, Vec<Address>>("eth_requestAccounts", ())
            .await
            .map_err(classify)
    }

    async fn chain_id(&self) -> Result<u64> {
        let id = self.provider.get_chainid().await.map_err(classify)?;
        Ok(id.as_u64())
    }

    fn subscribe(&self, listener: Listener) -> Subscription {
        let subscription = self.emitter.subscribe(listener);
        self.ensure_watcher();
        subscription
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.provider.call(&tx, None).await.map_err(classify)
    }

    async fn send_transaction(&self, from: Address, to: Address, data: Bytes) -> Result<TxHash> {
        let request = TransactionRequest::new().from(from).to(to).data(data);

        match &self.signer {
            Some(signer) => {
                if signer.address() != from {
                    return Err(SessionError::Binding(format!(
                        "local signer does not control {:?}",
                        from
                    )));
                }
                let chain_id = self.chain_id().await?;
                let client =
                    SignerMiddleware::new(self.provider.clone(), signer.clone().with_chain_id(chain_id));
                let pending = client.send_transaction(request, None).await.map_err(classify)?;
                Ok(pending.tx_hash())
            }
            None => {
                let pending = self
                    .provider
                    .send_transaction(request, None)
                    .await
                    .map_err(classify)?;
                Ok(pending.tx_hash())
            }
        }
    }

    async fn wait_for_receipt(&self, hash: TxHash) -> Result<bool> {
        let receipt = PendingTransaction::new(hash, self.provider.as_ref())
            .interval(self.confirmation_poll_interval)
            .await
            .map_err(classify)?
            .ok_or_else(|| SessionError::Rpc(format!("transaction {:?} dropped", hash)))?;

        Ok(receipt.status == Some(U64::from(1)))
    }
}
