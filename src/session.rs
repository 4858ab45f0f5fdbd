//! Session state store
//!
//! Owns the wallet adapter and the current contract bindings. State moves
//! `Disconnected → Connecting → Connected ⇄ Rebinding → Disconnected`.
//!
//! Every transition bumps a generation counter under the transition lock.
//! A rebuild remembers the generation it started at and installs its
//! bindings only if nothing happened since, so the latest wallet event always
//! wins and obsolete rebuilds are discarded whole.

use crate::binding::{BindingFactory, Bindings, InterfaceDescriptor};
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::provider::{ProviderAdapter, SharedWallet};
use crate::types::{Notification, SessionState};
use ethers::abi::Token;
use ethers::types::{Address, U256};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Functions the dispatchers and the read-model call on each contract
const STAKING_FUNCTIONS: &[&str] = &[
    "stake",
    "withdrawStakedTokens",
    "getReward",
    "earned",
    "stakedBalance",
    "REWARD_RATE",
];
const TOKEN_FUNCTIONS: &[&str] = &["approve", "allowance", "balanceOf"];

/// What observers see of the session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub account: Option<Address>,
    pub chain_id: Option<u64>,
    pub bindings: Option<Arc<Bindings>>,
    pub generation: u64,
}

impl SessionSnapshot {
    fn disconnected(generation: u64) -> Self {
        Self {
            state: SessionState::Disconnected,
            account: None,
            chain_id: None,
            bindings: None,
            generation,
        }
    }
}

/// Account and chain the wallet last reported
#[derive(Debug, Clone, Copy, Default)]
struct Target {
    account: Option<Address>,
    chain_id: Option<u64>,
}

struct Inner {
    config: Arc<Config>,
    adapter: ProviderAdapter,
    factory: Option<BindingFactory>,
    staking_interface: Arc<InterfaceDescriptor>,
    token_interface: Arc<InterfaceDescriptor>,
    generation: AtomicU64,
    /// Transition lock; generation bumps and snapshot publishes happen under it
    target: Mutex<Target>,
    snapshot: watch::Sender<SessionSnapshot>,
    notifications: broadcast::Sender<Notification>,
}

/// Wallet session handle; cheap to clone, all clones share one session
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Build a disconnected session; `wallet` is `None` when no wallet was found
    pub fn create(config: Arc<Config>, wallet: Option<SharedWallet>) -> Result<Self> {
        let staking_interface = Arc::new(InterfaceDescriptor::parse(&config.interfaces.staking)?);
        let token_interface = Arc::new(InterfaceDescriptor::parse(&config.interfaces.stake_token)?);
        staking_interface.require(STAKING_FUNCTIONS)?;
        token_interface.require(TOKEN_FUNCTIONS)?;
        let (snapshot, _) = watch::channel(SessionSnapshot::disconnected(0));
        let (notifications, _) = broadcast::channel(64);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                factory: wallet.clone().map(BindingFactory::new),
                adapter: ProviderAdapter::new(wallet),
                staking_interface,
                token_interface,
                generation: AtomicU64::new(0),
                target: Mutex::new(Target::default()),
                snapshot,
                notifications,
            }),
        })
    }

    /// User-initiated connect. On failure the session is left `Disconnected`.
    pub async fn connect(&self) -> Result<()> {
        let generation = self.inner.transition(SessionState::Connecting, |_| {});
        info!("Connecting wallet (generation {})", generation);

        let (account, chain_id) = match self.inner.adapter.connect().await {
            Ok(authorized) => authorized,
            Err(e) => {
                self.inner.fail(generation, Notification::ConnectFailed(e.to_string()));
                return Err(e);
            }
        };

        {
            let mut target = self.inner.target.lock();
            if self.inner.current() != generation {
                // A disconnect or wallet event got there first; it owns the session now
                debug!("Connect of generation {} superseded", generation);
                return match self.inner.snapshot.borrow().state {
                    SessionState::Disconnected => Err(SessionError::NotConnected),
                    _ => Ok(()),
                };
            }
            *target = Target {
                account: Some(account),
                chain_id: Some(chain_id),
            };
            // Under the transition lock so a concurrent disconnect cannot miss them
            if self.inner.adapter.listener_count() == 0 {
                self.inner.listen()?;
            }
        }

        Inner::rebuild(self.inner.clone(), generation, Notification::ConnectFailed).await
    }

    /// User-initiated disconnect: drop bindings and stop listening
    pub fn disconnect(&self) {
        let mut target = self.inner.target.lock();
        self.inner.adapter.dispose();
        *target = Target::default();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.snapshot.send_replace(SessionSnapshot::disconnected(generation));
        info!("Session disconnected (generation {})", generation);
    }

    /// End of life for the session
    pub fn teardown(self) {
        self.disconnect();
        debug!("Session torn down");
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.snapshot.borrow().state
    }

    /// Current bindings, only while `Connected`
    pub fn bindings(&self) -> Option<Arc<Bindings>> {
        let snapshot = self.inner.snapshot.borrow();
        if snapshot.state.is_connected() {
            snapshot.bindings.clone()
        } else {
            None
        }
    }

    pub fn require_bindings(&self) -> Result<Arc<Bindings>> {
        self.bindings().ok_or(SessionError::NotConnected)
    }

    /// Whether bindings built at `generation` are still the live ones
    pub fn is_current(&self, generation: u64) -> bool {
        self.inner.current() == generation
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    pub fn notify(&self, notification: Notification) {
        self.inner.notify(notification);
    }

    pub fn listener_count(&self) -> usize {
        self.inner.adapter.listener_count()
    }
}

impl Inner {
    fn current(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn notify(&self, notification: Notification) {
        // Nobody listening is fine
        let _ = self.notifications.send(notification);
    }

    /// Enter `state`, dropping bindings; returns the new generation
    fn transition(&self, state: SessionState, update: impl FnOnce(&mut Target)) -> u64 {
        let mut target = self.target.lock();
        update(&mut target);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.snapshot.send_replace(SessionSnapshot {
            state,
            account: target.account,
            chain_id: target.chain_id,
            bindings: None,
            generation,
        });
        generation
    }

    /// Roll back to `Disconnected` if `generation` is still current
    fn fail(&self, generation: u64, notification: Notification) {
        {
            let _target = self.target.lock();
            if self.current() != generation {
                debug!("Ignoring failure of superseded generation {}", generation);
                return;
            }
            self.snapshot.send_replace(SessionSnapshot::disconnected(generation));
        }
        warn!("Session failed: {:?}", notification);
        self.notify(notification);
    }

    fn listen(self: &Arc<Self>) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|_| SessionError::Binding("session requires a tokio runtime".to_string()))?;

        let weak: Weak<Inner> = Arc::downgrade(self);
        let rt = runtime.clone();
        self.adapter.on_accounts_changed(move |accounts| {
            if let Some(inner) = weak.upgrade() {
                Inner::on_wallet_change(&inner, &rt, |target| {
                    target.account = accounts.first().copied();
                });
            }
        })?;

        let weak: Weak<Inner> = Arc::downgrade(self);
        self.adapter.on_chain_changed(move |chain_id| {
            if let Some(inner) = weak.upgrade() {
                Inner::on_wallet_change(&inner, &runtime, |target| {
                    target.chain_id = Some(chain_id);
                });
            }
        })?;

        Ok(())
    }

    /// Synchronously invalidate bindings, then rebuild in the background
    fn on_wallet_change(inner: &Arc<Inner>, runtime: &Handle, update: impl FnOnce(&mut Target)) {
        let generation = inner.transition(SessionState::Rebinding, update);
        debug!("Wallet changed; rebinding at generation {}", generation);

        let inner = inner.clone();
        runtime.spawn(async move {
            if let Err(e) = Inner::rebuild(inner, generation, Notification::RebindFailed).await {
                debug!("Rebind at generation {} failed: {}", generation, e);
            }
        });
    }

    async fn rebuild(
        inner: Arc<Inner>,
        generation: u64,
        on_error: fn(String) -> Notification,
    ) -> Result<()> {
        let target = *inner.target.lock();

        let Some(account) = target.account else {
            // Wallet locked or every account revoked
            let _guard = inner.target.lock();
            if inner.current() == generation {
                inner.snapshot.send_replace(SessionSnapshot::disconnected(generation));
                info!("Wallet exposes no account; session disconnected");
            }
            return Ok(());
        };

        let bindings = match inner.bind_all(account, target.chain_id, generation).await {
            Ok(bindings) => bindings,
            Err(e) => {
                inner.fail(generation, on_error(e.to_string()));
                return Err(e);
            }
        };

        let _guard = inner.target.lock();
        if inner.current() != generation {
            debug!("Discarding bindings of superseded generation {}", generation);
            return Ok(());
        }
        info!(
            "Session connected: account {:?} chain {} (generation {})",
            bindings.account, bindings.chain_id, generation
        );
        inner.snapshot.send_replace(SessionSnapshot {
            state: SessionState::Connected,
            account: Some(bindings.account),
            chain_id: Some(bindings.chain_id),
            bindings: Some(Arc::new(bindings)),
            generation,
        });
        Ok(())
    }

    async fn bind_all(&self, account: Address, chain_id: Option<u64>, generation: u64) -> Result<Bindings> {
        let factory = self.factory.as_ref().ok_or(SessionError::NoWallet)?;
        let chain_id =
            chain_id.ok_or_else(|| SessionError::Binding("wallet reported no chain".to_string()))?;
        let chain = self
            .config
            .chain(chain_id)
            .ok_or_else(|| SessionError::Binding(format!("chain {} is not supported", chain_id)))?;
        let (staking_address, token_address) = chain.deployment().ok_or_else(|| {
            SessionError::Binding(format!("no staking deployment configured on {}", chain.name))
        })?;

        let staking = factory.bind(staking_address, self.staking_interface.clone(), Some(account))?;
        let token = factory.bind(token_address, self.token_interface.clone(), Some(account))?;

        let decimals = match chain.token_decimals {
            Some(decimals) => decimals,
            None => read_decimals(&token).await?,
        };

        Ok(Bindings {
            staking,
            token,
            account,
            chain_id,
            decimals,
            generation,
        })
    }
}

async fn read_decimals(token: &crate::binding::ContractHandle) -> Result<u8> {
    let out = token.read("decimals", &[]).await?;
    match out.first() {
        Some(Token::Uint(value)) if *value <= U256::from(77u8) => Ok(value.as_u32() as u8),
        other => Err(SessionError::Rpc(format!("unexpected decimals() result {:?}", other))),
    }
}
