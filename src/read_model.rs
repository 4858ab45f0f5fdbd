//! Polling read-model
//!
//! One polling task per metric while the session is `Connected`. Tasks are
//! aborted as soon as the session leaves that generation, and every read is
//! gated on the generation still being current, so nothing is read through
//! stale bindings. A failed read keeps the previous value.

use crate::amount::{format_amount, format_fixed};
use crate::binding::Bindings;
use crate::config::PollingConfig;
use crate::error::{Result, SessionError};
use crate::session::{Session, SessionSnapshot};
use crate::types::{Metric, Notification};
use dashmap::DashMap;
use ethers::abi::Token;
use ethers::types::U256;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Last known value of one metric
#[derive(Debug, Clone)]
pub struct ReadModelEntry {
    pub metric: Metric,
    /// `None` until the first successful read after a rebuild
    pub value: Option<U256>,
    pub fetched_at: Option<Instant>,
    /// Set when a confirmed transaction made the value outdated
    pub stale: bool,
    pub last_error: Option<String>,
    pub decimals: u8,
}

impl ReadModelEntry {
    fn placeholder(metric: Metric) -> Self {
        Self {
            metric,
            value: None,
            fetched_at: None,
            stale: true,
            last_error: None,
            decimals: 18,
        }
    }

    /// Presentation value; `"0"` until fetched
    pub fn display(&self) -> String {
        let value = self.value.unwrap_or_default();
        match self.metric {
            Metric::EarnedReward => format_fixed(value, self.decimals, 2),
            _ if self.value.is_none() => "0".to_string(),
            _ => format_amount(value, self.decimals),
        }
    }
}

/// Issue the view call behind a metric
pub async fn read_metric(metric: Metric, bindings: &Bindings) -> Result<U256> {
    let account = Token::Address(bindings.account);
    let (handle, function, args) = match metric {
        Metric::StakedBalance => (&bindings.staking, "stakedBalance", vec![account]),
        Metric::RewardRate => (&bindings.staking, "REWARD_RATE", vec![]),
        Metric::EarnedReward => (&bindings.staking, "earned", vec![account]),
        Metric::TokenBalance => (&bindings.token, "balanceOf", vec![account]),
        Metric::Allowance => (
            &bindings.token,
            "allowance",
            vec![account, Token::Address(bindings.staking.address())],
        ),
    };

    let out = handle.read(function, &args).await?;
    match out.into_iter().next() {
        Some(Token::Uint(value)) => Ok(value),
        other => Err(SessionError::Rpc(format!("{} returned {:?}", function, other))),
    }
}

/// Polled view values, published to presentation
pub struct ReadModel {
    session: Session,
    metrics: Vec<Metric>,
    interval: Duration,
    entries: DashMap<Metric, ReadModelEntry>,
    /// Generation the running poll tasks were started for
    active_generation: Mutex<Option<u64>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    version: watch::Sender<u64>,
}

impl ReadModel {
    pub fn new(session: Session, config: &PollingConfig) -> Arc<Self> {
        let entries = DashMap::new();
        for metric in &config.metrics {
            entries.insert(*metric, ReadModelEntry::placeholder(*metric));
        }
        let (version, _) = watch::channel(0);

        Arc::new(Self {
            session,
            metrics: config.metrics.clone(),
            interval: Duration::from_millis(config.interval_ms),
            entries,
            active_generation: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
            version,
        })
    }

    /// Follow the session: start polling on `Connected`, stop on anything else
    pub fn start(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return;
        }

        let model = self.clone();
        let mut updates = self.session.subscribe();
        *supervisor = Some(tokio::spawn(async move {
            loop {
                let snapshot = updates.borrow_and_update().clone();
                model.on_session(&snapshot);
                if updates.changed().await.is_err() {
                    break;
                }
            }
            model.stop_polling();
        }));
        info!("Read-model started ({} metrics every {:?})", self.metrics.len(), self.interval);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        self.stop_polling();
        *self.active_generation.lock() = None;
    }

    fn on_session(self: &Arc<Self>, snapshot: &SessionSnapshot) {
        let live = snapshot
            .bindings
            .as_ref()
            .filter(|_| snapshot.state.is_connected());

        let mut active = self.active_generation.lock();
        match live {
            Some(bindings) if *active == Some(bindings.generation) => {}
            Some(bindings) => {
                self.stop_polling();
                self.reset();
                *active = Some(bindings.generation);

                let mut tasks = self.tasks.lock();
                for metric in &self.metrics {
                    tasks.push(tokio::spawn(self.clone().poll(*metric, bindings.clone())));
                }
                debug!("Polling started for generation {}", bindings.generation);
            }
            None => {
                if active.take().is_some() {
                    self.stop_polling();
                    self.reset();
                    debug!("Polling stopped ({:?})", snapshot.state);
                }
            }
        }
    }

    fn stop_polling(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Back to placeholders
    fn reset(&self) {
        for mut entry in self.entries.iter_mut() {
            let metric = entry.metric;
            *entry = ReadModelEntry::placeholder(metric);
        }
        self.bump();
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    async fn poll(self: Arc<Self>, metric: Metric, bindings: Arc<Bindings>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.session.is_current(bindings.generation) {
                break;
            }
            // Failures are recorded and notified inside fetch; keep ticking
            let _ = self.fetch(metric, &bindings).await;
        }
    }

    /// One guarded read of `metric`, applied to its entry
    async fn fetch(&self, metric: Metric, bindings: &Bindings) -> Result<U256> {
        if !self.session.is_current(bindings.generation) {
            return Err(SessionError::NotConnected);
        }

        let result = read_metric(metric, bindings).await;

        // Checked while holding the entry: a rebind bumps the generation before
        // its reset, so the reset either sees this write or this check fails
        let mut entry = self
            .entries
            .entry(metric)
            .or_insert_with(|| ReadModelEntry::placeholder(metric));
        if !self.session.is_current(bindings.generation) {
            drop(entry);
            debug!("Dropping {} read from superseded generation {}", metric, bindings.generation);
            return Err(SessionError::NotConnected);
        }
        match result {
            Ok(value) => {
                entry.value = Some(value);
                entry.fetched_at = Some(Instant::now());
                entry.stale = false;
                entry.last_error = None;
                entry.decimals = bindings.decimals;
                drop(entry);
                self.bump();
                Ok(value)
            }
            Err(e) => {
                entry.last_error = Some(e.to_string());
                drop(entry);
                warn!("Reading {} failed: {}", metric, e);
                self.session.notify(Notification::PollFailed {
                    metric,
                    error: e.to_string(),
                });
                self.bump();
                Err(e)
            }
        }
    }

    /// Flag entries as outdated without dropping their values
    pub fn mark_stale(&self, metrics: &[Metric]) {
        for metric in metrics {
            if let Some(mut entry) = self.entries.get_mut(metric) {
                entry.stale = true;
            }
        }
        self.bump();
    }

    /// Out-of-band read of `metrics` against the current bindings
    pub async fn refresh(&self, metrics: &[Metric]) -> Result<()> {
        let bindings = self.session.require_bindings()?;
        self.refresh_with(&bindings, metrics).await
    }

    /// Out-of-band read through specific bindings; skipped if they are outdated
    pub async fn refresh_with(&self, bindings: &Bindings, metrics: &[Metric]) -> Result<()> {
        if !self.session.is_current(bindings.generation) {
            return Err(SessionError::NotConnected);
        }
        self.mark_stale(metrics);
        let reads = metrics.iter().map(|metric| self.fetch(*metric, bindings));
        let results = futures::future::join_all(reads).await;
        results.into_iter().collect::<Result<Vec<_>>>().map(|_| ())
    }

    pub fn entry(&self, metric: Metric) -> Option<ReadModelEntry> {
        self.entries.get(&metric).map(|e| e.clone())
    }

    pub fn value(&self, metric: Metric) -> Option<U256> {
        self.entries.get(&metric).and_then(|e| e.value)
    }

    pub fn display(&self, metric: Metric) -> String {
        self.entry(metric)
            .unwrap_or_else(|| ReadModelEntry::placeholder(metric))
            .display()
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn is_polling(&self) -> bool {
        self.tasks.lock().iter().any(|t| !t.is_finished())
    }

    /// Bumped on every entry change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::provider::InMemoryWallet;
    use crate::types::SEPOLIA_CHAIN_ID;
    use ethers::types::Address;
    use tokio::time::sleep;

    fn alice() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn setup(metrics: Vec<Metric>) -> (Arc<InMemoryWallet>, Session, Arc<ReadModel>) {
        let wallet = Arc::new(InMemoryWallet::new(SEPOLIA_CHAIN_ID).with_account(alice()));
        let mut config = Config::default().with_deployment(
            SEPOLIA_CHAIN_ID,
            &format!("{:?}", wallet.staking_address()),
            &format!("{:?}", wallet.token_address()),
        );
        config.polling.interval_ms = 20_000;
        config.polling.metrics = metrics;

        let session = Session::create(Arc::new(config.clone()), Some(wallet.clone())).unwrap();
        let model = ReadModel::new(session.clone(), &config.polling);
        model.start();
        (wallet, session, model)
    }

    #[test]
    fn test_placeholder_display() {
        assert_eq!(ReadModelEntry::placeholder(Metric::StakedBalance).display(), "0");
        assert_eq!(ReadModelEntry::placeholder(Metric::EarnedReward).display(), "0.00");
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_read_is_immediate() {
        let (wallet, session, model) = setup(vec![Metric::RewardRate]);
        wallet.set_reward_rate(U256::exp10(18));

        session.connect().await.unwrap();
        sleep(Duration::from_millis(1)).await;

        assert_eq!(model.display(Metric::RewardRate), "1");
        assert_eq!(wallet.call_count("REWARD_RATE"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_value_and_keeps_polling() {
        let (wallet, session, model) = setup(vec![Metric::StakedBalance]);
        let mut notices = session.notifications();
        wallet.fail_calls("stakedBalance", 1);

        session.connect().await.unwrap();
        sleep(Duration::from_millis(1)).await;
        let entry = model.entry(Metric::StakedBalance).unwrap();
        assert!(entry.value.is_none());
        assert!(entry.last_error.is_some());
        assert!(matches!(
            notices.recv().await,
            Ok(Notification::PollFailed { metric: Metric::StakedBalance, .. })
        ));

        sleep(Duration::from_secs(20)).await;
        let entry = model.entry(Metric::StakedBalance).unwrap();
        assert_eq!(entry.value, Some(U256::zero()));
        assert!(entry.last_error.is_none());

        sleep(Duration::from_secs(20)).await;
        assert_eq!(wallet.call_count("stakedBalance"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_poll_independently() {
        let (wallet, session, model) = setup(vec![Metric::StakedBalance, Metric::RewardRate]);
        wallet.fail_calls("stakedBalance", 10);

        session.connect().await.unwrap();
        sleep(Duration::from_secs(41)).await;

        assert!(model.value(Metric::StakedBalance).is_none());
        assert!(model.value(Metric::RewardRate).is_some());
        assert_eq!(wallet.call_count("REWARD_RATE"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_reads() {
        let (wallet, session, model) = setup(Metric::all());
        session.connect().await.unwrap();
        sleep(Duration::from_millis(1)).await;
        assert!(model.is_polling());

        session.disconnect();
        let reads = wallet.request_count();
        sleep(Duration::from_secs(120)).await;

        assert_eq!(wallet.request_count(), reads);
        assert!(!model.is_polling());
        assert_eq!(model.display(Metric::StakedBalance), "0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebind_resets_to_placeholder() {
        let bob = Address::repeat_byte(0xbb);
        let (wallet, session, model) = setup(vec![Metric::TokenBalance]);
        wallet.mint(alice(), U256::exp10(18) * 3);

        session.connect().await.unwrap();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(model.display(Metric::TokenBalance), "3");

        wallet.fail_calls("balanceOf", 1);
        wallet.switch_account(bob);
        sleep(Duration::from_millis(1)).await;
        // bob's first read failed: alice's balance must not linger
        assert_eq!(model.display(Metric::TokenBalance), "0");
        assert!(model.value(Metric::TokenBalance).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_through_outdated_bindings_is_dropped() {
        let bob = Address::repeat_byte(0xbb);
        let (wallet, session, model) = setup(vec![Metric::TokenBalance]);
        wallet.mint(alice(), U256::exp10(18) * 3);
        wallet.mint(bob, U256::exp10(18) * 7);

        session.connect().await.unwrap();
        sleep(Duration::from_millis(1)).await;
        let alice_bindings = session.bindings().unwrap();

        wallet.switch_account(bob);
        sleep(Duration::from_millis(1)).await;
        assert_eq!(model.display(Metric::TokenBalance), "7");

        let reads = wallet.call_count("balanceOf");
        let result = model.refresh_with(&alice_bindings, &[Metric::TokenBalance]).await;
        assert_eq!(result, Err(SessionError::NotConnected));
        assert_eq!(wallet.call_count("balanceOf"), reads);
        assert_eq!(model.display(Metric::TokenBalance), "7");
    }
}
