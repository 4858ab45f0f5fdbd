//! Action dispatchers: approve, stake, withdraw, claim
//!
//! Each dispatch validates its input, submits one transaction, waits for the
//! receipt and, on success, refreshes the read-model entries the transaction
//! touched. Phases are published on a broadcast channel per dispatcher.

use crate::amount::parse_amount;
use crate::binding::{Bindings, ContractHandle};
use crate::error::{Result, SessionError};
use crate::read_model::ReadModel;
use crate::session::Session;
use crate::types::{ActionKind, Notification, PendingTransaction, TxPhase, TxStatus};
use ethers::abi::Token;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Clears the in-flight flag however the dispatch ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One write operation, at most one transaction outstanding
pub struct ActionDispatcher {
    kind: ActionKind,
    session: Session,
    read_model: Arc<ReadModel>,
    in_flight: AtomicBool,
    phases: broadcast::Sender<TxPhase>,
}

impl ActionDispatcher {
    pub fn new(kind: ActionKind, session: Session, read_model: Arc<ReadModel>) -> Self {
        let (phases, _) = broadcast::channel(16);
        Self {
            kind,
            session,
            read_model,
            in_flight: AtomicBool::new(false),
            phases,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TxPhase> {
        self.phases.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Submit and confirm one transaction. `amount` is ignored for claim.
    pub async fn dispatch(&self, amount: Option<&str>) -> Result<PendingTransaction> {
        let bindings = self.session.require_bindings()?;
        let args = self.arguments(amount, &bindings)?;

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::ActionInFlight(self.kind.to_string()));
        }
        let _in_flight = InFlight(&self.in_flight);

        let result = self.execute(&bindings, &args).await;
        if let Err(e) = &result {
            if self.session.is_current(bindings.generation) {
                self.session.notify(Notification::ActionFailed {
                    kind: self.kind,
                    error: e.to_string(),
                });
            } else {
                debug!("{} failed after its session ended: {}", self.kind, e);
            }
        }
        result
    }

    fn arguments(&self, amount: Option<&str>, bindings: &Bindings) -> Result<Vec<Token>> {
        if !self.kind.takes_amount() {
            return Ok(Vec::new());
        }
        let input = amount.unwrap_or_default();
        let value = parse_amount(input, bindings.decimals)?;

        Ok(match self.kind {
            ActionKind::Approve => vec![
                Token::Address(bindings.staking.address()),
                Token::Uint(value),
            ],
            _ => vec![Token::Uint(value)],
        })
    }

    fn target<'b>(&self, bindings: &'b Bindings) -> (&'b ContractHandle, &'static str) {
        match self.kind {
            ActionKind::Approve => (&bindings.token, "approve"),
            ActionKind::Stake => (&bindings.staking, "stake"),
            ActionKind::Withdraw => (&bindings.staking, "withdrawStakedTokens"),
            ActionKind::Claim => (&bindings.staking, "getReward"),
        }
    }

    fn publish(&self, phase: TxPhase) {
        // No subscribers is fine
        let _ = self.phases.send(phase);
    }

    async fn execute(&self, bindings: &Bindings, args: &[Token]) -> Result<PendingTransaction> {
        let (handle, function) = self.target(bindings);

        let hash = handle.submit(function, args).await?;
        let mut pending = PendingTransaction {
            kind: self.kind,
            hash,
            status: TxStatus::Pending,
        };
        info!("{} submitted: {:?}", self.kind, hash);
        self.publish(TxPhase::Submitted { kind: self.kind, hash });

        let success = match handle.wait_for_receipt(hash).await {
            Ok(success) => success,
            Err(e) => {
                pending.status = TxStatus::Failed;
                return Err(e);
            }
        };

        if !success {
            pending.status = TxStatus::Failed;
            warn!("{} reverted: {:?}", self.kind, hash);
            self.publish(TxPhase::Reverted { kind: self.kind, hash });
            return Err(SessionError::TransactionReverted { hash });
        }

        pending.status = TxStatus::Confirmed;
        info!("{} confirmed: {:?}", self.kind, hash);
        self.publish(TxPhase::Confirmed { kind: self.kind, hash });

        if self.session.is_current(bindings.generation) {
            let dependents = self.kind.dependent_metrics();
            if let Err(e) = self.read_model.refresh_with(bindings, &dependents).await {
                warn!("Refresh after {} failed: {}", self.kind, e);
            }
        } else {
            debug!("{} confirmed after its session ended; skipping refresh", self.kind);
        }

        Ok(pending)
    }
}

/// The four dispatchers of a session
pub struct Actions {
    approve: ActionDispatcher,
    stake: ActionDispatcher,
    withdraw: ActionDispatcher,
    claim: ActionDispatcher,
}

impl Actions {
    pub fn new(session: Session, read_model: Arc<ReadModel>) -> Self {
        let make = |kind| ActionDispatcher::new(kind, session.clone(), read_model.clone());
        Self {
            approve: make(ActionKind::Approve),
            stake: make(ActionKind::Stake),
            withdraw: make(ActionKind::Withdraw),
            claim: make(ActionKind::Claim),
        }
    }

    pub fn get(&self, kind: ActionKind) -> &ActionDispatcher {
        match kind {
            ActionKind::Approve => &self.approve,
            ActionKind::Stake => &self.stake,
            ActionKind::Withdraw => &self.withdraw,
            ActionKind::Claim => &self.claim,
        }
    }

    pub async fn approve(&self, amount: &str) -> Result<PendingTransaction> {
        self.approve.dispatch(Some(amount)).await
    }

    pub async fn stake(&self, amount: &str) -> Result<PendingTransaction> {
        self.stake.dispatch(Some(amount)).await
    }

    pub async fn withdraw(&self, amount: &str) -> Result<PendingTransaction> {
        self.withdraw.dispatch(Some(amount)).await
    }

    pub async fn claim(&self) -> Result<PendingTransaction> {
        self.claim.dispatch(None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::provider::InMemoryWallet;
    use crate::types::{Metric, SEPOLIA_CHAIN_ID};
    use ethers::types::{Address, U256};
    use std::time::Duration;
    use tokio::time::sleep;
    use tokio_test::assert_ok;

    fn alice() -> Address {
        Address::repeat_byte(0xaa)
    }

    async fn connected() -> (Arc<InMemoryWallet>, Session, Arc<ReadModel>, Arc<Actions>) {
        let wallet = Arc::new(InMemoryWallet::new(SEPOLIA_CHAIN_ID).with_account(alice()));
        wallet.mint(alice(), U256::exp10(18) * 100);
        let config = Config::default().with_deployment(
            SEPOLIA_CHAIN_ID,
            &format!("{:?}", wallet.staking_address()),
            &format!("{:?}", wallet.token_address()),
        );
        let session = Session::create(Arc::new(config.clone()), Some(wallet.clone())).unwrap();
        let model = ReadModel::new(session.clone(), &config.polling);
        model.start();
        session.connect().await.unwrap();
        sleep(Duration::from_millis(1)).await;

        let actions = Arc::new(Actions::new(session.clone(), model.clone()));
        (wallet, session, model, actions)
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_amounts_make_no_calls() {
        let (wallet, _session, _model, actions) = connected().await;
        let before = wallet.request_count();

        for input in ["0", "-5", "abc", ""] {
            for kind in [ActionKind::Approve, ActionKind::Stake, ActionKind::Withdraw] {
                let err = actions.get(kind).dispatch(Some(input)).await.unwrap_err();
                assert!(matches!(err, SessionError::InvalidAmount { .. }), "{} {:?}", kind, input);
            }
        }
        assert_eq!(wallet.request_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_connected() {
        let (wallet, session, _model, actions) = connected().await;
        session.disconnect();
        let before = wallet.request_count();

        assert_eq!(actions.stake("1").await.unwrap_err(), SessionError::NotConnected);
        assert_eq!(wallet.request_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phases_are_observable() {
        let (_wallet, _session, _model, actions) = connected().await;
        let mut phases = actions.get(ActionKind::Approve).subscribe();

        let pending = assert_ok!(actions.approve("5").await);
        assert_eq!(pending.status, TxStatus::Confirmed);
        assert_eq!(
            phases.recv().await.unwrap(),
            TxPhase::Submitted { kind: ActionKind::Approve, hash: pending.hash }
        );
        assert_eq!(
            phases.recv().await.unwrap(),
            TxPhase::Confirmed { kind: ActionKind::Approve, hash: pending.hash }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_revert_reported_and_state_unchanged() {
        let (wallet, _session, model, actions) = connected().await;
        let mut phases = actions.get(ActionKind::Stake).subscribe();

        // No allowance yet
        let err = actions.stake("1").await.unwrap_err();
        assert!(matches!(err, SessionError::TransactionReverted { .. }));
        assert!(matches!(phases.recv().await.unwrap(), TxPhase::Submitted { .. }));
        assert!(matches!(phases.recv().await.unwrap(), TxPhase::Reverted { .. }));
        assert_eq!(wallet.staked_of(alice()), U256::zero());
        assert_eq!(model.display(Metric::StakedBalance), "0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_rejection_not_retried() {
        let (wallet, session, _model, actions) = connected().await;
        let mut notices = session.notifications();
        wallet.fail_next_send(SessionError::UserRejected);

        assert_eq!(actions.approve("1").await.unwrap_err(), SessionError::UserRejected);
        assert_eq!(wallet.call_count("approve"), 0);
        assert!(matches!(
            notices.recv().await,
            Ok(Notification::ActionFailed { kind: ActionKind::Approve, .. })
        ));
        assert!(!actions.get(ActionKind::Approve).is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_dispatch_while_outstanding() {
        let (wallet, _session, _model, actions) = connected().await;
        actions.approve("10").await.unwrap();

        wallet.hold_receipts(true);
        let first = {
            let actions = actions.clone();
            tokio::spawn(async move { actions.stake("1").await })
        };
        while !actions.get(ActionKind::Stake).is_busy() {
            tokio::task::yield_now().await;
        }

        let err = actions.stake("1").await.unwrap_err();
        assert_eq!(err, SessionError::ActionInFlight("stake".to_string()));
        assert_eq!(wallet.call_count("stake"), 1);

        wallet.hold_receipts(false);
        let pending = first.await.unwrap().unwrap();
        assert_eq!(pending.status, TxStatus::Confirmed);
        assert!(!actions.get(ActionKind::Stake).is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_refreshes_earned() {
        let (wallet, _session, model, actions) = connected().await;
        wallet.set_earned(alice(), U256::exp10(18) * 2);
        model.refresh(&[Metric::EarnedReward]).await.unwrap();
        assert_eq!(model.display(Metric::EarnedReward), "2.00");

        actions.claim().await.unwrap();
        assert_eq!(model.display(Metric::EarnedReward), "0.00");
        assert_eq!(model.display(Metric::TokenBalance), "102");
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_after_disconnect_is_ignored() {
        let (wallet, session, _model, actions) = connected().await;
        actions.approve("10").await.unwrap();
        let staked_reads = wallet.call_count("stakedBalance");

        wallet.hold_receipts(true);
        let pending = {
            let actions = actions.clone();
            tokio::spawn(async move { actions.stake("1").await })
        };
        while !actions.get(ActionKind::Stake).is_busy() {
            tokio::task::yield_now().await;
        }

        session.disconnect();
        wallet.hold_receipts(false);
        let result = pending.await.unwrap().unwrap();
        assert_eq!(result.status, TxStatus::Confirmed);
        // No refresh through the dead session
        assert_eq!(wallet.call_count("stakedBalance"), staked_reads);
    }
}
