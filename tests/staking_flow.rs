use ethers::types::{Address, U256};
use stake_session::types::SEPOLIA_CHAIN_ID;
use stake_session::{
    ActionKind, Config, InMemoryWallet, Metric, SessionError, SessionState, StakingClient,
    TxPhase, TxStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn account() -> Address {
    "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".parse().unwrap()
}

fn client_on(wallet: &Arc<InMemoryWallet>) -> StakingClient {
    let config = Config::default().with_deployment(
        SEPOLIA_CHAIN_ID,
        &format!("{:?}", wallet.staking_address()),
        &format!("{:?}", wallet.token_address()),
    );
    StakingClient::new(config, Some(wallet.clone())).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_connect_stake_and_display() {
    let wallet = Arc::new(InMemoryWallet::new(SEPOLIA_CHAIN_ID).with_account(account()));
    wallet.mint(account(), U256::exp10(18) * 50);
    let client = client_on(&wallet);

    client.start().await.unwrap();
    sleep(Duration::from_millis(1)).await;

    let snapshot = client.session().snapshot();
    assert_eq!(snapshot.state, SessionState::Connected);
    assert_eq!(snapshot.account, Some(account()));
    assert_eq!(snapshot.chain_id, Some(SEPOLIA_CHAIN_ID));
    assert_eq!(client.read_model().value(Metric::StakedBalance), Some(U256::zero()));

    client.actions().approve("10").await.unwrap();
    let mut phases = client.dispatcher(ActionKind::Stake).subscribe();
    let reads_before = wallet.call_count("stakedBalance");

    let tx = client.actions().stake("10").await.unwrap();
    assert_eq!(tx.status, TxStatus::Confirmed);
    assert!(matches!(phases.recv().await.unwrap(), TxPhase::Submitted { .. }));
    assert!(matches!(phases.recv().await.unwrap(), TxPhase::Confirmed { .. }));

    // Re-read right after confirmation, not on the next tick
    assert_eq!(wallet.call_count("stakedBalance"), reads_before + 1);
    assert_eq!(
        client.read_model().value(Metric::StakedBalance),
        Some(U256::from_dec_str("10000000000000000000").unwrap())
    );
    assert_eq!(client.read_model().display(Metric::StakedBalance), "10");
    assert!(client.dashboard().to_string().contains("Staked Amount: 10\n"));
    assert_eq!(client.read_model().display(Metric::TokenBalance), "40");

    client.stop();
}

#[tokio::test(start_paused = true)]
async fn test_withdraw_more_than_staked_reverts() {
    let wallet = Arc::new(InMemoryWallet::new(SEPOLIA_CHAIN_ID).with_account(account()));
    let client = client_on(&wallet);
    client.start().await.unwrap();

    let err = client.actions().withdraw("1").await.unwrap_err();
    assert!(matches!(err, SessionError::TransactionReverted { .. }));
    assert!(!client.dispatcher(ActionKind::Withdraw).is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_no_reads_after_disconnect() {
    let wallet = Arc::new(InMemoryWallet::new(SEPOLIA_CHAIN_ID).with_account(account()));
    let client = client_on(&wallet);
    client.start().await.unwrap();
    sleep(Duration::from_secs(45)).await;

    client.session().disconnect();
    let requests = wallet.request_count();
    sleep(Duration::from_secs(300)).await;

    assert_eq!(wallet.request_count(), requests);
    assert!(!client.read_model().is_polling());
    assert_eq!(
        client.actions().claim().await.unwrap_err(),
        SessionError::NotConnected
    );
}

#[tokio::test(start_paused = true)]
async fn test_chain_switch_away_and_back() {
    let wallet = Arc::new(InMemoryWallet::new(SEPOLIA_CHAIN_ID).with_account(account()));
    wallet.mint(account(), U256::exp10(18));
    let client = client_on(&wallet);
    client.start().await.unwrap();
    sleep(Duration::from_millis(1)).await;

    wallet.switch_chain(1);
    sleep(Duration::from_millis(1)).await;
    assert_eq!(client.session().state(), SessionState::Disconnected);
    assert!(client.dashboard().to_string().contains("Connect Account"));

    wallet.switch_chain(SEPOLIA_CHAIN_ID);
    sleep(Duration::from_millis(1)).await;
    assert_eq!(client.session().state(), SessionState::Connected);
    assert_eq!(client.read_model().display(Metric::TokenBalance), "1");
}

#[tokio::test(start_paused = true)]
async fn test_six_decimal_token() {
    let wallet = Arc::new(InMemoryWallet::new(SEPOLIA_CHAIN_ID).with_account(account()));
    wallet.set_decimals(6);
    wallet.mint(account(), U256::from(10_000_000u64));
    let client = client_on(&wallet);
    client.start().await.unwrap();
    sleep(Duration::from_millis(1)).await;
    assert_eq!(client.read_model().display(Metric::TokenBalance), "10");

    client.actions().approve("5").await.unwrap();
    // One digit past the token's precision
    assert!(matches!(
        client.actions().stake("1.0000001").await,
        Err(SessionError::InvalidAmount { .. })
    ));

    client.actions().stake("1.5").await.unwrap();
    assert_eq!(wallet.staked_of(account()), U256::from(1_500_000u64));
    assert_eq!(client.read_model().value(Metric::StakedBalance), Some(U256::from(1_500_000u64)));
    assert_eq!(client.read_model().display(Metric::StakedBalance), "1.5");
    assert_eq!(client.read_model().display(Metric::TokenBalance), "8.5");
    assert_eq!(client.read_model().display(Metric::Allowance), "3.5");
}
