//! In-process wallet and staking chain
//!
//! Serves the staking and stake-token call surface from memory so a session
//! can be driven without a node: local demos and tests. Transactions are
//! mined at submission; receipts can be held back to observe the pending
//! phase. Faults can be injected per function.

use super::events::{EventEmitter, Listener, Subscription};
use super::WalletProvider;
use crate::binding::InterfaceDescriptor;
use crate::config::InterfaceConfig;
use crate::error::{Result, SessionError};
use crate::types::WalletEvent;
use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, Bytes, TxHash, H256, U256};
use ethers::utils::keccak256;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Default)]
struct ChainState {
    chain_id: u64,
    accounts: Vec<Address>,
    reject_connections: bool,
    decimals: u8,
    reward_rate: U256,
    balances: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
    staked: HashMap<Address, U256>,
    earned: HashMap<Address, U256>,
    receipts: HashMap<TxHash, bool>,
    nonce: u64,
    calls: Vec<String>,
    failing: HashMap<String, u32>,
    send_error: Option<SessionError>,
}

/// Wallet + chain simulator
pub struct InMemoryWallet {
    deployment_chain: u64,
    staking_address: Address,
    token_address: Address,
    staking: InterfaceDescriptor,
    token: InterfaceDescriptor,
    state: Mutex<ChainState>,
    emitter: EventEmitter,
    hold_receipts: watch::Sender<bool>,
}

impl InMemoryWallet {
    /// Fresh chain with the contracts deployed on `chain_id` and no accounts
    pub fn new(chain_id: u64) -> Self {
        let interfaces = InterfaceConfig::default();
        let (hold_receipts, _) = watch::channel(false);

        Self {
            deployment_chain: chain_id,
            staking_address: Address::repeat_byte(0x51),
            token_address: Address::repeat_byte(0x70),
            staking: InterfaceDescriptor::parse(&interfaces.staking)
                .expect("built-in staking interface parses"),
            token: InterfaceDescriptor::parse(&interfaces.stake_token)
                .expect("built-in token interface parses"),
            state: Mutex::new(ChainState {
                chain_id,
                decimals: 18,
                reward_rate: U256::exp10(16),
                ..Default::default()
            }),
            emitter: EventEmitter::new(),
            hold_receipts,
        }
    }

    pub fn with_account(self, account: Address) -> Self {
        self.state.lock().accounts.push(account);
        self
    }

    pub fn staking_address(&self) -> Address {
        self.staking_address
    }

    pub fn token_address(&self) -> Address {
        self.token_address
    }

    pub fn deployment_chain(&self) -> u64 {
        self.deployment_chain
    }

    // ---- wallet controls -------------------------------------------------

    pub fn reject_connections(&self, reject: bool) {
        self.state.lock().reject_connections = reject;
    }

    /// Select a different account, as the user would in the wallet UI
    pub fn switch_account(&self, account: Address) {
        let accounts = {
            let mut state = self.state.lock();
            state.accounts.retain(|a| *a != account);
            state.accounts.insert(0, account);
            state.accounts.clone()
        };
        self.emitter.emit(&WalletEvent::AccountsChanged(accounts));
    }

    /// Revoke every account
    pub fn lock(&self) {
        self.state.lock().accounts.clear();
        self.emitter.emit(&WalletEvent::AccountsChanged(Vec::new()));
    }

    pub fn switch_chain(&self, chain_id: u64) {
        self.state.lock().chain_id = chain_id;
        self.emitter.emit(&WalletEvent::ChainChanged(chain_id));
    }

    pub fn listener_count(&self) -> usize {
        self.emitter.listener_count()
    }

    // ---- chain controls --------------------------------------------------

    pub fn mint(&self, account: Address, amount: U256) {
        *self.state.lock().balances.entry(account).or_default() += amount;
    }

    pub fn set_earned(&self, account: Address, amount: U256) {
        self.state.lock().earned.insert(account, amount);
    }

    pub fn set_reward_rate(&self, rate: U256) {
        self.state.lock().reward_rate = rate;
    }

    pub fn set_decimals(&self, decimals: u8) {
        self.state.lock().decimals = decimals;
    }

    pub fn staked_of(&self, account: Address) -> U256 {
        self.state.lock().staked.get(&account).copied().unwrap_or_default()
    }

    pub fn balance_of(&self, account: Address) -> U256 {
        self.state.lock().balances.get(&account).copied().unwrap_or_default()
    }

    /// Make the next `times` calls to `function` fail with an RPC error
    pub fn fail_calls(&self, function: &str, times: u32) {
        self.state.lock().failing.insert(function.to_string(), times);
    }

    /// Make the next submission fail before broadcast
    pub fn fail_next_send(&self, error: SessionError) {
        self.state.lock().send_error = Some(error);
    }

    /// Keep receipts pending until released
    pub fn hold_receipts(&self, hold: bool) {
        self.hold_receipts.send_replace(hold);
    }

    pub fn call_count(&self, function: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == function).count()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    // ---- execution -------------------------------------------------------

    fn interface_at(&self, to: Address) -> Result<&InterfaceDescriptor> {
        if to == self.staking_address {
            Ok(&self.staking)
        } else if to == self.token_address {
            Ok(&self.token)
        } else {
            Err(SessionError::Rpc(format!("no contract at {:?}", to)))
        }
    }

    fn record(&self, state: &mut ChainState, function: &str) -> Result<()> {
        state.calls.push(function.to_string());

        if state.chain_id != self.deployment_chain {
            return Err(SessionError::Rpc(format!(
                "contract not deployed on chain {}",
                state.chain_id
            )));
        }
        if let Some(remaining) = state.failing.get_mut(function) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SessionError::Rpc(format!("{} temporarily unavailable", function)));
            }
        }
        Ok(())
    }

    fn view(&self, state: &ChainState, function: &str, args: &[Token]) -> Result<Vec<Token>> {
        let value = match (function, args) {
            ("stakedBalance", [Token::Address(a)]) => state.staked.get(a).copied().unwrap_or_default(),
            ("earned", [Token::Address(a)]) => state.earned.get(a).copied().unwrap_or_default(),
            ("REWARD_RATE", []) => state.reward_rate,
            ("balanceOf", [Token::Address(a)]) => state.balances.get(a).copied().unwrap_or_default(),
            ("allowance", [Token::Address(owner), Token::Address(spender)]) => state
                .allowances
                .get(&(*owner, *spender))
                .copied()
                .unwrap_or_default(),
            ("decimals", []) => U256::from(state.decimals),
            _ => return Err(SessionError::Rpc(format!("{} is not a view function", function))),
        };
        Ok(vec![Token::Uint(value)])
    }

    /// Apply a state-changing call; `false` means the transaction reverted
    fn execute(&self, state: &mut ChainState, from: Address, function: &str, args: &[Token]) -> bool {
        match (function, args) {
            ("approve", [Token::Address(spender), Token::Uint(amount)]) => {
                state.allowances.insert((from, *spender), *amount);
                true
            }
            ("stake", [Token::Uint(amount)]) => {
                let key = (from, self.staking_address);
                let allowance = state.allowances.get(&key).copied().unwrap_or_default();
                let balance = state.balances.get(&from).copied().unwrap_or_default();
                if *amount > allowance || *amount > balance {
                    return false;
                }
                state.allowances.insert(key, allowance - *amount);
                state.balances.insert(from, balance - *amount);
                *state.staked.entry(from).or_default() += *amount;
                true
            }
            ("withdrawStakedTokens", [Token::Uint(amount)]) => {
                let staked = state.staked.get(&from).copied().unwrap_or_default();
                if *amount > staked {
                    return false;
                }
                state.staked.insert(from, staked - *amount);
                *state.balances.entry(from).or_default() += *amount;
                true
            }
            ("getReward", []) => {
                let reward = state.earned.remove(&from).unwrap_or_default();
                if reward.is_zero() {
                    return false;
                }
                *state.balances.entry(from).or_default() += reward;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl WalletProvider for InMemoryWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>> {
        let state = self.state.lock();
        if state.reject_connections {
            return Err(SessionError::UserRejected);
        }
        Ok(state.accounts.clone())
    }

    async fn chain_id(&self) -> Result<u64> {
        Ok(self.state.lock().chain_id)
    }

    fn subscribe(&self, listener: Listener) -> Subscription {
        self.emitter.subscribe(listener)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let interface = self.interface_at(to)?;
        let (function, args) = interface.decode_call(&data)?;

        let mut state = self.state.lock();
        self.record(&mut state, &function.name)?;
        let outputs = self.view(&state, &function.name, &args)?;
        Ok(ethers::abi::encode(&outputs).into())
    }

    async fn send_transaction(&self, from: Address, to: Address, data: Bytes) -> Result<TxHash> {
        let interface = self.interface_at(to)?;
        let (function, args) = interface.decode_call(&data)?;

        let mut state = self.state.lock();
        if let Some(err) = state.send_error.take() {
            return Err(err);
        }
        if !state.accounts.contains(&from) {
            return Err(SessionError::Rpc(format!("account {:?} is not authorized", from)));
        }
        self.record(&mut state, &function.name)?;

        state.nonce += 1;
        let mut preimage = from.as_bytes().to_vec();
        preimage.extend_from_slice(&state.nonce.to_be_bytes());
        let hash = H256::from(keccak256(preimage));

        let success = self.execute(&mut state, from, &function.name, &args);
        state.receipts.insert(hash, success);
        debug!("{} from {:?} mined as {:?} (success: {})", function.name, from, hash, success);
        Ok(hash)
    }

    async fn wait_for_receipt(&self, hash: TxHash) -> Result<bool> {
        let mut held = self.hold_receipts.subscribe();
        loop {
            let holding = *held.borrow_and_update();
            if !holding || held.changed().await.is_err() {
                break;
            }
        }

        let status = self.state.lock().receipts.get(&hash).copied();
        match status {
            Some(success) => {
                info!("Receipt for {:?}: {}", hash, if success { "success" } else { "reverted" });
                Ok(success)
            }
            None => Err(SessionError::Rpc(format!("unknown transaction {:?}", hash))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SEPOLIA_CHAIN_ID;

    fn alice() -> Address {
        Address::repeat_byte(0xaa)
    }

    #[tokio::test]
    async fn test_stake_requires_allowance() {
        let wallet = InMemoryWallet::new(SEPOLIA_CHAIN_ID).with_account(alice());
        wallet.mint(alice(), U256::exp10(19));

        let stake = wallet.staking.encode_call("stake", &[Token::Uint(U256::exp10(18))]).unwrap();
        let hash = wallet
            .send_transaction(alice(), wallet.staking_address(), stake.clone())
            .await
            .unwrap();
        assert!(!wallet.wait_for_receipt(hash).await.unwrap());

        let approve = wallet
            .token
            .encode_call(
                "approve",
                &[Token::Address(wallet.staking_address()), Token::Uint(U256::exp10(18))],
            )
            .unwrap();
        let hash = wallet.send_transaction(alice(), wallet.token_address(), approve).await.unwrap();
        assert!(wallet.wait_for_receipt(hash).await.unwrap());

        let hash = wallet.send_transaction(alice(), wallet.staking_address(), stake).await.unwrap();
        assert!(wallet.wait_for_receipt(hash).await.unwrap());
        assert_eq!(wallet.staked_of(alice()), U256::exp10(18));
        assert_eq!(wallet.balance_of(alice()), U256::exp10(19) - U256::exp10(18));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let wallet = InMemoryWallet::new(SEPOLIA_CHAIN_ID).with_account(alice());
        wallet.fail_calls("REWARD_RATE", 1);

        let data = wallet.staking.encode_call("REWARD_RATE", &[]).unwrap();
        assert!(wallet.call(wallet.staking_address(), data.clone()).await.is_err());
        assert!(wallet.call(wallet.staking_address(), data).await.is_ok());
        assert_eq!(wallet.call_count("REWARD_RATE"), 2);
    }

    #[tokio::test]
    async fn test_calls_fail_off_deployment_chain() {
        let wallet = InMemoryWallet::new(SEPOLIA_CHAIN_ID);
        wallet.switch_chain(1);
        let data = wallet.staking.encode_call("REWARD_RATE", &[]).unwrap();
        assert!(matches!(
            wallet.call(wallet.staking_address(), data).await,
            Err(SessionError::Rpc(_))
        ));
    }
}
