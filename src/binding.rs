//! Contract binding factory
//!
//! A binding couples a contract address, its interface and the signing
//! account. Construction is pure; handles talk to the wallet only when a
//! read or submit is issued.

use crate::error::{Result, SessionError};
use crate::provider::SharedWallet;
use ethers::abi::{Abi, Function, Token};
use ethers::types::{Address, Bytes, TxHash};
use std::sync::Arc;
use tracing::debug;

/// Parsed human-readable ABI
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    abi: Abi,
}

impl InterfaceDescriptor {
    pub fn parse<S: AsRef<str>>(signatures: &[S]) -> Result<Self> {
        let signatures: Vec<&str> = signatures.iter().map(AsRef::as_ref).collect();
        let abi = ethers::abi::parse_abi(&signatures)
            .map_err(|e| SessionError::Binding(format!("invalid interface: {}", e)))?;
        Ok(Self { abi })
    }

    pub fn function(&self, name: &str) -> Result<&Function> {
        self.abi
            .function(name)
            .map_err(|_| SessionError::Binding(format!("interface has no function {}", name)))
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.abi.functions.contains_key(name)
    }

    /// Fail with `Binding` naming the first function the interface lacks
    pub fn require(&self, names: &[&str]) -> Result<()> {
        match names.iter().find(|name| !self.has_function(name)) {
            Some(missing) => Err(SessionError::Binding(format!(
                "interface has no function {}",
                missing
            ))),
            None => Ok(()),
        }
    }

    /// Selector + ABI-encoded arguments
    pub fn encode_call(&self, name: &str, args: &[Token]) -> Result<Bytes> {
        let data = self.function(name)?.encode_input(args)?;
        Ok(data.into())
    }

    pub fn decode_output(&self, name: &str, data: &[u8]) -> Result<Vec<Token>> {
        self.function(name)?
            .decode_output(data)
            .map_err(|e| SessionError::Rpc(format!("cannot decode {} result: {}", name, e)))
    }

    /// Resolve calldata back to the function it targets
    pub fn decode_call(&self, data: &[u8]) -> Result<(&Function, Vec<Token>)> {
        if data.len() < 4 {
            return Err(SessionError::Rpc("calldata shorter than a selector".to_string()));
        }
        let function = self
            .abi
            .functions()
            .find(|f| f.short_signature() == data[..4])
            .ok_or_else(|| SessionError::Rpc(format!("unknown selector 0x{}", hex::encode(&data[..4]))))?;
        let args = function.decode_input(&data[4..])?;
        Ok((function, args))
    }
}

/// Contract address + interface + signer, usable for reads and writes
#[derive(Clone)]
pub struct ContractHandle {
    address: Address,
    interface: Arc<InterfaceDescriptor>,
    account: Address,
    wallet: SharedWallet,
}

impl ContractHandle {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn account(&self) -> Address {
        self.account
    }

    pub fn interface(&self) -> &InterfaceDescriptor {
        &self.interface
    }

    /// `eth_call` a view function and decode its outputs
    pub async fn read(&self, function: &str, args: &[Token]) -> Result<Vec<Token>> {
        let data = self.interface.encode_call(function, args)?;
        let raw = self.wallet.call(self.address, data).await?;
        self.interface.decode_output(function, &raw)
    }

    /// Sign and submit a state-changing call from the bound account
    pub async fn submit(&self, function: &str, args: &[Token]) -> Result<TxHash> {
        let data = self.interface.encode_call(function, args)?;
        let hash = self.wallet.send_transaction(self.account, self.address, data).await?;
        debug!("{} submitted to {:?}: {:?}", function, self.address, hash);
        Ok(hash)
    }

    pub async fn wait_for_receipt(&self, hash: TxHash) -> Result<bool> {
        self.wallet.wait_for_receipt(hash).await
    }
}

impl std::fmt::Debug for ContractHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractHandle")
            .field("address", &self.address)
            .field("account", &self.account)
            .finish()
    }
}

/// Strict `0x` + 40 hex digit address parsing
pub fn parse_address(address: &str) -> Result<Address> {
    let digits = address
        .strip_prefix("0x")
        .ok_or_else(|| SessionError::Binding(format!("address {:?} lacks 0x prefix", address)))?;
    if digits.len() != 40 {
        return Err(SessionError::Binding(format!(
            "address {:?} is not 20 bytes",
            address
        )));
    }
    let bytes = hex::decode(digits)
        .map_err(|_| SessionError::Binding(format!("address {:?} is not hex", address)))?;
    Ok(Address::from_slice(&bytes))
}

/// Builds contract handles over one wallet
#[derive(Clone)]
pub struct BindingFactory {
    wallet: SharedWallet,
}

impl BindingFactory {
    pub fn new(wallet: SharedWallet) -> Self {
        Self { wallet }
    }

    pub fn bind(
        &self,
        address: &str,
        interface: Arc<InterfaceDescriptor>,
        account: Option<Address>,
    ) -> Result<ContractHandle> {
        let address = parse_address(address)?;
        let account = account
            .ok_or_else(|| SessionError::Binding("no account to bind as signer".to_string()))?;

        Ok(ContractHandle {
            address,
            interface,
            account,
            wallet: self.wallet.clone(),
        })
    }
}

/// Every handle a connected session owns
#[derive(Debug, Clone)]
pub struct Bindings {
    pub staking: ContractHandle,
    pub token: ContractHandle,
    pub account: Address,
    pub chain_id: u64,
    pub decimals: u8,
    pub generation: u64,
}
