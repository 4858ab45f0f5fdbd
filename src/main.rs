//! Staking session CLI

use anyhow::Context;
use ethers::types::{Address, U256};
use stake_session::config::ChainConfig;
use stake_session::types::SEPOLIA_CHAIN_ID;
use stake_session::{
    logging, ActionKind, Config, InMemoryWallet, Notification, RpcWallet, SharedWallet,
    StakingClient,
};
use std::env;
use std::sync::Arc;
use tracing::{info, warn};

const USAGE: &str = "usage: stake-session <status | approve <amount> | stake <amount> | withdraw <amount> | claim | demo>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = Config::from_env()?;
    logging::init(&config.logging)?;

    println!("╔═══════════════════════════════════════════════════════════════╗");
    println!("║          STAKE SESSION v0.1.0                                 ║");
    println!("║          Wallet session | Staking dashboard                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("status");
    let amount = args.get(2).map(String::as_str);

    if command == "demo" {
        return demo().await;
    }

    let kind = match command {
        "status" => None,
        "approve" => Some(ActionKind::Approve),
        "stake" => Some(ActionKind::Stake),
        "withdraw" => Some(ActionKind::Withdraw),
        "claim" => Some(ActionKind::Claim),
        other => anyhow::bail!("unknown command {:?}\n{}", other, USAGE),
    };
    if kind.map_or(false, |k| k.takes_amount()) && amount.is_none() {
        anyhow::bail!("{} needs an amount\n{}", command, USAGE);
    }

    let chain = rpc_chain(&config).context("no chain with an rpc url configured")?;
    info!("✅ Configuration loaded");
    info!("   Chain: {} ({})", chain.name, chain.chain_id);
    info!("   RPC: {}", chain.rpc_url);

    let wallet: Option<SharedWallet> = match RpcWallet::new(&chain.rpc_url, &config.wallet) {
        Ok(wallet) => Some(Arc::new(wallet)),
        Err(e) => {
            warn!("No wallet available: {}", e);
            None
        }
    };

    let client = StakingClient::new(config, wallet)?;
    if let Err(e) = client.start().await {
        warn!("Connect failed: {}", e);
    }

    match kind {
        None => watch(&client).await,
        Some(kind) => {
            let pending = client.dispatcher(kind).dispatch(amount).await;
            match pending {
                Ok(tx) => info!("✅ {} confirmed: {:?}", kind, tx.hash),
                Err(e) => warn!("❌ {} failed: {}", kind, e),
            }
            println!("{}", client.dashboard());
            client.stop();
            Ok(())
        }
    }
}

/// Chain the RPC wallet talks to: the first deployment, else Sepolia
fn rpc_chain(config: &Config) -> Option<ChainConfig> {
    let mut chains: Vec<&ChainConfig> = config
        .chains
        .values()
        .filter(|c| !c.rpc_url.is_empty())
        .collect();
    chains.sort_by_key(|c| c.chain_id);

    chains
        .iter()
        .find(|c| c.deployment().is_some())
        .or_else(|| chains.iter().find(|c| c.chain_id == SEPOLIA_CHAIN_ID))
        .or_else(|| chains.first())
        .map(|c| (*c).clone())
}

/// Reprint the dashboard on every change until ctrl-c
async fn watch(client: &StakingClient) -> anyhow::Result<()> {
    let mut values = client.read_model().subscribe();
    let mut session = client.session().subscribe();
    let mut notices = client.session().notifications();

    println!("{}", client.dashboard());
    loop {
        tokio::select! {
            changed = values.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}", client.dashboard());
            }
            changed = session.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}", client.dashboard());
            }
            notice = notices.recv() => {
                if let Ok(notice) = notice {
                    report(&notice);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutting down...");
                break;
            }
        }
    }

    client.stop();
    info!("✅ Stake session shutdown complete");
    Ok(())
}

fn report(notice: &Notification) {
    match notice {
        Notification::ConnectFailed(e) => warn!("Connect failed: {}", e),
        Notification::RebindFailed(e) => warn!("Rebind failed: {}", e),
        Notification::PollFailed { metric, error } => warn!("Reading {} failed: {}", metric, error),
        Notification::ActionFailed { kind, error } => warn!("{} failed: {}", kind, error),
    }
}

/// Walk the full flow against the in-memory chain
async fn demo() -> anyhow::Result<()> {
    let account: Address = "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".parse()?;
    let wallet = Arc::new(InMemoryWallet::new(SEPOLIA_CHAIN_ID).with_account(account));
    wallet.mint(account, U256::exp10(18) * 100);

    let config = Config::default().with_deployment(
        SEPOLIA_CHAIN_ID,
        &format!("{:?}", wallet.staking_address()),
        &format!("{:?}", wallet.token_address()),
    );
    let client = StakingClient::new(config, Some(wallet.clone()))?;
    client.start().await?;
    println!("{}", client.dashboard());

    let actions = client.actions();
    let tx = actions.approve("10").await.context("approve failed")?;
    info!("✅ approve confirmed: {:?}", tx.hash);
    let tx = actions.stake("10").await.context("stake failed")?;
    info!("✅ stake confirmed: {:?}", tx.hash);
    println!("{}", client.dashboard());

    wallet.set_earned(account, U256::exp10(17) * 25);
    client.read_model().refresh(&[stake_session::Metric::EarnedReward]).await?;
    println!("{}", client.dashboard());

    let tx = actions.claim().await?;
    info!("✅ claim confirmed: {:?}", tx.hash);
    let tx = actions.withdraw("4").await?;
    info!("✅ withdraw confirmed: {:?}", tx.hash);
    println!("{}", client.dashboard());

    client.stop();
    Ok(())
}
