// src/main.rs
use std::net::SocketAddr;
use std::sync::Arc;

use aa_orchestrator::account::AccountStore;
use aa_orchestrator::config::{Args, Config};
use aa_orchestrator::factory::AccountFactory;
use aa_orchestrator::gas::{GasEstimator, GasEstimatorConfig};
use aa_orchestrator::ledger::{LedgerClient, ProviderClient};
use aa_orchestrator::paymaster::Paymaster;
use aa_orchestrator::rpc::{UserOperationRpcImpl, UserOperationRpcServer};
use clap::Parser;
use dotenv::dotenv;
use ethers::signers::LocalWallet;
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::try_from(Args::parse())?;

    let mut provider = ProviderClient::new(&config.eth_rpc_url, config.network_timeout)?;
    if let Some(key) = &config.bundler_key {
        provider = provider.with_submitter(key.parse::<LocalWallet>()?);
    }
    let ledger: Arc<dyn LedgerClient> = Arc::new(provider);

    let paymaster = Paymaster::new(
        &config.private_key,
        config.paymaster,
        config.chain_id,
        ledger.clone(),
    )?
    .with_gas_price_buffer(config.gas_price_buffer);

    let accounts = Arc::new(AccountStore::new());
    let estimator = GasEstimator::new(
        ledger.clone(),
        config.entry_point,
        GasEstimatorConfig {
            timeout: config.network_timeout,
            fee_buffer_percent: config.gas_price_buffer,
            ..GasEstimatorConfig::default()
        },
    )
    .with_accounts(accounts.clone());
    let factory = AccountFactory::new(config.account_factory, config.account_code_hash, accounts);

    let rpc = UserOperationRpcImpl::new(
        Arc::new(paymaster),
        estimator,
        ledger,
        Arc::new(factory),
        config.entry_point,
        config.chain_id,
    )
    .with_beneficiary(config.beneficiary);

    info!("Starting ERC-4337 RPC server on {}", config.rpc_server_addr);
    let server_handle = start_server(config.rpc_server_addr, rpc).await?;

    // Keep the server running until Ctrl+C is pressed
    tokio::signal::ctrl_c().await?;
    server_handle.stop()?;
    info!("Server stopped");

    Ok(())
}

async fn start_server(
    server_addr: SocketAddr,
    rpc: UserOperationRpcImpl,
) -> anyhow::Result<ServerHandle> {
    let server = ServerBuilder::default().build(server_addr).await?;
    Ok(server.start(rpc.into_rpc()))
}
