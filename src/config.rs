// src/config.rs
use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use ethers::types::{Address, H256};

use crate::error::ConfigError;

/// ERC-4337 EntryPoint v0.6, deployed at the same address on every supported chain.
pub const DEFAULT_ENTRY_POINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

/// Mainnet, Goerli, Optimism, Polygon, Base, Arbitrum, Base Sepolia, Sepolia, local dev.
pub const SUPPORTED_CHAINS: &[u64] = &[1, 5, 10, 137, 8453, 42161, 84532, 11155111, 31337];

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(short, long, env = "RPC_SERVER_ADDR", default_value = "127.0.0.1:8545")]
    pub rpc_server_addr: String,

    /// Key of the paymaster signer.
    #[clap(short, long, env = "PAYMASTER_PRIVATE_KEY")]
    pub private_key: Option<String>,

    /// Key used to submit bundles. Submission is disabled without it.
    #[clap(long, env = "BUNDLER_PRIVATE_KEY")]
    pub bundler_key: Option<String>,

    #[clap(short, long, env = "CHAIN_ID")]
    pub chain_id: u64,

    #[clap(short, long, env = "ETH_RPC_URL")]
    pub eth_rpc_url: String,

    #[clap(long, env = "ENTRY_POINT", default_value = DEFAULT_ENTRY_POINT)]
    pub entry_point: String,

    #[clap(long, env = "ACCOUNT_FACTORY")]
    pub account_factory: Option<String>,

    /// Hash of the account contract creation code used by the factory.
    #[clap(long, env = "ACCOUNT_CODE_HASH")]
    pub account_code_hash: Option<String>,

    #[clap(long, env = "PAYMASTER_ADDRESS")]
    pub paymaster: Option<String>,

    #[clap(long, env = "BENEFICIARY")]
    pub beneficiary: Option<String>,

    #[clap(long, env = "GAS_PRICE_BUFFER", default_value_t = 10)]
    pub gas_price_buffer: u64,

    #[clap(long, env = "NETWORK_TIMEOUT_SECS", default_value_t = 10)]
    pub network_timeout_secs: u64,
}

/// Checked configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_server_addr: SocketAddr,
    pub private_key: String,
    pub bundler_key: Option<String>,
    pub chain_id: u64,
    pub eth_rpc_url: String,
    pub entry_point: Address,
    pub account_factory: Address,
    pub account_code_hash: H256,
    pub paymaster: Address,
    pub beneficiary: Option<Address>,
    pub gas_price_buffer: u64,
    pub network_timeout: Duration,
}

impl TryFrom<Args> for Config {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if !SUPPORTED_CHAINS.contains(&args.chain_id) {
            return Err(ConfigError::UnsupportedNetwork(args.chain_id));
        }
        let rpc_server_addr =
            args.rpc_server_addr.parse().map_err(|_| ConfigError::InvalidParameter {
                name: "rpc_server_addr",
                reason: format!("not a socket address: {}", args.rpc_server_addr),
            })?;
        if args.network_timeout_secs == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "network_timeout_secs",
                reason: "must be positive".to_string(),
            });
        }

        let account_code_hash = args
            .account_code_hash
            .ok_or(ConfigError::MissingAddress("account_code_hash"))?;
        let account_code_hash = account_code_hash.parse().map_err(|_| ConfigError::InvalidAddress {
            field: "account_code_hash",
            value: account_code_hash.clone(),
        })?;

        Ok(Self {
            rpc_server_addr,
            private_key: args.private_key.ok_or(ConfigError::MissingSigner("paymaster"))?,
            bundler_key: args.bundler_key,
            chain_id: args.chain_id,
            eth_rpc_url: args.eth_rpc_url,
            entry_point: parse_address("entry_point", &args.entry_point)?,
            account_factory: required_address("account_factory", args.account_factory)?,
            account_code_hash,
            paymaster: required_address("paymaster", args.paymaster)?,
            beneficiary: args
                .beneficiary
                .map(|value| parse_address("beneficiary", &value))
                .transpose()?,
            gas_price_buffer: args.gas_price_buffer,
            network_timeout: Duration::from_secs(args.network_timeout_secs),
        })
    }
}

fn required_address(field: &'static str, value: Option<String>) -> Result<Address, ConfigError> {
    let value = value.ok_or(ConfigError::MissingAddress(field))?;
    parse_address(field, &value)
}

fn parse_address(field: &'static str, value: &str) -> Result<Address, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        field,
        value: value.to_string(),
    })
}
