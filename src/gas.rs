// src/gas.rs
//! Gas constants shared by the entry point and the estimator, and the advisory
//! estimator itself.
//!
//! Verification gas is computed from the constants below on both sides. An estimate
//! covers the most [`crate::entry_point::EntryPoint`] can charge once the operation is
//! sponsored and signed, whatever the operation carries at estimate time.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, U256};
use tracing::{debug, warn};

use crate::account::AccountStore;
use crate::factory::InitCode;
use crate::ledger::{bounded, GasCall, LedgerClient};
use crate::signature::SIGNATURE_LEN;
use crate::types::{GasEstimate, UserOperation};

pub const VALIDATION_BASE_GAS: u64 = 10_000;
pub const SIGNATURE_RECOVERY_GAS: u64 = 6_000;
pub const PAYMASTER_VALIDATION_GAS: u64 = 15_000;
pub const ACCOUNT_DEPLOYMENT_GAS: u64 = 200_000;
/// Flat cost of a self-administration command (signer changes, upgrades).
pub const ACCOUNT_COMMAND_GAS: u64 = 25_000;
pub const PRE_VERIFICATION_BASE_GAS: u64 = 21_000;
pub const PRE_VERIFICATION_PER_BYTE_GAS: u64 = 16;

/// Gas the entry point charges for validating an operation.
pub fn verification_gas(signatures: usize, deploys_account: bool, sponsored: bool) -> U256 {
    let mut gas = VALIDATION_BASE_GAS + SIGNATURE_RECOVERY_GAS * signatures as u64;
    if deploys_account {
        gas += ACCOUNT_DEPLOYMENT_GAS;
    }
    if sponsored {
        gas += PAYMASTER_VALIDATION_GAS + SIGNATURE_RECOVERY_GAS;
    }
    U256::from(gas)
}

/// Base overhead plus a linear term in the call data length.
pub fn pre_verification_gas(call_data_len: usize) -> U256 {
    U256::from(PRE_VERIFICATION_BASE_GAS)
        + U256::from(PRE_VERIFICATION_PER_BYTE_GAS) * U256::from(call_data_len)
}

#[derive(Debug, Clone)]
pub struct GasEstimatorConfig {
    /// Deadline for each network-bound step.
    pub timeout: Duration,
    /// Percentage added on top of the queried fee market.
    pub fee_buffer_percent: u64,
    pub default_call_gas_limit: U256,
    pub default_max_fee_per_gas: U256,
    pub default_max_priority_fee_per_gas: U256,
}

impl Default for GasEstimatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            fee_buffer_percent: 10,
            default_call_gas_limit: U256::from(100_000u64),
            default_max_fee_per_gas: U256::from(50_000_000_000u64),
            default_max_priority_fee_per_gas: U256::from(1_500_000_000u64),
        }
    }
}

/// Fills the gas and fee fields of an operation. Failures fall back to defaults; an
/// estimate never blocks submission.
pub struct GasEstimator<L: ?Sized> {
    ledger: Arc<L>,
    entry_point: Address,
    accounts: Option<Arc<AccountStore>>,
    config: GasEstimatorConfig,
}

impl<L: LedgerClient + ?Sized> GasEstimator<L> {
    pub fn new(ledger: Arc<L>, entry_point: Address, config: GasEstimatorConfig) -> Self {
        Self { ledger, entry_point, accounts: None, config }
    }

    /// Deployed accounts to read signer thresholds from.
    pub fn with_accounts(mut self, accounts: Arc<AccountStore>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    /// Estimates for `op` as signed by at least `signatures` signers.
    ///
    /// Sponsorship is usually attached after estimation, so the paymaster share of
    /// verification gas is always reserved.
    pub async fn estimate_with_signers(
        &self,
        op: &UserOperation,
        signatures: usize,
    ) -> GasEstimate {
        let call_gas_limit = self.estimate_call_gas(op).await;
        let (max_fee_per_gas, max_priority_fee_per_gas) = self.estimate_fees().await;

        GasEstimate {
            call_gas_limit,
            verification_gas_limit: verification_gas(
                signatures.max(self.signatures_required(op)),
                !op.init_code.is_empty(),
                true,
            ),
            pre_verification_gas: pre_verification_gas(op.call_data.len()),
            max_fee_per_gas,
            max_priority_fee_per_gas,
        }
    }

    pub async fn estimate(&self, op: &UserOperation) -> GasEstimate {
        self.estimate_with_signers(op, 1).await
    }

    /// Signatures the sender's owner needs: from `initCode` for an account not deployed
    /// yet, else from the deployed account, else from the (dummy) signature length.
    fn signatures_required(&self, op: &UserOperation) -> usize {
        let from_signature = op.signature.len() / SIGNATURE_LEN;
        let from_owner = if op.init_code.is_empty() {
            self.accounts
                .as_ref()
                .and_then(|accounts| accounts.get(&op.sender))
                .map(|account| account.owner().signatures_required())
        } else {
            InitCode::decode(&op.init_code)
                .ok()
                .map(|init| init.owner.signatures_required())
        };
        from_owner.unwrap_or(0).max(from_signature).max(1)
    }

    async fn estimate_call_gas(&self, op: &UserOperation) -> U256 {
        if !op.init_code.is_empty() {
            // nothing deployed to dry-run against yet
            return self.config.default_call_gas_limit;
        }
        match bounded("get_code", self.config.timeout, self.ledger.get_code(op.sender)).await {
            Ok(code) if code.is_empty() => {
                debug!("No code at {:?}, skipping dry-run", op.sender);
                return self.config.default_call_gas_limit;
            }
            Ok(_) => {}
            Err(e) => warn!("Code lookup for {:?} failed, dry-running anyway: {}", op.sender, e),
        }
        let call = GasCall {
            from: self.entry_point,
            to: op.sender,
            data: op.call_data.clone(),
        };
        match bounded("estimate_gas", self.config.timeout, self.ledger.estimate_gas(&call)).await {
            Ok(gas) => {
                debug!("Dry-run for {:?} used {} gas", op.sender, gas);
                gas
            }
            Err(e) => {
                warn!("Call gas estimation failed, using default: {}", e);
                self.config.default_call_gas_limit
            }
        }
    }

    async fn estimate_fees(&self) -> (U256, U256) {
        match bounded("get_fee_market", self.config.timeout, self.ledger.get_fee_market()).await {
            Ok(market) => {
                let max_fee = market.max_fee_per_gas.max(market.gas_price);
                let buffered = max_fee
                    .checked_mul(U256::from(100 + self.config.fee_buffer_percent))
                    .map(|product| product / U256::from(100))
                    .unwrap_or(max_fee);
                (buffered, market.max_priority_fee_per_gas.min(buffered))
            }
            Err(e) => {
                warn!("Fee market query failed, using defaults: {}", e);
                (
                    self.config.default_max_fee_per_gas,
                    self.config.default_max_priority_fee_per_gas,
                )
            }
        }
    }
}
