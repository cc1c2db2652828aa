//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aa_orchestrator::account::{AccountOwner, AccountStore, Call};
use aa_orchestrator::deposit::DepositLedger;
use aa_orchestrator::entry_point::{CallExecutor, EntryPoint, ExecutionOutcome};
use aa_orchestrator::error::{ExecutionError, LedgerError};
use aa_orchestrator::factory::AccountFactory;
use aa_orchestrator::ledger::{FeeMarket, GasCall, LedgerClient, SignedBatch};
use aa_orchestrator::paymaster::{sponsor_hash, PaymasterAndData, VerifyingPaymaster};
use aa_orchestrator::signature::sort_signatures;
use aa_orchestrator::types::UserOperation;
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::hash_message;

pub const CHAIN_ID: u64 = 31337;
pub const BASE_FEE: u64 = 5;
pub const GAS_PER_CALL: u64 = 30_000;

pub fn entry_point_address() -> Address {
    Address::repeat_byte(0xe0)
}

pub fn beneficiary() -> Address {
    Address::repeat_byte(0xbe)
}

pub fn wallet(seed: u64) -> LocalWallet {
    format!("{:064x}", seed).parse().unwrap()
}

/// `count` wallets ordered by address, so index order is signing order.
pub fn sorted_wallets(count: u64) -> Vec<LocalWallet> {
    let mut wallets: Vec<_> = (1..=count).map(|seed| wallet(seed + 100)).collect();
    wallets.sort_by_key(|w| w.address());
    wallets
}

pub fn sign(wallet: &LocalWallet, hash: H256) -> Vec<u8> {
    wallet.sign_hash(hash_message(hash)).unwrap().to_vec()
}

/// Concatenates the signers' signatures in the order given, without sorting.
pub fn sign_in_order(wallets: &[&LocalWallet], hash: H256) -> Bytes {
    Bytes::from(wallets.iter().flat_map(|w| sign(w, hash)).collect::<Vec<u8>>())
}

pub fn sign_multisig(wallets: &[&LocalWallet], hash: H256) -> Bytes {
    let chunks = wallets.iter().map(|w| sign(w, hash)).collect();
    Bytes::from(sort_signatures(hash, chunks))
}

/// Signs `op` for the test entry point with every wallet given.
pub fn signed(op: UserOperation, wallets: &[&LocalWallet]) -> UserOperation {
    let hash = op.hash(entry_point_address(), CHAIN_ID);
    op.signature(sign_multisig(wallets, hash))
}

pub fn base_op(sender: Address, nonce: u64) -> UserOperation {
    UserOperation::default()
        .sender(sender)
        .nonce(nonce)
        .call_gas_limit(100_000u64)
        .verification_gas_limit(300_000u64)
        .pre_verification_gas(21_000u64)
        .max_fee_per_gas(10u64)
        .max_priority_fee_per_gas(1u64)
}

/// Attaches a sponsorship signed by `signer` for the given sponsor nonce.
pub fn sponsor(
    op: UserOperation,
    paymaster: &VerifyingPaymaster,
    signer: &LocalWallet,
    nonce: u64,
) -> UserOperation {
    let nonce = U256::from(nonce);
    let hash = sponsor_hash(&op, paymaster.address(), nonce, CHAIN_ID);
    let data = PaymasterAndData {
        paymaster: paymaster.address(),
        nonce,
        signature: Bytes::from(sign(signer, hash)),
    };
    op.paymaster_and_data(data.encode())
}

/// Value transfers between plain balances. Calls to a target marked as reverting
/// fail the whole batch and leave balances untouched.
#[derive(Default)]
pub struct MemoryExecutor {
    balances: Mutex<HashMap<Address, U256>>,
    reverting: Mutex<HashSet<Address>>,
}

impl MemoryExecutor {
    pub fn fund(&self, address: Address, amount: u64) {
        *self.balances.lock().unwrap().entry(address).or_default() += U256::from(amount);
    }

    pub fn balance(&self, address: Address) -> U256 {
        self.balances.lock().unwrap().get(&address).copied().unwrap_or_default()
    }

    pub fn revert_on(&self, target: Address) {
        self.reverting.lock().unwrap().insert(target);
    }
}

impl CallExecutor for MemoryExecutor {
    fn execute(&self, sender: Address, calls: &[Call], gas_limit: U256) -> ExecutionOutcome {
        let gas = U256::from(GAS_PER_CALL * calls.len() as u64);
        if gas > gas_limit {
            let out_of_gas = ExecutionError::OutOfGas { limit: gas_limit };
            return ExecutionOutcome::reverted(gas_limit, out_of_gas);
        }

        let reverting = self.reverting.lock().unwrap();
        let mut balances = self.balances.lock().unwrap();
        let mut staged = balances.clone();
        for call in calls {
            if reverting.contains(&call.target) {
                let reverted = ExecutionError::Reverted("target reverted".into());
                return ExecutionOutcome::reverted(gas, reverted);
            }
            let from = staged.entry(sender).or_default();
            let Some(remaining) = from.checked_sub(call.value) else {
                let reverted = ExecutionError::Reverted("insufficient balance".into());
                return ExecutionOutcome::reverted(gas, reverted);
            };
            *from = remaining;
            *staged.entry(call.target).or_default() += call.value;
        }
        *balances = staged;
        ExecutionOutcome::success(gas)
    }
}

pub struct Harness {
    pub entry_point: EntryPoint,
    pub accounts: Arc<AccountStore>,
    pub deposits: Arc<DepositLedger>,
    pub factory: Arc<AccountFactory>,
    pub executor: Arc<MemoryExecutor>,
}

impl Harness {
    pub fn new() -> Self {
        let accounts = Arc::new(AccountStore::new());
        let deposits = Arc::new(DepositLedger::new());
        let executor = Arc::new(MemoryExecutor::default());
        let factory = Arc::new(AccountFactory::new(
            Address::repeat_byte(0xfa),
            H256::repeat_byte(0xc0),
            accounts.clone(),
        ));

        let mut entry_point = EntryPoint::new(
            entry_point_address(),
            CHAIN_ID,
            accounts.clone(),
            deposits.clone(),
            executor.clone(),
        )
        .with_base_fee(U256::from(BASE_FEE));
        entry_point.register_factory(factory.clone());

        Self { entry_point, accounts, deposits, factory, executor }
    }

    /// Deploys a single-owner account and funds its deposit.
    pub fn simple_account(&self, owner: &LocalWallet, deposit: u64) -> Address {
        let owner = AccountOwner::simple(owner.address()).unwrap();
        let address = self.factory.deploy_account(owner, U256::zero()).address;
        self.deposits.deposit_to(address, U256::from(deposit));
        address
    }

    pub fn multisig_account(
        &self,
        signers: &[LocalWallet],
        threshold: usize,
        deposit: u64,
    ) -> Address {
        let owner = AccountOwner::multisig(signers.iter().map(|w| w.address()), threshold).unwrap();
        let address = self.factory.deploy_account(owner, U256::zero()).address;
        self.deposits.deposit_to(address, U256::from(deposit));
        address
    }
}

/// Scriptable [`LedgerClient`]. `None` fields make the matching call fail.
pub struct MockLedger {
    pub call_gas: Option<U256>,
    /// Code reported for every address; empty means nothing deployed.
    pub code: Bytes,
    pub fee_market: Option<FeeMarket>,
    pub balance: U256,
    pub paymaster_nonce: U256,
    pub delay: Duration,
    pub submitted: Mutex<Vec<SignedBatch>>,
}

impl Default for MockLedger {
    fn default() -> Self {
        Self {
            call_gas: Some(U256::from(42_000u64)),
            code: Bytes::from(vec![0x60, 0x80]),
            fee_market: Some(FeeMarket {
                gas_price: U256::from(90u64),
                max_fee_per_gas: U256::from(100u64),
                max_priority_fee_per_gas: U256::from(2u64),
            }),
            balance: U256::exp10(18),
            paymaster_nonce: U256::zero(),
            delay: Duration::ZERO,
            submitted: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn estimate_gas(&self, _call: &GasCall) -> Result<U256, LedgerError> {
        tokio::time::sleep(self.delay).await;
        self.call_gas
            .ok_or_else(|| LedgerError::Provider("execution reverted".to_string()))
    }

    async fn get_fee_market(&self) -> Result<FeeMarket, LedgerError> {
        tokio::time::sleep(self.delay).await;
        self.fee_market
            .ok_or_else(|| LedgerError::Provider("fee history unavailable".to_string()))
    }

    async fn get_code(&self, _address: Address) -> Result<Bytes, LedgerError> {
        Ok(self.code.clone())
    }

    async fn get_balance(&self, _address: Address) -> Result<U256, LedgerError> {
        Ok(self.balance)
    }

    async fn paymaster_nonce(
        &self,
        _paymaster: Address,
        _sender: Address,
    ) -> Result<U256, LedgerError> {
        Ok(self.paymaster_nonce)
    }

    async fn submit(&self, batch: &SignedBatch) -> Result<H256, LedgerError> {
        self.submitted.lock().unwrap().push(batch.clone());
        Ok(H256::repeat_byte(0x7a))
    }
}
