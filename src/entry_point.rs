// src/entry_point.rs
//! The entry point: validates then executes user operations, one batch at a time.
//!
//! Each operation goes through a pure validation pass (account resolution, nonce,
//! signature, verification gas, paymaster, prefund), then a single commit step that
//! consumes the account nonce, the paymaster nonce and the prefund together. A failed
//! validation therefore mutates nothing. Execution happens right after the commit, in
//! submission order, because later operations may depend on earlier ones.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::id;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountCommand, AccountOwner, AccountStore, Authorization, Call};
use crate::deposit::DepositLedger;
use crate::error::{ExecutionError, ValidationError, ValidationReason};
use crate::factory::{AccountFactory, InitCode};
use crate::gas::{verification_gas, ACCOUNT_COMMAND_GAS};
use crate::paymaster::{PaymasterAndData, VerifyingPaymaster};
use crate::types::UserOperation;

const HANDLE_OPS: &str =
    "handleOps((address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes)[],address)";

/// ABI call data for `handleOps(ops, beneficiary)`.
pub fn encode_handle_ops(ops: &[UserOperation], beneficiary: Address) -> Bytes {
    let mut data = id(HANDLE_OPS).to_vec();
    data.extend(encode(&[
        Token::Array(ops.iter().map(UserOperation::to_token).collect()),
        Token::Address(beneficiary),
    ]));
    Bytes::from(data)
}

/// What running an account's calls produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub gas_used: U256,
    pub result: Result<(), ExecutionError>,
}

impl ExecutionOutcome {
    pub fn success(gas_used: impl Into<U256>) -> Self {
        Self { gas_used: gas_used.into(), result: Ok(()) }
    }

    pub fn reverted(gas_used: impl Into<U256>, error: ExecutionError) -> Self {
        Self { gas_used: gas_used.into(), result: Err(error) }
    }
}

/// Runs outbound calls on behalf of an account.
///
/// Implementations must be all-or-nothing: when the outcome is an error, no state
/// touched by `calls` may persist.
pub trait CallExecutor: Send + Sync {
    fn execute(&self, sender: Address, calls: &[Call], gas_limit: U256) -> ExecutionOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Abort the rest of the batch after the first execution failure.
    pub fail_on_error: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self { fail_on_error: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Received,
    Validating,
    Rejected,
    Executing,
    Committed,
    PartiallyFailed,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Received => "received",
            BatchState::Validating => "validating",
            BatchState::Rejected => "rejected",
            BatchState::Executing => "executing",
            BatchState::Committed => "committed",
            BatchState::PartiallyFailed => "partially failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpStatus {
    /// Failed validation. Nothing was mutated.
    Rejected(ValidationError),
    Executed,
    /// Validated and charged, but the call reverted. The nonce stays consumed.
    Reverted(ExecutionError),
    /// Never looked at because an earlier operation failed under `fail_on_error`.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpReceipt {
    pub index: usize,
    pub sender: Address,
    pub nonce: U256,
    pub user_op_hash: H256,
    pub paymaster: Option<Address>,
    pub status: OpStatus,
    pub actual_gas_used: U256,
    pub actual_gas_cost: U256,
}

impl OpReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == OpStatus::Executed
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub state: BatchState,
    pub receipts: Vec<OpReceipt>,
}

impl BatchReport {
    pub fn receipt(&self, index: usize) -> Option<&OpReceipt> {
        self.receipts.get(index)
    }

    pub fn succeeded(&self) -> usize {
        self.receipts.iter().filter(|r| r.succeeded()).count()
    }
}

/// Result of validating an operation without committing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationSummary {
    pub user_op_hash: H256,
    pub verification_gas: U256,
    pub prefund: U256,
    pub payer: Address,
    pub deploys_account: bool,
}

enum AccountSource {
    Existing(Arc<Account>),
    Deploy {
        factory: Arc<AccountFactory>,
        owner: AccountOwner,
        salt: U256,
    },
}

struct ValidatedOp {
    user_op_hash: H256,
    source: AccountSource,
    verification_gas: U256,
    payer: Address,
    prefund: U256,
    paymaster: Option<(Arc<VerifyingPaymaster>, U256)>,
}

pub struct EntryPoint {
    address: Address,
    chain_id: u64,
    base_fee: U256,
    accounts: Arc<AccountStore>,
    deposits: Arc<DepositLedger>,
    executor: Arc<dyn CallExecutor>,
    factories: HashMap<Address, Arc<AccountFactory>>,
    paymasters: HashMap<Address, Arc<VerifyingPaymaster>>,
}

impl EntryPoint {
    pub fn new(
        address: Address,
        chain_id: u64,
        accounts: Arc<AccountStore>,
        deposits: Arc<DepositLedger>,
        executor: Arc<dyn CallExecutor>,
    ) -> Self {
        info!("Initialized entry point {:?} on chain {}", address, chain_id);
        Self {
            address,
            chain_id,
            base_fee: U256::zero(),
            accounts,
            deposits,
            executor,
            factories: HashMap::new(),
            paymasters: HashMap::new(),
        }
    }

    pub fn with_base_fee(mut self, base_fee: U256) -> Self {
        self.base_fee = base_fee;
        self
    }

    pub fn register_factory(&mut self, factory: Arc<AccountFactory>) {
        self.factories.insert(factory.address(), factory);
    }

    pub fn register_paymaster(&mut self, paymaster: Arc<VerifyingPaymaster>) {
        self.paymasters.insert(paymaster.address(), paymaster);
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn deposits(&self) -> &DepositLedger {
        &self.deposits
    }

    pub fn deposit_to(&self, account: Address, amount: U256) -> U256 {
        self.deposits.deposit_to(account, amount)
    }

    pub fn balance_of(&self, account: Address) -> U256 {
        self.deposits.balance_of(account)
    }

    /// Current nonce of `sender`; zero for an account not deployed yet.
    pub fn get_nonce(&self, sender: Address) -> U256 {
        self.accounts
            .get(&sender)
            .map_or_else(U256::zero, |account| U256::from(account.nonce()))
    }

    pub fn get_user_op_hash(&self, op: &UserOperation) -> H256 {
        op.hash(self.address, self.chain_id)
    }

    /// Address the given `initCode` would deploy.
    pub fn get_sender_address(&self, init_code: &[u8]) -> Result<Address, ValidationError> {
        let init = InitCode::decode(init_code)?;
        let factory = self
            .factories
            .get(&init.factory)
            .ok_or(ValidationError::new(ValidationReason::InitCode))?;
        Ok(factory.get_address(&init.owner, init.salt))
    }

    /// Runs the full validation pipeline without committing anything.
    pub fn simulate_validation(
        &self,
        op: &UserOperation,
    ) -> Result<ValidationSummary, ValidationError> {
        let validated = self.validate(op, unix_now())?;
        Ok(ValidationSummary {
            user_op_hash: validated.user_op_hash,
            verification_gas: validated.verification_gas,
            prefund: validated.prefund,
            payer: validated.payer,
            deploys_account: matches!(validated.source, AccountSource::Deploy { .. }),
        })
    }

    pub fn handle_ops(
        &self,
        ops: &[UserOperation],
        beneficiary: Address,
        options: BatchOptions,
    ) -> BatchReport {
        self.handle_ops_at(ops, beneficiary, options, unix_now())
    }

    /// [`EntryPoint::handle_ops`] with an explicit timestamp for paymaster validity.
    pub fn handle_ops_at(
        &self,
        ops: &[UserOperation],
        beneficiary: Address,
        options: BatchOptions,
        now: u64,
    ) -> BatchReport {
        let mut state = BatchState::Received;
        debug!("Batch of {} operation(s) {}", ops.len(), state);
        state = BatchState::Validating;

        let mut receipts = Vec::with_capacity(ops.len());
        let mut any_validated = false;
        let mut any_failed = false;
        let mut aborted = false;

        for (index, op) in ops.iter().enumerate() {
            let mut receipt = OpReceipt {
                index,
                sender: op.sender,
                nonce: op.nonce,
                user_op_hash: self.get_user_op_hash(op),
                paymaster: PaymasterAndData::paymaster_of(&op.paymaster_and_data),
                status: OpStatus::Aborted,
                actual_gas_used: U256::zero(),
                actual_gas_cost: U256::zero(),
            };
            if aborted {
                receipts.push(receipt);
                continue;
            }

            let (validated, account) = match self
                .validate(op, now)
                .and_then(|validated| self.commit(op, validated))
            {
                Ok(committed) => committed,
                Err(err) => {
                    debug!(
                        index,
                        sender = ?op.sender,
                        reason = ?err.reason(),
                        "operation rejected"
                    );
                    any_failed = true;
                    receipt.status = OpStatus::Rejected(err);
                    receipts.push(receipt);
                    continue;
                }
            };
            any_validated = true;
            if state != BatchState::Executing {
                state = BatchState::Executing;
                debug!("Batch {}", state);
            }

            let outcome = self.execute(op, &account);
            let (gas_used, gas_cost) = self.settle(op, &validated, &outcome, beneficiary);
            receipt.actual_gas_used = gas_used;
            receipt.actual_gas_cost = gas_cost;

            match outcome.result {
                Ok(()) => receipt.status = OpStatus::Executed,
                Err(err) => {
                    warn!(index, sender = ?op.sender, "operation reverted: {}", err);
                    any_failed = true;
                    receipt.status = OpStatus::Reverted(err);
                    aborted = options.fail_on_error;
                }
            }
            receipts.push(receipt);
        }

        state = if !ops.is_empty() && !any_validated {
            BatchState::Rejected
        } else if any_failed {
            BatchState::PartiallyFailed
        } else {
            BatchState::Committed
        };
        info!("Batch of {} operation(s) {}", ops.len(), state);

        BatchReport { state, receipts }
    }

    fn validate(&self, op: &UserOperation, now: u64) -> Result<ValidatedOp, ValidationError> {
        let source = self.resolve_account(op)?;

        match &source {
            AccountSource::Existing(account) => {
                account.check_nonce(op.nonce)?;
            }
            AccountSource::Deploy { .. } if !op.nonce.is_zero() => {
                return Err(ValidationReason::NonceGap.into());
            }
            AccountSource::Deploy { .. } => {}
        }

        let user_op_hash = self.get_user_op_hash(op);
        let owner = match &source {
            AccountSource::Existing(account) => account.owner(),
            AccountSource::Deploy { owner, .. } => owner.clone(),
        };
        owner.validate(user_op_hash, &op.signature)?;

        let verification_gas = verification_gas(
            owner.signatures_required(),
            matches!(source, AccountSource::Deploy { .. }),
            op.is_sponsored(),
        );
        if verification_gas > op.verification_gas_limit {
            return Err(ValidationReason::VerificationGasExceeded.into());
        }

        let paymaster = if op.is_sponsored() {
            let paymaster = PaymasterAndData::paymaster_of(&op.paymaster_and_data)
                .and_then(|address| self.paymasters.get(&address))
                .ok_or(ValidationError::new(ValidationReason::UnknownPaymaster))?;
            let validation = paymaster.validate(op, now)?;
            Some((paymaster.clone(), validation.nonce))
        } else {
            None
        };

        let payer = paymaster.as_ref().map_or(op.sender, |(pm, _)| pm.address());
        let prefund = op
            .required_prefund()
            .ok_or(ValidationError::new(ValidationReason::InsufficientDeposit))?;
        if self.deposits.balance_of(payer) < prefund {
            return Err(ValidationReason::InsufficientDeposit.into());
        }

        Ok(ValidatedOp {
            user_op_hash,
            source,
            verification_gas,
            payer,
            prefund,
            paymaster,
        })
    }

    fn resolve_account(&self, op: &UserOperation) -> Result<AccountSource, ValidationError> {
        let deployed = self.accounts.get(&op.sender);
        if op.init_code.is_empty() {
            return deployed
                .map(AccountSource::Existing)
                .ok_or(ValidationError::new(ValidationReason::AccountNotDeployed));
        }
        if deployed.is_some() {
            return Err(ValidationReason::AccountAlreadyDeployed.into());
        }

        let init = InitCode::decode(&op.init_code)?;
        let factory = self
            .factories
            .get(&init.factory)
            .ok_or(ValidationError::new(ValidationReason::InitCode))?;
        if factory.get_address(&init.owner, init.salt) != op.sender {
            return Err(ValidationReason::InitCode.into());
        }
        Ok(AccountSource::Deploy {
            factory: factory.clone(),
            owner: init.owner,
            salt: init.salt,
        })
    }

    /// Consumes the paymaster nonce, the prefund and the account nonce as one step.
    fn commit(
        &self,
        op: &UserOperation,
        validated: ValidatedOp,
    ) -> Result<(ValidatedOp, Arc<Account>), ValidationError> {
        let paymaster = validated.paymaster.clone();
        let reservation = match &paymaster {
            Some((paymaster, nonce)) => Some(paymaster.reserve_nonce(op.sender, *nonce)?),
            None => None,
        };

        let account = self.deposits.debit_with(
            validated.payer,
            validated.prefund,
            ValidationError::new(ValidationReason::InsufficientDeposit),
            || {
                let account = match &validated.source {
                    AccountSource::Existing(account) => account.clone(),
                    AccountSource::Deploy { factory, owner, salt } => {
                        factory.deploy_account(owner.clone(), *salt).account
                    }
                };
                account.try_consume_nonce(op.nonce)?;
                Ok(account)
            },
        )?;

        if let Some(reservation) = reservation {
            reservation.commit();
        }
        Ok((validated, account))
    }

    fn execute(&self, op: &UserOperation, account: &Account) -> ExecutionOutcome {
        let gas_limit = op.call_gas_limit;
        let command = match AccountCommand::decode(&op.call_data) {
            Ok(command) => command,
            Err(err) => return ExecutionOutcome::reverted(U256::zero(), err),
        };

        let outcome = match &command {
            AccountCommand::Noop => ExecutionOutcome::success(U256::zero()),
            AccountCommand::Execute(call) => {
                self.executor.execute(op.sender, std::slice::from_ref(call), gas_limit)
            }
            AccountCommand::ExecuteBatch(calls) => {
                self.executor.execute(op.sender, calls, gas_limit)
            }
            admin => {
                let gas = U256::from(ACCOUNT_COMMAND_GAS);
                if gas > gas_limit {
                    let out_of_gas = ExecutionError::OutOfGas { limit: gas_limit };
                    ExecutionOutcome::reverted(gas_limit, out_of_gas)
                } else {
                    let authorization = Authorization::new(account.address());
                    match account.apply(admin, &authorization) {
                        Ok(()) => ExecutionOutcome::success(gas),
                        Err(err) => ExecutionOutcome::reverted(gas, err),
                    }
                }
            }
        };

        if outcome.gas_used > gas_limit {
            let out_of_gas = ExecutionError::OutOfGas { limit: gas_limit };
            return ExecutionOutcome::reverted(gas_limit, out_of_gas);
        }
        outcome
    }

    /// Charges the payer for what was actually used and refunds the rest of the prefund.
    fn settle(
        &self,
        op: &UserOperation,
        validated: &ValidatedOp,
        outcome: &ExecutionOutcome,
        beneficiary: Address,
    ) -> (U256, U256) {
        let gas_used = validated
            .verification_gas
            .saturating_add(outcome.gas_used)
            .saturating_add(op.pre_verification_gas);
        let gas_price = op
            .max_fee_per_gas
            .min(self.base_fee.saturating_add(op.max_priority_fee_per_gas));
        let gas_cost = gas_used.saturating_mul(gas_price).min(validated.prefund);

        match &validated.paymaster {
            Some((paymaster, _)) => {
                self.deposits.deposit_to(validated.payer, validated.prefund);
                paymaster.post_op(&self.deposits, gas_cost);
            }
            None => {
                self.deposits.deposit_to(validated.payer, validated.prefund - gas_cost);
                self.deposits.deposit_to(beneficiary, gas_cost);
            }
        }
        debug!(sender = ?op.sender, %gas_used, %gas_cost, "operation settled");
        (gas_used, gas_cost)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
