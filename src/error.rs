// src/error.rs
use std::fmt;

use ethers::types::{Address, U256};
use thiserror::Error;

/// Which party of an operation failed validation.
///
/// This is all a caller learns about a rejected operation: enough to know whether the
/// account or the paymaster side needs fixing, never which individual check tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    Account,
    Paymaster,
    Prefund,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStage::Account => f.write_str("account"),
            ValidationStage::Paymaster => f.write_str("paymaster"),
            ValidationStage::Prefund => f.write_str("prefund"),
        }
    }
}

/// The precise reason a validation failed. Only surfaced through `Debug` and
/// [`ValidationError::reason`] for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReason {
    SignatureRecovery,
    SignerMismatch,
    SignatureLength,
    SignerNotMember,
    SignerOrder,
    Replay,
    NonceGap,
    AccountNotDeployed,
    AccountAlreadyDeployed,
    InitCode,
    VerificationGasExceeded,
    UnknownPaymaster,
    PaymasterDataLength,
    PaymasterNonce,
    PaymasterSignature,
    PaymasterExpired,
    InsufficientDeposit,
}

impl ValidationReason {
    pub fn stage(self) -> ValidationStage {
        use ValidationReason::*;
        match self {
            UnknownPaymaster | PaymasterDataLength | PaymasterNonce | PaymasterSignature
            | PaymasterExpired => ValidationStage::Paymaster,
            InsufficientDeposit => ValidationStage::Prefund,
            _ => ValidationStage::Account,
        }
    }
}

/// A rejected operation. Nothing was mutated when this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{} validation failed", .reason.stage())]
pub struct ValidationError {
    reason: ValidationReason,
}

impl ValidationError {
    pub fn new(reason: ValidationReason) -> Self {
        Self { reason }
    }

    pub fn reason(&self) -> ValidationReason {
        self.reason
    }

    pub fn stage(&self) -> ValidationStage {
        self.reason.stage()
    }

    /// Nonce reuse. Reported to callers like any other account failure.
    pub fn is_replay(&self) -> bool {
        self.reason == ValidationReason::Replay
    }
}

impl From<ValidationReason> for ValidationError {
    fn from(reason: ValidationReason) -> Self {
        Self::new(reason)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("call reverted: {0}")]
    Reverted(String),

    #[error("out of gas: limit {limit}")]
    OutOfGas { limit: U256 },

    #[error("unknown account call selector 0x{0}")]
    UnknownSelector(String),

    #[error("malformed call data: {0}")]
    MalformedCallData(String),

    #[error(transparent)]
    Constraint(#[from] ConstraintError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing contract address: {0}")]
    MissingAddress(&'static str),

    #[error("invalid address for {field}: {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("unsupported network: chain id {0}")]
    UnsupportedNetwork(u64),

    #[error("missing signer for {0}")]
    MissingSigner(&'static str),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstraintError {
    #[error("signer set is empty")]
    EmptySignerSet,

    #[error("threshold must be at least 1")]
    ZeroThreshold,

    #[error("threshold {threshold} exceeds signer count {signers}")]
    ThresholdTooHigh { threshold: usize, signers: usize },

    #[error("duplicate signer {0:?}")]
    DuplicateSigner(Address),

    #[error("zero address cannot sign")]
    ZeroSigner,

    #[error("signer {0:?} is not a member")]
    NotASigner(Address),

    #[error("operation requires a multisig account")]
    NotMultisig,

    #[error("operation requires a single-owner account")]
    NotSimple,

    #[error("upgrade not authorized")]
    UnauthorizedUpgrade,

    #[error("implementation version {requested} is not newer than {current}")]
    StaleImplementation { current: u64, requested: u64 },
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ethereum provider error: {0}")]
    Provider(String),

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("unexpected response: {0}")]
    Decode(String),
}

// Off-chain sponsoring service errors.
#[derive(Error, Debug)]
pub enum PaymasterError {
    #[error("Invalid UserOperation: {0}")]
    InvalidUserOperation(String),

    #[error("Insufficient funds for sponsoring transaction")]
    InsufficientFunds,

    #[error("Signing failed")]
    SigningFailed,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
