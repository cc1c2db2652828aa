// src/lib.rs
//! Account-abstraction validation and orchestration.
//!
//! A smart account authorizes a [`UserOperation`] with one owner signature or a
//! threshold of ordered multisig signatures; a paymaster may sponsor its gas. The
//! [`EntryPoint`] validates each operation, consumes its nonce and executes it, charging
//! gas to the account or the paymaster. Counterfactual accounts are deployed by an
//! [`AccountFactory`] on their first operation.

pub mod account;
pub mod config;
pub mod deposit;
pub mod entry_point;
pub mod error;
pub mod factory;
pub mod gas;
pub mod ledger;
pub mod paymaster;
pub mod proof;
pub mod rpc;
pub mod signature;
pub mod types;

pub use account::{Account, AccountCommand, AccountOwner, AccountStore, Call, SignerSet};
pub use deposit::DepositLedger;
pub use entry_point::{
    BatchOptions, BatchReport, BatchState, CallExecutor, EntryPoint, ExecutionOutcome, OpStatus,
};
pub use error::{ValidationError, ValidationReason};
pub use factory::{AccountFactory, Deployment, InitCode};
pub use gas::{GasEstimator, GasEstimatorConfig};
pub use ledger::{LedgerClient, ProviderClient};
pub use paymaster::{Paymaster, PaymasterAndData, VerifyingPaymaster};
pub use types::{GasEstimate, UserOperation};
