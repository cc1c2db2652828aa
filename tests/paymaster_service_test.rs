//! The off-chain sponsoring service produces data the on-chain paymaster accepts.

mod common;

use std::sync::Arc;

use aa_orchestrator::entry_point::{BatchOptions, BatchState};
use aa_orchestrator::error::{ConfigError, PaymasterError};
use aa_orchestrator::ledger::LedgerClient;
use aa_orchestrator::paymaster::{Paymaster, PaymasterAndData, VerifyingPaymaster};
use common::*;
use ethers::types::{Address, U256};

const SPONSOR_KEY: u64 = 77;

fn paymaster_address() -> Address {
    Address::repeat_byte(0x9a)
}

fn service(ledger: MockLedger) -> Paymaster {
    let ledger: Arc<dyn LedgerClient> = Arc::new(ledger);
    Paymaster::new(&format!("{:064x}", SPONSOR_KEY), paymaster_address(), CHAIN_ID, ledger).unwrap()
}

#[tokio::test]
async fn signed_sponsorship_validates_on_chain() {
    let service = service(MockLedger::default());
    let verifier = VerifyingPaymaster::new(paymaster_address(), service.signer(), CHAIN_ID);
    let op = base_op(Address::repeat_byte(0x5e), 0);

    let response = service.sign_user_operation(&op).await.unwrap();
    let data = PaymasterAndData::decode(&response.paymaster_and_data).unwrap();
    assert_eq!(data.paymaster, paymaster_address());
    assert_eq!(data.nonce, U256::zero());

    let sponsored = op.paymaster_and_data(response.paymaster_and_data);
    let validation = verifier.validate(&sponsored, 0).unwrap();
    assert_eq!(validation.paymaster, paymaster_address());
}

#[tokio::test]
async fn sponsorship_uses_the_paymaster_nonce() {
    let service = service(MockLedger { paymaster_nonce: U256::from(4), ..MockLedger::default() });
    let op = base_op(Address::repeat_byte(0x5e), 0);

    let response = service.sign_user_operation(&op).await.unwrap();
    let data = PaymasterAndData::decode(&response.paymaster_and_data).unwrap();
    assert_eq!(data.nonce, U256::from(4));
}

#[tokio::test]
async fn tampered_operation_loses_sponsorship() {
    let service = service(MockLedger::default());
    let verifier = VerifyingPaymaster::new(paymaster_address(), service.signer(), CHAIN_ID);
    let op = base_op(Address::repeat_byte(0x5e), 0);

    let response = service.sign_user_operation(&op).await.unwrap();
    let tampered = op.call_gas_limit(5_000_000u64).paymaster_and_data(response.paymaster_and_data);
    assert!(verifier.validate(&tampered, 0).is_err());
}

#[tokio::test]
async fn underfunded_paymaster_refuses() {
    let service = service(MockLedger { balance: U256::from(1_000), ..MockLedger::default() });
    let op = base_op(Address::repeat_byte(0x5e), 0);

    assert!(matches!(
        service.sign_user_operation(&op).await,
        Err(PaymasterError::InsufficientFunds)
    ));
}

#[tokio::test]
async fn malformed_operations_are_refused() {
    let service = service(MockLedger::default());

    let no_sender = base_op(Address::zero(), 0);
    assert!(matches!(
        service.sign_user_operation(&no_sender).await,
        Err(PaymasterError::InvalidUserOperation(_))
    ));

    let inverted_fees = base_op(Address::repeat_byte(0x5e), 0).max_priority_fee_per_gas(11u64);
    assert!(matches!(
        service.sign_user_operation(&inverted_fees).await,
        Err(PaymasterError::InvalidUserOperation(_))
    ));
}

#[test]
fn max_cost_includes_buffer() {
    let service = service(MockLedger::default()).with_gas_price_buffer(20);
    let op = base_op(Address::repeat_byte(0x5e), 0);

    // 421_000 gas at 10 wei plus 20%
    assert_eq!(service.calculate_max_cost(&op).unwrap(), U256::from(421_000u64 * 12));
}

#[test]
fn bad_key_is_a_config_error() {
    let ledger: Arc<dyn LedgerClient> = Arc::new(MockLedger::default());
    let err = Paymaster::new("not a key", paymaster_address(), CHAIN_ID, ledger).err().unwrap();
    assert_eq!(err, ConfigError::MissingSigner("paymaster"));
}

#[tokio::test]
async fn sponsored_operation_runs_end_to_end() {
    let mut harness = Harness::new();
    let owner = wallet(1);
    let service = service(MockLedger::default());
    let verifier =
        Arc::new(VerifyingPaymaster::new(paymaster_address(), service.signer(), CHAIN_ID));
    harness.entry_point.register_paymaster(verifier.clone());
    harness.entry_point.deposit_to(paymaster_address(), U256::from(100_000_000u64));
    let sender = harness.simple_account(&owner, 0);

    let op = base_op(sender, 0);
    let response = service.sign_user_operation(&op).await.unwrap();
    let op = signed(op.paymaster_and_data(response.paymaster_and_data), &[&owner]);

    let report = harness.entry_point.handle_ops(&[op], beneficiary(), BatchOptions::default());
    assert_eq!(report.state, BatchState::Committed);
    assert_eq!(verifier.sender_nonce(sender), U256::one());
    assert!(harness.entry_point.balance_of(paymaster_address()) < U256::from(100_000_000u64));
}
