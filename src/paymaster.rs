// src/paymaster.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use ethers::abi::{encode, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use tracing::{debug, error, info};

use crate::deposit::DepositLedger;
use crate::error::{ConfigError, PaymasterError, ValidationError, ValidationReason};
use crate::ledger::LedgerClient;
use crate::signature::{recover_signer, SIGNATURE_LEN};
use crate::types::{PaymasterResponse, UserOperation};

const ADDR_LEN: usize = 20;
const NONCE_LEN: usize = 32;

/// Minimum `paymasterAndData` length: address, nonce and one signature.
pub const PAYMASTER_DATA_MIN_LEN: usize = ADDR_LEN + NONCE_LEN + SIGNATURE_LEN;

/// `paymaster ‖ nonce (32 bytes) ‖ signature`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymasterAndData {
    pub paymaster: Address,
    pub nonce: U256,
    pub signature: Bytes,
}

impl PaymasterAndData {
    pub fn encode(&self) -> Bytes {
        let mut data = Vec::with_capacity(ADDR_LEN + NONCE_LEN + self.signature.len());
        data.extend_from_slice(self.paymaster.as_bytes());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.nonce.to_big_endian(&mut nonce_bytes);
        data.extend_from_slice(&nonce_bytes);

        data.extend_from_slice(&self.signature);
        Bytes::from(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ValidationError> {
        if data.len() < PAYMASTER_DATA_MIN_LEN {
            return Err(ValidationReason::PaymasterDataLength.into());
        }
        Ok(Self {
            paymaster: Address::from_slice(&data[..ADDR_LEN]),
            nonce: U256::from_big_endian(&data[ADDR_LEN..ADDR_LEN + NONCE_LEN]),
            signature: Bytes::from(data[ADDR_LEN + NONCE_LEN..].to_vec()),
        })
    }

    /// Reads only the paymaster address, for routing.
    pub fn paymaster_of(data: &[u8]) -> Option<Address> {
        (data.len() >= ADDR_LEN).then(|| Address::from_slice(&data[..ADDR_LEN]))
    }
}

/// Hash the paymaster signer signs to sponsor `op` with sponsorship `nonce`.
pub fn sponsor_hash(op: &UserOperation, paymaster: Address, nonce: U256, chain_id: u64) -> H256 {
    let encoded = encode(&[
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::FixedBytes(keccak256(&op.init_code).to_vec()),
        Token::FixedBytes(keccak256(&op.call_data).to_vec()),
        Token::Uint(op.call_gas_limit),
        Token::Uint(op.verification_gas_limit),
        Token::Uint(op.pre_verification_gas),
        Token::Uint(op.max_fee_per_gas),
        Token::Uint(op.max_priority_fee_per_gas),
        Token::Address(paymaster),
        Token::Uint(nonce),
        Token::Uint(U256::from(chain_id)),
    ]);
    H256::from(keccak256(encoded))
}

/// Outcome of a successful, not yet committed, paymaster validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymasterValidation {
    pub paymaster: Address,
    pub nonce: U256,
}

/// The entry point's view of a verifying paymaster contract.
///
/// Its per-sender nonce is independent of the account nonce: each sponsorship nonce
/// is usable once and in order.
#[derive(Debug)]
pub struct VerifyingPaymaster {
    address: Address,
    signer: Address,
    chain_id: u64,
    valid_after: u64,
    valid_until: u64,
    nonces: Mutex<HashMap<Address, U256>>,
}

impl VerifyingPaymaster {
    pub fn new(address: Address, signer: Address, chain_id: u64) -> Self {
        Self {
            address,
            signer,
            chain_id,
            valid_after: 0,
            valid_until: u64::MAX,
            nonces: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_validity(mut self, valid_after: u64, valid_until: u64) -> Self {
        self.valid_after = valid_after;
        self.valid_until = valid_until;
        self
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn signer(&self) -> Address {
        self.signer
    }

    pub fn sender_nonce(&self, sender: Address) -> U256 {
        self.lock_nonces().get(&sender).copied().unwrap_or_default()
    }

    fn lock_nonces(&self) -> MutexGuard<'_, HashMap<Address, U256>> {
        self.nonces.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Checks the sponsorship attached to `op` without consuming anything.
    pub fn validate(
        &self,
        op: &UserOperation,
        now: u64,
    ) -> Result<PaymasterValidation, ValidationError> {
        let data = PaymasterAndData::decode(&op.paymaster_and_data)?;
        if data.paymaster != self.address {
            return Err(ValidationReason::UnknownPaymaster.into());
        }
        if now < self.valid_after || now > self.valid_until {
            return Err(ValidationReason::PaymasterExpired.into());
        }
        if data.nonce != self.sender_nonce(op.sender) {
            return Err(ValidationReason::PaymasterNonce.into());
        }

        let hash = sponsor_hash(op, self.address, data.nonce, self.chain_id);
        let recovered = recover_signer(hash, &data.signature)
            .map_err(|_| ValidationError::new(ValidationReason::PaymasterSignature))?;
        if recovered != self.signer {
            return Err(ValidationReason::PaymasterSignature.into());
        }

        Ok(PaymasterValidation { paymaster: self.address, nonce: data.nonce })
    }

    /// Locks `sender`'s sponsorship nonce if it still equals `nonce`. The nonce only
    /// moves when the reservation is committed.
    pub fn reserve_nonce(
        &self,
        sender: Address,
        nonce: U256,
    ) -> Result<NonceReservation<'_>, ValidationError> {
        let nonces = self.lock_nonces();
        let current = nonces.get(&sender).copied().unwrap_or_default();
        if current != nonce {
            return Err(ValidationReason::PaymasterNonce.into());
        }
        Ok(NonceReservation { nonces, sender, next: current + 1 })
    }

    /// Post-execution hook: pays the consumed gas cost out of the paymaster deposit to
    /// its signer.
    pub fn post_op(&self, deposits: &DepositLedger, actual_gas_cost: U256) -> U256 {
        let paid = deposits.transfer(self.address, self.signer, actual_gas_cost);
        debug!(paymaster = ?self.address, %actual_gas_cost, %paid, "paymaster post-op settled");
        paid
    }
}

/// A held sponsorship nonce. Dropping it without [`NonceReservation::commit`] leaves the
/// nonce unchanged.
pub struct NonceReservation<'a> {
    nonces: MutexGuard<'a, HashMap<Address, U256>>,
    sender: Address,
    next: U256,
}

impl NonceReservation<'_> {
    pub fn commit(mut self) {
        self.nonces.insert(self.sender, self.next);
    }
}

/// Off-chain sponsoring service: checks an operation is worth sponsoring and signs the
/// `paymasterAndData` the on-chain paymaster will verify.
pub struct Paymaster {
    wallet: LocalWallet,
    ledger: Arc<dyn LedgerClient>,
    pub paymaster_address: Address,
    chain_id: u64,
    gas_price_buffer: u64, // Buffer percentage for gas price
}

impl Paymaster {
    pub fn new(
        private_key: &str,
        paymaster_address: Address,
        chain_id: u64,
        ledger: Arc<dyn LedgerClient>,
    ) -> Result<Self, ConfigError> {
        let wallet = private_key
            .parse::<LocalWallet>()
            .map_err(|_| ConfigError::MissingSigner("paymaster"))?
            .with_chain_id(chain_id);

        info!(
            "Initialized paymaster {:?} with signer {:?}",
            paymaster_address,
            wallet.address()
        );

        Ok(Self {
            wallet,
            ledger,
            paymaster_address,
            chain_id,
            gas_price_buffer: 10,
        })
    }

    pub fn with_gas_price_buffer(mut self, percent: u64) -> Self {
        self.gas_price_buffer = percent;
        self
    }

    pub fn signer(&self) -> Address {
        self.wallet.address()
    }

    // Sign a user operation to sponsor it
    pub async fn sign_user_operation(
        &self,
        user_op: &UserOperation,
    ) -> Result<PaymasterResponse, PaymasterError> {
        self.validate_user_operation(user_op)?;

        let max_cost = self.calculate_max_cost(user_op)?;
        self.check_paymaster_balance(max_cost).await?;

        let nonce = self.ledger.paymaster_nonce(self.paymaster_address, user_op.sender).await?;
        let signature = self.sign_paymaster_data(user_op, nonce).await?;

        let paymaster_and_data = PaymasterAndData {
            paymaster: self.paymaster_address,
            nonce,
            signature,
        }
        .encode();

        info!("Sponsored operation for {:?} (sponsor nonce {})", user_op.sender, nonce);
        Ok(PaymasterResponse { paymaster_and_data })
    }

    fn validate_user_operation(&self, user_op: &UserOperation) -> Result<(), PaymasterError> {
        if user_op.sender.is_zero() {
            return Err(PaymasterError::InvalidUserOperation("Sender cannot be zero".to_string()));
        }
        if user_op.max_fee_per_gas.is_zero() || user_op.max_priority_fee_per_gas.is_zero() {
            return Err(PaymasterError::InvalidUserOperation(
                "Gas price cannot be zero".to_string(),
            ));
        }
        if user_op.max_priority_fee_per_gas > user_op.max_fee_per_gas {
            return Err(PaymasterError::InvalidUserOperation(
                "Priority fee exceeds max fee".to_string(),
            ));
        }
        Ok(())
    }

    /// (callGasLimit + verificationGasLimit + preVerificationGas) * buffered maxFeePerGas
    pub fn calculate_max_cost(&self, user_op: &UserOperation) -> Result<U256, PaymasterError> {
        let total_gas = user_op
            .total_gas_limit()
            .ok_or_else(|| PaymasterError::InvalidUserOperation("Gas limit overflow".to_string()))?;

        let buffered_gas_price = user_op
            .max_fee_per_gas
            .checked_mul(U256::from(100 + self.gas_price_buffer))
            .and_then(|product| product.checked_div(U256::from(100)))
            .ok_or_else(|| {
                PaymasterError::InvalidUserOperation("Gas price calculation error".to_string())
            })?;

        total_gas
            .checked_mul(buffered_gas_price)
            .ok_or_else(|| {
                PaymasterError::InvalidUserOperation("Max cost calculation overflow".to_string())
            })
    }

    async fn check_paymaster_balance(&self, max_cost: U256) -> Result<(), PaymasterError> {
        let balance = self.ledger.get_balance(self.paymaster_address).await?;
        if balance <= max_cost {
            return Err(PaymasterError::InsufficientFunds);
        }
        Ok(())
    }

    async fn sign_paymaster_data(
        &self,
        user_op: &UserOperation,
        nonce: U256,
    ) -> Result<Bytes, PaymasterError> {
        let hash = sponsor_hash(user_op, self.paymaster_address, nonce, self.chain_id);
        let signature = self.wallet.sign_message(hash.as_bytes()).await.map_err(|e| {
            error!("Paymaster signing failed: {}", e);
            PaymasterError::SigningFailed
        })?;
        Ok(Bytes::from(signature.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::utils::hash_message;

    fn signer_wallet() -> LocalWallet {
        format!("{:064x}", 77).parse().unwrap()
    }

    fn sponsored_op(
        paymaster: &VerifyingPaymaster,
        wallet: &LocalWallet,
        nonce: U256,
    ) -> UserOperation {
        let op = UserOperation::default()
            .sender(Address::repeat_byte(0x5e))
            .call_gas_limit(50_000u64)
            .max_fee_per_gas(10u64)
            .max_priority_fee_per_gas(1u64);
        let hash = sponsor_hash(&op, paymaster.address(), nonce, 1);
        let signature = wallet.sign_hash(hash_message(hash)).unwrap().to_vec();
        let data = PaymasterAndData {
            paymaster: paymaster.address(),
            nonce,
            signature: signature.into(),
        };
        op.paymaster_and_data(data.encode())
    }

    #[test]
    fn data_layout_is_address_nonce_signature() {
        let data = PaymasterAndData {
            paymaster: Address::repeat_byte(0xaa),
            nonce: U256::from(3),
            signature: Bytes::from(vec![9u8; SIGNATURE_LEN]),
        };
        let encoded = data.encode();

        assert_eq!(encoded.len(), PAYMASTER_DATA_MIN_LEN);
        assert_eq!(encoded[51], 3);
        assert_eq!(PaymasterAndData::decode(&encoded).unwrap(), data);
        assert_eq!(
            PaymasterAndData::decode(&encoded[..PAYMASTER_DATA_MIN_LEN - 1]).unwrap_err().reason(),
            ValidationReason::PaymasterDataLength
        );
    }

    #[test]
    fn validates_and_commits_sponsor_nonce() {
        let wallet = signer_wallet();
        let paymaster = VerifyingPaymaster::new(Address::repeat_byte(0xaa), wallet.address(), 1);
        let op = sponsored_op(&paymaster, &wallet, U256::zero());

        let validation = paymaster.validate(&op, 100).unwrap();
        paymaster.reserve_nonce(op.sender, validation.nonce).unwrap().commit();
        assert_eq!(paymaster.sender_nonce(op.sender), U256::one());

        let stale = paymaster.validate(&op, 100).unwrap_err();
        assert_eq!(stale.reason(), ValidationReason::PaymasterNonce);
    }

    #[test]
    fn dropped_reservation_keeps_nonce() {
        let paymaster =
            VerifyingPaymaster::new(Address::repeat_byte(0xaa), Address::repeat_byte(1), 1);
        let sender = Address::repeat_byte(2);

        drop(paymaster.reserve_nonce(sender, U256::zero()).unwrap());
        assert_eq!(paymaster.sender_nonce(sender), U256::zero());
        assert!(paymaster.reserve_nonce(sender, U256::one()).is_err());
    }

    #[test]
    fn foreign_signer_is_rejected() {
        let wallet = signer_wallet();
        let impostor: LocalWallet = format!("{:064x}", 78).parse().unwrap();
        let paymaster = VerifyingPaymaster::new(Address::repeat_byte(0xaa), wallet.address(), 1);
        let op = sponsored_op(&paymaster, &impostor, U256::zero());

        let err = paymaster.validate(&op, 100).unwrap_err();
        assert_eq!(err.reason(), ValidationReason::PaymasterSignature);
        assert_eq!(err.to_string(), "paymaster validation failed");
    }

    #[test]
    fn validity_window_is_enforced() {
        let wallet = signer_wallet();
        let paymaster = VerifyingPaymaster::new(Address::repeat_byte(0xaa), wallet.address(), 1)
            .with_validity(100, 200);
        let op = sponsored_op(&paymaster, &wallet, U256::zero());

        assert!(paymaster.validate(&op, 150).is_ok());
        for now in [99, 201] {
            let err = paymaster.validate(&op, now).unwrap_err();
            assert_eq!(err.reason(), ValidationReason::PaymasterExpired);
        }
    }

    #[test]
    fn post_op_moves_cost_to_signer() {
        let paymaster =
            VerifyingPaymaster::new(Address::repeat_byte(0xaa), Address::repeat_byte(0xbb), 1);
        let deposits = DepositLedger::new();
        deposits.deposit_to(paymaster.address(), U256::from(1_000));

        assert_eq!(paymaster.post_op(&deposits, U256::from(300)), U256::from(300));
        assert_eq!(deposits.balance_of(paymaster.address()), U256::from(700));
        assert_eq!(deposits.balance_of(paymaster.signer()), U256::from(300));
    }
}
