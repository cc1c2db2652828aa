// src/types.rs
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

/// A batched action signed by a smart account and handed to the entry point.
///
/// The hash that gets signed covers every field except `signature`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    /// Factory address followed by the factory call. Only set for a first deployment.
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    /// Flat overhead estimated off-chain; never re-measured.
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    /// Empty when the account pays for itself.
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    pub fn sender(mut self, sender: Address) -> Self {
        self.sender = sender;
        self
    }

    pub fn nonce(mut self, nonce: impl Into<U256>) -> Self {
        self.nonce = nonce.into();
        self
    }

    pub fn init_code(mut self, init_code: Bytes) -> Self {
        self.init_code = init_code;
        self
    }

    pub fn call_data(mut self, call_data: Bytes) -> Self {
        self.call_data = call_data;
        self
    }

    pub fn call_gas_limit(mut self, call_gas_limit: impl Into<U256>) -> Self {
        self.call_gas_limit = call_gas_limit.into();
        self
    }

    pub fn verification_gas_limit(mut self, verification_gas_limit: impl Into<U256>) -> Self {
        self.verification_gas_limit = verification_gas_limit.into();
        self
    }

    pub fn pre_verification_gas(mut self, pre_verification_gas: impl Into<U256>) -> Self {
        self.pre_verification_gas = pre_verification_gas.into();
        self
    }

    pub fn max_fee_per_gas(mut self, max_fee_per_gas: impl Into<U256>) -> Self {
        self.max_fee_per_gas = max_fee_per_gas.into();
        self
    }

    pub fn max_priority_fee_per_gas(mut self, max_priority_fee_per_gas: impl Into<U256>) -> Self {
        self.max_priority_fee_per_gas = max_priority_fee_per_gas.into();
        self
    }

    pub fn paymaster_and_data(mut self, paymaster_and_data: Bytes) -> Self {
        self.paymaster_and_data = paymaster_and_data;
        self
    }

    pub fn signature(mut self, signature: Bytes) -> Self {
        self.signature = signature;
        self
    }

    /// Copies the advisory gas and fee fields of an estimate onto the operation.
    pub fn with_estimate(mut self, estimate: &GasEstimate) -> Self {
        self.call_gas_limit = estimate.call_gas_limit;
        self.verification_gas_limit = estimate.verification_gas_limit;
        self.pre_verification_gas = estimate.pre_verification_gas;
        self.max_fee_per_gas = estimate.max_fee_per_gas;
        self.max_priority_fee_per_gas = estimate.max_priority_fee_per_gas;
        self
    }

    pub fn is_sponsored(&self) -> bool {
        !self.paymaster_and_data.is_empty()
    }

    /// ABI-encodes every field except the signature. Variable-length fields enter as
    /// their keccak digests so each field owns exactly one 32-byte word.
    pub fn pack_without_signature(&self) -> Bytes {
        let encoded = encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(&self.paymaster_and_data).to_vec()),
        ]);

        Bytes::from(encoded)
    }

    /// The value account signers sign: bound to one entry point on one chain.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        let packed_hash = keccak256(self.pack_without_signature());
        let encoded = encode(&[
            Token::FixedBytes(packed_hash.to_vec()),
            Token::Address(entry_point),
            Token::Uint(U256::from(chain_id)),
        ]);
        H256::from(keccak256(encoded))
    }

    /// Upper bound on gas the operation may consume, preVerificationGas included.
    pub fn total_gas_limit(&self) -> Option<U256> {
        self.call_gas_limit
            .checked_add(self.verification_gas_limit)?
            .checked_add(self.pre_verification_gas)
    }

    /// Largest amount the payer may be charged for this operation.
    pub fn required_prefund(&self) -> Option<U256> {
        self.total_gas_limit()?.checked_mul(self.max_fee_per_gas)
    }

    /// ABI tuple used when the operation travels inside `handleOps`.
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::Bytes(self.init_code.to_vec()),
            Token::Bytes(self.call_data.to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::Bytes(self.paymaster_and_data.to_vec()),
            Token::Bytes(self.signature.to_vec()),
        ])
    }
}

/// Advisory gas and fee fields. The entry point never relies on them for correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterResponse {
    pub paymaster_and_data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UserOperation {
        UserOperation::default()
            .sender(Address::repeat_byte(0x11))
            .nonce(5u64)
            .call_data(Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6, 0x01]))
            .call_gas_limit(100_000u64)
            .verification_gas_limit(150_000u64)
            .pre_verification_gas(21_000u64)
            .max_fee_per_gas(50_000_000_000u64)
            .max_priority_fee_per_gas(2_000_000_000u64)
    }

    #[test]
    fn signature_is_not_part_of_the_hash() {
        let entry_point = Address::repeat_byte(0xee);
        let op = sample();
        let signed = op.clone().signature(Bytes::from(vec![7u8; 65]));

        assert_eq!(op.hash(entry_point, 1), signed.hash(entry_point, 1));
    }

    #[test]
    fn hash_binds_entry_point_and_chain() {
        let op = sample();
        let a = op.hash(Address::repeat_byte(0xee), 1);

        assert_ne!(a, op.hash(Address::repeat_byte(0xef), 1));
        assert_ne!(a, op.hash(Address::repeat_byte(0xee), 10));
    }

    #[test]
    fn packed_layout_is_ten_words() {
        assert_eq!(sample().pack_without_signature().len(), 10 * 32);
    }

    #[test]
    fn prefund_covers_all_gas_phases() {
        let op = sample();
        let expected = U256::from(271_000u64) * U256::from(50_000_000_000u64);
        assert_eq!(op.required_prefund(), Some(expected));

        let overflowing = op.call_gas_limit(U256::MAX);
        assert_eq!(overflowing.required_prefund(), None);
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("callGasLimit").is_some());
        assert!(json.get("paymasterAndData").is_some());
    }
}
