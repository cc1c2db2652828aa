// src/signature.rs
//! Account signature validation.
//!
//! Both variants recover signers from EIP-191 personal-message signatures over the
//! operation hash. Every failure collapses into a [`ValidationError`] so callers cannot
//! tell which check tripped.

use std::collections::BTreeSet;

use ethers::types::{Address, Signature, H256};

use crate::error::{ValidationError, ValidationReason};

/// Length of one `r ‖ s ‖ v` ECDSA signature.
pub const SIGNATURE_LEN: usize = 65;

/// Recovers the address that signed `hash` as a personal message.
pub fn recover_signer(hash: H256, signature: &[u8]) -> Result<Address, ValidationError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(ValidationReason::SignatureLength.into());
    }
    let signature = Signature::try_from(signature)
        .map_err(|_| ValidationError::new(ValidationReason::SignatureRecovery))?;
    signature
        .recover(hash.as_bytes())
        .map_err(|_| ValidationReason::SignatureRecovery.into())
}

/// Single owner: the signature must recover to `owner`.
pub fn validate_owner_signature(
    hash: H256,
    signature: &[u8],
    owner: Address,
) -> Result<(), ValidationError> {
    let recovered = recover_signer(hash, signature)?;
    if recovered != owner {
        return Err(ValidationReason::SignerMismatch.into());
    }
    Ok(())
}

/// Threshold multisig: exactly `threshold` concatenated signatures whose recovered
/// signers are members of `signers` and strictly increasing by address.
///
/// The ordering rule is also what rejects a repeated signer, so callers must submit
/// chunks sorted by signer address.
pub fn validate_threshold_signature(
    hash: H256,
    signature: &[u8],
    signers: &BTreeSet<Address>,
    threshold: usize,
) -> Result<(), ValidationError> {
    let expected_len = threshold
        .checked_mul(SIGNATURE_LEN)
        .ok_or(ValidationError::new(ValidationReason::SignatureLength))?;
    if threshold == 0 || signature.len() != expected_len {
        return Err(ValidationReason::SignatureLength.into());
    }

    let mut last = Address::zero();
    for chunk in signature.chunks_exact(SIGNATURE_LEN) {
        let recovered = recover_signer(hash, chunk)?;
        if !signers.contains(&recovered) {
            return Err(ValidationReason::SignerNotMember.into());
        }
        if recovered <= last {
            return Err(ValidationReason::SignerOrder.into());
        }
        last = recovered;
    }
    Ok(())
}

/// Orders signature chunks by the address that produced them, as the threshold
/// validator requires. Chunks that do not recover are sorted last.
pub fn sort_signatures(hash: H256, mut chunks: Vec<Vec<u8>>) -> Vec<u8> {
    chunks.sort_by_cached_key(|chunk| {
        recover_signer(hash, chunk).map_or((1u8, Address::zero()), |signer| (0u8, signer))
    });
    chunks.concat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};
    use ethers::utils::hash_message;

    fn wallet(seed: u8) -> LocalWallet {
        format!("{:064x}", seed).parse().unwrap()
    }

    fn sign(wallet: &LocalWallet, hash: H256) -> Vec<u8> {
        wallet.sign_hash(hash_message(hash)).unwrap().to_vec()
    }

    #[test]
    fn owner_signature_recovers() {
        let owner = wallet(1);
        let hash = H256::repeat_byte(0xab);
        let sig = sign(&owner, hash);

        assert!(validate_owner_signature(hash, &sig, owner.address()).is_ok());
    }

    #[test]
    fn wrong_owner_is_a_mismatch() {
        let hash = H256::repeat_byte(0xab);
        let sig = sign(&wallet(1), hash);
        let other = wallet(2).address();

        let err = validate_owner_signature(hash, &sig, other).unwrap_err();
        assert_eq!(err.reason(), ValidationReason::SignerMismatch);
    }

    #[test]
    fn truncated_signature_is_rejected() {
        let hash = H256::repeat_byte(0xab);
        let sig = sign(&wallet(1), hash);

        let err = recover_signer(hash, &sig[..64]).unwrap_err();
        assert_eq!(err.reason(), ValidationReason::SignatureLength);
    }

    #[test]
    fn zero_threshold_never_validates() {
        let hash = H256::repeat_byte(0xab);
        let err = validate_threshold_signature(hash, &[], &BTreeSet::new(), 0).unwrap_err();
        assert_eq!(err.reason(), ValidationReason::SignatureLength);
    }

    #[test]
    fn sort_signatures_orders_by_signer() {
        let hash = H256::repeat_byte(0x42);
        let wallets: Vec<_> = (1..=3).map(wallet).collect();
        let chunks: Vec<_> = wallets.iter().rev().map(|w| sign(w, hash)).collect();
        let signers: BTreeSet<_> = wallets.iter().map(|w| w.address()).collect();

        let sorted = sort_signatures(hash, chunks);
        assert!(validate_threshold_signature(hash, &sorted, &signers, 3).is_ok());
    }
}
