// src/factory.rs
//! Counterfactual account deployment.
//!
//! Addresses follow CREATE2 over the factory address, the salt and a hash of the account
//! code plus its constructor arguments, so they are known before anything is deployed.

use std::sync::Arc;

use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{get_create2_address_from_hash, id, keccak256};
use tracing::{debug, info};

use crate::account::{Account, AccountOwner, AccountStore};
use crate::error::{ValidationError, ValidationReason};

const CREATE_ACCOUNT: &str = "createAccount(address,uint256)";
const CREATE_MULTISIG_ACCOUNT: &str = "createMultisigAccount(address[],uint256,uint256)";

const ADDR_LEN: usize = 20;

#[derive(Debug, Clone)]
pub struct Deployment {
    pub address: Address,
    pub account: Arc<Account>,
    pub is_new_deployment: bool,
}

/// Decoded `initCode`: which factory to call and with what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitCode {
    pub factory: Address,
    pub owner: AccountOwner,
    pub salt: U256,
}

impl InitCode {
    pub fn encode(&self) -> Bytes {
        let (signature, mut tokens) = match &self.owner {
            AccountOwner::Simple(_) => (CREATE_ACCOUNT, self.owner.constructor_tokens()),
            AccountOwner::Multisig(_) => {
                (CREATE_MULTISIG_ACCOUNT, self.owner.constructor_tokens())
            }
        };
        tokens.push(Token::Uint(self.salt));

        let mut data = self.factory.as_bytes().to_vec();
        data.extend_from_slice(&id(signature));
        data.extend(encode(&tokens));
        Bytes::from(data)
    }

    /// Any malformed init code is a validation failure of the operation carrying it.
    pub fn decode(init_code: &[u8]) -> Result<Self, ValidationError> {
        if init_code.len() < ADDR_LEN + 4 {
            return Err(ValidationReason::InitCode.into());
        }
        let (factory, call) = init_code.split_at(ADDR_LEN);
        let (selector, args) = call.split_at(4);
        let malformed = |_| ValidationError::new(ValidationReason::InitCode);

        let (owner, salt) = if selector == id(CREATE_ACCOUNT) {
            let tokens =
                decode(&[ParamType::Address, ParamType::Uint(256)], args).map_err(malformed)?;
            match tokens.as_slice() {
                [Token::Address(owner), Token::Uint(salt)] => (AccountOwner::simple(*owner), *salt),
                _ => return Err(ValidationReason::InitCode.into()),
            }
        } else if selector == id(CREATE_MULTISIG_ACCOUNT) {
            let tokens = decode(
                &[
                    ParamType::Array(Box::new(ParamType::Address)),
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                ],
                args,
            )
            .map_err(malformed)?;
            match tokens.as_slice() {
                [Token::Array(signers), Token::Uint(threshold), Token::Uint(salt)]
                    if *threshold <= U256::from(u32::MAX) =>
                {
                    let signers = signers.iter().filter_map(|t| t.clone().into_address());
                    (AccountOwner::multisig(signers, threshold.as_usize()), *salt)
                }
                _ => return Err(ValidationReason::InitCode.into()),
            }
        } else {
            return Err(ValidationReason::InitCode.into());
        };

        Ok(Self {
            factory: Address::from_slice(factory),
            owner: owner.map_err(|_| ValidationError::new(ValidationReason::InitCode))?,
            salt,
        })
    }
}

pub struct AccountFactory {
    address: Address,
    account_code_hash: H256,
    accounts: Arc<AccountStore>,
}

impl AccountFactory {
    pub fn new(address: Address, account_code_hash: H256, accounts: Arc<AccountStore>) -> Self {
        info!("Initialized account factory at {:?}", address);
        Self { address, account_code_hash, accounts }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Deterministic address of the account for `(owner, salt)`. Pure.
    pub fn get_address(&self, owner: &AccountOwner, salt: U256) -> Address {
        let args_hash = keccak256(encode(&owner.constructor_tokens()));

        let mut creation = self.account_code_hash.as_bytes().to_vec();
        creation.extend_from_slice(&args_hash);
        let init_code_hash = keccak256(creation);

        let mut salt_bytes = [0u8; 32];
        salt.to_big_endian(&mut salt_bytes);

        get_create2_address_from_hash(self.address, salt_bytes, init_code_hash)
    }

    /// Deploys and initializes the account, or returns the one already there. Safe to
    /// race: exactly one caller observes `is_new_deployment == true`.
    pub fn deploy_account(&self, owner: AccountOwner, salt: U256) -> Deployment {
        let address = self.get_address(&owner, salt);
        let (account, is_new_deployment) = self
            .accounts
            .get_or_insert_with(address, || Account::new(address, owner));

        if is_new_deployment {
            info!("Deployed account {:?} (salt {})", address, salt);
        } else {
            debug!("Account {:?} already deployed", address);
        }

        Deployment { address, account, is_new_deployment }
    }

    /// The `initCode` a client puts on its first operation.
    pub fn init_code(&self, owner: AccountOwner, salt: U256) -> Bytes {
        InitCode { factory: self.address, owner, salt }.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> AccountFactory {
        AccountFactory::new(
            Address::repeat_byte(0xfa),
            H256::repeat_byte(0xc0),
            Arc::new(AccountStore::new()),
        )
    }

    #[test]
    fn address_depends_on_owner_and_salt() {
        let factory = factory();
        let owner = AccountOwner::simple(Address::repeat_byte(1)).unwrap();
        let other = AccountOwner::simple(Address::repeat_byte(2)).unwrap();

        let a = factory.get_address(&owner, U256::zero());
        assert_eq!(a, factory.get_address(&owner, U256::zero()));
        assert_ne!(a, factory.get_address(&owner, U256::one()));
        assert_ne!(a, factory.get_address(&other, U256::zero()));
    }

    #[test]
    fn multisig_address_ignores_signer_order() {
        let factory = factory();
        let signers = [Address::repeat_byte(1), Address::repeat_byte(2), Address::repeat_byte(3)];
        let forward = AccountOwner::multisig(signers, 2).unwrap();
        let reversed = AccountOwner::multisig(signers.into_iter().rev(), 2).unwrap();

        assert_eq!(
            factory.get_address(&forward, U256::from(7)),
            factory.get_address(&reversed, U256::from(7))
        );
    }

    #[test]
    fn init_code_round_trips() {
        let factory = factory();
        let owner =
            AccountOwner::multisig([Address::repeat_byte(4), Address::repeat_byte(5)], 1).unwrap();
        let code = factory.init_code(owner.clone(), U256::from(3));

        let decoded = InitCode::decode(&code).unwrap();
        assert_eq!(decoded.factory, factory.address());
        assert_eq!(decoded.owner, owner);
        assert_eq!(decoded.salt, U256::from(3));
    }

    #[test]
    fn init_code_with_invalid_signer_set_is_rejected() {
        let bogus = InitCode {
            factory: Address::repeat_byte(0xfa),
            owner: AccountOwner::Simple(Address::zero()),
            salt: U256::zero(),
        };
        let err = InitCode::decode(&bogus.encode()).unwrap_err();
        assert_eq!(err.reason(), ValidationReason::InitCode);
    }
}
