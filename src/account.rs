// src/account.rs
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::id;
use tracing::{debug, info};

use crate::error::{ConstraintError, ExecutionError, ValidationError, ValidationReason};
use crate::signature::{validate_owner_signature, validate_threshold_signature};

/// Signers of a threshold account. Membership is order independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerSet {
    signers: BTreeSet<Address>,
    threshold: usize,
}

impl SignerSet {
    pub fn new(
        signers: impl IntoIterator<Item = Address>,
        threshold: usize,
    ) -> Result<Self, ConstraintError> {
        let mut set = BTreeSet::new();
        for signer in signers {
            if signer.is_zero() {
                return Err(ConstraintError::ZeroSigner);
            }
            if !set.insert(signer) {
                return Err(ConstraintError::DuplicateSigner(signer));
            }
        }
        Self::check(&set, threshold)?;
        Ok(Self { signers: set, threshold })
    }

    fn check(signers: &BTreeSet<Address>, threshold: usize) -> Result<(), ConstraintError> {
        if signers.is_empty() {
            return Err(ConstraintError::EmptySignerSet);
        }
        if threshold == 0 {
            return Err(ConstraintError::ZeroThreshold);
        }
        if threshold > signers.len() {
            return Err(ConstraintError::ThresholdTooHigh {
                threshold,
                signers: signers.len(),
            });
        }
        Ok(())
    }

    pub fn signers(&self) -> &BTreeSet<Address> {
        &self.signers
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn contains(&self, signer: &Address) -> bool {
        self.signers.contains(signer)
    }

    fn with_signer(&self, signer: Address) -> Result<Self, ConstraintError> {
        if signer.is_zero() {
            return Err(ConstraintError::ZeroSigner);
        }
        let mut signers = self.signers.clone();
        if !signers.insert(signer) {
            return Err(ConstraintError::DuplicateSigner(signer));
        }
        Ok(Self { signers, threshold: self.threshold })
    }

    fn without_signer(&self, signer: Address) -> Result<Self, ConstraintError> {
        if !self.signers.contains(&signer) {
            return Err(ConstraintError::NotASigner(signer));
        }
        let mut signers = self.signers.clone();
        signers.remove(&signer);
        Self::check(&signers, self.threshold)?;
        Ok(Self { signers, threshold: self.threshold })
    }

    fn with_threshold(&self, threshold: usize) -> Result<Self, ConstraintError> {
        Self::check(&self.signers, threshold)?;
        Ok(Self { signers: self.signers.clone(), threshold })
    }
}

/// Who controls an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountOwner {
    Simple(Address),
    Multisig(SignerSet),
}

impl AccountOwner {
    pub fn simple(owner: Address) -> Result<Self, ConstraintError> {
        if owner.is_zero() {
            return Err(ConstraintError::ZeroSigner);
        }
        Ok(Self::Simple(owner))
    }

    pub fn multisig(
        signers: impl IntoIterator<Item = Address>,
        threshold: usize,
    ) -> Result<Self, ConstraintError> {
        Ok(Self::Multisig(SignerSet::new(signers, threshold)?))
    }

    /// Checks `signature` against the operation hash.
    pub fn validate(&self, hash: H256, signature: &[u8]) -> Result<(), ValidationError> {
        match self {
            AccountOwner::Simple(owner) => validate_owner_signature(hash, signature, *owner),
            AccountOwner::Multisig(set) => {
                validate_threshold_signature(hash, signature, &set.signers, set.threshold)
            }
        }
    }

    /// Number of signatures recovered during validation.
    pub fn signatures_required(&self) -> usize {
        match self {
            AccountOwner::Simple(_) => 1,
            AccountOwner::Multisig(set) => set.threshold,
        }
    }

    /// Constructor arguments as the factory hashes them.
    pub fn constructor_tokens(&self) -> Vec<Token> {
        match self {
            AccountOwner::Simple(owner) => vec![Token::Address(*owner)],
            AccountOwner::Multisig(set) => vec![
                Token::Array(set.signers.iter().copied().map(Token::Address).collect()),
                Token::Uint(U256::from(set.threshold)),
            ],
        }
    }
}

/// A single call made by an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub target: Address,
    pub value: U256,
    pub data: Bytes,
}

const EXECUTE: &str = "execute(address,uint256,bytes)";
const EXECUTE_BATCH: &str = "executeBatch(address[],uint256[],bytes[])";
const ADD_SIGNER: &str = "addSigner(address)";
const REMOVE_SIGNER: &str = "removeSigner(address)";
const CHANGE_THRESHOLD: &str = "changeThreshold(uint256)";
const TRANSFER_OWNERSHIP: &str = "transferOwnership(address)";
const UPGRADE_TO: &str = "upgradeTo(uint256)";

/// Decoded account call data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountCommand {
    Noop,
    Execute(Call),
    ExecuteBatch(Vec<Call>),
    AddSigner(Address),
    RemoveSigner(Address),
    ChangeThreshold(usize),
    TransferOwnership(Address),
    UpgradeTo(u64),
}

impl AccountCommand {
    pub fn encode(&self) -> Bytes {
        let (signature, tokens) = match self {
            AccountCommand::Noop => return Bytes::new(),
            AccountCommand::Execute(call) => (
                EXECUTE,
                vec![
                    Token::Address(call.target),
                    Token::Uint(call.value),
                    Token::Bytes(call.data.to_vec()),
                ],
            ),
            AccountCommand::ExecuteBatch(calls) => (
                EXECUTE_BATCH,
                vec![
                    Token::Array(calls.iter().map(|c| Token::Address(c.target)).collect()),
                    Token::Array(calls.iter().map(|c| Token::Uint(c.value)).collect()),
                    Token::Array(calls.iter().map(|c| Token::Bytes(c.data.to_vec())).collect()),
                ],
            ),
            AccountCommand::AddSigner(signer) => (ADD_SIGNER, vec![Token::Address(*signer)]),
            AccountCommand::RemoveSigner(signer) => (REMOVE_SIGNER, vec![Token::Address(*signer)]),
            AccountCommand::ChangeThreshold(threshold) => {
                (CHANGE_THRESHOLD, vec![Token::Uint(U256::from(*threshold))])
            }
            AccountCommand::TransferOwnership(owner) => {
                (TRANSFER_OWNERSHIP, vec![Token::Address(*owner)])
            }
            AccountCommand::UpgradeTo(version) => {
                (UPGRADE_TO, vec![Token::Uint(U256::from(*version))])
            }
        };

        let mut data = id(signature).to_vec();
        data.extend(encode(&tokens));
        Bytes::from(data)
    }

    pub fn decode(call_data: &[u8]) -> Result<Self, ExecutionError> {
        if call_data.is_empty() {
            return Ok(AccountCommand::Noop);
        }
        if call_data.len() < 4 {
            return Err(ExecutionError::MalformedCallData("selector too short".to_string()));
        }
        let (selector, args) = call_data.split_at(4);

        if selector == id(EXECUTE) {
            let mut tokens =
                decode_args(&[ParamType::Address, ParamType::Uint(256), ParamType::Bytes], args)?
                    .into_iter();
            return Ok(AccountCommand::Execute(Call {
                target: next_address(&mut tokens)?,
                value: next_uint(&mut tokens)?,
                data: next_bytes(&mut tokens)?,
            }));
        }
        if selector == id(EXECUTE_BATCH) {
            return decode_batch(args);
        }
        if selector == id(ADD_SIGNER) {
            let mut tokens = decode_args(&[ParamType::Address], args)?.into_iter();
            return Ok(AccountCommand::AddSigner(next_address(&mut tokens)?));
        }
        if selector == id(REMOVE_SIGNER) {
            let mut tokens = decode_args(&[ParamType::Address], args)?.into_iter();
            return Ok(AccountCommand::RemoveSigner(next_address(&mut tokens)?));
        }
        if selector == id(CHANGE_THRESHOLD) {
            let mut tokens = decode_args(&[ParamType::Uint(256)], args)?.into_iter();
            let threshold = next_uint(&mut tokens)?;
            if threshold > U256::from(u32::MAX) {
                return Err(ExecutionError::MalformedCallData("threshold too large".to_string()));
            }
            return Ok(AccountCommand::ChangeThreshold(threshold.as_usize()));
        }
        if selector == id(TRANSFER_OWNERSHIP) {
            let mut tokens = decode_args(&[ParamType::Address], args)?.into_iter();
            return Ok(AccountCommand::TransferOwnership(next_address(&mut tokens)?));
        }
        if selector == id(UPGRADE_TO) {
            let mut tokens = decode_args(&[ParamType::Uint(256)], args)?.into_iter();
            let version = next_uint(&mut tokens)?;
            if version > U256::from(u64::MAX) {
                return Err(ExecutionError::MalformedCallData("version too large".to_string()));
            }
            return Ok(AccountCommand::UpgradeTo(version.as_u64()));
        }

        Err(ExecutionError::UnknownSelector(hex::encode(selector)))
    }
}

fn decode_batch(args: &[u8]) -> Result<AccountCommand, ExecutionError> {
    let mut tokens = decode_args(
        &[
            ParamType::Array(Box::new(ParamType::Address)),
            ParamType::Array(Box::new(ParamType::Uint(256))),
            ParamType::Array(Box::new(ParamType::Bytes)),
        ],
        args,
    )?
    .into_iter();

    let next_array = |tokens: &mut std::vec::IntoIter<Token>| {
        tokens
            .next()
            .and_then(Token::into_array)
            .ok_or_else(|| ExecutionError::MalformedCallData("expected array".to_string()))
    };
    let targets = next_array(&mut tokens)?;
    let values = next_array(&mut tokens)?;
    let datas = next_array(&mut tokens)?;
    if targets.len() != values.len() || targets.len() != datas.len() {
        return Err(ExecutionError::MalformedCallData("batch length mismatch".to_string()));
    }

    let mut calls = Vec::with_capacity(targets.len());
    let columns = targets.into_iter().zip(values).zip(datas);
    for ((target, value), data) in columns {
        calls.push(Call {
            target: next_address(&mut std::iter::once(target))?,
            value: next_uint(&mut std::iter::once(value))?,
            data: next_bytes(&mut std::iter::once(data))?,
        });
    }
    Ok(AccountCommand::ExecuteBatch(calls))
}

fn decode_args(types: &[ParamType], args: &[u8]) -> Result<Vec<Token>, ExecutionError> {
    decode(types, args).map_err(|e| ExecutionError::MalformedCallData(e.to_string()))
}

fn next_address(tokens: &mut impl Iterator<Item = Token>) -> Result<Address, ExecutionError> {
    tokens
        .next()
        .and_then(Token::into_address)
        .ok_or_else(|| ExecutionError::MalformedCallData("expected address".to_string()))
}

fn next_uint(tokens: &mut impl Iterator<Item = Token>) -> Result<U256, ExecutionError> {
    tokens
        .next()
        .and_then(Token::into_uint)
        .ok_or_else(|| ExecutionError::MalformedCallData("expected uint".to_string()))
}

fn next_bytes(tokens: &mut impl Iterator<Item = Token>) -> Result<Bytes, ExecutionError> {
    tokens
        .next()
        .and_then(Token::into_bytes)
        .map(Bytes::from)
        .ok_or_else(|| ExecutionError::MalformedCallData("expected bytes".to_string()))
}

/// Proof that the entry point validated an operation for `account`.
///
/// Only the entry point can mint one, so account self-administration cannot bypass
/// signature and nonce validation.
#[derive(Debug)]
pub struct Authorization {
    account: Address,
}

impl Authorization {
    pub(crate) fn new(account: Address) -> Self {
        Self { account }
    }

    pub fn account(&self) -> Address {
        self.account
    }
}

/// A deployed smart account.
#[derive(Debug)]
pub struct Account {
    address: Address,
    owner: RwLock<AccountOwner>,
    nonce: AtomicU64,
    implementation: AtomicU64,
}

impl Account {
    pub fn new(address: Address, owner: AccountOwner) -> Self {
        Self {
            address,
            owner: RwLock::new(owner),
            nonce: AtomicU64::new(0),
            implementation: AtomicU64::new(1),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn owner(&self) -> AccountOwner {
        self.owner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn nonce(&self) -> u64 {
        self.nonce.load(Ordering::SeqCst)
    }

    pub fn implementation_version(&self) -> u64 {
        self.implementation.load(Ordering::SeqCst)
    }

    pub fn validate_signature(&self, hash: H256, signature: &[u8]) -> Result<(), ValidationError> {
        self.owner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .validate(hash, signature)
    }

    /// Read-only nonce check. Used by simulation and as the first half of validation.
    pub fn check_nonce(&self, nonce: U256) -> Result<u64, ValidationError> {
        let current = self.nonce();
        classify_nonce(current, nonce)?;
        Ok(current)
    }

    /// Consumes `nonce` if and only if it is the current one. Nonces are sequential.
    pub fn try_consume_nonce(&self, nonce: U256) -> Result<(), ValidationError> {
        let expected = self.check_nonce(nonce)?;
        self.nonce
            .compare_exchange(expected, expected + 1, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|current| {
                // another validation won the race for this nonce
                match classify_nonce(current, nonce) {
                    Err(err) => err,
                    Ok(()) => ValidationReason::Replay.into(),
                }
            })
    }

    /// Only an operation validated for this very account may swap its implementation.
    pub fn authorize_upgrade(&self, by: &Authorization) -> Result<(), ConstraintError> {
        if by.account != self.address {
            return Err(ConstraintError::UnauthorizedUpgrade);
        }
        Ok(())
    }

    /// Applies a self-administration command. Returns an error without touching state if
    /// the resulting configuration would be invalid.
    pub fn apply(
        &self,
        command: &AccountCommand,
        by: &Authorization,
    ) -> Result<(), ExecutionError> {
        if by.account != self.address {
            return Err(ConstraintError::UnauthorizedUpgrade.into());
        }

        if let AccountCommand::UpgradeTo(version) = command {
            self.authorize_upgrade(by)?;
            let current = self.implementation_version();
            if *version <= current {
                return Err(ConstraintError::StaleImplementation {
                    current,
                    requested: *version,
                }
                .into());
            }
            self.implementation.store(*version, Ordering::SeqCst);
            info!(account = ?self.address, version, "account implementation upgraded");
            return Ok(());
        }

        let mut owner = self.owner.write().unwrap_or_else(|e| e.into_inner());
        let next = match (command, &*owner) {
            (AccountCommand::AddSigner(signer), AccountOwner::Multisig(set)) => {
                AccountOwner::Multisig(set.with_signer(*signer)?)
            }
            (AccountCommand::RemoveSigner(signer), AccountOwner::Multisig(set)) => {
                AccountOwner::Multisig(set.without_signer(*signer)?)
            }
            (AccountCommand::ChangeThreshold(threshold), AccountOwner::Multisig(set)) => {
                AccountOwner::Multisig(set.with_threshold(*threshold)?)
            }
            (AccountCommand::TransferOwnership(new_owner), AccountOwner::Simple(_)) => {
                AccountOwner::simple(*new_owner)?
            }
            (AccountCommand::TransferOwnership(_), AccountOwner::Multisig(_)) => {
                return Err(ConstraintError::NotSimple.into());
            }
            (
                AccountCommand::AddSigner(_)
                | AccountCommand::RemoveSigner(_)
                | AccountCommand::ChangeThreshold(_),
                AccountOwner::Simple(_),
            ) => return Err(ConstraintError::NotMultisig.into()),
            _ => {
                return Err(ExecutionError::MalformedCallData(
                    "not an administration command".to_string(),
                ))
            }
        };
        debug!(account = ?self.address, ?command, "account configuration changed");
        *owner = next;
        Ok(())
    }
}

fn classify_nonce(current: u64, nonce: U256) -> Result<(), ValidationError> {
    let current_u256 = U256::from(current);
    if nonce < current_u256 {
        return Err(ValidationReason::Replay.into());
    }
    if nonce > current_u256 {
        return Err(ValidationReason::NonceGap.into());
    }
    Ok(())
}

/// Deployed accounts by address. Presence here is what "code exists" means.
#[derive(Debug, Default)]
pub struct AccountStore {
    accounts: RwLock<HashMap<Address, Arc<Account>>>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &Address) -> Option<Arc<Account>> {
        self.accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
    }

    pub fn is_deployed(&self, address: &Address) -> bool {
        self.accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(address)
    }

    /// Inserts the account built by `create` unless one already lives at `address`.
    /// The second element is true only for the caller that actually inserted.
    pub fn get_or_insert_with(
        &self,
        address: Address,
        create: impl FnOnce() -> Account,
    ) -> (Arc<Account>, bool) {
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = accounts.get(&address) {
            return (existing.clone(), false);
        }
        let account = Arc::new(create());
        accounts.insert(address, account.clone());
        (account, true)
    }

    pub fn len(&self) -> usize {
        self.accounts.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
