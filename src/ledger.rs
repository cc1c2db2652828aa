// src/ledger.rs
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::id;
use tracing::debug;

use crate::entry_point::encode_handle_ops;
use crate::error::LedgerError;
use crate::types::UserOperation;

/// A dry-run call used for gas estimation.
#[derive(Debug, Clone, Default)]
pub struct GasCall {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeMarket {
    pub gas_price: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Operations bundled for one `handleOps` transaction.
#[derive(Debug, Clone)]
pub struct SignedBatch {
    pub entry_point: Address,
    pub ops: Vec<UserOperation>,
    pub beneficiary: Address,
}

/// Everything this crate needs from a chain node. Transport agnostic.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn estimate_gas(&self, call: &GasCall) -> Result<U256, LedgerError>;

    async fn get_fee_market(&self) -> Result<FeeMarket, LedgerError>;

    async fn get_code(&self, address: Address) -> Result<Bytes, LedgerError>;

    async fn get_balance(&self, address: Address) -> Result<U256, LedgerError>;

    /// The paymaster contract's current sponsorship nonce for `sender`.
    async fn paymaster_nonce(
        &self,
        paymaster: Address,
        sender: Address,
    ) -> Result<U256, LedgerError>;

    async fn submit(&self, batch: &SignedBatch) -> Result<H256, LedgerError>;
}

/// Runs a network-bound step under a deadline.
pub async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    future: impl Future<Output = Result<T, LedgerError>>,
) -> Result<T, LedgerError> {
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout { operation }),
    }
}

/// [`LedgerClient`] over an ethers HTTP provider. Submission needs a bundler key.
pub struct ProviderClient {
    provider: Provider<Http>,
    submitter: Option<SignerMiddleware<Provider<Http>, LocalWallet>>,
    timeout: Duration,
}

impl ProviderClient {
    pub fn new(eth_rpc_url: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let provider = Provider::<Http>::try_from(eth_rpc_url)
            .map_err(|e| LedgerError::Provider(e.to_string()))?;
        Ok(Self { provider, submitter: None, timeout })
    }

    pub fn with_submitter(mut self, wallet: LocalWallet) -> Self {
        self.submitter = Some(SignerMiddleware::new(self.provider.clone(), wallet));
        self
    }

    fn call_request(&self, call: &GasCall) -> TypedTransaction {
        TransactionRequest::new()
            .from(call.from)
            .to(call.to)
            .data(call.data.clone())
            .into()
    }
}

fn provider_error(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Provider(e.to_string())
}

#[async_trait]
impl LedgerClient for ProviderClient {
    async fn estimate_gas(&self, call: &GasCall) -> Result<U256, LedgerError> {
        let tx = self.call_request(call);
        bounded("estimate_gas", self.timeout, async {
            self.provider.estimate_gas(&tx, None).await.map_err(provider_error)
        })
        .await
    }

    async fn get_fee_market(&self) -> Result<FeeMarket, LedgerError> {
        bounded("get_fee_market", self.timeout, async {
            let gas_price = self.provider.get_gas_price().await.map_err(provider_error)?;
            let (max_fee_per_gas, max_priority_fee_per_gas) = self
                .provider
                .estimate_eip1559_fees(None)
                .await
                .map_err(provider_error)?;
            Ok(FeeMarket { gas_price, max_fee_per_gas, max_priority_fee_per_gas })
        })
        .await
    }

    async fn get_code(&self, address: Address) -> Result<Bytes, LedgerError> {
        bounded("get_code", self.timeout, async {
            self.provider.get_code(address, None).await.map_err(provider_error)
        })
        .await
    }

    async fn get_balance(&self, address: Address) -> Result<U256, LedgerError> {
        bounded("get_balance", self.timeout, async {
            self.provider.get_balance(address, None).await.map_err(provider_error)
        })
        .await
    }

    async fn paymaster_nonce(
        &self,
        paymaster: Address,
        sender: Address,
    ) -> Result<U256, LedgerError> {
        let mut data = id("senderNonce(address)").to_vec();
        data.extend(encode(&[Token::Address(sender)]));
        let tx: TypedTransaction = TransactionRequest::new().to(paymaster).data(data).into();

        let output = bounded("paymaster_nonce", self.timeout, async {
            self.provider.call(&tx, None).await.map_err(provider_error)
        })
        .await?;

        decode(&[ParamType::Uint(256)], &output)
            .ok()
            .and_then(|tokens| tokens.into_iter().next())
            .and_then(Token::into_uint)
            .ok_or_else(|| LedgerError::Decode("senderNonce".to_string()))
    }

    async fn submit(&self, batch: &SignedBatch) -> Result<H256, LedgerError> {
        let submitter = self
            .submitter
            .as_ref()
            .ok_or_else(|| LedgerError::Provider("no bundler key configured".to_string()))?;
        let data = encode_handle_ops(&batch.ops, batch.beneficiary);
        let tx = TransactionRequest::new().to(batch.entry_point).data(data);

        let tx_hash = bounded("submit", self.timeout, async {
            let pending = submitter.send_transaction(tx, None).await.map_err(provider_error)?;
            Ok(pending.tx_hash())
        })
        .await?;
        debug!("Submitted {} operation(s) in {:?}", batch.ops.len(), tx_hash);
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_reports_timeouts() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        };
        let err = bounded("slow", Duration::from_millis(10), slow).await.unwrap_err();
        assert!(matches!(err, LedgerError::Timeout { operation: "slow" }));
    }

    #[test]
    fn rejects_malformed_rpc_url() {
        assert!(ProviderClient::new("not a url", Duration::from_secs(1)).is_err());
    }
}
