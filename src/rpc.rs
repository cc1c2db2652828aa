// src/rpc.rs
use std::fmt::Display;
use std::sync::Arc;

use ethers::types::{Address, H256, U256};
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;
use tracing::{debug, error, info};

use crate::account::AccountOwner;
use crate::factory::AccountFactory;
use crate::gas::GasEstimator;
use crate::ledger::{LedgerClient, SignedBatch};
use crate::paymaster::Paymaster;
use crate::types::{GasEstimate, PaymasterResponse, UserOperation};

const SERVER_ERROR: i32 = -32000;
const INVALID_PARAMS: i32 = -32602;

#[rpc(server)]
pub trait UserOperationRpc {
    /// Requests the paymaster to sponsor a user operation
    #[method(name = "pm_sponsorUserOperation")]
    async fn sponsor_user_operation(&self, user_op: UserOperation) -> RpcResult<PaymasterResponse>;

    /// Advisory gas and fee fields for a user operation
    #[method(name = "eth_estimateUserOperationGas")]
    async fn estimate_user_operation_gas(&self, user_op: UserOperation) -> RpcResult<GasEstimate>;

    /// Submits a signed user operation and returns its hash
    #[method(name = "eth_sendUserOperation")]
    async fn send_user_operation(&self, user_op: UserOperation) -> RpcResult<H256>;

    #[method(name = "aa_getUserOperationHash")]
    async fn get_user_operation_hash(&self, user_op: UserOperation) -> RpcResult<H256>;

    /// Counterfactual address of a single-owner account
    #[method(name = "aa_getSenderAddress")]
    async fn get_sender_address(&self, owner: Address, salt: U256) -> RpcResult<Address>;
}

pub struct UserOperationRpcImpl {
    paymaster: Arc<Paymaster>,
    estimator: GasEstimator<dyn LedgerClient>,
    ledger: Arc<dyn LedgerClient>,
    factory: Arc<AccountFactory>,
    entry_point: Address,
    chain_id: u64,
    beneficiary: Option<Address>,
}

impl UserOperationRpcImpl {
    pub fn new(
        paymaster: Arc<Paymaster>,
        estimator: GasEstimator<dyn LedgerClient>,
        ledger: Arc<dyn LedgerClient>,
        factory: Arc<AccountFactory>,
        entry_point: Address,
        chain_id: u64,
    ) -> Self {
        Self {
            paymaster,
            estimator,
            ledger,
            factory,
            entry_point,
            chain_id,
            beneficiary: None,
        }
    }

    pub fn with_beneficiary(mut self, beneficiary: Option<Address>) -> Self {
        self.beneficiary = beneficiary;
        self
    }
}

fn rpc_error(code: i32, context: &str, e: impl Display) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(code, format!("{}: {}", context, e), None::<()>)
}

#[async_trait]
impl UserOperationRpcServer for UserOperationRpcImpl {
    async fn sponsor_user_operation(&self, user_op: UserOperation) -> RpcResult<PaymasterResponse> {
        debug!("Received sponsor request for sender: {:?}", user_op.sender);

        match self.paymaster.sign_user_operation(&user_op).await {
            Ok(response) => {
                info!("Successfully sponsored operation for {:?}", user_op.sender);
                Ok(response)
            }
            Err(e) => {
                error!("Failed to sponsor operation: {}", e);
                Err(rpc_error(SERVER_ERROR, "Paymaster error", e))
            }
        }
    }

    async fn estimate_user_operation_gas(&self, user_op: UserOperation) -> RpcResult<GasEstimate> {
        Ok(self.estimator.estimate(&user_op).await)
    }

    async fn send_user_operation(&self, user_op: UserOperation) -> RpcResult<H256> {
        if user_op.signature.is_empty() {
            return Err(rpc_error(INVALID_PARAMS, "Invalid UserOperation", "missing signature"));
        }
        let beneficiary = self
            .beneficiary
            .ok_or_else(|| rpc_error(SERVER_ERROR, "Bundler error", "no beneficiary configured"))?;

        let user_op_hash = user_op.hash(self.entry_point, self.chain_id);
        let batch = SignedBatch {
            entry_point: self.entry_point,
            ops: vec![user_op],
            beneficiary,
        };
        let tx_hash = self.ledger.submit(&batch).await.map_err(|e| {
            error!("Failed to submit operation {:?}: {}", user_op_hash, e);
            rpc_error(SERVER_ERROR, "Bundler error", e)
        })?;

        info!("Operation {:?} submitted in {:?}", user_op_hash, tx_hash);
        Ok(user_op_hash)
    }

    async fn get_user_operation_hash(&self, user_op: UserOperation) -> RpcResult<H256> {
        Ok(user_op.hash(self.entry_point, self.chain_id))
    }

    async fn get_sender_address(&self, owner: Address, salt: U256) -> RpcResult<Address> {
        let owner = AccountOwner::simple(owner)
            .map_err(|e| rpc_error(INVALID_PARAMS, "Invalid owner", e))?;
        Ok(self.factory.get_address(&owner, salt))
    }
}
