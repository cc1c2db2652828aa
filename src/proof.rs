// src/proof.rs
//! Seam for the external zero-knowledge proof engine. Proofs are opaque here.

use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Bytes, H256};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProofStatus {
    Valid,
    Invalid,
    Error,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedProof {
    pub hash: H256,
    pub proof: Bytes,
    pub time_ms: u64,
}

#[derive(Error, Debug)]
pub enum ProofError {
    #[error("Proof generation failed: {0}")]
    Generation(String),

    #[error("Proof generation timed out")]
    Timeout,
}

#[async_trait]
pub trait ProofEngine: Send + Sync {
    async fn generate(&self, input: &[u8]) -> Result<GeneratedProof, ProofError>;

    async fn verify(&self, input: &[u8], proof: &[u8], hash: H256) -> ProofStatus;
}

pub async fn generate_with_timeout<E: ProofEngine + ?Sized>(
    engine: &E,
    input: &[u8],
    limit: Duration,
) -> Result<GeneratedProof, ProofError> {
    tokio::time::timeout(limit, engine.generate(input))
        .await
        .map_err(|_| ProofError::Timeout)?
}

/// Verification that reports [`ProofStatus::Timeout`] instead of hanging.
pub async fn verify_with_timeout<E: ProofEngine + ?Sized>(
    engine: &E,
    input: &[u8],
    proof: &[u8],
    hash: H256,
    limit: Duration,
) -> ProofStatus {
    match tokio::time::timeout(limit, engine.verify(input, proof, hash)).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Proof verification exceeded {:?}", limit);
            ProofStatus::Timeout
        }
    }
}
