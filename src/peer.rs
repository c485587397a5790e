//! Single-node peer: checks signed proposals, simulates the seed contract
//! against world state and commits write sets for submitted transactions.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::chaincode::{ContractError, SeedContract, Stub};
use crate::envelope::{tx_id_matches, verify_proposal, SignedProposal};
use crate::ledger::{CommitEntry, WorldState, WriteSet};
use crate::policy::CreatorGuard;
use crate::record::short;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PeerError {
    #[error("proposal targets {0}, which this peer does not serve")]
    ChannelMismatch(String),
    #[error("proposal signature rejected: {0}")]
    BadSignature(String),
    #[error("transaction id does not match proposal nonce")]
    TxIdMismatch,
    #[error("creator {0} is not allowed to transact")]
    CreatorDenied(String),
    #[error("transaction {0} was already committed")]
    DuplicateTxId(String),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("ledger state error: {0}")]
    State(String),
}

impl PeerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Contract(ContractError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Contract(ContractError::Duplicate(_)) | Self::DuplicateTxId(_) => {
                StatusCode::CONFLICT
            }
            Self::Contract(ContractError::InvalidArgument(_) | ContractError::UnknownFunction(_))
            | Self::ChannelMismatch(_) => StatusCode::BAD_REQUEST,
            Self::BadSignature(_)
            | Self::TxIdMismatch
            | Self::CreatorDenied(_)
            | Self::Contract(ContractError::BadSignature(_)) => StatusCode::FORBIDDEN,
            Self::Contract(ContractError::State(_)) | Self::State(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Error body returned by the peer HTTP surface.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub cause: Option<PeerError>,
}

/// Transaction simulator: reads fall through to world state, writes are
/// buffered into a write set that only a submit commits.
struct Simulator<'a> {
    tx_id: &'a str,
    state: &'a dyn WorldState,
    writes: WriteSet,
}

impl Stub for Simulator<'_> {
    fn tx_id(&self) -> &str {
        self.tx_id
    }

    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, ContractError> {
        if let Some(v) = self.writes.get(key) {
            return Ok(Some(v.clone()));
        }
        self.state
            .get_state(key)
            .map_err(|e| ContractError::State(e.to_string()))
    }

    fn put_state(&mut self, key: &str, value: Vec<u8>) -> Result<(), ContractError> {
        if key.is_empty() {
            return Err(ContractError::InvalidArgument("empty state key".into()));
        }
        self.writes.insert(key.to_string(), value);
        Ok(())
    }
}

pub struct Peer {
    channel: String,
    chaincode: String,
    state: Arc<dyn WorldState>,
    guard: CreatorGuard,
    contract: SeedContract,
    // Single ordering point for writes, holding every committed tx id.
    // Evaluates never take it.
    committed: Mutex<HashSet<String>>,
}

impl Peer {
    /// Build a peer over `state`, seeding the replay set from its commit log.
    ///
    /// # Errors
    /// Returns an error when the commit log cannot be read.
    pub fn new(
        channel: &str,
        chaincode: &str,
        state: Arc<dyn WorldState>,
        guard: CreatorGuard,
        contract: SeedContract,
    ) -> Result<Self, PeerError> {
        let committed: HashSet<String> = state
            .history()
            .map_err(|e| PeerError::State(e.to_string()))?
            .into_iter()
            .map(|entry| entry.tx_id)
            .collect();
        debug!("peer opened with {} committed tx(s)", committed.len());
        Ok(Self {
            channel: channel.to_string(),
            chaincode: chaincode.to_string(),
            state,
            guard,
            contract,
            committed: Mutex::new(committed),
        })
    }

    pub fn state(&self) -> &Arc<dyn WorldState> {
        &self.state
    }

    fn check(&self, signed: &SignedProposal) -> Result<(), PeerError> {
        let p = &signed.proposal;
        if p.channel != self.channel || p.chaincode != self.chaincode {
            return Err(PeerError::ChannelMismatch(format!("{}/{}", p.channel, p.chaincode)));
        }
        verify_proposal(signed).map_err(|e| PeerError::BadSignature(e.to_string()))?;
        if !tx_id_matches(p) {
            return Err(PeerError::TxIdMismatch);
        }
        if !self.guard.allowed(&p.creator) {
            return Err(PeerError::CreatorDenied(p.creator.msp_id.clone()));
        }
        Ok(())
    }

    fn simulate(&self, signed: &SignedProposal) -> Result<(Vec<u8>, WriteSet), PeerError> {
        let p = &signed.proposal;
        let mut sim = Simulator {
            tx_id: &p.tx_id,
            state: self.state.as_ref(),
            writes: BTreeMap::new(),
        };
        let out = self.contract.invoke(&mut sim, &p.function, &p.args)?;
        Ok((out, sim.writes))
    }

    /// Read-only query: simulate and discard any writes.
    ///
    /// # Errors
    /// Returns an error when the proposal is rejected or the contract fails.
    pub fn evaluate(&self, signed: &SignedProposal) -> Result<Vec<u8>, PeerError> {
        self.check(signed)?;
        let (out, writes) = self.simulate(signed)?;
        if !writes.is_empty() {
            debug!(
                "evaluate {} discarded {} write(s)",
                signed.proposal.function,
                writes.len()
            );
        }
        Ok(out)
    }

    /// Ordered write: simulate under the ordering lock and commit the write set.
    ///
    /// Each tx id commits at most once; a replayed proposal is refused.
    ///
    /// # Errors
    /// Returns an error when the proposal is rejected or replayed, the
    /// contract fails or the commit cannot be persisted.
    pub fn submit(&self, signed: &SignedProposal) -> Result<Vec<u8>, PeerError> {
        self.check(signed)?;
        let p = &signed.proposal;
        let mut committed = self
            .committed
            .lock()
            .map_err(|_| PeerError::State("ordering lock poisoned".into()))?;
        if committed.contains(&p.tx_id) {
            return Err(PeerError::DuplicateTxId(p.tx_id.clone()));
        }
        let (out, writes) = self.simulate(signed)?;
        let entry = CommitEntry::new(&p.tx_id, &p.function, &writes);
        self.state
            .apply(&entry, &writes)
            .map_err(|e| PeerError::State(e.to_string()))?;
        committed.insert(p.tx_id.clone());
        info!("committed tx {} ({})", short(&p.tx_id), p.function);
        Ok(out)
    }
}

fn into_response(result: Result<Vec<u8>, PeerError>) -> Response {
    match result {
        Ok(bytes) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response(),
        Err(e) => {
            warn!("peer rejected proposal: {e}");
            let body = ErrorBody {
                error: e.to_string(),
                cause: Some(e.clone()),
            };
            (e.status(), Json(body)).into_response()
        }
    }
}

async fn run_blocking<F>(f: F) -> Response
where
    F: FnOnce() -> Result<Vec<u8>, PeerError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => into_response(result),
        Err(e) => into_response(Err(PeerError::State(format!("worker failed: {e}")))),
    }
}

async fn post_submit(State(peer): State<Arc<Peer>>, Json(signed): Json<SignedProposal>) -> Response {
    run_blocking(move || peer.submit(&signed)).await
}

async fn post_evaluate(
    State(peer): State<Arc<Peer>>,
    Json(signed): Json<SignedProposal>,
) -> Response {
    run_blocking(move || peer.evaluate(&signed)).await
}

async fn health(State(peer): State<Arc<Peer>>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "channel": peer.channel, "chaincode": peer.chaincode }))
}

pub fn router(peer: Arc<Peer>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/submit", post(post_submit))
        .route("/v1/evaluate", post(post_evaluate))
        .with_state(peer)
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(64))
}

/// Serve the peer over HTTP on `addr`.
///
/// # Errors
/// Returns an error when the listener fails to bind or the server terminates unexpectedly.
pub async fn run(addr: &str, peer: Arc<Peer>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("peer listening on {addr}");
    axum::serve(listener, router(peer)).await?;
    Ok(())
}
