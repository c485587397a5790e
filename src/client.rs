//! Ledger gateway client: one identity and signer, contract handles that turn
//! calls into signed proposals, and the transports that carry them to a peer.

use std::io::Read as _;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use thiserror::Error;

use crate::chaincode::ContractError;
use crate::envelope::{sign_proposal, Proposal, SignedProposal};
use crate::identity::{Identity, Signer};
use crate::peer::{ErrorBody, Peer, PeerError};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("signing error: {0}")]
    Signing(String),
}

impl GatewayError {
    /// The contract-level error behind this failure, if any.
    pub fn contract_error(&self) -> Option<&ContractError> {
        match self {
            Self::Peer(PeerError::Contract(e)) => Some(e),
            _ => None,
        }
    }
}

/// Carries signed proposals to a peer.
pub trait Transport: Send + Sync {
    /// Ordered, committed write.
    fn submit(&self, signed: &SignedProposal) -> Result<Vec<u8>, GatewayError>;
    /// Local read-only query.
    fn evaluate(&self, signed: &SignedProposal) -> Result<Vec<u8>, GatewayError>;
}

impl Transport for Peer {
    fn submit(&self, signed: &SignedProposal) -> Result<Vec<u8>, GatewayError> {
        Ok(Peer::submit(self, signed)?)
    }

    fn evaluate(&self, signed: &SignedProposal) -> Result<Vec<u8>, GatewayError> {
        Ok(Peer::evaluate(self, signed)?)
    }
}

/// Transport to a peer served by `seedcert peer`.
pub struct HttpTransport {
    base: String,
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(base: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .build();
        Self {
            base: base.trim_end_matches('/').to_string(),
            agent,
        }
    }

    /// Probe the peer's health endpoint.
    ///
    /// # Errors
    /// Returns an error when the peer cannot be reached or reports a failure.
    pub fn ping(&self) -> Result<(), GatewayError> {
        self.agent
            .get(&format!("{}/v1/health", self.base))
            .call()
            .map(|_| ())
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }

    fn post(&self, path: &str, signed: &SignedProposal) -> Result<Vec<u8>, GatewayError> {
        let body = serde_json::to_string(signed)?;
        let resp = self
            .agent
            .post(&format!("{}{path}", self.base))
            .set("Content-Type", "application/json")
            .send_string(&body);
        match resp {
            Ok(r) => {
                let mut out = Vec::new();
                r.into_reader()
                    .read_to_end(&mut out)
                    .map_err(|e| GatewayError::Transport(e.to_string()))?;
                Ok(out)
            }
            Err(ureq::Error::Status(code, r)) => {
                let text = r.into_string().unwrap_or_default();
                match serde_json::from_str::<ErrorBody>(&text) {
                    Ok(ErrorBody { cause: Some(cause), .. }) => Err(GatewayError::Peer(cause)),
                    Ok(ErrorBody { error, .. }) => {
                        Err(GatewayError::Transport(format!("peer returned {code}: {error}")))
                    }
                    Err(_) => Err(GatewayError::Transport(format!("peer returned {code}: {text}"))),
                }
            }
            Err(e) => Err(GatewayError::Transport(e.to_string())),
        }
    }
}

impl Transport for HttpTransport {
    fn submit(&self, signed: &SignedProposal) -> Result<Vec<u8>, GatewayError> {
        self.post("/v1/submit", signed)
    }

    fn evaluate(&self, signed: &SignedProposal) -> Result<Vec<u8>, GatewayError> {
        self.post("/v1/evaluate", signed)
    }
}

/// Connection to the ledger on behalf of one identity.
#[derive(Clone)]
pub struct Gateway {
    transport: Arc<dyn Transport>,
    identity: Identity,
    signer: Arc<Signer>,
}

impl Gateway {
    pub fn connect(transport: Arc<dyn Transport>, identity: Identity, signer: Signer) -> Self {
        Self {
            transport,
            identity,
            signer: Arc::new(signer),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn contract(&self, channel: &str, chaincode: &str) -> Contract {
        Contract {
            gateway: self.clone(),
            channel: channel.to_string(),
            chaincode: chaincode.to_string(),
        }
    }
}

/// Handle on one chaincode in one channel.
#[derive(Clone)]
pub struct Contract {
    gateway: Gateway,
    channel: String,
    chaincode: String,
}

impl Contract {
    fn signed(&self, name: &str, args: &[String]) -> Result<SignedProposal, GatewayError> {
        let proposal = Proposal::new(
            &self.channel,
            &self.chaincode,
            name,
            args.to_vec(),
            &self.gateway.identity,
        );
        debug!("proposal {name} tx={}", proposal.tx_id);
        sign_proposal(proposal, &self.gateway.signer).map_err(|e| GatewayError::Signing(e.to_string()))
    }

    /// Submit a transaction for ordering and commit; returns the chaincode result.
    ///
    /// # Errors
    /// Returns an error when signing, transport or the peer fails.
    pub fn submit_transaction(&self, name: &str, args: &[String]) -> Result<Vec<u8>, GatewayError> {
        let signed = self.signed(name, args)?;
        self.gateway.transport.submit(&signed)
    }

    /// Evaluate a read-only query; nothing is ordered or committed.
    ///
    /// # Errors
    /// Returns an error when signing, transport or the peer fails.
    pub fn evaluate_transaction(&self, name: &str, args: &[String]) -> Result<Vec<u8>, GatewayError> {
        let signed = self.signed(name, args)?;
        self.gateway.transport.evaluate(&signed)
    }
}
