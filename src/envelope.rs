use anyhow::{anyhow, Result};
use base64::Engine as _;
use ed25519_dalek::{PublicKey, Signature, Verifier};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{Identity, Signer};
use crate::ledger::blake3_hex;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Creator {
    pub msp_id: String,
    /// Base64 ed25519 public key.
    pub credentials: String,
}

impl Creator {
    /// `msp_id:credentials`, the form used by the creator allow-list.
    pub fn qualified_id(&self) -> String {
        format!("{}:{}", self.msp_id, self.credentials)
    }
}

/// A chaincode invocation as presented to the peer.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Proposal {
    pub channel: String,
    pub chaincode: String,
    pub function: String,
    pub args: Vec<String>,
    pub creator: Creator,
    pub nonce: String,
    pub tx_id: String,
    pub ts: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SignedProposal {
    pub proposal: Proposal,
    /// Base64 ed25519 signature over `hash_canonical(proposal)`.
    pub signature: String,
}

impl Proposal {
    /// Build a proposal with a fresh nonce and the transaction id derived from it.
    pub fn new(channel: &str, chaincode: &str, function: &str, args: Vec<String>, identity: &Identity) -> Self {
        let creator = identity.creator();
        let nonce = ulid::Ulid::new().to_string();
        let tx_id = compute_tx_id(&nonce, &creator);
        Self {
            channel: channel.to_string(),
            chaincode: chaincode.to_string(),
            function: function.to_string(),
            args,
            creator,
            nonce,
            tx_id,
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}

/// Transaction id = blake3(nonce || canonical creator).
pub fn compute_tx_id(nonce: &str, creator: &Creator) -> String {
    let mut bytes = nonce.as_bytes().to_vec();
    bytes.extend(serde_json::to_vec(creator).unwrap_or_default());
    blake3_hex(&bytes)
}

pub fn hash_canonical(json: &Value) -> String {
    // serde_json's default map is ordered, so re-serializing is canonical
    blake3_hex(serde_json::to_string(json).unwrap_or_default().as_bytes())
}

/// Sign a proposal with the given signer.
///
/// # Errors
/// Returns an error when the proposal cannot be serialized.
pub fn sign_proposal(proposal: Proposal, signer: &Signer) -> Result<SignedProposal> {
    let v = serde_json::to_value(&proposal)?;
    let digest_hex = hash_canonical(&v);
    let sig = signer.sign(digest_hex.as_bytes());
    Ok(SignedProposal {
        proposal,
        signature: base64::engine::general_purpose::STANDARD.encode(sig.to_bytes()),
    })
}

/// Check the signature against the creator's credentials.
///
/// # Errors
/// Returns an error on malformed keys or a failed signature check.
pub fn verify_proposal(signed: &SignedProposal) -> Result<()> {
    let p = &signed.proposal;
    let pub_bytes = base64::engine::general_purpose::STANDARD
        .decode(p.creator.credentials.as_bytes())
        .map_err(|e| anyhow!("bad credentials b64: {e}"))?;
    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(signed.signature.as_bytes())
        .map_err(|e| anyhow!("bad signature b64: {e}"))?;
    let pk = PublicKey::from_bytes(&pub_bytes).map_err(|e| anyhow!("bad public key: {e}"))?;
    let sig = Signature::try_from(sig_bytes.as_slice()).map_err(|e| anyhow!("bad signature: {e}"))?;

    let v = serde_json::to_value(p)?;
    let digest_hex = hash_canonical(&v);
    pk.verify(digest_hex.as_bytes(), &sig)
        .map_err(|e| anyhow!("signature verify failed: {e}"))
}

pub fn tx_id_matches(p: &Proposal) -> bool {
    compute_tx_id(&p.nonce, &p.creator) == p.tx_id
}
