//! Named certifiers (nurseries) that sign seed hashes before certification.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{PublicKey, Signature, Verifier};
use serde::{Deserialize, Serialize};

use crate::identity::Signer;

const DEFAULT_CERTIFIERS: [(&str, &str); 3] = [
    ("Nursery_A", "Green Valley Nursery"),
    ("Nursery_B", "Palm Paradise Seeds"),
    ("Nursery_C", "Tropical Seed Co."),
];

#[derive(Debug, Deserialize)]
struct CertifierFile {
    #[serde(default, rename = "certifier")]
    certifiers: Vec<CertifierEntry>,
}

#[derive(Debug, Deserialize)]
struct CertifierEntry {
    id: String,
    name: String,
    /// Base64 ed25519 secret; an ephemeral key is generated when absent.
    #[serde(default)]
    secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertifierInfo {
    pub id: String,
    pub name: String,
}

pub struct Certifier {
    pub name: String,
    signer: Signer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHash {
    pub signature_hex: String,
    pub public_key_hex: String,
    pub signer_name: String,
}

pub struct CertifierRegistry {
    certifiers: BTreeMap<String, Certifier>,
}

impl CertifierRegistry {
    /// The three built-in nurseries, each with a freshly generated key.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn with_defaults() -> Result<Self> {
        let mut certifiers = BTreeMap::new();
        for (id, name) in DEFAULT_CERTIFIERS {
            certifiers.insert(
                id.to_string(),
                Certifier {
                    name: name.to_string(),
                    signer: Signer::generate()?,
                },
            );
        }
        Ok(Self { certifiers })
    }

    /// Load from a TOML file, falling back to the defaults when it is absent.
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be parsed or holds a bad key.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path.filter(|p| p.exists()) else {
            return Self::with_defaults();
        };
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: CertifierFile =
            toml::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        let mut certifiers = BTreeMap::new();
        for entry in file.certifiers {
            let signer = match entry.secret.as_deref() {
                Some(secret) => Signer::from_secret_b64(secret)
                    .with_context(|| format!("certifier {}", entry.id))?,
                None => Signer::generate()?,
            };
            certifiers.insert(
                entry.id,
                Certifier {
                    name: entry.name,
                    signer,
                },
            );
        }
        Ok(Self { certifiers })
    }

    pub fn list(&self) -> Vec<CertifierInfo> {
        self.certifiers
            .iter()
            .map(|(id, c)| CertifierInfo {
                id: id.clone(),
                name: c.name.clone(),
            })
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.certifiers.contains_key(id)
    }

    /// Sign a hex hash on behalf of certifier `id`.
    ///
    /// # Errors
    /// Returns an error for an unknown signer or a hash that is not hex.
    pub fn sign_hash(&self, hash_hex: &str, id: &str) -> Result<SignedHash> {
        let certifier = self
            .certifiers
            .get(id)
            .ok_or_else(|| anyhow!("Unknown signer: {id}"))?;
        let hash_bytes = hex::decode(hash_hex).map_err(|e| anyhow!("hash is not hex: {e}"))?;
        let sig = certifier.signer.sign(&hash_bytes);
        Ok(SignedHash {
            signature_hex: hex::encode(sig.to_bytes()),
            public_key_hex: hex::encode(certifier.signer.public_key().as_bytes()),
            signer_name: certifier.name.clone(),
        })
    }
}

/// `true` when `sig_hex` is a valid signature by `pub_hex` over the decoded hash.
pub fn verify_signature(hash_hex: &str, sig_hex: &str, pub_hex: &str) -> bool {
    let check = || -> Result<()> {
        let pk = PublicKey::from_bytes(&hex::decode(pub_hex)?).map_err(|e| anyhow!("{e}"))?;
        let sig = Signature::try_from(hex::decode(sig_hex)?.as_slice()).map_err(|e| anyhow!("{e}"))?;
        pk.verify(&hex::decode(hash_hex)?, &sig).map_err(|e| anyhow!("{e}"))
    };
    check().is_ok()
}
