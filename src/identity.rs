use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use dirs::home_dir;
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer as _};
use getrandom::getrandom;
use log::info;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::envelope::Creator;

#[derive(Serialize, Deserialize)]
struct SignerKeyFile {
    alg: String,
    secret: String,
    #[serde(default)]
    msp_id: Option<String>,
}

/// Membership identity presented with every proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub msp_id: String,
    /// Base64 ed25519 public key.
    pub credentials: String,
}

impl Identity {
    pub fn creator(&self) -> Creator {
        Creator {
            msp_id: self.msp_id.clone(),
            credentials: self.credentials.clone(),
        }
    }
}

/// Private-key handle used to sign proposals.
pub struct Signer {
    keypair: Keypair,
}

impl Signer {
    #[allow(clippy::missing_errors_doc)]
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; 32];
        getrandom(&mut seed).map_err(|e| anyhow!("getrandom error: {e}"))?;
        let signer = Self::from_secret_bytes(&seed);
        seed.zeroize();
        signer
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret = SecretKey::from_bytes(bytes).map_err(|e| anyhow!("invalid secret: {e}"))?;
        let public = PublicKey::from(&secret);
        Ok(Self {
            keypair: Keypair { secret, public },
        })
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn from_secret_b64(secret_b64: &str) -> Result<Self> {
        let mut bytes = general_purpose::STANDARD
            .decode(secret_b64.trim().as_bytes())
            .map_err(|e| anyhow!("invalid key encoding: {e}"))?;
        let signer = Self::from_secret_bytes(&bytes);
        bytes.zeroize();
        signer
    }

    pub fn secret_b64(&self) -> String {
        general_purpose::STANDARD.encode(self.keypair.secret.as_bytes())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    pub fn public_b64(&self) -> String {
        general_purpose::STANDARD.encode(self.keypair.public.as_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.keypair.sign(msg)
    }

    pub fn identity(&self, msp_id: &str) -> Identity {
        Identity {
            msp_id: msp_id.to_string(),
            credentials: self.public_b64(),
        }
    }
}

/// Load the signer key at `path`, creating it on first use.
///
/// The MSP id stored in the key file wins over `default_msp_id`.
///
/// # Errors
/// Returns an error when the key file cannot be read, written or decoded.
pub fn load_or_create(path: &Path, default_msp_id: &str) -> Result<(Identity, Signer)> {
    if !path.exists() {
        ensure_key_dir(path)?;
        let signer = Signer::generate()?;
        let file = SignerKeyFile {
            alg: "ed25519".into(),
            secret: signer.secret_b64(),
            msp_id: Some(default_msp_id.to_string()),
        };
        write_key_file(path, &file)?;
        info!("generated signer key at {}", path.display());
        let identity = signer.identity(default_msp_id);
        return Ok((identity, signer));
    }

    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let file: SignerKeyFile = serde_json::from_slice(&bytes).unwrap_or_else(|_| SignerKeyFile {
        alg: "ed25519".into(),
        secret: String::from_utf8_lossy(&bytes).trim().to_string(),
        msp_id: None,
    });
    if file.alg.to_lowercase() != "ed25519" {
        return Err(anyhow!("unsupported signer key algorithm: {}", file.alg));
    }
    let signer = Signer::from_secret_b64(&file.secret)?;
    let msp_id = file
        .msp_id
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| default_msp_id.to_string());
    Ok((signer.identity(&msp_id), signer))
}

fn ensure_key_dir(path: &Path) -> Result<()> {
    let key_dir = path
        .parent()
        .ok_or_else(|| anyhow!("invalid signer key path"))?;
    if key_dir.as_os_str().is_empty() || key_dir.exists() {
        return Ok(());
    }
    fs::create_dir_all(key_dir).with_context(|| format!("creating {}", key_dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("setting permissions on {}", key_dir.display()))?;
    }
    Ok(())
}

fn write_key_file(path: &Path, key: &SignerKeyFile) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("setting permissions on {}", path.display()))?;
    }

    let data = serde_json::to_vec_pretty(key)?;
    file.write_all(&data)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Expand a leading `~` to the home directory.
///
/// # Errors
/// Returns an error when the home directory cannot be determined.
pub fn expand_home(p: &str) -> Result<PathBuf> {
    if p == "~" {
        return home_dir().ok_or_else(|| anyhow!("unable to determine home directory"));
    }
    if let Some(stripped) = p.strip_prefix("~/") {
        let mut home = home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
        home.push(stripped);
        return Ok(home);
    }
    Ok(PathBuf::from(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    #[test]
    fn key_file_is_created_then_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("signer.key");
        let (first, _) = load_or_create(&path, "Org1MSP").unwrap();
        assert!(path.exists());
        let (second, _) = load_or_create(&path, "OtherMSP").unwrap();
        assert_eq!(first, second);
        assert_eq!(second.msp_id, "Org1MSP");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn bare_base64_secret_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.key");
        let signer = Signer::from_secret_bytes(&[7u8; 32]).unwrap();
        fs::write(&path, signer.secret_b64()).unwrap();
        let (identity, loaded) = load_or_create(&path, "Org1MSP").unwrap();
        assert_eq!(identity.credentials, signer.public_b64());
        assert_eq!(identity.msp_id, "Org1MSP");
        let sig = loaded.sign(b"msg");
        assert!(signer.public_key().verify(b"msg", &sig).is_ok());
    }

    #[test]
    fn expand_home_passthrough() {
        assert_eq!(expand_home("/tmp/x").unwrap(), PathBuf::from("/tmp/x"));
    }
}
