use serde::{Deserialize, Serialize};

/// Tag that marks seed records in the shared world-state keyspace.
pub const DOC_TYPE: &str = "seedRecord";

pub const DEFAULT_LEDGER_TYPE: &str = "fabric";

fn doc_type() -> String {
    DOC_TYPE.to_string()
}

/// Certified seed entry as stored in world state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SeedRecord {
    #[serde(rename = "seedId")]
    pub seed_id: String,
    #[serde(rename = "className")]
    pub class_name: String,
    pub hash: String,
    pub timestamp: String,
    #[serde(alias = "txId", default)]
    pub tx_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
    #[serde(rename = "publicKey", default, skip_serializing_if = "String::is_empty")]
    pub public_key: String,
    #[serde(rename = "signerName", default, skip_serializing_if = "String::is_empty")]
    pub signer_name: String,
    #[serde(rename = "docType", default = "doc_type")]
    pub doc_type: String,
}

/// Body of `POST /certify`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CertifyRequest {
    #[serde(rename = "seedId")]
    pub seed_id: String,
    #[serde(rename = "className")]
    pub class_name: String,
    pub hash: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
    #[serde(rename = "publicKey", default, skip_serializing_if = "String::is_empty")]
    pub public_key: String,
    #[serde(rename = "signerName", default, skip_serializing_if = "String::is_empty")]
    pub signer_name: String,
}

impl CertifyRequest {
    pub fn new(seed_id: &str, class_name: &str, hash: &str, timestamp: &str) -> Self {
        Self {
            seed_id: seed_id.into(),
            class_name: class_name.into(),
            hash: hash.into(),
            timestamp: timestamp.into(),
            signature: String::new(),
            public_key: String::new(),
            signer_name: String::new(),
        }
    }

    /// Positional chaincode arguments for `CreateSeedRecord`.
    ///
    /// The signature triple is only appended when a signature is present so
    /// unsigned certifications keep the four-argument form.
    pub fn chaincode_args(&self) -> Vec<String> {
        let mut args = vec![
            self.seed_id.clone(),
            self.class_name.clone(),
            self.hash.clone(),
            self.timestamp.clone(),
        ];
        if !self.signature.is_empty() || !self.public_key.is_empty() {
            args.push(self.signature.clone());
            args.push(self.public_key.clone());
            args.push(self.signer_name.clone());
        }
        args
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CertifyResponse {
    pub success: bool,
    pub message: String,
    #[serde(rename = "seedId")]
    pub seed_id: String,
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
    #[serde(rename = "type")]
    pub ledger_type: String,
}

/// Shorten a hash for log lines.
pub fn short(hash: &str) -> &str {
    match hash.char_indices().nth(16) {
        Some((idx, _)) => &hash[..idx],
        None => hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_uses_wire_field_names() {
        let rec = SeedRecord {
            seed_id: "seed-001".into(),
            class_name: "healthy".into(),
            hash: "abc123".into(),
            timestamp: "2024-01-01T00:00:00Z".into(),
            tx_id: "tx1".into(),
            signature: String::new(),
            public_key: String::new(),
            signer_name: String::new(),
            doc_type: DOC_TYPE.into(),
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(
            v,
            json!({
                "seedId": "seed-001",
                "className": "healthy",
                "hash": "abc123",
                "timestamp": "2024-01-01T00:00:00Z",
                "tx_id": "tx1",
                "docType": "seedRecord"
            })
        );
    }

    #[test]
    fn record_accepts_camel_case_tx_id() {
        let rec: SeedRecord = serde_json::from_value(json!({
            "seedId": "s", "className": "c", "hash": "h", "timestamp": "t", "txId": "abc"
        }))
        .unwrap();
        assert_eq!(rec.tx_id, "abc");
        assert_eq!(rec.doc_type, DOC_TYPE);
    }

    #[test]
    fn unsigned_request_has_four_args() {
        let req = CertifyRequest::new("s", "c", "h", "t");
        assert_eq!(req.chaincode_args().len(), 4);
        let mut signed = req.clone();
        signed.signature = "aa".into();
        signed.public_key = "bb".into();
        assert_eq!(signed.chaincode_args().len(), 7);
    }

    #[test]
    fn short_truncates_long_hashes() {
        assert_eq!(short("0123456789abcdef0123"), "0123456789abcdef");
        assert_eq!(short("abc"), "abc");
    }
}
