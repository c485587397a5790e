use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::certifiers::verify_signature;
use crate::record::{short, SeedRecord, DOC_TYPE};

pub const CREATE_SEED_RECORD: &str = "CreateSeedRecord";
pub const GET_SEED_RECORD: &str = "GetSeedRecord";

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ContractError {
    #[error("Seed {0} does not exist")]
    NotFound(String),
    #[error("Seed {0} already exists")]
    Duplicate(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid signature for seed {0}")]
    BadSignature(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("state access failed: {0}")]
    State(String),
}

/// View of the ledger handed to the contract for one transaction.
pub trait Stub {
    fn tx_id(&self) -> &str;
    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, ContractError>;
    fn put_state(&mut self, key: &str, value: Vec<u8>) -> Result<(), ContractError>;
}

/// The seed certification contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeedContract {
    pub reject_duplicates: bool,
}

impl SeedContract {
    pub fn new(reject_duplicates: bool) -> Self {
        Self { reject_duplicates }
    }

    /// Dispatch a transaction by function name.
    ///
    /// # Errors
    /// Returns the contract error raised by the called function, or
    /// `UnknownFunction` when the name is not part of the contract.
    pub fn invoke(
        &self,
        stub: &mut dyn Stub,
        function: &str,
        args: &[String],
    ) -> Result<Vec<u8>, ContractError> {
        match function {
            CREATE_SEED_RECORD => {
                if args.len() != 4 && args.len() != 7 {
                    return Err(ContractError::InvalidArgument(format!(
                        "{CREATE_SEED_RECORD} expects 4 or 7 arguments, got {}",
                        args.len()
                    )));
                }
                let (sig, pub_, signer) = if args.len() == 7 {
                    (args[4].as_str(), args[5].as_str(), args[6].as_str())
                } else {
                    ("", "", "")
                };
                let rec = self.create_seed_record(
                    stub, &args[0], &args[1], &args[2], &args[3], sig, pub_, signer,
                )?;
                serde_json::to_vec(&rec).map_err(|e| ContractError::State(e.to_string()))
            }
            GET_SEED_RECORD => {
                let [seed_id] = args else {
                    return Err(ContractError::InvalidArgument(format!(
                        "{GET_SEED_RECORD} expects 1 argument, got {}",
                        args.len()
                    )));
                };
                self.get_seed_record(stub, seed_id)
            }
            other => Err(ContractError::UnknownFunction(other.to_string())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_seed_record(
        &self,
        stub: &mut dyn Stub,
        seed_id: &str,
        class_name: &str,
        hash: &str,
        timestamp: &str,
        signature: &str,
        public_key: &str,
        signer_name: &str,
    ) -> Result<SeedRecord, ContractError> {
        for (name, value) in [
            ("seedId", seed_id),
            ("className", class_name),
            ("hash", hash),
            ("timestamp", timestamp),
        ] {
            if value.trim().is_empty() {
                return Err(ContractError::InvalidArgument(format!("{name} is required")));
            }
        }

        if signature.is_empty() != public_key.is_empty() {
            return Err(ContractError::InvalidArgument(
                "signature and publicKey must be given together".into(),
            ));
        }
        if !signature.is_empty() {
            if !verify_signature(hash, signature, public_key) {
                return Err(ContractError::BadSignature(seed_id.to_string()));
            }
            info!("signature verified for seed {seed_id}");
        } else {
            warn!("no certifier signature provided for seed {seed_id}");
        }

        if self.reject_duplicates {
            let existing = stub.get_state(seed_id)?;
            if existing.is_some_and(|b| !b.is_empty()) {
                return Err(ContractError::Duplicate(seed_id.to_string()));
            }
        }

        let record = SeedRecord {
            seed_id: seed_id.to_string(),
            class_name: class_name.to_string(),
            hash: hash.to_string(),
            timestamp: timestamp.to_string(),
            tx_id: stub.tx_id().to_string(),
            signature: signature.to_string(),
            public_key: public_key.to_string(),
            signer_name: signer_name.to_string(),
            doc_type: DOC_TYPE.to_string(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| ContractError::State(e.to_string()))?;
        stub.put_state(seed_id, bytes)?;
        info!("created seed record {seed_id} hash={}", short(hash));
        Ok(record)
    }

    pub fn get_seed_record(&self, stub: &dyn Stub, seed_id: &str) -> Result<Vec<u8>, ContractError> {
        match stub.get_state(seed_id)? {
            Some(bytes) if !bytes.is_empty() => Ok(bytes),
            _ => Err(ContractError::NotFound(seed_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapStub {
        tx_id: String,
        map: HashMap<String, Vec<u8>>,
    }

    impl MapStub {
        fn new(tx_id: &str) -> Self {
            Self {
                tx_id: tx_id.into(),
                map: HashMap::new(),
            }
        }
    }

    impl Stub for MapStub {
        fn tx_id(&self) -> &str {
            &self.tx_id
        }
        fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, ContractError> {
            Ok(self.map.get(key).cloned())
        }
        fn put_state(&mut self, key: &str, value: Vec<u8>) -> Result<(), ContractError> {
            self.map.insert(key.into(), value);
            Ok(())
        }
    }

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn create_then_get_round_trips_fields() {
        let cc = SeedContract::default();
        let mut stub = MapStub::new("tx-1");
        cc.invoke(
            &mut stub,
            CREATE_SEED_RECORD,
            &args(&["seed-001", "healthy", "abc123", "2024-01-01T00:00:00Z"]),
        )
        .unwrap();
        let bytes = cc
            .invoke(&mut stub, GET_SEED_RECORD, &args(&["seed-001"]))
            .unwrap();
        let rec: SeedRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(rec.class_name, "healthy");
        assert_eq!(rec.hash, "abc123");
        assert_eq!(rec.timestamp, "2024-01-01T00:00:00Z");
        assert_eq!(rec.tx_id, "tx-1");
        assert_eq!(rec.doc_type, DOC_TYPE);
    }

    #[test]
    fn get_missing_or_empty_is_not_found() {
        let cc = SeedContract::default();
        let mut stub = MapStub::new("tx");
        let err = cc
            .invoke(&mut stub, GET_SEED_RECORD, &args(&["nope"]))
            .unwrap_err();
        assert_eq!(err, ContractError::NotFound("nope".into()));
        assert_eq!(err.to_string(), "Seed nope does not exist");

        stub.map.insert("empty".into(), vec![]);
        let err = cc
            .invoke(&mut stub, GET_SEED_RECORD, &args(&["empty"]))
            .unwrap_err();
        assert!(matches!(err, ContractError::NotFound(_)));
    }

    #[test]
    fn overwrite_is_last_write_wins_by_default() {
        let cc = SeedContract::default();
        let mut stub = MapStub::new("tx-a");
        cc.invoke(&mut stub, CREATE_SEED_RECORD, &args(&["s", "a", "h1", "t"]))
            .unwrap();
        stub.tx_id = "tx-b".into();
        cc.invoke(&mut stub, CREATE_SEED_RECORD, &args(&["s", "b", "h2", "t"]))
            .unwrap();
        let rec: SeedRecord =
            serde_json::from_slice(&cc.get_seed_record(&stub, "s").unwrap()).unwrap();
        assert_eq!(rec.class_name, "b");
        assert_eq!(rec.tx_id, "tx-b");
    }

    #[test]
    fn duplicates_rejected_when_enabled() {
        let cc = SeedContract::new(true);
        let mut stub = MapStub::new("tx");
        cc.invoke(&mut stub, CREATE_SEED_RECORD, &args(&["s", "a", "h", "t"]))
            .unwrap();
        let err = cc
            .invoke(&mut stub, CREATE_SEED_RECORD, &args(&["s", "a", "h", "t"]))
            .unwrap_err();
        assert_eq!(err, ContractError::Duplicate("s".into()));
    }

    #[test]
    fn empty_seed_id_is_invalid() {
        let cc = SeedContract::default();
        let mut stub = MapStub::new("tx");
        let err = cc
            .invoke(&mut stub, CREATE_SEED_RECORD, &args(&["", "a", "h", "t"]))
            .unwrap_err();
        assert!(matches!(err, ContractError::InvalidArgument(_)));
        assert!(stub.map.is_empty());
    }

    #[test]
    fn bad_signature_is_rejected() {
        let cc = SeedContract::default();
        let mut stub = MapStub::new("tx");
        let err = cc
            .invoke(
                &mut stub,
                CREATE_SEED_RECORD,
                &args(&["s", "a", "abcd", "t", "00", "11", "Nursery"]),
            )
            .unwrap_err();
        assert_eq!(err, ContractError::BadSignature("s".into()));
    }

    #[test]
    fn lone_signature_or_key_is_invalid() {
        let cc = SeedContract::default();
        let mut stub = MapStub::new("tx");
        for (sig, key) in [("00ff", ""), ("", "11ee")] {
            let err = cc
                .invoke(
                    &mut stub,
                    CREATE_SEED_RECORD,
                    &args(&["s", "a", "abcd", "t", sig, key, "Nursery"]),
                )
                .unwrap_err();
            assert!(matches!(err, ContractError::InvalidArgument(_)));
        }
        assert!(stub.map.is_empty());

        // an empty signature triple stores an unsigned record
        cc.invoke(&mut stub, CREATE_SEED_RECORD, &args(&["s", "a", "abcd", "t", "", "", ""]))
            .unwrap();
        let rec: SeedRecord =
            serde_json::from_slice(&cc.get_seed_record(&stub, "s").unwrap()).unwrap();
        assert!(rec.signature.is_empty() && rec.public_key.is_empty());
    }

    #[test]
    fn unknown_function_and_arity() {
        let cc = SeedContract::default();
        let mut stub = MapStub::new("tx");
        assert!(matches!(
            cc.invoke(&mut stub, "DeleteSeedRecord", &[]),
            Err(ContractError::UnknownFunction(_))
        ));
        assert!(matches!(
            cc.invoke(&mut stub, GET_SEED_RECORD, &[]),
            Err(ContractError::InvalidArgument(_))
        ));
    }

    #[test]
    fn error_kind_survives_json() {
        let err = ContractError::Duplicate("s".into());
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["kind"], "duplicate");
        let back: ContractError = serde_json::from_value(v).unwrap();
        assert_eq!(back, err);
    }
}
