#![allow(
    clippy::missing_errors_doc,
    clippy::explicit_auto_deref,
    clippy::non_std_lazy_statics
)]
use anyhow::{anyhow, Result};
use jsonschema::{Draft, JSONSchema};
use serde_json::json;
use serde_json::Value;

// Guards the /certify boundary; the chaincode re-checks non-empty fields.
pub static CERTIFY_SCHEMA: std::sync::LazyLock<Value> = std::sync::LazyLock::new(|| {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "$id": "https://seedcert.dev/schema/certify.json",
        "type": "object",
        "required": ["seedId", "className", "hash", "timestamp"],
        "properties": {
            "seedId": {"type": "string", "minLength": 1},
            "className": {"type": "string", "minLength": 1},
            "hash": {"type": "string", "minLength": 1},
            "timestamp": {"type": "string", "format": "date-time"},
            "signature": {"type": "string"},
            "publicKey": {"type": "string"},
            "signerName": {"type": "string"}
        },
        "dependencies": {
            "signature": ["publicKey"],
            "publicKey": ["signature"]
        },
        "additionalProperties": true
    })
});

pub static SEED_RECORD_SCHEMA: std::sync::LazyLock<Value> = std::sync::LazyLock::new(|| {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "$id": "https://seedcert.dev/schema/seed-record.json",
        "type": "object",
        "required": ["seedId", "className", "hash", "timestamp", "tx_id", "docType"],
        "properties": {
            "seedId": {"type": "string"},
            "className": {"type": "string"},
            "hash": {"type": "string"},
            "timestamp": {"type": "string"},
            "tx_id": {"type": "string", "minLength": 1},
            "docType": {"const": "seedRecord"}
        },
        "additionalProperties": true
    })
});

fn validate(schema: &Value, v: &Value, what: &str) -> Result<()> {
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| anyhow!("invalid {what} schema: {e}"))?;
    if let Err(errs) = compiled.validate(v) {
        let msgs: Vec<String> = errs.map(|e| e.to_string()).collect();
        return Err(anyhow!("{what} schema violation: {}", msgs.join("; ")));
    }
    Ok(())
}

pub fn validate_certify(v: &Value) -> Result<()> {
    validate(&*CERTIFY_SCHEMA, v, "certify request")?;
    // timestamp must parse as RFC 3339 even when format checks are off
    if let Some(ts) = v.get("timestamp").and_then(Value::as_str) {
        chrono::DateTime::parse_from_rfc3339(ts).map_err(|e| {
            anyhow!("certify request schema violation: timestamp {ts:?} is not RFC 3339: {e}")
        })?;
    }
    Ok(())
}

pub fn validate_record(v: &Value) -> Result<()> {
    validate(&*SEED_RECORD_SCHEMA, v, "seed record")
}
