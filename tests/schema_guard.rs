use serde_json::json;

use seedcert::schema;

// Helper: minimal valid certify body
fn valid_certify_json() -> serde_json::Value {
    json!({
        "seedId": "seed-001",
        "className": "healthy",
        "hash": "abc123",
        "timestamp": "2024-01-01T00:00:00Z"
    })
}

#[test]
fn certify_schema_rejects_missing_required_fields() {
    for field in ["seedId", "className", "hash", "timestamp"] {
        let mut v = valid_certify_json();
        v.as_object_mut().unwrap().remove(field);
        let err = schema::validate_certify(&v).unwrap_err();
        assert!(
            err.to_string().contains("certify request schema violation"),
            "missing {field}: {err}"
        );
    }
}

#[test]
fn certify_schema_rejects_empty_seed_id_and_bad_timestamp() {
    let mut v = valid_certify_json();
    v["seedId"] = json!("");
    assert!(schema::validate_certify(&v).is_err());

    let mut v = valid_certify_json();
    v["timestamp"] = json!("not-a-datetime");
    let err = schema::validate_certify(&v).unwrap_err();
    assert!(err.to_string().contains("schema"));

    let mut v = valid_certify_json();
    v["hash"] = json!(42);
    assert!(schema::validate_certify(&v).is_err());
}

#[test]
fn certify_schema_accepts_signed_bodies() {
    schema::validate_certify(&valid_certify_json()).expect("certify valid");
    let mut v = valid_certify_json();
    v["signature"] = json!("00ff");
    v["publicKey"] = json!("11ee");
    v["signerName"] = json!("Green Valley Nursery");
    schema::validate_certify(&v).expect("signed certify valid");
}

#[test]
fn record_schema_requires_tx_id_and_doc_type() {
    let mut rec = valid_certify_json();
    rec["tx_id"] = json!("deadbeef");
    rec["docType"] = json!("seedRecord");
    schema::validate_record(&rec).expect("record valid");

    rec["docType"] = json!("somethingElse");
    let err = schema::validate_record(&rec).unwrap_err();
    assert!(err.to_string().contains("seed record schema violation"));

    let mut no_tx = valid_certify_json();
    no_tx["docType"] = json!("seedRecord");
    assert!(schema::validate_record(&no_tx).is_err());
}

#[test]
fn certify_schema_requires_signature_and_key_together() {
    let mut v = valid_certify_json();
    v["signature"] = json!("00ff");
    let err = schema::validate_certify(&v).unwrap_err();
    assert!(err.to_string().contains("certify request schema violation"));

    let mut v = valid_certify_json();
    v["publicKey"] = json!("11ee");
    assert!(schema::validate_certify(&v).is_err());
}
