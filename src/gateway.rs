use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use log::{error, info, warn};
use serde_json::{json, Value};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::certifiers::CertifierRegistry;
use crate::chaincode::{ContractError, SeedContract, CREATE_SEED_RECORD, GET_SEED_RECORD};
use crate::client::{Contract, Gateway, GatewayError, HttpTransport, Transport};
use crate::config::Config;
use crate::identity;
use crate::ledger::FileState;
use crate::peer::Peer;
use crate::policy::CreatorGuard;
use crate::record::{short, CertifyRequest, CertifyResponse, SeedRecord};
use crate::schema;

pub const VERIFY_NOT_FOUND: &str = "Seed not found or invalid";

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": msg.into() })))
}

/// Shared handler state, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub contract: Arc<Contract>,
    pub certifiers: Arc<CertifierRegistry>,
    pub ledger_type: String,
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "blockchain": state.ledger_type }))
}

pub async fn list_certifiers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "signers": state.certifiers.list() }))
}

/// Submit `CreateSeedRecord` and report the committed transaction id.
///
/// # Errors
/// 400 for a malformed body, 409 when duplicates are rejected and the seed
/// exists, 500 with the raw message for any other ledger failure.
pub async fn post_certify(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<CertifyResponse>, ApiError> {
    let Json(body) = body.map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;
    schema::validate_certify(&body).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    let req: CertifyRequest =
        serde_json::from_value(body).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    info!("certify request for seed {}", req.seed_id);
    info!("certify className={} hash={}...", req.class_name, short(&req.hash));

    let contract = state.contract.clone();
    let args = req.chaincode_args();
    let result = tokio::task::spawn_blocking(move || {
        contract.submit_transaction(CREATE_SEED_RECORD, &args)
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let bytes = result.map_err(|e| {
        error!("certify failed for seed {}: {e}", req.seed_id);
        let status = match e.contract_error() {
            Some(ContractError::Duplicate(_)) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        api_error(status, e.to_string())
    })?;
    let record: SeedRecord = serde_json::from_slice(&bytes)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    info!("certified seed {} tx={}", record.seed_id, record.tx_id);
    Ok(Json(CertifyResponse {
        success: true,
        message: "Seed certified on blockchain".into(),
        seed_id: req.seed_id,
        transaction_id: record.tx_id,
        ledger_type: state.ledger_type.clone(),
    }))
}

/// Evaluate `GetSeedRecord`; every failure collapses to the same 404 body.
///
/// # Errors
/// 404 `{"error":"Seed not found or invalid"}` regardless of the cause.
pub async fn get_verify(
    State(state): State<AppState>,
    Path(seed_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    info!("verify request for seed {seed_id}");
    let contract = state.contract.clone();
    let id = seed_id.clone();
    let result = tokio::task::spawn_blocking(move || {
        contract.evaluate_transaction(GET_SEED_RECORD, &[id])
    })
    .await;

    let not_found = |detail: String| {
        warn!("verify failed for seed {seed_id}: {detail}");
        api_error(StatusCode::NOT_FOUND, VERIFY_NOT_FOUND)
    };
    let bytes = match result {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => return Err(not_found(e.to_string())),
        Err(e) => return Err(not_found(e.to_string())),
    };
    let record: Value = serde_json::from_slice(&bytes).map_err(|e| not_found(e.to_string()))?;
    let hash = record.get("hash").and_then(Value::as_str).unwrap_or_default();
    info!("verified seed {seed_id} hash={}...", short(hash));
    Ok(Json(record))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/certifiers", get(list_certifiers))
        .route("/certify", post(post_certify))
        .route("/verify/:seed_id", get(get_verify))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(64))
}

/// Connect to the ledger described by `cfg`, failing if any part of the setup fails.
///
/// # Errors
/// Returns an error when the signer key, ledger directory, certifier file or
/// remote peer cannot be loaded or reached.
pub fn connect(cfg: &Config) -> anyhow::Result<AppState> {
    let (identity, signer) = identity::load_or_create(&cfg.key_path, &cfg.msp_id)?;
    let transport: Arc<dyn Transport> = match cfg.peer_endpoint.as_deref() {
        Some(endpoint) => {
            let http = HttpTransport::new(endpoint);
            http.ping()
                .map_err(|e: GatewayError| anyhow::anyhow!("peer {endpoint} unreachable: {e}"))?;
            info!("using remote peer at {endpoint}");
            Arc::new(http)
        }
        None => {
            info!("using in-process peer, ledger at {}", cfg.ledger_dir.display());
            Arc::new(local_peer(cfg)?)
        }
    };
    let gateway = Gateway::connect(transport, identity, signer);
    let contract = gateway.contract(&cfg.channel, &cfg.chaincode);
    let certifiers = CertifierRegistry::load(cfg.certifiers_toml.as_deref())?;
    info!(
        "connected to ledger as {} on {}/{}",
        gateway.identity().msp_id,
        cfg.channel,
        cfg.chaincode
    );
    Ok(AppState {
        contract: Arc::new(contract),
        certifiers: Arc::new(certifiers),
        ledger_type: cfg.ledger_type.clone(),
    })
}

/// Peer backed by the configured ledger directory.
///
/// # Errors
/// Returns an error when the ledger directory cannot be created or its
/// commit log cannot be read.
pub fn local_peer(cfg: &Config) -> anyhow::Result<Peer> {
    let state = FileState::open(&cfg.ledger_dir)?;
    Ok(Peer::new(
        &cfg.channel,
        &cfg.chaincode,
        Arc::new(state),
        CreatorGuard::load(cfg.creators_toml.as_deref()),
        SeedContract::new(cfg.reject_duplicates),
    )?)
}

/// Launch the HTTP gateway on the provided socket address.
///
/// # Errors
/// Returns an error when the listener fails to bind or the server terminates unexpectedly.
pub async fn run(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("gateway listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(dir: &std::path::Path) -> Config {
        Config {
            ledger_dir: dir.join("ledger"),
            key_path: dir.join("signer.key"),
            creators_toml: None,
            certifiers_toml: None,
            queue_path: dir.join("queue.json"),
            ..Config::default()
        }
    }

    #[test]
    fn connect_uses_in_process_peer_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = connect(&temp_config(dir.path())).unwrap();
        assert_eq!(state.ledger_type, "fabric");
        assert_eq!(state.certifiers.list().len(), 3);
        assert!(dir.path().join("signer.key").exists());
    }

    #[test]
    fn connect_fails_fast_on_unreachable_peer() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            peer_endpoint: Some("http://127.0.0.1:1".into()),
            ..temp_config(dir.path())
        };
        let err = connect(&cfg).err().unwrap();
        assert!(err.to_string().contains("unreachable"), "{err}");
    }

    #[test]
    fn connect_fails_fast_on_bad_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = temp_config(dir.path());
        std::fs::write(&cfg.key_path, "not a key").unwrap();
        assert!(connect(&cfg).is_err());
    }

    #[test]
    fn connect_fails_fast_on_malformed_certifiers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certifiers.toml");
        std::fs::write(&path, "[[certifier]]\nid = 1\n").unwrap();
        let cfg = Config {
            certifiers_toml: Some(path),
            ..temp_config(dir.path())
        };
        assert!(connect(&cfg).is_err());
    }
}
