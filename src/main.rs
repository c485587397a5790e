use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};

use seedcert::certifiers::CertifierRegistry;
use seedcert::config::Config;
use seedcert::gateway;
use seedcert::ledger::{blake3_hex, FileState, WorldState};
use seedcert::peer;
use seedcert::queue::{Certify, CertifyQueue, ProxyClient, QueueWorker};
use seedcert::record::CertifyRequest;

#[derive(Parser)]
#[command(name = "seedcert")]
#[command(about = "seedcert: seed certification ledger, gateway proxy and queue")]
struct Cli {
    /// Path to a TOML config file (defaults to $SEEDCERT_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the HTTP gateway proxy (/certify, /verify/:seedId, /health)
    Serve {
        /// Listen address, overrides config
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run a standalone peer that hosts the seed chaincode
    Peer {
        #[arg(long)]
        listen: Option<String>,
    },
    /// Certify one seed through a running proxy
    Certify {
        #[command(flatten)]
        seed: SeedArgs,
        /// Certifier that signs the hash
        #[arg(long)]
        certifier: Option<String>,
        #[arg(long, default_value = "http://localhost:3000")]
        proxy: String,
    },
    /// Look a seed up through a running proxy
    Verify {
        seed_id: String,
        #[arg(long, default_value = "http://localhost:3000")]
        proxy: String,
    },
    /// Certification queue operations
    Queue {
        #[command(subcommand)]
        cmd: QueueCmd,
    },
    /// Show committed transactions from the local ledger
    History,
}

#[derive(Subcommand)]
enum QueueCmd {
    /// Add a seed to the queue
    Add {
        #[command(flatten)]
        seed: SeedArgs,
        #[arg(long)]
        certifier: String,
    },
    /// Show queued and failed items
    List,
    /// Process the queue in order against a proxy
    Run {
        #[arg(long, default_value = "http://localhost:3000")]
        proxy: String,
    },
    /// Drop every item
    Clear,
}

#[derive(Args)]
struct SeedArgs {
    #[arg(long)]
    seed_id: String,
    #[arg(long)]
    class_name: String,
    /// Hex content fingerprint
    #[arg(long, conflicts_with = "image")]
    hash: Option<String>,
    /// Image file; its blake3 digest is used as the hash
    #[arg(long)]
    image: Option<PathBuf>,
    /// RFC 3339 timestamp, defaults to now
    #[arg(long)]
    timestamp: Option<String>,
}

impl SeedArgs {
    fn into_request(self) -> Result<CertifyRequest> {
        let hash = match (self.hash, self.image) {
            (Some(h), _) => h,
            (None, Some(path)) => blake3_hex(&std::fs::read(&path)?),
            (None, None) => return Err(anyhow!("either --hash or --image is required")),
        };
        let ts = self
            .timestamp
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        Ok(CertifyRequest::new(&self.seed_id, &self.class_name, &hash, &ts))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;

    match cli.cmd {
        Cmd::Serve { listen } => {
            let state = gateway::connect(&cfg)
                .map_err(|e| anyhow!("failed to connect to ledger: {e}"))?;
            let addr = listen.unwrap_or_else(|| cfg.listen.clone());
            gateway::run(&addr, state).await?;
        }
        Cmd::Peer { listen } => {
            let p = Arc::new(gateway::local_peer(&cfg)?);
            let addr = listen.unwrap_or_else(|| cfg.peer_listen.clone());
            peer::run(&addr, p).await?;
        }
        Cmd::Certify {
            seed,
            certifier,
            proxy,
        } => {
            let mut req = seed.into_request()?;
            if let Some(id) = certifier {
                let registry = CertifierRegistry::load(cfg.certifiers_toml.as_deref())?;
                let signed = registry.sign_hash(&req.hash, &id)?;
                req.signature = signed.signature_hex;
                req.public_key = signed.public_key_hex;
                req.signer_name = signed.signer_name;
            }
            let client = ProxyClient::new(&proxy);
            let resp = tokio::task::spawn_blocking(move || client.certify(&req)).await??;
            println!("CERTIFIED {} tx={}", resp.seed_id, resp.transaction_id);
        }
        Cmd::Verify { seed_id, proxy } => {
            let client = ProxyClient::new(&proxy);
            let record = tokio::task::spawn_blocking(move || client.verify(&seed_id)).await??;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Cmd::Queue { cmd } => match cmd {
            QueueCmd::Add { seed, certifier } => {
                let registry = CertifierRegistry::load(cfg.certifiers_toml.as_deref())?;
                if !registry.contains(&certifier) {
                    let known: Vec<_> = registry.list().into_iter().map(|c| c.id).collect();
                    return Err(anyhow!(
                        "unknown certifier {certifier} (known: {})",
                        known.join(", ")
                    ));
                }
                let mut q = CertifyQueue::open(&cfg.queue_path)?;
                let req = seed.into_request()?;
                let id = req.seed_id.clone();
                q.enqueue(req, &certifier)?;
                println!("QUEUED {id} ({} pending)", q.pending());
            }
            QueueCmd::List => {
                let q = CertifyQueue::open(&cfg.queue_path)?;
                for item in q.items() {
                    let err = item.error.as_deref().unwrap_or("");
                    println!(
                        "{}\t{:?}\t{}\t{}",
                        item.seed.seed_id, item.status, item.certifier, err
                    );
                }
            }
            QueueCmd::Run { proxy } => {
                let q = CertifyQueue::open(&cfg.queue_path)?;
                let registry = Arc::new(CertifierRegistry::load(cfg.certifiers_toml.as_deref())?);
                let handle = QueueWorker::spawn(
                    q,
                    Arc::new(ProxyClient::new(&proxy)),
                    registry,
                    Duration::from_millis(cfg.queue_delay_ms),
                );
                let summary = handle.process().await?;
                println!(
                    "PROCESSED {} (certified {}, failed {})",
                    summary.processed, summary.completed, summary.failed
                );
            }
            QueueCmd::Clear => {
                CertifyQueue::open(&cfg.queue_path)?.clear()?;
                println!("QUEUE CLEARED");
            }
        },
        Cmd::History => {
            let state = FileState::open(&cfg.ledger_dir)?;
            for entry in state.history()? {
                println!(
                    "{}\t{}\t{}\t{}",
                    entry.committed_at,
                    entry.tx_id,
                    entry.function,
                    entry.keys.join(",")
                );
            }
        }
    }
    Ok(())
}
