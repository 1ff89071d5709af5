use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use shigodeki_sync::{
    Collection, CollectionScope, Identifier, MemoryRemote, Record, RecordPatch, RemoteFailure,
    RemoteOp, SyncConfig, SyncEngine,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, event};

#[derive(Parser)]
#[command(name = "shigodeki-sync")]
#[command(about = "Runs optimistic sync scenarios against an in-memory backend")]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info", global = true)]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plays one scenario and prints the resulting store as JSON.
    Simulate {
        #[arg(long, value_enum)]
        scenario: Scenario,
        /// JSON file with engine configuration overrides.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Prints the default engine configuration.
    DefaultConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scenario {
    /// Create fails remotely and is rolled back.
    A,
    /// Update succeeds and is committed.
    B,
    /// Delete fails remotely and the record comes back.
    C,
    /// A server batch arrives while an update is in flight.
    D,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    match cli.command {
        Command::Simulate { scenario, config } => {
            let config = load_config(config)?;
            simulate(scenario, config).await
        }
        Command::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&SyncConfig::default())?);
            Ok(())
        }
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    SyncConfig::from_json_str(&raw).with_context(|| format!("invalid config in {}", path.display()))
}

fn family(id: &str, name: &str) -> Record {
    Record::new(Identifier::from(id), Collection::Families)
        .with_field("name", name)
        .with_members(["u1"])
}

async fn simulate(scenario: Scenario, config: SyncConfig) -> Result<()> {
    let remote = MemoryRemote::new();
    let engine = Arc::new(SyncEngine::with_backend(remote.clone(), config)?);
    let scope = CollectionScope::member_of(Collection::Families, "u1");

    match scenario {
        Scenario::A => {
            remote.fail_next(RemoteOp::Create, RemoteFailure::transient("network unreachable"));
            let draft = Record::draft(Collection::Families)
                .with_field("name", "Tanaka")
                .with_members(["u1"]);
            let outcome = engine.create(Collection::Families, draft).await;
            event!(Level::INFO, ok = outcome.is_ok(), "create finished");
        }
        Scenario::B => {
            seed(&engine, &remote, &scope, family("f1", "Old")).await?;
            let outcome = engine
                .update(&Identifier::from("f1"), RecordPatch::new().set("name", "New"))
                .await;
            event!(Level::INFO, ok = outcome.is_ok(), "update finished");
        }
        Scenario::C => {
            seed(&engine, &remote, &scope, family("f1", "Tanaka")).await?;
            remote.fail_next(RemoteOp::Delete, RemoteFailure::permanent("permission denied"));
            let outcome = engine.delete(&Identifier::from("f1")).await;
            event!(Level::INFO, ok = outcome.is_ok(), "delete finished");
        }
        Scenario::D => {
            remote.set_manual_push(true);
            seed(&engine, &remote, &scope, family("f2", "Before")).await?;
            remote.hold(RemoteOp::Update);

            let updating = {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .update(&Identifier::from("f2"), RecordPatch::new().set("name", "Local"))
                        .await
                })
            };
            remote.wait_for_calls(RemoteOp::Update, 1).await;

            let mut events = engine.subscribe().await;
            remote.push_batch(&scope, vec![family("f2", "Server")]);
            events.recv().await;
            let during = engine
                .get(&Identifier::from("f2"))
                .await
                .and_then(|record| record.display_name().map(str::to_string));
            event!(Level::INFO, name = ?during, "server batch merged while update in flight");

            remote.open(RemoteOp::Update);
            let outcome = updating.await.map_err(|err| anyhow!("update task: {}", err))?;
            event!(Level::INFO, ok = outcome.is_ok(), "update finished");
        }
    }

    let records: Vec<Record> = engine.snapshot().await.values().cloned().collect();
    println!("{}", serde_json::to_string_pretty(&records)?);

    engine.shutdown().await?;
    Ok(())
}

/// Puts `record` on the server and waits for the listener to deliver it.
async fn seed(
    engine: &SyncEngine,
    remote: &MemoryRemote,
    scope: &CollectionScope,
    record: Record,
) -> Result<()> {
    let id = record.id.clone();
    remote.insert_document(record);

    let mut events = engine.subscribe().await;
    engine.start([scope.clone()]).await;
    while engine.get(&id).await.is_none() {
        events
            .recv()
            .await
            .ok_or_else(|| anyhow!("store closed before {} arrived", id))?;
    }
    Ok(())
}
