use crate::config::{Config, ServerKeys};
use crate::models::MIGRATIONS;
use crate::orchestrator::run_dvm;
use crate::wallet::LnBitsWallet;
use crate::worker::{ScriptWorker, TextExtractor, WorkerRegistry};
use anyhow::anyhow;
use clap::Parser;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use diesel_migrations::MigrationHarness;
use log::{error, info};
use nostr::{EventBuilder, Keys, Kind, Metadata, Tag, TagKind, ToBech32};
use nostr_sdk::Client;
use std::path::PathBuf;
use std::sync::Arc;

mod config;
mod feedback;
mod ledger;
mod models;
mod orchestrator;
mod tags;
mod wallet;
mod worker;
mod zaps;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::try_init()?;
    let config: Config = Config::parse();

    // Create the datadir if it doesn't exist
    std::fs::create_dir_all(&config.data_dir)?;
    let keys_path = config.keys_file();
    let mut server_keys = ServerKeys::load(&keys_path, config.explicit_secret_key()?);
    let keys = server_keys.keys();

    let manager = ConnectionManager::<PgConnection>::new(&config.pg_url);
    let db_pool = Pool::builder()
        .max_size(8)
        .test_on_check_out(true)
        .build(manager)?;
    {
        let mut conn = db_pool.get()?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow!("failed to run migrations: {e}"))?;
    }

    let registry = build_registry(&config);
    if registry.is_empty() {
        return Err(anyhow!("no workers registered"));
    }

    let pk = keys.public_key();
    info!(
        "[{}] public key: {} hex: {pk} supported tasks: {}",
        config.name,
        pk.to_bech32()?,
        registry.tasks().join(", ")
    );

    announce(&config, &mut server_keys, &keys, &registry, &keys_path).await?;

    let wallet = LnBitsWallet::new(
        config.lnbits_url.clone(),
        config.lnbits_invoice_key.clone(),
        config.lnbits_admin_key.clone(),
    );

    loop {
        info!("[{}] Starting listener", config.name);
        if let Err(e) = run_dvm(
            &config,
            keys.clone(),
            registry.clone(),
            wallet.clone(),
            db_pool.clone(),
        )
        .await
        {
            error!("Error in loop: {e}");
        }
    }
}

fn build_registry(config: &Config) -> WorkerRegistry {
    let mut registry = WorkerRegistry::default();
    registry.register(Arc::new(TextExtractor::new(0, 0)));

    if let Some(script) = &config.script {
        let mut worker = ScriptWorker::new(
            config.script_task.clone(),
            Kind::JobRequest(config.script_kind),
            config.script_fix_cost,
            config.script_per_unit_cost,
            script.clone(),
            config.identifier.clone(),
        );
        if !config.use_own_venv {
            let system = if cfg!(windows) { "python" } else { "python3" };
            worker = worker.with_interpreter(PathBuf::from(system));
        }
        registry.register(Arc::new(worker));
    }

    registry
}

/// Publish the kind-0 metadata and kind-31990 handler announcement once,
/// then remember them alongside the keys.
async fn announce(
    config: &Config,
    server_keys: &mut ServerKeys,
    keys: &Keys,
    registry: &WorkerRegistry,
    keys_path: &PathBuf,
) -> anyhow::Result<()> {
    let mut events = vec![];
    if server_keys.kind0.is_none() {
        let metadata = Metadata {
            name: Some(config.name.clone()),
            display_name: Some(config.name.clone()),
            about: Some(format!(
                "Data vending machine serving: {}",
                registry.tasks().join(", ")
            )),
            picture: None,
            nip05: None,
            ..Default::default()
        };
        let event = EventBuilder::metadata(&metadata).to_event(keys)?;
        server_keys.kind0 = Some(event.clone());
        events.push(event)
    }
    if server_keys.kind31990.is_none() {
        let mut tags: Vec<Tag> = registry
            .kinds()
            .iter()
            .map(|k| {
                Tag::Generic(
                    TagKind::Custom("k".to_string()),
                    vec![k.as_u64().to_string()],
                )
            })
            .collect();
        tags.push(Tag::Generic(
            TagKind::Custom("d".to_string()),
            vec![config.identifier.clone()],
        ));
        let event = EventBuilder::new(
            Kind::Custom(31990),
            server_keys.kind0.as_ref().unwrap().content.clone(),
            tags,
        )
        .to_event(keys)?;
        server_keys.kind31990 = Some(event.clone());
        events.push(event)
    }

    if !events.is_empty() {
        // send to relays
        let client = Client::new(keys);
        client.add_relays(config.relay.clone()).await?;
        client.connect().await;
        client.batch_event(events, Default::default()).await?;
        client.disconnect().await?;
        // write to storage
        server_keys.write(keys_path);
    }

    Ok(())
}
