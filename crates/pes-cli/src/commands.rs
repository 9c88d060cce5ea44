use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use colored::Colorize;
use pes_bridge::{FileLog, LogBackend};
use pes_chain::{ChainError, MaterializedObject, MergePolicy, PartitionChain, RightsEngine, RightsSet};
use pes_crypto::{KeyDirectory, Keychain, Signer, SigningKey};
use pes_io::{EntityDraft, RequestContext, Store, StoreConfig};
use pes_task::{CallbackResult, TaskCallback};
use pes_types::PartitionKey;
use serde_json::json;

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Keygen => cmd_keygen(),
        Command::Config(args) => cmd_config(args),
        Command::Inspect(args) => cmd_inspect(args).await,
        Command::Demo(args) => cmd_demo(args).await,
    }
}

fn cmd_keygen() -> anyhow::Result<()> {
    let key = SigningKey::generate();
    println!("{} Generated Ed25519 key pair", "✓".green().bold());
    println!("  Secret:   {}", hex::encode(key.as_bytes()).red());
    println!("  Public:   {}", hex::encode(key.verifying_key().as_bytes()).cyan());
    println!("  Key hash: {}", key.key_hash().to_string().yellow());
    Ok(())
}

fn cmd_config(args: ConfigArgs) -> anyhow::Result<()> {
    let config = match &args.path {
        Some(path) => StoreConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => StoreConfig::default(),
    };
    print!("{}", config.to_toml_string()?);
    Ok(())
}

async fn cmd_inspect(args: InspectArgs) -> anyhow::Result<()> {
    let log = FileLog::open(&args.root, 16)
        .with_context(|| format!("opening {}", args.root.display()))?;
    let key = PartitionKey::new(args.topic, args.partition);
    let path = log.segment_path(&key);
    if !path.exists() {
        bail!("no segment for {} at {}", key, path.display());
    }
    log.create_partition(&key).await?;
    let items = log.read(&key, 0).await?;

    // Only keys announced on the log itself are known here.
    let chain = PartitionChain::new(
        key.clone(),
        Arc::new(RightsEngine::permissive()),
        MergePolicy::default().strategy(),
        Arc::new(KeyDirectory::new()),
    );
    for item in &items {
        match chain.append_bytes(item.offset, &item.bytes) {
            Ok(_) => {}
            Err(e @ ChainError::Corruption { .. }) => {
                println!("{} {}", "✗".red().bold(), e);
                break;
            }
            Err(e) => println!("{} offset {}: {}", "!".yellow(), item.offset, e),
        }
    }

    println!(
        "Partition {} — {} records, last offset {}",
        key.to_string().bold(),
        items.len(),
        chain
            .last_offset()?
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".into())
    );
    for object in chain.snapshot()?.values() {
        print_head(object);
    }

    let quarantine = chain.quarantine()?;
    if quarantine.is_empty() {
        println!("{} No quarantined records.", "✓".green());
    } else {
        println!("{} quarantined:", quarantine.len().to_string().red().bold());
        for q in &quarantine {
            let entity = q
                .entry
                .as_ref()
                .map(|e| e.entity_id.short_id())
                .unwrap_or_else(|| "?".into());
            println!("  @{:<6} {} {}", q.offset, entity.dimmed(), q.reason);
        }
    }
    Ok(())
}

fn print_head(object: &MaterializedObject) {
    let state = if object.deleted {
        "deleted".red()
    } else {
        "live".green()
    };
    println!(
        "  {} {} v{} @{} {}",
        object.id.short_id().yellow(),
        object.entity_type.cyan(),
        object.version.short_id().dimmed(),
        object.offset,
        state
    );
    if !object.deleted {
        println!("      {}", json!(object.fields));
    }
}

struct Counter(AtomicUsize);

impl TaskCallback for Counter {
    fn on_data(&self, _object: &MaterializedObject) -> CallbackResult {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn cmd_demo(args: DemoArgs) -> anyhow::Result<()> {
    let store = Store::open(
        StoreConfig::default(),
        RightsEngine::permissive(),
        Arc::new(KeyDirectory::new()),
    )?;
    let key = SigningKey::generate();
    let ctx = RequestContext::new("demo", Keychain::new().with_key(key.clone()));
    let partition = PartitionKey::new("demo", 0);

    let tasks = store.task_context(&partition).await?;
    let counter = Arc::new(Counter(AtomicUsize::new(0)));
    tasks.add_task(counter.clone(), "note", None)?;

    println!("Writing {} notes to {}", args.entities, partition.to_string().bold());
    for n in 0..args.entities {
        let draft = EntityDraft::new(partition.clone(), "note")
            .field("n", json!(n))
            .rights(RightsSet::new().with_write(key.key_hash()));
        let mark = if store.io().merge(&ctx, &draft).await? {
            "✓".green()
        } else {
            "✗".red()
        };
        println!("  {} note {}", mark, draft.id.short_id().yellow());
    }

    let notes = store.io().get_all(&ctx, &partition, "note").await?;
    println!("Read back {} notes", notes.len().to_string().bold());

    let expected = args.entities;
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        while counter.0.load(Ordering::SeqCst) < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    println!("Task delivered {}", counter.0.load(Ordering::SeqCst));
    println!("Access log holds {} records", store.access_log().len());

    drop(tasks);
    store.shutdown().await;
    Ok(())
}
