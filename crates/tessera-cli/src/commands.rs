use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context};
use colored::Colorize;
use tessera_sdk::{
    DriverRegistry, ObjectRecord, ObjectStore, Oid, Runtime, SdkError, StoreError, TesseraConfig,
    WriteRequest,
};

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    if let Command::Init(args) = &cli.command {
        return cmd_init(&cli, args).await;
    }
    let config = load_config(&cli)?;
    if let Command::Config = &cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let runtime = Runtime::start(config, &DriverRegistry::new())
        .await
        .context("failed to start runtime")?;
    let result = match &cli.command {
        Command::Stats => cmd_stats(&runtime, cli.format).await,
        Command::Get(args) => cmd_get(&runtime, args, cli.format).await,
        Command::Ls(args) => cmd_ls(&runtime, args, cli.format).await,
        Command::Put(args) => cmd_put(&runtime, args).await,
        Command::Rm(args) => cmd_rm(&runtime, args).await,
        Command::Vacuum => cmd_vacuum(&runtime).await,
        Command::Blob(args) => cmd_blob(&runtime, &args.action).await,
        Command::Init(_) | Command::Config => Ok(()),
    };
    runtime.shutdown().await?;
    result
}

fn load_config(cli: &Cli) -> anyhow::Result<TesseraConfig> {
    let mut config = if cli.config.exists() {
        TesseraConfig::load(&cli.config)?
    } else {
        tracing::debug!(path = %cli.config.display(), "no config file, using defaults");
        TesseraConfig::default()
    };
    if let Some(dsn) = &cli.dsn {
        config.storage.dsn = dsn.clone();
    }
    Ok(config)
}

fn parse_oid(raw: &str) -> anyhow::Result<Oid> {
    Oid::new(raw).with_context(|| format!("invalid oid {raw:?}"))
}

async fn cmd_init(cli: &Cli, args: &InitArgs) -> anyhow::Result<()> {
    if cli.config.exists() && !args.force {
        bail!(
            "{} already exists (use --force to overwrite)",
            cli.config.display()
        );
    }
    let mut config = TesseraConfig::default();
    if let Some(dsn) = &cli.dsn {
        config.storage.dsn = dsn.clone();
    }
    if let Some(name) = &args.name {
        config.storage.name = name.clone();
    }
    std::fs::write(&cli.config, config.to_toml_string()?)
        .with_context(|| format!("failed to write {}", cli.config.display()))?;

    let runtime = Runtime::start(config, &DriverRegistry::new()).await?;
    let has_index = runtime.store().has_unique_constraint().await?;
    let storage = &runtime.config().storage;
    println!(
        "{} Initialized database {} at {}",
        "✓".green().bold(),
        storage.name.bold(),
        storage.dsn
    );
    println!("  Config: {}", cli.config.display().to_string().cyan());
    println!(
        "  Tables: {}, {} (unique names: {})",
        storage.objects_table_name.yellow(),
        storage.blobs_table_name.yellow(),
        if has_index { "yes".green() } else { "no".red() }
    );
    runtime.shutdown().await?;
    Ok(())
}

async fn cmd_stats(runtime: &Runtime, format: OutputFormat) -> anyhow::Result<()> {
    let store = runtime.store();
    let txn = store.begin(true).await?;
    let objects = store.get_total_number_of_objects(&txn).await?;
    let resources = store.get_total_number_of_resources(&txn).await?;
    store.abort(&txn).await?;
    let current_tid = store.get_current_tid().await?;
    let trashed = store.get_trashed_objects().await?.len();
    let cache = runtime.cache().stats().await;

    if format == OutputFormat::Json {
        let report = serde_json::json!({
            "objects": objects,
            "resources": resources,
            "trashed": trashed,
            "current_tid": current_tid,
            "cache": cache,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("Database {}", runtime.config().storage.name.bold());
    println!("  Objects:     {}", objects.to_string().bold());
    println!("  Resources:   {}", resources);
    println!("  Trashed:     {}", trashed);
    println!("  Current TID: {}", current_tid.to_string().cyan());
    println!(
        "  Cache:       {} entries, {} bytes, {} hits, {} misses",
        cache.local.entries, cache.local.bytes, cache.local.hits, cache.local.misses
    );
    if let Some(remote) = cache.remote {
        println!("  Remote:      {}", remote);
    }
    Ok(())
}

fn print_record(record: &ObjectRecord, show_state: bool) {
    println!("{} {}", "oid".bold(), record.oid.to_string().yellow());
    println!("  tid:      {}", record.tid);
    println!("  type:     {}", record.type_name);
    if let Some(parent) = &record.parent_id {
        println!("  parent:   {}", parent);
    }
    if let Some(id) = &record.id {
        println!("  id:       {}", id);
    }
    if let Some(of) = &record.of {
        println!("  of:       {}", of);
    }
    println!("  resource: {}", record.resource);
    println!("  size:     {}", record.state_size);
    if let Some(json) = &record.json {
        println!("  json:     {}", json);
    }
    if show_state {
        println!("  state:    {}", String::from_utf8_lossy(&record.state));
    }
}

async fn cmd_get(runtime: &Runtime, args: &GetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let oid = parse_oid(&args.oid)?;
    let session = runtime.session(true).await?;
    let record = session.get(&oid).await;
    session.abort().await?;
    let record = match record {
        Ok(record) => record,
        Err(SdkError::Store(StoreError::NotFound(_))) => bail!("object {} not found", oid),
        Err(e) => return Err(e.into()),
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
        OutputFormat::Text => print_record(&record, args.state),
    }
    Ok(())
}

async fn cmd_ls(runtime: &Runtime, args: &LsArgs, format: OutputFormat) -> anyhow::Result<()> {
    let parent = parse_oid(&args.parent)?;
    let session = runtime.session(true).await?;
    let names: anyhow::Result<Vec<String>> = match args.page {
        Some(page) => session
            .store()
            .get_page_of_keys(session.transaction(), &parent, page, args.page_size)
            .await
            .map_err(Into::into),
        None => session.keys(&parent).await.map_err(Into::into),
    };
    let total = session.len(&parent).await;
    session.abort().await?;
    let (names, total) = (names?, total?);

    if format == OutputFormat::Json {
        let listing = serde_json::json!({ "parent": parent, "total": total, "names": names });
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }
    for name in &names {
        println!("  {}", name);
    }
    println!("{} of {} children", names.len().to_string().bold(), total);
    Ok(())
}

async fn cmd_put(runtime: &Runtime, args: &PutArgs) -> anyhow::Result<()> {
    let state = match (&args.state, &args.file) {
        (Some(inline), _) => inline.clone().into_bytes(),
        (None, Some(path)) => std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => Vec::new(),
    };
    let json = args
        .json
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--json is not valid JSON")?;
    let parent = args.parent.as_deref().map(parse_oid).transpose()?;
    let explicit = args.oid.as_deref().map(parse_oid).transpose()?;

    let mut request = match &parent {
        Some(parent) => WriteRequest::child(parent.clone(), &args.id, &args.type_name),
        None => WriteRequest::root(&args.id, &args.type_name),
    }
    .with_state(state);
    if let Some(json) = json {
        request = request.with_json(json);
    }
    let request = Arc::new(request);

    let (oid, tid) = runtime
        .run(|session| {
            let request = request.clone();
            let parent = parent.clone();
            let explicit = explicit.clone();
            let id = args.id.clone();
            async move {
                let existing = match (&explicit, &parent) {
                    (Some(oid), _) => match session.get(oid).await {
                        Ok(record) => Some(record),
                        Err(SdkError::Store(StoreError::NotFound(_))) => None,
                        Err(e) => return Err(e),
                    },
                    (None, Some(parent)) => session.get_child(parent, &id).await?,
                    (None, None) => None,
                };
                let oid = match (explicit, &existing) {
                    (Some(oid), _) => oid,
                    (None, Some(record)) => record.oid.clone(),
                    (None, None) => Oid::generate(),
                };
                let expected = existing.map(|record| record.tid);
                let tid = session.write(&oid, expected, request.as_ref()).await?;
                Ok((oid, tid))
            }
        })
        .await?;
    println!(
        "{} Stored {} at tid {}",
        "✓".green().bold(),
        oid.to_string().yellow(),
        tid.to_string().cyan()
    );
    Ok(())
}

async fn cmd_rm(runtime: &Runtime, args: &RmArgs) -> anyhow::Result<()> {
    if args.oids.is_empty() {
        bail!("nothing to remove");
    }
    let oids = args
        .oids
        .iter()
        .map(|raw| parse_oid(raw))
        .collect::<anyhow::Result<Vec<_>>>()?;
    runtime
        .run(|session| {
            let oids = oids.clone();
            async move {
                for oid in &oids {
                    session.delete(oid).await?;
                }
                Ok(())
            }
        })
        .await?;
    for oid in &oids {
        println!("  {} {}", "trashed:".red(), oid);
    }
    Ok(())
}

async fn cmd_vacuum(runtime: &Runtime) -> anyhow::Result<()> {
    let removed = runtime.store().vacuum().await?;
    println!("{} Vacuum: {} objects removed.", "✓".green(), removed);
    Ok(())
}

async fn cmd_blob(runtime: &Runtime, action: &BlobAction) -> anyhow::Result<()> {
    let manager = runtime.transaction_manager();
    match action {
        BlobAction::Put {
            blob_id,
            oid,
            file,
            chunk_size,
        } => {
            if *chunk_size == 0 {
                bail!("--chunk-size must be positive");
            }
            let oid = parse_oid(oid)?;
            let data = Arc::new(
                std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?,
            );
            let chunks = manager
                .run(|txn| {
                    let store = manager.store().clone();
                    let data = data.clone();
                    let oid = oid.clone();
                    let blob_id = blob_id.clone();
                    let chunk_size = *chunk_size;
                    async move {
                        store.delete_blob(&txn, &blob_id).await?;
                        let mut written = 0;
                        for (index, chunk) in data.chunks(chunk_size).enumerate() {
                            let index = i32::try_from(index).map_err(|_| {
                                StoreError::Serialization("blob has too many chunks".into())
                            })?;
                            store.write_blob_chunk(&txn, &blob_id, &oid, index, chunk).await?;
                            written += 1;
                        }
                        Ok(written)
                    }
                })
                .await?;
            println!(
                "{} Stored blob {} ({} bytes, {} chunks)",
                "✓".green().bold(),
                blob_id.yellow(),
                data.len(),
                chunks
            );
        }
        BlobAction::Get { blob_id, out } => {
            let store = runtime.store();
            let txn = store.begin(true).await?;
            let data = store.read_blob(&txn, blob_id).await;
            store.abort(&txn).await?;
            let data = data?;
            match out {
                Some(path) => {
                    std::fs::write(path, &data)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("{} Wrote {} bytes to {}", "✓".green(), data.len(), path.display());
                }
                None => std::io::stdout().write_all(&data)?,
            }
        }
        BlobAction::Rm { blob_id } => {
            manager
                .run(|txn| {
                    let store = manager.store().clone();
                    let blob_id = blob_id.clone();
                    async move { store.delete_blob(&txn, &blob_id).await }
                })
                .await?;
            println!("  {} {}", "removed blob:".red(), blob_id);
        }
    }
    Ok(())
}
