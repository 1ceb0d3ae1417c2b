//! mirrorsync: edit and sync remote resource sets against a local mirror
//!
//! The remote side is a directory-backed store; every command takes the same
//! locks as any other process pointed at the same lock directory.

use clap::Parser;
use mirrorsync::cli::{Args, Command};
use mirrorsync::{
    ContentHash, CoreConfig, CoreError, DirStore, EditOperation, EditRequest, LocalMirror,
    MirrorSync, SyncDirection,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &args.config {
        Some(path) => match CoreConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("[mirrorsync] Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => CoreConfig::default(),
    };

    if let Err(e) = run(args, config).await {
        match serde_json::to_string_pretty(&e.details()) {
            Ok(json) => eprintln!("{}", json),
            Err(_) => eprintln!("{}", e),
        }
        std::process::exit(1);
    }
}

async fn run(args: Args, config: CoreConfig) -> Result<(), CoreError> {
    if let Command::Hash { path } = &args.cmd {
        let bytes = std::fs::read(path)
            .map_err(|e| CoreError::invalid(format!("{}: {}", path.display(), e)))?;
        println!("{}  {}", ContentHash::of_bytes(&bytes), path.display());
        return Ok(());
    }

    let store = Arc::new(DirStore::new(&args.remote));
    let service = MirrorSync::new(config, store.clone(), LocalMirror::new(&args.mirror));

    match args.cmd {
        Command::Hash { .. } => {}
        Command::Read { set, file } => {
            let file = service.read_file(&set, &file).await?;
            tracing::info!("[mirrorsync] {} {}", file.name, file.hash);
            print!("{}", file.content);
        }
        Command::Edit {
            set,
            file,
            search,
            replace,
            threshold,
            occurrence,
            expect,
            force,
        } => {
            let mut edit = EditOperation::new(search, replace);
            edit.similarity_threshold = threshold;
            edit.occurrence_index = occurrence;
            let outcome = service
                .perform_edit(EditRequest {
                    resource_set_id: set,
                    file_name: file,
                    edits: vec![edit],
                    expected_hash: expect,
                    force,
                })
                .await?;
            print_json(&outcome);
        }
        Command::Sync {
            set,
            direction,
            yes,
        } => {
            let direction = SyncDirection::from(direction);
            if direction == SyncDirection::Push {
                store.create_set(&set).await?;
            }
            let plan = service.plan_sync(direction, &set).await?;
            print_json(&plan);
            if plan.operations.is_empty() {
                tracing::info!("[mirrorsync] '{}' is already in sync", set);
                return Ok(());
            }
            if plan.requires_token() && !yes {
                tracing::warn!(
                    "[mirrorsync] plan {} deletes {} file(s); rerun with --yes to apply",
                    plan.plan_id,
                    plan.operations.delete.len()
                );
                return Ok(());
            }
            let result = service
                .execute_sync(&plan.plan_id, plan.deletion_token.as_deref())
                .await?;
            print_json(&result);
        }
        Command::LockStatus { set } => match service.lock_holder(&set)? {
            Some(holder) => print_json(&holder),
            None => println!("'{}' is not locked", set),
        },
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!("[mirrorsync] Failed to serialize output: {}", e),
    }
}
