//! Subcommand entry points. Results go to stdout as JSON; logs go to stderr.

use crate::{
    config::{self, AppConfig, CleanArgs, CollectionsCommand, Command, PublishArgs, ServeArgs},
    models::index::CollectionSettings,
    routes,
    services::{
        clean::{self, CleanOptions},
        collections,
        edge::EdgeService,
        keys::PublishId,
        publish::{self, PublishOptions},
        storage::{Backend, StorageProvider},
    },
};
use anyhow::{Context, Result, bail};
use axum::Router;
use chrono::Utc;
use serde::Serialize;
use std::{io::ErrorKind, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub async fn run(cfg: AppConfig, command: Command) -> Result<()> {
    let publish_id = PublishId::load_or_create(&cfg.state_dir)
        .await
        .with_context(|| format!("loading publish id from {}", cfg.state_dir.display()))?;
    let backend = cfg.connect().await?;
    info!(backend = backend.kind(), publish_id = %publish_id, "storage ready");

    match command {
        Command::PublishContent(args) => publish_content(&cfg, &backend, &publish_id, args).await,
        Command::Clean(args) => collect_garbage(&cfg, &backend, &publish_id, args).await,
        Command::Collections { action } => match action {
            CollectionsCommand::List => {
                let listed = collections::list_collections(&backend, &publish_id).await?;
                print_json(&listed)
            }
            CollectionsCommand::Delete { name, force } => {
                let report =
                    collections::delete_collection(&backend, &publish_id, &name, force, &cfg.batch)
                        .await?;
                print_json(&report.succeeded)
            }
        },
        Command::Serve(args) => serve(backend, publish_id, args).await,
    }
}

async fn publish_content(
    cfg: &AppConfig,
    backend: &Backend,
    publish_id: &PublishId,
    args: PublishArgs,
) -> Result<()> {
    let options = PublishOptions {
        collection: args.collection,
        encodings: args.compression,
        settings: CollectionSettings {
            static_prefixes: args.static_prefixes,
            spa_fallback: args.spa_fallback,
            not_found_page: args.not_found_page,
        },
        expires_in: args.expires_in.map(Duration::from_secs),
        staging_dir: cfg.staging_dir(),
        batch: cfg.batch.clone(),
    };
    let summary = publish::publish_directory(backend, publish_id, &args.root, &options).await?;
    print_json(&summary)
}

async fn collect_garbage(
    cfg: &AppConfig,
    backend: &Backend,
    publish_id: &PublishId,
    args: CleanArgs,
) -> Result<()> {
    let options = CleanOptions {
        delete_expired_collections: args.delete_expired_collections,
        dry_run: args.dry_run,
        now: Utc::now().timestamp(),
        batch: cfg.batch.clone(),
    };
    let summary = clean::clean(backend, publish_id, &options).await?;
    print_json(&summary)?;
    if !summary.failed.is_empty() {
        bail!("{} deletions failed", summary.failed.len());
    }
    Ok(())
}

async fn serve(backend: Backend, publish_id: PublishId, args: ServeArgs) -> Result<()> {
    let (host, port) = config::serve_addr(&args)?;
    let edge = EdgeService::new(
        Arc::new(backend),
        publish_id,
        args.collection,
        Duration::from_secs(args.index_ttl_secs),
    );
    if let Err(err) = edge.snapshot().await {
        warn!("collection not loadable yet, serving 503 until it is: {}", err);
    }

    let app: Router = routes::routes::routes().with_state(edge);

    let addr = format!("{host}:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{port}");
            warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr, err, fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    info!("Edge server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
