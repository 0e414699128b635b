use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use bifrost_indexing::WriteOutcome;
use clap::{Parser, Subcommand};
use poem::listener::TcpListener;
use poem::middleware::{CookieJarManager, Cors};
use poem::EndpointExt;
use tokio::select;
use tracing::{error, info};
use uuid::Uuid;

use bifrost_server::api;
use bifrost_server::config::{make_config_loader, BifrostServerConfig};
use bifrost_server::grpcapi;
use bifrost_server::services::Services;

#[derive(Parser)]
#[command(name = "bifrost-server", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP + gRPC server (default if no subcommand is given).
    Serve,
    /// Write a single artifact through the write pipeline and exit, per
    /// §6's CLI exit code contract: 0 success, 1 pending deactivation, 2
    /// error.
    Write {
        path: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "cli")]
        updated_by: String,
        #[arg(long)]
        content_type: Option<String>,
        #[arg(long)]
        force_deactivation: bool,
        /// `<removed-entity-uuid>=<new_function_symbol>`, repeatable.
        #[arg(long = "replacement", value_parser = parse_replacement)]
        replacements: Vec<(Uuid, String)>,
    },
    /// Run a single reconciliation sweep and exit.
    Reindex,
}

fn parse_replacement(raw: &str) -> Result<(Uuid, String), String> {
    let (id, symbol) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected <uuid>=<symbol>, got `{raw}`"))?;
    let id = Uuid::parse_str(id).map_err(|e| e.to_string())?;
    Ok((id, symbol.to_string()))
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let config = match make_config_loader().load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };
    bifrost_common::tracing_setup::init_tracing(&config.tracing.clone().with_env_overrides());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start tokio runtime: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => match runtime.block_on(serve(&config)) {
            Ok(()) => std::process::ExitCode::SUCCESS,
            Err(err) => {
                error!(error = %err, "server exited with an error");
                std::process::ExitCode::FAILURE
            }
        },
        Command::Write { path, file, updated_by, content_type, force_deactivation, replacements } => {
            runtime.block_on(cli_write(&config, &path, &file, &updated_by, content_type, force_deactivation, replacements))
        }
        Command::Reindex => runtime.block_on(cli_reindex(&config)),
    }
}

async fn serve(config: &BifrostServerConfig) -> anyhow::Result<()> {
    let http_port = config.http_port;
    let grpc_port = config.grpc_port;
    info!(http_port, grpc_port, "starting bifrost-server");

    let services = Arc::new(Services::new(config).await?);
    services.pool.start().await;

    let http_services = services.clone();
    let grpc_services = services.clone();
    let cors_origin_regex = config.cors_origin_regex.clone();

    let http_server = tokio::spawn(async move {
        let cors = Cors::new().allow_origin_regex(&cors_origin_regex).allow_credentials(true);
        let app = api::combined_routes(&http_services).with(CookieJarManager::new()).with(cors);
        poem::Server::new(TcpListener::bind(format!("0.0.0.0:{http_port}")))
            .run(app)
            .await
    });

    let grpc_server = tokio::spawn(async move {
        grpcapi::start_grpc_server(
            SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), grpc_port).into(),
            grpc_services,
        )
        .await
    });

    select! {
        res = http_server => { res??; }
        res = grpc_server => { res??; }
    }

    services.pool.stop().await;
    Ok(())
}

async fn cli_write(
    config: &BifrostServerConfig,
    path: &str,
    file: &PathBuf,
    updated_by: &str,
    content_type: Option<String>,
    force_deactivation: bool,
    replacements: Vec<(Uuid, String)>,
) -> std::process::ExitCode {
    let content = match std::fs::read(file) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("failed to read {}: {err}", file.display());
            return std::process::ExitCode::from(2);
        }
    };

    let services = match Services::new(config).await {
        Ok(services) => services,
        Err(err) => {
            eprintln!("failed to initialize services: {err}");
            return std::process::ExitCode::from(2);
        }
    };

    let replacements: HashMap<Uuid, String> = replacements.into_iter().collect();
    let outcome = services
        .write_pipeline
        .write(path, content, content_type, updated_by, force_deactivation, &replacements)
        .await;

    match outcome {
        Ok(WriteOutcome::Ok { path, content_hash, entities_upserted, diagnostics, content_modified }) => {
            println!("wrote {path} ({content_hash}), {} entities upserted, content_modified={content_modified}", entities_upserted.len());
            for diagnostic in diagnostics {
                println!("diagnostic: {diagnostic}");
            }
            std::process::ExitCode::SUCCESS
        }
        Ok(WriteOutcome::PendingDeactivation { pending, replacements }) => {
            println!("write blocked: {} entity(ies) would be deactivated", pending.len());
            for entry in pending {
                println!("  - {} ({})", entry.removed.function_symbol, entry.removed.id);
            }
            for candidate in replacements {
                println!("  candidate replacement: {} (score {:.2})", candidate.function_symbol, candidate.similarity_score);
            }
            std::process::ExitCode::from(1)
        }
        Ok(WriteOutcome::Invalid { reason }) => {
            eprintln!("invalid write: {reason}");
            std::process::ExitCode::from(2)
        }
        Err(err) => {
            eprintln!("write failed: {err}");
            std::process::ExitCode::from(2)
        }
    }
}

async fn cli_reindex(config: &BifrostServerConfig) -> std::process::ExitCode {
    let services = match Services::new(config).await {
        Ok(services) => services,
        Err(err) => {
            eprintln!("failed to initialize services: {err}");
            return std::process::ExitCode::from(2);
        }
    };

    match services.reindexer.sweep().await {
        Ok(result) => {
            println!(
                "indexed {}, removed {}, deactivated {}, corrected {}, {} error(s)",
                result.counts.files_indexed,
                result.counts.files_removed,
                result.counts.workflows_deactivated,
                result.counts.ids_corrected,
                result.errors.len(),
            );
            for err in result.errors {
                println!("  reindex error: {} ({}): {}", err.path, err.field, err.message);
            }
            std::process::ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("reindex failed: {err}");
            std::process::ExitCode::from(2)
        }
    }
}
