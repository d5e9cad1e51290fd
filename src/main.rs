use std::process;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use llmesh::cli::{apply_overrides, format_node_plan, Args};
use llmesh::config::{default_config_path, load_config_file, Config};
use llmesh::node::{Node, NodeParams};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = if config_path.exists() {
        load_config_file(&config_path)?
    } else {
        Config::default()
    };
    let config = apply_overrides(config, &args);

    if args.dry_run {
        println!("{}", format_node_plan(&config));
        return Ok(());
    }

    let node_id = config.node.name.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let params = NodeParams {
        id: node_id,
        name: config.node.name.clone().unwrap_or_else(|| "node".to_string()),
        role: config.node.role,
        address: config.node.address.clone(),
        port: config.node.port,
        tags: config.node.tags.clone(),
        metadata: config.node.metadata.clone(),
        master_address: config.node.master_address.clone(),
        scan_roots: config.model_paths.clone(),
        catalog_path: default_config_path().with_file_name("catalog.json"),
        port_range: (config.port_range.base, config.port_range.max),
        heartbeat: (&config.heartbeat).into(),
        scheduler: config.scheduler.to_settings(),
        executor: (&config.executor).into(),
        supports_inference: !config.inference_binaries.is_empty(),
        load_defaults: config.resolve_load_defaults(),
    };

    let node = Node::new(params);

    info!(node_id = %node.shared.id, role = ?node.shared.role, "starting node");
    node.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    node.stop().await;

    Ok(())
}
