use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use sluice::adder;
use sluice::codec::Lines;
use sluice::config::{EnvConfig, ServiceConfig};
use sluice::dispatch::Dispatcher;
use sluice::logger::{init_tracing, LogConfig};
use sluice::stage::func::map;
use sluice::stage::io::{ReadSource, WriteSink};
use sluice::{Chunk, Client, Pipeline, Server};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "sluice",
    about = "Backpressure-aware pipelines and pattern services",
    version
)]
struct Cli {
    /// Load environment defaults from this file
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the adder pattern service
    Serve(ServeArgs),

    /// Ask a running adder service for FIRST + SECOND
    Add(AddArgs),

    /// Copy stdin to stdout, uppercased line by line
    Upper,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct AddArgs {
    first: i64,
    second: i64,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env = EnvConfig::with_env_file(&cli.env_file);
    let mut config = ServiceConfig::load(&env)?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    let _guard = init_tracing(&LogConfig::new(
        config.log_level.clone(),
        config.log_dir.clone(),
    ))?;
    env.log_env_file();

    match cli.command {
        Commands::Serve(args) => {
            if let Some(host) = args.host {
                config.host = host;
            }
            if let Some(port) = args.port {
                config.port = port;
            }
            serve(config).await
        }
        Commands::Add(args) => {
            if let Some(host) = args.host {
                config.host = host;
            }
            if let Some(port) = args.port {
                config.port = port;
            }
            add(config, args.first, args.second).await
        }
        Commands::Upper => upper(config).await,
    }
}

async fn serve(config: ServiceConfig) -> Result<()> {
    let dispatcher = adder::register(Dispatcher::builder().reply_field(config.reply_field.clone()))
        .build();
    let server = Arc::new(Server::new(dispatcher, config.pipeline.clone()));
    let listener = Server::bind(&config.address()).await?;

    let stopper = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            stopper.shutdown();
        }
    });

    server.serve(listener).await
}

async fn add(config: ServiceConfig, first: i64, second: i64) -> Result<()> {
    let mut client = Client::connect(&config.address(), config.reply_field.clone()).await?;
    if let Some(timeout) = config.pipeline.timeout {
        client = client.with_timeout(timeout);
    }
    let response = client.act(adder::request(first, second)).await?;
    match (response.data(), response.error()) {
        (Some(data), _) => println!("{}", data["result"]),
        (_, Some(err)) => {
            error!(code = err.code, "{}", err.message);
            anyhow::bail!("{}", err.message);
        }
        _ => {}
    }
    client.close().await
}

async fn upper(config: ServiceConfig) -> Result<()> {
    let pipeline = Pipeline::from_source(
        ReadSource::with_chunk_size(tokio::io::stdin(), config.pipeline.read_chunk_size)
            .named("stdin"),
    )
    .through(Lines::new())
    .through(
        map(|chunk: Chunk| {
            let line = String::from_utf8_lossy(chunk.as_bytes().unwrap_or_default());
            Ok(Some(Chunk::from(format!("{}\n", line.to_uppercase()))))
        })
        .named("uppercase"),
    )
    .config(config.pipeline)
    .into_sink(WriteSink::new(tokio::io::stdout()).named("stdout"));
    pipeline.run().await?;
    Ok(())
}
