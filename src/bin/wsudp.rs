use anyhow::{anyhow, Result};
use clap::{
    builder::{PossibleValuesParser, TypedValueParser},
    Parser,
};
use log::{error, info};
use std::path::PathBuf;
use wsudp::{Client, Config, ConnectionPool, Mode, Server};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long, default_value = "config.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short = 'l', long, default_value_t = String::from("I"),
        value_parser = PossibleValuesParser::new(["T", "D", "I", "W", "E"]).map(|v| v.to_string()))]
    loglevel: String,

    /// Print an example configuration for the given mode and exit
    #[arg(long, value_name = "MODE",
        value_parser = PossibleValuesParser::new(["client", "server"]).map(|v| v.to_string()))]
    gen_config: Option<String>,
}

fn main() {
    let args = Args::parse();

    if let Some(mode) = &args.gen_config {
        let mode = if mode == "server" {
            Mode::Server
        } else {
            Mode::Client
        };
        match Config::example(mode).to_toml() {
            Ok(text) => print!("{text}"),
            Err(e) => {
                eprintln!("{e:#}");
                std::process::exit(1);
            }
        }
        return;
    }

    init_logger(&args.loglevel);

    if let Err(e) = run(&args) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn init_logger(loglevel: &str) {
    let level = match loglevel {
        "T" => log::LevelFilter::Trace,
        "D" => log::LevelFilter::Debug,
        "W" => log::LevelFilter::Warn,
        "E" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

fn run(args: &Args) -> Result<()> {
    let config = Config::load(&args.config)?;
    let worker_threads = num_cpus::get();
    info!("starting {} with {worker_threads} worker threads", config.mode);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(worker_threads)
        .build()?
        .block_on(async {
            match config.mode {
                Mode::Server => {
                    let server = Server::init(config.server()?, &config.tunnel).await?;
                    let pool = server.pool();
                    serve_until_interrupted(pool, server.listen_and_serve()).await
                }
                Mode::Client => {
                    let client = Client::init(config.client()?, &config.tunnel).await?;
                    let pool = client.pool();
                    serve_until_interrupted(pool, client.listen_and_serve()).await
                }
            }
        })
}

async fn serve_until_interrupted(
    pool: std::sync::Arc<ConnectionPool>,
    serve: impl std::future::Future<Output = Result<()>>,
) -> Result<()> {
    let result = tokio::select! {
        result = serve => match result {
            Ok(()) => Err(anyhow!("relay stopped unexpectedly")),
            Err(e) => Err(e),
        },
        signal = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C, shutting down");
            signal.map_err(Into::into)
        }
    };

    pool.shutdown().await;
    info!("relay exited");
    result
}
