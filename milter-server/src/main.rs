use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use miette::{IntoDiagnostic, Result, WrapErr};
use milter::{Engine, MilterServer, SessionRegistry};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod metrics;
mod policy;
mod storage;

use config::Cfg;
use policy::DomainPolicy;
use storage::FileSystemSink;

#[derive(Parser, Debug)]
#[command(name = "shrike", about = "Milter-based mail content filter")]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = Cfg::load(&args.config)?;
    init_logging(&cfg);

    let shutdown = CancellationToken::new();

    if let Some(http_addr) = &cfg.server.http_addr {
        let addr: SocketAddr = http_addr
            .parse()
            .into_diagnostic()
            .wrap_err("invalid server.http_addr")?;
        metrics::spawn_http_server(addr, shutdown.clone());
    }

    let sink = FileSystemSink::new(cfg.storage.base_path.as_str()).await?;
    let policy = DomainPolicy::new(cfg.rules);
    let engine = Arc::new(Engine::new(
        Arc::new(SessionRegistry::new()),
        Arc::new(policy),
        Arc::new(sink),
    ));

    let mut server = MilterServer::new(engine, shutdown.clone());
    if let Some(max_frame) = cfg.server.max_frame {
        server = server.with_max_frame(max_frame);
    }

    let listener = TcpListener::bind(&cfg.server.addr)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to bind milter listener on {}", cfg.server.addr))?;
    info!(addr = %cfg.server.addr, "milter listening");

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    server.serve(listener).await
}

fn init_logging(cfg: &Cfg) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
