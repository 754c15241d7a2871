#[cfg(feature = "gateway")]
use std::path::PathBuf;
#[cfg(feature = "gateway")]
use std::sync::Arc;

#[cfg(feature = "gateway")]
use clap::Parser;

#[cfg(feature = "gateway")]
#[derive(Debug, Parser)]
#[command(name = "llm-relay")]
#[command(version, about = "OpenAI/Anthropic-compatible relay in front of many provider accounts", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted.
    config: Option<PathBuf>,
    /// Overrides `listen` from the configuration.
    #[arg(long, alias = "addr")]
    listen: Option<String>,
    /// Overrides `sqlite_path` from the configuration.
    #[arg(long)]
    sqlite: Option<PathBuf>,
    /// Overrides `pricing_file` from the configuration.
    #[arg(long)]
    pricing: Option<PathBuf>,
    #[arg(long)]
    json_logs: bool,
}

#[cfg(feature = "gateway")]
fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::Layer as _;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[cfg(feature = "gateway")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    let mut config = match &cli.config {
        Some(path) => llm_relay::RelayConfig::load(path).await?,
        None => llm_relay::RelayConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(path) = cli.sqlite {
        config.sqlite_path = Some(path);
    }
    if let Some(path) = cli.pricing {
        config.pricing_file = Some(path);
    }

    let listen = config.listen.clone();
    let sync_interval = config.sync_interval();
    let probe_interval = config.probe_interval();

    let relay = Arc::new(llm_relay::Relay::from_config(config).await?);
    let _sync_task = sync_interval.map(|interval| relay.registry().spawn_sync_task(interval));
    let _probe_task = probe_interval.map(|interval| relay.spawn_probe_task(interval));

    let state = llm_relay::relay::RelayHttpState::new(Arc::clone(&relay));
    let app = llm_relay::relay::router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "llm-relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(not(feature = "gateway"))]
fn main() {
    eprintln!("gateway feature disabled; rebuild with --features gateway");
}
