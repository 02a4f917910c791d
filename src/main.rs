use anyhow::Context;
use bandtrader::api::{SchwabClient, SchwabCredentials};
use bandtrader::audit::{AuditSink, FileAuditSink, NullAuditSink};
use bandtrader::broker::{BrokerGateway, PaperBroker, RetryPolicy};
use bandtrader::config::{BrokerMode, Settings};
use bandtrader::execution::{
    run_evaluation_loop, run_ingestion, run_tick_writer, OrderLifecycleManager, OrderPoller,
    OrderRegistry, QuoteSource, SchwabQuoteSource, SyntheticQuoteSource, TickBuffer,
    TradingEngine,
};
use bandtrader::indicators::BandIndicator;
use bandtrader::report::StatusReporter;
use bandtrader::strategy::SignalDetector;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

const SYNTHETIC_START_PRICE: f64 = 10.0;
const SYNTHETIC_STEP: f64 = 0.002;

#[derive(Parser, Debug)]
#[command(name = "bandtrader", about = "EMA band breakout trader with trailing-stop brackets")]
struct Cli {
    /// Settings file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Trade against the in-memory paper broker
    #[arg(long)]
    paper: bool,

    /// Instrument to trade
    #[arg(long)]
    ticker: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if cli.paper {
        settings.broker.mode = BrokerMode::Paper;
    }
    if let Some(ticker) = cli.ticker {
        settings.instrument.ticker = ticker;
    }
    settings.validate()?;

    let ticker = settings.instrument.ticker.clone();
    tracing::info!("🚀 BandTrader starting");
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Ticker: {}", ticker);
    tracing::info!("  Broker: {:?}", settings.broker.mode);
    tracing::info!(
        "  Quantity: {} | trailing stop {} {:?}/{:?}",
        settings.order.quantity,
        settings.order.stop_offset,
        settings.order.stop_link_type,
        settings.order.stop_link_basis
    );
    tracing::info!("  Window: {}s", settings.indicator.window_seconds);

    let buffer = TickBuffer::new(settings.indicator.window_seconds);
    let indicator = BandIndicator::new(settings.indicator.band_multiplier);
    let registry = OrderRegistry::new();
    let retry = RetryPolicy::from_config(&settings.retry);
    tracing::info!(
        "  Retry: {} attempts per gateway call | band k = {}",
        retry.max_attempts(),
        indicator.multiplier()
    );

    let gateway: Arc<dyn BrokerGateway>;
    let source: Box<dyn QuoteSource>;
    match settings.broker.mode {
        BrokerMode::Paper => {
            let seed = rand::random::<u64>();
            tracing::info!("🧪 Paper trading on a synthetic feed (seed {})", seed);
            gateway = Arc::new(PaperBroker::new(buffer.clone()));
            source = Box::new(SyntheticQuoteSource::new(
                &ticker,
                SYNTHETIC_START_PRICE,
                SYNTHETIC_STEP,
                seed,
            ));
        }
        BrokerMode::Schwab => {
            let credentials = SchwabCredentials::from_env()?;
            let client = Arc::new(
                SchwabClient::connect(&settings.broker, credentials)
                    .await
                    .context("failed to connect to Schwab")?,
            );
            gateway = client.clone();
            source = Box::new(SchwabQuoteSource::new(client, &ticker, retry.clone()));
        }
    }

    let audit: Arc<dyn AuditSink> = if settings.audit.enabled {
        Arc::new(FileAuditSink::spawn(&settings.audit.directory))
    } else {
        Arc::new(NullAuditSink)
    };

    let manager = OrderLifecycleManager::new(
        &ticker,
        settings.order.clone(),
        gateway.clone(),
        registry.clone(),
        retry.clone(),
        audit,
    );
    let reporter = StatusReporter::new(
        &ticker,
        buffer.clone(),
        indicator,
        registry.clone(),
        manager.subscribe(),
    );
    let engine = TradingEngine::new(SignalDetector::new(), manager);

    let loops = &settings.loops;
    let (tick_tx, tick_rx) = mpsc::channel(loops.channel_capacity);
    let (event_tx, event_rx) = mpsc::channel(loops.channel_capacity);

    tracing::info!("\n🔄 Spawning loops...");

    let ingestion_task = tokio::spawn(run_ingestion(source, tick_tx, loops.feed_interval()));
    let writer_task = tokio::spawn(run_tick_writer(tick_rx, buffer.clone()));
    let evaluation_task = tokio::spawn(run_evaluation_loop(
        buffer,
        indicator,
        event_tx.clone(),
        loops.evaluation_interval(),
    ));
    let poller = OrderPoller::new(registry, gateway, retry, event_tx, loops.poll_interval());
    let poller_task = tokio::spawn(poller.run());
    let reporter_task = tokio::spawn(reporter.run(loops.report_interval()));
    let mut engine_task = tokio::spawn(engine.run(event_rx));

    tracing::info!("✅ All loops spawned");
    tracing::info!("  📥 Feed: every {:?}", loops.feed_interval());
    tracing::info!("  🎯 Evaluation: every {:?}", loops.evaluation_interval());
    tracing::info!("  🔍 Order poll: every {:?}", loops.poll_interval());
    tracing::info!("\nPress Ctrl+C to stop...\n");

    // Wait for Ctrl+C or task failure
    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = &mut engine_task => match result {
            Ok(Ok(())) => {
                tracing::error!("Engine exited");
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("engine stopped")),
            Err(e) => Err(anyhow::Error::new(e).context("engine task panicked")),
        },
        result = ingestion_task => {
            tracing::error!("Ingestion loop exited: {:?}", result);
            Ok(())
        }
        result = writer_task => {
            tracing::error!("Tick writer exited: {:?}", result);
            Ok(())
        }
        result = evaluation_task => {
            tracing::error!("Evaluation loop exited: {:?}", result);
            Ok(())
        }
        result = poller_task => {
            tracing::error!("Order poller exited: {:?}", result);
            Ok(())
        }
        result = reporter_task => {
            tracing::error!("Status reporter exited: {:?}", result);
            Ok(())
        }
    };

    tracing::info!("👋 BandTrader stopped");
    outcome
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bandtrader=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
