use std::{
    backtrace::{Backtrace, BacktraceStatus},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use clap::Parser;
use notary::{
    cfg::Config,
    client,
    crypto::SecretKey,
    node::{Notary, ServiceState},
    shard::{CandidateResolver, MemoryHeaderStore},
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use tokio::signal::{self, unix::SignalKind};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(value_parser = SecretKey::from_hex)]
    secret_key: SecretKey,
    #[clap(long, short, default_values = ["config.toml"])]
    config_file: Vec<PathBuf>,
    #[clap(long, default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_line_number(true)
        .with_ansi(false);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    // Set a panic hook that records the panic as a `tracing` event at the `ERROR` verbosity level.
    std::panic::set_hook(Box::new(|panic| {
        let message = match panic.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed>");

        let backtrace = Backtrace::capture();
        let backtrace =
            (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());

        match (panic.location(), backtrace) {
            (None, None) => {
                tracing::error!(thread_name, message);
            }
            (None, Some(backtrace)) => {
                tracing::error!(thread_name, message, %backtrace);
            }
            (Some(location), None) => {
                tracing::error!(
                    thread_name,
                    message,
                    panic.file = location.file(),
                    panic.line = location.line(),
                    panic.column = location.column(),
                );
            }
            (Some(location), Some(backtrace)) => {
                tracing::error!(
                    thread_name,
                    message,
                    panic.file = location.file(),
                    panic.line = location.line(),
                    panic.column = location.column(),
                    %backtrace,
                );
            }
        }
    }));

    let config = Config::load(&args.config_file)?;

    let meter_provider = match &config.otlp_collector_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;
            let reader = PeriodicReader::builder(exporter)
                .with_interval(Duration::from_secs(10))
                .build();
            let provider = SdkMeterProvider::builder().with_reader(reader).build();
            opentelemetry::global::set_meter_provider(provider.clone());
            Some(provider)
        }
        None => None,
    };

    let smc = Arc::new(client::connect(&config, &args.secret_key).await?);
    let candidates = Arc::new(CandidateResolver::new(
        Arc::new(MemoryHeaderStore::new()),
        smc.clone(),
    ));
    let mut notary = Notary::new(config, args.secret_key.address(), smc, candidates)?;
    notary.start()?;

    let mut terminate = signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = terminate.recv() => {},
        _ = signal::ctrl_c() => {},
        () = notary.wait_for_state(ServiceState::Stopped) => {},
    }

    let result = notary.stop().await;
    if let Some(provider) = meter_provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(%e, "failed to flush metrics");
        }
    }
    result
}
