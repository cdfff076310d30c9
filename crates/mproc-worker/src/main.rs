//! mproc-worker: hosts one UDL behind the channels its host created.
//!
//! Usage: `mproc-worker [CONFIG_FILE]`. Without a file the configuration is
//! read from `MPROC_SERVER_CONFIG`.

mod udls;

use std::path::PathBuf;
use std::process::ExitCode;

use mproc::{
    CONFIG_ENV, DiagnosticSink, EXIT_STARTUP_FAILURE, ServerConfig, Stopper, UdlServer,
    WorkerTracingLayer, diagnostic_channel,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DIAGNOSTIC_QUEUE: usize = 1024;

fn init_tracing(sink: DiagnosticSink) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("MPROC_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "mproc={level},mproc_worker={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(WorkerTracingLayer::new(sink));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(WorkerTracingLayer::new(sink));
        let _ = subscriber.try_init();
    }
}

fn load_config() -> anyhow::Result<ServerConfig> {
    let mut args = std::env::args_os().skip(1);
    let config = match args.next() {
        Some(path) => {
            let path = PathBuf::from(path);
            tracing::info!(path = %path.display(), "Loading server config");
            ServerConfig::from_file(&path)?
        }
        None => {
            tracing::info!(env = CONFIG_ENV, "Loading server config from environment");
            ServerConfig::from_env()?
        }
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {}", extra.to_string_lossy());
    }
    Ok(config)
}

/// Termination signals, registered before the server starts so a signal
/// arriving during startup is not lost.
struct StopSignals {
    #[cfg(unix)]
    sigterm: Option<tokio::signal::unix::Signal>,
}

impl StopSignals {
    /// Must be called inside the runtime.
    fn install() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    None
                }
            };
            Self { sigterm }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    async fn stop_on_signal(self, stopper: Stopper) {
        #[cfg(unix)]
        {
            match self.sigterm {
                Some(mut sigterm) => tokio::select! {
                    _ = sigterm.recv() => stopper.stop("SIGTERM"),
                    _ = tokio::signal::ctrl_c() => stopper.stop("interrupt"),
                },
                None => {
                    let _ = tokio::signal::ctrl_c().await;
                    stopper.stop("interrupt");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            stopper.stop("interrupt");
        }
    }
}

fn main() -> ExitCode {
    let (sink, stream) = diagnostic_channel(DIAGNOSTIC_QUEUE);
    init_tracing(sink);

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Invalid server configuration");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build runtime");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };
    let signals = {
        let _guard = runtime.enter();
        StopSignals::install()
    };

    let registry = udls::registry();
    tracing::debug!(udls = ?registry.ids().collect::<Vec<_>>(), "Registered UDLs");
    let handle = match UdlServer::new(config, &registry)
        .map(|server| server.with_diagnostics(stream))
        .and_then(|server| server.run(false))
    {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start UDL server");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    let report = runtime.block_on(async move {
        tokio::spawn(signals.stop_on_signal(handle.stopper()));
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(error = %e, "Server join task failed");
                None
            }
        }
    });

    match report {
        Some(report) => {
            tracing::info!(
                reason = ?report.reason,
                invocations = report.stats.invocations,
                failures = report.stats.failures,
                cancelled_calls = report.cancelled_calls,
                "UDL server stopped"
            );
            ExitCode::from(report.exit_code())
        }
        None => ExitCode::FAILURE,
    }
}
