// Proxy service entry point.
use std::process::ExitCode;
use std::sync::Arc;

use egret_proxy::{ProxyConfig, ProxyService, observability};

fn main() -> ExitCode {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let config = match ProxyConfig::from_env_or_yaml() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("egret-proxy: invalid configuration: {err:#}");
            return ExitCode::from(1);
        }
    };

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("egret-proxy-io");
    if config.num_io_threads > 0 {
        builder.worker_threads(config.num_io_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("egret-proxy: failed to start runtime: {err}");
            return ExitCode::from(1);
        }
    };
    runtime.block_on(run(config))
}

async fn run(config: ProxyConfig) -> ExitCode {
    let metrics_handle = observability::init_observability("egret-proxy", &config.cluster_name);
    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let service = match ProxyService::new(config) {
        Ok(service) => Arc::new(service),
        Err(err) => {
            tracing::error!(error = %err, "failed to initialise proxy service");
            return ExitCode::from(1);
        }
    };
    if let Err(err) = service.start().await {
        tracing::error!(error = %err, "proxy startup failed");
        return ExitCode::from(err.exit_code());
    }

    // Serve until SIGINT, then drain gracefully.
    let _ = tokio::signal::ctrl_c().await;
    service.shutdown().await;
    ExitCode::SUCCESS
}
