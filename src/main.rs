use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ratewindow::config::RateWindowConfig;
use ratewindow::ratelimit::{Admission, LimitKey, MemoryCounterStore, RateLimiter};

/// Replay a burst of requests against a sliding window rate limiter.
#[derive(Parser, Debug)]
#[command(name = "ratewindow", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Caller identity the requests are attributed to
    #[arg(long, default_value = "127.0.0.1")]
    caller: String,

    /// Resource the requests target
    #[arg(long, default_value = "/")]
    resource: String,

    /// Method the requests use
    #[arg(long, default_value = "GET")]
    method: String,

    /// Limit key to use as-is instead of composing caller, resource and method
    #[arg(short, long)]
    key: Option<String>,

    /// Number of requests to replay
    #[arg(short = 'n', long, default_value_t = 10)]
    requests: u32,

    /// Print each limit status as JSON
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(args.log_json.then(|| fmt::layer().json()))
        .with((!args.log_json).then(|| fmt::layer().with_target(false).with_thread_ids(true)))
        .init();
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => RateWindowConfig::from_file(path)?,
        None => RateWindowConfig::default(),
    };
    info!(
        requests_limit = config.limiter.requests_limit,
        window_size = ?config.window_size(),
        "Configuration loaded"
    );

    let store = Arc::new(MemoryCounterStore::new(
        config.expiration_time(),
        config.flush_interval(),
    )?);
    let limiter = RateLimiter::new(
        Arc::clone(&store),
        config.limiter.requests_limit,
        config.window_size(),
    )?
    .with_failure_policy(config.limiter.failure_policy);

    let key = args.key.clone().unwrap_or_else(|| request_key(&args));

    tokio::select! {
        result = replay(&limiter, &key, args.requests, args.json) => result?,
        _ = shutdown_signal() => {}
    }

    store.shutdown().await;
    info!("Rate limiter stopped");
    Ok(())
}

/// Compose the limit key the way a request middleware would.
fn request_key(args: &Args) -> String {
    LimitKey::new()
        .with_part(args.caller.as_str())
        .with_part(args.resource.as_str())
        .with_part(args.method.as_str())
        .to_string_key()
}

/// Admit `key` `requests` times, waiting out every limit.
async fn replay(
    limiter: &RateLimiter<MemoryCounterStore>,
    key: &str,
    requests: u32,
    json: bool,
) -> anyhow::Result<()> {
    let mut served = 0;
    while served < requests {
        let admission = limiter.admit(key).await;

        if json {
            if let Some(status) = admission.status() {
                println!("{}", serde_json::to_string(status)?);
            }
        }

        match admission {
            Admission::Allowed(status) => {
                served += 1;
                info!(key = %key, rate = status.current_rate, served, "Request served");
            }
            Admission::Limited(status) => {
                let wait = status.limit_duration.unwrap_or_default();
                info!(
                    key = %key,
                    rate = status.current_rate,
                    limit = limiter.requests_limit(),
                    wait = ?wait,
                    "Too high rate, backing off"
                );
                tokio::time::sleep(wait).await;
            }
            Admission::StoreFailure { allowed } => {
                warn!(key = %key, allowed, "Counter store unavailable");
                if allowed {
                    served += 1;
                } else {
                    anyhow::bail!("counter store unavailable for key {}", key);
                }
            }
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_key_includes_method() {
        let args = Args::parse_from([
            "ratewindow",
            "--caller",
            "10.0.0.1",
            "--resource",
            "/orders",
        ]);
        assert_eq!(request_key(&args), "10.0.0.1_/orders_GET");
    }

    #[test]
    fn test_key_flag_overrides_composition() {
        let args = Args::parse_from(["ratewindow", "--key", "tenant-42", "--method", "POST"]);
        assert_eq!(args.key.as_deref(), Some("tenant-42"));
        assert_eq!(request_key(&args), "127.0.0.1_/_POST");
    }
}
