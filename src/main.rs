#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
pub mod backend;
pub mod cleaner;
pub mod config;
pub mod enumerator;
pub mod error;
pub mod media_routes;
pub mod reconciler;
pub mod reference;
pub mod scanner;
pub mod scheduler;
pub mod slugify;

use std::{env, sync::Arc, time::Duration};

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cleaner::Cleaner;
use config::Config;
use media_routes::MediaState;

fn init_tracing() {
    let env_filter = if cfg!(debug_assertions) {
        // Debug build
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("{}=debug,tower_http=debug", env!("CARGO_CRATE_NAME")).into()
        })
    } else {
        // Release build
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME")).into()
        })
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn fatal(what: &str, err: &dyn std::fmt::Display) -> ! {
    error!("{what}: {err}");
    sentry::capture_message(&format!("{what}: {err}"), sentry::Level::Fatal);
    // process::exit skips the guard's drop, so deliver the event first.
    flush_sentry(Duration::from_secs(2));
    std::process::exit(1);
}

/// Returns false if queued events could not be sent within `timeout`.
fn flush_sentry(timeout: Duration) -> bool {
    let Some(client) = sentry::Hub::current().client() else {
        return true;
    };
    client.flush(Some(timeout))
}

#[tokio::main]
async fn main() {
    // A .env file is optional; real deployments set the environment directly.
    let _ = dotenvy::dotenv();

    let _guard = env::var("SENTRY_DSN").ok().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                max_breadcrumbs: 50,
                send_default_pii: false,
                ..Default::default()
            },
        ))
    });

    init_tracing();

    let config = Config::from_env().unwrap_or_else(|err| fatal("Invalid configuration", &err));

    if let Err(err) = tokio::fs::create_dir_all(&config.upload_root).await {
        fatal("Error creating upload root", &err);
    }

    let scanner = backend::select_scanner(&config)
        .await
        .unwrap_or_else(|err| fatal("Error selecting backend", &err));
    info!(
        backend = scanner.backend(),
        root = %config.upload_root.display(),
        prefix = %config.prefix,
        interval_secs = config.cleaner.interval.as_secs(),
        dry_run = config.cleaner.dry_run,
        "Reclamation configured"
    );

    let shutdown = CancellationToken::new();
    let cleaner = Arc::new(Cleaner::new(scanner, &config));
    let scheduler = scheduler::spawn(cleaner, config.cleaner.interval, shutdown.clone());

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down gracefully...");
        signal_token.cancel();
    });

    let app = media_routes::app(Arc::new(MediaState::new(&config)));
    let listener = tokio::net::TcpListener::bind(config.http.addr)
        .await
        .unwrap_or_else(|err| fatal("Error binding listener", &err));
    info!("listening on {}", config.http.addr);

    let server_token = shutdown.clone();
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await
    {
        error!("Server error: {err}");
    }

    shutdown.cancel();
    if let Err(err) = scheduler.await {
        error!("Cleaner scheduler panicked: {err}");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
