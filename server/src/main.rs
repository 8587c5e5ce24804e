//! probemgr binary — thin CLI shell over the [`probemgr_server`] library crate.

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{error, info};

use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use probemgr_server::api;
use probemgr_server::import;
use probemgr_server::library::ProbeLibrary;
use probemgr_server::parser;
use probemgr_server::scanner::ScanOrchestrator;
use probemgr_server::settings::Settings;
use probemgr_server::types::AppContext;

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Probe template manager and HTTP vulnerability scan engine.
#[derive(Parser)]
#[command(name = "probemgr", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Probe library root (default: templates_dir from settings)
    #[arg(long)]
    templates: Option<PathBuf>,

    /// Listen port (default: auto-scan a small range)
    #[arg(long)]
    port: Option<u16>,

    /// Bind to 0.0.0.0 instead of 127.0.0.1 (localhost)
    #[arg(long)]
    bind_all: bool,

    /// Disable live re-indexing of external library edits
    #[arg(long)]
    no_watch: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a probe file and report ok or the diagnostic
    Validate {
        /// Probe file to check
        file: PathBuf,
    },
    /// Import every probe under a folder into the library
    Import {
        /// Folder to walk for .yaml/.yml probes
        dir: PathBuf,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("probemgr=info".parse().unwrap())
                .add_directive("probemgr_server=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle subcommands
    if let Some(command) = &cli.command {
        match command {
            Commands::Validate { file } => {
                std::process::exit(run_validate(file));
            }
            Commands::Import { dir } => {
                std::process::exit(run_import(dir, cli.templates.as_deref()));
            }
            Commands::Completions { shell } => {
                clap_complete::generate(
                    *shell,
                    &mut Cli::command(),
                    "probemgr",
                    &mut std::io::stdout(),
                );
                return;
            }
        }
    }

    // ---------------------------------------------------------------------------
    // Serve mode
    // ---------------------------------------------------------------------------

    let mut loaded_settings = Settings::load();
    if let Some(dir) = &cli.templates {
        loaded_settings.templates_dir = dir.clone();
    }
    let templates_dir = loaded_settings.templates_dir.clone();
    let settings = Arc::new(RwLock::new(loaded_settings));

    // Library becomes usable immediately; the index fills in the background.
    let library = ProbeLibrary::open(templates_dir.clone());
    info!(templates = %templates_dir.display(), "Probe library opening");

    let scanner = match ScanOrchestrator::new(Arc::clone(&library), Arc::clone(&settings)) {
        Ok(orchestrator) => Arc::new(orchestrator),
        Err(e) => {
            error!(error = %e, "Could not construct scan orchestrator");
            std::process::exit(1);
        }
    };

    // Keep external edits to the templates tree indexed. The watcher thread
    // follows templates-dir switches made through the API.
    if !cli.no_watch {
        probemgr_server::watch::start_watcher(Arc::clone(&library));
    }

    let ctx = AppContext {
        library,
        scanner: Arc::clone(&scanner),
        settings,
    };

    let app = api::router(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    // Bind address: 127.0.0.1 by default, --bind-all for 0.0.0.0
    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };

    let listener = if let Some(port) = cli.port {
        tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await.unwrap_or_else(|e| {
            error!(port = port, error = %e, "Could not bind to port");
            std::process::exit(1);
        })
    } else {
        // Auto-scan: try 8632..=8641
        const BASE: u16 = 8632;
        const RANGE: u16 = 10;
        let mut found = None;
        for port in BASE..BASE + RANGE {
            match tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await {
                Ok(l) => {
                    found = Some(l);
                    break;
                }
                Err(_) => continue,
            }
        }
        found.unwrap_or_else(|| {
            error!(range_start = BASE, range_end = BASE + RANGE - 1, "No free port found");
            eprintln!("  Try: probemgr --port <port>");
            std::process::exit(1);
        })
    };

    let port = listener.local_addr().unwrap().port();
    info!(port = port, "http://localhost:{port}");
    // Machine-readable line for scripts (not through tracing)
    eprintln!("PROBEMGR_PORT={port}");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.unwrap();

    // Process shutdown cancels every running job.
    scanner.shutdown();
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

fn run_validate(file: &std::path::Path) -> i32 {
    let text = match std::fs::read_to_string(file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("error: cannot read {}: {e}", file.display());
            return 1;
        }
    };
    match parser::parse(&text) {
        Ok(probe) => {
            println!("ok: {} ({} request specs)", probe.id, probe.requests.len());
            0
        }
        Err(e) => {
            eprintln!("invalid: {e}");
            1
        }
    }
}

fn run_import(dir: &std::path::Path, templates_override: Option<&std::path::Path>) -> i32 {
    let mut settings = Settings::load();
    if let Some(t) = templates_override {
        settings.templates_dir = t.to_path_buf();
    }
    let library = ProbeLibrary::open_blocking(settings.templates_dir.clone());
    match import::import_folder(&library, dir) {
        Ok(report) => {
            println!("imported {} probe(s), {} failed", report.success, report.failed);
            for err in &report.errors {
                eprintln!("  {err}");
            }
            if report.failed > 0 {
                2
            } else {
                0
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}
