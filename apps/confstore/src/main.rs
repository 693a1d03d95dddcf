//! # confstore
//!
//! Administrative command line for the configuration store.
//!
//! ## Usage
//!
//! ```bash
//! # Show schemas declared in a schema file
//! confstore -S schemas.toml schemas
//!
//! # Provision and inspect beans
//! confstore -S schemas.toml create Server web-1 --set host=web1.internal --set port=8080
//! confstore -S schemas.toml merge Server web-1 --set port=8443
//! confstore -S schemas.toml query Server -w 'port>8000' -w 'host~internal'
//! confstore -S schemas.toml get Limits --eager --json-mode
//! ```

use clap::Parser;
use confstore::cli;
use confstore::config::{AppConfig, LogFormat};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    let cli = cli::Cli::parse();

    let file = match AppConfig::discover(cli.config.as_deref()) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };
    let settings = cli.settings(file);

    init_tracing(settings.log_format, cli.verbose);

    if let Err(e) = cli::execute(cli, &settings) {
        tracing::error!("Error: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Install the subscriber. `CONFSTORE_LOG_FORMAT=json` overrides the
/// settings file; `CONFSTORE_LOG`, then `RUST_LOG`, select the filter.
fn init_tracing(configured: LogFormat, verbose: bool) {
    let format = match std::env::var("CONFSTORE_LOG_FORMAT").ok().as_deref() {
        Some("json") => LogFormat::Json,
        Some("text") => LogFormat::Text,
        _ => configured,
    };
    let fallback = if verbose {
        "confstore=debug,confstore_core=debug"
    } else {
        "confstore=warn,confstore_core=warn"
    };
    let filter = EnvFilter::try_from_env("CONFSTORE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| fallback.into());

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}
