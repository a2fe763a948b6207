//! One-shot process initialisation, run at image load.

use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn boot() {
    initialise();
}

/// Idempotent; the constructor runs it at load and tests may call it
/// directly.
pub fn initialise() {
    let _ = dotenvy::dotenv();
    init_tracing();
    let engine = crate::engine();
    crate::fork::install();
    match engine.api {
        Some(_) => tracing::info!(
            "boot: interposing SQLite; backend host={} db={} schema={}",
            engine.config.backend_host,
            engine.config.backend_db,
            engine.config.schema
        ),
        None => tracing::debug!("boot: inert (no SQLite to interpose)"),
    }
}

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_default();
    let filter = match level.trim().to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "INFO" => "info",
        _ => "error",
    };
    // The host owns stdout; diagnostics belong on stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
