//! Tracing setup for applications embedding procwatch
//!
//! The library itself only emits `tracing` events (overflow resets, kill
//! failures, encoding switches); this helper wires up a subscriber for
//! binaries and test harnesses that want to see them.

use tracing_subscriber::{
    EnvFilter,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Initialize a global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `verbose` selects between a debug
/// filter and the quieter default. Fails if a global subscriber is already
/// installed.
pub fn init_tracing(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("procwatch=debug,procwatch_runner=debug,procwatch_text=debug,info")
            } else {
                EnvFilter::try_new("procwatch=info,procwatch_runner=info,procwatch_text=info,warn")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(verbose)
                .with_thread_ids(false)
                .with_line_number(false)
                .with_file(false)
                .compact(),
        )
        .try_init()?;

    Ok(())
}
