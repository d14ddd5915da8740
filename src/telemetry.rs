//! Tracing setup for embedders that have no subscriber of their own.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber.
///
/// The filter comes from `RUST_LOG` when set; otherwise `debug` for this
/// crate in verbose mode and `info` elsewhere. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(verbose: bool) -> Result<()> {
    let default_filter = if verbose { "maestro=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("a global tracing subscriber is already set")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_reports_conflict() {
        // Whichever call wins the race installs the subscriber; the second
        // must fail instead of panicking.
        let first = init_tracing(false);
        let second = init_tracing(true);
        assert!(first.is_ok() || second.is_ok());
        assert!(first.is_err() || second.is_err());
    }
}
