//! Logging related thingies

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::FabricError;

/// filter what is output on log (fmt), honouring `RUST_LOG` with an `info`
/// fallback
pub fn build_loglevel_filter_layer() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber for binaries and tests embedding the
/// fabric. Calling it twice is a [FabricError::StateMisuse].
pub fn init_subscribers() -> Result<(), FabricError> {
    tracing_subscriber::registry()
        .with(build_loglevel_filter_layer())
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| FabricError::StateMisuse(err.to_string()))
}
