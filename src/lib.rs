//! racenet - serverless multiplayer sessions for browser games
//!
//! One peer is elected host through a shared directory, every other peer
//! opens a single data channel to it, and the host relays the full world
//! state to all clients on a fixed tick. The directory doubles as the
//! signaling relay for the offer/answer/ICE exchange, so no dedicated game
//! server is needed.
#![warn(missing_docs)]

// Core foundational modules
pub mod constants;
pub mod core;

// Collaborators behind traits
pub mod directory;
pub mod transport;

// Main functional modules
pub mod network;
pub mod session;
pub mod signaling;
pub mod system;

// Re-export commonly used items for convenience
pub use crate::core::config::LoggingConfig;
pub use crate::core::{Clock, Config, Error, PeerId, Result, Role, SessionConfig, SystemClock};
pub use directory::{DirectoryService, MemoryDirectory};
pub use network::{ConnectionStatus, LocalSender, NetworkEvent, NetworkEventKind, NetworkManager};
pub use session::Session;
pub use transport::{MemoryTransport, Transport};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Install the tracing subscriber and the metrics registry.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init(logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| Error::config(format!("Invalid log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match (&logging.file, logging.format.as_str()) {
        (Some(path), _) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
        }
        (None, "pretty") => builder.pretty().try_init(),
        (None, _) => builder.compact().try_init(),
    };
    installed.map_err(|e| Error::config(format!("Logging already initialised: {}", e)))?;

    tracing::info!("Initializing {} v{}", NAME, VERSION);

    system::metrics::init_registry();

    Ok(())
}
