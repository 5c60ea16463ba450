//! Runtime half of the SNTP implementation: the blocking client exchange,
//! the retrying client synchronizer, the server loop, and the glue to the
//! operating system (clock, configuration, logging).

mod daemon;

pub use daemon::clock::{ClockError, UnixClock};
pub use daemon::config::{
    ClientConfig, Config, ConfigError, ObservabilityConfig, ServerConfig,
};
pub use daemon::exchange::{ClientExchange, ExchangeError};
pub use daemon::server::Server;
pub use daemon::sync::ClientSynchronizer;
pub use daemon::tracing::{tracing_init, LogLevel};
