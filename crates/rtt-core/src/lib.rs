pub mod config;
pub mod echo;
pub mod error;
pub mod http;
pub mod mqtt;
pub mod probe;
pub mod report;
pub mod stats;
pub mod tracker;
pub mod transport;

pub use config::*;
pub use echo::*;
pub use error::{ConfigError, DecodeError, RttError, TrackerError, TransportError};
pub use http::*;
pub use mqtt::*;
pub use probe::*;
pub use report::*;
pub use stats::*;
pub use tracker::*;
pub use transport::*;
