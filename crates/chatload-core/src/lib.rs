pub mod config;
pub mod connection;
pub mod error;
pub mod generator;
pub mod message;
pub mod metrics;
pub mod mock;
pub mod orchestrator;
pub mod report;
pub mod sender;

pub use config::*;
pub use connection::{BoxFuture, Connection, ConnectionManager, Connector, WsConnector};
pub use error::{ConnectionError, RunError};
pub use generator::MessageGenerator;
pub use message::*;
pub use metrics::*;
pub use mock::{MockBehavior, MockConnector};
pub use orchestrator::{LoadTest, RunSummary};
pub use sender::*;
