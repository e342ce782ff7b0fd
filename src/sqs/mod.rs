pub mod config;
pub mod error;
pub mod message;
pub mod queue;
pub mod receipt;
pub mod server;
pub mod state;
pub mod sweeper;
pub mod types;

pub use config::EngineConfig;
pub use error::SqsError;
pub use queue::{NewMessage, ReceivedMessage, SendOutcome};
pub use state::{BatchEntry, BatchOutcome, ReceiveOptions, SqsState};
pub use sweeper::{Sweeper, SweeperHandle};
