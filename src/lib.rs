pub mod agent;
pub mod config;
pub mod error;
pub mod features;
pub mod harvest;
pub mod kernel;

// Re-export specific items for convenient access
pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{AgentError, HandlerError};
pub use kernel::reactor::Reactor;
