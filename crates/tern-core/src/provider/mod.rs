//! Provider adapters and provider health.
//!
//! # Architecture
//!
//! ```text
//! HarnessRunner
//!     |
//!     +--select_provider()--> ProviderManager   (priority, health, circuit)
//!     |
//!     v
//! ProviderRegistry --get("claude")--> Arc<dyn Provider>
//!                                          |
//!                     invoke(InvocationRequest) -> ProviderOutput
//! ```

pub mod command;
pub mod manager;
pub mod registry;
pub mod trait_def;
pub mod types;

pub use command::CommandProvider;
pub use manager::{ProviderHealth, ProviderManager, ProviderOutcome};
pub use registry::ProviderRegistry;
pub use trait_def::Provider;
pub use types::{InvocationRequest, ProviderOutput};
