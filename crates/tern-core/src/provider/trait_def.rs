//! The `Provider` trait -- the single capability every AI backend exposes.
//!
//! The trait is object-safe so providers can be stored as `Arc<dyn Provider>`
//! in the [`super::ProviderRegistry`] and moved into job workers.

use async_trait::async_trait;

use super::types::{InvocationRequest, ProviderOutput};
use crate::config::ProviderKind;
use crate::error::TransportError;

#[async_trait]
pub trait Provider: Send + Sync {
    /// Configured id (e.g. "claude").
    fn id(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Run the prompt to completion.
    ///
    /// Implementations must return promptly with
    /// [`TransportError::Cancelled`] once `request.cancel` fires, and must
    /// not leave a child process running when they do.
    async fn invoke(&self, request: InvocationRequest) -> Result<ProviderOutput, TransportError>;
}

// Compile-time assertion: Provider must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Provider) {}
};
