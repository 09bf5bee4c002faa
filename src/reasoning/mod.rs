//! Interface to the external reasoning service.
//!
//! Every atomic analysis step is one awaited, single-attempt call through
//! [`ReasoningService`]. [`ReasoningClient`] is the HTTP implementation.

mod client;
mod types;


pub use client::ReasoningClient;
pub use types::*;

use async_trait::async_trait;

use crate::error::ReasoningResult;

/// A service that answers one reasoning request.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Run one request. Implementations must not retry internally.
    async fn reason(&self, request: &ReasoningRequest) -> ReasoningResult<ReasoningResponse>;
}
