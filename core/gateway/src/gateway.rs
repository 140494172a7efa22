//! Network gateway trait definition.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::request::SerializedRequest;
use crate::response::GatewayResponse;
use offsync_common::Result;

/// Performs one logical request against the backend.
///
/// Implementations own transport concerns: connection reuse, auth headers,
/// timeouts. A timeout surfaces as `Error::NetworkUnreachable`.
#[async_trait]
pub trait NetworkGateway: Send + Sync {
    /// Get the gateway name (e.g., "memory", "http").
    fn name(&self) -> &str;

    /// Send a request.
    ///
    /// # Cancellation
    /// When `cancel` fires before the backend answers, the gateway may
    /// abandon the call and return `Error::Cancelled`. A call that already
    /// reached the backend is allowed to finish.
    ///
    /// # Errors
    /// - `NetworkUnreachable` when the backend cannot be reached
    /// - `ServerRejected` / `NotFound` for error statuses
    async fn send(
        &self,
        request: &SerializedRequest,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse>;
}
