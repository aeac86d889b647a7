//! Provider adapter contract.

use async_trait::async_trait;

use crate::errors::ModelError;
use crate::types::{ModelRequest, ModelResponse};

/// One model backend. Adapters perform a single attempt; retry and timeout
/// policy belongs to [`crate::Client`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;
}
