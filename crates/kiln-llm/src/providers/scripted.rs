use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::ModelError;
use crate::provider::ProviderAdapter;
use crate::types::{ModelRequest, ModelResponse};

/// Replays a fixed list of responses, wrapping around at the end.
pub struct ScriptedAdapter {
    responses: Vec<String>,
    state: Mutex<ScriptState>,
}

#[derive(Default)]
struct ScriptState {
    cursor: usize,
    requests: Vec<ModelRequest>,
}

impl ScriptedAdapter {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: responses.into_iter().map(Into::into).collect(),
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.state
            .lock()
            .map(|state| state.requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        if self.responses.is_empty() {
            return Err(ModelError::Configuration(
                "scripted provider has no responses".to_string(),
            ));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| ModelError::Configuration("scripted provider state poisoned".to_string()))?;
        let text = self.responses[state.cursor % self.responses.len()].clone();
        state.cursor += 1;
        state.requests.push(request.clone());

        Ok(ModelResponse::new(self.name(), request.model.clone(), text))
    }
}
