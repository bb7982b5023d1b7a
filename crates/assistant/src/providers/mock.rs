use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::models::tool::ToolSpec;
use crate::providers::base::{Provider, ProviderEvent, ProviderStream};

pub type Script = Vec<Result<ProviderEvent, ProviderError>>;

/// What the provider was asked on one call
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

/// A mock provider that plays back one pre-configured event script per call
#[derive(Clone, Default)]
pub struct MockProvider {
    scripts: Arc<Mutex<Vec<Script>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of scripted completions
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            requests: Arc::default(),
        }
    }

    /// Script that streams `text` as one delta and finishes
    pub fn text(text: &str) -> Script {
        vec![
            Ok(ProviderEvent::TokenDelta(text.to_string())),
            Ok(ProviderEvent::Finished),
        ]
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn stream_completion(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ProviderStream, ProviderError> {
        self.requests.lock().push(RecordedRequest {
            system: system.to_string(),
            messages: messages.to_vec(),
            tools: tools.to_vec(),
        });

        let script = {
            let mut scripts = self.scripts.lock();
            if scripts.is_empty() {
                // Finish with no output once the scripts run out
                vec![Ok(ProviderEvent::Finished)]
            } else {
                scripts.remove(0)
            }
        };
        Ok(Box::pin(futures::stream::iter(script)))
    }
}
