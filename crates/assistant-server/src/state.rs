use std::sync::Arc;

use assistant::service::Assistant;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub assistant: Arc<Assistant>,
}

impl AppState {
    pub fn new(assistant: Arc<Assistant>) -> Self {
        Self { assistant }
    }
}

#[cfg(test)]
pub mod test_support {
    use std::sync::{Arc, Mutex};

    use assistant::agent::AgentConfig;
    use assistant::errors::ProviderError;
    use assistant::mcp::McpSettings;
    use assistant::models::message::Message;
    use assistant::models::tool::ToolSpec;
    use assistant::providers::base::{Provider, ProviderEvent, ProviderStream};
    use assistant::service::Assistant;
    use assistant::storage::MemoryStore;
    use async_trait::async_trait;

    use super::AppState;

    pub type Script = Vec<Result<ProviderEvent, ProviderError>>;

    /// Plays back one script per completion request
    pub struct ScriptedProvider {
        scripts: Mutex<Vec<Script>>,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn stream_completion(
            &self,
            _system: &str,
            _messages: &[Message],
            _tools: &[ToolSpec],
        ) -> Result<ProviderStream, ProviderError> {
            let script = {
                let mut scripts = self.scripts.lock().unwrap();
                if scripts.is_empty() {
                    vec![Ok(ProviderEvent::Finished)]
                } else {
                    scripts.remove(0)
                }
            };
            Ok(Box::pin(futures::stream::iter(script)))
        }
    }

    pub async fn state(scripts: Vec<Script>) -> AppState {
        let provider = Arc::new(ScriptedProvider {
            scripts: Mutex::new(scripts),
        });
        let assistant = Assistant::new(
            provider,
            Arc::new(MemoryStore::new()),
            AgentConfig::default(),
            McpSettings::default(),
        );
        assistant.start().await.unwrap();
        AppState::new(Arc::new(assistant))
    }
}
