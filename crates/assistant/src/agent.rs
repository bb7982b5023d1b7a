use std::sync::Arc;

use async_stream::stream;
use futures::future::join_all;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use strum_macros::Display;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{ChatError, ToolError};
use crate::mcp::McpManager;
use crate::models::message::{validate_history, Message, ToolCall};
use crate::prompt_template::system_prompt;
use crate::providers::base::{Provider, ProviderEvent};
use crate::registry::{ToolRegistry, ToolSnapshot, ToolTarget};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";
pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Tool rounds allowed in one turn before it fails
    pub max_tool_iterations: usize,
    /// Base instruction placed ahead of the tool instructions
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// What the caller of a turn sees
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    ContentDelta(String),
    /// The turn finished normally
    Done,
    /// The turn failed; nothing follows
    Error(String),
}

impl StreamEvent {
    /// The JSON body of the outbound frame, if this event has one.
    /// `Done` has none: the stream simply ends.
    pub fn frame(&self) -> Option<Value> {
        match self {
            StreamEvent::ContentDelta(text) => Some(json!({"content": text})),
            StreamEvent::Error(message) => Some(json!({"error": message})),
            StreamEvent::Done => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
enum TurnState {
    Idle,
    Streaming,
    ToolDispatch,
    ToolAwait,
    Done,
    Errored,
}

/// Agent integrates a foundational LLM with the tools it may call
pub struct Agent {
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    servers: Arc<McpManager>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        servers: Arc<McpManager>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            servers,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run one turn: `message` on top of `history`.
    ///
    /// The enabled tool set is captured here, so edits made to the registry while the
    /// turn runs do not affect it. Dropping the stream cancels the provider request and
    /// any tool call still outstanding.
    pub fn reply(&self, history: Vec<Message>, message: &str) -> BoxStream<'static, StreamEvent> {
        let turn = Turn {
            id: Uuid::new_v4(),
            provider: self.provider.clone(),
            servers: self.servers.clone(),
            tools: self.registry.snapshot(),
            config: self.config.clone(),
            state: TurnState::Idle,
        };
        let mut conversation = history;
        conversation.push(Message::user().with_text(message));
        Box::pin(turn.run(conversation))
    }
}

struct Turn {
    id: Uuid,
    provider: Arc<dyn Provider>,
    servers: Arc<McpManager>,
    tools: ToolSnapshot,
    config: AgentConfig,
    state: TurnState,
}

impl Turn {
    fn enter(&mut self, next: TurnState) {
        debug!(turn = %self.id, from = %self.state, to = %next, "turn state");
        self.state = next;
    }

    fn fail(&mut self, error: ChatError) -> StreamEvent {
        warn!(turn = %self.id, "turn failed: {}", error);
        self.enter(TurnState::Errored);
        StreamEvent::Error(error.to_string())
    }

    fn run(mut self, mut conversation: Vec<Message>) -> impl Stream<Item = StreamEvent> {
        stream! {
            if let Err(e) = validate_history(&conversation) {
                yield self.fail(e.into());
                return;
            }
            let system = match system_prompt(&self.config.system_prompt, &self.tools) {
                Ok(system) => system,
                Err(e) => {
                    yield self.fail(ChatError::Prompt(e.to_string()));
                    return;
                }
            };
            let specs = self.tools.specs();
            let mut rounds = 0;

            loop {
                self.enter(TurnState::Streaming);
                let mut events = match self
                    .provider
                    .stream_completion(&system, &conversation, &specs)
                    .await
                {
                    Ok(events) => events,
                    Err(e) => {
                        yield self.fail(e.into());
                        return;
                    }
                };

                let mut reply = Message::assistant();
                let mut calls: Vec<ToolCall> = Vec::new();
                let mut failure = None;
                while let Some(event) = events.next().await {
                    match event {
                        Ok(ProviderEvent::TokenDelta(text)) => {
                            reply.content.push_str(&text);
                            yield StreamEvent::ContentDelta(text);
                        }
                        Ok(ProviderEvent::ToolCallRequested(call)) => calls.push(call),
                        Ok(ProviderEvent::Finished) => break,
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                drop(events);

                if let Some(e) = failure {
                    yield self.fail(e.into());
                    return;
                }
                if calls.is_empty() {
                    self.enter(TurnState::Done);
                    yield StreamEvent::Done;
                    return;
                }
                if rounds >= self.config.max_tool_iterations {
                    yield self.fail(ChatError::ToolLoopLimitExceeded(rounds));
                    return;
                }
                rounds += 1;

                self.enter(TurnState::ToolDispatch);
                for call in &calls {
                    reply = reply.with_tool_call(call.clone());
                }
                conversation.push(reply);

                self.enter(TurnState::ToolAwait);
                let results = join_all(calls.iter().map(|call| self.dispatch(call))).await;
                for (call, result) in calls.iter().zip(results) {
                    conversation.push(Message::tool_result(&call.call_id, result));
                }
            }
        }
    }

    /// Execute one tool call. Failures become the result text so the model can react.
    async fn dispatch(&self, call: &ToolCall) -> String {
        let Some((tool, target)) = self.tools.resolve(&call.tool_name) else {
            return format!("error: {}", ToolError::ToolNotFound(call.tool_name.clone()));
        };
        debug!(turn = %self.id, tool = %tool.name, call_id = %call.call_id, "dispatching tool call");

        match target {
            ToolTarget::BuiltIn(handler) => match handler.call(call.arguments.clone()).await {
                Ok(output) => output,
                Err(e) => format!("error: {}", e),
            },
            ToolTarget::Remote { server, tool } => {
                match self.servers.invoke(&server, &tool, call.arguments.clone()).await {
                    Ok(result) if result.is_error => format!("error: {}", result.text()),
                    Ok(result) => result.text(),
                    Err(e) => format!("error: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::default_tools;
    use crate::errors::{ProviderError, ProviderErrorKind};
    use crate::mcp::mock::MockMcpServer;
    use crate::mcp::McpSettings;
    use crate::models::role::Role;
    use crate::models::server::ServerRegistration;
    use crate::providers::mock::MockProvider;
    use crate::storage::MemoryStore;

    struct Fixture {
        agent: Agent,
        provider: MockProvider,
        registry: Arc<ToolRegistry>,
        servers: Arc<McpManager>,
    }

    async fn fixture(scripts: Vec<crate::providers::mock::Script>, max_tool_iterations: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ToolRegistry::new(store.clone()));
        registry.seed_builtins(default_tools()).await.unwrap();
        let servers = Arc::new(McpManager::new(store, McpSettings::default()));
        let provider = MockProvider::new(scripts);
        let agent = Agent::new(
            Arc::new(provider.clone()),
            registry.clone(),
            servers.clone(),
            AgentConfig {
                max_tool_iterations,
                ..Default::default()
            },
        );
        Fixture {
            agent,
            provider,
            registry,
            servers,
        }
    }

    fn tool_call(id: &str, name: &str, arguments: Value) -> crate::providers::mock::Script {
        vec![
            Ok(ProviderEvent::ToolCallRequested(ToolCall::new(id, name, arguments))),
            Ok(ProviderEvent::Finished),
        ]
    }

    async fn collect(agent: &Agent, history: Vec<Message>, message: &str) -> Vec<StreamEvent> {
        agent.reply(history, message).collect().await
    }

    #[tokio::test]
    async fn test_plain_answer() {
        let f = fixture(vec![MockProvider::text("4")], 10).await;
        let events = collect(&f.agent, vec![], "2+2?").await;

        assert_eq!(
            events,
            vec![StreamEvent::ContentDelta("4".into()), StreamEvent::Done]
        );
        let request = &f.provider.requests()[0];
        assert!(request.system.starts_with(DEFAULT_SYSTEM_PROMPT));
        assert_eq!(request.messages.last().unwrap().content, "2+2?");
        assert_eq!(request.tools.len(), 4);
    }

    #[tokio::test]
    async fn test_builtin_tool_round_trip() {
        let f = fixture(
            vec![
                tool_call("c1", "calculator", json!({"expression": "6*7"})),
                MockProvider::text("It is 42."),
            ],
            10,
        ).await;
        let events = collect(&f.agent, vec![], "what is 6*7?").await;
        assert_eq!(
            events,
            vec![StreamEvent::ContentDelta("It is 42.".into()), StreamEvent::Done]
        );

        let second = &f.provider.requests()[1].messages;
        let call = &second[second.len() - 2];
        assert_eq!(call.role, Role::Assistant);
        assert_eq!(call.tool_calls[0].call_id, "c1");
        let result = second.last().unwrap();
        assert_eq!(result.role, Role::Tool);
        assert_eq!(result.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(result.content, "The result of 6*7 is 42");
    }

    #[tokio::test]
    async fn test_tool_failures_are_fed_back() {
        let f = fixture(
            vec![
                vec![
                    Ok(ProviderEvent::ToolCallRequested(ToolCall::new(
                        "a",
                        "calculator",
                        json!({"expression": "1/0"}),
                    ))),
                    Ok(ProviderEvent::ToolCallRequested(ToolCall::new(
                        "b",
                        "no_such_tool",
                        json!({}),
                    ))),
                    Ok(ProviderEvent::Finished),
                ],
                MockProvider::text("Sorry."),
            ],
            10,
        ).await;
        let events = collect(&f.agent, vec![], "divide").await;
        assert_eq!(events.last(), Some(&StreamEvent::Done));

        let messages = &f.provider.requests()[1].messages;
        let results: Vec<&Message> = messages.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].content.starts_with("error: "));
        assert_eq!(results[1].content, "error: tool not found: no_such_tool");
    }

    #[tokio::test]
    async fn test_tool_loop_limit() {
        let scripts = (0..5)
            .map(|i| tool_call(&format!("c{}", i), "web_search", json!({"query": "again"})))
            .collect();
        let f = fixture(scripts, 2).await;

        let events = collect(&f.agent, vec![], "loop").await;
        assert_eq!(
            events,
            vec![StreamEvent::Error(
                "tool-loop limit exceeded after 2 tool rounds".into()
            )]
        );
        assert_eq!(f.provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_provider_error_ends_turn_after_partial_output() {
        let f = fixture(
            vec![vec![
                Ok(ProviderEvent::TokenDelta("Hel".into())),
                Err(ProviderError::new(ProviderErrorKind::Network, "connection reset")),
            ]],
            10,
        ).await;
        let events = collect(&f.agent, vec![], "hi").await;
        assert_eq!(
            events,
            vec![
                StreamEvent::ContentDelta("Hel".into()),
                StreamEvent::Error("network error: connection reset".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_history_is_rejected_before_the_provider() {
        let f = fixture(vec![], 10).await;
        let history = vec![Message::tool_result("orphan", "42")];

        let events = collect(&f.agent, history, "hi").await;
        assert!(matches!(events.as_slice(), [StreamEvent::Error(_)]));
        assert!(f.provider.requests().is_empty());
    }

    #[tokio::test]
    async fn test_turn_keeps_its_tool_snapshot() {
        let f = fixture(
            vec![
                tool_call("c1", "calculator", json!({"expression": "1+1"})),
                MockProvider::text("2"),
            ],
            10,
        ).await;
        let calculator = f.registry.resolve("calculator").unwrap();
        let stream = f.agent.reply(vec![], "1+1?");

        // Disable the tool after the turn has started
        f.registry.set_enabled(calculator.id, false).await.unwrap();
        let events: Vec<StreamEvent> = stream.collect().await;

        assert_eq!(events.last(), Some(&StreamEvent::Done));
        let messages = &f.provider.requests()[1].messages;
        assert_eq!(messages.last().unwrap().content, "The result of 1+1 is 2");
    }

    #[tokio::test]
    async fn test_remote_tool_round_trip() {
        let mock = MockMcpServer::start(json!([
            {"name": "get_weather", "description": "Current weather", "inputSchema": {"type": "object"}}
        ]))
        .await;
        let f = fixture(
            vec![
                tool_call("w1", "get_weather", json!({"city": "Paris"})),
                MockProvider::text("It is 18°C in Paris."),
            ],
            10,
        ).await;
        f.servers
            .register(ServerRegistration::http("weather-mcp", mock.url()))
            .await
            .unwrap();
        let discovered = f.servers.discover_tools("weather-mcp").await.unwrap();
        f.registry
            .upsert_from_discovery("weather-mcp", &discovered)
            .await
            .unwrap();

        let events = collect(&f.agent, vec![], "Weather in Paris?").await;
        assert_eq!(events.last(), Some(&StreamEvent::Done));

        let messages = &f.provider.requests()[1].messages;
        assert_eq!(
            messages.last().unwrap().content,
            r#"get_weather called with {"city":"Paris"}"#
        );
    }

    #[test]
    fn test_frames() {
        assert_eq!(
            StreamEvent::ContentDelta("4".into()).frame(),
            Some(json!({"content": "4"}))
        );
        assert_eq!(
            StreamEvent::Error("boom".into()).frame(),
            Some(json!({"error": "boom"}))
        );
        assert_eq!(StreamEvent::Done.frame(), None);
    }
}
