//! One conversation bound to at most one connected database.
//!
//! The session owns the adapter, the tool catalog and the message history,
//! and runs the tool-calling loop: one completion with tools, sequential
//! execution of every requested invocation, then exactly one follow-up
//! completion to phrase the answer. Tool calls emitted by the follow-up are
//! dropped, so a turn performs at most one hop of tool execution.

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapters::{create_adapter, BackendKind, DatabaseAdapter};
use crate::error::{friendly_message, DbError};
use crate::llm::{ChatBackend, ChatMessage, StreamAccumulator, ToolCall, ToolSpec};
use crate::tools;

/// Returned by a successful `connect`.
#[derive(Debug)]
pub struct ConnectOutcome {
    pub status: String,
    pub tool_names: Vec<String>,
}

/// Final answer for one blocking turn. `data` is present when the answer
/// text happens to parse as a JSON object or array.
#[derive(Debug)]
pub struct QueryAnswer {
    pub response: String,
    pub data: Option<Value>,
}

/// Incremental output of a streaming turn. Every turn ends with `Done`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(String),
    Done,
}

pub struct Session {
    llm: Box<dyn ChatBackend>,
    adapter: Option<Box<dyn DatabaseAdapter>>,
    tools: Vec<ToolSpec>,
    conversation: Vec<ChatMessage>,
}

impl Session {
    pub fn new(llm: Box<dyn ChatBackend>) -> Self {
        Session {
            llm,
            adapter: None,
            tools: Vec::new(),
            conversation: Vec::new(),
        }
    }

    /// Connect to a database, replacing any existing connection. On failure
    /// the session is left disconnected with an empty conversation.
    pub async fn connect(
        &mut self,
        kind: BackendKind,
        url: &str,
    ) -> Result<ConnectOutcome, DbError> {
        self.disconnect().await?;

        let adapter = create_adapter(kind, url).await?;
        info!(backend = %kind, "connected");

        self.tools = tools::catalog();
        self.conversation = vec![ChatMessage::system(system_directive(kind))];
        self.adapter = Some(adapter);
        Ok(ConnectOutcome {
            status: format!("connected to {}", kind),
            tool_names: tools::tool_names(),
        })
    }

    pub async fn disconnect(&mut self) -> Result<(), DbError> {
        if let Some(mut adapter) = self.adapter.take() {
            adapter.close().await?;
            debug!("adapter closed");
        }
        self.tools.clear();
        self.conversation.clear();
        Ok(())
    }

    pub fn status(&self) -> bool {
        self.adapter.is_some()
    }

    /// Blocking turn: returns the complete answer once tools have run.
    pub async fn process_query(&mut self, text: &str) -> Result<QueryAnswer, DbError> {
        if self.adapter.is_none() {
            return Err(DbError::ConnectionFailure(
                "not connected to a database".to_string(),
            ));
        }

        // Turn state is staged and committed only on success, so a failed
        // turn leaves the conversation exactly as it was.
        let mut staged = vec![ChatMessage::user(text)];

        let first = self
            .llm
            .chat(&self.with_staged(&staged), &self.tools)
            .await
            .map_err(turn_fatal)?;

        let answer = match first.tool_calls.clone() {
            Some(calls) if !calls.is_empty() => {
                staged.push(ChatMessage::assistant_calls(first.content, calls.clone()));
                self.run_tool_calls(&calls, &mut staged).await?;

                let follow_up = self
                    .llm
                    .chat(&self.with_staged(&staged), &self.tools)
                    .await
                    .map_err(turn_fatal)?;
                if follow_up.tool_calls.as_ref().is_some_and(|c| !c.is_empty()) {
                    warn!("dropping tool calls requested by the follow-up completion");
                }
                follow_up.content.unwrap_or_default()
            }
            _ => first.content.unwrap_or_default(),
        };

        staged.push(ChatMessage::assistant(answer.clone()));
        self.conversation.append(&mut staged);

        let data = parse_structured(&answer);
        Ok(QueryAnswer { response: answer, data })
    }

    /// Streaming turn: content tokens are forwarded through `sink` as they
    /// arrive; `StreamEvent::Done` is sent when the turn ends, successfully
    /// or not.
    pub async fn process_query_stream(
        &mut self,
        text: &str,
        sink: &mpsc::Sender<StreamEvent>,
    ) -> Result<(), DbError> {
        let result = self.stream_turn(text, sink).await;
        let _ = sink.send(StreamEvent::Done).await;
        result
    }

    async fn stream_turn(
        &mut self,
        text: &str,
        sink: &mpsc::Sender<StreamEvent>,
    ) -> Result<(), DbError> {
        if self.adapter.is_none() {
            return Err(DbError::ConnectionFailure(
                "not connected to a database".to_string(),
            ));
        }

        let mut staged = vec![ChatMessage::user(text)];

        let mut stream = self
            .llm
            .chat_stream(&self.with_staged(&staged), &self.tools)
            .await
            .map_err(turn_fatal)?;

        let mut content = String::new();
        let mut acc = StreamAccumulator::new();
        while let Some(delta) = stream.next().await {
            let delta = delta.map_err(turn_fatal)?;
            if let Some(token) = delta.content {
                content.push_str(&token);
                let _ = sink.send(StreamEvent::Content(token)).await;
            }
            for fragment in &delta.tool_calls {
                acc.push(fragment);
            }
        }
        drop(stream);

        let calls = acc.finish()?;
        let answer = if calls.is_empty() {
            content
        } else {
            let first_content = if content.is_empty() { None } else { Some(content) };
            staged.push(ChatMessage::assistant_calls(first_content, calls.clone()));
            self.run_tool_calls(&calls, &mut staged).await?;

            let mut follow_up = self
                .llm
                .chat_stream(&self.with_staged(&staged), &self.tools)
                .await
                .map_err(turn_fatal)?;
            let mut answer = String::new();
            while let Some(delta) = follow_up.next().await {
                let delta = delta.map_err(turn_fatal)?;
                if let Some(token) = delta.content {
                    answer.push_str(&token);
                    let _ = sink.send(StreamEvent::Content(token)).await;
                }
                if !delta.tool_calls.is_empty() {
                    warn!("dropping tool calls requested by the follow-up completion");
                }
            }
            answer
        };

        staged.push(ChatMessage::assistant(answer));
        self.conversation.append(&mut staged);
        Ok(())
    }

    /// Execute requested invocations in emission order, appending a tool
    /// result message for each. Dispatch failures become result text the
    /// model can react to; they never abort the turn.
    async fn run_tool_calls(
        &mut self,
        calls: &[ToolCall],
        staged: &mut Vec<ChatMessage>,
    ) -> Result<(), DbError> {
        let adapter = self.adapter.as_mut().ok_or_else(|| {
            DbError::ConnectionFailure("not connected to a database".to_string())
        })?;

        for call in calls {
            let result = match serde_json::from_str::<Value>(&call.function.arguments) {
                Ok(args) => {
                    match tools::dispatch(adapter.as_mut(), &call.function.name, &args).await {
                        Ok(text) => text,
                        Err(e) => format!("error: {}", e),
                    }
                }
                Err(e) => format!("error: tool arguments were not valid JSON: {}", e),
            };
            debug!(tool = %call.function.name, bytes = result.len(), "tool result");
            staged.push(ChatMessage::tool_result(&call.id, result));
        }
        Ok(())
    }

    fn with_staged(&self, staged: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut messages = self.conversation.clone();
        messages.extend_from_slice(staged);
        messages
    }
}

/// Model failures end the turn; rewrite the noisy ones before they reach the
/// user.
fn turn_fatal(err: DbError) -> DbError {
    match err {
        DbError::Llm(msg) => DbError::Llm(friendly_message(&msg)),
        other => other,
    }
}

/// Best-effort structured view of the answer. Only objects and arrays count;
/// bare numbers or strings stay textual.
fn parse_structured(answer: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(answer.trim()) {
        Ok(v @ (Value::Object(_) | Value::Array(_))) => Some(v),
        _ => None,
    }
}

fn system_directive(kind: BackendKind) -> String {
    format!(
        "You are a database assistant connected to a {} database. Use the \
         provided tools to inspect the schema and answer questions about the \
         data. Look at the schema before writing queries against unfamiliar \
         tables. Relational backends take SQL query strings; MongoDB takes \
         structured queries with a 'collection' and optional 'filter'. Report \
         results accurately and say so when a result is empty. Never invent \
         data.",
        kind
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatDelta, FunctionCall, FunctionFragment, ToolCallFragment};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Collaborator that replays a fixed script of assistant messages and
    /// records every request it receives.
    struct ScriptedBackend {
        replies: Mutex<VecDeque<ChatMessage>>,
        requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<ChatMessage>) -> (Self, Arc<Mutex<Vec<Vec<ChatMessage>>>>) {
            let requests = Arc::new(Mutex::new(Vec::new()));
            (
                ScriptedBackend {
                    replies: Mutex::new(replies.into()),
                    requests: requests.clone(),
                },
                requests,
            )
        }

        fn next_reply(&self, messages: &[ChatMessage]) -> Result<ChatMessage, DbError> {
            self.requests.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| DbError::Llm("script exhausted".to_string()))
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            _tools: &[ToolSpec],
        ) -> Result<ChatMessage, DbError> {
            self.next_reply(messages)
        }

        async fn chat_stream(
            &self,
            messages: &[ChatMessage],
            _tools: &[ToolSpec],
        ) -> Result<BoxStream<'static, Result<ChatDelta, DbError>>, DbError> {
            let reply = self.next_reply(messages)?;
            let mut deltas: Vec<Result<ChatDelta, DbError>> = Vec::new();

            // Fragment the scripted reply the way a live endpoint would:
            // content split into small pieces, tool calls split mid-argument.
            if let Some(content) = reply.content {
                for piece in split_in_two(&content) {
                    deltas.push(Ok(ChatDelta {
                        content: Some(piece),
                        tool_calls: Vec::new(),
                    }));
                }
            }
            for (index, call) in reply.tool_calls.unwrap_or_default().into_iter().enumerate() {
                let args = split_in_two(&call.function.arguments);
                deltas.push(Ok(ChatDelta {
                    content: None,
                    tool_calls: vec![ToolCallFragment {
                        index,
                        id: Some(call.id.clone()),
                        function: Some(FunctionFragment {
                            name: Some(call.function.name.clone()),
                            arguments: args.first().cloned(),
                        }),
                    }],
                }));
                for piece in args.into_iter().skip(1) {
                    deltas.push(Ok(ChatDelta {
                        content: None,
                        tool_calls: vec![ToolCallFragment {
                            index,
                            id: None,
                            function: Some(FunctionFragment {
                                name: None,
                                arguments: Some(piece),
                            }),
                        }],
                    }));
                }
            }
            Ok(futures::stream::iter(deltas).boxed())
        }
    }

    fn split_in_two(s: &str) -> Vec<String> {
        if s.len() < 2 {
            return vec![s.to_string()];
        }
        let mid = s.len() / 2;
        let mut mid = mid;
        while !s.is_char_boundary(mid) {
            mid += 1;
        }
        vec![s[..mid].to_string(), s[mid..].to_string()]
    }

    fn call(id: &str, name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    async fn connected_session(replies: Vec<ChatMessage>) -> (Session, Arc<Mutex<Vec<Vec<ChatMessage>>>>) {
        let (backend, requests) = ScriptedBackend::new(replies);
        let mut session = Session::new(Box::new(backend));
        let outcome = session
            .connect(BackendKind::Sqlite, "sqlite::memory:")
            .await
            .unwrap();
        assert_eq!(outcome.tool_names.len(), 18);
        (session, requests)
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_session_disconnected() {
        let (backend, _) = ScriptedBackend::new(vec![]);
        let mut session = Session::new(Box::new(backend));
        let err = session
            .connect(BackendKind::Postgres, "mongodb://localhost/db")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidDescriptor { .. }));
        assert!(!session.status());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (mut session, _) = connected_session(vec![]).await;
        assert!(session.status());
        session
            .connect(BackendKind::Sqlite, "sqlite::memory:")
            .await
            .unwrap();
        assert!(session.status());
        session.disconnect().await.unwrap();
        assert!(!session.status());
    }

    #[tokio::test]
    async fn test_query_without_connection_fails() {
        let (backend, _) = ScriptedBackend::new(vec![]);
        let mut session = Session::new(Box::new(backend));
        let err = session.process_query("hello").await.unwrap_err();
        assert!(matches!(err, DbError::ConnectionFailure(_)));
    }

    #[tokio::test]
    async fn test_tool_free_answer_passes_through() {
        let (mut session, _) =
            connected_session(vec![ChatMessage::assistant("Nothing to look up.")]).await;
        let answer = session.process_query("hi").await.unwrap();
        assert_eq!(answer.response, "Nothing to look up.");
        assert!(answer.data.is_none());
    }

    #[tokio::test]
    async fn test_json_answer_is_also_structured() {
        let (mut session, _) =
            connected_session(vec![ChatMessage::assistant(r#"{"count": 3}"#)]).await;
        let answer = session.process_query("how many?").await.unwrap();
        assert_eq!(answer.data, Some(json!({"count": 3})));
    }

    #[tokio::test]
    async fn test_list_collections_scenario() {
        let (mut session, requests) = connected_session(vec![
            // Setup turn: the collaborator creates two tables.
            ChatMessage::assistant_calls(
                None,
                vec![
                    call("c1", "execute_query", r#"{"query": "CREATE TABLE users (id INTEGER)"}"#),
                    call("c2", "execute_query", r#"{"query": "CREATE TABLE orders (id INTEGER)"}"#),
                ],
            ),
            ChatMessage::assistant("Tables created."),
            // The scenario turn.
            ChatMessage::assistant_calls(None, vec![call("c3", "list_tables", "{}")]),
            ChatMessage::assistant("Your collections are: orders and users."),
        ])
        .await;

        session.process_query("set up the tables").await.unwrap();
        let answer = session.process_query("list all collections").await.unwrap();
        assert!(answer.response.contains("orders"));
        assert!(answer.response.contains("users"));

        // The follow-up request of the second turn carries exactly one tool
        // result, and it is the list_tables output.
        let requests = requests.lock().unwrap();
        let follow_up = requests.last().unwrap();
        let tool_results: Vec<&ChatMessage> =
            follow_up.iter().filter(|m| m.role == "tool").skip(2).collect();
        assert_eq!(tool_results.len(), 1);
        assert_eq!(
            tool_results[0].content.as_deref(),
            Some(r#"["orders","users"]"#)
        );
    }

    #[tokio::test]
    async fn test_tool_failure_feeds_back_and_turn_continues() {
        let (mut session, requests) = connected_session(vec![
            ChatMessage::assistant_calls(
                None,
                vec![call("c1", "execute_query", r#"{"query": "DROP TABLE x"}"#)],
            ),
            ChatMessage::assistant("That operation is not allowed."),
        ])
        .await;

        let answer = session.process_query("drop table x").await.unwrap();
        assert_eq!(answer.response, "That operation is not allowed.");

        let requests = requests.lock().unwrap();
        let follow_up = requests.last().unwrap();
        let tool_result = follow_up.iter().find(|m| m.role == "tool").unwrap();
        assert!(tool_result.content.as_ref().unwrap().contains("forbidden operation"));
    }

    #[tokio::test]
    async fn test_streaming_matches_blocking_for_tool_free_reply() {
        let text = "The answer is forty-two.";
        let (mut session, _) = connected_session(vec![
            ChatMessage::assistant(text),
            ChatMessage::assistant(text),
        ])
        .await;

        let blocking = session.process_query("q").await.unwrap().response;

        let (tx, mut rx) = mpsc::channel(64);
        session.process_query_stream("q", &tx).await.unwrap();
        drop(tx);

        let mut streamed = String::new();
        let mut saw_done = false;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Content(piece) => streamed.push_str(&piece),
                StreamEvent::Done => saw_done = true,
            }
        }
        assert!(saw_done);
        assert_eq!(streamed, blocking);
    }

    #[tokio::test]
    async fn test_streaming_turn_with_fragmented_tool_call() {
        let (mut session, _) = connected_session(vec![
            ChatMessage::assistant_calls(
                None,
                vec![call(
                    "c1",
                    "execute_query",
                    r#"{"query": "CREATE TABLE t (id INTEGER)"}"#,
                )],
            ),
            ChatMessage::assistant("Created."),
            ChatMessage::assistant_calls(None, vec![call("c2", "list_tables", "{}")]),
            ChatMessage::assistant("Just one table: t."),
        ])
        .await;

        let (tx, mut rx) = mpsc::channel(64);
        session.process_query_stream("create t", &tx).await.unwrap();
        session.process_query_stream("what tables?", &tx).await.unwrap();
        drop(tx);

        let mut text = String::new();
        let mut done_count = 0;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Content(piece) => text.push_str(&piece),
                StreamEvent::Done => done_count += 1,
            }
        }
        assert_eq!(done_count, 2);
        assert!(text.contains("Just one table: t."));
    }

    #[tokio::test]
    async fn test_model_failure_is_turn_fatal_and_friendly() {
        // Empty script: the first chat call fails.
        let (mut session, _) = connected_session(vec![]).await;
        let err = session.process_query("q").await.unwrap_err();
        assert!(matches!(err, DbError::Llm(_)));

        // The failed turn left no trace in the conversation: a scripted
        // retry sees only the system directive and the new user turn.
        let (backend, requests) = ScriptedBackend::new(vec![ChatMessage::assistant("ok")]);
        session.llm = Box::new(backend);
        session.process_query("again").await.unwrap();
        let requests = requests.lock().unwrap();
        assert_eq!(requests[0].len(), 2);
        assert_eq!(requests[0][0].role, "system");
        assert_eq!(requests[0][1].content.as_deref(), Some("again"));
    }
}
