use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use super::types::{ChatDelta, ChatMessage, ChatRequest, ChatResponse, StreamChunk, ToolSpec};
use super::{ChatBackend, LlmConfig};
use crate::error::DbError;

/// Talks to an OpenAI-compatible `/chat/completions` endpoint over HTTPS.
pub struct HttpLlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Self {
        HttpLlmClient {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn post(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        stream: bool,
    ) -> Result<reqwest::Response, DbError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            tools,
            stream,
        };
        debug!(model = %self.config.model, messages = messages.len(), stream, "completion request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DbError::Llm(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(DbError::Llm(format!("{}: {}", status, detail.trim())));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatBackend for HttpLlmClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ChatMessage, DbError> {
        let response = self.post(messages, tools, false).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| DbError::Llm(format!("malformed completion response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| DbError::Llm("completion response had no choices".to_string()))
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<BoxStream<'static, Result<ChatDelta, DbError>>, DbError> {
        let response = self.post(messages, tools, true).await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Ok(sse_deltas(bytes))
    }
}

enum SseEvent {
    Delta(ChatDelta),
    Done,
}

/// One `data:` line of the event stream, already stripped of framing.
fn parse_data_line(payload: &str) -> Result<Option<SseEvent>, DbError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(None);
    }
    if payload == "[DONE]" {
        return Ok(Some(SseEvent::Done));
    }
    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| DbError::Llm(format!("malformed stream chunk: {}", e)))?;
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(None);
    };
    let delta = ChatDelta {
        content: choice.delta.content,
        tool_calls: choice.delta.tool_calls.unwrap_or_default(),
    };
    if delta.content.is_none() && delta.tool_calls.is_empty() {
        return Ok(None);
    }
    Ok(Some(SseEvent::Delta(delta)))
}

struct SseState {
    inner: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    buffer: String,
    pending: VecDeque<Result<ChatDelta, DbError>>,
    done: bool,
}

/// Decode an SSE byte stream into chat deltas. Chunk boundaries do not align
/// with line boundaries, so partial lines are carried in a buffer until their
/// newline arrives. The `[DONE]` sentinel ends the stream.
fn sse_deltas(
    inner: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
) -> BoxStream<'static, Result<ChatDelta, DbError>> {
    let state = SseState {
        inner,
        buffer: String::new(),
        pending: VecDeque::new(),
        done: false,
    };
    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.inner.next().await {
                None => return None,
                Some(Err(e)) => {
                    st.done = true;
                    st.pending.push_back(Err(DbError::Llm(e.to_string())));
                }
                Some(Ok(bytes)) => {
                    st.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = st.buffer.find('\n') {
                        let line: String = st.buffer.drain(..=pos).collect();
                        let line = line.trim();
                        if let Some(payload) = line.strip_prefix("data:") {
                            match parse_data_line(payload) {
                                Ok(Some(SseEvent::Done)) => {
                                    st.done = true;
                                    break;
                                }
                                Ok(Some(SseEvent::Delta(delta))) => {
                                    st.pending.push_back(Ok(delta));
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    st.done = true;
                                    st.pending.push_back(Err(e));
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn byte_stream(chunks: Vec<&str>) -> BoxStream<'static, Result<Vec<u8>, reqwest::Error>> {
        futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(c.as_bytes().to_vec()))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    #[test]
    fn test_parse_data_line_variants() {
        assert!(matches!(parse_data_line("[DONE]"), Ok(Some(SseEvent::Done))));
        assert!(matches!(parse_data_line(""), Ok(None)));
        assert!(parse_data_line("not json").is_err());

        let event = parse_data_line(
            r#"{"choices":[{"delta":{"content":"hello"}}]}"#,
        )
        .unwrap();
        match event {
            Some(SseEvent::Delta(d)) => assert_eq!(d.content.as_deref(), Some("hello")),
            other => panic!("expected delta, got {:?}", matches!(other, Some(SseEvent::Done))),
        }
    }

    #[tokio::test]
    async fn test_sse_reassembles_lines_across_chunk_boundaries() {
        let stream = sse_deltas(byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"hel",
            "lo\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n",
            "data: [DONE]\n",
        ]));
        let deltas: Vec<ChatDelta> = stream.try_collect().await.unwrap();
        let text: String = deltas.iter().filter_map(|d| d.content.clone()).collect();
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn test_sse_stops_at_done_sentinel() {
        let stream = sse_deltas(byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\ndata: [DONE]\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n",
        ]));
        let deltas: Vec<ChatDelta> = stream.try_collect().await.unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].content.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_sse_surfaces_tool_call_fragments() {
        let stream = sse_deltas(byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\
             \"function\":{\"name\":\"list_tables\",\"arguments\":\"{}\"}}]}}]}\n",
            "data: [DONE]\n",
        ]));
        let deltas: Vec<ChatDelta> = stream.try_collect().await.unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].tool_calls[0].index, 0);
        assert_eq!(
            deltas[0].tool_calls[0]
                .function
                .as_ref()
                .unwrap()
                .name
                .as_deref(),
            Some("list_tables")
        );
    }
}
