use crate::config::Settings;
use crate::conversation::{Conversation, WireMessage};
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::stream::StreamAccumulator;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, warn};

// -- Wire format --

#[derive(Debug, Clone, Serialize)]
struct ChatBody {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    temperature: f64,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// A fully owned request snapshot.
///
/// Building it copies the conversation, so the conversation is free to be
/// mutated (e.g. streamed into) while the request is in flight.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    url: String,
    api_key: String,
    body: ChatBody,
}

impl ChatRequest {
    pub fn new(conversation: &Conversation, settings: &Settings, stream: bool) -> Self {
        Self {
            url: format!(
                "{}/chat/completions",
                settings.api_base_url.trim_end_matches('/')
            ),
            api_key: settings.api_key.clone(),
            body: ChatBody {
                model: settings.model.clone(),
                messages: conversation.to_wire_format(),
                max_tokens: settings.max_tokens,
                temperature: settings.temperature,
                stream,
            },
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_streaming(&self) -> bool {
        self.body.stream
    }

    /// JSON body as it goes on the wire.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.body)
            .map_err(|e| Error::protocol(format!("serialize request: {e}")))
    }
}

/// Chat-completions client. Every failure is surfaced; nothing is retried.
pub struct ChatClient {
    http: HttpClient,
}

impl ChatClient {
    pub fn new() -> Result<Self> {
        let http = HttpClient::new(concat!("mini-chat/", env!("CARGO_PKG_VERSION")))?;
        Ok(Self { http })
    }

    /// Send the conversation and return the assembled reply.
    ///
    /// Streams when `on_delta` is given, calling it once per fragment in
    /// arrival order before the next frame is read.
    pub async fn send(
        &self,
        conversation: &Conversation,
        settings: &Settings,
        on_delta: Option<&mut dyn FnMut(&str)>,
    ) -> Result<String> {
        let request = ChatRequest::new(conversation, settings, on_delta.is_some());
        self.execute(request, on_delta).await
    }

    pub async fn execute(
        &self,
        request: ChatRequest,
        on_delta: Option<&mut dyn FnMut(&str)>,
    ) -> Result<String> {
        if request.api_key.is_empty() {
            return Err(Error::MissingCredential);
        }
        debug!(
            model = %request.body.model,
            messages = request.body.messages.len(),
            stream = request.body.stream,
            "sending chat request"
        );

        if request.body.stream {
            let mut noop = |_: &str| {};
            let on_delta: &mut dyn FnMut(&str) = match on_delta {
                Some(f) => f,
                None => &mut noop,
            };
            self.complete_streaming(&request, on_delta).await
        } else {
            let text = self.complete(&request).await?;
            if let Some(f) = on_delta {
                f(&text);
            }
            Ok(text)
        }
    }

    /// Like [`execute`](Self::execute), but gives up as soon as `cancel`
    /// resolves. The in-flight request is dropped, closing its connection,
    /// and partial output is discarded.
    pub async fn execute_until<F>(
        &self,
        request: ChatRequest,
        on_delta: Option<&mut dyn FnMut(&str)>,
        cancel: F,
    ) -> Result<String>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.execute(request, on_delta) => result,
            () = cancel => {
                debug!("chat request cancelled");
                Err(Error::Cancelled)
            }
        }
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let body = request.to_json()?;
        let text = self
            .http
            .post_json(&request.url, &body, &request.api_key)
            .await?;

        let resp: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            warn!("unexpected chat response shape: {e}");
            Error::protocol(format!("parse chat response: {e}"))
        })?;

        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::protocol("response has no choices[0].message.content"))
    }

    async fn complete_streaming(
        &self,
        request: &ChatRequest,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<String> {
        let body = request.to_json()?;
        let resp = self
            .http
            .post_stream(&request.url, &body, &request.api_key)
            .await?;

        let mut bytes = resp.bytes_stream();
        let mut acc = StreamAccumulator::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| Error::transport(format!("stream read error: {e}")))?;
            acc.feed(&chunk, on_delta);
            if acc.is_done() {
                break;
            }
        }
        Ok(acc.finish(on_delta))
    }
}
