//! Mock provider for deterministic executor testing.
//!
//! Canned responses and scripted failures are consumed in order, without
//! network calls. Received requests are recorded for assertions.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::{ChatRequest, ChatResponse, LlmError, LlmProvider};

/// One canned response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Optional delay before responding (simulates inference time).
    pub delay_ms: u64,
}

impl MockResponse {
    /// Create a simple text response with nominal token counts.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            text: content.into(),
            input_tokens: 10,
            output_tokens: 5,
            delay_ms: 0,
        }
    }

    pub fn with_tokens(mut self, input: i64, output: i64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

type Scripted = Result<MockResponse, LlmError>;

/// Mock LLM provider with a scripted response queue.
///
/// If the queue runs dry and no default response is set, calls fail with
/// `InvalidResponse` to catch test configuration issues.
pub struct MockProvider {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    default_response: Arc<Mutex<Option<MockResponse>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            default_response: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a response for the next call.
    pub fn queue_response(&self, response: MockResponse) {
        self.script.lock().unwrap().push_back(Ok(response));
    }

    /// Queue a failure for the next call.
    pub fn queue_error(&self, error: LlmError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    /// Queue the same failure `count` times.
    pub fn queue_errors(&self, count: usize, make: impl Fn() -> LlmError) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..count {
            script.push_back(Err(make()));
        }
    }

    /// Respond with this once the script is exhausted.
    pub fn with_default(self, response: MockResponse) -> Self {
        *self.default_response.lock().unwrap() = Some(response);
        self
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// How many scripted entries are still queued.
    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());

        let next = self.script.lock().unwrap().pop_front();
        let scripted = match next {
            Some(entry) => entry,
            None => match self.default_response.lock().unwrap().clone() {
                Some(response) => Ok(response),
                None => {
                    return Err(LlmError::InvalidResponse(
                        "mock script exhausted and no default response set".into(),
                    ))
                }
            },
        };

        match scripted {
            Ok(response) => {
                if response.delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(response.delay_ms)).await;
                }
                Ok(ChatResponse {
                    text: response.text,
                    input_tokens: response.input_tokens,
                    output_tokens: response.output_tokens,
                })
            }
            Err(error) => Err(error),
        }
    }
}
