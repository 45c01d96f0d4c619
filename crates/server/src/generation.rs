// Generation backend: the external service that turns a question into a
// stream of text chunks.
//
// The trait is channel-based so implementations own their I/O task and the
// orchestrator stays transport-agnostic. Dropping the receiver is the
// cooperative abort signal: the next send fails and the producer stops.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

/// One event from the generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Chunk(String),
    Done,
    Error(String),
}

/// Abstraction over the generation service for testability.
pub trait GenerationBackend: Send + Sync {
    /// Start generating an answer. Events arrive on the returned channel,
    /// terminated by `Done` or `Error`.
    fn generate(&self, question: &str) -> mpsc::Receiver<GenerationEvent>;
}

const EVENT_BUFFER_SIZE: usize = 32;

/// Streams chunks from an HTTP endpoint that returns an incremental body.
pub struct HttpGenerationBackend {
    client: reqwest::Client,
    endpoint: String,
    model: Option<String>,
}

impl HttpGenerationBackend {
    pub fn new(endpoint: String, model: Option<String>) -> Self {
        Self { client: reqwest::Client::new(), endpoint, model }
    }
}

impl GenerationBackend for HttpGenerationBackend {
    fn generate(&self, question: &str) -> mpsc::Receiver<GenerationEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let body = serde_json::json!({
            "question": question,
            "model": self.model,
        });

        tokio::spawn(async move {
            let response = match client
                .post(&endpoint)
                .json(&body)
                .send()
                .await
                .and_then(|response| response.error_for_status())
            {
                Ok(response) => response,
                Err(error) => {
                    let _ = tx.send(GenerationEvent::Error(error.to_string())).await;
                    return;
                }
            };

            let mut stream = response.bytes_stream();
            while let Some(next) = stream.next().await {
                match next {
                    Ok(bytes) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if tx.send(GenerationEvent::Chunk(text)).await.is_err() {
                            // Receiver dropped: the query was cancelled.
                            debug!("generation receiver dropped; aborting stream");
                            return;
                        }
                    }
                    Err(error) => {
                        let _ = tx.send(GenerationEvent::Error(error.to_string())).await;
                        return;
                    }
                }
            }

            let _ = tx.send(GenerationEvent::Done).await;
        });

        rx
    }
}

/// Backend used when no endpoint is configured: every query fails cleanly
/// instead of hanging.
pub struct UnconfiguredBackend;

impl GenerationBackend for UnconfiguredBackend {
    fn generate(&self, _question: &str) -> mpsc::Receiver<GenerationEvent> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let _ = tx
                .send(GenerationEvent::Error("no generation backend is configured".to_string()))
                .await;
        });
        rx
    }
}
