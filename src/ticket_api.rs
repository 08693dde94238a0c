// Handles communication with the remote ticket generation service

use std::fmt::Display;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, Stream, StreamExt};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::attachments::{EncodedAttachment, MAX_ATTACHMENTS};
use crate::config::ClientConfig;
use crate::error::GenerationError;

/// Marker the service writes into an otherwise successful body when generation
/// fails upstream.
pub const IN_BAND_ERROR_MARKER: &str = "Error generating ticket:";

pub const MAX_DESCRIPTION_CHARS: usize = 1000;

/// Decoded text fragments in arrival order.
pub type FragmentStream = BoxStream<'static, Result<String, GenerationError>>;

/// Body of `POST /generate-ticket`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketRequest {
    description: String,
    images: Vec<EncodedAttachment>,
}

impl TicketRequest {
    /// Applies the service's acceptance rules before anything is sent.
    pub fn new(
        description: &str,
        images: Vec<EncodedAttachment>,
    ) -> Result<Self, GenerationError> {
        check_description(description)?;
        if images.len() > MAX_ATTACHMENTS {
            return Err(GenerationError::TooManyImages {
                max: MAX_ATTACHMENTS,
            });
        }
        if let Some(index) = images.iter().position(|img| !img.is_well_formed()) {
            return Err(GenerationError::InvalidImage { index });
        }

        Ok(Self {
            description: description.to_string(),
            images,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn images(&self) -> &[EncodedAttachment] {
        &self.images
    }
}

pub fn check_description(description: &str) -> Result<(), GenerationError> {
    if description.trim().is_empty() {
        return Err(GenerationError::EmptyInput);
    }
    if description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(GenerationError::DescriptionTooLong {
            max: MAX_DESCRIPTION_CHARS,
        });
    }
    Ok(())
}

/// Returns the trimmed message following the error marker, if the fragment
/// carries one. Text before the marker is not part of the message.
pub fn in_band_error(fragment: &str) -> Option<String> {
    fragment
        .find(IN_BAND_ERROR_MARKER)
        .map(|at| fragment[at + IN_BAND_ERROR_MARKER.len()..].trim().to_string())
}

/// Opens a generation stream for a request.
///
/// The returned future resolves once the response headers are in; the body is
/// consumed through the stream.
pub trait TicketTransport: Send + Sync + 'static {
    fn open(
        &self,
        request: TicketRequest,
    ) -> BoxFuture<'static, Result<FragmentStream, GenerationError>>;
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<String>,
}

#[derive(Deserialize)]
struct HealthBody {
    status: String,
}

/// HTTP transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct TicketClient {
    client: Client,
    config: ClientConfig,
}

impl TicketClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// `true` when the service answers its health check with "healthy".
    pub async fn health(&self) -> Result<bool, GenerationError> {
        let response = self
            .client
            .get(self.config.health_url())
            .send()
            .await
            .map_err(|e| GenerationError::transport(format!("Failed to send request: {}", e)))?;

        if !response.status().is_success() {
            return Ok(false);
        }

        let body: HealthBody = response
            .json()
            .await
            .map_err(|e| GenerationError::transport(format!("Invalid health response: {}", e)))?;
        Ok(body.status == "healthy")
    }
}

impl TicketTransport for TicketClient {
    fn open(
        &self,
        request: TicketRequest,
    ) -> BoxFuture<'static, Result<FragmentStream, GenerationError>> {
        let client = self.client.clone();
        let url = self.config.generate_url();

        async move {
            debug!(%url, images = request.images.len(), "sending generation request");
            let response = client
                .post(&url)
                .header("Content-Type", "application/json")
                .json(&request)
                .send()
                .await
                .map_err(|e| GenerationError::transport(format!("Failed to send request: {}", e)))?;

            if !response.status().is_success() {
                return Err(server_error(response).await);
            }

            Ok(decode_fragments(response.bytes_stream().boxed()))
        }
        .boxed()
    }
}

async fn server_error(response: Response) -> GenerationError {
    let status = response.status().as_u16();
    let detail = response
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|body| body.detail)
        .filter(|detail| !detail.is_empty());

    let message = detail.unwrap_or_else(|| format!("Server error: {}", status));
    warn!(status, %message, "generation request rejected");
    GenerationError::Server { status, message }
}

/// Incremental UTF-8 decoding across chunk boundaries.
///
/// A character split between two chunks is held back until it is complete;
/// invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        // incomplete trailing sequence, wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Flushes whatever is still buffered once the body has ended.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

struct DecodeState<S> {
    chunks: S,
    decoder: Utf8Decoder,
    done: bool,
}

/// Turns a body byte stream into non-empty text fragments.
///
/// A read error is yielded once and ends the stream.
pub fn decode_fragments<S, B, E>(chunks: S) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Unpin + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        chunks,
        decoder: Utf8Decoder::default(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            match state.chunks.next().await {
                Some(Ok(bytes)) => {
                    let text = state.decoder.decode(bytes.as_ref());
                    if !text.is_empty() {
                        return Some((Ok(text), state));
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    let err = GenerationError::transport(format!("Error reading stream: {}", e));
                    return Some((Err(err), state));
                }
                None => {
                    state.done = true;
                    let rest = state.decoder.finish();
                    if rest.is_empty() {
                        return None;
                    }
                    return Some((Ok(rest), state));
                }
            }
        }
    })
    .boxed()
}
