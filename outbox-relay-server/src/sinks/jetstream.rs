//! NATS JetStream broker sink.
//!
//! Publishes each message to its topic as a JetStream subject and waits for
//! the stream's publish ack. The dedup id goes into the `Nats-Msg-Id` header
//! so the stream drops redeliveries inside its duplicate window.
//!
//! Backpressure is a stream at its limits with the `new` discard policy: the
//! server refuses the write with API error code 10077 until consumers catch
//! up, which the client surfaces as `PublishErrorKind::Other`.

use async_nats::jetstream::{self, ErrorCode, context::PublishErrorKind};
use async_nats::{HeaderMap, header::NATS_MESSAGE_ID};
use async_trait::async_trait;
use bytes::Bytes;
use outbox_relay_core::sinks::{BrokerMessage, BrokerSink, DeliveryAck, SinkError};

/// Header carrying the partitioning key.
const KEY_HEADER: &str = "Outbox-Key";

pub struct JetStreamSink {
    context: jetstream::Context,
}

impl JetStreamSink {
    /// Connect to the NATS server at `url`.
    pub async fn connect(url: &str) -> Result<Self, async_nats::ConnectError> {
        let client = async_nats::connect(url).await?;
        Ok(Self {
            context: jetstream::new(client),
        })
    }
}

#[async_trait]
impl BrokerSink for JetStreamSink {
    async fn publish(&self, message: &BrokerMessage) -> Result<DeliveryAck, SinkError> {
        let mut headers = HeaderMap::new();
        headers.insert(NATS_MESSAGE_ID, message.dedup_id.as_str());
        headers.insert(KEY_HEADER, message.key.as_str());

        let ack = self
            .context
            .publish_with_headers(
                message.topic.clone(),
                headers,
                Bytes::from(message.payload.clone()),
            )
            .await
            .map_err(publish_error)?;

        let ack = ack.await.map_err(publish_error)?;

        Ok(DeliveryAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }
}

fn publish_error(e: jetstream::context::PublishError) -> SinkError {
    let api_code = std::error::Error::source(&e)
        .and_then(|source| source.downcast_ref::<jetstream::Error>())
        .map(jetstream::Error::error_code);
    classify(e.kind(), api_code, e.to_string())
}

fn classify(kind: PublishErrorKind, api_code: Option<ErrorCode>, detail: String) -> SinkError {
    match kind {
        PublishErrorKind::TimedOut => SinkError::Timeout,
        PublishErrorKind::StreamNotFound => SinkError::Rejected {
            status: 404,
            body: detail,
        },
        PublishErrorKind::WrongLastMessageId | PublishErrorKind::WrongLastSequence => {
            SinkError::Rejected {
                status: 409,
                body: detail,
            }
        }
        PublishErrorKind::Other if api_code == Some(ErrorCode::STREAM_STORE_FAILED) => {
            SinkError::Backpressure(detail)
        }
        _ => SinkError::Unavailable(detail),
    }
}
