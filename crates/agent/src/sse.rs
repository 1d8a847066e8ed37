use eventsource_stream::Eventsource;
use futures::stream::{BoxStream, Stream, StreamExt};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("event stream error: {0}")]
pub struct SseError(pub String);

pub type SseStream = BoxStream<'static, Result<SseEvent, SseError>>;

impl SseEvent {
    /// Unnamed events are `message` events.
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Decodes a `text/event-stream` body into events.
pub fn parse_sse_stream<S, B, E>(byte_stream: S) -> SseStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    byte_stream
        .eventsource()
        .map(|result| {
            result
                .map(|event| SseEvent {
                    event: (!event.event.is_empty()).then_some(event.event),
                    data: event.data,
                    id: (!event.id.is_empty()).then_some(event.id),
                })
                .map_err(|error| SseError(error.to_string()))
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use futures::{stream, StreamExt};

    use super::parse_sse_stream;

    #[tokio::test]
    async fn events_split_across_chunks_are_reassembled() {
        let chunks = vec![
            Ok::<_, std::io::Error>("event: endpoint\nda".as_bytes().to_vec()),
            Ok("ta: /messages?session=1\n\n".as_bytes().to_vec()),
            Ok("data: {\"n\":1}\n\n".as_bytes().to_vec()),
        ];
        let mut events = parse_sse_stream(stream::iter(chunks));

        let first = events.next().await.expect("first event").expect("valid event");
        assert_eq!(first.event.as_deref(), Some("endpoint"));
        assert_eq!(first.data, "/messages?session=1");

        let second = events.next().await.expect("second event").expect("valid event");
        assert_eq!(second.data, "{\"n\":1}");

        assert!(events.next().await.is_none());
    }
}
