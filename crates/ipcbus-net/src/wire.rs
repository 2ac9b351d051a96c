//! Wire envelope codec
//!
//! Every message crossing a socket is an [`Event`] named `eventbus.event`
//! whose payload is the relayed event. Envelopes are written back to back as
//! JSON objects; the stream carries no length prefix, each object delimits
//! itself.

use ipcbus_core::{Event, EventBusError, SystemEvent};
use serde_json::de::IoRead;
use serde_json::StreamDeserializer;
use std::io::{Read, Write};

/// Wrap an event into its wire envelope
pub fn envelope(source: &str, event: &Event) -> Result<Event, EventBusError> {
    let inner = serde_json::to_value(event)?;
    Ok(Event::system(source, SystemEvent::Envelope, Some(inner)))
}

/// Extract the relayed event from an envelope.
///
/// Returns `None` for anything that is not a well formed envelope.
pub fn open_envelope(envelope: Event) -> Option<Event> {
    if !envelope.is(SystemEvent::Envelope) {
        return None;
    }
    envelope
        .into_data()
        .and_then(|data| serde_json::from_value(data).ok())
}

/// Encode `event` as an envelope and flush it to `writer`
pub fn write_event<W: Write>(
    writer: &mut W,
    source: &str,
    event: &Event,
) -> Result<(), EventBusError> {
    let envelope = envelope(source, event)?;
    serde_json::to_writer(&mut *writer, &envelope)?;
    writer.flush()?;
    Ok(())
}

/// Blocking iterator over the envelopes of a stream
pub struct EventReader<R: Read> {
    events: StreamDeserializer<'static, IoRead<R>, Event>,
}

impl<R: Read> EventReader<R> {
    /// Read envelopes from `reader`
    pub fn new(reader: R) -> Self {
        Self {
            events: serde_json::Deserializer::from_reader(reader).into_iter(),
        }
    }
}

impl<R: Read> Iterator for EventReader<R> {
    type Item = Result<Event, serde_json::Error>;

    /// Next envelope; `None` on a clean end of stream
    fn next(&mut self) -> Option<Self::Item> {
        self.events.next()
    }
}
