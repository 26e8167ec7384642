use crate::event::PacketEvent;

/// Write end of the event channel.
///
/// `emit` is fire-and-forget: a full channel loses the event and the caller
/// never learns about it.
pub trait EventSink {
    fn emit(&self, event: &PacketEvent);
}
