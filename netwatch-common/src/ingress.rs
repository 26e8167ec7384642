use crate::{
    channel::EventSink,
    cursor::{classify_frame, ClassifyError, HeaderSource},
    event::PacketEvent,
};

/// Classifies one frame seen at ingress and emits a pass event for IPv4
/// TCP/UDP traffic.
///
/// The result only says whether an event went out. Callers hand the packet
/// on unchanged either way.
#[inline(always)]
pub fn observe_ingress<S, E, C>(window: &S, sink: &E, clock: C) -> Result<(), ClassifyError>
where
    S: HeaderSource,
    E: EventSink,
    C: FnOnce() -> u64,
{
    let fields = classify_frame(window)?;
    sink.emit(&PacketEvent::ingress(&fields, clock()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::testing::Collect, cursor::testing::Frame, Action, SliceWindow};

    #[test]
    fn tcp_frame_emits_one_pass_event() {
        let sink = Collect::default();
        let bytes = Frame::https_reply().bytes();

        observe_ingress(&SliceWindow(&bytes), &sink, || 1_000).unwrap();

        let events = sink.take();
        assert_eq!(events.len(), 1);
        let ev = events[0];
        assert_eq!(ev.src_octets(), [10, 0, 0, 1]);
        assert_eq!(ev.dst_octets(), [10, 0, 0, 2]);
        assert_eq!((ev.src_port, ev.dst_port), (443, 51000));
        assert_eq!(ev.protocol, 6);
        assert_eq!(ev.pkt_len, 60);
        assert_eq!(ev.action(), Ok(Action::IngressPass));
        assert_eq!(ev.drop_reason, 0);
        assert_eq!(ev.ktime_ns, 1_000);
    }

    #[test]
    fn pkt_len_is_declared_not_physical() {
        let sink = Collect::default();
        let mut frame = Frame::https_reply();
        frame.total_len = 1500;
        let bytes = frame.bytes();

        observe_ingress(&SliceWindow(&bytes), &sink, || 0).unwrap();
        assert_eq!(sink.take()[0].pkt_len, 1500);
    }

    #[test]
    fn arp_emits_nothing() {
        let sink = Collect::default();
        let mut frame = Frame::https_reply();
        frame.ether_type = 0x0806;
        let bytes = frame.bytes();

        let result = observe_ingress(&SliceWindow(&bytes), &sink, || 0);
        assert_eq!(result, Err(ClassifyError::UnsupportedLinkType));
        assert!(sink.take().is_empty());
    }

    #[test]
    fn clock_is_not_read_without_an_event() {
        let sink = Collect::default();
        let bytes = Frame::https_reply().bytes();
        let result = observe_ingress(&SliceWindow(&bytes[..20]), &sink, || {
            panic!("clock read for a truncated frame")
        });
        assert_eq!(result, Err(ClassifyError::ShortBuffer));
    }

    #[test]
    fn malformed_inputs_never_emit() {
        let sink = Collect::default();
        for protocol in [1u8, 47, 50, 132] {
            for ihl in 0..=15u8 {
                let mut frame = Frame::https_reply();
                frame.protocol = protocol;
                frame.ihl = ihl;
                let bytes = frame.bytes();
                for len in 0..=bytes.len() {
                    let _ = observe_ingress(&SliceWindow(&bytes[..len]), &sink, || 0);
                }
            }
        }
        assert!(sink.take().is_empty());
    }

    #[test]
    fn well_formed_frames_emit_exactly_once() {
        for protocol in [6u8, 17] {
            for ihl in 5..=15u8 {
                let sink = Collect::default();
                let mut frame = Frame::https_reply();
                frame.protocol = protocol;
                frame.ihl = ihl;
                frame.src_port = 1024 + ihl as u16;
                let bytes = frame.bytes();

                observe_ingress(&SliceWindow(&bytes), &sink, || 7).unwrap();
                let events = sink.take();
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].protocol, protocol);
                assert_eq!(events[0].src_port, 1024 + ihl as u16);
            }
        }
    }
}
