use crate::{
    channel::EventSink,
    cursor::{classify_at, ClassifyError, HeaderSource},
    event::PacketEvent,
    registry::InterfaceRegistry,
    ETH_P_IPV4,
};

/// A discarded buffer as the drop hook exposes it.
///
/// Every accessor may fail: by the time the hook runs the memory behind the
/// buffer can already be reused.
pub trait DropBuffer {
    type Image: HeaderSource;

    fn ifindex(&self) -> Result<i32, ClassifyError>;
    fn network_header(&self) -> Result<u16, ClassifyError>;
    fn transport_header(&self) -> Result<u16, ClassifyError>;
    fn recorded_len(&self) -> Result<u32, ClassifyError>;
    /// The retained bytes the header offsets are relative to.
    fn image(&self) -> Result<Self::Image, ClassifyError>;
}

/// One invocation of the drop hook.
pub struct DropSite<B> {
    /// Link-level protocol recorded on the buffer, host order.
    pub protocol: u16,
    /// Opaque discard code, forwarded as-is.
    pub reason: u32,
    pub buffer: Option<B>,
}

/// Emits a drop event for an IPv4 TCP/UDP buffer received on a monitored
/// interface.
///
/// The protocol and registry filters run before anything is read from the
/// retained image.
#[inline(always)]
pub fn observe_drop<B, R, E, C>(
    site: &DropSite<B>,
    registry: &R,
    sink: &E,
    clock: C,
) -> Result<(), ClassifyError>
where
    B: DropBuffer,
    R: InterfaceRegistry,
    E: EventSink,
    C: FnOnce() -> u64,
{
    if site.protocol != ETH_P_IPV4 {
        return Err(ClassifyError::UnsupportedLinkType);
    }
    let buffer = site.buffer.as_ref().ok_or(ClassifyError::MissingBufferHandle)?;
    if !registry.contains(buffer.ifindex()?) {
        return Err(ClassifyError::NotMonitored);
    }

    let image = buffer.image()?;
    let network = buffer.network_header()? as usize;
    let transport = buffer.transport_header()? as usize;
    let len = buffer.recorded_len()?;

    let fields = classify_at(&image, network, transport)?;
    sink.emit(&PacketEvent::dropped(&fields, len, site.reason, clock()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::testing::Collect, cursor::testing::Frame, Action, SliceWindow};
    use std::cell::Cell;

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Field {
        Ifindex,
        Network,
        Transport,
        Len,
        Head,
        Bytes,
    }

    struct FakeImage {
        bytes: Vec<u8>,
        readable: bool,
    }

    impl HeaderSource for FakeImage {
        fn load<const N: usize>(&self, offset: usize) -> Result<[u8; N], ClassifyError> {
            if !self.readable {
                return Err(ClassifyError::DeferredReadFailure);
            }
            SliceWindow(&self.bytes).load(offset)
        }
    }

    struct FakeSkb {
        ifindex: i32,
        network: u16,
        transport: u16,
        len: u32,
        bytes: Vec<u8>,
        broken: Option<Field>,
        reads: Cell<usize>,
    }

    impl FakeSkb {
        /// The `Frame::https_reply` packet behind 16 bytes of link-layer
        /// headroom, received on ifindex 3.
        fn retained_on_if3() -> Self {
            let mut bytes = vec![0u8; 16];
            bytes.extend_from_slice(&Frame::https_reply().ip_bytes());
            FakeSkb {
                ifindex: 3,
                network: 16,
                transport: 36,
                len: 52,
                bytes,
                broken: None,
                reads: Cell::new(0),
            }
        }

        fn read<T>(&self, field: Field, value: T) -> Result<T, ClassifyError> {
            self.reads.set(self.reads.get() + 1);
            if self.broken == Some(field) {
                return Err(ClassifyError::DeferredReadFailure);
            }
            Ok(value)
        }
    }

    impl DropBuffer for FakeSkb {
        type Image = FakeImage;

        fn ifindex(&self) -> Result<i32, ClassifyError> {
            self.read(Field::Ifindex, self.ifindex)
        }

        fn network_header(&self) -> Result<u16, ClassifyError> {
            self.read(Field::Network, self.network)
        }

        fn transport_header(&self) -> Result<u16, ClassifyError> {
            self.read(Field::Transport, self.transport)
        }

        fn recorded_len(&self) -> Result<u32, ClassifyError> {
            self.read(Field::Len, self.len)
        }

        fn image(&self) -> Result<FakeImage, ClassifyError> {
            self.read(Field::Head, ())?;
            Ok(FakeImage {
                bytes: self.bytes.clone(),
                readable: self.broken != Some(Field::Bytes),
            })
        }
    }

    struct Registry(&'static [u32]);

    impl InterfaceRegistry for Registry {
        fn lookup(&self, ifindex: u32) -> bool {
            self.0.contains(&ifindex)
        }
    }

    fn site(skb: FakeSkb) -> DropSite<FakeSkb> {
        DropSite { protocol: ETH_P_IPV4, reason: 17, buffer: Some(skb) }
    }

    #[test]
    fn monitored_tcp_drop_emits_event() {
        let sink = Collect::default();
        let site = site(FakeSkb::retained_on_if3());

        observe_drop(&site, &Registry(&[3]), &sink, || 42).unwrap();

        let events = sink.take();
        assert_eq!(events.len(), 1);
        let ev = events[0];
        assert_eq!(ev.src_octets(), [10, 0, 0, 1]);
        assert_eq!(ev.dst_octets(), [10, 0, 0, 2]);
        assert_eq!((ev.src_port, ev.dst_port), (443, 51000));
        assert_eq!(ev.protocol, 6);
        assert_eq!(ev.action(), Ok(Action::DropObserved));
        assert_eq!(ev.drop_reason, 17);
        assert_eq!(ev.ktime_ns, 42);
    }

    #[test]
    fn pkt_len_is_recorded_buffer_length() {
        let sink = Collect::default();
        let mut skb = FakeSkb::retained_on_if3();
        skb.len = 40;

        observe_drop(&site(skb), &Registry(&[3]), &sink, || 0).unwrap();
        // The IP header still claims 60 bytes.
        assert_eq!(sink.take()[0].pkt_len, 40);
    }

    #[test]
    fn unmonitored_interface_is_filtered() {
        let sink = Collect::default();
        let mut skb = FakeSkb::retained_on_if3();
        skb.ifindex = 7;

        let result = observe_drop(&site(skb), &Registry(&[3]), &sink, || 0);
        assert_eq!(result, Err(ClassifyError::NotMonitored));
        assert!(sink.take().is_empty());
    }

    #[test]
    fn filters_run_before_any_header_read() {
        let sink = Collect::default();

        let mut non_ip = site(FakeSkb::retained_on_if3());
        non_ip.protocol = 0x0806;
        assert_eq!(
            observe_drop(&non_ip, &Registry(&[3]), &sink, || 0),
            Err(ClassifyError::UnsupportedLinkType)
        );
        assert_eq!(non_ip.buffer.as_ref().unwrap().reads.get(), 0);

        let unmonitored = site(FakeSkb::retained_on_if3());
        let _ = observe_drop(&unmonitored, &Registry(&[]), &sink, || 0);
        assert_eq!(unmonitored.buffer.as_ref().unwrap().reads.get(), 1);

        assert!(sink.take().is_empty());
    }

    #[test]
    fn missing_buffer_handle() {
        let sink = Collect::default();
        let site: DropSite<FakeSkb> = DropSite { protocol: ETH_P_IPV4, reason: 2, buffer: None };
        assert_eq!(
            observe_drop(&site, &Registry(&[3]), &sink, || 0),
            Err(ClassifyError::MissingBufferHandle)
        );
    }

    #[test]
    fn non_positive_ifindex_is_not_monitored() {
        let sink = Collect::default();
        for ifindex in [0, -1] {
            let mut skb = FakeSkb::retained_on_if3();
            skb.ifindex = ifindex;
            assert_eq!(
                observe_drop(&site(skb), &Registry(&[0, 3]), &sink, || 0),
                Err(ClassifyError::NotMonitored)
            );
        }
    }

    #[test]
    fn any_failed_read_suppresses_the_event() {
        let fields = [
            Field::Ifindex,
            Field::Network,
            Field::Transport,
            Field::Len,
            Field::Head,
            Field::Bytes,
        ];
        for field in fields {
            let sink = Collect::default();
            let mut skb = FakeSkb::retained_on_if3();
            skb.broken = Some(field);
            assert_eq!(
                observe_drop(&site(skb), &Registry(&[3]), &sink, || 0),
                Err(ClassifyError::DeferredReadFailure),
                "{field:?}"
            );
            assert!(sink.take().is_empty());
        }
    }

    #[test]
    fn offsets_past_the_image_are_short() {
        let sink = Collect::default();
        let mut skb = FakeSkb::retained_on_if3();
        skb.transport = u16::MAX;
        assert_eq!(
            observe_drop(&site(skb), &Registry(&[3]), &sink, || 0),
            Err(ClassifyError::ShortBuffer)
        );
    }

    #[test]
    fn short_ihl_is_malformed() {
        for version_ihl in [0x40, 0x43, 0x44] {
            let sink = Collect::default();
            let mut skb = FakeSkb::retained_on_if3();
            skb.bytes[16] = version_ihl;
            assert_eq!(
                observe_drop(&site(skb), &Registry(&[3]), &sink, || 0),
                Err(ClassifyError::MalformedNetworkHeader),
                "{version_ihl:#04x}"
            );
            assert!(sink.take().is_empty());
        }
    }

    #[test]
    fn emits_iff_all_conditions_hold() {
        for mask in 0u8..16 {
            let ipv4 = mask & 1 != 0;
            let monitored = mask & 2 != 0;
            let readable = mask & 4 != 0;
            let tcp_or_udp = mask & 8 != 0;

            let mut skb = FakeSkb::retained_on_if3();
            if !readable {
                skb.broken = Some(Field::Bytes);
            }
            if !tcp_or_udp {
                skb.bytes[16 + 9] = 1;
            }
            let mut site = site(skb);
            if !ipv4 {
                site.protocol = 0x86dd;
            }
            let registry = if monitored { Registry(&[3]) } else { Registry(&[4]) };

            let sink = Collect::default();
            let _ = observe_drop(&site, &registry, &sink, || 0);
            let expected = usize::from(ipv4 && monitored && readable && tcp_or_udp);
            assert_eq!(sink.take().len(), expected, "mask {mask:04b}");
        }
    }
}
