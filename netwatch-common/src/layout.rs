/// Where the drop observer finds its inputs: offsets into the
/// `skb/kfree_skb` tracepoint record and into `struct sk_buff`.
///
/// The kernel object carries [`DropHookLayout::DEFAULT`]; the loader
/// overwrites it with values resolved for the running kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct DropHookLayout {
    pub tp_skbaddr: u32,
    pub tp_protocol: u32,
    pub tp_reason: u32,
    pub skb_len: u32,
    pub skb_iif: u32,
    pub skb_transport_header: u32,
    pub skb_network_header: u32,
    pub skb_head: u32,
}

impl DropHookLayout {
    /// 6.6, x86_64.
    pub const DEFAULT: DropHookLayout = DropHookLayout {
        tp_skbaddr: 8,
        tp_protocol: 24,
        tp_reason: 28,
        skb_len: 112,
        skb_iif: 148,
        skb_transport_header: 182,
        skb_network_header: 184,
        skb_head: 200,
    };
}

impl Default for DropHookLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}
