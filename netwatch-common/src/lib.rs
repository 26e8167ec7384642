#![cfg_attr(not(any(test, feature = "userspace")), no_std)]

//! Types and hot-path logic shared by the kernel programs and the userspace
//! agent. Everything in here must build for the BPF target: no allocation,
//! no loops over packet-controlled counts, no unchecked indexing.

pub mod channel;
pub mod cursor;
pub mod drop;
pub mod event;
pub mod ingress;
pub mod layout;
pub mod registry;

pub use channel::EventSink;
pub use cursor::{ClassifyError, Classified, HeaderSource, SliceWindow};
pub use drop::{observe_drop, DropBuffer, DropSite};
pub use event::{Action, DecodeError, PacketEvent};
pub use ingress::observe_ingress;
pub use layout::DropHookLayout;
pub use registry::{InterfaceRegistry, MONITORED_IFS_CAPACITY};

pub const ETH_P_IPV4: u16 = 0x0800;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

#[cfg(feature = "userspace")]
mod userspace {
    use super::*;

    unsafe impl aya::Pod for PacketEvent {}
    unsafe impl aya::Pod for DropHookLayout {}
}
