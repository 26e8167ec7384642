use std::{
    borrow::Cow,
    collections::BTreeMap,
    io::Write,
    net::{Ipv4Addr, SocketAddrV4},
};

use metrics::counter;
use netwatch_common::{Action, PacketEvent, IPPROTO_TCP, IPPROTO_UDP};
use serde::Serialize;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, warn};

use crate::{
    clock::WallClock,
    reasons::{DropCategory, DropReasons},
};

pub trait EventExt {
    fn source(&self) -> SocketAddrV4;
    fn destination(&self) -> SocketAddrV4;
    fn protocol_name(&self) -> &'static str;
}

impl EventExt for PacketEvent {
    fn source(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.src_octets()), self.src_port)
    }

    fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.dst_octets()), self.dst_port)
    }

    fn protocol_name(&self) -> &'static str {
        match self.protocol {
            IPPROTO_TCP => "tcp",
            IPPROTO_UDP => "udp",
            _ => "other",
        }
    }
}

/// One event as printed with `--json`.
#[derive(Debug, Serialize)]
pub struct EventRecord<'a> {
    pub action: &'static str,
    pub protocol: &'static str,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub pkt_len: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Cow<'a, str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<DropCategory>,
    pub ktime_ns: u64,
    pub unix_ns: u64,
}

impl<'a> EventRecord<'a> {
    pub fn new(event: &PacketEvent, action: Action, reasons: &'a DropReasons, clock: &mut WallClock) -> Self {
        let dropped = action == Action::DropObserved;
        EventRecord {
            action: action.as_str(),
            protocol: event.protocol_name(),
            src: event.source(),
            dst: event.destination(),
            pkt_len: event.pkt_len,
            reason: dropped.then(|| reasons.name(event.drop_reason)),
            category: dropped.then(|| reasons.category(event.drop_reason)),
            ktime_ns: event.ktime_ns,
            unix_ns: clock.unix_ns(event.ktime_ns),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    pub passed: u64,
    pub dropped: u64,
    pub by_reason: BTreeMap<String, u64>,
    pub by_category: BTreeMap<DropCategory, u64>,
}

/// Sole consumer of the event channel.
pub struct Monitor {
    rx: Receiver<PacketEvent>,
    reasons: DropReasons,
    clock: WallClock,
    json: Option<Box<dyn Write + Send>>,
    stats: Stats,
}

impl Monitor {
    pub fn new(rx: Receiver<PacketEvent>, reasons: DropReasons, clock: WallClock) -> Self {
        Monitor {
            rx,
            reasons,
            clock,
            json: None,
            stats: Stats::default(),
        }
    }

    pub fn with_json(mut self, out: Box<dyn Write + Send>) -> Self {
        self.json = Some(out);
        self
    }

    /// Runs until every sender is gone.
    pub async fn run(mut self) -> Stats {
        while let Some(event) = self.rx.recv().await {
            self.observe(&event);
        }
        self.stats
    }

    fn observe(&mut self, event: &PacketEvent) {
        let action = match event.action() {
            Ok(action) => action,
            Err(e) => {
                counter!("netwatch_decode_errors_total").increment(1);
                warn!("discarding event: {}", e);
                return;
            }
        };
        let record = EventRecord::new(event, action, &self.reasons, &mut self.clock);
        counter!("netwatch_events_total", "action" => action.as_str()).increment(1);

        match (&record.reason, record.category) {
            (Some(reason), Some(category)) => {
                self.stats.dropped += 1;
                *self.stats.by_reason.entry(reason.to_string()).or_default() += 1;
                *self.stats.by_category.entry(category).or_default() += 1;
                counter!(
                    "netwatch_drops_total",
                    "reason" => reason.to_string(),
                    "category" => category.as_str()
                )
                .increment(1);
                debug!(
                    "drop {} {} -> {} len {} ({}, {})",
                    record.protocol,
                    record.src,
                    record.dst,
                    record.pkt_len,
                    reason,
                    category.as_str()
                );
            }
            _ => {
                self.stats.passed += 1;
                debug!(
                    "pass {} {} -> {} len {}",
                    record.protocol, record.src, record.dst, record.pkt_len
                );
            }
        }

        if let Some(out) = self.json.as_mut() {
            let written = serde_json::to_writer(&mut *out, &record)
                .map_err(std::io::Error::from)
                .and_then(|()| out.write_all(b"\n"));
            if let Err(e) = written {
                warn!("failed to write event, disabling JSON output: {}", e);
                self.json = None;
            }
        }
    }
}
