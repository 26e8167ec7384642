use aya::{
    maps::{
        perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer, Events},
        MapData,
    },
    util::online_cpus,
};
use bytes::BytesMut;
use metrics::counter;
use netwatch_common::{DecodeError, EventSink, PacketEvent};
use tokio::{task, task::JoinHandle};
use tracing::{error, warn};

use crate::{channel::EventChannel, error::Result};

const BUFFERS_PER_READ: usize = 16;

/// Starts one reader per online CPU, each forwarding into `channel`.
pub fn spawn_readers(
    perf: &mut AsyncPerfEventArray<MapData>,
    channel: EventChannel,
) -> Result<Vec<JoinHandle<()>>> {
    let cpus = online_cpus().map_err(|(_, e)| e)?;
    let mut readers = Vec::with_capacity(cpus.len());
    for cpu in cpus {
        let buf = perf.open(cpu, None)?;
        readers.push(task::spawn(event_loop(cpu, buf, channel.clone())));
    }
    Ok(readers)
}

async fn event_loop(cpu: u32, mut buf: AsyncPerfEventArrayBuffer<MapData>, channel: EventChannel) {
    let mut buffers = (0..BUFFERS_PER_READ)
        .map(|_| BytesMut::with_capacity(PacketEvent::LEN))
        .collect::<Vec<_>>();

    loop {
        let Events { read, lost } = match buf.read_events(&mut buffers).await {
            Ok(events) => events,
            Err(e) => {
                error!(cpu, "failed to read events from perf buffer: {}", e);
                continue;
            }
        };

        if lost > 0 {
            counter!("netwatch_perf_lost_total").increment(lost as u64);
            warn!(cpu, lost, "perf buffer lost events");
        }

        for raw in buffers.iter_mut().take(read) {
            if let Err(e) = dispatch(raw, &channel) {
                warn!(cpu, "discarding record: {}", e);
            }
            raw.clear();
        }
    }
}

/// Decodes one perf record and hands it to `sink`. Records with an
/// unknown action never reach the sink.
pub fn dispatch(raw: &[u8], sink: &impl EventSink) -> Result<(), DecodeError> {
    let decoded = PacketEvent::from_bytes(raw).and_then(|event| event.action().map(|_| event));
    match decoded {
        Ok(event) => {
            sink.emit(&event);
            Ok(())
        }
        Err(e) => {
            counter!("netwatch_decode_errors_total").increment(1);
            Err(e)
        }
    }
}
