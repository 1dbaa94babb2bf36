use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use pcap::{Activated, Capture, Error as PcapError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::{Frame, LinkType};

// libpcap DLT_* values
const DLT_NULL: i32 = 0;
const DLT_EN10MB: i32 = 1;
const DLT_RAW_BSD: i32 = 12;
const DLT_RAW_OPENBSD: i32 = 14;
const LINKTYPE_RAW: i32 = 101;
const DLT_LOOP: i32 = 108;
const DLT_LINUX_SLL: i32 = 113;
const LINKTYPE_IPV4: i32 = 228;

/// Read timeout for live captures; also how often the running flag is polled
const READ_TIMEOUT_MS: i32 = 500;

#[derive(Debug, Clone)]
pub enum CaptureSource {
    Live {
        iface: String,
        snaplen: i32,
        promisc: bool,
    },
    File(PathBuf),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureStats {
    pub frames: u64,
    pub errors: u64,
}

/// Owns the capture thread. Frames arrive on the receiver returned by [`start`].
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<CaptureStats>>,
}

impl CaptureHandle {
    /// Signal the capture thread and wait for it.
    ///
    /// Drop the frame receiver first, otherwise the thread may stay blocked
    /// on a full channel.
    pub fn stop(mut self) -> CaptureStats {
        self.running.store(false, Ordering::Relaxed);
        match self.thread.take().map(|handle| handle.join()) {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => {
                warn!("Capture thread panicked: {:?}", e);
                CaptureStats::default()
            }
            None => CaptureStats::default(),
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Open `source` and start pumping frames into a channel of `capacity`.
///
/// Opening happens on the caller's thread so a missing device or file is
/// reported immediately. The channel closes when the source is exhausted or
/// the handle is stopped.
pub fn start(source: CaptureSource, capacity: usize) -> Result<(CaptureHandle, mpsc::Receiver<Frame>)> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let running = Arc::new(AtomicBool::new(true));

    let thread = match source {
        CaptureSource::Live {
            iface,
            snaplen,
            promisc,
        } => {
            let capture = Capture::from_device(iface.as_str())
                .with_context(|| format!("Failed to find capture device: {}", iface))?
                .promisc(promisc)
                .snaplen(snaplen)
                .timeout(READ_TIMEOUT_MS)
                .immediate_mode(true)
                .open()
                .with_context(|| format!("Failed to open capture device: {}", iface))?;
            spawn_pump(capture, tx, running.clone())?
        }
        CaptureSource::File(path) => {
            let capture = Capture::from_file(&path)
                .with_context(|| format!("Failed to open PCAP file: {}", path.display()))?;
            spawn_pump(capture, tx, running.clone())?
        }
    };

    Ok((
        CaptureHandle {
            running,
            thread: Some(thread),
        },
        rx,
    ))
}

fn spawn_pump<T>(
    capture: Capture<T>,
    tx: mpsc::Sender<Frame>,
    running: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<CaptureStats>>
where
    T: Activated + Send + 'static,
{
    let datalink = capture.get_datalink();
    let link = link_type(datalink.0);
    if link == LinkType::Unsupported {
        warn!(
            "Unsupported link type {:?}; frames will carry no network layers",
            datalink
        );
    }
    debug!("Capture link type {:?} ({:?})", datalink, link);

    thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || pump(capture, link, tx, running))
        .map_err(|e| anyhow!("Failed to spawn capture thread: {}", e))
}

fn pump<T: Activated>(
    mut capture: Capture<T>,
    link: LinkType,
    tx: mpsc::Sender<Frame>,
    running: Arc<AtomicBool>,
) -> CaptureStats {
    let mut stats = CaptureStats::default();

    while running.load(Ordering::Relaxed) {
        let packet = match capture.next_packet() {
            Ok(packet) => packet,
            Err(PcapError::TimeoutExpired) => continue,
            Err(PcapError::NoMorePackets) => {
                info!("Capture source exhausted after {} frames", stats.frames);
                break;
            }
            Err(e) => {
                stats.errors += 1;
                warn!("Error reading packet #{}: {}", stats.frames + 1, e);
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        let timestamp = packet_time(packet.header.ts.tv_sec as i64, packet.header.ts.tv_usec as i64);
        let frame = Frame::from_link(link, packet.data, timestamp);

        if tx.blocking_send(frame).is_err() {
            debug!("Frame receiver closed, stopping capture");
            break;
        }
        stats.frames += 1;

        if stats.frames % 100_000 == 0 {
            debug!("Captured {} frames", stats.frames);
        }
    }

    stats
}

fn link_type(dlt: i32) -> LinkType {
    match dlt {
        DLT_EN10MB => LinkType::Ethernet,
        DLT_LINUX_SLL => LinkType::LinuxSll,
        DLT_NULL | DLT_LOOP => LinkType::Loopback,
        DLT_RAW_BSD | DLT_RAW_OPENBSD | LINKTYPE_RAW | LINKTYPE_IPV4 => LinkType::RawIpv4,
        _ => LinkType::Unsupported,
    }
}

fn packet_time(secs: i64, micros: i64) -> DateTime<Utc> {
    let nanos = (micros.clamp(0, 999_999) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}
