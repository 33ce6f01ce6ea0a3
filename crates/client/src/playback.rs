use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::info;
use webrtc::rtp::packet::Packet;

/// How often a surface reports what it has received.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Where the incoming video ends up. One surface per actuator group; all of
/// them receive the same packets.
pub(crate) trait PlaybackSurface: Send + Sync {
    fn name(&self) -> &str;

    fn present(&self, packet: &Packet);

    /// Freeze the surface until the next session attaches a track.
    fn pause(&self);

    fn resume(&self);
}

/// Deliver `packet` to every surface, untransformed.
pub(crate) fn fan_out(surfaces: &[std::sync::Arc<dyn PlaybackSurface>], packet: &Packet) {
    for surface in surfaces {
        surface.present(packet);
    }
}

/// Headless surface: counts what it would have shown and reports it
/// periodically.
pub(crate) struct PacketCounter {
    name: String,
    packets: AtomicU64,
    bytes: AtomicU64,
    paused: AtomicBool,
    last_report: std::sync::Mutex<Instant>,
}

impl PacketCounter {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            last_report: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl PlaybackSurface for PacketCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn present(&self, packet: &Packet) {
        if self.paused.load(Ordering::Relaxed) {
            return;
        }
        let packets = self.packets.fetch_add(1, Ordering::Relaxed) + 1;
        let bytes = self
            .bytes
            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed)
            + packet.payload.len() as u64;

        if packets == 1 {
            info!(surface = %self.name, "First video packet");
        }
        let mut last = self.last_report.lock().unwrap_or_else(|e| e.into_inner());
        if last.elapsed() >= REPORT_INTERVAL {
            info!(surface = %self.name, packets, bytes, "Playback heartbeat");
            *last = Instant::now();
        }
    }

    fn pause(&self) {
        if !self.paused.swap(true, Ordering::Relaxed) {
            info!(surface = %self.name, "Playback paused");
        }
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn packet(len: usize) -> Packet {
        Packet {
            payload: vec![0u8; len].into(),
            ..Default::default()
        }
    }

    #[test]
    fn fan_out_reaches_every_surface() {
        let gate = Arc::new(PacketCounter::new("gate-video"));
        let garage = Arc::new(PacketCounter::new("garage-video"));
        let surfaces: Vec<Arc<dyn PlaybackSurface>> = vec![gate.clone(), garage.clone()];

        fan_out(&surfaces, &packet(100));
        fan_out(&surfaces, &packet(50));

        for surface in [&gate, &garage] {
            assert_eq!(surface.packets(), 2);
            assert_eq!(surface.bytes(), 150);
        }
    }

    #[test]
    fn paused_surface_drops_packets_until_resumed() {
        let surface = PacketCounter::new("gate-video");
        surface.pause();
        surface.present(&packet(10));
        assert_eq!(surface.packets(), 0);

        surface.resume();
        surface.present(&packet(10));
        assert_eq!(surface.packets(), 1);
    }
}
