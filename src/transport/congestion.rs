//! Congestion Control Implementation.
//!
//! Implements LEDBAT++ (delay-based, scavenger-class) congestion control:
//! the window grows while measured queuing delay stays below a fixed
//! target and shrinks multiplicatively once the path queue builds up, so
//! bulk transfers yield to latency-sensitive traffic sharing the
//! bottleneck.
//!
//! ## Key Elements
//!
//! - **Two-Tier Delay Filter**: a short moving window yields the current
//!   delay; 30-second sections contribute minima to a rolling log that
//!   yields the base delay
//! - **Congestion Window** (`cwnd`): byte budget steered by queuing delay
//!   (current minus base)
//! - **Rate-Cap Window** (`fwnd`): hard byterate ceiling derived from the
//!   current delay
//! - **Multi-Transfer Inflight Set**: segments keyed by (transfer id,
//!   sequence id) so one controller tracks every concurrent transfer to a
//!   peer

use std::collections::VecDeque;
use std::time::Instant;

use crate::transport::{
    CURRENT_DELAY_WINDOW, INITIAL_BASE_DELAY, MAX_BYTERATE, SECTION_LENGTH, SECTION_LOG,
    SEGMENT_OVERHEAD, TARGET_DELAY,
};

/// Identifies one in-flight segment.
///
/// The transfer id disambiguates sequence numbers of concurrent transfers
/// sharing a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeqId {
    /// Transfer slot the segment belongs to
    pub transfer: u8,
    /// Transfer-local sequence number
    pub seq: u16,
}

impl SeqId {
    /// Create a new segment id.
    pub fn new(transfer: u8, seq: u16) -> Self {
        Self { transfer, seq }
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    id: SeqId,
    sent_at: f32,
    byte_cost: usize,
}

/// Delay-based congestion controller.
///
/// All timestamps are single-precision seconds relative to construction,
/// taken from a monotonic clock.
pub struct CongestionController {
    max_segment_data_size: usize,
    started: Instant,

    /// Congestion window in bytes
    cwnd: f32,
    /// Rate-cap window in bytes
    fwnd: f32,
    /// Lowest delay retained by the section history
    base_delay: f32,

    /// Timepoint of the last window correction
    last_update: f32,
    recently_acked_data: i64,
    recently_lost_data: bool,
    recently_sent_bytes: i64,

    /// Most recent delay samples, arithmetic mean is the current delay
    delay_window: VecDeque<f32>,
    /// Current 30-second section: (timepoint, delay)
    section: VecDeque<(f32, f32)>,
    /// Minima of past sections
    section_minima: VecDeque<f32>,

    in_flight: VecDeque<InFlight>,
    in_flight_bytes: i64,
}

impl CongestionController {
    /// Create a controller for segments of at most `max_segment_data_size`
    /// payload bytes.
    pub fn new(max_segment_data_size: usize) -> Self {
        let mss = (max_segment_data_size + SEGMENT_OVERHEAD) as f32;

        Self {
            max_segment_data_size,
            started: Instant::now(),
            cwnd: 2.0 * mss,
            fwnd: 0.01 * MAX_BYTERATE,
            base_delay: INITIAL_BASE_DELAY,
            last_update: 0.0,
            recently_acked_data: 0,
            recently_lost_data: false,
            recently_sent_bytes: 0,
            delay_window: VecDeque::with_capacity(CURRENT_DELAY_WINDOW),
            section: VecDeque::new(),
            section_minima: VecDeque::with_capacity(SECTION_LOG),
            in_flight: VecDeque::new(),
            in_flight_bytes: 0,
        }
    }

    /// Total wire bytes of a full segment, payload plus fixed overhead.
    pub fn max_segment_size(&self) -> usize {
        self.max_segment_data_size + SEGMENT_OVERHEAD
    }

    /// Current congestion window in bytes.
    pub fn cwnd(&self) -> f32 {
        self.cwnd
    }

    /// Exact wire bytes currently unacknowledged.
    pub fn in_flight_bytes(&self) -> i64 {
        self.in_flight_bytes
    }

    /// How many bytes may be handed to the wire right now.
    ///
    /// An empty inflight set always admits one segment as a probe.
    /// Otherwise the free space under both windows is rounded up to a
    /// whole multiple of the segment size, or zero when less than one
    /// segment fits.
    pub fn can_send(&self) -> usize {
        let mss = self.max_segment_size();

        if self.in_flight.is_empty() {
            return mss;
        }

        let cspace = self.cwnd - self.in_flight_bytes as f32;
        if cspace < mss as f32 {
            return 0;
        }

        let fspace = self.fwnd - self.in_flight_bytes as f32;
        if fspace < mss as f32 {
            return 0;
        }

        (cspace.min(fspace) / mss as f32).ceil() as usize * mss
    }

    /// Segment ids sent longer than two current-delays ago and still
    /// unacknowledged.
    pub fn timeouts(&self) -> Vec<SeqId> {
        self.timeouts_at(self.time_now())
    }

    /// Record a freshly transmitted segment of `data_size` payload bytes.
    pub fn on_sent(&mut self, id: SeqId, data_size: usize) {
        let now = self.time_now();
        self.on_sent_at(id, data_size, now);
    }

    /// Process acknowledged segment ids.
    ///
    /// Ids not in the inflight set are duplicates or very late acks and
    /// are ignored.
    pub fn on_ack(&mut self, ids: &[SeqId]) {
        let now = self.time_now();
        self.on_ack_at(ids, now);
    }

    /// Signal a lost segment.
    ///
    /// With `discard` the segment will not be retransmitted and its record
    /// is dropped; otherwise the record stays until a later ack or loss
    /// resolves it.
    pub fn on_loss(&mut self, id: SeqId, discard: bool) {
        let now = self.time_now();
        self.on_loss_at(id, discard, now);
    }

    fn time_now(&self) -> f32 {
        self.started.elapsed().as_secs_f32()
    }

    fn on_sent_at(&mut self, id: SeqId, data_size: usize, now: f32) {
        debug_assert!(self.in_flight.iter().all(|f| f.id != id));

        let byte_cost = data_size + SEGMENT_OVERHEAD;
        self.in_flight.push_back(InFlight {
            id,
            sent_at: now,
            byte_cost,
        });
        self.in_flight_bytes += byte_cost as i64;
        self.recently_sent_bytes += byte_cost as i64;
    }

    fn on_ack_at(&mut self, ids: &[SeqId], now: f32) {
        let mut any_found = false;

        for id in ids {
            let Some(pos) = self.in_flight.iter().position(|f| f.id == *id) else {
                continue;
            };
            let Some(record) = self.in_flight.remove(pos) else {
                continue;
            };

            self.add_rtt_at(now - record.sent_at, now);
            self.in_flight_bytes -= record.byte_cost as i64;
            self.recently_acked_data += record.byte_cost as i64;
            debug_assert!(self.in_flight_bytes >= 0);
            any_found = true;
        }

        if any_found {
            self.update_windows_at(now);
        }
    }

    fn on_loss_at(&mut self, id: SeqId, discard: bool, now: f32) {
        let Some(pos) = self.in_flight.iter().position(|f| f.id == id) else {
            return;
        };

        self.recently_lost_data = true;

        if discard {
            if let Some(record) = self.in_flight.remove(pos) {
                self.in_flight_bytes -= record.byte_cost as i64;
                debug_assert!(self.in_flight_bytes >= 0);
            }
        }

        self.update_windows_at(now);
    }

    fn timeouts_at(&self, now: f32) -> Vec<SeqId> {
        let cutoff = now - 2.0 * self.current_delay();

        self.in_flight
            .iter()
            .filter(|f| f.sent_at < cutoff)
            .map(|f| f.id)
            .collect()
    }

    /// Moving average over the last few delay samples. Sensitive to
    /// bundled acks.
    fn current_delay(&self) -> f32 {
        if self.delay_window.is_empty() {
            return f32::INFINITY;
        }

        self.delay_window.iter().sum::<f32>() / self.delay_window.len() as f32
    }

    fn add_rtt_at(&mut self, delay: f32, now: f32) {
        self.base_delay = self.base_delay.min(delay);

        self.delay_window.push_back(delay);
        while self.delay_window.len() > CURRENT_DELAY_WINDOW {
            self.delay_window.pop_front();
        }

        self.section.push_back((now, delay));

        let oldest = self.section.front().map(|&(t, _)| t).unwrap_or(now);
        if now - oldest >= SECTION_LENGTH {
            let minimum = self
                .section
                .iter()
                .map(|&(_, d)| d)
                .fold(f32::INFINITY, f32::min);

            self.section_minima.push_back(minimum);
            self.section.clear();
            while self.section_minima.len() > SECTION_LOG {
                self.section_minima.pop_front();
            }

            self.base_delay = self
                .section_minima
                .iter()
                .copied()
                .fold(f32::INFINITY, f32::min);
        }
    }

    /// Window correction, rate-limited to once per current delay.
    fn update_windows_at(&mut self, now: f32) {
        let current_delay = self.current_delay();
        if now - self.last_update < current_delay {
            return;
        }

        let mss = self.max_segment_size() as f32;
        let queuing_delay = current_delay - self.base_delay;

        // balance the conservative algorithm a bit
        self.fwnd = MAX_BYTERATE * current_delay * 1.3;

        let floor = 2.0 * mss;
        let ceiling = self.fwnd.max(floor);

        let gain = (1.0 / 16f32.min((2.0 * TARGET_DELAY / self.base_delay).ceil()))
            * (self.recently_acked_data as f32 / 5.0);

        if self.recently_lost_data {
            self.cwnd = (self.cwnd / 2.0).clamp(floor, self.cwnd.max(floor));
        } else if queuing_delay < TARGET_DELAY {
            self.cwnd = (self.cwnd + gain).min(ceiling).max(floor);
        } else if queuing_delay > TARGET_DELAY {
            let decrease = 2.0 * self.cwnd * (queuing_delay / TARGET_DELAY - 1.0);
            // at most halve per correction
            let delta = (gain - decrease).max(-self.cwnd / 2.0);
            self.cwnd = (self.cwnd + delta).clamp(floor, ceiling);
        }

        tracing::trace!(
            cwnd = self.cwnd,
            fwnd = self.fwnd,
            current_delay,
            base_delay = self.base_delay,
            in_flight_bytes = self.in_flight_bytes,
            sent_since_update = self.recently_sent_bytes,
            "window update"
        );

        self.last_update = now;
        self.recently_acked_data = 0;
        self.recently_lost_data = false;
        self.recently_sent_bytes = 0;
    }
}
