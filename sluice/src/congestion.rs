use std::time::{Duration, Instant};

const MIN_CWND: u32 = 2;
const MAX_BACKOFF: f64 = 8.0;
const BACKOFF_GROWTH: f64 = 1.5;

/// Admission verdict for a single inbound message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Admission {
    /// Process the message now.
    Admit,
    /// The congestion window is exhausted; retry after pending replies
    /// drain. No drop is recorded.
    Defer,
    /// Rate or queue limits exceeded; the message is dropped and the
    /// connection should be throttled.
    Drop,
}

/// Per connection AIMD state: a sliding rate window plus a congestion
/// window with slow start, congestion avoidance and loss backoff.
#[derive(Debug, Clone)]
pub struct CongestionControl {
    msgs_in_window: u32,
    window_start: Instant,
    queue_depth: u32,
    cwnd: u32,
    ssthresh: u32,
    acks_since_growth: u32,
    consecutive_drops: u32,
    backoff_factor: f64,
    in_slow_start: bool,
}

impl CongestionControl {
    pub fn new(ssthresh: u32, now: Instant) -> CongestionControl {
        CongestionControl {
            msgs_in_window: 0,
            window_start: now,
            queue_depth: 0,
            cwnd: 1,
            ssthresh,
            acks_since_growth: 0,
            consecutive_drops: 0,
            backoff_factor: 1.0,
            in_slow_start: true,
        }
    }

    /// Decide the fate of one inbound message.
    pub fn admit(
        &mut self,
        now: Instant,
        window: Duration,
        max_msgs: u32,
        max_depth: u32,
    ) -> Admission {
        if now.duration_since(self.window_start) >= window {
            self.reset_window(now);
        }

        if self.msgs_in_window >= max_msgs {
            self.record_drop();
            return Admission::Drop;
        }

        if self.queue_depth >= max_depth {
            self.record_drop();
            return Admission::Drop;
        }

        if self.queue_depth >= self.cwnd {
            return Admission::Defer;
        }

        self.msgs_in_window += 1;
        self.queue_depth += 1;
        self.consecutive_drops = 0;

        Admission::Admit
    }

    /// A message made it all the way out. Additive increase.
    pub fn on_ack(&mut self) {
        self.queue_depth = self.queue_depth.saturating_sub(1);

        if self.in_slow_start {
            self.cwnd += 1;
            if self.cwnd >= self.ssthresh {
                self.in_slow_start = false;
            }
        } else {
            self.acks_since_growth += 1;
            if self.acks_since_growth >= self.cwnd {
                self.cwnd += 1;
                self.acks_since_growth = 0;
            }
        }

        self.backoff_factor = 1.0;
    }

    /// A message was dropped. Multiplicative decrease.
    pub fn on_loss(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(MIN_CWND);
        self.cwnd = self.ssthresh;
        self.in_slow_start = false;
        self.acks_since_growth = 0;
        self.backoff_factor = (self.backoff_factor * BACKOFF_GROWTH).min(MAX_BACKOFF);
    }

    /// Restart the rate window. Also invoked when a throttled connection
    /// is released after its idle period.
    #[inline]
    pub fn reset_window(&mut self, now: Instant) {
        self.msgs_in_window = 0;
        self.window_start = now;
    }

    #[inline]
    fn record_drop(&mut self) {
        self.consecutive_drops += 1;
        self.on_loss();
    }

    #[inline]
    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    #[inline]
    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    #[inline]
    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }

    #[inline]
    pub fn consecutive_drops(&self) -> u32 {
        self.consecutive_drops
    }

    #[inline]
    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    #[inline]
    pub fn in_slow_start(&self) -> bool {
        self.in_slow_start
    }
}
