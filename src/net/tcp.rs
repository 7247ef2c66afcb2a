//! TCP connection state tracking: the RFC 793 state machine, RTT estimation,
//! and congestion control. The transition table is a pure function so it can
//! be tested exhaustively; [`TcpConnection`] wraps it with the control-block
//! bookkeeping (sequence numbers, windows, timers).

use rand::Rng;
use std::time::{Duration, Instant};

/// Maximum Segment Lifetime. TIME_WAIT lasts 2 * MSL.
pub const MSL: Duration = Duration::from_secs(120);

/// Maximum segment size used as the congestion-window unit.
pub const MSS: u32 = 1460;

const RTO_MIN: Duration = Duration::from_secs(1);
const RTO_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// Flag combinations the state machine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Syn,
    SynAck,
    Ack,
    Fin,
    /// FIN with a piggybacked ACK of our FIN.
    FinAck,
    Rst,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpEvent {
    PassiveOpen,
    ActiveOpen,
    Send,
    Receive(SegmentKind),
    Close,
    Abort,
    Timeout,
}

/// Outcome of applying an event in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Next {
        state: TcpState,
        segment: Option<SegmentKind>,
    },
    /// No transition defined: the segment is dropped and counted.
    Drop,
}

/// The RFC 793 transition table as a pure function.
pub fn transition(state: TcpState, event: TcpEvent) -> Transition {
    use SegmentKind::*;
    use TcpEvent::*;
    use TcpState::*;

    // A RST aborts from any state, and a local abort resets the peer when the
    // connection has been synchronized.
    if let Receive(Rst) = event {
        return next(Closed, None);
    }
    if let Abort = event {
        let rst = match state {
            Closed | Listen | SynSent => None,
            _ => Some(Rst),
        };
        return next(Closed, rst);
    }

    match (state, event) {
        (Closed, PassiveOpen) => next(Listen, None),
        (Closed, ActiveOpen) => next(SynSent, Some(Syn)),

        (Listen, Receive(Syn)) => next(SynReceived, Some(SynAck)),
        // SEND on a listening socket converts to an active open.
        (Listen, Send) => next(SynSent, Some(Syn)),
        (Listen, Close) => next(Closed, None),

        (SynSent, Receive(SynAck)) => next(Established, Some(Ack)),
        // Simultaneous open.
        (SynSent, Receive(Syn)) => next(SynReceived, Some(SynAck)),
        (SynSent, Close) => next(Closed, None),
        (SynSent, Timeout) => next(Closed, None),

        (SynReceived, Receive(Ack)) => next(Established, None),
        (SynReceived, Close) => next(FinWait1, Some(Fin)),
        (SynReceived, Timeout) => next(Closed, Some(Rst)),

        (Established, Send) => next(Established, Some(Data)),
        (Established, Receive(Data)) => next(Established, Some(Ack)),
        (Established, Receive(Ack)) => next(Established, None),
        (Established, Receive(Fin)) => next(CloseWait, Some(Ack)),
        (Established, Close) => next(FinWait1, Some(Fin)),

        (FinWait1, Receive(Ack)) => next(FinWait2, None),
        // Simultaneous close.
        (FinWait1, Receive(Fin)) => next(Closing, Some(Ack)),
        (FinWait1, Receive(FinAck)) => next(TimeWait, Some(Ack)),

        (FinWait2, Receive(Fin)) => next(TimeWait, Some(Ack)),
        (FinWait2, Receive(Data)) => next(FinWait2, Some(Ack)),

        (Closing, Receive(Ack)) => next(TimeWait, None),

        (CloseWait, Send) => next(CloseWait, Some(Data)),
        (CloseWait, Close) => next(LastAck, Some(Fin)),

        (LastAck, Receive(Ack)) => next(Closed, None),

        (TimeWait, Timeout) => next(Closed, None),

        _ => Transition::Drop,
    }
}

fn next(state: TcpState, segment: Option<SegmentKind>) -> Transition {
    Transition::Next { state, segment }
}

/// Smoothed RTT estimation per RFC 6298 (alpha = 1/8, beta = 1/4),
/// RTO = SRTT + 4 * RTTVAR clamped to [1s, 60s].
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: RTO_MIN,
        }
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, r: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(r);
                self.rttvar = r / 2;
            }
            Some(srtt) => {
                let delta = if srtt > r { srtt - r } else { r - srtt };
                // RTTVAR <- (1 - beta) * RTTVAR + beta * |SRTT - R|
                self.rttvar = self.rttvar * 3 / 4 + delta / 4;
                // SRTT <- (1 - alpha) * SRTT + alpha * R
                self.srtt = Some(srtt * 7 / 8 + r / 8);
            }
        }
        let srtt = self.srtt.unwrap();
        self.rto = (srtt + 4 * self.rttvar).clamp(RTO_MIN, RTO_MAX);
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }
}

/// Congestion control: slow start below ssthresh, additive increase above,
/// multiplicative decrease on loss. Window is tracked in MSS units.
#[derive(Debug, Clone)]
pub struct CongestionControl {
    /// Congestion window in MSS units. Never below 1.
    cwnd: u32,
    /// Slow-start threshold in MSS units.
    ssthresh: u32,
    /// Fractional accumulator for additive increase.
    increase_acc: u32,
    dup_acks: u32,
}

impl Default for CongestionControl {
    fn default() -> Self {
        Self {
            cwnd: 1,
            ssthresh: 64,
            increase_acc: 0,
            dup_acks: 0,
        }
    }
}

impl CongestionControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    /// A new (non-duplicate) ACK arrived.
    pub fn on_ack(&mut self) {
        self.dup_acks = 0;
        if self.cwnd < self.ssthresh {
            // Slow start: exponential growth, one MSS per ACK.
            self.cwnd += 1;
        } else {
            // Congestion avoidance: one MSS per cwnd worth of ACKs.
            self.increase_acc += 1;
            if self.increase_acc >= self.cwnd {
                self.increase_acc = 0;
                self.cwnd += 1;
            }
        }
    }

    /// A duplicate ACK arrived. Returns `true` when the triple-duplicate
    /// threshold fires (fast retransmit).
    pub fn on_dup_ack(&mut self) -> bool {
        self.dup_acks += 1;
        if self.dup_acks == 3 {
            self.ssthresh = (self.cwnd / 2).max(2);
            self.cwnd = self.ssthresh + 3;
            true
        } else {
            false
        }
    }

    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(2);
        self.cwnd = 1;
        self.increase_acc = 0;
        self.dup_acks = 0;
    }
}

/// Transmission control block.
#[derive(Debug)]
pub struct TcpConnection {
    state: TcpState,
    /// Initial send sequence number, chosen pseudo-randomly.
    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,
    snd_wnd: u32,
    rcv_wnd: u32,
    congestion: CongestionControl,
    rtt: RttEstimator,
    time_wait_entered: Option<Instant>,
    dropped_segments: u64,
}

impl TcpConnection {
    pub fn new() -> Self {
        let iss: u32 = rand::thread_rng().gen();
        Self {
            state: TcpState::Closed,
            iss,
            snd_una: iss,
            snd_nxt: iss,
            rcv_nxt: 0,
            snd_wnd: 65_535,
            rcv_wnd: 65_535,
            congestion: CongestionControl::new(),
            rtt: RttEstimator::new(),
            time_wait_entered: None,
            dropped_segments: 0,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn iss(&self) -> u32 {
        self.iss
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    pub fn rcv_wnd(&self) -> u32 {
        self.rcv_wnd
    }

    pub fn snd_wnd(&self) -> u32 {
        self.snd_wnd
    }

    pub fn congestion(&self) -> &CongestionControl {
        &self.congestion
    }

    pub fn congestion_mut(&mut self) -> &mut CongestionControl {
        &mut self.congestion
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn rtt_mut(&mut self) -> &mut RttEstimator {
        &mut self.rtt
    }

    pub fn dropped_segments(&self) -> u64 {
        self.dropped_segments
    }

    /// Apply an event; returns the outbound segment, if any.
    pub fn on_event(&mut self, event: TcpEvent) -> Option<SegmentKind> {
        match transition(self.state, event) {
            Transition::Next { state, segment } => {
                if state == TcpState::TimeWait && self.state != TcpState::TimeWait {
                    self.time_wait_entered = Some(Instant::now());
                }
                if let TcpEvent::Timeout = event {
                    if self.state != TcpState::TimeWait {
                        self.congestion.on_timeout();
                    }
                }
                self.state = state;
                match segment {
                    Some(SegmentKind::Syn) => self.snd_nxt = self.iss.wrapping_add(1),
                    Some(SegmentKind::Fin) | Some(SegmentKind::Data) => {
                        self.snd_nxt = self.snd_nxt.wrapping_add(1)
                    }
                    _ => {}
                }
                segment
            }
            Transition::Drop => {
                self.dropped_segments += 1;
                None
            }
        }
    }

    /// Record an acknowledged sequence number.
    pub fn on_ack_received(&mut self, ack: u32) {
        if ack.wrapping_sub(self.snd_una) as i32 > 0 {
            self.snd_una = ack;
            self.congestion.on_ack();
        } else {
            self.congestion.on_dup_ack();
        }
    }

    /// Whether the TIME_WAIT hold (2 * MSL) has expired at `now`.
    pub fn time_wait_expired(&self, now: Instant) -> bool {
        match (self.state, self.time_wait_entered) {
            (TcpState::TimeWait, Some(entered)) => now.duration_since(entered) >= 2 * MSL,
            _ => false,
        }
    }
}

impl Default for TcpConnection {
    fn default() -> Self {
        Self::new()
    }
}
