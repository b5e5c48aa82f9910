// Copyright (C) 2024, the quince authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::cmp;

use std::collections::BTreeMap;

use std::time::Duration;
use std::time::Instant;

use smallvec::SmallVec;

use crate::frame;
use crate::packet;
use crate::ranges;

use crate::Error;
use crate::Result;

/// The default RTT assumed before the first sample.
pub const INITIAL_RTT: Duration = Duration::from_millis(333);

/// Timer granularity.
const GRANULARITY: Duration = Duration::from_millis(1);

/// Packet reordering threshold before a packet is declared lost.
const PACKET_THRESHOLD: u64 = 3;

/// Time reordering threshold (9/8) applied to max(latest RTT, smoothed RTT).
const TIME_THRESHOLD_NUM: u32 = 9;
const TIME_THRESHOLD_DEN: u32 = 8;

/// A packet handed to the recovery machinery when it is sent.
#[derive(Debug)]
pub struct Sent {
    pub pkt_num: u64,

    pub frames: SmallVec<[frame::Frame; 1]>,

    pub time_sent: Instant,

    pub size: usize,

    pub ack_eliciting: bool,
}

/// Per-space bookkeeping of packets that were sent but not yet
/// acknowledged, plus the frames recovered from acked and lost packets.
#[derive(Default)]
pub struct InFlight {
    pub sent: BTreeMap<u64, Sent>,

    pub lost: Vec<frame::Frame>,

    pub acked: Vec<frame::Frame>,
}

/// Loss recovery state shared by all packet number spaces.
///
/// Times are always supplied by the caller; this module never reads a
/// clock of its own.
pub struct Recovery {
    flights: [InFlight; packet::Epoch::count()],

    loss_detection_timer: Option<Instant>,

    time_of_last_ack_eliciting_pkt: Option<Instant>,

    largest_sent_pkt: [Option<u64>; packet::Epoch::count()],

    largest_acked_pkt: [Option<u64>; packet::Epoch::count()],

    loss_time: [Option<Instant>; packet::Epoch::count()],

    pto_count: u32,

    /// Number of probe packets (PINGs) owed to the network.
    pub probes: usize,

    latest_rtt: Duration,

    smoothed_rtt: Option<Duration>,

    rttvar: Duration,

    min_rtt: Duration,

    /// The peer's max_ack_delay transport parameter.
    pub max_ack_delay: Duration,

    bytes_in_flight: usize,
}

impl Recovery {
    pub fn new() -> Recovery {
        Recovery {
            flights: Default::default(),

            loss_detection_timer: None,

            time_of_last_ack_eliciting_pkt: None,

            largest_sent_pkt: [None; packet::Epoch::count()],

            largest_acked_pkt: [None; packet::Epoch::count()],

            loss_time: [None; packet::Epoch::count()],

            pto_count: 0,

            probes: 0,

            latest_rtt: Duration::ZERO,

            smoothed_rtt: None,

            rttvar: INITIAL_RTT / 4,

            min_rtt: Duration::MAX,

            max_ack_delay: Duration::from_millis(25),

            bytes_in_flight: 0,
        }
    }

    /// Records a sent packet and re-arms the loss detection timer.
    pub fn on_packet_sent(
        &mut self, pkt: Sent, epoch: packet::Epoch, now: Instant,
        trace_id: &str,
    ) {
        let e = usize::from(epoch);

        let ack_eliciting = pkt.ack_eliciting;
        let size = pkt.size;

        self.largest_sent_pkt[e] =
            cmp::max(self.largest_sent_pkt[e], Some(pkt.pkt_num));

        self.flights[e].sent.insert(pkt.pkt_num, pkt);

        if ack_eliciting {
            self.time_of_last_ack_eliciting_pkt = Some(now);

            self.bytes_in_flight += size;

            self.set_loss_detection_timer();
        }

        trace!("{} {:?}", trace_id, self);
    }

    /// Processes an ACK frame received for the given space.
    pub fn on_ack_received(
        &mut self, ranges: &ranges::RangeSet, ack_delay: Duration,
        epoch: packet::Epoch, handshake_confirmed: bool, now: Instant,
        trace_id: &str,
    ) -> Result<()> {
        let e = usize::from(epoch);

        let largest_acked = ranges.last().ok_or(Error::InvalidAckRange)?;

        // An ACK for a packet that was never sent is a protocol violation.
        if Some(largest_acked) > self.largest_sent_pkt[e] {
            return Err(Error::InvalidAckRange);
        }

        self.largest_acked_pkt[e] =
            cmp::max(self.largest_acked_pkt[e], Some(largest_acked));

        // Update the RTT estimate off the largest newly acked packet.
        let rtt_sample = self.flights[e]
            .sent
            .get(&largest_acked)
            .filter(|pkt| pkt.ack_eliciting)
            .map(|pkt| now.duration_since(pkt.time_sent));

        if let Some(latest_rtt) = rtt_sample {
            self.update_rtt(latest_rtt, ack_delay, handshake_confirmed);
        }

        let mut newly_acked = false;

        for pn in ranges.flatten() {
            if let Some(mut pkt) = self.flights[e].sent.remove(&pn) {
                trace!("{} packet newly acked {}", trace_id, pn);

                if pkt.ack_eliciting {
                    self.bytes_in_flight =
                        self.bytes_in_flight.saturating_sub(pkt.size);
                }

                self.flights[e].acked.extend(pkt.frames.drain(..));

                newly_acked = true;
            }
        }

        if newly_acked {
            self.pto_count = 0;
        }

        self.detect_lost_packets(epoch, now, trace_id);

        self.set_loss_detection_timer();

        trace!("{} {:?}", trace_id, self);

        Ok(())
    }

    /// Handles an expired loss detection timer: either declares packets
    /// lost, or schedules probe packets.
    pub fn on_loss_detection_timeout(
        &mut self, handshake_confirmed: bool, now: Instant, trace_id: &str,
    ) {
        if let Some((_, epoch)) = self.earliest_loss_time() {
            self.detect_lost_packets(epoch, now, trace_id);

            self.set_loss_detection_timer();

            trace!("{} {:?}", trace_id, self);
            return;
        }

        self.pto_count += 1;

        if self.bytes_in_flight == 0 && !handshake_confirmed {
            // Nothing outstanding but the handshake may be deadlocked on a
            // lost flight; a single probe is enough to unstick it.
            self.probes = 1;
        } else {
            self.probes = 2;
        }

        self.set_loss_detection_timer();

        trace!("{} {:?}", trace_id, self);
    }

    /// The current loss detection deadline, if armed.
    pub fn loss_detection_timer(&self) -> Option<Instant> {
        self.loss_detection_timer
    }

    /// The probe timeout for the current RTT estimate, without backoff.
    pub fn pto(&self) -> Duration {
        let srtt = self.smoothed_rtt.unwrap_or(INITIAL_RTT);

        srtt + cmp::max(self.rttvar * 4, GRANULARITY) + self.max_ack_delay
    }

    pub fn rtt(&self) -> Duration {
        self.smoothed_rtt.unwrap_or(INITIAL_RTT)
    }

    /// Takes the frames recovered from acknowledged packets in the given
    /// space.
    pub fn take_acked(&mut self, epoch: packet::Epoch) -> Vec<frame::Frame> {
        std::mem::take(&mut self.flights[usize::from(epoch)].acked)
    }

    /// Takes the frames of packets declared lost in the given space, for
    /// retransmission by the caller.
    pub fn take_lost(&mut self, epoch: packet::Epoch) -> Vec<frame::Frame> {
        std::mem::take(&mut self.flights[usize::from(epoch)].lost)
    }

    pub fn has_lost(&self, epoch: packet::Epoch) -> bool {
        !self.flights[usize::from(epoch)].lost.is_empty()
    }

    /// Forgets all in-flight state of a dropped packet number space.
    /// Nothing from the space will ever be retransmitted.
    pub fn drop_unacked_data(&mut self, epoch: packet::Epoch) {
        let e = usize::from(epoch);

        for pkt in self.flights[e].sent.values() {
            if pkt.ack_eliciting {
                self.bytes_in_flight =
                    self.bytes_in_flight.saturating_sub(pkt.size);
            }
        }

        self.flights[e] = InFlight::default();

        self.loss_time[e] = None;

        self.set_loss_detection_timer();
    }

    fn update_rtt(
        &mut self, latest_rtt: Duration, mut ack_delay: Duration,
        handshake_confirmed: bool,
    ) {
        self.latest_rtt = latest_rtt;

        // min_rtt ignores acknowledgment delay.
        self.min_rtt = cmp::min(self.min_rtt, latest_rtt);

        match self.smoothed_rtt {
            None => {
                self.smoothed_rtt = Some(latest_rtt);
                self.rttvar = latest_rtt / 2;
            },

            Some(srtt) => {
                // Limit ack_delay by max_ack_delay once the handshake is
                // confirmed.
                if handshake_confirmed {
                    ack_delay = cmp::min(ack_delay, self.max_ack_delay);
                }

                // Adjust for acknowledgment delay if plausible.
                let adjusted_rtt = if latest_rtt >= self.min_rtt + ack_delay {
                    latest_rtt - ack_delay
                } else {
                    latest_rtt
                };

                let var_sample = if srtt > adjusted_rtt {
                    srtt - adjusted_rtt
                } else {
                    adjusted_rtt - srtt
                };

                self.rttvar = (self.rttvar * 3 + var_sample) / 4;

                self.smoothed_rtt = Some((srtt * 7 + adjusted_rtt) / 8);
            },
        }
    }

    fn detect_lost_packets(
        &mut self, epoch: packet::Epoch, now: Instant, trace_id: &str,
    ) {
        let e = usize::from(epoch);

        let largest_acked = match self.largest_acked_pkt[e] {
            Some(v) => v,
            None => return,
        };

        self.loss_time[e] = None;

        let loss_delay = cmp::max(
            cmp::max(self.latest_rtt, self.rtt()) * TIME_THRESHOLD_NUM /
                TIME_THRESHOLD_DEN,
            GRANULARITY,
        );

        let mut lost_pkt: Vec<u64> = Vec::new();

        for (_, unacked) in self.flights[e].sent.range(..=largest_acked) {
            let lost_by_reorder =
                unacked.pkt_num + PACKET_THRESHOLD <= largest_acked;

            let lost_by_time = now >= unacked.time_sent + loss_delay;

            if lost_by_reorder || lost_by_time {
                lost_pkt.push(unacked.pkt_num);
                continue;
            }

            let when_lost = unacked.time_sent + loss_delay;

            self.loss_time[e] = match self.loss_time[e] {
                Some(t) => Some(cmp::min(t, when_lost)),
                None => Some(when_lost),
            };
        }

        for pn in lost_pkt {
            let mut pkt = match self.flights[e].sent.remove(&pn) {
                Some(v) => v,
                None => continue,
            };

            trace!("{} packet declared lost {}", trace_id, pn);

            if pkt.ack_eliciting {
                self.bytes_in_flight =
                    self.bytes_in_flight.saturating_sub(pkt.size);
            }

            self.flights[e].lost.extend(pkt.frames.drain(..));
        }
    }

    fn earliest_loss_time(&self) -> Option<(Instant, packet::Epoch)> {
        let mut earliest = None;

        for epoch in packet::Epoch::epochs(0..packet::Epoch::count()) {
            if let Some(t) = self.loss_time[usize::from(epoch)] {
                earliest = match earliest {
                    Some((et, _)) if et <= t => earliest,
                    _ => Some((t, epoch)),
                };
            }
        }

        earliest
    }

    fn set_loss_detection_timer(&mut self) {
        if let Some((loss_time, _)) = self.earliest_loss_time() {
            self.loss_detection_timer = Some(loss_time);
            return;
        }

        if self.bytes_in_flight == 0 {
            self.loss_detection_timer = None;
            return;
        }

        // PTO with exponential backoff.
        let timeout = self.pto() * 2_u32.pow(self.pto_count);

        self.loss_detection_timer = self
            .time_of_last_ack_eliciting_pkt
            .map(|t| t + timeout);
    }
}

impl Default for Recovery {
    fn default() -> Recovery {
        Recovery::new()
    }
}

impl std::fmt::Debug for Recovery {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.loss_detection_timer {
            Some(v) => write!(f, "timer={v:?} ")?,
            None => write!(f, "timer=none ")?,
        };

        write!(f, "inflight={} ", self.bytes_in_flight)?;
        write!(f, "latest_rtt={:?} ", self.latest_rtt)?;
        write!(f, "srtt={:?} ", self.smoothed_rtt)?;
        write!(f, "rttvar={:?} ", self.rttvar)?;
        write!(f, "probes={} ", self.probes)?;

        Ok(())
    }
}
