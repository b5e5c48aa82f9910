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

use std::collections::hash_map;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;

use crate::flowcontrol;
use crate::ranges;

use crate::Error;
use crate::Result;

/// Returns true if the stream was initiated by the local endpoint.
///
/// Bit 0 of the stream ID encodes the initiator: 0 for the client, 1 for
/// the server.
pub fn is_local(stream_id: u64, is_server: bool) -> bool {
    (stream_id & 0x1) == (is_server as u64)
}

/// Returns true if the stream is bidirectional.
pub fn is_bidi(stream_id: u64) -> bool {
    (stream_id & 0x2) == 0
}

/// Buffer holding stream data at a specific offset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeBuf {
    data: Vec<u8>,
    off: u64,
    fin: bool,
}

impl RangeBuf {
    pub fn from(buf: &[u8], off: u64, fin: bool) -> RangeBuf {
        RangeBuf {
            data: Vec::from(buf),
            off,
            fin,
        }
    }

    /// Returns whether `self` holds the final offset of the stream.
    pub fn fin(&self) -> bool {
        self.fin
    }

    /// Returns the starting offset of `self`.
    pub fn off(&self) -> u64 {
        self.off
    }

    /// Returns the offset one past the last byte of `self`.
    pub fn max_off(&self) -> u64 {
        self.off + self.len() as u64
    }

    /// Returns the length of `self`.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Splits the buffer at `at` bytes, keeping the head in `self` and
    /// returning the tail. The fin flag moves to the tail.
    pub fn split_off(&mut self, at: usize) -> RangeBuf {
        let tail = RangeBuf {
            data: self.data.split_off(at),
            off: self.off + at as u64,
            fin: self.fin,
        };

        self.fin = false;

        tail
    }

    /// Drops the first `count` bytes of the buffer.
    pub fn consume(&mut self, count: usize) {
        self.data.drain(..count);
        self.off += count as u64;
    }
}

impl std::ops::Deref for RangeBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

/// Receive-side stream buffer.
///
/// Data received from the peer is kept in a map of chunks ordered by start
/// offset. Only contiguous data, starting from the read cursor, can be
/// read out.
#[derive(Debug, Default)]
pub struct RecvBuf {
    /// Chunks not yet read by the application, keyed by start offset.
    data: BTreeMap<u64, RangeBuf>,

    /// The lowest offset not yet read by the application.
    off: u64,

    /// One past the highest offset received so far.
    len: u64,

    /// The final size of the stream, if known.
    fin_off: Option<u64>,

    /// The error code received via RESET_STREAM.
    error: Option<u64>,
}

impl RecvBuf {
    /// Inserts `buf` into the receive buffer, trimming data that was
    /// already received.
    pub fn write(&mut self, buf: RangeBuf) -> Result<()> {
        if let Some(fin_off) = self.fin_off {
            // The stream size is known, forbid data beyond that point.
            if buf.max_off() > fin_off {
                return Err(Error::FinalSize);
            }

            // The stream size is known, forbid changing it.
            if buf.fin() && fin_off != buf.max_off() {
                return Err(Error::FinalSize);
            }
        }

        // The stream's final size is lower than data already received.
        if buf.fin() && buf.max_off() < self.len {
            return Err(Error::FinalSize);
        }

        if buf.fin() {
            self.fin_off = Some(buf.max_off());
        }

        let mut pending = VecDeque::with_capacity(2);
        pending.push_back(buf);

        'next: while let Some(mut buf) = pending.pop_front() {
            // Data below the read cursor was already delivered.
            if buf.max_off() <= self.off {
                continue;
            }

            if buf.off() < self.off {
                buf = buf.split_off((self.off - buf.off()) as usize);
            }

            if buf.is_empty() && !buf.fin() {
                continue;
            }

            // Trim against every stored chunk the new one overlaps.
            for (_, stored) in self.data.range(..buf.max_off()) {
                if stored.max_off() <= buf.off() {
                    continue;
                }

                // Fully contained in an existing chunk.
                if buf.off() >= stored.off() &&
                    buf.max_off() <= stored.max_off()
                {
                    continue 'next;
                }

                // Head overlaps an existing chunk.
                if buf.off() >= stored.off() && buf.off() < stored.max_off() {
                    buf = buf.split_off((stored.max_off() - buf.off()) as usize);
                }

                // Tail overlaps an existing chunk.
                if buf.off() < stored.off() && buf.max_off() > stored.off() {
                    pending.push_back(
                        buf.split_off((stored.off() - buf.off()) as usize),
                    );
                }
            }

            self.len = cmp::max(self.len, buf.max_off());

            if !buf.is_empty() {
                self.data.insert(buf.off(), buf);
            }
        }

        Ok(())
    }

    /// Reads contiguous data from the read cursor into `out`.
    ///
    /// Returns the number of bytes read and whether the end of the stream
    /// was reached.
    pub fn emit(&mut self, out: &mut [u8]) -> Result<(usize, bool)> {
        // The stream was reset, surface the error code instead.
        if let Some(e) = self.error {
            return Err(Error::StreamReset(e));
        }

        if !self.ready() {
            return Err(Error::Done);
        }

        let mut len = 0;
        let mut cap = out.len();

        while cap > 0 && self.ready() {
            let mut entry = match self.data.first_entry() {
                Some(entry) => entry,
                None => break,
            };

            let buf = entry.get_mut();

            let buf_len = cmp::min(buf.len(), cap);

            out[len..len + buf_len].copy_from_slice(&buf[..buf_len]);

            self.off += buf_len as u64;

            len += buf_len;
            cap -= buf_len;

            if buf_len < buf.len() {
                buf.consume(buf_len);

                // Reached the output capacity.
                break;
            }

            entry.remove();
        }

        Ok((len, self.is_fin()))
    }

    /// Transitions the receive side into reset state.
    ///
    /// Returns the number of bytes between the highest received offset and
    /// the declared final size, which the caller must account against
    /// connection flow control.
    pub fn reset(&mut self, error_code: u64, final_size: u64) -> Result<u64> {
        // The stream size is known, forbid changing it.
        if let Some(fin_off) = self.fin_off {
            if fin_off != final_size {
                return Err(Error::FinalSize);
            }
        }

        // The stream's final size is lower than data already received.
        if final_size < self.len {
            return Err(Error::FinalSize);
        }

        let max_off_delta = final_size - self.len;

        if self.error.is_some() {
            return Ok(max_off_delta);
        }

        self.error = Some(error_code);

        self.fin_off = Some(final_size);
        self.len = final_size;
        self.off = final_size;

        self.data.clear();

        Ok(max_off_delta)
    }

    /// One past the highest offset received.
    pub fn max_off(&self) -> u64 {
        self.len
    }

    /// Returns true when the final size is known and everything up to it
    /// has been read.
    pub fn is_fin(&self) -> bool {
        self.fin_off == Some(self.off)
    }

    /// Returns true if the stream was reset by the peer and the error was
    /// not yet surfaced.
    pub fn is_reset(&self) -> bool {
        self.error.is_some()
    }

    /// Returns true if there is contiguous data at the read cursor.
    fn ready(&self) -> bool {
        match self.data.first_key_value() {
            Some((_, buf)) => buf.off() == self.off,
            None => false,
        }
    }
}

/// Send-side stream buffer.
///
/// Data waiting to be (re)transmitted is kept as chunks ordered by start
/// offset. Retransmissions are pushed back at their original offset, so
/// the buffer can temporarily hold gaps.
#[derive(Debug, Default)]
pub struct SendBuf {
    /// Chunks waiting to be sent, ordered by start offset.
    data: VecDeque<RangeBuf>,

    /// One past the highest offset ever buffered.
    off: u64,

    /// The final size of the stream, if the application shut the side.
    fin_off: Option<u64>,

    /// Whether a frame carrying the fin flag was emitted.
    fin_emitted: bool,

    /// Whether the frame carrying the fin flag was acknowledged. Only
    /// meaningful for empty streams, longer streams complete through
    /// `acked` coverage.
    fin_acked: bool,

    /// Offsets acknowledged by the peer.
    acked: ranges::RangeSet,

    /// The error code received via STOP_SENDING.
    stopped: Option<u64>,
}

impl SendBuf {
    /// Appends application data at the end of the buffer.
    pub fn write(&mut self, data: &[u8], fin: bool) -> Result<usize> {
        if let Some(e) = self.stopped {
            return Err(Error::StreamStopped(e));
        }

        if let Some(fin_off) = self.fin_off {
            // Can't write past the final offset, or unset it.
            if self.off + data.len() as u64 > fin_off || !fin {
                return Err(Error::FinalSize);
            }
        }

        if fin {
            self.fin_off = Some(self.off + data.len() as u64);
        }

        if !data.is_empty() || fin {
            let buf = RangeBuf::from(data, self.off, fin);
            self.off = buf.max_off();
            self.insert(buf);
        }

        Ok(data.len())
    }

    /// Re-buffers data at its original offset, for retransmission.
    pub fn push(&mut self, data: &[u8], off: u64, fin: bool) {
        self.insert(RangeBuf::from(data, off, fin));
    }

    fn insert(&mut self, buf: RangeBuf) {
        let pos = self
            .data
            .iter()
            .position(|b| b.off() > buf.off())
            .unwrap_or(self.data.len());

        self.data.insert(pos, buf);
    }

    /// Pops the next contiguous run of data, limited to `max_len` bytes
    /// and to offsets below `max_off`.
    pub fn emit(&mut self, max_len: usize, max_off: u64) -> RangeBuf {
        let mut out = RangeBuf::default();

        let mut cap = max_len;

        loop {
            let front = match self.data.front() {
                Some(b) => b,
                None => break,
            };

            // Only contiguous data can go into a single frame.
            if !out.is_empty() && front.off() != out.max_off() {
                break;
            }

            // An empty fin-carrying chunk consumes neither bytes nor flow
            // control credit, so it bypasses both limits.
            let is_empty_fin = front.is_empty() && front.fin();

            if (cap == 0 || front.off() >= max_off) && !is_empty_fin {
                break;
            }

            let mut buf = match self.data.pop_front() {
                Some(b) => b,
                None => break,
            };

            let allowed =
                cmp::min(cap as u64, max_off.saturating_sub(buf.off()))
                    as usize;

            if buf.len() > allowed {
                let tail = buf.split_off(allowed);
                self.data.push_front(tail);
            }

            if out.is_empty() {
                out.off = buf.off();
            }

            cap -= buf.len();

            out.fin = out.fin || buf.fin();

            out.data.extend_from_slice(&buf);

            if out.fin {
                break;
            }
        }

        if out.fin {
            self.fin_emitted = true;
        }

        out
    }

    /// Marks the given range as acknowledged by the peer.
    pub fn ack(&mut self, off: u64, len: usize) {
        if len == 0 {
            if self.fin_emitted && self.fin_off == Some(off) {
                self.fin_acked = true;
            }

            return;
        }

        self.acked.insert(off..off + len as u64);
    }

    /// Rejects new writes with the given error code. Buffered data is kept
    /// so in-flight ranges can still be retransmitted.
    pub fn stop(&mut self, error_code: u64) {
        if self.stopped.is_none() {
            self.stopped = Some(error_code);
        }
    }

    /// The lowest offset that still has data waiting to be sent.
    pub fn off_front(&self) -> u64 {
        match self.data.front() {
            Some(b) => b.off(),
            None => self.off,
        }
    }

    /// Returns true if there is anything waiting to be sent.
    pub fn ready(&self) -> bool {
        !self.data.is_empty()
    }

    /// Returns true once the whole stream, including its fin, was
    /// acknowledged by the peer.
    pub fn is_complete(&self) -> bool {
        match self.fin_off {
            Some(0) => self.fin_emitted && self.fin_acked,

            Some(fin_off) =>
                self.fin_emitted &&
                    (self.acked == (0..fin_off) || self.fin_acked),

            None => false,
        }
    }
}

/// A bidirectional or unidirectional QUIC stream.
pub struct Stream {
    /// Receive-side buffer.
    pub recv: RecvBuf,

    /// Send-side buffer.
    pub send: SendBuf,

    /// Stream-level flow controller.
    pub flow: flowcontrol::FlowControl,

    /// Whether the stream was created by the local endpoint.
    pub local: bool,

    /// Whether the stream is bidirectional.
    pub bidi: bool,

    /// Whether a MAX_STREAM_DATA frame should be sent for this stream.
    pub update_max_stream_data: bool,
}

impl Stream {
    pub fn new(max_rx_data: u64, max_tx_data: u64, local: bool, bidi: bool) -> Stream {
        Stream {
            recv: RecvBuf::default(),
            send: SendBuf::default(),
            flow: flowcontrol::FlowControl::new(max_rx_data, max_tx_data),
            local,
            bidi,
            update_max_stream_data: false,
        }
    }

    /// Buffers data received from the peer, enforcing the stream-level
    /// flow control limit.
    pub fn recv_push(&mut self, buf: RangeBuf) -> Result<()> {
        if buf.max_off() > self.flow.max_rx_data() {
            return Err(Error::FlowControl);
        }

        self.flow.update_rx(buf.max_off());

        self.recv.write(buf)
    }

    /// Reads contiguous data for the application, releasing stream-level
    /// flow control credit.
    pub fn recv_pop(&mut self, out: &mut [u8]) -> Result<(usize, bool)> {
        let (len, fin) = self.recv.emit(out)?;

        self.flow.add_consumed(len as u64);

        if !fin && self.flow.should_update_max_rx_data() {
            self.update_max_stream_data = true;
        }

        Ok((len, fin))
    }

    /// Buffers application data for sending.
    pub fn send_push(&mut self, data: &[u8], fin: bool) -> Result<usize> {
        self.send.write(data, fin)
    }

    /// Pops up to `max_len` bytes of sendable data, limited by the
    /// stream-level send credit.
    pub fn send_pop(&mut self, max_len: usize) -> RangeBuf {
        let buf = self.send.emit(max_len, self.flow.max_tx_data());

        self.flow.update_tx(buf.max_off());

        buf
    }

    /// Returns true if the stream has data (or a pending reset error)
    /// ready for the application.
    pub fn is_readable(&self) -> bool {
        self.recv.is_reset() || self.recv.ready()
    }

    /// Returns true if there is data that could go into a STREAM frame
    /// right now, within the stream-level flow control limit.
    pub fn is_flushable(&self) -> bool {
        self.send.ready() &&
            (self.send.off_front() < self.flow.max_tx_data() ||
                self.send_has_fin_only())
    }

    fn send_has_fin_only(&self) -> bool {
        self.send.fin_off == Some(self.send.off_front())
    }

    /// Returns true once every sent byte, including the fin, was
    /// acknowledged.
    pub fn is_complete(&self) -> bool {
        self.send.is_complete()
    }
}

/// Keeps track of QUIC streams and the stream-count limits in both
/// directions.
#[derive(Default)]
pub struct StreamMap {
    /// All open streams, by stream ID.
    streams: HashMap<u64, Stream>,

    /// Number of peer-initiated streams we allow.
    local_max_streams_bidi: u64,
    local_max_streams_uni: u64,

    /// Number of locally-initiated streams the peer allows.
    peer_max_streams_bidi: u64,
    peer_max_streams_uni: u64,

    /// Highest stream sequence opened so far, per type.
    opened_local_bidi: u64,
    opened_local_uni: u64,
    opened_peer_bidi: u64,
    opened_peer_uni: u64,
}

impl StreamMap {
    pub fn new(max_streams_bidi: u64, max_streams_uni: u64) -> StreamMap {
        StreamMap {
            local_max_streams_bidi: max_streams_bidi,
            local_max_streams_uni: max_streams_uni,
            ..StreamMap::default()
        }
    }

    pub fn get(&self, id: u64) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Creates a stream, enforcing the stream-count limit that applies to
    /// its initiator.
    pub fn create(
        &mut self, id: u64, local: bool, bidi: bool, max_rx_data: u64,
        max_tx_data: u64,
    ) -> Result<&mut Stream> {
        let seq = (id >> 2) + 1;

        let (opened, max) = match (local, bidi) {
            (true, true) =>
                (&mut self.opened_local_bidi, self.peer_max_streams_bidi),
            (true, false) =>
                (&mut self.opened_local_uni, self.peer_max_streams_uni),
            (false, true) =>
                (&mut self.opened_peer_bidi, self.local_max_streams_bidi),
            (false, false) =>
                (&mut self.opened_peer_uni, self.local_max_streams_uni),
        };

        if seq > max {
            return Err(Error::StreamLimit);
        }

        *opened = cmp::max(*opened, seq);

        let stream = self
            .streams
            .entry(id)
            .or_insert_with(|| Stream::new(max_rx_data, max_tx_data, local, bidi));

        Ok(stream)
    }

    /// Raises the number of bidirectional streams the peer lets us open.
    pub fn update_peer_max_streams_bidi(&mut self, v: u64) {
        self.peer_max_streams_bidi = cmp::max(self.peer_max_streams_bidi, v);
    }

    /// Raises the number of unidirectional streams the peer lets us open.
    pub fn update_peer_max_streams_uni(&mut self, v: u64) {
        self.peer_max_streams_uni = cmp::max(self.peer_max_streams_uni, v);
    }

    /// Returns true if any stream has data ready to go out.
    pub fn has_flushable(&self) -> bool {
        self.streams.values().any(|s| s.is_flushable())
    }

    pub fn iter_mut(&mut self) -> hash_map::IterMut<u64, Stream> {
        self.streams.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_read() {
        let mut recv = RecvBuf::default();

        let mut buf = [0; 32];
        assert_eq!(recv.emit(&mut buf), Err(Error::Done));
    }

    #[test]
    fn ordered_read() {
        let mut recv = RecvBuf::default();

        let mut buf = [0; 32];

        recv.write(RangeBuf::from(b"hello", 0, false)).unwrap();
        recv.write(RangeBuf::from(b"world", 5, false)).unwrap();
        recv.write(RangeBuf::from(b"!", 10, true)).unwrap();

        let (len, fin) = recv.emit(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"helloworld!");
        assert!(fin);
    }

    #[test]
    fn out_of_order_read() {
        let mut recv = RecvBuf::default();

        let mut buf = [0; 32];

        recv.write(RangeBuf::from(b"world", 5, false)).unwrap();

        // Nothing is contiguous yet.
        assert_eq!(recv.emit(&mut buf), Err(Error::Done));

        recv.write(RangeBuf::from(b"hello", 0, false)).unwrap();

        let (len, fin) = recv.emit(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"helloworld");
        assert!(!fin);
    }

    #[test]
    fn duplicate_and_overlapping_read() {
        let mut recv = RecvBuf::default();

        let mut buf = [0; 32];

        recv.write(RangeBuf::from(b"something", 0, false)).unwrap();

        // Full duplicate.
        recv.write(RangeBuf::from(b"something", 0, false)).unwrap();

        // Overlapping tail.
        recv.write(RangeBuf::from(b"thingelse", 4, false)).unwrap();

        let (len, _) = recv.emit(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"somethingelse");
    }

    #[test]
    fn partial_read_then_more() {
        let mut recv = RecvBuf::default();

        recv.write(RangeBuf::from(b"helloworld", 0, false)).unwrap();

        let mut small = [0; 5];
        let (len, fin) = recv.emit(&mut small).unwrap();
        assert_eq!(&small[..len], b"hello");
        assert!(!fin);

        let mut rest = [0; 16];
        let (len, _) = recv.emit(&mut rest).unwrap();
        assert_eq!(&rest[..len], b"world");
    }

    #[test]
    fn fin_size_is_immutable() {
        let mut recv = RecvBuf::default();

        recv.write(RangeBuf::from(b"hello", 0, true)).unwrap();

        // Data beyond the final size.
        assert_eq!(
            recv.write(RangeBuf::from(b"x", 5, false)),
            Err(Error::FinalSize)
        );

        // A different final size.
        assert_eq!(
            recv.write(RangeBuf::from(b"hell", 0, true)),
            Err(Error::FinalSize)
        );
    }

    #[test]
    fn fin_below_received_data() {
        let mut recv = RecvBuf::default();

        recv.write(RangeBuf::from(b"helloworld", 0, false)).unwrap();

        assert_eq!(
            recv.write(RangeBuf::from(b"hello", 0, true)),
            Err(Error::FinalSize)
        );
    }

    #[test]
    fn reset_returns_unreceived_credit() {
        let mut recv = RecvBuf::default();

        recv.write(RangeBuf::from(&[0; 100], 0, false)).unwrap();

        // Final size below received data is an error.
        assert_eq!(recv.reset(42, 80), Err(Error::FinalSize));

        // Final size above received data returns the delta.
        assert_eq!(recv.reset(42, 150), Ok(50));
        assert!(recv.is_reset());

        let mut buf = [0; 16];
        assert_eq!(recv.emit(&mut buf), Err(Error::StreamReset(42)));
    }

    #[test]
    fn reset_after_fin_with_other_size() {
        let mut recv = RecvBuf::default();

        recv.write(RangeBuf::from(b"hello", 0, true)).unwrap();

        assert_eq!(recv.reset(42, 10), Err(Error::FinalSize));
        assert_eq!(recv.reset(42, 5), Ok(0));
    }

    #[test]
    fn send_emit_and_ack() {
        let mut send = SendBuf::default();

        send.write(b"helloworld", false).unwrap();

        let buf = send.emit(5, u64::MAX);
        assert_eq!(&buf[..], b"hello");
        assert_eq!(buf.off(), 0);
        assert!(!buf.fin());

        let buf = send.emit(100, u64::MAX);
        assert_eq!(&buf[..], b"world");
        assert_eq!(buf.off(), 5);

        send.write(b"", true).unwrap();

        let buf = send.emit(100, u64::MAX);
        assert!(buf.fin());
        assert_eq!(buf.off(), 10);

        assert!(!send.is_complete());

        send.ack(0, 5);
        send.ack(5, 5);
        send.ack(10, 0);

        assert!(send.is_complete());
    }

    #[test]
    fn send_respects_max_off() {
        let mut send = SendBuf::default();

        send.write(b"helloworld", false).unwrap();

        // Only 4 bytes of credit.
        let buf = send.emit(100, 4);
        assert_eq!(&buf[..], b"hell");

        // No more credit.
        let buf = send.emit(100, 4);
        assert!(buf.is_empty());

        let buf = send.emit(100, 100);
        assert_eq!(&buf[..], b"oworld");
    }

    #[test]
    fn send_retransmit_at_offset() {
        let mut send = SendBuf::default();

        send.write(b"helloworld", true).unwrap();

        let buf = send.emit(100, u64::MAX);
        assert_eq!(&buf[..], b"helloworld");
        assert!(buf.fin());

        // Nothing left.
        assert!(!send.ready());

        // The frame was lost, push the data back.
        send.push(b"helloworld", 0, true);

        let buf = send.emit(100, u64::MAX);
        assert_eq!(&buf[..], b"helloworld");
        assert_eq!(buf.off(), 0);
        assert!(buf.fin());
    }

    #[test]
    fn send_stopped() {
        let mut send = SendBuf::default();

        send.write(b"hello", false).unwrap();
        send.stop(99);

        assert_eq!(send.write(b"world", false), Err(Error::StreamStopped(99)));

        // Buffered data can still be emitted for retransmission.
        let buf = send.emit(100, u64::MAX);
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn send_fin_final_size() {
        let mut send = SendBuf::default();

        send.write(b"hello", true).unwrap();

        assert_eq!(send.write(b"more", false), Err(Error::FinalSize));
    }

    #[test]
    fn stream_flow_limits() {
        let mut stream = Stream::new(10, 10, false, true);

        assert_eq!(
            stream.recv_push(RangeBuf::from(&[0; 11], 0, false)),
            Err(Error::FlowControl)
        );

        stream.recv_push(RangeBuf::from(&[1; 10], 0, false)).unwrap();

        // Send side is capped at 10 bytes too.
        stream.send_push(&[2; 16], false).unwrap();

        let buf = stream.send_pop(100);
        assert_eq!(buf.len(), 10);

        let buf = stream.send_pop(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn stream_map_limits() {
        let mut map = StreamMap::new(1, 1);
        map.update_peer_max_streams_bidi(2);

        // Local bidi streams 0 and 4 are within the peer's limit of 2.
        assert!(map.create(0, true, true, 10, 10).is_ok());
        assert!(map.create(4, true, true, 10, 10).is_ok());

        // Stream 8 would be the third.
        assert_eq!(
            map.create(8, true, true, 10, 10).err(),
            Some(Error::StreamLimit)
        );

        // Peer-initiated bidi streams are capped by our limit of 1.
        assert!(map.create(1, false, true, 10, 10).is_ok());
        assert_eq!(
            map.create(5, false, true, 10, 10).err(),
            Some(Error::StreamLimit)
        );
    }

    #[test]
    fn stream_id_bits() {
        // Client-initiated bidi.
        assert!(is_local(0, false));
        assert!(!is_local(0, true));
        assert!(is_bidi(0));

        // Server-initiated bidi.
        assert!(is_local(1, true));
        assert!(is_bidi(1));

        // Client-initiated uni.
        assert!(!is_bidi(2));

        // Server-initiated uni.
        assert!(is_local(3, true));
        assert!(!is_bidi(3));
    }
}
