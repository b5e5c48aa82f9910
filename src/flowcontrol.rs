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

/// Byte-level flow controller.
///
/// Tracks both directions of a flow control relationship: how much the
/// peer allows us to send (`tx_data`/`max_tx_data`), and how much we allow
/// the peer to send (`rx_data`/`max_rx_data`). One instance exists at
/// connection level and one per stream.
#[derive(Default, Debug)]
pub struct FlowControl {
    /// Total bytes sent towards the peer.
    tx_data: u64,

    /// Peer's limit on bytes we may send.
    max_tx_data: u64,

    /// Total bytes accepted from the peer.
    rx_data: u64,

    /// Bytes consumed by the application (or otherwise retired); the next
    /// limit offered to the peer is derived from this.
    rx_consumed: u64,

    /// Our current advertised limit on bytes the peer may send.
    max_rx_data: u64,

    /// The receive window used when advertising a new limit.
    window: u64,
}

impl FlowControl {
    pub fn new(max_rx_data: u64, max_tx_data: u64) -> Self {
        Self {
            max_rx_data,
            max_tx_data,
            window: max_rx_data,
            ..Default::default()
        }
    }

    /// Remaining bytes the peer is allowed to send us.
    pub fn cap_recv(&self) -> u64 {
        self.max_rx_data - self.rx_data
    }

    /// Remaining bytes we are allowed to send to the peer.
    pub fn cap_send(&self) -> u64 {
        self.max_tx_data.saturating_sub(self.tx_data)
    }

    /// Accounts for `len` bytes received from the peer. The caller must
    /// have checked `cap_recv()` first.
    pub fn add_rx(&mut self, len: u64) {
        self.rx_data += len;
    }

    /// Accounts for `len` bytes handed to the application, making the
    /// credit available for a future limit update.
    pub fn add_consumed(&mut self, len: u64) {
        self.rx_consumed = self.rx_consumed.saturating_add(len);
    }

    /// Accounts for `len` bytes sent to the peer.
    pub fn add_tx(&mut self, len: u64) {
        self.tx_data += len;
    }

    /// Raises the highest received offset. Used at stream level, where the
    /// limit applies to offsets rather than cumulative bytes.
    pub fn update_rx(&mut self, off: u64) {
        self.rx_data = std::cmp::max(self.rx_data, off);
    }

    /// Raises the highest sent offset. Used at stream level, where the
    /// limit applies to offsets rather than cumulative bytes.
    pub fn update_tx(&mut self, off: u64) {
        self.tx_data = std::cmp::max(self.tx_data, off);
    }

    /// Raises the peer-granted send limit. Lower values are ignored, the
    /// limit is strictly monotone.
    pub fn update_max_tx_data(&mut self, max: u64) {
        self.max_tx_data = std::cmp::max(self.max_tx_data, max);
    }

    /// Returns true if a new receive limit should be advertised.
    ///
    /// A new limit is offered once the remaining window falls below half of
    /// the configured window, so limits are not re-advertised for every
    /// consumed byte.
    pub fn should_update_max_rx_data(&self) -> bool {
        let available_window = self.max_rx_data - self.rx_consumed;

        available_window < self.window / 2
    }

    /// The limit value a MAX_DATA/MAX_STREAM_DATA frame should carry.
    pub fn max_rx_data_next(&self) -> u64 {
        self.rx_consumed.saturating_add(self.window)
    }

    /// Commits the limit returned by [`max_rx_data_next()`], once the
    /// corresponding frame has been scheduled.
    ///
    /// [`max_rx_data_next()`]: struct.FlowControl.html#method.max_rx_data_next
    pub fn commit_max_rx_data(&mut self) {
        self.max_rx_data = self.max_rx_data_next();
    }

    /// Current advertised receive limit.
    pub fn max_rx_data(&self) -> u64 {
        self.max_rx_data
    }

    /// Total bytes accepted from the peer so far.
    pub fn rx_data(&self) -> u64 {
        self.rx_data
    }

    /// Total bytes sent to the peer so far.
    pub fn tx_data(&self) -> u64 {
        self.tx_data
    }

    /// Peer-granted send limit.
    pub fn max_tx_data(&self) -> u64 {
        self.max_tx_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_accounting() {
        let mut fc = FlowControl::new(100, 0);

        assert_eq!(fc.cap_recv(), 100);

        fc.add_rx(40);
        assert_eq!(fc.cap_recv(), 60);
        assert_eq!(fc.rx_data(), 40);
    }

    #[test]
    fn send_accounting() {
        let mut fc = FlowControl::new(0, 50);

        assert_eq!(fc.cap_send(), 50);

        fc.add_tx(20);
        assert_eq!(fc.cap_send(), 30);

        // Limits never regress.
        fc.update_max_tx_data(10);
        assert_eq!(fc.max_tx_data(), 50);

        fc.update_max_tx_data(80);
        assert_eq!(fc.cap_send(), 60);
    }

    #[test]
    fn update_hysteresis() {
        let mut fc = FlowControl::new(100, 0);

        // Nothing consumed yet.
        assert!(!fc.should_update_max_rx_data());

        fc.add_rx(60);
        fc.add_consumed(60);

        // Remaining window is 40, less than half of 100.
        assert!(fc.should_update_max_rx_data());
        assert_eq!(fc.max_rx_data_next(), 160);

        fc.commit_max_rx_data();
        assert_eq!(fc.max_rx_data(), 160);
        assert!(!fc.should_update_max_rx_data());

        // Consuming a little more is not enough to trigger another update.
        fc.add_rx(10);
        fc.add_consumed(10);
        assert!(!fc.should_update_max_rx_data());
    }
}
