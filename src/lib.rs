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

//! 🍐 quince is a sans-I/O implementation of a QUIC version 1 connection.
//!
//! The [`Connection`] object is a pure state machine: the embedding
//! application feeds it datagrams received from the network with
//! [`recv()`], asks it for datagrams to transmit with [`send()`], and
//! drives its timers through [`timeout()`] and [`on_timeout()`]. The
//! library never touches sockets, clocks or threads on its own, which
//! makes it fully deterministic under test.
//!
//! The TLS 1.3 handshake engine is pluggable: the configuration carries a
//! boxed [`tls::Session`] which the connection drives, feeding it CRYPTO
//! bytes and installing the keys it emits.
//!
//! [`Connection`]: struct.Connection.html
//! [`recv()`]: struct.Connection.html#method.recv
//! [`send()`]: struct.Connection.html#method.send
//! [`timeout()`]: struct.Connection.html#method.timeout
//! [`on_timeout()`]: struct.Connection.html#method.on_timeout
//! [`tls::Session`]: tls/trait.Session.html

#[macro_use]
extern crate log;

use std::cmp;

use std::collections::VecDeque;

use std::sync::Arc;

use std::time::Duration;
use std::time::Instant;

use smallvec::SmallVec;

pub use crate::error::ConnectionError;
pub use crate::error::Error;
pub use crate::error::Result;

pub use crate::transport_params::TransportParams;

/// The current QUIC wire version.
pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

/// The maximum length of a connection ID.
pub const MAX_CONN_ID_LEN: usize = packet::MAX_CID_LEN;

/// The minimum length of datagrams holding a client's Initial packet.
pub const MIN_CLIENT_INITIAL_LEN: usize = 1200;

// The length a client picks for its own connection IDs.
const LOCAL_CONN_ID_LEN: usize = 16;

// The length of the payload length field in long headers, always encoded
// as a 2-byte varint.
const PAYLOAD_LENGTH_LEN: usize = 2;

// The minimum encrypted payload (packet number included) required for the
// header protection sample.
const PAYLOAD_MIN_LEN: usize = 4;

// The minimum room left in a datagram to coalesce another packet into it.
const COALESCE_MIN: usize = 96;

// The minimum and maximum sizes of a UDP datagram carrying QUIC packets.
const MIN_PKT_SIZE: usize = 1200;
const MAX_PKT_SIZE: usize = 65527;

fn version_supported(version: u32) -> bool {
    version == PROTOCOL_VERSION
}

/// A QUIC connection ID.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId<'a>(std::borrow::Cow<'a, [u8]>);

impl<'a> ConnectionId<'a> {
    /// Creates a connection ID borrowing the given slice.
    pub const fn from_ref(cid: &'a [u8]) -> Self {
        Self(std::borrow::Cow::Borrowed(cid))
    }

    /// Creates an owned connection ID from the given vector.
    pub const fn from_vec(cid: Vec<u8>) -> ConnectionId<'static> {
        ConnectionId(std::borrow::Cow::Owned(cid))
    }

    /// Converts the connection ID into an owned one.
    pub fn into_owned(self) -> ConnectionId<'static> {
        ConnectionId(std::borrow::Cow::Owned(self.0.into_owned()))
    }
}

impl Default for ConnectionId<'_> {
    fn default() -> Self {
        Self::from_vec(Vec::new())
    }
}

impl std::ops::Deref for ConnectionId<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for ConnectionId<'static> {
    fn from(v: Vec<u8>) -> Self {
        Self::from_vec(v)
    }
}

impl std::fmt::Debug for ConnectionId<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for c in self.as_ref() {
            write!(f, "{c:02x}")?;
        }

        Ok(())
    }
}

impl AsRef<[u8]> for ConnectionId<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    /// A first flight was sent or is being awaited.
    Attempted,

    /// The peer's address is validated, the handshake is in progress.
    Handshake,

    /// The handshake completed, application data flows.
    Active,

    /// The connection is being torn down; at most close packets leave.
    Draining,

    /// The connection is gone.
    Closed,
}

/// An application-visible connection event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Stream data (or a reset) is ready to be read.
    StreamReadable(u64),

    /// The peer reset the stream.
    StreamReset { stream_id: u64, error_code: u64 },

    /// The peer asked us to stop sending on the stream.
    StreamStopped { stream_id: u64, error_code: u64 },

    /// All data sent on the stream, including its fin, was acknowledged.
    StreamComplete(u64),

    /// The peer closed the connection.
    ConnectionClosed {
        is_app: bool,
        error_code: u64,
        reason: Vec<u8>,
    },
}

/// The kind of a [`LogEvent`].
///
/// [`LogEvent`]: struct.LogEvent.html
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogEventKind {
    PacketReceived,
    PacketSent,
    PacketDropped,
    FramesProcessed,
}

impl std::fmt::Display for LogEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            LogEventKind::PacketReceived => "packet_received",
            LogEventKind::PacketSent => "packet_sent",
            LogEventKind::PacketDropped => "packet_dropped",
            LogEventKind::FramesProcessed => "frames_processed",
        };

        write!(f, "{s}")
    }
}

/// A structured record of per-packet and per-frame activity, delivered to
/// the observer registered with [`Connection::on_log_event()`]. Formatting
/// and emission are the observer's concern.
///
/// [`Connection::on_log_event()`]: struct.Connection.html#method.on_log_event
#[derive(Clone, Debug)]
pub struct LogEvent {
    pub at: Instant,
    pub kind: LogEventKind,
    pub detail: String,
}

/// The time source used by a connection; defaults to [`Instant::now`].
///
/// [`Instant::now`]: https://doc.rust-lang.org/std/time/struct.Instant.html#method.now
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

/// Configuration shared by [`connect()`] and [`accept()`].
///
/// [`connect()`]: fn.connect.html
/// [`accept()`]: fn.accept.html
pub struct Config {
    version: u32,

    local_transport_params: TransportParams,

    tls_session: Option<Box<dyn tls::Session>>,

    clock: Clock,
}

impl Config {
    /// Creates a config object with the given version.
    pub fn new(version: u32) -> Result<Config> {
        if !version_supported(version) {
            return Err(Error::UnknownVersion);
        }

        Ok(Config {
            version,
            local_transport_params: TransportParams::default(),
            tls_session: None,
            clock: Arc::new(Instant::now),
        })
    }

    /// Installs the TLS session driven by the next connection created from
    /// this config. The session is consumed by that connection.
    pub fn set_tls_session(&mut self, session: Box<dyn tls::Session>) {
        self.tls_session = Some(session);
    }

    /// Overrides the clock used by the connection. Useful for tests.
    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    /// Sets the `initial_max_data` transport parameter.
    pub fn set_initial_max_data(&mut self, v: u64) {
        self.local_transport_params.initial_max_data = v;
    }

    /// Sets the `initial_max_stream_data_bidi_local` transport parameter.
    pub fn set_initial_max_stream_data_bidi_local(&mut self, v: u64) {
        self.local_transport_params
            .initial_max_stream_data_bidi_local = v;
    }

    /// Sets the `initial_max_stream_data_bidi_remote` transport parameter.
    pub fn set_initial_max_stream_data_bidi_remote(&mut self, v: u64) {
        self.local_transport_params
            .initial_max_stream_data_bidi_remote = v;
    }

    /// Sets the `initial_max_stream_data_uni` transport parameter.
    pub fn set_initial_max_stream_data_uni(&mut self, v: u64) {
        self.local_transport_params.initial_max_stream_data_uni = v;
    }

    /// Sets the `initial_max_streams_bidi` transport parameter.
    pub fn set_initial_max_streams_bidi(&mut self, v: u64) {
        self.local_transport_params.initial_max_streams_bidi = v;
    }

    /// Sets the `initial_max_streams_uni` transport parameter.
    pub fn set_initial_max_streams_uni(&mut self, v: u64) {
        self.local_transport_params.initial_max_streams_uni = v;
    }

    /// Sets the idle timeout in milliseconds. Zero disables it.
    pub fn set_max_idle_timeout(&mut self, v: u64) {
        self.local_transport_params.max_idle_timeout = v;
    }

    /// Sets the `max_udp_payload_size` transport parameter.
    pub fn set_max_udp_payload_size(&mut self, v: u64) {
        self.local_transport_params.max_udp_payload_size = v;
    }

    /// Sets the `ack_delay_exponent` transport parameter.
    pub fn set_ack_delay_exponent(&mut self, v: u64) {
        self.local_transport_params.ack_delay_exponent = v;
    }

    /// Sets the `max_ack_delay` transport parameter, in milliseconds.
    pub fn set_max_ack_delay(&mut self, v: u64) {
        self.local_transport_params.max_ack_delay = v;
    }

    /// Sets the `stateless_reset_token` transport parameter. Only sent by
    /// servers.
    pub fn set_stateless_reset_token(&mut self, token: [u8; 16]) {
        self.local_transport_params.stateless_reset_token = Some(token);
    }
}

/// Creates a new client-side connection.
pub fn connect(
    scid: &ConnectionId, config: &mut Config,
) -> Result<Connection> {
    Connection::new(scid, None, config, false)
}

/// Creates a new server-side connection.
///
/// The optional `odcid` parameter is the original destination connection
/// ID the client used before it was sent a Retry packet.
pub fn accept(
    scid: &ConnectionId, odcid: Option<&ConnectionId>, config: &mut Config,
) -> Result<Connection> {
    Connection::new(scid, odcid, config, true)
}

/// A QUIC connection.
pub struct Connection {
    /// QUIC wire version in use.
    version: u32,

    /// Whether this is a server-side connection.
    is_server: bool,

    /// Opaque ID used to key log lines.
    trace_id: String,

    /// Our connection ID.
    scid: ConnectionId<'static>,

    /// The peer's connection ID.
    dcid: ConnectionId<'static>,

    /// The destination connection ID of the very first client Initial,
    /// used to validate the matching transport parameter.
    odcid: Option<ConnectionId<'static>>,

    /// The source connection ID of the Retry packet, if one was received.
    rscid: Option<ConnectionId<'static>>,

    /// The address validation token to echo in Initial packets.
    token: Option<Vec<u8>>,

    /// Packet number spaces.
    pkt_num_spaces: [packet::PktNumSpace; packet::Epoch::count()],

    /// TLS handshake driver.
    handshake: tls::Handshake,

    /// Loss recovery state.
    recovery: recovery::Recovery,

    /// Connection-level flow controller.
    flow: flowcontrol::FlowControl,

    /// Open streams and stream-count limits.
    streams: stream::StreamMap,

    local_transport_params: TransportParams,

    peer_transport_params: TransportParams,

    state: State,

    /// Whether the peer's chosen connection ID was learned.
    got_peer_conn_id: bool,

    /// Whether a Retry was already performed.
    did_retry: bool,

    /// Whether version negotiation was already performed.
    did_version_negotiation: bool,

    /// Whether the Initial keys were derived.
    derived_initial_secrets: bool,

    /// Handshake confirmation: on the server this means HANDSHAKE_DONE was
    /// sent, on the client that it was received.
    handshake_confirmed: bool,

    /// Whether an ack-eliciting packet was sent since the last packet was
    /// received.
    ack_eliciting_sent: bool,

    /// Whether a connection-level MAX_DATA frame needs to be sent.
    update_max_data: bool,

    /// The CONNECTION_CLOSE to send to the peer, staged by `close()` or by
    /// a fatal protocol error.
    local_error: Option<ConnectionError>,

    /// The CONNECTION_CLOSE received from the peer.
    peer_error: Option<ConnectionError>,

    /// Idle timeout expiration time.
    idle_timer: Option<Instant>,

    /// Draining timeout expiration time.
    draining_timer: Option<Instant>,

    /// Pending application events.
    events: VecDeque<Event>,

    /// Observer for per-packet and per-frame log events.
    log_event_handler: Option<Box<dyn FnMut(LogEvent) + Send>>,

    clock: Clock,
}

impl Connection {
    fn new(
        scid: &ConnectionId, odcid: Option<&ConnectionId>,
        config: &mut Config, is_server: bool,
    ) -> Result<Connection> {
        if scid.len() > MAX_CONN_ID_LEN ||
            odcid.map_or(0, |c| c.len()) > MAX_CONN_ID_LEN
        {
            return Err(Error::InternalError);
        }

        let session = config.tls_session.take().ok_or(Error::InternalError)?;

        let scid = scid.clone().into_owned();

        let mut local_transport_params = config.local_transport_params.clone();
        local_transport_params.initial_source_connection_id =
            Some(scid.clone());

        let trace_id = format!("{scid:?}");

        let mut conn = Connection {
            version: config.version,

            is_server,

            trace_id,

            scid,

            dcid: ConnectionId::default(),

            odcid: None,

            rscid: None,

            token: None,

            pkt_num_spaces: Default::default(),

            handshake: tls::Handshake::new(session),

            recovery: recovery::Recovery::new(),

            flow: flowcontrol::FlowControl::new(
                config.local_transport_params.initial_max_data,
                0,
            ),

            streams: stream::StreamMap::new(
                config.local_transport_params.initial_max_streams_bidi,
                config.local_transport_params.initial_max_streams_uni,
            ),

            local_transport_params,

            peer_transport_params: TransportParams::default(),

            state: State::Attempted,

            got_peer_conn_id: false,

            did_retry: false,

            did_version_negotiation: false,

            derived_initial_secrets: false,

            handshake_confirmed: false,

            ack_eliciting_sent: false,

            update_max_data: false,

            local_error: None,

            peer_error: None,

            idle_timer: None,

            draining_timer: None,

            events: VecDeque::new(),

            log_event_handler: None,

            clock: config.clock.clone(),
        };

        if is_server {
            // The server echoes the pre-Retry destination CID so the
            // client can validate it.
            if let Some(odcid) = odcid {
                conn.odcid = Some(odcid.clone().into_owned());

                conn.local_transport_params
                    .original_destination_connection_id =
                    Some(odcid.clone().into_owned());

                conn.local_transport_params.retry_source_connection_id =
                    Some(conn.scid.clone());

                conn.did_retry = true;
            }
        } else {
            // Clients must not send a stateless reset token.
            conn.local_transport_params.stateless_reset_token = None;

            // The first flight is addressed to a random connection ID
            // until the server picks its own.
            let mut dcid = vec![0; LOCAL_CONN_ID_LEN];
            rand::rand_bytes(&mut dcid);

            conn.dcid = dcid.into();

            conn.derive_initial_key_material(&conn.dcid.to_vec())?;
        }

        conn.apply_local_transport_params()?;

        trace!(
            "{} connection created version={:x} server={}",
            conn.trace_id,
            conn.version,
            conn.is_server
        );

        Ok(conn)
    }

    /// Registers an observer for per-packet and per-frame log events.
    pub fn on_log_event(&mut self, handler: Box<dyn FnMut(LogEvent) + Send>) {
        self.log_event_handler = Some(handler);
    }

    /// Processes datagrams received from the peer.
    ///
    /// Coalesced packets are processed one at a time. On a fatal protocol
    /// error a CONNECTION_CLOSE is staged (to be flushed by [`send()`])
    /// and the error is returned. While draining the input is discarded.
    ///
    /// [`send()`]: struct.Connection.html#method.send
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let now = self.now();

        let mut done = 0;

        while done < buf.len() {
            if self.state >= State::Draining ||
                self.draining_timer.is_some() ||
                self.local_error.is_some()
            {
                // Discard everything while closing.
                done = buf.len();
                break;
            }

            let n = match self.recv_single(&mut buf[done..], now) {
                Ok(n) => n,

                Err(e) => {
                    self.close_on_error(e);
                    return Err(e);
                },
            };

            if n == 0 {
                break;
            }

            done += n;
        }

        self.check_timeout(now);

        Ok(done)
    }

    fn recv_single(&mut self, buf: &mut [u8], now: Instant) -> Result<usize> {
        let (hdr, hdr_len) = {
            let mut b = octets::Octets::with_slice(buf);
            let hdr = packet::Header::from_bytes(&mut b, self.scid.len())?;
            (hdr, b.off())
        };

        match hdr.ty {
            packet::Type::VersionNegotiation =>
                self.recv_version_negotiation(buf, &hdr, now),

            packet::Type::Retry => self.recv_retry(buf, &hdr, now),

            packet::Type::Initial => self.recv_initial(buf, hdr, hdr_len, now),

            packet::Type::ZeroRTT => {
                // 0-RTT is not supported; skip past the packet.
                self.log_packet(LogEventKind::PacketDropped, &hdr, now);

                let total = (|| {
                    let mut b = octets::Octets::with_slice(buf);
                    b.skip(hdr_len)?;
                    let payload_len = b.get_varint()? as usize;
                    Ok::<usize, Error>(b.off() + payload_len)
                })();

                match total {
                    Ok(total) if total <= buf.len() => Ok(total),

                    // Truncated, discard the rest of the datagram.
                    _ => Ok(buf.len()),
                }
            },

            packet::Type::Handshake => {
                if hdr.dcid != self.scid || hdr.scid != self.dcid {
                    trace!("{} dropped packet {:?}", self.trace_id, hdr);
                    self.log_packet(LogEventKind::PacketDropped, &hdr, now);
                    return Ok(buf.len());
                }

                self.recv_packet(
                    buf,
                    hdr,
                    hdr_len,
                    packet::Epoch::Handshake,
                    now,
                )
            },

            packet::Type::Short => {
                if hdr.dcid != self.scid {
                    trace!("{} dropped packet {:?}", self.trace_id, hdr);
                    self.log_packet(LogEventKind::PacketDropped, &hdr, now);
                    return Ok(buf.len());
                }

                self.recv_packet(
                    buf,
                    hdr,
                    hdr_len,
                    packet::Epoch::Application,
                    now,
                )
            },
        }
    }

    fn recv_version_negotiation(
        &mut self, buf: &[u8], hdr: &packet::Header, now: Instant,
    ) -> Result<usize> {
        // Version negotiation can only be initiated by servers, only once,
        // and only in response to our own first flight.
        if self.is_server ||
            self.did_version_negotiation ||
            self.state != State::Attempted ||
            hdr.dcid != self.scid ||
            hdr.scid != self.dcid
        {
            trace!("{} dropped packet {:?}", self.trace_id, hdr);
            self.log_packet(LogEventKind::PacketDropped, hdr, now);
            return Ok(buf.len());
        }

        let versions = hdr.versions.clone().unwrap_or_default();

        let version = match versions.iter().find(|v| version_supported(**v)) {
            Some(v) => *v,
            None => return Err(Error::UnknownVersion),
        };

        trace!("{} received packet {:?}", self.trace_id, hdr);
        self.log_packet(LogEventKind::PacketReceived, hdr, now);

        self.version = version;
        self.did_version_negotiation = true;

        // Restart the first flight under the chosen version.
        self.got_peer_conn_id = false;
        self.recovery.drop_unacked_data(packet::Epoch::Initial);
        self.pkt_num_spaces[usize::from(packet::Epoch::Initial)].clear();

        self.derive_initial_key_material(&self.dcid.to_vec())?;

        self.handshake.reset()?;
        self.apply_local_transport_params()?;

        Ok(buf.len())
    }

    fn recv_retry(
        &mut self, buf: &[u8], hdr: &packet::Header, now: Instant,
    ) -> Result<usize> {
        // Retry can only be sent by servers, only once, and must carry a
        // fresh source CID.
        if self.is_server ||
            self.did_retry ||
            self.state != State::Attempted ||
            hdr.dcid != self.scid ||
            hdr.scid == self.dcid
        {
            trace!("{} dropped packet {:?}", self.trace_id, hdr);
            self.log_packet(LogEventKind::PacketDropped, hdr, now);
            return Ok(buf.len());
        }

        if hdr.token.as_ref().map_or(true, |t| t.is_empty()) {
            return Err(Error::InvalidToken);
        }

        packet::verify_retry_integrity(buf, &self.dcid)?;

        trace!("{} received packet {:?}", self.trace_id, hdr);
        self.log_packet(LogEventKind::PacketReceived, hdr, now);

        self.did_retry = true;
        self.token = hdr.token.clone();

        // The old destination CID authenticates the Retry; the new one is
        // used from now on, including for fresh Initial keys.
        self.odcid = Some(self.dcid.clone());
        self.dcid = hdr.scid.clone().into_owned();
        self.rscid = Some(self.dcid.clone());

        self.derive_initial_key_material(&self.dcid.to_vec())?;

        self.got_peer_conn_id = false;
        self.recovery.drop_unacked_data(packet::Epoch::Initial);
        self.pkt_num_spaces[usize::from(packet::Epoch::Initial)].clear();

        self.handshake.reset()?;
        self.apply_local_transport_params()?;

        Ok(buf.len())
    }

    fn recv_initial(
        &mut self, buf: &mut [u8], hdr: packet::Header, hdr_len: usize,
        now: Instant,
    ) -> Result<usize> {
        if self.got_peer_conn_id &&
            (hdr.dcid != self.scid || hdr.scid != self.dcid)
        {
            trace!("{} dropped packet {:?}", self.trace_id, hdr);
            self.log_packet(LogEventKind::PacketDropped, &hdr, now);
            return Ok(buf.len());
        }

        if !self.derived_initial_secrets {
            // Server side: Initial keys come from the client's first
            // destination CID.
            self.derive_initial_key_material(&hdr.dcid.to_vec())?;
        }

        if !self.got_peer_conn_id {
            if self.is_server {
                if !self.did_retry {
                    self.odcid = Some(hdr.dcid.clone().into_owned());

                    self.local_transport_params
                        .original_destination_connection_id =
                        Some(hdr.dcid.clone().into_owned());

                    self.apply_local_transport_params()?;
                }
            } else if self.odcid.is_none() {
                self.odcid = Some(self.dcid.clone());
            }

            // Replace the initial destination CID with the one the peer
            // actually selected.
            self.dcid = hdr.scid.clone().into_owned();
            self.got_peer_conn_id = true;
        }

        self.recv_packet(buf, hdr, hdr_len, packet::Epoch::Initial, now)
    }

    fn recv_packet(
        &mut self, buf: &mut [u8], hdr: packet::Header, hdr_len: usize,
        epoch: packet::Epoch, now: Instant,
    ) -> Result<usize> {
        let e = usize::from(epoch);

        let is_long = hdr.ty != packet::Type::Short;

        // For long headers the payload length (packet number included) is
        // explicit; short header packets extend to the end of the buffer.
        let (pn_offset, payload_len) = if is_long {
            let mut b = octets::Octets::with_slice(buf);
            b.skip(hdr_len)?;
            let payload_len = b.get_varint()? as usize;
            (b.off(), payload_len)
        } else {
            (hdr_len, buf.len() - hdr_len)
        };

        let total = pn_offset + payload_len;

        // A truncated or degenerate packet is dropped, not treated as
        // fatal.
        if total > buf.len() {
            self.log_packet(LogEventKind::PacketDropped, &hdr, now);
            return Ok(buf.len());
        }

        if payload_len < PAYLOAD_MIN_LEN {
            self.log_packet(LogEventKind::PacketDropped, &hdr, now);
            return Ok(total);
        }

        if !self.pkt_num_spaces[e].can_decrypt() {
            trace!(
                "{} dropped undecryptable packet {:?} epoch={:?}",
                self.trace_id,
                hdr,
                epoch
            );
            self.log_packet(LogEventKind::PacketDropped, &hdr, now);
            return Ok(total);
        }

        let largest_rx = self.pkt_num_spaces[e].largest_rx_pkt_num;

        // Remove header protection, recover the packet number, decrypt.
        let (pn, pn_len, plain_len) = {
            let open = match self.pkt_num_spaces[e].crypto_open.as_ref() {
                Some(v) => v,
                None => return Ok(total),
            };

            let (truncated_pn, pn_len) =
                match packet::decrypt_hdr(&mut buf[..total], pn_offset, open) {
                    Ok(v) => v,

                    Err(_) => {
                        self.log_packet(LogEventKind::PacketDropped, &hdr, now);
                        return Ok(total);
                    },
                };

            let pn = packet::decode_pkt_num(largest_rx, truncated_pn, pn_len);

            let payload_offset = pn_offset + pn_len;

            let (aad, ciphertext) = buf[..total].split_at_mut(payload_offset);

            let plain_len =
                match open.open_with_u64_counter(pn, aad, ciphertext) {
                    Ok(v) => v,

                    Err(_) => {
                        trace!(
                            "{} dropped undecryptable packet {:?}",
                            self.trace_id,
                            hdr
                        );
                        self.log_packet(LogEventKind::PacketDropped, &hdr, now);
                        return Ok(total);
                    },
                };

            (pn, pn_len, plain_len)
        };

        if self.pkt_num_spaces[e].recv_pkt_num.contains(pn) {
            // Duplicate, ignore.
            trace!("{} dropped duplicate packet pn={}", self.trace_id, pn);
            self.log_packet(LogEventKind::PacketDropped, &hdr, now);
            return Ok(total);
        }

        trace!(
            "{} received packet {:?} pn={} len={}",
            self.trace_id,
            hdr,
            pn,
            plain_len
        );
        self.log_packet(LogEventKind::PacketReceived, &hdr, now);

        // The plaintext sits right after the unprotected packet number.
        let payload_off = pn_offset + pn_len;

        let payload = buf[payload_off..payload_off + plain_len].to_vec();

        self.recv_frames(&payload, hdr.ty, epoch, now)?;

        // ACKs processed above may have released acked frames.
        self.process_acked_packets(epoch);

        // Mark the packet as received.
        let space = &mut self.pkt_num_spaces[e];

        if pn >= space.largest_rx_pkt_num || space.largest_rx_pkt_time.is_none()
        {
            space.largest_rx_pkt_num = pn;
            space.largest_rx_pkt_time = Some(now);
        }

        space.recv_pkt_num.push_item(pn);
        space.recv_pkt_need_ack.push_item(pn);

        if self.local_transport_params.max_idle_timeout > 0 {
            self.idle_timer = Some(
                now + Duration::from_millis(
                    self.local_transport_params.max_idle_timeout,
                ),
            );
        }

        // A Handshake packet from the client validates its address; the
        // Initial state is no longer needed.
        if self.is_server &&
            epoch == packet::Epoch::Handshake &&
            self.state == State::Attempted
        {
            self.state = State::Handshake;
            self.drop_pkt_num_space(packet::Epoch::Initial);
        }

        self.ack_eliciting_sent = false;

        Ok(total)
    }

    fn recv_frames(
        &mut self, payload: &[u8], ty: packet::Type, epoch: packet::Epoch,
        now: Instant,
    ) -> Result<()> {
        let mut b = octets::Octets::with_slice(payload);

        let mut ack_elicited = false;

        while b.cap() > 0 {
            let frame = frame::Frame::from_bytes(&mut b, ty)?;

            ack_elicited |= frame.ack_eliciting();

            let detail = format!("{frame:?}");

            self.recv_frame(frame, epoch, now)?;

            self.log_detail(LogEventKind::FramesProcessed, detail, now);
        }

        if ack_elicited {
            self.pkt_num_spaces[usize::from(epoch)].ack_elicited = true;
        }

        Ok(())
    }

    fn recv_frame(
        &mut self, frame: frame::Frame, epoch: packet::Epoch, now: Instant,
    ) -> Result<()> {
        trace!("{} rx frm {:?}", self.trace_id, frame);

        match frame {
            frame::Frame::Padding { .. } => (),

            frame::Frame::Ping => (),

            frame::Frame::ACK {
                ack_delay, ranges, ..
            } => {
                let ack_delay = ack_delay
                    .checked_shl(
                        self.peer_transport_params.ack_delay_exponent as u32,
                    )
                    .unwrap_or(u64::MAX);

                self.recovery.on_ack_received(
                    &ranges,
                    Duration::from_micros(ack_delay),
                    epoch,
                    self.handshake_confirmed,
                    now,
                    &self.trace_id,
                )?;

                let e = usize::from(epoch);

                if !self.pkt_num_spaces[e].first_pkt_acked {
                    self.pkt_num_spaces[e].first_pkt_acked = true;

                    // The first ACK of a 1-RTT packet confirms the
                    // handshake; older key epochs can go.
                    if epoch == packet::Epoch::Application &&
                        self.state == State::Active
                    {
                        self.drop_pkt_num_space(packet::Epoch::Handshake);

                        if !self.is_server && !self.handshake_confirmed {
                            self.handshake_confirmed = true;
                        }
                    }
                }
            },

            frame::Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                // Peers cannot reset our send-only streams.
                let local = stream::is_local(stream_id, self.is_server);
                let bidi = stream::is_bidi(stream_id);

                if local && !bidi {
                    return Err(Error::InvalidStreamState(stream_id));
                }

                let st = self.get_or_create_stream(stream_id, false)?;

                let max_off_delta = st.recv.reset(error_code, final_size)?;

                if self.flow.cap_recv() < max_off_delta {
                    return Err(Error::FlowControl);
                }

                self.flow.add_rx(max_off_delta);

                self.events.push_back(Event::StreamReset {
                    stream_id,
                    error_code,
                });
            },

            frame::Frame::StopSending {
                stream_id,
                error_code,
            } => {
                let local = stream::is_local(stream_id, self.is_server);
                let bidi = stream::is_bidi(stream_id);

                // STOP_SENDING on a receive-only stream is a violation, as
                // is one for a local stream that was never opened.
                if !bidi && !local {
                    return Err(Error::InvalidStreamState(stream_id));
                }

                if local && self.streams.get(stream_id).is_none() {
                    return Err(Error::InvalidStreamState(stream_id));
                }

                if let Some(st) = self.streams.get_mut(stream_id) {
                    // New data is refused from now on; what is already in
                    // flight may still be retransmitted.
                    st.send.stop(error_code);
                }

                self.events.push_back(Event::StreamStopped {
                    stream_id,
                    error_code,
                });
            },

            frame::Frame::Crypto { data } => {
                self.pkt_num_spaces[usize::from(epoch)]
                    .crypto_stream
                    .recv
                    .write(data)?;

                self.do_handshake()?;
            },

            frame::Frame::NewToken { .. } => {
                // Tokens are opaque to the connection core; an embedder
                // interested in them can observe the frame log events.
                if self.is_server {
                    return Err(Error::InvalidState);
                }
            },

            frame::Frame::Stream { stream_id, data } => {
                // Peers cannot send on our unidirectional streams.
                let local = stream::is_local(stream_id, self.is_server);
                let bidi = stream::is_bidi(stream_id);

                if local && !bidi {
                    return Err(Error::InvalidStreamState(stream_id));
                }

                if self.flow.cap_recv() < data.len() as u64 {
                    return Err(Error::FlowControl);
                }

                let len = data.len() as u64;

                let st = self.get_or_create_stream(stream_id, false)?;

                st.recv_push(data)?;

                let readable = st.is_readable();

                self.flow.add_rx(len);

                if readable {
                    self.events.push_back(Event::StreamReadable(stream_id));
                }
            },

            frame::Frame::MaxData { max } => {
                self.flow.update_max_tx_data(max);
            },

            frame::Frame::MaxStreamData { stream_id, max } => {
                let st = self.get_or_create_stream(stream_id, false)?;
                st.flow.update_max_tx_data(max);
            },

            frame::Frame::MaxStreamsBidi { max } => {
                self.streams.update_peer_max_streams_bidi(max);
            },

            frame::Frame::MaxStreamsUni { max } => {
                self.streams.update_peer_max_streams_uni(max);
            },

            frame::Frame::DataBlocked { .. } => (),

            frame::Frame::StreamDataBlocked { .. } => (),

            frame::Frame::StreamsBlockedBidi { .. } => (),

            frame::Frame::StreamsBlockedUni { .. } => (),

            frame::Frame::ConnectionClose {
                error_code, reason, ..
            } => {
                self.peer_error = Some(ConnectionError {
                    is_app: false,
                    error_code,
                    reason: reason.clone(),
                });

                self.events.push_back(Event::ConnectionClosed {
                    is_app: false,
                    error_code,
                    reason,
                });

                self.state = State::Draining;
                self.set_draining(now);
            },

            frame::Frame::ApplicationClose { error_code, reason } => {
                self.peer_error = Some(ConnectionError {
                    is_app: true,
                    error_code,
                    reason: reason.clone(),
                });

                self.events.push_back(Event::ConnectionClosed {
                    is_app: true,
                    error_code,
                    reason,
                });

                self.state = State::Draining;
                self.set_draining(now);
            },

            frame::Frame::HandshakeDone => {
                if self.is_server {
                    return Err(Error::InvalidState);
                }

                if self.state == State::Active && !self.handshake_confirmed {
                    self.drop_pkt_num_space(packet::Epoch::Handshake);
                    self.handshake_confirmed = true;
                }
            },
        }

        Ok(())
    }

    /// Reinjects state from frames whose packets were acknowledged.
    fn process_acked_packets(&mut self, epoch: packet::Epoch) {
        let e = usize::from(epoch);

        for frame in self.recovery.take_acked(epoch) {
            match frame {
                frame::Frame::ACK { ranges, .. } => {
                    // The peer saw our ACK; no need to keep acknowledging
                    // those packets.
                    if let Some(largest) = ranges.last() {
                        self.pkt_num_spaces[e]
                            .recv_pkt_need_ack
                            .remove_until(largest);
                    }
                },

                frame::Frame::Crypto { data } => {
                    self.pkt_num_spaces[e]
                        .crypto_stream
                        .send
                        .ack(data.off(), data.len());
                },

                frame::Frame::Stream { stream_id, data } => {
                    if let Some(st) = self.streams.get_mut(stream_id) {
                        st.send.ack(data.off(), data.len());

                        if st.is_complete() {
                            self.events
                                .push_back(Event::StreamComplete(stream_id));
                        }
                    }
                },

                frame::Frame::MaxData { .. } => {
                    self.update_max_data = false;
                },

                frame::Frame::MaxStreamData { stream_id, .. } => {
                    if let Some(st) = self.streams.get_mut(stream_id) {
                        st.update_max_stream_data = false;
                    }
                },

                _ => (),
            }
        }
    }

    /// Reinjects state from frames whose packets were declared lost, so
    /// the data is retransmitted.
    fn process_lost_packets(&mut self, epoch: packet::Epoch) {
        let e = usize::from(epoch);

        for frame in self.recovery.take_lost(epoch) {
            trace!("{} lost frm {:?}", self.trace_id, frame);

            match frame {
                frame::Frame::ACK { .. } => {
                    self.pkt_num_spaces[e].ack_elicited = true;
                },

                frame::Frame::Crypto { data } => {
                    self.pkt_num_spaces[e]
                        .crypto_stream
                        .send
                        .push(&data, data.off(), false);
                },

                frame::Frame::Stream { stream_id, data } => {
                    if let Some(st) = self.streams.get_mut(stream_id) {
                        st.send.push(&data, data.off(), data.fin());
                    }
                },

                frame::Frame::HandshakeDone => {
                    self.handshake_confirmed = false;
                },

                _ => (),
            }
        }
    }

    fn do_handshake(&mut self) -> Result<()> {
        if self.state >= State::Active {
            return Ok(());
        }

        self.handshake.advance(&mut self.pkt_num_spaces)?;

        if !self.handshake.is_completed() {
            return Ok(());
        }

        let raw = self
            .handshake
            .peer_transport_params()
            .ok_or(Error::InvalidTransportParam)?
            .to_vec();

        let peer_params = TransportParams::decode(&raw, self.is_server)?;

        self.validate_peer_transport_params(&peer_params)?;

        trace!("{} peer transport params {:?}", self.trace_id, peer_params);

        self.flow.update_max_tx_data(peer_params.initial_max_data);

        self.streams
            .update_peer_max_streams_bidi(peer_params.initial_max_streams_bidi);
        self.streams
            .update_peer_max_streams_uni(peer_params.initial_max_streams_uni);

        self.recovery.max_ack_delay =
            Duration::from_millis(peer_params.max_ack_delay);

        self.peer_transport_params = peer_params;

        self.state = State::Active;

        // Once established the Initial space has no further use.
        if self.pkt_num_spaces[usize::from(packet::Epoch::Initial)]
            .can_encrypt()
        {
            self.drop_pkt_num_space(packet::Epoch::Initial);
        }

        trace!("{} connection established", self.trace_id);

        Ok(())
    }

    fn validate_peer_transport_params(
        &self, peer: &TransportParams,
    ) -> Result<()> {
        // Both endpoints prove the source CID they used in the handshake.
        match peer.initial_source_connection_id {
            Some(ref cid) if *cid == self.dcid => (),
            _ => return Err(Error::InvalidTransportParam),
        }

        if !self.is_server {
            // The server must echo the destination CID from our very
            // first Initial.
            if peer.original_destination_connection_id != self.odcid {
                return Err(Error::InvalidTransportParam);
            }

            // And prove ownership of the CID it redirected us to.
            if self.rscid.is_some() &&
                peer.retry_source_connection_id != self.rscid
            {
                return Err(Error::InvalidTransportParam);
            }
        }

        Ok(())
    }

    /// Produces a single datagram of packets to send to the peer.
    ///
    /// Returns the number of bytes written into `out`; zero means there is
    /// nothing to send right now. An Initial or Handshake packet may be
    /// coalesced with packets of later spaces in the same datagram.
    pub fn send(&mut self, out: &mut [u8]) -> Result<usize> {
        let now = self.now();

        if self.draining_timer.is_some() || self.state == State::Closed {
            return Ok(0);
        }

        if out.is_empty() {
            return Err(Error::BufferTooShort);
        }

        if let Err(e) = self.do_handshake() {
            self.close_on_error(e);
        }

        let max_dgram = cmp::min(self.max_pkt_size(), out.len());

        // Plan which spaces this datagram will carry, lowest first.
        let mut epochs: SmallVec<[packet::Epoch; 3]> = SmallVec::new();

        let mut cursor = self.write_epoch(None);
        while let Some(epoch) = cursor {
            epochs.push(epoch);

            if epoch == packet::Epoch::Application {
                break;
            }

            cursor = self.write_epoch(Some(epoch));
        }

        if epochs.is_empty() {
            return Ok(0);
        }

        let has_initial = epochs.contains(&packet::Epoch::Initial);

        let mut done = 0;

        for (i, epoch) in epochs.iter().enumerate() {
            if done > 0 && max_dgram - done < COALESCE_MIN {
                break;
            }

            let last = i == epochs.len() - 1;

            // Client Initial flights are padded to the minimum datagram
            // size; padding goes into the final packet, after coalescing.
            let pad_to = if !self.is_server && has_initial && last {
                MIN_CLIENT_INITIAL_LEN - done
            } else {
                0
            };

            let n =
                self.send_single(&mut out[done..max_dgram], *epoch, pad_to, now)?;

            if n == 0 {
                break;
            }

            done += n;
        }

        Ok(done)
    }

    fn send_single(
        &mut self, out: &mut [u8], epoch: packet::Epoch, pad_to: usize,
        now: Instant,
    ) -> Result<usize> {
        let e = usize::from(epoch);

        if !self.pkt_num_spaces[e].can_encrypt() {
            return Ok(0);
        }

        let overhead = match self.pkt_num_spaces[e].overhead() {
            Some(v) => v,
            None => return Ok(0),
        };

        let pn = self.pkt_num_spaces[e].next_pkt_num;
        let pn_len = packet::pkt_num_len(pn);

        let ty = packet::Type::from_epoch(epoch);

        let hdr = packet::Header {
            ty,
            version: self.version,
            dcid: self.dcid.clone(),
            scid: self.scid.clone(),
            pkt_num: pn,
            pkt_num_len: pn_len,
            token: if ty == packet::Type::Initial && !self.is_server {
                Some(self.token.clone().unwrap_or_default())
            } else {
                None
            },
            versions: None,
        };

        let mut b = octets::OctetsMut::with_slice(out);

        hdr.to_bytes(&mut b)?;

        let length_offset = b.off();

        if ty != packet::Type::Short {
            b.put_varint_with_len(0, PAYLOAD_LENGTH_LEN)?;
        }

        let pn_offset = b.off();

        packet::encode_pkt_num(pn, &mut b)?;

        let payload_offset = b.off();

        let left = match out
            .len()
            .checked_sub(payload_offset + overhead + PAYLOAD_MIN_LEN)
        {
            Some(v) => v + PAYLOAD_MIN_LEN,
            None => return Ok(0),
        };

        // Give packets declared lost in this space another chance first.
        self.process_lost_packets(epoch);

        let mut frames = self.compose_frames(epoch, left, now)?;

        if frames.is_empty() {
            return Ok(0);
        }

        let mut payload_len: usize =
            frames.iter().map(frame::Frame::wire_len).sum();

        // Pad the datagram up to the requested total size.
        if pad_to > 0 {
            let total = payload_offset + payload_len + overhead;

            if total < pad_to {
                let n = cmp::min(pad_to - total, left - payload_len);
                frames.push(frame::Frame::Padding { len: n });
                payload_len += n;
            }
        }

        // Keep enough payload for the header protection sample.
        if pn_len + payload_len < PAYLOAD_MIN_LEN {
            let n = PAYLOAD_MIN_LEN - pn_len - payload_len;
            frames.push(frame::Frame::Padding { len: n });
            payload_len += n;
        }

        // Fix up the length field now that the payload size is known.
        if ty != packet::Type::Short {
            let len = pn_len + payload_len + overhead;

            let mut lb =
                octets::OctetsMut::with_slice(&mut out[length_offset..]);
            lb.put_varint_with_len(len as u64, PAYLOAD_LENGTH_LEN)?;
        }

        let mut b = octets::OctetsMut::with_slice(out);
        b.skip(payload_offset)?;

        for frame in &frames {
            frame.to_bytes(&mut b)?;
        }

        // Encrypt the payload in place and protect the header.
        {
            let seal = self.pkt_num_spaces[e]
                .crypto_seal
                .as_ref()
                .ok_or(Error::InternalError)?;

            let (aad, rest) = out.split_at_mut(payload_offset);

            seal.seal_with_u64_counter(
                pn,
                aad,
                &mut rest[..payload_len + overhead],
            )?;

            packet::encrypt_hdr(out, pn_offset, pn_len, seal)?;
        }

        let written = payload_offset + payload_len + overhead;

        let ack_eliciting = frames.iter().any(frame::Frame::ack_eliciting);

        trace!(
            "{} tx pkt {:?} pn={} len={} frames={:?}",
            self.trace_id,
            hdr,
            pn,
            written,
            frames
        );

        self.log_packet(LogEventKind::PacketSent, &hdr, now);
        for frame in &frames {
            self.log_detail(
                LogEventKind::FramesProcessed,
                format!("{frame:?}"),
                now,
            );
        }

        let sent = recovery::Sent {
            pkt_num: pn,
            frames: SmallVec::from_vec(frames),
            time_sent: now,
            size: written,
            ack_eliciting,
        };

        self.recovery.on_packet_sent(sent, epoch, now, &self.trace_id);

        self.pkt_num_spaces[e].next_pkt_num += 1;

        if ack_eliciting {
            // (Re)arm the idle timer on the first ack-eliciting packet
            // since the last receive.
            if !self.ack_eliciting_sent &&
                self.local_transport_params.max_idle_timeout > 0
            {
                self.idle_timer = Some(
                    now + Duration::from_millis(
                        self.local_transport_params.max_idle_timeout,
                    ),
                );
            }

            self.ack_eliciting_sent = true;
        }

        // The client abandons the Initial state as soon as it sends a
        // Handshake packet.
        if !self.is_server &&
            ty == packet::Type::Handshake &&
            self.state == State::Attempted
        {
            self.state = State::Handshake;
            self.drop_pkt_num_space(packet::Epoch::Initial);
        }

        Ok(written)
    }

    fn compose_frames(
        &mut self, epoch: packet::Epoch, mut left: usize, now: Instant,
    ) -> Result<Vec<frame::Frame>> {
        let e = usize::from(epoch);

        let mut frames: Vec<frame::Frame> = Vec::new();

        // CONNECTION_CLOSE takes precedence over everything else.
        if let Some(err) = self.local_error.clone() {
            let frame = if err.is_app {
                frame::Frame::ApplicationClose {
                    error_code: err.error_code,
                    reason: err.reason,
                }
            } else {
                frame::Frame::ConnectionClose {
                    error_code: err.error_code,
                    frame_type: 0,
                    reason: err.reason,
                }
            };

            let n = frame.wire_len();

            if left >= n {
                frames.push(frame);
                left -= n;

                self.set_draining(now);
            }
        }

        if self.state >= State::Draining {
            return Ok(frames);
        }

        // ACK.
        let space = &mut self.pkt_num_spaces[e];

        if space.ack_elicited && !space.recv_pkt_need_ack.is_empty() {
            let ack_delay = space
                .largest_rx_pkt_time
                .map_or(Duration::ZERO, |t| now.duration_since(t));

            let ack_delay = ack_delay.as_micros() as u64 >>
                self.local_transport_params.ack_delay_exponent;

            let frame = frame::Frame::ACK {
                ack_delay,
                ranges: space.recv_pkt_need_ack.clone(),
                ecn_counts: None,
            };

            let n = frame.wire_len();

            if left >= n {
                frames.push(frame);
                left -= n;

                space.ack_elicited = false;
            }
        }

        // CRYPTO.
        if left > frame::MAX_CRYPTO_OVERHEAD {
            let buf = self.pkt_num_spaces[e]
                .crypto_stream
                .send
                .emit(left - frame::MAX_CRYPTO_OVERHEAD, u64::MAX);

            if !buf.is_empty() {
                let frame = frame::Frame::Crypto { data: buf };

                left -= frame.wire_len();
                frames.push(frame);
            }
        }

        if epoch == packet::Epoch::Application {
            // HANDSHAKE_DONE, sent by the server exactly once.
            if self.is_server &&
                self.state == State::Active &&
                !self.handshake_confirmed
            {
                let frame = frame::Frame::HandshakeDone;
                let n = frame.wire_len();

                if left >= n {
                    frames.push(frame);
                    left -= n;

                    self.handshake_confirmed = true;
                }
            }

            // MAX_DATA.
            if self.update_max_data || self.flow.should_update_max_rx_data() {
                let frame = frame::Frame::MaxData {
                    max: self.flow.max_rx_data_next(),
                };

                let n = frame.wire_len();

                if left >= n {
                    frames.push(frame);
                    left -= n;

                    // Keep sending it until a packet carrying it is acked.
                    self.update_max_data = true;
                    self.flow.commit_max_rx_data();
                }
            }

            // MAX_STREAM_DATA.
            for (id, st) in self.streams.iter_mut() {
                if !st.update_max_stream_data {
                    continue;
                }

                let frame = frame::Frame::MaxStreamData {
                    stream_id: *id,
                    max: st.flow.max_rx_data_next(),
                };

                let n = frame.wire_len();

                if left >= n {
                    frames.push(frame);
                    left -= n;

                    st.flow.commit_max_rx_data();
                }
            }

            // STREAM.
            for (id, st) in self.streams.iter_mut() {
                if left <= frame::MAX_STREAM_OVERHEAD {
                    break;
                }

                if !st.is_flushable() {
                    continue;
                }

                let max_len = cmp::min(
                    (left - frame::MAX_STREAM_OVERHEAD) as u64,
                    self.flow.cap_send(),
                ) as usize;

                let buf = st.send_pop(max_len);

                if buf.is_empty() && !buf.fin() {
                    continue;
                }

                self.flow.add_tx(buf.len() as u64);

                let frame = frame::Frame::Stream {
                    stream_id: *id,
                    data: buf,
                };

                left -= frame.wire_len();
                frames.push(frame);
            }
        }

        // PING probes.
        if self.recovery.probes > 0 && left >= 1 {
            frames.push(frame::Frame::Ping);
            left -= 1;
            let _ = left;

            self.recovery.probes -= 1;
        }

        Ok(frames)
    }

    /// Picks the packet number space the next packet should be produced
    /// in, considering only spaces above `after` when coalescing.
    fn write_epoch(&self, after: Option<packet::Epoch>) -> Option<packet::Epoch> {
        let lo = after.map_or(0, |e| usize::from(e) + 1);

        // While closing or probing, use the latest space that has keys.
        if self.local_error.is_some() || self.recovery.probes > 0 {
            let epoch = self.handshake.write_epoch();

            if usize::from(epoch) < lo {
                return None;
            }

            if self.pkt_num_spaces[usize::from(epoch)].can_encrypt() {
                return Some(epoch);
            }

            return None;
        }

        for epoch in packet::Epoch::epochs(lo..packet::Epoch::count()) {
            // Application data must wait for the handshake.
            if epoch == packet::Epoch::Application &&
                self.state < State::Active
            {
                continue;
            }

            let space = &self.pkt_num_spaces[usize::from(epoch)];

            if !space.can_encrypt() {
                continue;
            }

            if space.ready() {
                return Some(epoch);
            }

            if self.recovery.has_lost(epoch) {
                return Some(epoch);
            }
        }

        // Flushable streams ride in the application space.
        if self.state >= State::Active &&
            lo <= usize::from(packet::Epoch::Application) &&
            self.streams.has_flushable() &&
            self.pkt_num_spaces[usize::from(packet::Epoch::Application)]
                .can_encrypt()
        {
            return Some(packet::Epoch::Application);
        }

        None
    }

    fn max_pkt_size(&self) -> usize {
        if self.state >= State::Active &&
            self.peer_transport_params.max_udp_payload_size > 0
        {
            let n = self.peer_transport_params.max_udp_payload_size as usize;

            if (MIN_PKT_SIZE..=MAX_PKT_SIZE).contains(&n) {
                return n;
            }
        }

        MIN_PKT_SIZE
    }

    /// Returns the amount of time until the next timeout event, or `None`
    /// if no timer is armed.
    pub fn timeout(&self) -> Option<Duration> {
        if self.state == State::Closed {
            return None;
        }

        let deadline = if self.draining_timer.is_some() {
            self.draining_timer
        } else {
            match (self.recovery.loss_detection_timer(), self.idle_timer) {
                (Some(a), Some(b)) => Some(cmp::min(a, b)),
                (a, b) => a.or(b),
            }
        };

        deadline.map(|d| {
            let now = self.now();

            d.saturating_duration_since(now)
        })
    }

    /// Processes a timeout event. The caller should invoke this when the
    /// duration returned by [`timeout()`] elapses.
    ///
    /// [`timeout()`]: struct.Connection.html#method.timeout
    pub fn on_timeout(&mut self) {
        let now = self.now();
        self.check_timeout(now);
    }

    fn check_timeout(&mut self, now: Instant) {
        if let Some(t) = self.draining_timer {
            if now >= t {
                trace!("{} draining timeout expired", self.trace_id);
                self.state = State::Closed;
            }

            // While draining no other timer matters.
            return;
        }

        if let Some(t) = self.idle_timer {
            if now >= t {
                trace!("{} idle timeout expired", self.trace_id);
                self.state = State::Closed;
                return;
            }
        }

        if let Some(t) = self.recovery.loss_detection_timer() {
            if now >= t {
                self.recovery.on_loss_detection_timeout(
                    self.handshake_confirmed,
                    now,
                    &self.trace_id,
                );
            }
        }
    }

    /// Closes the connection, staging a CONNECTION_CLOSE frame that the
    /// next [`send()`] call will flush.
    ///
    /// [`send()`]: struct.Connection.html#method.send
    pub fn close(&mut self, app: bool, err: u64, reason: &[u8]) -> Result<()> {
        if self.draining_timer.is_some() || self.local_error.is_some() {
            return Err(Error::Done);
        }

        self.local_error = Some(ConnectionError {
            is_app: app,
            error_code: err,
            reason: reason.to_vec(),
        });

        self.state = State::Draining;

        trace!("{} connection closing err={:x}", self.trace_id, err);

        Ok(())
    }

    /// Writes application data to a stream, creating it when it is a
    /// locally-initiated stream that does not exist yet.
    pub fn stream_send(
        &mut self, stream_id: u64, buf: &[u8], fin: bool,
    ) -> Result<usize> {
        if self.state >= State::Draining {
            return Err(Error::InvalidState);
        }

        let st = self.get_or_create_stream(stream_id, true)?;

        st.send_push(buf, fin)
    }

    /// Reads contiguous application data from a stream.
    pub fn stream_recv(
        &mut self, stream_id: u64, out: &mut [u8],
    ) -> Result<(usize, bool)> {
        let st = self
            .streams
            .get_mut(stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?;

        let (len, fin) = st.recv_pop(out)?;

        self.flow.add_consumed(len as u64);

        if self.flow.should_update_max_rx_data() {
            self.update_max_data = true;
        }

        Ok((len, fin))
    }

    /// Drains pending application events into `out`.
    pub fn events(&mut self, out: &mut Vec<Event>) {
        out.extend(self.events.drain(..));
    }

    /// Returns true once the handshake is complete and the connection is
    /// not closing.
    pub fn is_established(&self) -> bool {
        self.state == State::Active
    }

    /// Returns true once the connection is fully terminated.
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// The error staged or sent to the peer, if any.
    pub fn local_error(&self) -> Option<&ConnectionError> {
        self.local_error.as_ref()
    }

    /// The error received from the peer, if any.
    pub fn peer_error(&self) -> Option<&ConnectionError> {
        self.peer_error.as_ref()
    }

    /// A stable identifier for this connection, suitable for log keys.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// The connection ID the peer is currently addressed with.
    pub fn destination_id(&self) -> &ConnectionId {
        &self.dcid
    }

    fn get_or_create_stream(
        &mut self, id: u64, local: bool,
    ) -> Result<&mut stream::Stream> {
        if self.streams.get(id).is_none() {
            if local != stream::is_local(id, self.is_server) {
                return Err(Error::InvalidStreamState(id));
            }

            let bidi = stream::is_bidi(id);

            let (max_rx_data, max_tx_data) = match (local, bidi) {
                (true, true) => (
                    self.local_transport_params
                        .initial_max_stream_data_bidi_local,
                    self.peer_transport_params
                        .initial_max_stream_data_bidi_remote,
                ),
                (true, false) => (
                    0,
                    self.peer_transport_params.initial_max_stream_data_uni,
                ),
                (false, true) => (
                    self.local_transport_params
                        .initial_max_stream_data_bidi_remote,
                    self.peer_transport_params
                        .initial_max_stream_data_bidi_local,
                ),
                (false, false) => (
                    self.local_transport_params.initial_max_stream_data_uni,
                    0,
                ),
            };

            self.streams.create(id, local, bidi, max_rx_data, max_tx_data)?;
        }

        self.streams
            .get_mut(id)
            .ok_or(Error::InvalidStreamState(id))
    }

    fn derive_initial_key_material(&mut self, cid: &[u8]) -> Result<()> {
        let (open, seal) =
            crypto::derive_initial_key_material(cid, self.is_server)?;

        let space =
            &mut self.pkt_num_spaces[usize::from(packet::Epoch::Initial)];

        space.crypto_open = Some(open);
        space.crypto_seal = Some(seal);

        self.derived_initial_secrets = true;

        Ok(())
    }

    fn apply_local_transport_params(&mut self) -> Result<()> {
        let mut raw = [0; 256];

        let len = self
            .local_transport_params
            .encode(self.is_server, &mut raw)?;

        self.handshake.set_transport_params(&raw[..len])
    }

    fn drop_pkt_num_space(&mut self, epoch: packet::Epoch) {
        self.pkt_num_spaces[usize::from(epoch)].clear();
        self.recovery.drop_unacked_data(epoch);

        trace!("{} dropped epoch {:?}", self.trace_id, epoch);
    }

    fn set_draining(&mut self, now: Instant) {
        if self.draining_timer.is_none() {
            self.draining_timer = Some(now + self.recovery.pto() * 3);
        }
    }

    fn close_on_error(&mut self, e: Error) {
        if e == Error::Done {
            return;
        }

        let _ = self.close(false, e.to_wire(), b"");
    }

    fn now(&self) -> Instant {
        (self.clock)()
    }

    fn log_packet(
        &mut self, kind: LogEventKind, hdr: &packet::Header, now: Instant,
    ) {
        if self.log_event_handler.is_some() {
            self.log_detail(kind, format!("{hdr:?}"), now);
        }
    }

    fn log_detail(&mut self, kind: LogEventKind, detail: String, now: Instant) {
        if let Some(handler) = self.log_event_handler.as_mut() {
            handler(LogEvent {
                at: now,
                kind,
                detail,
            });
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} state={:?} version={:x}",
            self.trace_id, self.state, self.version
        )
    }
}

mod crypto;
mod error;
mod flowcontrol;
mod frame;
mod packet;
mod rand;
mod ranges;
mod recovery;
mod stream;
pub mod tls;
mod transport_params;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::Pipe;

    #[test]
    fn handshake() {
        let mut pipe = Pipe::new().unwrap();

        pipe.handshake().unwrap();

        assert!(pipe.client.is_established());
        assert!(pipe.server.is_established());
    }

    #[test]
    fn client_initial_is_padded() {
        let mut pipe = Pipe::new().unwrap();

        let mut out = [0; 2048];
        let n = pipe.client.send(&mut out).unwrap();

        assert!(n >= MIN_CLIENT_INITIAL_LEN);
    }

    #[test]
    fn stream_roundtrip() {
        let mut pipe = Pipe::new().unwrap();
        pipe.handshake().unwrap();
        pipe.advance().unwrap();

        // Client opens bidi stream 0 and sends a little data.
        pipe.client.stream_send(0, b"hello", false).unwrap();
        pipe.advance().unwrap();

        let mut events = Vec::new();
        pipe.server.events(&mut events);
        assert!(events.contains(&Event::StreamReadable(0)));

        let mut buf = [0; 64];
        let (len, fin) = pipe.server.stream_recv(0, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert!(!fin);

        // Server answers on the same stream, with fin.
        pipe.server.stream_send(0, b"world", true).unwrap();
        pipe.advance().unwrap();

        let (len, fin) = pipe.client.stream_recv(0, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"world");
        assert!(fin);

        // The server's side completes once the data and fin are acked.
        let mut events = Vec::new();
        pipe.server.events(&mut events);
        assert!(events.contains(&Event::StreamComplete(0)));
    }

    #[test]
    fn stream_on_wrong_direction() {
        let mut pipe = Pipe::new().unwrap();
        pipe.handshake().unwrap();

        // Client cannot write to a server-initiated unidirectional stream.
        assert_eq!(
            pipe.client.stream_send(3, b"x", false),
            Err(Error::InvalidStreamState(3))
        );
    }

    #[test]
    fn stream_limits() {
        let mut pipe = Pipe::new().unwrap();
        pipe.handshake().unwrap();

        // The test config allows 3 bidi streams: 0, 4 and 8.
        assert!(pipe.client.stream_send(0, b"a", false).is_ok());
        assert!(pipe.client.stream_send(4, b"a", false).is_ok());
        assert!(pipe.client.stream_send(8, b"a", false).is_ok());

        assert_eq!(
            pipe.client.stream_send(12, b"a", false),
            Err(Error::StreamLimit)
        );
    }

    #[test]
    fn ack_only_packets_are_not_acked() {
        let mut pipe = Pipe::new().unwrap();
        pipe.handshake().unwrap();
        pipe.advance().unwrap();

        // Client sends data, the server owes it an ACK.
        pipe.client.stream_send(0, b"ping me", false).unwrap();
        pipe.advance().unwrap();

        // At this point all ACKs have been exchanged; neither side may
        // produce another packet in response to an ACK alone.
        let mut out = [0; 2048];
        assert_eq!(pipe.client.send(&mut out), Ok(0));
        assert_eq!(pipe.server.send(&mut out), Ok(0));
    }

    #[test]
    fn flow_control_violation() {
        let mut pipe = Pipe::new().unwrap();
        pipe.handshake().unwrap();
        pipe.advance().unwrap();

        // Forge a STREAM frame with more data than the connection-level
        // limit (the test config allows 1000 bytes).
        let frames = [frame::Frame::Stream {
            stream_id: 0,
            data: stream::RangeBuf::from(&[0; 1100], 0, false),
        }];

        let mut buf = [0; 2048];
        let len = testing::encode_pkt(
            &mut pipe.client,
            packet::Type::Short,
            &frames,
            &mut buf,
        )
        .unwrap();

        assert_eq!(
            pipe.server.recv(&mut buf[..len]),
            Err(Error::FlowControl)
        );

        // The failure staged a CONNECTION_CLOSE with the right code.
        let err = pipe.server.local_error().unwrap();
        assert!(!err.is_app);
        assert_eq!(err.error_code, 0x3);

        let n = pipe.server.send(&mut buf).unwrap();
        assert!(n > 0);
    }

    #[test]
    fn reset_stream_final_size() {
        let mut pipe = Pipe::new().unwrap();
        pipe.handshake().unwrap();
        pipe.advance().unwrap();

        // 100 bytes arrive on client bidi stream 4.
        pipe.client.stream_send(4, &[7; 100], false).unwrap();
        pipe.advance().unwrap();

        // A RESET_STREAM with a final size below what was received is a
        // FINAL_SIZE_ERROR.
        let frames = [frame::Frame::ResetStream {
            stream_id: 4,
            error_code: 42,
            final_size: 80,
        }];

        let mut buf = [0; 2048];
        let len = testing::encode_pkt(
            &mut pipe.client,
            packet::Type::Short,
            &frames,
            &mut buf,
        )
        .unwrap();

        assert_eq!(pipe.server.recv(&mut buf[..len]), Err(Error::FinalSize));
    }

    #[test]
    fn reset_stream_reclaims_credit() {
        let mut pipe = Pipe::new().unwrap();
        pipe.handshake().unwrap();
        pipe.advance().unwrap();

        pipe.client.stream_send(4, &[7; 100], false).unwrap();
        pipe.advance().unwrap();

        // Resetting at final size 150 accounts the 50 unsent bytes
        // against connection flow control and surfaces an event.
        let frames = [frame::Frame::ResetStream {
            stream_id: 4,
            error_code: 42,
            final_size: 150,
        }];

        let mut buf = [0; 2048];
        let len = testing::encode_pkt(
            &mut pipe.client,
            packet::Type::Short,
            &frames,
            &mut buf,
        )
        .unwrap();

        assert!(pipe.server.recv(&mut buf[..len]).is_ok());

        let mut events = Vec::new();
        pipe.server.events(&mut events);
        assert!(events.contains(&Event::StreamReset {
            stream_id: 4,
            error_code: 42
        }));

        let mut out = [0; 64];
        assert_eq!(
            pipe.server.stream_recv(4, &mut out),
            Err(Error::StreamReset(42))
        );
    }

    #[test]
    fn stop_sending_stops_new_writes() {
        let mut pipe = Pipe::new().unwrap();
        pipe.handshake().unwrap();
        pipe.advance().unwrap();

        pipe.client.stream_send(0, b"hello", false).unwrap();
        pipe.advance().unwrap();

        let frames = [frame::Frame::StopSending {
            stream_id: 0,
            error_code: 9,
        }];

        let mut buf = [0; 2048];
        let len = testing::encode_pkt(
            &mut pipe.server,
            packet::Type::Short,
            &frames,
            &mut buf,
        )
        .unwrap();

        assert!(pipe.client.recv(&mut buf[..len]).is_ok());

        let mut events = Vec::new();
        pipe.client.events(&mut events);
        assert!(events.contains(&Event::StreamStopped {
            stream_id: 0,
            error_code: 9
        }));

        // Further writes on the stopped stream are refused.
        assert_eq!(
            pipe.client.stream_send(0, b"more", false),
            Err(Error::StreamStopped(9))
        );
    }

    #[test]
    fn lost_stream_data_is_retransmitted() {
        let mut pipe = Pipe::new().unwrap();
        pipe.handshake().unwrap();
        pipe.advance().unwrap();

        let mut buf = [0; 2048];

        // This packet is "lost" in the network.
        pipe.client.stream_send(0, b"aaaa", false).unwrap();
        let n = pipe.client.send(&mut buf).unwrap();
        assert!(n > 0);

        // Several newer packets do arrive and get acknowledged, pushing
        // the lost one past the packet reordering threshold.
        for _ in 0..4 {
            pipe.client.stream_send(0, b"bbbb", false).unwrap();
            let flight = testing::emit_flight(&mut pipe.client).unwrap();
            testing::process_flight(&mut pipe.server, flight).unwrap();

            let flight = testing::emit_flight(&mut pipe.server).unwrap();
            testing::process_flight(&mut pipe.client, flight).unwrap();
        }

        // The loss is detected and the data re-sent at its old offset.
        pipe.advance().unwrap();

        let mut out = [0; 64];
        let (len, _) = pipe.server.stream_recv(0, &mut out).unwrap();
        assert_eq!(&out[..len], b"aaaabbbbbbbbbbbbbbbb");
    }

    #[test]
    fn peer_close_enters_draining() {
        let mut pipe = Pipe::new().unwrap();
        pipe.handshake().unwrap();
        pipe.advance().unwrap();

        pipe.client.close(true, 0x42, b"bye").unwrap();

        let mut buf = [0; 2048];
        let n = pipe.client.send(&mut buf).unwrap();
        assert!(n > 0);

        // Afterwards the client sends nothing further.
        assert_eq!(pipe.client.send(&mut buf), Ok(0));

        assert!(pipe.server.recv(&mut buf[..n]).is_ok());

        let mut events = Vec::new();
        pipe.server.events(&mut events);
        assert!(events.contains(&Event::ConnectionClosed {
            is_app: true,
            error_code: 0x42,
            reason: b"bye".to_vec()
        }));

        // The draining peer emits no reply, not even a close.
        assert_eq!(pipe.server.send(&mut buf), Ok(0));
    }

    #[test]
    fn draining_timer_closes() {
        let (clock, time) = testing::manual_clock();

        let mut pipe = Pipe::with_clock(clock).unwrap();
        pipe.handshake().unwrap();
        pipe.advance().unwrap();

        pipe.client.close(false, 0, b"").unwrap();

        let mut buf = [0; 2048];
        pipe.client.send(&mut buf).unwrap();

        let timeout = pipe.client.timeout().unwrap();

        testing::advance_clock(&time, timeout + Duration::from_millis(1));
        pipe.client.on_timeout();

        assert!(pipe.client.is_closed());
    }

    #[test]
    fn idle_timer_closes() {
        let (clock, time) = testing::manual_clock();

        let mut pipe = Pipe::with_clock(clock).unwrap();
        pipe.handshake().unwrap();
        pipe.advance().unwrap();

        // The handshake armed the idle timer; let it expire.
        let timeout = pipe.client.timeout().unwrap();
        testing::advance_clock(&time, timeout + Duration::from_millis(1));
        pipe.client.on_timeout();

        assert!(pipe.client.is_closed());
        assert_eq!(pipe.client.timeout(), None);
    }

    #[test]
    fn retry() {
        let mut pipe = Pipe::new_unconnected().unwrap();

        let mut buf = [0; 2048];

        // Client sends its first flight.
        let len = pipe.client.send(&mut buf).unwrap();

        let hdr = testing::decode_header(&buf[..len]).unwrap();
        let client_scid = hdr.scid.clone();
        let original_dcid = hdr.dcid.clone();

        // A Retry redirects the client to a server-chosen CID.
        let new_scid = ConnectionId::from_ref(&[0xb1, 0xb2, 0xb3, 0xb4]);

        let mut retry = [0; 128];
        let retry_len = packet::encode_retry(
            PROTOCOL_VERSION,
            &new_scid,
            &client_scid,
            &original_dcid,
            b"T0T1T2T3",
            &mut retry,
        )
        .unwrap();

        assert!(pipe.client.recv(&mut retry[..retry_len]).is_ok());

        // The next Initial goes to the new CID and echoes the token.
        let len = pipe.client.send(&mut buf).unwrap();
        assert!(len >= MIN_CLIENT_INITIAL_LEN);

        let hdr = testing::decode_header(&buf[..len]).unwrap();
        assert_eq!(hdr.dcid, new_scid);
        assert_eq!(hdr.token.as_deref(), Some(&b"T0T1T2T3"[..]));

        // A server created with the retry CIDs completes the handshake,
        // proving the client re-derived its Initial keys and that the
        // transport parameter validation passes.
        pipe.server = testing::server_with_retry(&new_scid, &original_dcid)
            .unwrap();

        assert!(pipe.server.recv(&mut buf[..len]).is_ok());

        pipe.handshake().unwrap();

        assert!(pipe.client.is_established());
        assert!(pipe.server.is_established());
    }

    #[test]
    fn retry_with_bad_integrity_tag() {
        let mut pipe = Pipe::new_unconnected().unwrap();

        let mut buf = [0; 2048];
        let len = pipe.client.send(&mut buf).unwrap();

        let hdr = testing::decode_header(&buf[..len]).unwrap();

        let mut retry = [0; 128];
        let retry_len = packet::encode_retry(
            PROTOCOL_VERSION,
            &ConnectionId::from_ref(&[0xb1, 0xb2, 0xb3, 0xb4]),
            &hdr.scid,
            // Computed over the wrong original CID, so the tag is invalid.
            &ConnectionId::from_ref(&[0xde, 0xad]),
            b"token",
            &mut retry,
        )
        .unwrap();

        assert_eq!(
            pipe.client.recv(&mut retry[..retry_len]),
            Err(Error::InvalidToken)
        );
    }

    #[test]
    fn version_negotiation() {
        let mut pipe = Pipe::new_unconnected().unwrap();

        let mut buf = [0; 2048];
        let len = pipe.client.send(&mut buf).unwrap();

        let hdr = testing::decode_header(&buf[..len]).unwrap();
        let first_dcid = hdr.dcid.clone();

        let mut vn = [0; 128];
        let vn_len = packet::negotiate_version(
            &hdr.scid,
            &hdr.dcid,
            &[0x1a2a_3a4a, PROTOCOL_VERSION],
            &mut vn,
        )
        .unwrap();

        assert!(pipe.client.recv(&mut vn[..vn_len]).is_ok());

        // The client restarts its first flight with the same DCID.
        let len = pipe.client.send(&mut buf).unwrap();
        assert!(len >= MIN_CLIENT_INITIAL_LEN);

        let hdr = testing::decode_header(&buf[..len]).unwrap();
        assert_eq!(hdr.ty, packet::Type::Initial);
        assert_eq!(hdr.version, PROTOCOL_VERSION);
        assert_eq!(hdr.dcid, first_dcid);

        // A second Version Negotiation packet is ignored.
        let before = pipe.client.did_version_negotiation;
        assert!(before);

        let vn_len = packet::negotiate_version(
            &hdr.scid,
            &hdr.dcid,
            &[0x1a2a_3a4a],
            &mut vn,
        )
        .unwrap();
        assert!(pipe.client.recv(&mut vn[..vn_len]).is_ok());
        assert_eq!(pipe.client.version, PROTOCOL_VERSION);
    }

    #[test]
    fn version_negotiation_no_common_version() {
        let mut pipe = Pipe::new_unconnected().unwrap();

        let mut buf = [0; 2048];
        let len = pipe.client.send(&mut buf).unwrap();

        let hdr = testing::decode_header(&buf[..len]).unwrap();

        let mut vn = [0; 128];
        let vn_len = packet::negotiate_version(
            &hdr.scid,
            &hdr.dcid,
            &[0x1a2a_3a4a],
            &mut vn,
        )
        .unwrap();

        assert_eq!(
            pipe.client.recv(&mut vn[..vn_len]),
            Err(Error::UnknownVersion)
        );
    }

    #[test]
    fn handshake_done_on_server_is_fatal() {
        let mut pipe = Pipe::new().unwrap();
        pipe.handshake().unwrap();
        pipe.advance().unwrap();

        let frames = [frame::Frame::HandshakeDone];

        let mut buf = [0; 2048];
        let len = testing::encode_pkt(
            &mut pipe.client,
            packet::Type::Short,
            &frames,
            &mut buf,
        )
        .unwrap();

        assert_eq!(
            pipe.server.recv(&mut buf[..len]),
            Err(Error::InvalidState)
        );
    }

    #[test]
    fn config_requires_tls_session() {
        let mut config = Config::new(PROTOCOL_VERSION).unwrap();

        let scid = ConnectionId::from_ref(&[0xba; 8]);

        assert!(connect(&scid, &mut config).is_err());
    }

    #[test]
    fn cid_too_long_is_rejected() {
        let mut config = testing::client_config();

        let scid = ConnectionId::from_ref(&[0xba; 21]);

        assert_eq!(
            connect(&scid, &mut config).err(),
            Some(Error::InternalError)
        );
    }

    #[test]
    fn log_events_are_emitted() {
        use std::sync::Mutex;

        let mut pipe = Pipe::new().unwrap();

        let seen: Arc<Mutex<Vec<LogEventKind>>> =
            Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        pipe.client.on_log_event(Box::new(move |ev| {
            sink.lock().unwrap().push(ev.kind);
        }));

        pipe.handshake().unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&LogEventKind::PacketSent));
        assert!(seen.contains(&LogEventKind::PacketReceived));
        assert!(seen.contains(&LogEventKind::FramesProcessed));
    }
}
