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

//! Test helpers: an in-memory client/server pipe and a deterministic
//! stand-in for the TLS 1.3 engine.

use std::sync::Arc;
use std::sync::Mutex;

use std::time::Duration;
use std::time::Instant;

use crate::crypto;
use crate::frame;
use crate::packet;
use crate::tls;

use super::*;

const MSG_HELLO: u8 = 1;
const MSG_FIN: u8 = 2;

const HANDSHAKE_KEY_LABEL: &[u8] = b"pipe handshake keys";
const APPLICATION_KEY_LABEL: &[u8] = b"pipe application keys";

/// A deterministic [`tls::Session`] for tests.
///
/// It mimics the TLS 1.3 message flow with two message kinds: a HELLO
/// carrying the sender's transport parameters, and a FIN marking the end
/// of the sender's handshake. Key material is derived from fixed labels
/// through the same HKDF chain as the Initial secrets, so both endpoints
/// agree without any entropy.
///
/// [`tls::Session`]: ../tls/trait.Session.html
pub struct TestSession {
    is_server: bool,

    local_params: Vec<u8>,

    peer_params: Option<Vec<u8>>,

    /// Reassembled CRYPTO bytes, per level.
    bufs: [Vec<u8>; 3],

    hello_sent: bool,

    keys_installed: bool,

    completed: bool,
}

impl TestSession {
    pub fn new(is_server: bool) -> TestSession {
        TestSession {
            is_server,
            local_params: Vec::new(),
            peer_params: None,
            bufs: Default::default(),
            hello_sent: false,
            keys_installed: false,
            completed: false,
        }
    }

    fn buf_index(level: crypto::Level) -> Result<usize> {
        match level {
            crypto::Level::Initial => Ok(0),
            crypto::Level::Handshake => Ok(1),
            crypto::Level::Application => Ok(2),
            crypto::Level::ZeroRTT => Err(Error::InvalidState),
        }
    }

    /// Pops the next complete `[type, len, payload]` message from the
    /// given level's buffer.
    fn next_msg(&mut self, idx: usize) -> Option<(u8, Vec<u8>)> {
        let buf = &mut self.bufs[idx];

        if buf.len() < 3 {
            return None;
        }

        let len = usize::from(u16::from_be_bytes([buf[1], buf[2]]));

        if buf.len() < 3 + len {
            return None;
        }

        let ty = buf[0];
        let payload = buf[3..3 + len].to_vec();

        buf.drain(..3 + len);

        Some((ty, payload))
    }

    fn msg(ty: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + payload.len());
        out.push(ty);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn install_keys(&mut self, out: &mut Vec<tls::Output>) -> Result<()> {
        if self.keys_installed {
            return Ok(());
        }

        let (open, seal) = crypto::derive_initial_key_material(
            HANDSHAKE_KEY_LABEL,
            self.is_server,
        )?;

        out.push(tls::Output::ReadKeys {
            level: crypto::Level::Handshake,
            open,
        });
        out.push(tls::Output::WriteKeys {
            level: crypto::Level::Handshake,
            seal,
        });

        let (open, seal) = crypto::derive_initial_key_material(
            APPLICATION_KEY_LABEL,
            self.is_server,
        )?;

        out.push(tls::Output::ReadKeys {
            level: crypto::Level::Application,
            open,
        });
        out.push(tls::Output::WriteKeys {
            level: crypto::Level::Application,
            seal,
        });

        self.keys_installed = true;

        Ok(())
    }
}

impl tls::Session for TestSession {
    fn set_transport_params(&mut self, params: &[u8]) -> Result<()> {
        self.local_params = params.to_vec();
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.bufs = Default::default();
        self.peer_params = None;
        self.hello_sent = false;
        self.keys_installed = false;
        self.completed = false;
        Ok(())
    }

    fn provide_data(
        &mut self, level: crypto::Level, data: &[u8],
    ) -> Result<()> {
        let idx = Self::buf_index(level)?;
        self.bufs[idx].extend_from_slice(data);
        Ok(())
    }

    fn process(&mut self) -> Result<Vec<tls::Output>> {
        let mut out = Vec::new();

        // The client speaks first.
        if !self.is_server && !self.hello_sent {
            out.push(tls::Output::Crypto {
                level: crypto::Level::Initial,
                data: Self::msg(MSG_HELLO, &self.local_params.clone()),
            });

            self.hello_sent = true;
        }

        while let Some((ty, payload)) = self.next_msg(0) {
            if ty != MSG_HELLO {
                return Err(Error::TlsFail(10));
            }

            self.peer_params = Some(payload);

            if self.is_server {
                // Answer with our own hello and finish right away.
                out.push(tls::Output::Crypto {
                    level: crypto::Level::Initial,
                    data: Self::msg(MSG_HELLO, &self.local_params.clone()),
                });
                self.hello_sent = true;

                self.install_keys(&mut out)?;

                out.push(tls::Output::Crypto {
                    level: crypto::Level::Handshake,
                    data: Self::msg(MSG_FIN, &[]),
                });
            } else {
                self.install_keys(&mut out)?;
            }
        }

        while let Some((ty, _)) = self.next_msg(1) {
            if ty != MSG_FIN {
                return Err(Error::TlsFail(10));
            }

            if self.is_server {
                // The client finished; the handshake is complete.
                self.completed = true;
                out.push(tls::Output::Complete);
            } else {
                // Answer the server's FIN with our own and complete.
                out.push(tls::Output::Crypto {
                    level: crypto::Level::Handshake,
                    data: Self::msg(MSG_FIN, &[]),
                });

                self.completed = true;
                out.push(tls::Output::Complete);
            }
        }

        Ok(out)
    }

    fn is_completed(&self) -> bool {
        self.completed
    }

    fn peer_transport_params(&self) -> Option<&[u8]> {
        self.peer_params.as_deref()
    }

    fn alert(&self) -> Option<u8> {
        None
    }
}

/// Returns a client config with the limits used throughout the tests.
pub fn client_config() -> Config {
    let mut config = Config::new(PROTOCOL_VERSION).unwrap();
    config.set_tls_session(Box::new(TestSession::new(false)));
    config.set_initial_max_data(1000);
    config.set_initial_max_stream_data_bidi_local(500);
    config.set_initial_max_stream_data_bidi_remote(500);
    config.set_initial_max_stream_data_uni(300);
    config.set_initial_max_streams_bidi(3);
    config.set_initial_max_streams_uni(3);
    config.set_max_idle_timeout(30_000);
    config
}

/// Returns a server config with the limits used throughout the tests.
pub fn server_config() -> Config {
    let mut config = Config::new(PROTOCOL_VERSION).unwrap();
    config.set_tls_session(Box::new(TestSession::new(true)));
    config.set_initial_max_data(1000);
    config.set_initial_max_stream_data_bidi_local(500);
    config.set_initial_max_stream_data_bidi_remote(500);
    config.set_initial_max_stream_data_uni(300);
    config.set_initial_max_streams_bidi(3);
    config.set_initial_max_streams_uni(3);
    config.set_max_idle_timeout(30_000);
    config.set_stateless_reset_token([0xba; 16]);
    config
}

/// A client and server connection talking over in-memory datagrams.
pub struct Pipe {
    pub client: Connection,
    pub server: Connection,
}

impl Pipe {
    pub fn new() -> Result<Pipe> {
        let mut client_scid = [0; 8];
        rand::rand_bytes(&mut client_scid);

        let mut server_scid = [0; 8];
        rand::rand_bytes(&mut server_scid);

        Ok(Pipe {
            client: connect(
                &ConnectionId::from_ref(&client_scid),
                &mut client_config(),
            )?,
            server: accept(
                &ConnectionId::from_ref(&server_scid),
                None,
                &mut server_config(),
            )?,
        })
    }

    /// Like [`new()`], for tests that replace the server or drive the
    /// first flight by hand.
    ///
    /// [`new()`]: struct.Pipe.html#method.new
    pub fn new_unconnected() -> Result<Pipe> {
        Pipe::new()
    }

    pub fn with_clock(clock: Clock) -> Result<Pipe> {
        let mut client_scid = [0; 8];
        rand::rand_bytes(&mut client_scid);

        let mut server_scid = [0; 8];
        rand::rand_bytes(&mut server_scid);

        let mut client_config = client_config();
        client_config.set_clock(clock.clone());

        let mut server_config = server_config();
        server_config.set_clock(clock);

        Ok(Pipe {
            client: connect(
                &ConnectionId::from_ref(&client_scid),
                &mut client_config,
            )?,
            server: accept(
                &ConnectionId::from_ref(&server_scid),
                None,
                &mut server_config,
            )?,
        })
    }

    /// Exchanges flights until both sides are established.
    pub fn handshake(&mut self) -> Result<()> {
        for _ in 0..16 {
            if self.client.is_established() && self.server.is_established() {
                return Ok(());
            }

            let flight = emit_flight(&mut self.client)?;
            process_flight(&mut self.server, flight)?;

            let flight = emit_flight(&mut self.server)?;
            process_flight(&mut self.client, flight)?;
        }

        if self.client.is_established() && self.server.is_established() {
            return Ok(());
        }

        Err(Error::InvalidState)
    }

    /// Exchanges flights until neither side has anything left to send.
    pub fn advance(&mut self) -> Result<()> {
        for _ in 0..16 {
            let flight = emit_flight(&mut self.client)?;
            let client_sent = flight.len();
            process_flight(&mut self.server, flight)?;

            let flight = emit_flight(&mut self.server)?;
            let server_sent = flight.len();
            process_flight(&mut self.client, flight)?;

            if client_sent == 0 && server_sent == 0 {
                return Ok(());
            }
        }

        Err(Error::InvalidState)
    }
}

/// Collects every datagram the connection wants to send right now.
pub fn emit_flight(conn: &mut Connection) -> Result<Vec<Vec<u8>>> {
    let mut flight = Vec::new();

    for _ in 0..64 {
        let mut out = vec![0; 2048];

        let n = conn.send(&mut out)?;

        if n == 0 {
            return Ok(flight);
        }

        out.truncate(n);
        flight.push(out);
    }

    // A well-behaved connection always runs dry.
    Err(Error::InvalidState)
}

/// Feeds a flight of datagrams into the connection.
pub fn process_flight(
    conn: &mut Connection, flight: Vec<Vec<u8>>,
) -> Result<()> {
    for mut dgram in flight {
        conn.recv(&mut dgram)?;
    }

    Ok(())
}

/// Parses the (long) header of the first packet in the buffer.
pub fn decode_header(buf: &[u8]) -> Result<packet::Header> {
    let mut b = octets::Octets::with_slice(buf);

    packet::Header::from_bytes(&mut b, 0)
}

/// Builds a protected packet carrying the given frames, using the
/// connection's own keys and packet number sequence. Unlike regular
/// sending this bypasses recovery, so tests can forge traffic.
pub fn encode_pkt(
    conn: &mut Connection, ty: packet::Type, frames: &[frame::Frame],
    buf: &mut [u8],
) -> Result<usize> {
    let epoch = ty.to_epoch()?;
    let e = usize::from(epoch);

    let pn = conn.pkt_num_spaces[e].next_pkt_num;
    let pn_len = packet::pkt_num_len(pn);

    let hdr = packet::Header {
        ty,
        version: conn.version,
        dcid: conn.dcid.clone(),
        scid: conn.scid.clone(),
        pkt_num: pn,
        pkt_num_len: pn_len,
        token: if ty == packet::Type::Initial {
            Some(conn.token.clone().unwrap_or_default())
        } else {
            None
        },
        versions: None,
    };

    let mut b = octets::OctetsMut::with_slice(buf);

    hdr.to_bytes(&mut b)?;

    let length_offset = b.off();

    if ty != packet::Type::Short {
        b.put_varint_with_len(0, 2)?;
    }

    let pn_offset = b.off();

    packet::encode_pkt_num(pn, &mut b)?;

    let payload_offset = b.off();

    let mut payload_len = 0;

    for frame in frames {
        payload_len += frame.to_bytes(&mut b)?;
    }

    // Leave room for the header protection sample.
    if pn_len + payload_len < 4 {
        let padding = frame::Frame::Padding {
            len: 4 - pn_len - payload_len,
        };
        payload_len += padding.to_bytes(&mut b)?;
    }

    let overhead = {
        let seal = conn.pkt_num_spaces[e]
            .crypto_seal
            .as_ref()
            .ok_or(Error::InternalError)?;

        seal.alg().tag_len()
    };

    if ty != packet::Type::Short {
        let len = pn_len + payload_len + overhead;

        let mut lb = octets::OctetsMut::with_slice(&mut buf[length_offset..]);
        lb.put_varint_with_len(len as u64, 2)?;
    }

    {
        let seal = conn.pkt_num_spaces[e]
            .crypto_seal
            .as_ref()
            .ok_or(Error::InternalError)?;

        let (aad, rest) = buf.split_at_mut(payload_offset);

        seal.seal_with_u64_counter(
            pn,
            aad,
            &mut rest[..payload_len + overhead],
        )?;

        packet::encrypt_hdr(buf, pn_offset, pn_len, seal)?;
    }

    conn.pkt_num_spaces[e].next_pkt_num += 1;

    Ok(payload_offset + payload_len + overhead)
}

/// A server connection created after a Retry exchange.
pub fn server_with_retry(
    scid: &ConnectionId, odcid: &ConnectionId,
) -> Result<Connection> {
    accept(scid, Some(odcid), &mut server_config())
}

/// A clock whose time only moves when the test says so.
pub fn manual_clock() -> (Clock, Arc<Mutex<Instant>>) {
    let time = Arc::new(Mutex::new(Instant::now()));

    let source = time.clone();
    let clock: Clock = Arc::new(move || *source.lock().unwrap());

    (clock, time)
}

pub fn advance_clock(time: &Arc<Mutex<Instant>>, d: Duration) {
    let mut t = time.lock().unwrap();
    *t += d;
}
