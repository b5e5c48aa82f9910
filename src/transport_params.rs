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

//! Transport parameters carried in the TLS handshake.

use crate::ConnectionId;
use crate::Error;
use crate::Result;

const MAX_STREAMS_LIMIT: u64 = 1 << 60;

/// QUIC transport parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportParams {
    /// Destination CID from the first Initial packet sent by the client.
    pub original_destination_connection_id: Option<ConnectionId<'static>>,

    /// The maximum idle timeout, in milliseconds.
    pub max_idle_timeout: u64,

    /// Token used for verifying stateless resets.
    pub stateless_reset_token: Option<[u8; 16]>,

    /// The maximum UDP payload size.
    pub max_udp_payload_size: u64,

    /// The initial connection-level flow control limit.
    pub initial_max_data: u64,

    /// The initial flow control limit for locally-initiated bidirectional
    /// streams.
    pub initial_max_stream_data_bidi_local: u64,

    /// The initial flow control limit for peer-initiated bidirectional
    /// streams.
    pub initial_max_stream_data_bidi_remote: u64,

    /// The initial flow control limit for unidirectional streams.
    pub initial_max_stream_data_uni: u64,

    /// The initial maximum number of bidirectional streams.
    pub initial_max_streams_bidi: u64,

    /// The initial maximum number of unidirectional streams.
    pub initial_max_streams_uni: u64,

    /// The exponent applied to this endpoint's encoded ACK delays.
    pub ack_delay_exponent: u64,

    /// The maximum time this endpoint will delay its ACKs, in milliseconds.
    pub max_ack_delay: u64,

    /// The source CID from the first packet sent by this endpoint.
    pub initial_source_connection_id: Option<ConnectionId<'static>>,

    /// The source CID from the Retry packet, when one was sent.
    pub retry_source_connection_id: Option<ConnectionId<'static>>,
}

impl Default for TransportParams {
    fn default() -> TransportParams {
        TransportParams {
            original_destination_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
        }
    }
}

impl TransportParams {
    /// Decodes peer transport parameters.
    ///
    /// Parameters a client must not send (original/retry CID, stateless
    /// reset token) fail decoding on the server. Unknown parameters are
    /// skipped.
    pub fn decode(buf: &[u8], is_server: bool) -> Result<TransportParams> {
        let mut params = octets::Octets::with_slice(buf);

        let mut seen = std::collections::HashSet::new();

        let mut tp = TransportParams::default();

        while params.cap() > 0 {
            let id = params.get_varint()?;

            if !seen.insert(id) {
                return Err(Error::InvalidTransportParam);
            }

            let mut val = params.get_bytes_with_varint_length()?;

            match id {
                0x0000 => {
                    if is_server {
                        return Err(Error::InvalidTransportParam);
                    }

                    tp.original_destination_connection_id =
                        Some(val.to_vec().into());
                },

                0x0001 => {
                    tp.max_idle_timeout = val.get_varint()?;
                },

                0x0002 => {
                    if is_server {
                        return Err(Error::InvalidTransportParam);
                    }

                    tp.stateless_reset_token = Some(
                        val.get_bytes(16)?
                            .buf()
                            .try_into()
                            .map_err(|_| Error::BufferTooShort)?,
                    );
                },

                0x0003 => {
                    tp.max_udp_payload_size = val.get_varint()?;

                    if tp.max_udp_payload_size < 1200 {
                        return Err(Error::InvalidTransportParam);
                    }
                },

                0x0004 => {
                    tp.initial_max_data = val.get_varint()?;
                },

                0x0005 => {
                    tp.initial_max_stream_data_bidi_local = val.get_varint()?;
                },

                0x0006 => {
                    tp.initial_max_stream_data_bidi_remote = val.get_varint()?;
                },

                0x0007 => {
                    tp.initial_max_stream_data_uni = val.get_varint()?;
                },

                0x0008 => {
                    let max = val.get_varint()?;

                    if max > MAX_STREAMS_LIMIT {
                        return Err(Error::InvalidTransportParam);
                    }

                    tp.initial_max_streams_bidi = max;
                },

                0x0009 => {
                    let max = val.get_varint()?;

                    if max > MAX_STREAMS_LIMIT {
                        return Err(Error::InvalidTransportParam);
                    }

                    tp.initial_max_streams_uni = max;
                },

                0x000a => {
                    let exp = val.get_varint()?;

                    if exp > 20 {
                        return Err(Error::InvalidTransportParam);
                    }

                    tp.ack_delay_exponent = exp;
                },

                0x000b => {
                    let delay = val.get_varint()?;

                    if delay >= 1 << 14 {
                        return Err(Error::InvalidTransportParam);
                    }

                    tp.max_ack_delay = delay;
                },

                0x000f => {
                    tp.initial_source_connection_id =
                        Some(val.to_vec().into());
                },

                0x0010 => {
                    if is_server {
                        return Err(Error::InvalidTransportParam);
                    }

                    tp.retry_source_connection_id = Some(val.to_vec().into());
                },

                // Unknown or unhandled parameters are skipped.
                _ => (),
            }
        }

        Ok(tp)
    }

    /// Encodes the local transport parameters for the handshake.
    pub fn encode(&self, is_server: bool, out: &mut [u8]) -> Result<usize> {
        let mut b = octets::OctetsMut::with_slice(out);

        if is_server {
            if let Some(ref odcid) = self.original_destination_connection_id {
                b.put_varint(0x0000)?;
                b.put_varint(odcid.len() as u64)?;
                b.put_bytes(odcid)?;
            }
        }

        if self.max_idle_timeout != 0 {
            b.put_varint(0x0001)?;
            b.put_varint(octets::varint_len(self.max_idle_timeout) as u64)?;
            b.put_varint(self.max_idle_timeout)?;
        }

        if is_server {
            if let Some(ref token) = self.stateless_reset_token {
                b.put_varint(0x0002)?;
                b.put_varint(token.len() as u64)?;
                b.put_bytes(token)?;
            }
        }

        if self.max_udp_payload_size != 0 {
            b.put_varint(0x0003)?;
            b.put_varint(
                octets::varint_len(self.max_udp_payload_size) as u64
            )?;
            b.put_varint(self.max_udp_payload_size)?;
        }

        if self.initial_max_data != 0 {
            b.put_varint(0x0004)?;
            b.put_varint(octets::varint_len(self.initial_max_data) as u64)?;
            b.put_varint(self.initial_max_data)?;
        }

        if self.initial_max_stream_data_bidi_local != 0 {
            b.put_varint(0x0005)?;
            b.put_varint(octets::varint_len(
                self.initial_max_stream_data_bidi_local,
            ) as u64)?;
            b.put_varint(self.initial_max_stream_data_bidi_local)?;
        }

        if self.initial_max_stream_data_bidi_remote != 0 {
            b.put_varint(0x0006)?;
            b.put_varint(octets::varint_len(
                self.initial_max_stream_data_bidi_remote,
            ) as u64)?;
            b.put_varint(self.initial_max_stream_data_bidi_remote)?;
        }

        if self.initial_max_stream_data_uni != 0 {
            b.put_varint(0x0007)?;
            b.put_varint(octets::varint_len(
                self.initial_max_stream_data_uni,
            ) as u64)?;
            b.put_varint(self.initial_max_stream_data_uni)?;
        }

        if self.initial_max_streams_bidi != 0 {
            b.put_varint(0x0008)?;
            b.put_varint(
                octets::varint_len(self.initial_max_streams_bidi) as u64
            )?;
            b.put_varint(self.initial_max_streams_bidi)?;
        }

        if self.initial_max_streams_uni != 0 {
            b.put_varint(0x0009)?;
            b.put_varint(
                octets::varint_len(self.initial_max_streams_uni) as u64
            )?;
            b.put_varint(self.initial_max_streams_uni)?;
        }

        if self.ack_delay_exponent != 3 {
            b.put_varint(0x000a)?;
            b.put_varint(octets::varint_len(self.ack_delay_exponent) as u64)?;
            b.put_varint(self.ack_delay_exponent)?;
        }

        if self.max_ack_delay != 25 {
            b.put_varint(0x000b)?;
            b.put_varint(octets::varint_len(self.max_ack_delay) as u64)?;
            b.put_varint(self.max_ack_delay)?;
        }

        if let Some(ref scid) = self.initial_source_connection_id {
            b.put_varint(0x000f)?;
            b.put_varint(scid.len() as u64)?;
            b.put_bytes(scid)?;
        }

        if is_server {
            if let Some(ref rscid) = self.retry_source_connection_id {
                b.put_varint(0x0010)?;
                b.put_varint(rscid.len() as u64)?;
                b.put_bytes(rscid)?;
            }
        }

        Ok(b.off())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let tp = TransportParams {
            original_destination_connection_id: None,
            max_idle_timeout: 30_000,
            stateless_reset_token: Some([0xba; 16]),
            max_udp_payload_size: 23_421,
            initial_max_data: 424_645_563,
            initial_max_stream_data_bidi_local: 154_323_123,
            initial_max_stream_data_bidi_remote: 6_587_456,
            initial_max_stream_data_uni: 2_461_234,
            initial_max_streams_bidi: 12_231,
            initial_max_streams_uni: 18_473,
            ack_delay_exponent: 2,
            max_ack_delay: 2,
            initial_source_connection_id: Some(b"woot woot".to_vec().into()),
            retry_source_connection_id: Some(b"retry".to_vec().into()),
        };

        let mut raw = [0; 256];
        let len = tp.encode(true, &mut raw).unwrap();

        let decoded = TransportParams::decode(&raw[..len], false).unwrap();
        assert_eq!(decoded, tp);
    }

    #[test]
    fn client_must_not_send_server_params() {
        let tp = TransportParams {
            stateless_reset_token: Some([0xba; 16]),
            ..TransportParams::default()
        };

        // A client encoding drops the server-only parameters entirely.
        let mut raw = [0; 256];
        let len = tp.encode(false, &mut raw).unwrap();
        let decoded = TransportParams::decode(&raw[..len], true).unwrap();
        assert_eq!(decoded.stateless_reset_token, None);

        // A server decoding a stateless_reset_token is an error.
        let mut raw = [0; 256];
        let len = tp.encode(true, &mut raw).unwrap();
        assert_eq!(
            TransportParams::decode(&raw[..len], true),
            Err(Error::InvalidTransportParam)
        );
    }

    #[test]
    fn duplicate_param() {
        let mut raw = [0; 32];

        let len = {
            let mut b = octets::OctetsMut::with_slice(&mut raw);
            for _ in 0..2 {
                b.put_varint(0x0001).unwrap();
                b.put_varint(1).unwrap();
                b.put_varint(30).unwrap();
            }
            b.off()
        };

        assert_eq!(
            TransportParams::decode(&raw[..len], false),
            Err(Error::InvalidTransportParam)
        );
    }

    #[test]
    fn unknown_params_are_skipped() {
        let mut raw = [0; 32];

        let len = {
            let mut b = octets::OctetsMut::with_slice(&mut raw);
            b.put_varint(0x1337).unwrap();
            b.put_varint(4).unwrap();
            b.put_bytes(&[1, 2, 3, 4]).unwrap();
            b.put_varint(0x0004).unwrap();
            b.put_varint(2).unwrap();
            b.put_varint(5_000).unwrap();
            b.off()
        };

        let tp = TransportParams::decode(&raw[..len], false).unwrap();
        assert_eq!(tp.initial_max_data, 5_000);
    }
}
