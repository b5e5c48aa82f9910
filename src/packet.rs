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

use std::time::Instant;

use crate::crypto;
use crate::ranges;
use crate::stream;

use crate::ConnectionId;
use crate::Error;
use crate::Result;

const FORM_BIT: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const KEY_PHASE_BIT: u8 = 0x04;

const TYPE_MASK: u8 = 0x30;
const PKT_NUM_MASK: u8 = 0x03;

/// The maximum length of a connection ID.
pub const MAX_CID_LEN: usize = 20;

/// The number of ciphertext bytes sampled for header protection.
const SAMPLE_LEN: usize = 16;

/// Packet number space identifier.
///
/// All three spaces share the `PktNumSpace` structure; key material is
/// owned per space so dropping a space is a single release.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Epoch {
    Initial     = 0,
    Handshake   = 1,
    Application = 2,
}

impl Epoch {
    /// Returns the number of packet number spaces.
    pub const fn count() -> usize {
        3
    }

    /// Iterates over the epochs in `lo..hi` order.
    pub fn epochs(r: std::ops::Range<usize>) -> impl Iterator<Item = Epoch> {
        static ALL: [Epoch; 3] =
            [Epoch::Initial, Epoch::Handshake, Epoch::Application];

        ALL[r].iter().copied()
    }
}

impl From<Epoch> for usize {
    fn from(e: Epoch) -> usize {
        e as usize
    }
}

/// QUIC packet type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    Initial,
    Retry,
    Handshake,
    ZeroRTT,
    VersionNegotiation,
    Short,
}

impl Type {
    pub fn from_epoch(e: Epoch) -> Type {
        match e {
            Epoch::Initial => Type::Initial,
            Epoch::Handshake => Type::Handshake,
            Epoch::Application => Type::Short,
        }
    }

    pub fn to_epoch(self) -> Result<Epoch> {
        match self {
            Type::Initial => Ok(Epoch::Initial),
            Type::Handshake => Ok(Epoch::Handshake),
            Type::Short => Ok(Epoch::Application),
            _ => Err(Error::InvalidPacket),
        }
    }
}

/// A QUIC packet header.
#[derive(Clone, PartialEq, Eq)]
pub struct Header {
    /// The type of the packet.
    pub ty: Type,

    /// The version of the packet. Zero for short headers.
    pub version: u32,

    /// The destination connection ID.
    pub dcid: ConnectionId<'static>,

    /// The source connection ID. Empty for short headers.
    pub scid: ConnectionId<'static>,

    /// The packet number, filled in after header protection is removed.
    pub pkt_num: u64,

    /// The length of the packet number in bytes.
    pub pkt_num_len: usize,

    /// The address verification token of Initial and Retry packets.
    pub token: Option<Vec<u8>>,

    /// The list of versions of Version Negotiation packets.
    pub versions: Option<Vec<u32>>,
}

impl Header {
    /// Parses a packet header up to (but not including) the length and
    /// packet number fields.
    ///
    /// `dcid_len` gives the length of short-header destination CIDs, which
    /// is not carried on the wire.
    pub fn from_bytes(
        b: &mut octets::Octets, dcid_len: usize,
    ) -> Result<Header> {
        let first = b.get_u8()?;

        if first & FORM_BIT == 0 {
            // Decode short header.
            let dcid = b.get_bytes(dcid_len)?;

            return Ok(Header {
                ty: Type::Short,
                version: 0,
                dcid: dcid.to_vec().into(),
                scid: ConnectionId::default(),
                pkt_num: 0,
                pkt_num_len: 0,
                token: None,
                versions: None,
            });
        }

        // Decode long header.
        let version = b.get_u32()?;

        let ty = if version == 0 {
            Type::VersionNegotiation
        } else {
            match (first & TYPE_MASK) >> 4 {
                0x00 => Type::Initial,
                0x01 => Type::ZeroRTT,
                0x02 => Type::Handshake,
                0x03 => Type::Retry,
                _ => return Err(Error::InvalidPacket),
            }
        };

        let dcid_len = b.get_u8()?;
        if dcid_len as usize > MAX_CID_LEN {
            return Err(Error::InvalidPacket);
        }
        let dcid = b.get_bytes(dcid_len as usize)?.to_vec();

        let scid_len = b.get_u8()?;
        if scid_len as usize > MAX_CID_LEN {
            return Err(Error::InvalidPacket);
        }
        let scid = b.get_bytes(scid_len as usize)?.to_vec();

        let mut token: Option<Vec<u8>> = None;
        let mut versions: Option<Vec<u32>> = None;

        match ty {
            Type::Initial => {
                token = Some(b.get_bytes_with_varint_length()?.to_vec());
            },

            Type::Retry => {
                // The integrity tag trails the token.
                let token_len = b
                    .cap()
                    .checked_sub(RETRY_INTEGRITY_TAG_LEN)
                    .ok_or(Error::InvalidPacket)?;

                token = Some(b.get_bytes(token_len)?.to_vec());
            },

            Type::VersionNegotiation => {
                let mut list = Vec::new();

                while b.cap() > 0 {
                    list.push(b.get_u32()?);
                }

                versions = Some(list);
            },

            _ => (),
        };

        Ok(Header {
            ty,
            version,
            dcid: dcid.into(),
            scid: scid.into(),
            pkt_num: 0,
            pkt_num_len: 0,
            token,
            versions,
        })
    }

    /// Encodes the header up to (but not including) the length and packet
    /// number fields. The first byte carries the packet number length so
    /// that header protection can later be applied in place.
    pub fn to_bytes(&self, out: &mut octets::OctetsMut) -> Result<()> {
        // Encode short header.
        if self.ty == Type::Short {
            let mut first = FIXED_BIT;

            first |= (self.pkt_num_len as u8).saturating_sub(1) & PKT_NUM_MASK;

            // Key phase is always 0, key update is not supported.
            first &= !KEY_PHASE_BIT;

            out.put_u8(first)?;
            out.put_bytes(&self.dcid)?;

            return Ok(());
        }

        // Encode long header.
        let ty: u8 = match self.ty {
            Type::Initial => 0x00,
            Type::ZeroRTT => 0x01,
            Type::Handshake => 0x02,
            Type::Retry => 0x03,
            _ => return Err(Error::InvalidPacket),
        };

        let mut first = FORM_BIT | FIXED_BIT | (ty << 4);

        first |= (self.pkt_num_len as u8).saturating_sub(1) & PKT_NUM_MASK;

        out.put_u8(first)?;

        out.put_u32(self.version)?;

        out.put_u8(self.dcid.len() as u8)?;
        out.put_bytes(&self.dcid)?;

        out.put_u8(self.scid.len() as u8)?;
        out.put_bytes(&self.scid)?;

        // Only Initial packets have a token.
        if self.ty == Type::Initial {
            match self.token {
                Some(ref v) => {
                    out.put_varint(v.len() as u64)?;
                    out.put_bytes(v)?;
                },

                None => {
                    out.put_varint(0)?;
                },
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.ty)?;

        if self.ty != Type::Short {
            write!(f, " version={:x}", self.version)?;
        }

        write!(f, " dcid={:?}", self.dcid)?;

        if self.ty != Type::Short {
            write!(f, " scid={:?}", self.scid)?;
        }

        if let Some(ref token) = self.token {
            write!(f, " token=")?;
            for b in token {
                write!(f, "{b:02x}")?;
            }
        }

        if let Some(ref versions) = self.versions {
            write!(f, " versions={versions:x?}")?;
        }

        Ok(())
    }
}

/// Returns the number of bytes used to encode the given packet number.
pub fn pkt_num_len(pn: u64) -> usize {
    if pn < u64::from(u8::MAX) {
        1
    } else if pn < u64::from(u16::MAX) {
        2
    } else if pn < 16_777_215 {
        3
    } else {
        4
    }
}

/// Reconstructs a full packet number from its truncated form, picking the
/// value with the given low bits closest to `largest_pn + 1`.
pub fn decode_pkt_num(largest_pn: u64, truncated_pn: u64, pn_len: usize) -> u64 {
    let pn_nbits = pn_len * 8;
    let expected_pn = largest_pn + 1;
    let pn_win = 1u64 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate_pn = (expected_pn & !pn_mask) | truncated_pn;

    if candidate_pn + pn_hwin <= expected_pn &&
        candidate_pn < (1u64 << 62) - pn_win
    {
        return candidate_pn + pn_win;
    }

    if candidate_pn > expected_pn + pn_hwin && candidate_pn >= pn_win {
        return candidate_pn - pn_win;
    }

    candidate_pn
}

/// Writes a truncated packet number using `pkt_num_len(pn)` bytes.
pub fn encode_pkt_num(pn: u64, b: &mut octets::OctetsMut) -> Result<()> {
    let len = pkt_num_len(pn);

    match len {
        1 => b.put_u8(pn as u8)?,

        2 => b.put_u16(pn as u16)?,

        3 => b.put_u24(pn as u32)?,

        4 => b.put_u32(pn as u32)?,

        _ => return Err(Error::InvalidPacket),
    };

    Ok(())
}

/// Removes header protection in place.
///
/// `pn_offset` is the offset of the (still protected) packet number field.
/// On success the first byte and packet number bytes are unmasked, and the
/// truncated packet number and its length are returned.
pub fn decrypt_hdr(
    buf: &mut [u8], pn_offset: usize, aead: &crypto::Open,
) -> Result<(u64, usize)> {
    let sample_start = pn_offset + 4;

    let sample = buf
        .get(sample_start..sample_start + SAMPLE_LEN)
        .ok_or(Error::BufferTooShort)?;

    let mask = aead.new_mask(sample)?;

    if buf[0] & FORM_BIT != 0 {
        buf[0] ^= mask[0] & 0x0f;
    } else {
        buf[0] ^= mask[0] & 0x1f;
    }

    let pn_len = usize::from(buf[0] & PKT_NUM_MASK) + 1;

    let mut pn: u64 = 0;

    for i in 0..pn_len {
        buf[pn_offset + i] ^= mask[1 + i];

        pn = (pn << 8) | u64::from(buf[pn_offset + i]);
    }

    Ok((pn, pn_len))
}

/// Applies header protection in place, masking the first byte and the
/// `pn_len` packet number bytes at `pn_offset`.
pub fn encrypt_hdr(
    buf: &mut [u8], pn_offset: usize, pn_len: usize, aead: &crypto::Seal,
) -> Result<()> {
    let sample_start = pn_offset + 4;

    let sample = buf
        .get(sample_start..sample_start + SAMPLE_LEN)
        .ok_or(Error::BufferTooShort)?;

    let mask = aead.new_mask(sample)?;

    if buf[0] & FORM_BIT != 0 {
        buf[0] ^= mask[0] & 0x0f;
    } else {
        buf[0] ^= mask[0] & 0x1f;
    }

    for i in 0..pn_len {
        buf[pn_offset + i] ^= mask[1 + i];
    }

    Ok(())
}

pub const RETRY_INTEGRITY_TAG_LEN: usize = 16;

/// Authenticates a Retry packet against the destination connection ID the
/// client originally sent.
pub fn verify_retry_integrity(buf: &[u8], odcid: &[u8]) -> Result<()> {
    let split = buf
        .len()
        .checked_sub(RETRY_INTEGRITY_TAG_LEN)
        .ok_or(Error::InvalidPacket)?;

    let (pseudo, tag) = buf.split_at(split);

    let expected = crypto::retry_integrity_tag(odcid, pseudo)?;

    ring::constant_time::verify_slices_are_equal(&expected, tag)
        .map_err(|_| Error::InvalidToken)
}

/// Encodes a Retry packet, including its integrity tag.
pub fn encode_retry(
    version: u32, scid: &ConnectionId, dcid: &ConnectionId,
    odcid: &ConnectionId, token: &[u8], out: &mut [u8],
) -> Result<usize> {
    let hdr_len = {
        let mut b = octets::OctetsMut::with_slice(out);

        let first = FORM_BIT | FIXED_BIT | (0x03 << 4);

        b.put_u8(first)?;
        b.put_u32(version)?;

        b.put_u8(dcid.len() as u8)?;
        b.put_bytes(dcid)?;

        b.put_u8(scid.len() as u8)?;
        b.put_bytes(scid)?;

        b.put_bytes(token)?;

        b.off()
    };

    let tag = crypto::retry_integrity_tag(odcid, &out[..hdr_len])?;

    if out.len() < hdr_len + RETRY_INTEGRITY_TAG_LEN {
        return Err(Error::BufferTooShort);
    }

    out[hdr_len..hdr_len + RETRY_INTEGRITY_TAG_LEN].copy_from_slice(&tag);

    Ok(hdr_len + RETRY_INTEGRITY_TAG_LEN)
}

/// Encodes a Version Negotiation packet echoing the client's CIDs.
pub fn negotiate_version(
    scid: &ConnectionId, dcid: &ConnectionId, versions: &[u32],
    out: &mut [u8],
) -> Result<usize> {
    let mut b = octets::OctetsMut::with_slice(out);

    let first = crate::rand::rand_u8() | FORM_BIT;

    b.put_u8(first)?;
    b.put_u32(0)?;

    // Invert the client's scid and dcid.
    b.put_u8(scid.len() as u8)?;
    b.put_bytes(scid)?;

    b.put_u8(dcid.len() as u8)?;
    b.put_bytes(dcid)?;

    for version in versions {
        b.put_u32(*version)?;
    }

    Ok(b.off())
}

/// State for a single packet number space.
pub struct PktNumSpace {
    pub crypto_open: Option<crypto::Open>,

    pub crypto_seal: Option<crypto::Seal>,

    /// Packet number for the next sent packet.
    pub next_pkt_num: u64,

    /// The largest packet number received, used for packet number
    /// reconstruction.
    pub largest_rx_pkt_num: u64,

    /// The time the packet with the largest packet number arrived, used to
    /// compute the ack delay advertised to the peer.
    pub largest_rx_pkt_time: Option<Instant>,

    /// Every packet number received in this space, for duplicate detection.
    pub recv_pkt_num: ranges::RangeSet,

    /// Packet numbers that still need to be acknowledged.
    pub recv_pkt_need_ack: ranges::RangeSet,

    /// Whether an ack-eliciting packet was received since the last ACK was
    /// scheduled.
    pub ack_elicited: bool,

    /// Whether any packet sent in this space has been acknowledged yet.
    pub first_pkt_acked: bool,

    /// The CRYPTO message stream for this space.
    pub crypto_stream: stream::Stream,
}

impl PktNumSpace {
    pub fn new() -> PktNumSpace {
        PktNumSpace {
            crypto_open: None,
            crypto_seal: None,

            next_pkt_num: 0,

            largest_rx_pkt_num: 0,
            largest_rx_pkt_time: None,

            recv_pkt_num: ranges::RangeSet::default(),
            recv_pkt_need_ack: ranges::RangeSet::default(),

            ack_elicited: false,
            first_pkt_acked: false,

            crypto_stream: stream::Stream::new(
                u64::MAX, u64::MAX, true, true,
            ),
        }
    }

    /// Discards all state, including key material and buffered CRYPTO data.
    /// Used both when dropping a space for good and when restarting after
    /// Retry or Version Negotiation.
    pub fn clear(&mut self) {
        self.crypto_open = None;
        self.crypto_seal = None;

        self.next_pkt_num = 0;

        self.largest_rx_pkt_num = 0;
        self.largest_rx_pkt_time = None;

        self.recv_pkt_num.clear();
        self.recv_pkt_need_ack.clear();

        self.ack_elicited = false;
        self.first_pkt_acked = false;

        self.crypto_stream = stream::Stream::new(u64::MAX, u64::MAX, true, true);
    }

    pub fn can_decrypt(&self) -> bool {
        self.crypto_open.is_some()
    }

    pub fn can_encrypt(&self) -> bool {
        self.crypto_seal.is_some()
    }

    /// AEAD tag overhead for sealed packets in this space.
    pub fn overhead(&self) -> Option<usize> {
        Some(self.crypto_seal.as_ref()?.alg().tag_len())
    }

    /// Returns true if the space has something to send on its own (an ACK
    /// owed to the peer, or pending CRYPTO data).
    pub fn ready(&self) -> bool {
        self.ack_elicited || self.crypto_stream.is_flushable()
    }
}

impl Default for PktNumSpace {
    fn default() -> Self {
        PktNumSpace::new()
    }
}
