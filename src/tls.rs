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

use crate::crypto;
use crate::packet;

use crate::Error;
use crate::Result;

/// An artifact produced by driving the TLS session.
pub enum Output {
    /// Handshake bytes to be carried in CRYPTO frames at the given level.
    Crypto {
        level: crypto::Level,
        data: Vec<u8>,
    },

    /// New receive keys for the given level.
    ReadKeys {
        level: crypto::Level,
        open: crypto::Open,
    },

    /// New transmit keys for the given level.
    WriteKeys {
        level: crypto::Level,
        seal: crypto::Seal,
    },

    /// The handshake completed.
    Complete,
}

/// The TLS 1.3 engine behind the transport.
///
/// The transport feeds it CRYPTO bytes per encryption level and drives it
/// via [`process()`]; the engine answers with CRYPTO bytes of its own, key
/// material, and eventually a completion signal. Implementations perform no
/// I/O of their own.
///
/// [`process()`]: trait.Session.html#tymethod.process
pub trait Session {
    /// Installs the local transport parameters, already encoded, to be
    /// carried in the handshake.
    fn set_transport_params(&mut self, params: &[u8]) -> Result<()>;

    /// Restarts the session from scratch, after Retry or Version
    /// Negotiation.
    fn reset(&mut self) -> Result<()>;

    /// Feeds reassembled CRYPTO bytes received at the given level.
    fn provide_data(&mut self, level: crypto::Level, data: &[u8])
        -> Result<()>;

    /// Makes progress, returning whatever the handshake produced.
    fn process(&mut self) -> Result<Vec<Output>>;

    /// Returns true once the handshake has completed.
    fn is_completed(&self) -> bool;

    /// The peer's raw encoded transport parameters, once received.
    fn peer_transport_params(&self) -> Option<&[u8]>;

    /// The TLS alert that ended the handshake, if it failed.
    fn alert(&self) -> Option<u8>;
}

/// Drives a [`Session`] and wires its outputs into the packet number
/// spaces: CRYPTO bytes onto the per-space send streams, keys into the
/// per-space openers and sealers.
///
/// [`Session`]: trait.Session.html
pub struct Handshake {
    session: Box<dyn Session>,

    /// The latest level write keys were installed for; probe and close
    /// packets are sent in this space.
    write_level: crypto::Level,
}

impl Handshake {
    pub fn new(session: Box<dyn Session>) -> Handshake {
        Handshake {
            session,
            write_level: crypto::Level::Initial,
        }
    }

    pub fn set_transport_params(&mut self, params: &[u8]) -> Result<()> {
        self.session.set_transport_params(params)
    }

    /// Restarts the handshake after Retry or Version Negotiation.
    pub fn reset(&mut self) -> Result<()> {
        self.write_level = crypto::Level::Initial;

        self.session.reset()
    }

    /// Feeds pending reassembled CRYPTO data into the session and applies
    /// everything the session produces in response.
    pub fn advance(
        &mut self, spaces: &mut [packet::PktNumSpace; packet::Epoch::count()],
    ) -> Result<()> {
        let mut chunk = [0; 512];

        for epoch in packet::Epoch::epochs(0..packet::Epoch::count()) {
            let space = &mut spaces[usize::from(epoch)];
            let level = crypto::Level::from_epoch(epoch);

            loop {
                let (len, _) = match space.crypto_stream.recv.emit(&mut chunk) {
                    Ok(v) => v,
                    Err(Error::Done) => break,
                    Err(e) => return Err(e),
                };

                self.feed(level, &chunk[..len])?;
            }
        }

        let outputs = match self.session.process() {
            Ok(v) => v,
            Err(e) => return Err(self.tls_error(e)),
        };

        for output in outputs {
            match output {
                Output::Crypto { level, data } => {
                    let epoch = epoch_for(level)?;
                    spaces[usize::from(epoch)]
                        .crypto_stream
                        .send
                        .write(&data, false)?;
                },

                Output::ReadKeys { level, open } => {
                    let epoch = epoch_for(level)?;
                    spaces[usize::from(epoch)].crypto_open = Some(open);
                },

                Output::WriteKeys { level, seal } => {
                    let epoch = epoch_for(level)?;
                    spaces[usize::from(epoch)].crypto_seal = Some(seal);

                    if level > self.write_level() {
                        self.write_level = level;
                    }
                },

                Output::Complete => (),
            }
        }

        Ok(())
    }

    fn feed(&mut self, level: crypto::Level, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        match self.session.provide_data(level, data) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.tls_error(e)),
        }
    }

    // A failure inside the TLS engine closes the connection with
    // CRYPTO_ERROR when an alert is available.
    fn tls_error(&self, e: Error) -> Error {
        match self.session.alert() {
            Some(alert) => Error::TlsFail(alert),
            None => e,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.session.is_completed()
    }

    pub fn peer_transport_params(&self) -> Option<&[u8]> {
        self.session.peer_transport_params()
    }

    /// The level of the latest installed write keys.
    pub fn write_level(&self) -> crypto::Level {
        self.write_level
    }

    /// The packet number space probe and close packets should use.
    pub fn write_epoch(&self) -> packet::Epoch {
        match self.write_level {
            crypto::Level::Initial => packet::Epoch::Initial,
            crypto::Level::Handshake => packet::Epoch::Handshake,
            crypto::Level::Application => packet::Epoch::Application,
            // 0-RTT keys are never installed.
            crypto::Level::ZeroRTT => packet::Epoch::Initial,
        }
    }
}

fn epoch_for(level: crypto::Level) -> Result<packet::Epoch> {
    match level {
        crypto::Level::Initial => Ok(packet::Epoch::Initial),
        crypto::Level::Handshake => Ok(packet::Epoch::Handshake),
        crypto::Level::Application => Ok(packet::Epoch::Application),
        crypto::Level::ZeroRTT => Err(Error::InvalidState),
    }
}
