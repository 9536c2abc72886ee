//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// Reserved bytes exchanged during handshake.
type ReservedAlias = BitArray<[u8; 8], Msb0>;

/// Bit 43 (`reserved[5] & 0x10`).
const EXTENSION_PROTOCOL: usize = 43;
/// Bit 61 (`reserved[7] & 0x04`).
const FAST_EXTENSION: usize = 61;
/// Bit 63 (`reserved[7] & 0x01`).
const DHT: usize = 63;

#[derive(Debug, Clone, Default, Copy, PartialEq, Eq)]
pub struct Reserved(pub ReservedAlias);

impl From<[u8; 8]> for Reserved {
    fn from(value: [u8; 8]) -> Self {
        Self(ReservedAlias::from(value))
    }
}

impl From<Reserved> for [u8; 8] {
    fn from(value: Reserved) -> Self {
        value.0.into_inner()
    }
}

impl Reserved {
    /// Reserved bits of protocols that the client supports.
    pub fn supported(dht: bool) -> Reserved {
        let mut r = Reserved::default();
        r.0.set(EXTENSION_PROTOCOL, true);
        r.0.set(FAST_EXTENSION, true);
        r.0.set(DHT, dht);
        r
    }

    pub fn supports_extended(&self) -> bool {
        self.0[EXTENSION_PROTOCOL]
    }

    pub fn supports_fast(&self) -> bool {
        self.0[FAST_EXTENSION]
    }

    pub fn supports_dht(&self) -> bool {
        self.0[DHT]
    }
}

pub trait VczBitfield {
    /// Like `get`, but indexes past the end read as `false`.
    fn has(&self, index: usize) -> bool;
}

impl VczBitfield for Bitfield {
    fn has(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }
}
