//! Key exchange and stream cipher of message stream encryption.
//!
//! Both peers pick a 160 bit private key, exchange `2^x mod P` as a 96 byte
//! big-endian integer and derive two RC4 keys from the shared secret salted
//! with the info hash. The side that opened the connection encrypts with
//! `keyA` and decrypts with `keyB`.
pub mod rc4;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::Rng;

use crate::types::InfoHash;

use self::rc4::Rc4;

/// Width of public keys and of the shared secret.
pub const KEY_LEN: usize = 96;
const PRIVATE_KEY_LEN: usize = 20;

/// Verification constant.
pub const VC: [u8; 8] = [0; 8];

pub const CRYPTO_PLAINTEXT: u32 = 0x01;
pub const CRYPTO_RC4: u32 = 0x02;

const G: u32 = 2;

/// The 768 bit safe prime.
const PRIME: [u8; KEY_LEN] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
    0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
    0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
    0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
    0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
    0xa6, 0x3a, 0x36, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];

pub fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = sha1_smol::Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.digest().bytes()
}

fn prime() -> BigUint {
    BigUint::from_bytes_be(&PRIME)
}

/// Big-endian bytes left padded with zeroes.
fn to_fixed_bytes(n: &BigUint) -> [u8; KEY_LEN] {
    let bytes = n.to_bytes_be();
    let mut out = [0u8; KEY_LEN];
    let len = bytes.len().min(KEY_LEN);
    out[KEY_LEN - len..].copy_from_slice(&bytes[bytes.len() - len..]);
    out
}

/// A Diffie-Hellman key pair and, once the peer key is known, the shared
/// secret.
#[derive(Clone)]
pub struct KeyPair {
    private: BigUint,
    public: [u8; KEY_LEN],
    secret: Option<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", hex::encode(&self.public[..8]))
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_private(rand::thread_rng().gen())
    }

    pub fn from_private(private: [u8; PRIVATE_KEY_LEN]) -> Self {
        let private = BigUint::from_bytes_be(&private);
        let public = BigUint::from(G).modpow(&private, &prime());
        Self { private, public: to_fixed_bytes(&public), secret: None }
    }

    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.public
    }

    /// Derive the shared secret from the peer's public key. Degenerate keys
    /// are refused.
    pub fn compute_secret(&mut self, peer_public: &[u8]) -> bool {
        if peer_public.len() != KEY_LEN {
            return false;
        }
        let p = prime();
        let y = BigUint::from_bytes_be(peer_public);
        if y <= BigUint::one() || y >= &p - BigUint::one() {
            return false;
        }

        let s = y.modpow(&self.private, &p);
        if s.is_zero() {
            return false;
        }
        self.secret = Some(to_fixed_bytes(&s));
        true
    }

    pub fn secret(&self) -> Option<&[u8; KEY_LEN]> {
        self.secret.as_ref()
    }
}

/// Bounded LIFO of key pairs that were never used against a peer.
#[derive(Debug)]
pub struct KeyPool {
    keys: Vec<KeyPair>,
    capacity: usize,
}

impl KeyPool {
    pub fn new(capacity: usize) -> Self {
        Self { keys: Vec::with_capacity(capacity), capacity }
    }

    /// A pool pre-filled with `keys`, in push order.
    pub fn with_keys(capacity: usize, keys: Vec<KeyPair>) -> Self {
        let mut pool = Self::new(capacity);
        for key in keys {
            pool.give_back(key);
        }
        pool
    }

    pub fn take(&mut self) -> KeyPair {
        self.keys.pop().unwrap_or_else(KeyPair::generate)
    }

    /// Keep `key` for the next handshake. Keys that already derived a
    /// secret are dropped.
    pub fn give_back(&mut self, key: KeyPair) {
        if key.secret.is_none() && self.keys.len() < self.capacity {
            self.keys.push(key);
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn cipher(name: &[u8], secret: &[u8; KEY_LEN], info_hash: &InfoHash) -> Rc4 {
    let key = sha1(&[name, secret, &info_hash.0]);
    let mut rc4 = Rc4::new(&key);
    rc4.discard(1024);
    rc4
}

fn encrypt_key(incoming: bool) -> &'static [u8] {
    if incoming {
        b"keyB"
    } else {
        b"keyA"
    }
}

fn decrypt_key(incoming: bool) -> &'static [u8] {
    if incoming {
        b"keyA"
    } else {
        b"keyB"
    }
}

/// `VC` as the peer of a connection in role `incoming` sends it.
pub fn encrypted_vc(
    incoming: bool,
    secret: &[u8; KEY_LEN],
    info_hash: &InfoHash,
) -> [u8; 8] {
    let mut vc = VC;
    cipher(decrypt_key(incoming), secret, info_hash).apply(&mut vc);
    vc
}

/// Per direction cipher state of a connection.
#[derive(Debug, Default)]
pub struct Filter {
    encrypt: Option<Rc4>,
    decrypt: Option<Rc4>,
    /// When set, only this many more bytes are decrypted.
    decrypt_limit: Option<usize>,
}

impl Filter {
    pub fn encrypt_init(
        &mut self,
        incoming: bool,
        secret: &[u8; KEY_LEN],
        info_hash: &InfoHash,
    ) {
        self.encrypt = Some(cipher(encrypt_key(incoming), secret, info_hash));
    }

    pub fn decrypt_init(
        &mut self,
        incoming: bool,
        secret: &[u8; KEY_LEN],
        info_hash: &InfoHash,
    ) {
        self.decrypt = Some(cipher(decrypt_key(incoming), secret, info_hash));
        self.decrypt_limit = None;
    }

    pub fn is_encrypting(&self) -> bool {
        self.encrypt.is_some()
    }

    pub fn is_decrypting(&self) -> bool {
        self.decrypt.is_some()
    }

    pub fn encrypt(&mut self, buf: &mut [u8]) {
        if let Some(rc4) = &mut self.encrypt {
            rc4.apply(buf);
        }
    }

    pub fn decrypt(&mut self, buf: &mut [u8]) {
        let Some(rc4) = &mut self.decrypt else { return };

        match self.decrypt_limit {
            None => rc4.apply(buf),
            Some(limit) => {
                let n = limit.min(buf.len());
                rc4.apply(&mut buf[..n]);
                if n == limit {
                    self.disable_decrypt();
                } else {
                    self.decrypt_limit = Some(limit - n);
                }
            }
        }
    }

    pub fn disable_encrypt(&mut self) {
        self.encrypt = None;
    }

    pub fn disable_decrypt(&mut self) {
        self.decrypt = None;
        self.decrypt_limit = None;
    }

    /// Decrypt `n` more bytes and then stop. With `n == 0` decryption stops
    /// right away.
    pub fn set_decrypt_limit(&mut self, n: usize) {
        if n == 0 {
            self.disable_decrypt();
        } else if self.decrypt.is_some() {
            self.decrypt_limit = Some(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_secret() {
        let mut a = KeyPair::from_private([7; 20]);
        let mut b = KeyPair::generate();
        let a_pub = *a.public_key();
        let b_pub = *b.public_key();

        assert!(a.compute_secret(&b_pub));
        assert!(b.compute_secret(&a_pub));
        assert_eq!(a.secret(), b.secret());
        assert_ne!(a_pub, b_pub);
    }

    #[test]
    fn degenerate_keys_are_refused() {
        let mut a = KeyPair::generate();
        assert!(!a.compute_secret(&[0u8; KEY_LEN]));
        let mut one = [0u8; KEY_LEN];
        one[KEY_LEN - 1] = 1;
        assert!(!a.compute_secret(&one));
        assert!(!a.compute_secret(&[1u8; 10]));
        assert!(!a.compute_secret(&PRIME));
        assert!(a.secret().is_none());
    }

    #[test]
    fn public_key_is_padded() {
        // 2^1 mod P
        let key = KeyPair::from_private({
            let mut k = [0u8; 20];
            k[19] = 1;
            k
        });
        let mut expected = [0u8; KEY_LEN];
        expected[KEY_LEN - 1] = 2;
        assert_eq!(key.public_key(), &expected);
    }

    #[test]
    fn filters_of_both_roles_match() {
        let secret = [3u8; KEY_LEN];
        let hash = InfoHash([9; 20]);

        let mut outgoing = Filter::default();
        outgoing.encrypt_init(false, &secret, &hash);
        outgoing.decrypt_init(false, &secret, &hash);
        let mut incoming = Filter::default();
        incoming.encrypt_init(true, &secret, &hash);
        incoming.decrypt_init(true, &secret, &hash);

        let mut msg = b"hello peer".to_vec();
        outgoing.encrypt(&mut msg);
        assert_ne!(&msg, b"hello peer");
        incoming.decrypt(&mut msg);
        assert_eq!(&msg, b"hello peer");

        // the first bytes the receiving side encrypts are the needle the
        // initiator scans for
        let mut fresh = Filter::default();
        fresh.encrypt_init(true, &secret, &hash);
        let mut vc = VC;
        fresh.encrypt(&mut vc);
        assert_eq!(vc, encrypted_vc(false, &secret, &hash));
    }

    #[test]
    fn decrypt_limit_stops_midway() {
        let secret = [5u8; KEY_LEN];
        let hash = InfoHash([1; 20]);

        let mut enc = Filter::default();
        enc.encrypt_init(false, &secret, &hash);
        let mut dec = Filter::default();
        dec.decrypt_init(true, &secret, &hash);

        let mut buf = b"0123456789".to_vec();
        enc.encrypt(&mut buf[..4]);
        dec.set_decrypt_limit(4);

        dec.decrypt(&mut buf[..3]);
        assert!(dec.is_decrypting());
        dec.decrypt(&mut buf[3..]);
        assert!(!dec.is_decrypting());
        assert_eq!(&buf, b"0123456789");
    }

    #[test]
    fn pool_is_bounded_lifo() {
        let a = KeyPair::from_private([1; 20]);
        let b = KeyPair::from_private([2; 20]);
        let c = KeyPair::from_private([3; 20]);
        let b_pub = *b.public_key();
        let mut pool = KeyPool::with_keys(2, vec![a, b, c]);

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.take().public_key(), &b_pub);

        let mut used = pool.take();
        let peer = *KeyPair::generate().public_key();
        assert!(used.compute_secret(&peer));
        pool.give_back(used);
        assert!(pool.is_empty());
    }
}
