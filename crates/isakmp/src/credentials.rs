//! Key and credential material held by an SA
//!
//! Each item here belongs to a collaborator outside the core: key state to
//! the crypto layer, received certificates to whichever certificate handler
//! understands their encoding, and the policy session to the trust engine.
//! The SA only stores them and hands them back on teardown.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use zeroize::Zeroizing;

/// Negotiated key state
///
/// The key bytes are wiped when the state is dropped.
pub struct KeyState {
    /// Algorithm identifier the key was derived for
    pub algorithm: u16,
    key: Zeroizing<Vec<u8>>,
}

impl KeyState {
    /// Create key state for `algorithm` from raw key material
    pub fn new(algorithm: u16, key: Vec<u8>) -> Self {
        KeyState {
            algorithm,
            key: Zeroizing::new(key),
        }
    }

    /// Key bytes
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Key length in bytes
    pub fn key_len(&self) -> usize {
        self.key.len()
    }
}

impl fmt::Debug for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyState")
            .field("algorithm", &self.algorithm)
            .field("key_len", &self.key.len())
            .finish()
    }
}

/// Certificate encodings (RFC 2408 Section 3.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CertEncoding {
    /// No certificate
    None = 0,
    /// PKCS #7 wrapped X.509
    Pkcs = 1,
    /// PGP
    Pgp = 2,
    /// DNS signed key
    Dns = 3,
    /// X.509 signature
    X509Sig = 4,
    /// X.509 key exchange
    X509Ke = 5,
    /// Kerberos tokens
    Kerberos = 6,
    /// Certificate revocation list
    Crl = 7,
    /// Authority revocation list
    Arl = 8,
    /// SPKI
    Spki = 9,
    /// X.509 attribute
    X509Attr = 10,
    /// KeyNote credential
    KeyNote = 11,
}

impl CertEncoding {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CertEncoding::None),
            1 => Some(CertEncoding::Pkcs),
            2 => Some(CertEncoding::Pgp),
            3 => Some(CertEncoding::Dns),
            4 => Some(CertEncoding::X509Sig),
            5 => Some(CertEncoding::X509Ke),
            6 => Some(CertEncoding::Kerberos),
            7 => Some(CertEncoding::Crl),
            8 => Some(CertEncoding::Arl),
            9 => Some(CertEncoding::Spki),
            10 => Some(CertEncoding::X509Attr),
            11 => Some(CertEncoding::KeyNote),
            _ => None,
        }
    }
}

/// Certificate received from the peer during phase 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCert {
    /// Encoding of `data`
    pub encoding: CertEncoding,
    /// Encoded certificate
    pub data: Vec<u8>,
}

/// Handler owning certificates of one encoding
pub trait CertHandler: Send + Sync {
    /// Release a certificate previously accepted by this handler
    fn release(&self, cert: ReceivedCert);
}

/// Certificate handlers indexed by encoding
#[derive(Default, Clone)]
pub struct CertHandlers {
    handlers: HashMap<CertEncoding, Arc<dyn CertHandler>>,
}

impl CertHandlers {
    /// Create empty handler set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register handler for `encoding`, replacing any previous one
    pub fn register(&mut self, encoding: CertEncoding, handler: Arc<dyn CertHandler>) {
        self.handlers.insert(encoding, handler);
    }

    /// Hand `cert` back to its handler
    ///
    /// Certificates without encoding, or with no registered handler, are
    /// dropped directly.
    pub fn release(&self, cert: ReceivedCert) {
        if cert.encoding == CertEncoding::None {
            return;
        }
        match self.handlers.get(&cert.encoding) {
            Some(handler) => handler.release(cert),
            None => {
                tracing::debug!(
                    encoding = ?cert.encoding,
                    "no certificate handler registered, dropping certificate"
                );
            }
        }
    }
}

impl fmt::Debug for CertHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// Session handle held with the trust/policy engine
pub trait PolicySession: Send + Sync + fmt::Debug {
    /// Close the session; called once on SA teardown
    fn close(&mut self);
}
