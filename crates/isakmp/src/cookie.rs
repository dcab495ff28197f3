//! Cookies, message IDs and the bucket fold hash
//!
//! Every ISAKMP SA is keyed on the 16-byte cookie pair from the message
//! header; phase 2 SAs add the 4-byte message ID.
//!
//! # Hash
//!
//! ```text
//! cookies    = c0 c1 | c2 c3 | ... | c14 c15
//! message_id = m0 m1 | m2 m3
//!
//! fold   = (c0 | c1 << 8) ^ (c2 | c3 << 8) ^ ... ^ (m2 | m3 << 8)
//! bucket = fold & mask
//! ```
//!
//! At least one half of the cookie pair is ours and therefore random, so
//! XOR-folding 16 bits at a time spreads entries well enough and lets a
//! flood of forged headers be rejected with very little work. It is not a
//! keyed hash: a peer that controls the responder half can aim at a bucket.

use std::fmt;

/// Length of one cookie (initiator or responder)
pub const COOKIE_LEN: usize = 8;

/// Length of the cookie pair
pub const COOKIES_LEN: usize = 2 * COOKIE_LEN;

/// Length of the message ID
pub const MESSAGE_ID_LEN: usize = 4;

/// Initiator ‖ responder cookie pair
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Cookies([u8; COOKIES_LEN]);

impl Cookies {
    /// Create from the full 16-byte pair
    pub fn new(bytes: [u8; COOKIES_LEN]) -> Self {
        Cookies(bytes)
    }

    /// Create from separate halves
    pub fn from_halves(icookie: [u8; COOKIE_LEN], rcookie: [u8; COOKIE_LEN]) -> Self {
        let mut bytes = [0u8; COOKIES_LEN];
        bytes[..COOKIE_LEN].copy_from_slice(&icookie);
        bytes[COOKIE_LEN..].copy_from_slice(&rcookie);
        Cookies(bytes)
    }

    /// Parse from a slice, `None` unless exactly 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; COOKIES_LEN] = bytes.try_into().ok()?;
        Some(Cookies(arr))
    }

    /// Generate a fresh initiator cookie with an empty responder half
    pub fn random_initiator() -> Self {
        use rand::RngCore;

        let mut icookie = [0u8; COOKIE_LEN];
        rand::thread_rng().fill_bytes(&mut icookie);
        Cookies::from_halves(icookie, [0u8; COOKIE_LEN])
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; COOKIES_LEN] {
        &self.0
    }

    /// Initiator half
    pub fn icookie(&self) -> &[u8] {
        &self.0[..COOKIE_LEN]
    }

    /// Responder half
    pub fn rcookie(&self) -> &[u8] {
        &self.0[COOKIE_LEN..]
    }

    /// Has the responder filled in its half yet?
    pub fn has_rcookie(&self) -> bool {
        self.rcookie().iter().any(|&b| b != 0)
    }

    pub(crate) fn set_rcookie(&mut self, rcookie: [u8; COOKIE_LEN]) {
        self.0[COOKIE_LEN..].copy_from_slice(&rcookie);
    }
}

impl fmt::Debug for Cookies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cookies({}:{})",
            hex::encode(self.icookie()),
            hex::encode(self.rcookie())
        )
    }
}

impl From<[u8; COOKIES_LEN]> for Cookies {
    fn from(bytes: [u8; COOKIES_LEN]) -> Self {
        Cookies(bytes)
    }
}

/// ISAKMP message ID
///
/// All-zero for phase 1 exchanges.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    /// The phase 1 message ID
    pub const ZERO: MessageId = MessageId([0u8; MESSAGE_ID_LEN]);

    /// Create from raw bytes
    pub fn new(bytes: [u8; MESSAGE_ID_LEN]) -> Self {
        MessageId(bytes)
    }

    /// Parse from a slice, `None` unless exactly 4 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; MESSAGE_ID_LEN] = bytes.try_into().ok()?;
        Some(MessageId(arr))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }

    /// Big-endian numeric value, for logs
    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Is this the phase 1 (all-zero) message ID?
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; MESSAGE_ID_LEN]
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({:08x})", self.as_u32())
    }
}

impl From<[u8; MESSAGE_ID_LEN]> for MessageId {
    fn from(bytes: [u8; MESSAGE_ID_LEN]) -> Self {
        MessageId(bytes)
    }
}

fn fold(acc: u16, bytes: &[u8]) -> u16 {
    bytes
        .chunks_exact(2)
        .fold(acc, |acc, pair| acc ^ u16::from_le_bytes([pair[0], pair[1]]))
}

/// XOR-fold cookies and optional message ID into 16 bits
pub fn fold_hash(cookies: &Cookies, message_id: Option<&MessageId>) -> u16 {
    let acc = fold(0, cookies.as_bytes());
    match message_id {
        Some(id) => fold(acc, id.as_bytes()),
        None => acc,
    }
}

/// Bucket index for a table whose size is `mask + 1`
pub fn bucket_index(cookies: &Cookies, message_id: Option<&MessageId>, mask: u16) -> usize {
    (fold_hash(cookies, message_id) & mask) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq_cookies() -> Cookies {
        let mut bytes = [0u8; COOKIES_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        Cookies::new(bytes)
    }

    #[test]
    fn test_fold_known_value() {
        // 0x0201 ^ 0x0403 ^ 0x0605 ^ 0x0807 ^ 0x0a09 ^ 0x0c0b ^ 0x0e0d ^ 0x100f
        let expected = [
            0x0201u16, 0x0403, 0x0605, 0x0807, 0x0a09, 0x0c0b, 0x0e0d, 0x100f,
        ]
        .iter()
        .fold(0u16, |a, b| a ^ b);
        assert_eq!(fold_hash(&seq_cookies(), None), expected);
    }

    #[test]
    fn test_hash_is_pure() {
        let cookies = seq_cookies();
        let mid = MessageId::new([9, 9, 9, 9]);
        for mask in [63u16, 127, 0xffff] {
            assert_eq!(
                bucket_index(&cookies, Some(&mid), mask),
                bucket_index(&cookies, Some(&mid), mask)
            );
        }
    }

    #[test]
    fn test_zero_message_id_is_noop() {
        let cookies = seq_cookies();
        assert_eq!(
            fold_hash(&cookies, None),
            fold_hash(&cookies, Some(&MessageId::ZERO))
        );
    }

    #[test]
    fn test_chunk_order_independent() {
        // Swapping whole 2-byte chunks must not change the fold
        let a = Cookies::new([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        let b = Cookies::new([15, 16, 13, 14, 11, 12, 9, 10, 7, 8, 5, 6, 3, 4, 1, 2]);
        assert_eq!(fold_hash(&a, None), fold_hash(&b, None));
    }

    #[test]
    fn test_bucket_within_mask() {
        let cookies = Cookies::new([0xff; COOKIES_LEN]);
        let mid = MessageId::new([0xab, 0xcd, 0xef, 0x01]);
        assert!(bucket_index(&cookies, Some(&mid), 63) < 64);
    }

    #[test]
    fn test_cookie_halves() {
        let c = Cookies::from_halves([1; 8], [0; 8]);
        assert_eq!(c.icookie(), &[1; 8]);
        assert!(!c.has_rcookie());

        let mut c = c;
        c.set_rcookie([2; 8]);
        assert!(c.has_rcookie());
        assert_eq!(c.rcookie(), &[2; 8]);
    }

    #[test]
    fn test_from_slice_rejects_bad_length() {
        assert!(Cookies::from_slice(&[0u8; 15]).is_none());
        assert!(MessageId::from_slice(&[0u8; 5]).is_none());
        assert_eq!(
            MessageId::from_slice(&[0, 0, 0, 1]).map(|m| m.as_u32()),
            Some(1)
        );
    }
}
