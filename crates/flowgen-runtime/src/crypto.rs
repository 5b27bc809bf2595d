//! Injected payload transform hook.
//!
//! An AEAD context may be supplied at configure time; the engine then
//! wraps every outbound payload and unwraps every inbound one before
//! it reaches `on_message`. The wire shape is fixed — a 5-byte record
//! header, the ciphertext, and a 16-byte tag — but the cipher itself
//! lives entirely behind this trait; the engine carries no cipher
//! logic.

/// Record header length in bytes.
pub const FRAME_HEADER_LEN: usize = 5;
/// Authentication tag length in bytes.
pub const FRAME_TAG_LEN: usize = 16;
/// Total per-record overhead added by a sealer.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_LEN + FRAME_TAG_LEN;

pub trait Sealer: Send + Sync {
    /// Wrap a plaintext payload into a full record
    /// (header + ciphertext + tag).
    fn seal(&self, plaintext: &[u8]) -> Vec<u8>;

    /// Unwrap the first complete record at the start of `data`.
    /// `None` when the record is still incomplete or fails to
    /// authenticate; the caller retries with more bytes.
    fn open(&self, data: &[u8]) -> Option<Vec<u8>>;
}
