//! Reversible bijection between arbitrary user-chosen filename bytes and the
//! restricted alphabet the backend accepts for attachment names.
//!
//! The original implementation (`examples/original_source/src/dcfs.c`,
//! `b64encode`/`b64decode`) hand-rolls base64 over a fixed-size C buffer.
//! DCFS keeps the same URL-safe, unpadded alphabet but leans on the `base64`
//! crate rather than reimplementing the bit-packing by hand. The codec works
//! on raw bytes rather than `str`: a filename is whatever bytes the kernel
//! handed the dispatcher, and nothing downstream requires them to be valid
//! UTF-8.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::DcfsError;

/// Matches the original's `decoded_filename[256]` stack buffer: the largest
/// decoded filename DCFS will accept.
pub const MAX_DECODED_FILENAME: usize = 256;

/// Suffix template for part k >= 1, applied to the *decoded* filename.
pub fn part_suffix(k: usize) -> Vec<u8> {
    format!(".PART{k}").into_bytes()
}

fn rfind_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Splits a decoded name of the form `<head>.PART<k>` into `(head, k)`.
/// Returns `None` if the name has no recognizable part suffix (i.e. it is a
/// head name, k = 0).
pub fn split_part_suffix(decoded: &[u8]) -> Option<(&[u8], usize)> {
    const NEEDLE: &[u8] = b".PART";
    let idx = rfind_subslice(decoded, NEEDLE)?;
    let (head, rest) = decoded.split_at(idx);
    let digits = &rest[NEEDLE.len()..];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let k: usize = std::str::from_utf8(digits).ok()?.parse().ok()?;
    if k == 0 {
        // ".PART0" is reserved for the head itself and never produced.
        return None;
    }
    Some((head, k))
}

/// Encodes arbitrary filename bytes into the backend-safe alphabet.
pub fn encode(decoded: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(decoded)
}

/// Reverses `encode`. Fails with `DcfsError::Codec` if `encoded` is not
/// valid URL-safe base64. Round-trips any byte sequence, including ones that
/// are not valid UTF-8 — DCFS filenames are arbitrary bytes on the wire, not
/// necessarily text.
pub fn decode(encoded: &str) -> Result<Vec<u8>, DcfsError> {
    URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| DcfsError::Codec(format!("invalid filename encoding: {e}")))
}
