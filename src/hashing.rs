//! Hash & encoding utilities
//!
//! Word signatures route terms to posting-list shards (`word_sig`), message
//! identifiers dedupe messages and match References/In-Reply-To headers
//! (`msg_id_hash`), and every numeric on-disk field is base36.

use base64::Engine;
use sha1::{Digest, Sha1};

/// Number of hex-ish characters making up a full word signature.
pub const HASH_LEN: usize = 12;

const BASE36_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// `b64c`: strip padding/newlines from a base64 string and make it filename-safe.
fn b64c(s: &str) -> String {
    s.chars()
        .filter(|&c| c != '\n' && c != '=')
        .map(|c| if c == '/' { '_' } else { c })
        .collect()
}

/// `sha1b64`: base64 of the raw SHA-1 digest of `s`'s UTF-8 bytes.
fn sha1b64(s: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(s.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Full signature of a word: the first `2*HASH_LEN` hex-ish characters of
/// `sha1b64`, cleaned up via `b64c`. Longer than strictly needed so callers
/// can route on any prefix of it.
pub fn word_sig(word: &str) -> String {
    let sig = b64c(&sha1b64(word));
    take_chars(&sig, 2 * HASH_LEN)
}

/// Derived id of a Message-ID (or PTR fallback): `b64c(sha1b64(trimmed))`.
pub fn msg_id_hash(s: &str) -> String {
    b64c(&sha1b64(s.trim()))
}

fn take_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// Encode a non-negative integer as uppercase base36 text.
/// `base36(0) == "0"`.
pub fn base36(mut number: u64) -> String {
    if number == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while number > 0 {
        let rem = (number % 36) as usize;
        digits.push(BASE36_ALPHABET[rem]);
        number /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 alphabet is ASCII")
}

/// Decode a base36 string (case-insensitive) back into an integer.
pub fn from_base36(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for c in s.chars() {
        let digit = c.to_ascii_uppercase();
        let pos = BASE36_ALPHABET.iter().position(|&b| b == digit as u8)?;
        value = value.checked_mul(36)?.checked_add(pos as u64)?;
    }
    Some(value)
}

/// Deterministic short identifier: strip everything but lowercase
/// alphanumerics, then pad with `word_sig`-derived filler until at least
/// `n` characters long, and truncate to exactly `n`.
pub fn short_hash(s: &str, n: usize) -> String {
    let mut out: String = s
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    while out.len() < n {
        out.push_str(&word_sig(s).to_lowercase());
    }
    out.truncate(n);
    out
}
