//! Stream cipher protecting the reader's scramble-key tables.
//!
//! The reader ships `Ctbl`/`Ptbl` encrypted with a 32-bit XOR-shift keystream
//! seeded from the title cid and the per-run nonce `k`. Decrypting them yields
//! a JSON array of scramble-key strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("cipher input contains a non-printable code point: U+{0:04X}")]
    NonPrintableInput(u32),
    #[error("decrypted key table is not a JSON string array: {0}")]
    BadKeyTable(#[from] serde_json::Error),
    #[error("decrypted key table is not valid UTF-8")]
    NotUtf8,
}

/// Fold `cid + ":" + k` into the 32-bit keystream seed.
pub fn keystream_seed(cid: &str, k: &str) -> u32 {
    let mut acc: u32 = 0;
    for (i, ch) in format!("{cid}:{k}").chars().enumerate() {
        acc = acc.wrapping_add((ch as u32) << (i % 16));
    }
    acc &= 0x7FFF_FFFF;
    if acc != 0 { acc } else { 0x1234_5678 }
}

/// Decrypt one key-table string. Output length always equals input length and
/// every output byte is printable ASCII.
pub fn decrypt(cid: &str, k: &str, data: &str) -> Result<Vec<u8>, CipherError> {
    let mut state = keystream_seed(cid, k);
    let mut out = Vec::with_capacity(data.len());
    for ch in data.chars() {
        let code = ch as u32;
        if !(0x20..0x7F).contains(&code) {
            return Err(CipherError::NonPrintableInput(code));
        }
        state = (state >> 1) ^ ((state & 1).wrapping_neg() & 0x4820_0004);
        out.push((((code - 0x20).wrapping_add(state)) % 0x5E + 0x20) as u8);
    }
    Ok(out)
}

/// Decrypt a key table and parse it as a JSON array of key strings.
pub fn decrypt_key_table(cid: &str, k: &str, data: &str) -> Result<Vec<String>, CipherError> {
    let raw = decrypt(cid, k, data)?;
    let text = std::str::from_utf8(&raw).map_err(|_| CipherError::NotUtf8)?;
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CID: &str = "0000_1";
    const K: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

    #[test]
    fn seed_folding() {
        assert_eq!(keystream_seed(CID, K), 0x0082_1CDE);
    }

    #[test]
    fn reference_vector() {
        let out = decrypt(CID, K, "!!!").unwrap();
        assert_eq!(out, b"hfV");
    }

    #[test]
    fn decrypts_a_key_table() {
        let keys = decrypt_key_table(CID, K, "r;f;2AbYo3i&xY").unwrap();
        assert_eq!(keys, vec!["=1-1+0-AAA".to_string()]);
    }

    #[test]
    fn deterministic_and_length_preserving() {
        let input = "Kn2^ q9!zzz~}  |0";
        let a = decrypt(CID, K, input).unwrap();
        let b = decrypt(CID, K, input).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), input.len());
        assert!(a.iter().all(|&c| (0x20..0x7F).contains(&c)));
    }

    #[test]
    fn rejects_non_printable_input() {
        assert!(matches!(
            decrypt(CID, K, "ab\u{3042}"),
            Err(CipherError::NonPrintableInput(0x3042))
        ));
        assert!(matches!(
            decrypt(CID, K, "ab\t"),
            Err(CipherError::NonPrintableInput(0x9))
        ));
    }

    #[test]
    fn garbage_table_is_rejected() {
        // decrypts fine but is not JSON
        assert!(decrypt_key_table(CID, K, "zzzzzz").is_err());
    }
}
