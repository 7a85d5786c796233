//! Key-dependent byte substitution.
//!
//! The table is built by swapping pairs of the identity permutation, walking
//! the deduplicated key from both ends. Swaps make the table an involution,
//! so the same call encrypts and decrypts.

pub fn encrypt(data: &[u8], key: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }

    let table = table(&unique(key));

    data.iter().map(|b| table[usize::from(*b)]).collect()
}

pub fn decrypt(data: &[u8], key: &[u8]) -> Vec<u8> {
    encrypt(data, key)
}

/// Key bytes with duplicates removed, first occurrence wins.
fn unique(key: &[u8]) -> Vec<u8> {
    let mut seen = [false; 256];
    let mut uniq = Vec::with_capacity(key.len());

    for b in key {
        if !seen[usize::from(*b)] {
            seen[usize::from(*b)] = true;
            uniq.push(*b);
        }
    }

    uniq
}

fn table(key: &[u8]) -> [u8; 256] {
    let mut table = [0u8; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        *slot = i as u8;
    }

    for i in 0..key.len() / 2 {
        table.swap(
            usize::from(key[i]),
            usize::from(key[key.len() - i - 1]),
        );
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        let encrypted = encrypt(b"Hello World!12345", b"1234567890");

        assert_eq!(encrypted, b"Hello World!09876");
        assert_eq!(decrypt(&encrypted, b"1234567890"), b"Hello World!12345");
    }

    #[test]
    fn involution_for_arbitrary_keys() {
        let data = (0..=255u8).collect::<Vec<_>>();

        for key in [
            b"".as_slice(),
            b"a",
            b"aabbcc",
            b"\x00\xff\x10\x20\x30\x40",
            b"the quick brown fox jumps over the lazy dog",
        ] {
            let once = encrypt(&data, key);
            let twice = encrypt(&once, key);

            assert_eq!(twice, data);
        }
    }

    #[test]
    fn empty_key_is_identity() {
        let data = b"unchanged".to_vec();

        assert_eq!(encrypt(&data, b""), data);
    }
}
