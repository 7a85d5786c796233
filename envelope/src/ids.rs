use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore as _;

/// A short url-safe identifier from `num_bytes` of CSPRNG entropy.
///
/// 3 bytes are plenty for a tunnel id (one per remote URL), 6 bytes make
/// stream-id collisions within a tunnel's lifetime negligible.
pub fn random_id(num_bytes: usize) -> String {
    let mut buf = vec![0u8; num_bytes];
    rand::thread_rng().fill_bytes(&mut buf);

    URL_SAFE_NO_PAD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_url_safe_and_unpadded() {
        for _ in 0..100 {
            let id = random_id(6);

            assert_eq!(id.len(), 8);
            assert!(
                id.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            );
        }
    }
}
