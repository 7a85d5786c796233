//! The envelope codec: every wire frame is an obfuscated, length-padded,
//! encrypted rendition of one [`Message`].
//!
//! Pack pipeline: TLV-serialize, XXTEA-encrypt with the shared password,
//! prepend a fresh 16-byte key `K`, then substitute the ciphertext through a
//! `K`-dependent byte permutation. Short ciphertexts additionally get a
//! random amount of padding; the padding length is recoverable from `K`
//! alone, so the frame carries no cleartext structure beyond its length.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod ids;
mod message;
pub mod shuffle;
pub mod xxtea;

use bytes::BufMut;
use rand::{Rng as _, RngCore as _};
use secrecy::{ExposeSecret as _, SecretString};

pub use ids::random_id;
pub use message::{Cmd, Message};

/// Lower bound of the key-derived offset; keeps `tag - offset` from underflowing.
const MAGIC: usize = 31;
pub const KEY_LENGTH: usize = 16;
/// Ciphertexts shorter than this get padded into `[MIN, MAX]` target lengths.
pub const MIN_INPUT_LENGTH: usize = 384;
pub const MAX_TARGET_LENGTH: usize = 792;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("frame of {0} bytes is too short to carry an envelope")]
    Truncated(usize),
    #[error("padding of {padding} bytes exceeds the remaining {remaining} frame bytes")]
    Padding { padding: usize, remaining: usize },
    #[error("length tag is smaller than the key-derived offset")]
    Offset,
    #[error("ciphertext failed length validation")]
    Cipher,
    #[error("unknown command byte {0}")]
    UnknownCmd(u8),
    #[error("message body ended prematurely")]
    Schema,
}

/// Packs and unpacks [`Message`]s with a shared password.
#[derive(Clone)]
pub struct Packer {
    password: SecretString,
}

impl Packer {
    pub fn new(password: SecretString) -> Self {
        Self { password }
    }

    pub fn pack(&self, msg: &Message) -> Vec<u8> {
        let ciphertext = xxtea::encrypt(
            &msg.encode(),
            self.password.expose_secret().as_bytes(),
        );

        let mut rng = rand::thread_rng();
        let mut key = [0u8; KEY_LENGTH];
        rng.fill_bytes(&mut key);

        let offset = derive_offset(&key);
        let shuffled = shuffle::encrypt(&ciphertext, &key);

        let mut frame =
            Vec::with_capacity(KEY_LENGTH + 2 + shuffled.len().max(MAX_TARGET_LENGTH));
        frame.put_slice(&key);

        if shuffled.len() >= MIN_INPUT_LENGTH {
            frame.put_u16(offset as u16);
            frame.put_slice(&shuffled);
        } else {
            let add = MIN_INPUT_LENGTH - shuffled.len()
                + rng.gen_range(0..=MAX_TARGET_LENGTH - MIN_INPUT_LENGTH);

            frame.put_u16((offset + add) as u16);

            let mut padding = vec![0u8; add];
            rng.fill_bytes(&mut padding);
            frame.put_slice(&padding);
            frame.put_slice(&shuffled);
        }

        frame
    }

    pub fn unpack(&self, frame: &[u8]) -> Result<Message, Error> {
        if frame.len() < KEY_LENGTH + 2 {
            return Err(Error::Truncated(frame.len()));
        }

        let (key, rest) = frame.split_at(KEY_LENGTH);
        let tag = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
        let body = &rest[2..];

        let padding = tag.checked_sub(derive_offset(key)).ok_or(Error::Offset)?;
        if padding > body.len() {
            return Err(Error::Padding {
                padding,
                remaining: body.len(),
            });
        }

        let ciphertext = shuffle::decrypt(&body[padding..], key);
        let plaintext = xxtea::decrypt(&ciphertext, self.password.expose_secret().as_bytes())
            .ok_or(Error::Cipher)?;

        Message::decode(&plaintext)
    }
}

/// The padding offset hidden in bytes 3..5 of the random key.
///
/// Clamping from below by `MAX_TARGET_LENGTH + MAGIC` before subtracting
/// keeps the result in `[MAGIC, 0xFFFF - MAX_TARGET_LENGTH]`, so the
/// transmitted `offset + padding` always fits a u16 and never underflows on
/// the receiving side.
fn derive_offset(key: &[u8]) -> usize {
    let raw = usize::from(u16::from_le_bytes([key[3], key[4]]));

    raw.max(MAX_TARGET_LENGTH + MAGIC) - MAX_TARGET_LENGTH
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packer() -> Packer {
        Packer::new(SecretString::from("pass123"))
    }

    #[test]
    fn round_trips_connect_message() {
        let msg = Message {
            cmd: Cmd::Connect,
            tid: "wid".to_owned(),
            sid: "cid1234".to_owned(),
            ok: true,
            msg: String::new(),
            network: "tcp".to_owned(),
            address: "a:80".to_owned(),
            data: vec![1, 2, 3, 4, 244, 233, 222, 211],
        };

        let unpacked = packer().unpack(&packer().pack(&msg)).unwrap();

        assert_eq!(unpacked, msg);
    }

    #[test]
    fn round_trips_all_commands() {
        let packer = packer();

        for msg in [
            Message::connect("w1", "c1", "tcp", "example.test:80"),
            Message::connect_ok("w1", "c1"),
            Message::connect_err("w1", "c1", "connection refused"),
            Message::data("w1", "c1", "tcp", "example.test:80", vec![9; 4096]),
            Message::close("w1", "c1"),
            Message::switch("w1"),
        ] {
            assert_eq!(packer.unpack(&packer.pack(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn short_frames_are_padded_into_the_target_window() {
        let packer = packer();
        let msg = Message::close("w1", "c1");

        for _ in 0..100 {
            let frame = packer.pack(&msg);

            assert!(frame.len() >= MIN_INPUT_LENGTH + KEY_LENGTH + 2);
            assert!(frame.len() <= MAX_TARGET_LENGTH + KEY_LENGTH + 2);
        }
    }

    #[test]
    fn long_frames_carry_no_padding() {
        let packer = packer();
        let msg = Message::data("w1", "c1", "tcp", "a:80", vec![7; 8192]);

        let ciphertext_len = xxtea::encrypt(&msg.encode(), b"pass123").len();
        assert!(ciphertext_len >= MIN_INPUT_LENGTH);

        let frame = packer.pack(&msg);

        assert_eq!(frame.len(), KEY_LENGTH + 2 + ciphertext_len);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let frame = packer().pack(&Message::close("w1", "c1"));

        let other = Packer::new(SecretString::from("not-pass123"));

        assert!(other.unpack(&frame).is_err());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = packer().pack(&Message::close("w1", "c1"));

        assert!(matches!(
            packer().unpack(&frame[..KEY_LENGTH + 1]),
            Err(Error::Truncated(_))
        ));
    }

    #[test]
    fn tampered_length_tag_is_rejected() {
        let mut frame = packer().pack(&Message::close("w1", "c1"));

        // Shift the claimed padding by one; the ciphertext is no longer
        // word-aligned and fails validation.
        let tag = u16::from_be_bytes([frame[KEY_LENGTH], frame[KEY_LENGTH + 1]]);
        frame[KEY_LENGTH..KEY_LENGTH + 2].copy_from_slice(&tag.wrapping_add(1).to_be_bytes());

        assert!(packer().unpack(&frame).is_err());
    }
}
