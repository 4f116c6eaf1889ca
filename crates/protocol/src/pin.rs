//! Session PINs.
//!
//! The PIN is the short shared secret the operator reads off the host screen
//! and types on the client. It doubles as the session identifier on the relay
//! and seeds the key derivation, so it must be easy for a human to transcribe
//! without ambiguity.

use rand::Rng;
use rand::rngs::OsRng;

/// 31 characters; `0`, `O`, `I`, `1`, `L` are omitted as confusables.
pub const PIN_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

pub const PIN_LEN: usize = 6;

/// Generate a fresh PIN, each character drawn uniformly from
/// [`PIN_ALPHABET`].
pub fn generate_pin() -> String {
    let mut rng = OsRng;
    (0..PIN_LEN)
        .map(|_| PIN_ALPHABET[rng.gen_range(0..PIN_ALPHABET.len())] as char)
        .collect()
}

/// Whether a client-supplied string even has the shape of a PIN. This is a
/// format check only, never an authentication decision.
pub fn is_well_formed(pin: &str) -> bool {
    pin.len() == PIN_LEN && pin.bytes().all(|b| PIN_ALPHABET.contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pins_use_only_the_alphabet() {
        for _ in 0..200 {
            let pin = generate_pin();
            assert_eq!(pin.len(), PIN_LEN);
            assert!(
                pin.bytes().all(|b| PIN_ALPHABET.contains(&b)),
                "unexpected character in {pin}"
            );
        }
    }

    #[test]
    fn alphabet_has_no_confusables() {
        for confusable in [b'0', b'O', b'I', b'1', b'L'] {
            assert!(!PIN_ALPHABET.contains(&confusable));
        }
        assert_eq!(PIN_ALPHABET.len(), 31);
    }

    #[test]
    fn well_formedness() {
        assert!(is_well_formed("ABCDEF"));
        assert!(is_well_formed("23456789".get(..6).unwrap()));
        assert!(!is_well_formed("ABCDE")); // too short
        assert!(!is_well_formed("ABCDEFG")); // too long
        assert!(!is_well_formed("ABCDE0")); // confusable zero
        assert!(!is_well_formed("abcdef")); // lowercase
    }
}
