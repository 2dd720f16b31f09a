//! Request Fingerprints
//!
//! SHA-256 over a length-prefixed encoding of the model id, the ordered
//! messages and every sampling parameter. Length prefixes keep field
//! boundaries unambiguous, so `("ab", "c")` and `("a", "bc")` never collide.

use sha2::{Digest, Sha256};
use std::fmt;

use super::request::{Message, SamplingParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(model: &str, messages: &[Message], sampling: &SamplingParams) -> Self {
        let mut hasher = Sha256::new();
        put_str(&mut hasher, model);
        hasher.update((messages.len() as u64).to_be_bytes());
        for message in messages {
            put_str(&mut hasher, message.role.as_str());
            put_str(&mut hasher, &message.content);
        }
        hasher.update(sampling.temperature.to_bits().to_be_bytes());
        put_opt(&mut hasher, sampling.top_p.map(f64::to_bits));
        hasher.update(sampling.max_tokens.to_be_bytes());
        put_opt(&mut hasher, sampling.seed);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        bytes.try_into().ok().map(Self)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn put_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

fn put_opt(hasher: &mut Sha256, value: Option<u64>) {
    match value {
        Some(v) => {
            hasher.update([1u8]);
            hasher.update(v.to_be_bytes());
        }
        None => hasher.update([0u8]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base() -> (String, Vec<Message>, SamplingParams) {
        (
            "model-a".to_string(),
            vec![Message::system("You are a diplomat."), Message::user("Turn 1.")],
            SamplingParams::default(),
        )
    }

    #[test]
    fn test_equal_requests_equal_fingerprints() {
        let (m, msgs, s) = base();
        assert_eq!(Fingerprint::of(&m, &msgs, &s), Fingerprint::of(&m, &msgs.clone(), &s));
    }

    #[test]
    fn test_every_field_participates() {
        let (m, msgs, s) = base();
        let original = Fingerprint::of(&m, &msgs, &s);

        assert_ne!(original, Fingerprint::of("model-b", &msgs, &s));

        let mut reworded = msgs.clone();
        reworded[1].content.push('!');
        assert_ne!(original, Fingerprint::of(&m, &reworded, &s));

        let mut reordered = msgs.clone();
        reordered.reverse();
        assert_ne!(original, Fingerprint::of(&m, &reordered, &s));

        for changed in [
            SamplingParams { temperature: 0.71, ..s },
            SamplingParams { top_p: Some(0.9), ..s },
            SamplingParams { max_tokens: 513, ..s },
            SamplingParams { seed: Some(7), ..s },
        ] {
            assert_ne!(original, Fingerprint::of(&m, &msgs, &changed));
        }
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let s = SamplingParams::default();
        let a = Fingerprint::of("ab", &[Message::user("c")], &s);
        let b = Fingerprint::of("a", &[Message::user("bc")], &s);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_round_trip() {
        let (m, msgs, s) = base();
        let fp = Fingerprint::of(&m, &msgs, &s);
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()), Some(fp));
        assert_eq!(Fingerprint::from_hex("zz"), None);
    }

    proptest! {
        #[test]
        fn prop_distinct_content_distinct_fingerprint(a in ".{0,40}", b in ".{0,40}") {
            prop_assume!(a != b);
            let s = SamplingParams::default();
            prop_assert_ne!(
                Fingerprint::of("m", &[Message::user(a)], &s),
                Fingerprint::of("m", &[Message::user(b)], &s)
            );
        }
    }
}
