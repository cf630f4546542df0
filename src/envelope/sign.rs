//! Ed25519 signing and verification over canonical envelope bytes.

use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use super::Envelope;

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("envelope is missing {0}")]
    MissingField(&'static str),
    #[error("{field} is not valid hex: {reason}")]
    BadHex { field: &'static str, reason: String },
    #[error("{field} must be {expected} bytes, got {got}")]
    BadLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("invalid public key: {0}")]
    BadKey(String),
    #[error("signature verification failed")]
    BadSignature,
    #[error("serialize envelope: {0}")]
    Serialize(String),
}

/// Ed25519 keypair used to sign envelopes. The secret half is zeroized on
/// drop by `ed25519-dalek`.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic reconstruction from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Lowercase hex of the 32-byte verifying key. This is the peer
    /// identity that appears in the envelope `signer` field.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }
}

/// Attaches `signer` and `sig` computed over the canonical bytes of the
/// unsigned envelope.
pub fn sign_envelope(envelope: &Envelope, keypair: &Keypair) -> Result<Envelope, SignError> {
    let mut signed = envelope.clone();
    signed.signer = None;
    signed.sig = None;

    let payload = signed
        .unsigned_canonical_bytes()
        .map_err(|e| SignError::Serialize(format!("{e:#}")))?;
    let sig = keypair.signing_key.sign(&payload);

    signed.signer = Some(keypair.public_key_hex());
    signed.sig = Some(hex::encode(sig.to_bytes()));
    Ok(signed)
}

/// Recomputes the unsigned canonical bytes and checks the signature
/// against the key named in `signer`.
pub fn verify_envelope(envelope: &Envelope) -> Result<(), SignError> {
    let signer = envelope
        .signer
        .as_deref()
        .ok_or(SignError::MissingField("signer"))?;
    let sig = envelope
        .sig
        .as_deref()
        .ok_or(SignError::MissingField("sig"))?;

    let key_bytes = decode_fixed::<32>("signer", signer)?;
    let sig_bytes = decode_fixed::<64>("sig", sig)?;

    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|e| SignError::BadKey(e.to_string()))?;
    let payload = envelope
        .unsigned_canonical_bytes()
        .map_err(|e| SignError::Serialize(format!("{e:#}")))?;

    key.verify_strict(&payload, &ed25519_dalek::Signature::from_bytes(&sig_bytes))
        .map_err(|_| SignError::BadSignature)
}

fn decode_fixed<const N: usize>(field: &'static str, s: &str) -> Result<[u8; N], SignError> {
    let bytes = hex::decode(s).map_err(|e| SignError::BadHex {
        field,
        reason: e.to_string(),
    })?;
    let got = bytes.len();
    bytes.try_into().map_err(|_| SignError::BadLength {
        field,
        expected: N,
        got,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{AcceptBody, Body};

    fn sample() -> Envelope {
        Envelope::unsigned(
            "trade-sig",
            Body::Accept(AcceptBody {
                terms_hash: "00".repeat(32),
            }),
        )
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let kp = Keypair::generate();
        let signed = sign_envelope(&sample(), &kp).expect("sign");
        assert_eq!(signed.signer.as_deref(), Some(kp.public_key_hex().as_str()));
        verify_envelope(&signed).expect("verify");
    }

    #[test]
    fn from_seed_is_deterministic() {
        let a = Keypair::from_seed(&[7u8; 32]);
        let b = Keypair::from_seed(&[7u8; 32]);
        assert_eq!(a.public_key_hex(), b.public_key_hex());
        let env = sample();
        let sa = sign_envelope(&env, &a).expect("sign a");
        let sb = sign_envelope(&env, &b).expect("sign b");
        assert_eq!(sa.sig, sb.sig);
    }

    #[test]
    fn body_mutation_breaks_signature() {
        let kp = Keypair::generate();
        let mut signed = sign_envelope(&sample(), &kp).expect("sign");
        signed.body = Body::Accept(AcceptBody {
            terms_hash: "11".repeat(32),
        });
        assert!(matches!(
            verify_envelope(&signed),
            Err(SignError::BadSignature)
        ));
    }

    #[test]
    fn swapped_signer_breaks_signature() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let mut signed = sign_envelope(&sample(), &kp).expect("sign");
        signed.signer = Some(other.public_key_hex());
        assert!(matches!(
            verify_envelope(&signed),
            Err(SignError::BadSignature)
        ));
    }

    #[test]
    fn malformed_hex_is_surfaced() {
        let kp = Keypair::generate();
        let mut signed = sign_envelope(&sample(), &kp).expect("sign");
        signed.sig = Some("zz".repeat(64));
        assert!(matches!(
            verify_envelope(&signed),
            Err(SignError::BadHex { field: "sig", .. })
        ));

        let mut short = sign_envelope(&sample(), &kp).expect("sign");
        short.signer = Some("ab".repeat(16));
        assert!(matches!(
            verify_envelope(&short),
            Err(SignError::BadLength { field: "signer", .. })
        ));
    }

    #[test]
    fn unsigned_envelope_is_rejected() {
        assert!(matches!(
            verify_envelope(&sample()),
            Err(SignError::MissingField("signer"))
        ));
    }
}
