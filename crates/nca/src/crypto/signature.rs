use rsa::pss::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::{BigUint, RsaPublicKey};
use sha2::Sha256;

const PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// Checks an RSA-2048-PSS (SHA-256) signature made with the key described by `modulus`
/// (big-endian) and the public exponent 65537.
///
/// Malformed moduli or signatures are treated as a failed verification.
pub fn verify_rsa2048_pss_sha256(modulus: &[u8], signature: &[u8], message: &[u8]) -> bool {
    let Ok(public_key) = RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from_bytes_be(&PUBLIC_EXPONENT),
    ) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };

    VerifyingKey::<Sha256>::new(public_key)
        .verify(message, &signature)
        .is_ok()
}
