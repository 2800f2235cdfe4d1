//! Recoverable ECDSA signing and signer recovery over secp256k1.

use crate::{keccak256, Address, RecoverableSignature, B256};
use secp256k1::{
    ecdsa::{RecoverableSignature as SecpRecoverableSignature, RecoveryId},
    Message, PublicKey, SecretKey, SECP256K1,
};

pub use secp256k1::Error;

/// Signs the 32-byte `digest` with the given secret key and returns the
/// signature in `r || s || recovery_id` form.
pub fn sign_message(secret: B256, digest: B256) -> Result<RecoverableSignature, Error> {
    let sec = SecretKey::from_slice(secret.as_ref())?;
    let s = SECP256K1.sign_ecdsa_recoverable(&Message::from_digest(digest.0), &sec);
    let (rec_id, data) = s.serialize_compact();

    let mut sig = [0u8; 65];
    sig[..64].copy_from_slice(&data);
    sig[64] = rec_id.to_i32() as u8;
    Ok(RecoverableSignature(sig))
}

/// Recovers the address of the signer of `digest` using secp256k1 pubkey
/// recovery.
///
/// Converts the public key into an address by hashing the public key with
/// keccak256.
pub fn recover_signer(sig: &RecoverableSignature, digest: &B256) -> Result<Address, Error> {
    let sig = SecpRecoverableSignature::from_compact(
        &sig.0[..64],
        RecoveryId::from_i32(sig.0[64] as i32)?,
    )?;

    let public = SECP256K1.recover_ecdsa(&Message::from_digest(digest.0), &sig)?;
    Ok(public_key_to_address(public))
}

/// Converts a public key into an address by hashing the encoded public key
/// with keccak256.
pub fn public_key_to_address(public: PublicKey) -> Address {
    // strip out the first byte because that should be the SECP256K1_TAG_PUBKEY_UNCOMPRESSED
    // tag returned by libsecp's uncompressed pubkey serialization
    let hash = keccak256(&public.serialize_uncompressed()[1..]);
    Address::from_slice(&hash[12..])
}

/// Derives the address corresponding to a secret key.
pub fn secret_to_address(secret: B256) -> Result<Address, Error> {
    let sec = SecretKey::from_slice(secret.as_ref())?;
    Ok(public_key_to_address(PublicKey::from_secret_key(SECP256K1, &sec)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hex;

    #[test]
    fn sanity_ecrecover_call() {
        let sig = hex!("650acf9d3f5f0a2c799776a1254355d5f4061762a237396a99a0e0e3fc2bcd6729514a0dacb2e623ac4abd157cb18163ff942280db4d5caad66ddf941ba12e0300");
        let hash = hex!("47173285a8d7341e5e972fc677286384f802f8ef42a5ec5f03bbfa254cb01fad");
        let out = Address::from_slice(&hex!("c08b5542d177ac6686946920409741463a15dddb"));

        let recovered = recover_signer(&RecoverableSignature(sig), &B256::from(hash)).unwrap();
        assert_eq!(recovered, out);
    }

    #[test]
    fn sign_recover_round_trip() {
        let secret = B256::repeat_byte(0x42);
        let digest = keccak256(b"some signed payload");

        let sig = sign_message(secret, digest).unwrap();
        let recovered = recover_signer(&sig, &digest).unwrap();
        assert_eq!(recovered, secret_to_address(secret).unwrap());
    }

    #[test]
    fn recover_rejects_mangled_signature() {
        let secret = B256::repeat_byte(0x42);
        let digest = keccak256(b"some signed payload");

        let mut sig = sign_message(secret, digest).unwrap();
        sig.0[10] ^= 0x01;
        let recovered = recover_signer(&sig, &digest);
        assert!(recovered.is_err() || recovered.unwrap() != secret_to_address(secret).unwrap());
    }
}
