use comb_primitives::{crypto, Address, RecoverableSignature, B256};
use std::fmt;

/// Signing failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("signer: {0}")]
pub struct SignerError(pub String);

/// Oracle producing recoverable signatures over 32-byte digests.
pub trait Signer: Send + Sync {
    /// Signs `digest`, returning a signature from which the signer address
    /// can be recovered.
    fn sign(&self, digest: B256) -> Result<RecoverableSignature, SignerError>;
}

/// A [`Signer`] backed by an in-memory secp256k1 secret key.
#[derive(Clone)]
pub struct KeypairSigner {
    secret: B256,
    address: Address,
}

impl KeypairSigner {
    /// Creates a signer from a raw 32-byte secret key.
    pub fn new(secret: B256) -> Result<Self, SignerError> {
        let address = crypto::secret_to_address(secret)
            .map_err(|err| SignerError(format!("invalid secret key: {err}")))?;
        Ok(Self { secret, address })
    }

    /// Address corresponding to the signing key.
    pub fn address(&self) -> Address {
        self.address
    }
}

impl fmt::Debug for KeypairSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeypairSigner").field("address", &self.address).finish()
    }
}

impl Signer for KeypairSigner {
    fn sign(&self, digest: B256) -> Result<RecoverableSignature, SignerError> {
        crypto::sign_message(self.secret, digest)
            .map_err(|err| SignerError(format!("sign fail: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comb_primitives::keccak256;

    #[test]
    fn keypair_signature_recovers_to_own_address() {
        let signer = KeypairSigner::new(B256::repeat_byte(0x17)).unwrap();
        let digest = keccak256(b"message");
        let sig = signer.sign(digest).unwrap();
        assert_eq!(crypto::recover_signer(&sig, &digest).unwrap(), signer.address());
    }

    #[test]
    fn debug_does_not_leak_the_secret() {
        let signer = KeypairSigner::new(B256::repeat_byte(0x17)).unwrap();
        let printed = format!("{signer:?}");
        assert!(!printed.contains(&"17".repeat(32)));
    }
}
