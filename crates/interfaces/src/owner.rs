use comb_primitives::Address;

/// Failure while consulting the ownership registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("owner validation: {0}")]
pub struct OwnerValidatorError(pub String);

/// Authoritative source of which address may publish under a name.
pub trait OwnerValidator: Send + Sync {
    /// Returns whether `address` owns `name`.
    fn validate_owner(&self, name: &str, address: Address) -> Result<bool, OwnerValidatorError>;
}
