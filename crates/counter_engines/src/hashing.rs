#![forbid(unsafe_code)]

use counter_contracts::counter::{NationalId, SubjectHash};
use counter_contracts::ContractViolation;
use sha2::{Digest, Sha256};

/// Salted one-way hash of a national id. The raw id never reaches the ledger.
#[derive(Clone)]
pub struct SubjectHasher {
    salt: String,
}

impl std::fmt::Debug for SubjectHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectHasher").finish_non_exhaustive()
    }
}

impl SubjectHasher {
    pub fn new(salt: impl Into<String>) -> Result<Self, ContractViolation> {
        let salt = salt.into();
        if salt.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "pii_hash_salt",
                reason: "must not be empty",
            });
        }
        Ok(Self { salt })
    }

    /// `hex(sha256(salt || national_id))`.
    pub fn hash(&self, national_id: &NationalId) -> Result<SubjectHash, ContractViolation> {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(national_id.as_str().as_bytes());
        SubjectHash::new(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_hashing_01_deterministic_per_salt() {
        let nid = NationalId::new("0012345678").unwrap();
        let a = SubjectHasher::new("salt-a").unwrap();
        let b = SubjectHasher::new("salt-b").unwrap();
        assert_eq!(a.hash(&nid).unwrap(), a.hash(&nid).unwrap());
        assert_ne!(a.hash(&nid).unwrap(), b.hash(&nid).unwrap());
        assert_eq!(a.hash(&nid).unwrap().as_str().len(), 64);
    }

    #[test]
    fn at_hashing_02_matches_plain_sha256_of_concatenation() {
        let nid = NationalId::new("1234567890").unwrap();
        let h = SubjectHasher::new("pepper").unwrap().hash(&nid).unwrap();
        let expected = hex::encode(Sha256::digest(b"pepper1234567890"));
        assert_eq!(h.as_str(), expected);
    }

    #[test]
    fn at_hashing_03_empty_salt_rejected_and_never_printed() {
        assert!(SubjectHasher::new("  ").is_err());
        let hasher = SubjectHasher::new("top-secret").unwrap();
        assert!(!format!("{hasher:?}").contains("top-secret"));
    }
}
