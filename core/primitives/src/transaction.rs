use parity_scale_codec::{Decode, Encode};

/// A tag an extrinsic provides or requires; used by the pool to order
/// dependent transactions.
pub type TransactionTag = Vec<u8>;

/// The runtime's verdict on a candidate extrinsic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct Validity {
    pub priority: u64,
    pub requires: Vec<TransactionTag>,
    pub provides: Vec<TransactionTag>,
    pub longevity: u64,
    pub propagate: bool,
}

impl Validity {
    pub fn new(priority: u64) -> Self {
        Self { priority, propagate: true, ..Default::default() }
    }
}

/// Reasons a transaction is invalid. Variant indices match the wire format
/// used by runtimes, so the verdict can be decoded straight out of the
/// runtime call result.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode, thiserror::Error)]
pub enum InvalidTransaction {
    #[error("call of the transaction is not expected")]
    Call,
    #[error("inability to pay some fees")]
    Payment,
    #[error("transaction not yet being valid")]
    Future,
    #[error("transaction being outdated")]
    Stale,
    #[error("invalid transaction proof (signature)")]
    BadProof,
    #[error("transaction birth block ancient")]
    AncientBirthBlock,
    #[error("would exhaust block resources")]
    ExhaustsResources,
    #[error("unknown invalidity reason {0}")]
    Custom(u8),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode, thiserror::Error)]
pub enum UnknownTransaction {
    #[error("could not lookup some information required to validate")]
    CannotLookup,
    #[error("no validator found for the transaction")]
    NoUnsignedValidator,
    #[error("unknown validity reason {0}")]
    Custom(u8),
}

/// Outcome of `ValidateTransaction` when the extrinsic is not valid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode, thiserror::Error)]
pub enum TransactionValidityError {
    #[error("invalid transaction: {0}")]
    Invalid(#[from] InvalidTransaction),
    #[error("unknown transaction validity: {0}")]
    Unknown(#[from] UnknownTransaction),
}

impl TransactionValidityError {
    /// True for verdicts that indicate a malformed or forged extrinsic, as
    /// opposed to one that is merely unusable right now. These are the cases
    /// worth a peer reputation penalty.
    pub fn is_bad_proof(&self) -> bool {
        matches!(self, Self::Invalid(InvalidTransaction::BadProof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_proof_is_reportable() {
        let err = TransactionValidityError::from(InvalidTransaction::BadProof);
        assert!(err.is_bad_proof());
        let err = TransactionValidityError::from(InvalidTransaction::Future);
        assert!(!err.is_bad_proof());
    }

    #[test]
    fn validity_round_trips() {
        let validity = Validity {
            priority: 39,
            requires: vec![],
            provides: vec![vec![1, 2, 3]],
            longevity: u64::MAX - 1,
            propagate: true,
        };
        let encoded = validity.encode();
        assert_eq!(Validity::decode(&mut &encoded[..]).unwrap(), validity);
    }
}
