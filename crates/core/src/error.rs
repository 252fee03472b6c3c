//! Error type shared across the trove engine.
//!
//! Every fallible operation returns [`LedgerResult`]. Failures never leave
//! partial state behind: entry points validate and pre-compute all fallible
//! steps before committing anything.

use thiserror::Error;

/// Convenience alias used throughout the engine.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Broad failure classes, mainly useful for callers that map errors onto
/// retry/reject policies without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or out-of-policy input; the request itself was wrong.
    Validation,
    /// Checked arithmetic refused to proceed.
    Arithmetic,
    /// Caller is not allowed to perform the operation.
    Authorization,
    /// Internal bookkeeping would have been left inconsistent.
    InvariantViolation,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LedgerError {
    // --- validation ---
    #[error("identifier is the zero address")]
    ZeroIdentifier,
    #[error("unknown collateral asset")]
    UnknownAsset,
    #[error("position is not active")]
    TroveNotActive,
    #[error("position is already active")]
    TroveAlreadyActive,
    #[error("insufficient stablecoin balance")]
    InsufficientBalance,
    #[error("withdrawal exceeds available collateral")]
    InsufficientCollateral,
    #[error("repayment exceeds outstanding debt")]
    InsufficientDebt,
    #[error("resulting debt below protocol minimum")]
    BelowMinimumDebt,
    #[error("amount must be non-zero")]
    ZeroAmount,
    #[error("oracle returned a zero price")]
    ZeroPrice,
    #[error("ratio must be non-zero")]
    ZeroRatio,
    #[error("identifier already present in registry")]
    DuplicateEntry,
    #[error("identifier not present in registry")]
    MissingEntry,
    #[error("registry is at capacity")]
    RegistryFull,
    #[error("no stability deposit for this account")]
    NoDeposit,

    // --- arithmetic ---
    #[error("division by zero")]
    DivisionByZero,
    #[error("arithmetic overflow")]
    Overflow,

    // --- authorization ---
    #[error("caller is not the configured front door")]
    Unauthorized,

    // --- invariant violations ---
    #[error("no position in the batch was eligible for liquidation")]
    NothingToLiquidate,
    #[error("no debt could be redeemed")]
    NothingRedeemed,
    #[error("redistribution requires a non-zero total stake")]
    NoStakes,
    #[error("stability product underflowed to zero")]
    ProductUnderflow,
}

impl LedgerError {
    /// Classify the error per the four-class taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::ZeroIdentifier
            | LedgerError::UnknownAsset
            | LedgerError::TroveNotActive
            | LedgerError::TroveAlreadyActive
            | LedgerError::InsufficientBalance
            | LedgerError::InsufficientCollateral
            | LedgerError::InsufficientDebt
            | LedgerError::BelowMinimumDebt
            | LedgerError::ZeroAmount
            | LedgerError::ZeroPrice
            | LedgerError::ZeroRatio
            | LedgerError::DuplicateEntry
            | LedgerError::MissingEntry
            | LedgerError::RegistryFull
            | LedgerError::NoDeposit => ErrorKind::Validation,

            LedgerError::DivisionByZero | LedgerError::Overflow => ErrorKind::Arithmetic,

            LedgerError::Unauthorized => ErrorKind::Authorization,

            LedgerError::NothingToLiquidate
            | LedgerError::NothingRedeemed
            | LedgerError::NoStakes
            | LedgerError::ProductUnderflow => ErrorKind::InvariantViolation,
        }
    }
}
