//! Trove engine core logic.
//!
//! This crate provides the collateralized-debt-position core:
//! - Fixed-point (WAD) math primitives with explicit rounding and overflow policy
//! - NICR-sorted position registry with hint-based insertion
//! - Pure per-position liquidation math for normal and recovery mode
//! - The trove ledger: positions, per-asset aggregates, liquidation batches,
//!   redemptions and the redistribution accumulators
//! - The stability pool with O(1) product/sum compounding of deposits
//!
//! Every state-changing entry point is atomic: inputs are validated and all
//! fallible work is staged before anything is written, so a failed call
//! leaves no partial effects.

pub mod config;
mod error;
mod interfaces;
mod ledger;
mod liquidation;
mod sorted_troves;
mod stability;
mod trove;
pub mod wad_math;

pub use config::{AssetParams, ProtocolConfig, ProtocolParams};
pub use error::{ErrorKind, LedgerError, LedgerResult};
pub use interfaces::{
    ConstantIssuance, PriceFeed, RewardIssuance, StablecoinLedger, StaticPriceFeed, TokenBook,
};
pub use ledger::{RedemptionOutcome, TroveLedger};
pub use liquidation::{
    liquidation_outcome, LiquidationMode, LiquidationOutcome, LiquidationTotals,
};
pub use sorted_troves::{InsertHints, SortedTroves};
pub use stability::{StabilityOutcome, StabilityPool};
pub use trove::{RewardSnapshot, Trove, TroveChange, TroveStatus};
