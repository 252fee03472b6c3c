//! Position value types.
//!
//! A trove is one (owner, collateral asset) pair. The struct stores raw
//! ledger amounts; pending redistribution rewards are applied by the ledger
//! before any of these fields are interpreted.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

/// Lifecycle of a position. `Active` is the only live state; the three
/// closed states are terminal for that incarnation of the position, but the
/// same (owner, asset) key may be reopened later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TroveStatus {
    #[default]
    NonExistent,
    Active,
    ClosedByOwner,
    ClosedByLiquidation,
    ClosedByRedemption,
}

impl TroveStatus {
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, TroveStatus::Active)
    }
}

/// Values of the per-asset reward accumulators (`L_collateral`, `L_debt`)
/// at the position's last touch. The gap between these and the current
/// accumulators is the position's pending redistribution reward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RewardSnapshot {
    pub coll: U256,
    pub debt: U256,
}

/// One collateralized debt position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trove {
    /// Stablecoin debt, WAD.
    pub debt: U256,
    /// Locked collateral, WAD.
    pub collateral: U256,
    /// Redistribution stake, WAD. Zero whenever the position is closed.
    pub stake: U256,
    pub status: TroveStatus,
    pub reward_snapshot: RewardSnapshot,
}

impl Trove {
    #[inline]
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Requested adjustment for an active position. Increases and decreases are
/// carried separately so a single update can, say, add collateral while
/// repaying debt.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TroveChange {
    pub coll_increase: U256,
    pub coll_decrease: U256,
    pub debt_increase: U256,
    pub debt_decrease: U256,
}

impl TroveChange {
    pub fn deposit_collateral(mut self, amount: U256) -> Self {
        self.coll_increase = amount;
        self
    }

    pub fn withdraw_collateral(mut self, amount: U256) -> Self {
        self.coll_decrease = amount;
        self
    }

    pub fn borrow(mut self, amount: U256) -> Self {
        self.debt_increase = amount;
        self
    }

    pub fn repay(mut self, amount: U256) -> Self {
        self.debt_decrease = amount;
        self
    }

    /// True when the change would not move any field.
    pub fn is_empty(&self) -> bool {
        self.coll_increase.is_zero()
            && self.coll_decrease.is_zero()
            && self.debt_increase.is_zero()
            && self.debt_decrease.is_zero()
    }
}
