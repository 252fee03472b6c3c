//! Pure liquidation math.
//!
//! Stateless split of a single liquidation event into pool offset,
//! redistribution, gas compensation and surplus. The ledger feeds these
//! functions entire (pending-included) amounts and commits the returned
//! outcome; nothing here touches storage.
//!
//! Conservation holds for every outcome:
//! `entire_debt == debt_to_offset + debt_to_redistribute` and
//! `entire_coll == gas_compensation + coll_to_pool + coll_to_redistribute
//! + coll_surplus`. For a recovery-mode partial, `entire_debt`/`entire_coll`
//! are the amounts the event consumed: the liquidated debt portion and the
//! whole collateral (the unseized part coming back out as `coll_surplus`).

use alloy::primitives::U256;
use serde::Serialize;

use crate::config::ProtocolParams;
use crate::error::LedgerResult;
use crate::wad_math::{mul_div, wad_div, WAD};

/// Liquidation regime for a whole batch, derived once from the asset's
/// total collateral ratio against the critical ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LiquidationMode {
    Normal,
    Recovery,
}

/// Split of one liquidation event. All amounts WAD.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiquidationOutcome {
    /// Debt consumed by the event (the whole position's debt for a full
    /// liquidation, the capped portion for a recovery partial).
    pub entire_debt: U256,
    /// Collateral consumed by the event.
    pub entire_coll: U256,
    /// Collateral compensating the liquidation caller.
    pub gas_compensation: U256,
    /// Debt cancelled against stability deposits.
    pub debt_to_offset: U256,
    /// Collateral paid to the stability buffer for the offset.
    pub coll_to_pool: U256,
    /// Debt spread across remaining positions.
    pub debt_to_redistribute: U256,
    /// Collateral spread across remaining positions.
    pub coll_to_redistribute: U256,
    /// Collateral left with the owner (partial liquidations only).
    pub coll_surplus: U256,
}

/// Running sums over a batch, one field per outcome field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiquidationTotals {
    pub entire_debt: U256,
    pub entire_coll: U256,
    pub gas_compensation: U256,
    pub debt_to_offset: U256,
    pub coll_to_pool: U256,
    pub debt_to_redistribute: U256,
    pub coll_to_redistribute: U256,
    pub coll_surplus: U256,
}

impl LiquidationTotals {
    pub fn add(&mut self, outcome: &LiquidationOutcome) -> LedgerResult<()> {
        self.entire_debt = checked_add(self.entire_debt, outcome.entire_debt)?;
        self.entire_coll = checked_add(self.entire_coll, outcome.entire_coll)?;
        self.gas_compensation = checked_add(self.gas_compensation, outcome.gas_compensation)?;
        self.debt_to_offset = checked_add(self.debt_to_offset, outcome.debt_to_offset)?;
        self.coll_to_pool = checked_add(self.coll_to_pool, outcome.coll_to_pool)?;
        self.debt_to_redistribute =
            checked_add(self.debt_to_redistribute, outcome.debt_to_redistribute)?;
        self.coll_to_redistribute =
            checked_add(self.coll_to_redistribute, outcome.coll_to_redistribute)?;
        self.coll_surplus = checked_add(self.coll_surplus, outcome.coll_surplus)?;
        Ok(())
    }
}

#[inline(always)]
fn checked_add(a: U256, b: U256) -> LedgerResult<U256> {
    a.checked_add(b).ok_or(crate::error::LedgerError::Overflow)
}

/// Compute the split for one candidate, or `None` when it is not eligible
/// under `mode` (ICR at or above MCR, or a recovery partial with an empty
/// pool).
///
/// `pool_liquidity` is the stability-deposit total still available to this
/// batch; the caller decrements it between candidates.
pub fn liquidation_outcome(
    mode: LiquidationMode,
    entire_debt: U256,
    entire_coll: U256,
    icr: U256,
    price: U256,
    pool_liquidity: U256,
    params: &ProtocolParams,
) -> LedgerResult<Option<LiquidationOutcome>> {
    if icr >= params.mcr || entire_debt.is_zero() {
        return Ok(None);
    }

    match mode {
        LiquidationMode::Normal => {
            full_liquidation(entire_debt, entire_coll, price, pool_liquidity, params).map(Some)
        }
        LiquidationMode::Recovery if icr <= WAD => {
            full_liquidation(entire_debt, entire_coll, price, pool_liquidity, params).map(Some)
        }
        LiquidationMode::Recovery => {
            partial_liquidation(entire_coll, price, pool_liquidity, params)
        }
    }
}

/// Full liquidation: the position closes, every unit of debt and
/// collateral leaves it. Pool absorbs `min(debt, pool_liquidity)` with
/// proportional collateral; the remainder redistributes.
fn full_liquidation(
    entire_debt: U256,
    entire_coll: U256,
    price: U256,
    pool_liquidity: U256,
    params: &ProtocolParams,
) -> LedgerResult<LiquidationOutcome> {
    let gas_compensation = wad_div(params.gas_comp_usd, price)?.min(entire_coll);
    let coll_after_comp = entire_coll - gas_compensation;

    let (debt_to_offset, coll_to_pool) = if pool_liquidity.is_zero() {
        (U256::ZERO, U256::ZERO)
    } else {
        let offset = entire_debt.min(pool_liquidity);
        let to_pool = mul_div(coll_after_comp, offset, entire_debt)?;
        (offset, to_pool)
    };

    Ok(LiquidationOutcome {
        entire_debt,
        entire_coll,
        gas_compensation,
        debt_to_offset,
        coll_to_pool,
        debt_to_redistribute: entire_debt - debt_to_offset,
        coll_to_redistribute: coll_after_comp - coll_to_pool,
        coll_surplus: U256::ZERO,
    })
}

/// Recovery-mode partial (100% < ICR < MCR): the liquidated portion exits
/// at exactly MCR and is absorbed by the pool only. `maxLiquidatableDebt =
/// coll * price / MCR`, further capped by pool liquidity; the collateral
/// those debt units require is seized (gas compensation carved from it)
/// and the rest stays with the still-open position as surplus.
fn partial_liquidation(
    entire_coll: U256,
    price: U256,
    pool_liquidity: U256,
    params: &ProtocolParams,
) -> LedgerResult<Option<LiquidationOutcome>> {
    let max_liquidatable = mul_div(entire_coll, price, params.mcr)?;
    let debt_to_liquidate = max_liquidatable.min(pool_liquidity);
    if debt_to_liquidate.is_zero() {
        return Ok(None);
    }

    let seized = mul_div(debt_to_liquidate, params.mcr, price)?.min(entire_coll);
    let gas_compensation = wad_div(params.gas_comp_usd, price)?.min(seized);

    Ok(Some(LiquidationOutcome {
        entire_debt: debt_to_liquidate,
        entire_coll,
        gas_compensation,
        debt_to_offset: debt_to_liquidate,
        coll_to_pool: seized - gas_compensation,
        debt_to_redistribute: U256::ZERO,
        coll_to_redistribute: U256::ZERO,
        coll_surplus: entire_coll - seized,
    }))
}
