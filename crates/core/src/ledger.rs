//! The position ledger: per-trove state, per-asset aggregates, liquidation
//! batches, redemptions, and the redistribution accumulators.
//!
//! Every mutating operation is atomic. The pattern throughout is
//! plan-then-commit: all fallible work (validation, arithmetic, collaborator
//! calls, registry capacity checks) happens on copies first, and state is
//! only written once nothing can fail. A liquidation batch stages a plan per
//! candidate plus a redistribution fold and a stability-pool offset, then
//! commits the lot.
//!
//! Redistribution bookkeeping follows the per-unit-stake accumulator scheme:
//! `L_coll`/`L_debt` grow by `amount * 1e18 / totalStakes` (with rounding
//! error carried to the next fold), and a position's pending share is
//! `stake * (L_current - L_snapshot) / 1e18`, applied lazily whenever the
//! position is touched.

use std::collections::{HashMap, HashSet};

use alloy::primitives::{Address, U256};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ProtocolParams;
use crate::error::{LedgerError, LedgerResult};
use crate::interfaces::{PriceFeed, RewardIssuance, StablecoinLedger};
use crate::liquidation::{liquidation_outcome, LiquidationMode, LiquidationTotals};
use crate::sorted_troves::{InsertHints, SortedTroves};
use crate::stability::{StabilityOutcome, StabilityPool};
use crate::trove::{RewardSnapshot, Trove, TroveChange, TroveStatus};
use crate::wad_math::{compute_cr, compute_nominal_cr, mul_div, WAD};

/// Per-asset aggregate state. Collateral and debt are entire-system
/// amounts: redistributed portions stay in here until their positions
/// leave.
#[derive(Debug, Clone, Default)]
struct AssetTotals {
    total_stakes: U256,
    total_collateral: U256,
    total_debt: U256,
    l_coll: U256,
    l_debt: U256,
    last_coll_error: U256,
    last_debt_error: U256,
}

/// Result of a redemption walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedemptionOutcome {
    /// Stablecoin face value burned from the redeemer.
    pub stablecoin_used: U256,
    /// Collateral released to the redeemer.
    pub collateral_redeemed: U256,
    /// Positions fully redeemed and closed.
    pub positions_closed: usize,
}

/// Per-candidate effect staged by a liquidation batch.
#[derive(Debug, Clone)]
enum TrovePlan {
    Close,
    Partial {
        new_debt: U256,
        new_coll: U256,
        new_stake: U256,
        new_nicr: U256,
    },
}

/// Staged fold of a batch's redistribution amounts into the accumulators.
#[derive(Debug, Clone)]
struct RedistPlan {
    l_coll: U256,
    l_debt: U256,
    coll_error: U256,
    debt_error: U256,
}

/// Per-position effect staged by a redemption walk.
#[derive(Debug, Clone)]
enum RedeemPlan {
    Full {
        coll_drawn: U256,
        leftover: U256,
    },
    Partial {
        coll_drawn: U256,
        new_debt: U256,
        new_coll: U256,
        new_stake: U256,
        new_nicr: U256,
    },
}

pub struct TroveLedger {
    params: ProtocolParams,
    /// Keyed (asset, owner). Closed positions keep their terminal status
    /// until the key is re-opened.
    troves: HashMap<(Address, Address), Trove>,
    totals: HashMap<Address, AssetTotals>,
    registry: SortedTroves,
    pool: StabilityPool,
    /// Claimable collateral left over from full redemptions, keyed
    /// (asset, owner).
    surplus: HashMap<(Address, Address), U256>,
}

impl TroveLedger {
    pub fn new(params: ProtocolParams) -> Self {
        let max_size = params.max_positions_per_asset;
        Self {
            params,
            troves: HashMap::new(),
            totals: HashMap::new(),
            registry: SortedTroves::new(max_size),
            pool: StabilityPool::new(),
            surplus: HashMap::new(),
        }
    }

    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    pub fn registry(&self) -> &SortedTroves {
        &self.registry
    }

    pub fn pool(&self) -> &StabilityPool {
        &self.pool
    }

    // --- front-door mutators ---

    /// Open a position: mint `debt` to the owner, record the trove, insert
    /// into the registry.
    pub fn open_trove(
        &mut self,
        caller: Address,
        owner: Address,
        asset: Address,
        coll: U256,
        debt: U256,
        hints: InsertHints,
        coin: &mut dyn StablecoinLedger,
    ) -> LedgerResult<()> {
        self.authorize(caller)?;
        self.require_known_asset(asset)?;
        if owner == Address::ZERO {
            return Err(LedgerError::ZeroIdentifier);
        }
        if coll.is_zero() {
            return Err(LedgerError::ZeroAmount);
        }
        if debt < self.params.min_debt {
            return Err(LedgerError::BelowMinimumDebt);
        }
        let key = (asset, owner);
        if self.troves.get(&key).map(Trove::is_active).unwrap_or(false) {
            return Err(LedgerError::TroveAlreadyActive);
        }

        // Pre-check everything the registry insert could reject, so the
        // mint below is the last fallible step.
        if self.registry.contains(asset, owner) {
            return Err(LedgerError::DuplicateEntry);
        }
        if self.registry.len(asset) >= self.params.max_positions_per_asset {
            return Err(LedgerError::RegistryFull);
        }
        let nicr = compute_nominal_cr(coll, debt)?;
        if nicr.is_zero() {
            return Err(LedgerError::ZeroRatio);
        }

        let totals = self.totals_of(asset);
        let stake = stake_for(&totals, coll)?;
        let new_total_stakes = add(totals.total_stakes, stake)?;
        let new_total_coll = add(totals.total_collateral, coll)?;
        let new_total_debt = add(totals.total_debt, debt)?;

        coin.mint(owner, debt)?;
        self.registry.insert(asset, owner, nicr, hints)?;

        self.troves.insert(
            key,
            Trove {
                debt,
                collateral: coll,
                stake,
                status: TroveStatus::Active,
                reward_snapshot: RewardSnapshot {
                    coll: totals.l_coll,
                    debt: totals.l_debt,
                },
            },
        );
        let entry = self.totals.entry(asset).or_default();
        entry.total_stakes = new_total_stakes;
        entry.total_collateral = new_total_coll;
        entry.total_debt = new_total_debt;

        info!(
            owner = %owner,
            asset = %asset,
            coll = %coll,
            debt = %debt,
            stake = %stake,
            "trove opened"
        );
        Ok(())
    }

    /// Adjust a position: apply pending redistribution rewards, then the
    /// requested collateral/debt deltas, then recompute stake and ordering.
    pub fn update_trove(
        &mut self,
        caller: Address,
        owner: Address,
        asset: Address,
        change: TroveChange,
        hints: InsertHints,
        coin: &mut dyn StablecoinLedger,
    ) -> LedgerResult<()> {
        self.authorize(caller)?;
        if change.is_empty() {
            return Err(LedgerError::ZeroAmount);
        }
        let trove = self.active_trove(asset, owner)?.clone();
        let totals = self.totals_of(asset);
        let (entire_debt, entire_coll) = entire_position(&trove, &totals)?;

        let new_coll = add(entire_coll, change.coll_increase)?
            .checked_sub(change.coll_decrease)
            .ok_or(LedgerError::InsufficientCollateral)?;
        if new_coll.is_zero() {
            return Err(LedgerError::InsufficientCollateral);
        }
        let new_debt = add(entire_debt, change.debt_increase)?
            .checked_sub(change.debt_decrease)
            .ok_or(LedgerError::InsufficientDebt)?;
        if new_debt < self.params.min_debt {
            return Err(LedgerError::BelowMinimumDebt);
        }

        let nicr = compute_nominal_cr(new_coll, new_debt)?;
        if nicr.is_zero() {
            return Err(LedgerError::ZeroRatio);
        }
        let new_stake = stake_for(&totals, new_coll)?;

        // Swap entire old values for new ones in the aggregates.
        let new_total_stakes = add(sub(totals.total_stakes, trove.stake)?, new_stake)?;
        let new_total_coll = add(sub(totals.total_collateral, entire_coll)?, new_coll)?;
        let new_total_debt = add(sub(totals.total_debt, entire_debt)?, new_debt)?;

        if change.debt_increase > change.debt_decrease {
            coin.mint(owner, change.debt_increase - change.debt_decrease)?;
        } else if change.debt_decrease > change.debt_increase {
            coin.burn_from(owner, change.debt_decrease - change.debt_increase)?;
        }
        self.registry.re_insert(asset, owner, nicr, hints)?;

        if let Some(stored) = self.troves.get_mut(&(asset, owner)) {
            stored.collateral = new_coll;
            stored.debt = new_debt;
            stored.stake = new_stake;
            stored.reward_snapshot = RewardSnapshot {
                coll: totals.l_coll,
                debt: totals.l_debt,
            };
        }
        let entry = self.totals.entry(asset).or_default();
        entry.total_stakes = new_total_stakes;
        entry.total_collateral = new_total_coll;
        entry.total_debt = new_total_debt;

        info!(
            owner = %owner,
            asset = %asset,
            coll = %new_coll,
            debt = %new_debt,
            stake = %new_stake,
            "trove adjusted"
        );
        Ok(())
    }

    /// Close a position: burn its entire debt from the owner and release
    /// the collateral (custody of the released collateral is the front
    /// door's concern).
    pub fn close_trove(
        &mut self,
        caller: Address,
        owner: Address,
        asset: Address,
        coin: &mut dyn StablecoinLedger,
    ) -> LedgerResult<()> {
        self.authorize(caller)?;
        let trove = self.active_trove(asset, owner)?.clone();
        let totals = self.totals_of(asset);
        let (entire_debt, entire_coll) = entire_position(&trove, &totals)?;

        let new_total_stakes = sub(totals.total_stakes, trove.stake)?;
        let new_total_coll = sub(totals.total_collateral, entire_coll)?;
        let new_total_debt = sub(totals.total_debt, entire_debt)?;

        coin.burn_from(owner, entire_debt)?;
        self.registry.remove(asset, owner)?;

        if let Some(stored) = self.troves.get_mut(&(asset, owner)) {
            close_position(stored, TroveStatus::ClosedByOwner);
        }
        let entry = self.totals.entry(asset).or_default();
        entry.total_stakes = new_total_stakes;
        entry.total_collateral = new_total_coll;
        entry.total_debt = new_total_debt;

        info!(
            owner = %owner,
            asset = %asset,
            debt = %entire_debt,
            coll = %entire_coll,
            "trove closed by owner"
        );
        Ok(())
    }

    /// Hand out collateral left behind by a full redemption. The entry is
    /// cleared; paying the owner is the front door's job.
    pub fn claim_surplus(
        &mut self,
        caller: Address,
        owner: Address,
        asset: Address,
    ) -> LedgerResult<U256> {
        self.authorize(caller)?;
        if owner == Address::ZERO {
            return Err(LedgerError::ZeroIdentifier);
        }
        match self.surplus.remove(&(asset, owner)) {
            Some(amount) if !amount.is_zero() => {
                info!(owner = %owner, asset = %asset, amount = %amount, "surplus claimed");
                Ok(amount)
            }
            _ => Err(LedgerError::InsufficientBalance),
        }
    }

    // --- liquidation ---

    /// Liquidate a single position; a batch of one.
    pub fn liquidate(
        &mut self,
        asset: Address,
        owner: Address,
        feed: &dyn PriceFeed,
        issuance: &mut dyn RewardIssuance,
    ) -> LedgerResult<LiquidationTotals> {
        self.batch_liquidate(asset, &[owner], feed, issuance)
    }

    /// Liquidate every eligible candidate in `owners`.
    ///
    /// Recovery-mode status is decided once from the asset's TCR at entry
    /// and holds for the whole batch. Duplicate, unknown and healthy
    /// candidates are skipped; an entirely ineligible batch fails with
    /// `NothingToLiquidate` and no state change.
    pub fn batch_liquidate(
        &mut self,
        asset: Address,
        owners: &[Address],
        feed: &dyn PriceFeed,
        issuance: &mut dyn RewardIssuance,
    ) -> LedgerResult<LiquidationTotals> {
        self.require_known_asset(asset)?;
        let price = feed.price(asset)?;
        if price.is_zero() {
            return Err(LedgerError::ZeroPrice);
        }

        let totals0 = self.totals_of(asset);
        let tcr = compute_cr(totals0.total_collateral, price, totals0.total_debt)?;
        let mode = if tcr < self.params.ccr {
            LiquidationMode::Recovery
        } else {
            LiquidationMode::Normal
        };

        // Plan phase: walk the candidates over running counters, no state
        // is touched.
        let mut stakes_run = totals0.total_stakes;
        let mut coll_run = totals0.total_collateral;
        let mut debt_run = totals0.total_debt;
        let mut pool_run = self.pool.total_deposits();
        let mut batch = LiquidationTotals::default();
        let mut plans: Vec<(Address, TrovePlan)> = Vec::new();
        let mut seen: HashSet<Address> = HashSet::new();

        for &owner in owners {
            if !seen.insert(owner) {
                continue;
            }
            let Some(trove) = self.troves.get(&(asset, owner)) else {
                continue;
            };
            if !trove.is_active() {
                continue;
            }
            let (entire_debt, entire_coll) = entire_position(trove, &totals0)?;
            let icr = compute_cr(entire_coll, price, entire_debt)?;
            let Some(outcome) =
                liquidation_outcome(mode, entire_debt, entire_coll, icr, price, pool_run, &self.params)?
            else {
                debug!(owner = %owner, icr = %icr, "candidate not eligible, skipped");
                continue;
            };

            let plan = if outcome.entire_debt < entire_debt {
                // Recovery partial: the position stays open with the
                // surplus collateral and the unliquidated debt.
                let new_debt = sub(entire_debt, outcome.entire_debt)?;
                let new_coll = outcome.coll_surplus;
                let new_nicr = compute_nominal_cr(new_coll, new_debt)?;
                if new_nicr.is_zero() {
                    // A deep pool can cap the portion so that the surplus
                    // rounds to nothing; an open position cannot hold a
                    // zero ratio, so leave this one for a later batch.
                    debug!(owner = %owner, "partial would leave no collateral, skipped");
                    continue;
                }
                let new_stake = mul_div(new_coll, stakes_run, coll_run)?;
                stakes_run = add(sub(stakes_run, trove.stake)?, new_stake)?;
                TrovePlan::Partial {
                    new_debt,
                    new_coll,
                    new_stake,
                    new_nicr,
                }
            } else {
                stakes_run = sub(stakes_run, trove.stake)?;
                TrovePlan::Close
            };
            coll_run = sub(
                coll_run,
                add(outcome.gas_compensation, outcome.coll_to_pool)?,
            )?;
            debt_run = sub(debt_run, outcome.debt_to_offset)?;
            pool_run = sub(pool_run, outcome.debt_to_offset)?;
            batch.add(&outcome)?;
            plans.push((owner, plan));
        }
        if plans.is_empty() {
            return Err(LedgerError::NothingToLiquidate);
        }

        // Stage the redistribution fold. Stakes of closed positions are
        // already out of the denominator.
        let redist = if !batch.debt_to_redistribute.is_zero()
            || !batch.coll_to_redistribute.is_zero()
        {
            Some(plan_redistribution(&totals0, &batch, stakes_run)?)
        } else {
            None
        };

        // Stage the pool offset and the reward fold it triggers.
        let offset = if !batch.debt_to_offset.is_zero() {
            Some(
                self.pool
                    .plan_offset(asset, batch.debt_to_offset, batch.coll_to_pool)?,
            )
        } else {
            None
        };
        let reward_fold = if offset.is_some() {
            let issued = issuance.issue()?;
            self.pool.plan_issuance(issued)?
        } else {
            None
        };

        // Commit phase.
        for (owner, plan) in plans {
            match plan {
                TrovePlan::Close => {
                    self.registry.remove(asset, owner)?;
                    if let Some(stored) = self.troves.get_mut(&(asset, owner)) {
                        close_position(stored, TroveStatus::ClosedByLiquidation);
                    }
                    debug!(owner = %owner, "position liquidated in full");
                }
                TrovePlan::Partial {
                    new_debt,
                    new_coll,
                    new_stake,
                    new_nicr,
                } => {
                    self.registry
                        .re_insert(asset, owner, new_nicr, InsertHints::none())?;
                    if let Some(stored) = self.troves.get_mut(&(asset, owner)) {
                        stored.debt = new_debt;
                        stored.collateral = new_coll;
                        stored.stake = new_stake;
                        // Snapshot stays at the pre-batch accumulators so
                        // the surviving portion earns this batch's own
                        // redistribution.
                        stored.reward_snapshot = RewardSnapshot {
                            coll: totals0.l_coll,
                            debt: totals0.l_debt,
                        };
                    }
                    debug!(owner = %owner, new_debt = %new_debt, "position partially liquidated");
                }
            }
        }

        let entry = self.totals.entry(asset).or_default();
        entry.total_stakes = stakes_run;
        entry.total_collateral = coll_run;
        entry.total_debt = debt_run;
        if let Some(redist) = redist {
            entry.l_coll = redist.l_coll;
            entry.l_debt = redist.l_debt;
            entry.last_coll_error = redist.coll_error;
            entry.last_debt_error = redist.debt_error;
        }
        if let Some(fold) = reward_fold {
            self.pool.apply_issuance(fold);
        }
        if let Some(offset) = offset {
            self.pool.apply_offset(offset);
        }

        info!(
            asset = %asset,
            mode = ?mode,
            debt = %batch.entire_debt,
            offset = %batch.debt_to_offset,
            redistributed = %batch.debt_to_redistribute,
            gas_comp = %batch.gas_compensation,
            "liquidation batch committed"
        );
        Ok(batch)
    }

    // --- redemption ---

    /// Burn the redeemer's stablecoin at face value for collateral at the
    /// oracle price, starting from the riskiest position and walking up.
    /// Positions under MCR are skipped, a fully redeemed position closes
    /// with its leftover collateral parked as claimable surplus, and a
    /// partial redemption ends the walk.
    pub fn redeem_collateral(
        &mut self,
        redeemer: Address,
        asset: Address,
        amount: U256,
        feed: &dyn PriceFeed,
        coin: &mut dyn StablecoinLedger,
    ) -> LedgerResult<RedemptionOutcome> {
        if redeemer == Address::ZERO {
            return Err(LedgerError::ZeroIdentifier);
        }
        self.require_known_asset(asset)?;
        if amount.is_zero() {
            return Err(LedgerError::ZeroAmount);
        }
        let price = feed.price(asset)?;
        if price.is_zero() {
            return Err(LedgerError::ZeroPrice);
        }

        let totals0 = self.totals_of(asset);
        let mut stakes_run = totals0.total_stakes;
        let mut coll_run = totals0.total_collateral;
        let mut debt_run = totals0.total_debt;
        let mut remaining = amount;
        let mut coll_total = U256::ZERO;
        let mut plans: Vec<(Address, RedeemPlan)> = Vec::new();

        let mut cursor = self.registry.last(asset);
        while let Some(owner) = cursor {
            if remaining.is_zero() {
                break;
            }
            cursor = self.registry.prev(asset, owner);

            let Some(trove) = self.troves.get(&(asset, owner)) else {
                continue;
            };
            let (entire_debt, entire_coll) = entire_position(trove, &totals0)?;
            let icr = compute_cr(entire_coll, price, entire_debt)?;
            if icr < self.params.mcr {
                debug!(owner = %owner, icr = %icr, "undercollateralized, not redeemable");
                continue;
            }

            let redeemed = remaining.min(entire_debt);
            let coll_drawn = mul_div(redeemed, WAD, price)?;
            coll_total = add(coll_total, coll_drawn)?;
            remaining = sub(remaining, redeemed)?;

            if redeemed == entire_debt {
                let leftover = sub(entire_coll, coll_drawn)?;
                stakes_run = sub(stakes_run, trove.stake)?;
                coll_run = sub(coll_run, entire_coll)?;
                debt_run = sub(debt_run, entire_debt)?;
                plans.push((
                    owner,
                    RedeemPlan::Full {
                        coll_drawn,
                        leftover,
                    },
                ));
            } else {
                let new_debt = sub(entire_debt, redeemed)?;
                let new_coll = sub(entire_coll, coll_drawn)?;
                let new_nicr = compute_nominal_cr(new_coll, new_debt)?;
                if new_nicr.is_zero() {
                    return Err(LedgerError::ZeroRatio);
                }
                let new_stake = mul_div(new_coll, stakes_run, coll_run)?;
                stakes_run = add(sub(stakes_run, trove.stake)?, new_stake)?;
                coll_run = sub(coll_run, coll_drawn)?;
                debt_run = sub(debt_run, redeemed)?;
                plans.push((
                    owner,
                    RedeemPlan::Partial {
                        coll_drawn,
                        new_debt,
                        new_coll,
                        new_stake,
                        new_nicr,
                    },
                ));
            }
        }

        let used = sub(amount, remaining)?;
        if used.is_zero() {
            return Err(LedgerError::NothingRedeemed);
        }
        coin.burn_from(redeemer, used)?;

        let mut closed = 0usize;
        for (owner, plan) in plans {
            match plan {
                RedeemPlan::Full { coll_drawn, leftover } => {
                    self.registry.remove(asset, owner)?;
                    if let Some(stored) = self.troves.get_mut(&(asset, owner)) {
                        close_position(stored, TroveStatus::ClosedByRedemption);
                    }
                    if !leftover.is_zero() {
                        let slot = self.surplus.entry((asset, owner)).or_default();
                        *slot = slot.saturating_add(leftover);
                    }
                    closed += 1;
                    debug!(owner = %owner, drawn = %coll_drawn, surplus = %leftover, "fully redeemed");
                }
                RedeemPlan::Partial {
                    coll_drawn,
                    new_debt,
                    new_coll,
                    new_stake,
                    new_nicr,
                } => {
                    self.registry
                        .re_insert(asset, owner, new_nicr, InsertHints::none())?;
                    if let Some(stored) = self.troves.get_mut(&(asset, owner)) {
                        stored.debt = new_debt;
                        stored.collateral = new_coll;
                        stored.stake = new_stake;
                        stored.reward_snapshot = RewardSnapshot {
                            coll: totals0.l_coll,
                            debt: totals0.l_debt,
                        };
                    }
                    debug!(owner = %owner, drawn = %coll_drawn, "partially redeemed");
                }
            }
        }
        let entry = self.totals.entry(asset).or_default();
        entry.total_stakes = stakes_run;
        entry.total_collateral = coll_run;
        entry.total_debt = debt_run;

        info!(
            redeemer = %redeemer,
            asset = %asset,
            used = %used,
            collateral = %coll_total,
            closed,
            "redemption committed"
        );
        Ok(RedemptionOutcome {
            stablecoin_used: used,
            collateral_redeemed: coll_total,
            positions_closed: closed,
        })
    }

    // --- stability buffer passthrough ---

    pub fn provide_to_pool(
        &mut self,
        depositor: Address,
        amount: U256,
        coin: &mut dyn StablecoinLedger,
        issuance: &mut dyn RewardIssuance,
    ) -> LedgerResult<StabilityOutcome> {
        self.pool.provide(depositor, amount, coin, issuance)
    }

    pub fn withdraw_from_pool(
        &mut self,
        depositor: Address,
        amount: U256,
        coin: &mut dyn StablecoinLedger,
        issuance: &mut dyn RewardIssuance,
    ) -> LedgerResult<StabilityOutcome> {
        self.pool.withdraw(depositor, amount, coin, issuance)
    }

    pub fn withdraw_all_from_pool(
        &mut self,
        depositor: Address,
        coin: &mut dyn StablecoinLedger,
        issuance: &mut dyn RewardIssuance,
    ) -> LedgerResult<StabilityOutcome> {
        self.pool.withdraw_all(depositor, coin, issuance)
    }

    // --- views ---

    /// ICR with pending rewards included; `U256::MAX` when there is no
    /// debt at the key.
    pub fn current_icr(&self, asset: Address, owner: Address, price: U256) -> LedgerResult<U256> {
        let (debt, coll) = self.trove_debt_and_coll(asset, owner)?;
        compute_cr(coll, price, debt)
    }

    pub fn nominal_icr(&self, asset: Address, owner: Address) -> LedgerResult<U256> {
        let (debt, coll) = self.trove_debt_and_coll(asset, owner)?;
        compute_nominal_cr(coll, debt)
    }

    /// Entire (debt, collateral), pending rewards included. Zeros for
    /// inactive keys.
    pub fn trove_debt_and_coll(&self, asset: Address, owner: Address) -> LedgerResult<(U256, U256)> {
        match self.troves.get(&(asset, owner)) {
            Some(trove) if trove.is_active() => {
                let totals = self.totals_of(asset);
                let (debt, coll) = entire_position(trove, &totals)?;
                Ok((debt, coll))
            }
            _ => Ok((U256::ZERO, U256::ZERO)),
        }
    }

    /// Pending redistributed (collateral, debt) not yet folded into the
    /// stored position.
    pub fn pending_rewards(&self, asset: Address, owner: Address) -> LedgerResult<(U256, U256)> {
        match self.troves.get(&(asset, owner)) {
            Some(trove) => {
                let totals = self.totals_of(asset);
                pending_rewards_of(trove, &totals)
            }
            None => Ok((U256::ZERO, U256::ZERO)),
        }
    }

    pub fn trove_status(&self, asset: Address, owner: Address) -> TroveStatus {
        self.troves
            .get(&(asset, owner))
            .map(|t| t.status)
            .unwrap_or(TroveStatus::NonExistent)
    }

    pub fn trove(&self, asset: Address, owner: Address) -> Option<&Trove> {
        self.troves.get(&(asset, owner))
    }

    /// Aggregate collateralization of the asset; `U256::MAX` with no debt.
    pub fn total_collateral_ratio(&self, asset: Address, price: U256) -> LedgerResult<U256> {
        let totals = self.totals_of(asset);
        compute_cr(totals.total_collateral, price, totals.total_debt)
    }

    pub fn is_recovery_mode(&self, asset: Address, price: U256) -> LedgerResult<bool> {
        Ok(self.total_collateral_ratio(asset, price)? < self.params.ccr)
    }

    pub fn claimable_surplus(&self, owner: Address, asset: Address) -> U256 {
        self.surplus
            .get(&(asset, owner))
            .copied()
            .unwrap_or_default()
    }

    pub fn total_stakes(&self, asset: Address) -> U256 {
        self.totals_of(asset).total_stakes
    }

    pub fn total_collateral(&self, asset: Address) -> U256 {
        self.totals_of(asset).total_collateral
    }

    pub fn total_debt(&self, asset: Address) -> U256 {
        self.totals_of(asset).total_debt
    }

    /// Current (L_coll, L_debt) redistribution accumulators.
    pub fn redistribution_accumulators(&self, asset: Address) -> (U256, U256) {
        let totals = self.totals_of(asset);
        (totals.l_coll, totals.l_debt)
    }

    // --- internals ---

    fn authorize(&self, caller: Address) -> LedgerResult<()> {
        if caller == Address::ZERO {
            return Err(LedgerError::ZeroIdentifier);
        }
        if self.params.front_door != Address::ZERO && caller != self.params.front_door {
            return Err(LedgerError::Unauthorized);
        }
        Ok(())
    }

    fn require_known_asset(&self, asset: Address) -> LedgerResult<()> {
        if self.params.assets.iter().any(|a| a.address == asset) {
            Ok(())
        } else {
            Err(LedgerError::UnknownAsset)
        }
    }

    fn totals_of(&self, asset: Address) -> AssetTotals {
        self.totals.get(&asset).cloned().unwrap_or_default()
    }

    fn active_trove(&self, asset: Address, owner: Address) -> LedgerResult<&Trove> {
        match self.troves.get(&(asset, owner)) {
            Some(trove) if trove.is_active() => Ok(trove),
            _ => Err(LedgerError::TroveNotActive),
        }
    }
}

/// Fold a batch's redistribution amounts into fresh accumulator values,
/// carrying the division remainders forward.
fn plan_redistribution(
    totals: &AssetTotals,
    batch: &LiquidationTotals,
    stakes: U256,
) -> LedgerResult<RedistPlan> {
    if stakes.is_zero() {
        return Err(LedgerError::NoStakes);
    }
    let coll_numerator = add(
        batch
            .coll_to_redistribute
            .checked_mul(WAD)
            .ok_or(LedgerError::Overflow)?,
        totals.last_coll_error,
    )?;
    let debt_numerator = add(
        batch
            .debt_to_redistribute
            .checked_mul(WAD)
            .ok_or(LedgerError::Overflow)?,
        totals.last_debt_error,
    )?;
    let coll_per_unit = coll_numerator / stakes;
    let debt_per_unit = debt_numerator / stakes;
    Ok(RedistPlan {
        l_coll: add(totals.l_coll, coll_per_unit)?,
        l_debt: add(totals.l_debt, debt_per_unit)?,
        coll_error: coll_numerator - coll_per_unit * stakes,
        debt_error: debt_numerator - debt_per_unit * stakes,
    })
}

/// Pending redistributed (collateral, debt) for one position.
fn pending_rewards_of(trove: &Trove, totals: &AssetTotals) -> LedgerResult<(U256, U256)> {
    if !trove.is_active() || trove.stake.is_zero() {
        return Ok((U256::ZERO, U256::ZERO));
    }
    let delta_coll = sub(totals.l_coll, trove.reward_snapshot.coll)?;
    let delta_debt = sub(totals.l_debt, trove.reward_snapshot.debt)?;
    Ok((
        mul_div(trove.stake, delta_coll, WAD)?,
        mul_div(trove.stake, delta_debt, WAD)?,
    ))
}

/// Entire (debt, collateral) of a position, pending rewards included.
fn entire_position(trove: &Trove, totals: &AssetTotals) -> LedgerResult<(U256, U256)> {
    let (pending_coll, pending_debt) = pending_rewards_of(trove, totals)?;
    Ok((
        add(trove.debt, pending_debt)?,
        add(trove.collateral, pending_coll)?,
    ))
}

/// Stake for `coll` under the current aggregates: proportional to the
/// existing stake-to-collateral ratio, or the collateral itself in an
/// empty system.
fn stake_for(totals: &AssetTotals, coll: U256) -> LedgerResult<U256> {
    if totals.total_collateral.is_zero() {
        Ok(coll)
    } else {
        mul_div(coll, totals.total_stakes, totals.total_collateral)
    }
}

fn close_position(trove: &mut Trove, status: TroveStatus) {
    trove.debt = U256::ZERO;
    trove.collateral = U256::ZERO;
    trove.stake = U256::ZERO;
    trove.reward_snapshot = RewardSnapshot::default();
    trove.status = status;
}

fn add(a: U256, b: U256) -> LedgerResult<U256> {
    a.checked_add(b).ok_or(LedgerError::Overflow)
}

fn sub(a: U256, b: U256) -> LedgerResult<U256> {
    a.checked_sub(b).ok_or(LedgerError::Overflow)
}
