//! Stability buffer: pooled stablecoin deposits absorbing liquidated debt.
//!
//! Deposit compounding uses the product/sum scheme: a global product `P`
//! shrinks with every offset, and each depositor's snapshot of `P` lets the
//! current value of their deposit be read in O(1) as
//! `initial * P / P_snapshot`. Collateral gains accumulate per asset in
//! `S` sums keyed by (epoch, scale); the reward-token stream accumulates in
//! `G` the same way. When an offset empties the pool the epoch advances and
//! `P` resets; when `P` would drop below 1e-9 the scale advances and `P`
//! is stretched by `SCALE_FACTOR` instead of underflowing.
//!
//! Offsets are split into a pure `plan_offset` and an infallible
//! `apply_offset` so a liquidation batch can stage every fallible
//! computation before committing anything.

use std::collections::HashMap;

use alloy::primitives::{Address, U256};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::error::{LedgerError, LedgerResult};
use crate::interfaces::{RewardIssuance, StablecoinLedger};
use crate::wad_math::{mul_div, SCALE_FACTOR, WAD};

/// Compounded deposits below one millionth of the original are treated as
/// fully consumed.
const DEPOSIT_DUST_DIVISOR: U256 = U256::from_limbs([1_000_000u64, 0, 0, 0]);

#[derive(Debug, Clone, Default)]
struct DepositSnapshot {
    p: U256,
    g: U256,
    scale: u64,
    epoch: u64,
    /// Per-asset `S` values at snapshot time.
    coll_sums: SmallVec<[(Address, U256); 4]>,
}

impl DepositSnapshot {
    fn coll_sum(&self, asset: Address) -> U256 {
        self.coll_sums
            .iter()
            .find(|(a, _)| *a == asset)
            .map(|(_, sum)| *sum)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
struct Deposit {
    initial: U256,
    snapshot: DepositSnapshot,
}

/// Result of a deposit or withdrawal: the face value moved, the remaining
/// deposit, and the gains paid out along the way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StabilityOutcome {
    /// Stablecoin face value pulled from (deposit) or returned to
    /// (withdrawal) the depositor.
    pub amount: U256,
    /// Deposit value recorded after the operation.
    pub new_deposit: U256,
    /// Collateral gains paid out, one entry per asset, sorted by address.
    pub coll_gains: Vec<(Address, U256)>,
    /// Reward tokens owed for the elapsed period; custody of the reward
    /// token is the front door's concern.
    pub reward_gain: U256,
}

/// Staged result of one offset, produced by `plan_offset`.
#[derive(Debug, Clone)]
pub(crate) struct OffsetPlan {
    asset: Address,
    debt_to_offset: U256,
    coll_to_add: U256,
    /// Added to `S[asset]` at the pre-offset (epoch, scale).
    coll_sum_delta: U256,
    new_coll_error: U256,
    new_debt_error: U256,
    new_p: U256,
    new_scale: u64,
    new_epoch: u64,
}

/// Staged fold of newly issued reward tokens into `G`.
#[derive(Debug, Clone)]
pub(crate) struct IssuancePlan {
    g_delta: U256,
    new_reward_error: U256,
}

#[derive(Debug, Clone)]
pub struct StabilityPool {
    total_deposits: U256,
    p: U256,
    current_scale: u64,
    current_epoch: u64,
    /// `S` per asset per (epoch, scale).
    coll_sums: HashMap<Address, HashMap<(u64, u64), U256>>,
    /// `G` per (epoch, scale).
    g_sums: HashMap<(u64, u64), U256>,
    last_coll_error: HashMap<Address, U256>,
    last_debt_error: U256,
    last_reward_error: U256,
    deposits: HashMap<Address, Deposit>,
    /// Collateral received from offsets, held for depositors.
    coll_balances: HashMap<Address, U256>,
}

impl Default for StabilityPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StabilityPool {
    pub fn new() -> Self {
        Self {
            total_deposits: U256::ZERO,
            p: WAD,
            current_scale: 0,
            current_epoch: 0,
            coll_sums: HashMap::new(),
            g_sums: HashMap::new(),
            last_coll_error: HashMap::new(),
            last_debt_error: U256::ZERO,
            last_reward_error: U256::ZERO,
            deposits: HashMap::new(),
            coll_balances: HashMap::new(),
        }
    }

    /// Add `amount` to the depositor's balance, paying out earned gains and
    /// compounding the existing deposit first.
    pub fn provide(
        &mut self,
        depositor: Address,
        amount: U256,
        coin: &mut dyn StablecoinLedger,
        issuance: &mut dyn RewardIssuance,
    ) -> LedgerResult<StabilityOutcome> {
        if depositor == Address::ZERO {
            return Err(LedgerError::ZeroIdentifier);
        }
        if amount.is_zero() {
            return Err(LedgerError::ZeroAmount);
        }
        // Reject unfunded deposits before the issuance pull: a consumed
        // trigger cannot be handed back to the schedule.
        if coin.balance_of(depositor) < amount {
            return Err(LedgerError::InsufficientBalance);
        }

        let issued = issuance.issue()?;
        let issuance_plan = self.plan_issuance(issued)?;

        let (coll_gains, reward_gain, compounded) =
            self.settle_existing(depositor, issuance_plan.as_ref())?;

        // Last fallible step; everything after this commits.
        coin.burn_from(depositor, amount)?;

        if let Some(plan) = issuance_plan {
            self.apply_issuance(plan);
        }
        self.pay_out_collateral(&coll_gains);

        let new_deposit = compounded + amount;
        self.total_deposits += amount;
        self.write_deposit(depositor, new_deposit);

        info!(
            depositor = %depositor,
            amount = %amount,
            new_deposit = %new_deposit,
            "stability deposit"
        );
        Ok(StabilityOutcome {
            amount,
            new_deposit,
            coll_gains,
            reward_gain,
        })
    }

    /// Withdraw up to `amount` (capped at the compounded balance), paying
    /// out gains. `amount == 0` just claims gains.
    pub fn withdraw(
        &mut self,
        depositor: Address,
        amount: U256,
        coin: &mut dyn StablecoinLedger,
        issuance: &mut dyn RewardIssuance,
    ) -> LedgerResult<StabilityOutcome> {
        if !self.deposits.contains_key(&depositor) {
            return Err(LedgerError::NoDeposit);
        }

        let issued = issuance.issue()?;
        let issuance_plan = self.plan_issuance(issued)?;

        let (coll_gains, reward_gain, compounded) =
            self.settle_existing(depositor, issuance_plan.as_ref())?;
        let to_withdraw = amount.min(compounded);

        if !to_withdraw.is_zero() {
            coin.mint(depositor, to_withdraw)?;
        }

        if let Some(plan) = issuance_plan {
            self.apply_issuance(plan);
        }
        self.pay_out_collateral(&coll_gains);

        let new_deposit = compounded - to_withdraw;
        self.total_deposits -= to_withdraw;
        self.write_deposit(depositor, new_deposit);

        info!(
            depositor = %depositor,
            withdrawn = %to_withdraw,
            new_deposit = %new_deposit,
            "stability withdrawal"
        );
        Ok(StabilityOutcome {
            amount: to_withdraw,
            new_deposit,
            coll_gains,
            reward_gain,
        })
    }

    /// Withdraw the whole compounded balance.
    pub fn withdraw_all(
        &mut self,
        depositor: Address,
        coin: &mut dyn StablecoinLedger,
        issuance: &mut dyn RewardIssuance,
    ) -> LedgerResult<StabilityOutcome> {
        self.withdraw(depositor, U256::MAX, coin, issuance)
    }

    // --- views ---

    pub fn total_deposits(&self) -> U256 {
        self.total_deposits
    }

    /// Face value recorded at the depositor's last touch.
    pub fn deposit_of(&self, depositor: Address) -> U256 {
        self.deposits
            .get(&depositor)
            .map(|d| d.initial)
            .unwrap_or_default()
    }

    /// Current value of the deposit after all offsets since the snapshot.
    pub fn compounded_deposit(&self, depositor: Address) -> LedgerResult<U256> {
        match self.deposits.get(&depositor) {
            Some(deposit) => self.compounded(deposit),
            None => Ok(U256::ZERO),
        }
    }

    /// Collateral earned since the snapshot, per asset, sorted by address.
    pub fn collateral_gains(&self, depositor: Address) -> LedgerResult<Vec<(Address, U256)>> {
        match self.deposits.get(&depositor) {
            Some(deposit) => self.coll_gains(deposit),
            None => Ok(Vec::new()),
        }
    }

    /// Reward tokens earned since the snapshot.
    pub fn reward_gain(&self, depositor: Address) -> LedgerResult<U256> {
        match self.deposits.get(&depositor) {
            Some(deposit) => self.reward(deposit, None),
            None => Ok(U256::ZERO),
        }
    }

    /// Collateral the buffer holds for an asset.
    pub fn coll_balance(&self, asset: Address) -> U256 {
        self.coll_balances.get(&asset).copied().unwrap_or_default()
    }

    pub fn product(&self) -> U256 {
        self.p
    }

    pub fn current_scale(&self) -> u64 {
        self.current_scale
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    // --- offsets (ledger-internal) ---

    /// Stage an offset of `debt_to_offset` against the pool in exchange for
    /// `coll_to_add`. Pure; errors leave nothing to undo. The caller must
    /// have capped `debt_to_offset` at `total_deposits`.
    pub(crate) fn plan_offset(
        &self,
        asset: Address,
        debt_to_offset: U256,
        coll_to_add: U256,
    ) -> LedgerResult<OffsetPlan> {
        let total = self.total_deposits;
        if debt_to_offset.is_zero() || total.is_zero() || debt_to_offset > total {
            return Err(LedgerError::NoStakes);
        }

        let last_coll_error = self
            .last_coll_error
            .get(&asset)
            .copied()
            .unwrap_or_default();
        let coll_numerator = coll_to_add
            .checked_mul(WAD)
            .ok_or(LedgerError::Overflow)?
            .checked_add(last_coll_error)
            .ok_or(LedgerError::Overflow)?;

        // Debt loss per unit is rounded up so the pool never under-burns;
        // the overshoot is carried in the error register. A full drain is
        // exact by construction.
        let (debt_loss_per_unit, new_debt_error) = if debt_to_offset == total {
            (WAD, U256::ZERO)
        } else {
            let scaled_debt = debt_to_offset
                .checked_mul(WAD)
                .ok_or(LedgerError::Overflow)?;
            match scaled_debt.checked_sub(self.last_debt_error) {
                Some(debt_numerator) => {
                    let per_unit = debt_numerator / total + U256::from(1u64);
                    let error = per_unit * total - debt_numerator;
                    (per_unit, error)
                }
                // An exactly dividing offset leaves a carry as large as the
                // whole pool, so a dust offset can sit entirely inside it.
                // Depositors were already charged; only the carry shrinks.
                None => (U256::ZERO, self.last_debt_error - scaled_debt),
            }
        };

        let coll_gain_per_unit = coll_numerator / total;
        let new_coll_error = coll_numerator - coll_gain_per_unit * total;

        // `S` moves before `P`: the marginal gain is weighted by the
        // pre-offset product.
        let coll_sum_delta = coll_gain_per_unit
            .checked_mul(self.p)
            .ok_or(LedgerError::Overflow)?;

        let product_factor = WAD - debt_loss_per_unit;
        let (new_p, new_scale, new_epoch) = if product_factor.is_zero() {
            (WAD, 0, self.current_epoch + 1)
        } else {
            let shrunk = mul_div(self.p, product_factor, WAD)?;
            let (p, scale) = if shrunk < SCALE_FACTOR {
                let stretched = self
                    .p
                    .checked_mul(product_factor)
                    .ok_or(LedgerError::Overflow)?
                    .checked_mul(SCALE_FACTOR)
                    .ok_or(LedgerError::Overflow)?
                    / WAD;
                (stretched, self.current_scale + 1)
            } else {
                (shrunk, self.current_scale)
            };
            if p.is_zero() {
                return Err(LedgerError::ProductUnderflow);
            }
            (p, scale, self.current_epoch)
        };

        Ok(OffsetPlan {
            asset,
            debt_to_offset,
            coll_to_add,
            coll_sum_delta,
            new_coll_error,
            new_debt_error,
            new_p,
            new_scale,
            new_epoch,
        })
    }

    /// Commit a staged offset. Infallible.
    pub(crate) fn apply_offset(&mut self, plan: OffsetPlan) {
        let bucket = (self.current_epoch, self.current_scale);
        *self
            .coll_sums
            .entry(plan.asset)
            .or_default()
            .entry(bucket)
            .or_default() += plan.coll_sum_delta;

        self.last_coll_error
            .insert(plan.asset, plan.new_coll_error);
        self.last_debt_error = plan.new_debt_error;

        if plan.new_epoch != self.current_epoch {
            info!(
                epoch = plan.new_epoch,
                "stability pool fully drained, epoch advanced"
            );
        } else if plan.new_scale != self.current_scale {
            debug!(scale = plan.new_scale, p = %plan.new_p, "stability scale advanced");
        }
        self.p = plan.new_p;
        self.current_scale = plan.new_scale;
        self.current_epoch = plan.new_epoch;

        self.total_deposits -= plan.debt_to_offset;
        *self.coll_balances.entry(plan.asset).or_default() += plan.coll_to_add;

        info!(
            asset = %plan.asset,
            debt = %plan.debt_to_offset,
            coll = %plan.coll_to_add,
            remaining = %self.total_deposits,
            "stability offset"
        );
    }

    // --- internals ---

    /// Fold `issued` reward tokens into `G`, staged. `None` when the pool
    /// is empty or nothing was issued.
    pub(crate) fn plan_issuance(&self, issued: U256) -> LedgerResult<Option<IssuancePlan>> {
        if issued.is_zero() || self.total_deposits.is_zero() {
            return Ok(None);
        }
        let numerator = issued
            .checked_mul(WAD)
            .ok_or(LedgerError::Overflow)?
            .checked_add(self.last_reward_error)
            .ok_or(LedgerError::Overflow)?;
        let per_unit = numerator / self.total_deposits;
        let new_reward_error = numerator - per_unit * self.total_deposits;
        let g_delta = per_unit.checked_mul(self.p).ok_or(LedgerError::Overflow)?;
        Ok(Some(IssuancePlan {
            g_delta,
            new_reward_error,
        }))
    }

    pub(crate) fn apply_issuance(&mut self, plan: IssuancePlan) {
        let bucket = (self.current_epoch, self.current_scale);
        *self.g_sums.entry(bucket).or_default() += plan.g_delta;
        self.last_reward_error = plan.new_reward_error;
    }

    /// Gains, reward and compounded value for a depositor, evaluated as if
    /// `issuance_plan` had already been applied.
    fn settle_existing(
        &self,
        depositor: Address,
        issuance_plan: Option<&IssuancePlan>,
    ) -> LedgerResult<(Vec<(Address, U256)>, U256, U256)> {
        match self.deposits.get(&depositor) {
            Some(deposit) => {
                let gains = self.coll_gains(deposit)?;
                let reward = self.reward(deposit, issuance_plan)?;
                let compounded = self.compounded(deposit)?;
                Ok((gains, reward, compounded))
            }
            None => Ok((Vec::new(), U256::ZERO, U256::ZERO)),
        }
    }

    fn compounded(&self, deposit: &Deposit) -> LedgerResult<U256> {
        if deposit.initial.is_zero() {
            return Ok(U256::ZERO);
        }
        let snapshot = &deposit.snapshot;
        if snapshot.epoch < self.current_epoch {
            return Ok(U256::ZERO);
        }

        let scale_diff = self.current_scale - snapshot.scale;
        let mut compounded = match scale_diff {
            0 => mul_div(deposit.initial, self.p, snapshot.p)?,
            1 => mul_div(deposit.initial, self.p, snapshot.p)? / SCALE_FACTOR,
            _ => U256::ZERO,
        };
        if compounded < deposit.initial / DEPOSIT_DUST_DIVISOR {
            compounded = U256::ZERO;
        }
        Ok(compounded)
    }

    fn coll_gains(&self, deposit: &Deposit) -> LedgerResult<Vec<(Address, U256)>> {
        let mut gains = Vec::new();
        if deposit.initial.is_zero() {
            return Ok(gains);
        }
        let snapshot = &deposit.snapshot;
        for asset in self.coll_sums.keys() {
            let first = self.coll_sum_at(*asset, snapshot.epoch, snapshot.scale)
                - snapshot.coll_sum(*asset);
            let second =
                self.coll_sum_at(*asset, snapshot.epoch, snapshot.scale + 1) / SCALE_FACTOR;
            let gain = mul_div(deposit.initial, first + second, snapshot.p)? / WAD;
            if !gain.is_zero() {
                gains.push((*asset, gain));
            }
        }
        gains.sort_by_key(|(asset, _)| *asset);
        Ok(gains)
    }

    fn reward(&self, deposit: &Deposit, plan: Option<&IssuancePlan>) -> LedgerResult<U256> {
        if deposit.initial.is_zero() {
            return Ok(U256::ZERO);
        }
        let snapshot = &deposit.snapshot;
        let first = self.g_at_planned(plan, snapshot.epoch, snapshot.scale) - snapshot.g;
        let second = self.g_at_planned(plan, snapshot.epoch, snapshot.scale + 1) / SCALE_FACTOR;
        let reward = mul_div(deposit.initial, first + second, snapshot.p)? / WAD;
        Ok(reward)
    }

    fn coll_sum_at(&self, asset: Address, epoch: u64, scale: u64) -> U256 {
        self.coll_sums
            .get(&asset)
            .and_then(|sums| sums.get(&(epoch, scale)))
            .copied()
            .unwrap_or_default()
    }

    fn g_at(&self, epoch: u64, scale: u64) -> U256 {
        self.g_sums.get(&(epoch, scale)).copied().unwrap_or_default()
    }

    fn g_at_planned(&self, plan: Option<&IssuancePlan>, epoch: u64, scale: u64) -> U256 {
        let mut value = self.g_at(epoch, scale);
        if let Some(plan) = plan {
            if epoch == self.current_epoch && scale == self.current_scale {
                value += plan.g_delta;
            }
        }
        value
    }

    fn pay_out_collateral(&mut self, gains: &[(Address, U256)]) {
        for (asset, gain) in gains {
            let balance = self.coll_balances.entry(*asset).or_default();
            *balance = balance.saturating_sub(*gain);
        }
    }

    /// Record the deposit with a fresh snapshot, or delete it when zero.
    fn write_deposit(&mut self, depositor: Address, new_value: U256) {
        if new_value.is_zero() {
            self.deposits.remove(&depositor);
            return;
        }
        let mut coll_sums = SmallVec::new();
        for asset in self.coll_sums.keys() {
            coll_sums.push((
                *asset,
                self.coll_sum_at(*asset, self.current_epoch, self.current_scale),
            ));
        }
        self.deposits.insert(
            depositor,
            Deposit {
                initial: new_value,
                snapshot: DepositSnapshot {
                    p: self.p,
                    g: self.g_at(self.current_epoch, self.current_scale),
                    scale: self.current_scale,
                    epoch: self.current_epoch,
                    coll_sums,
                },
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{ConstantIssuance, TokenBook};
    use crate::wad_math::pow10;

    const ASSET_A: Address = Address::repeat_byte(0xA1);
    const ASSET_B: Address = Address::repeat_byte(0xB2);

    fn addr(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn wad(n: u64) -> U256 {
        U256::from(n) * WAD
    }

    fn funded_book(accounts: &[(Address, u64)]) -> TokenBook {
        let mut book = TokenBook::new();
        for (who, amount) in accounts {
            book.mint(*who, wad(*amount)).unwrap();
        }
        book
    }

    fn offset(pool: &mut StabilityPool, asset: Address, debt: U256, coll: U256) {
        let plan = pool.plan_offset(asset, debt, coll).unwrap();
        pool.apply_offset(plan);
    }

    /// Drip-style schedule: `issue` hands out the accrued amount once and
    /// zeroes it, as a time-based stream would.
    struct DripIssuance {
        pending: U256,
    }

    impl RewardIssuance for DripIssuance {
        fn issue(&mut self) -> LedgerResult<U256> {
            Ok(std::mem::take(&mut self.pending))
        }
    }

    #[test]
    fn test_provide_and_withdraw_round_trip() {
        let mut pool = StabilityPool::new();
        let mut coin = funded_book(&[(addr(1), 1_000)]);
        let mut issuance = ConstantIssuance::new(U256::ZERO);

        pool.provide(addr(1), wad(600), &mut coin, &mut issuance)
            .unwrap();
        assert_eq!(pool.total_deposits(), wad(600));
        assert_eq!(pool.deposit_of(addr(1)), wad(600));
        assert_eq!(coin.balance_of(addr(1)), wad(400));

        let outcome = pool
            .withdraw(addr(1), wad(200), &mut coin, &mut issuance)
            .unwrap();
        assert_eq!(outcome.amount, wad(200));
        assert_eq!(outcome.new_deposit, wad(400));
        assert_eq!(pool.total_deposits(), wad(400));
        assert_eq!(coin.balance_of(addr(1)), wad(600));
    }

    #[test]
    fn test_provide_validation() {
        let mut pool = StabilityPool::new();
        let mut coin = funded_book(&[(addr(1), 10)]);
        let mut issuance = ConstantIssuance::new(U256::ZERO);

        assert_eq!(
            pool.provide(addr(1), U256::ZERO, &mut coin, &mut issuance),
            Err(LedgerError::ZeroAmount)
        );
        assert_eq!(
            pool.provide(Address::ZERO, wad(1), &mut coin, &mut issuance),
            Err(LedgerError::ZeroIdentifier)
        );
        // more than the balance: rejected up front, nothing changes
        assert_eq!(
            pool.provide(addr(1), wad(11), &mut coin, &mut issuance),
            Err(LedgerError::InsufficientBalance)
        );
        assert_eq!(pool.total_deposits(), U256::ZERO);

        assert_eq!(
            pool.withdraw(addr(2), wad(1), &mut coin, &mut issuance),
            Err(LedgerError::NoDeposit)
        );
    }

    #[test]
    fn test_single_offset_compounds_and_earns() {
        let mut pool = StabilityPool::new();
        let mut coin = funded_book(&[(addr(1), 10_000)]);
        let mut issuance = ConstantIssuance::new(U256::ZERO);

        pool.provide(addr(1), wad(10_000), &mut coin, &mut issuance)
            .unwrap();
        offset(&mut pool, ASSET_A, wad(4_000), wad(2));

        assert_eq!(pool.total_deposits(), wad(6_000));
        assert_eq!(pool.coll_balance(ASSET_A), wad(2));
        // loss per unit is rounded up by one, so P lands one shy of 0.6e18
        assert_eq!(pool.product(), U256::from(599_999_999_999_999_999u64));

        // compounded = 10000 * P / 1e18, a hair under the exact 6000
        let compounded = pool.compounded_deposit(addr(1)).unwrap();
        assert_eq!(compounded, U256::from(5_999_999_999_999_999_990_000u128));

        // the whole 2.0 collateral belongs to the only depositor
        let gains = pool.collateral_gains(addr(1)).unwrap();
        assert_eq!(gains, vec![(ASSET_A, wad(2))]);
    }

    #[test]
    fn test_provide_pays_gains_and_refreshes_snapshot() {
        let mut pool = StabilityPool::new();
        let mut coin = funded_book(&[(addr(1), 11_000)]);
        let mut issuance = ConstantIssuance::new(U256::ZERO);

        pool.provide(addr(1), wad(10_000), &mut coin, &mut issuance)
            .unwrap();
        offset(&mut pool, ASSET_A, wad(4_000), wad(2));

        let outcome = pool
            .provide(addr(1), wad(1_000), &mut coin, &mut issuance)
            .unwrap();
        assert_eq!(outcome.coll_gains, vec![(ASSET_A, wad(2))]);
        let expected_new = U256::from(5_999_999_999_999_999_990_000u128) + wad(1_000);
        assert_eq!(outcome.new_deposit, expected_new);

        // paid-out collateral left the pool's custody
        assert_eq!(pool.coll_balance(ASSET_A), U256::ZERO);
        // gains were reset by the snapshot refresh
        assert!(pool.collateral_gains(addr(1)).unwrap().is_empty());
        assert_eq!(pool.compounded_deposit(addr(1)).unwrap(), expected_new);
        assert_eq!(pool.total_deposits(), wad(7_000));
    }

    #[test]
    fn test_full_drain_advances_epoch() {
        let mut pool = StabilityPool::new();
        let mut coin = funded_book(&[(addr(2), 5_000)]);
        let mut issuance = ConstantIssuance::new(U256::ZERO);

        pool.provide(addr(2), wad(5_000), &mut coin, &mut issuance)
            .unwrap();
        offset(&mut pool, ASSET_A, wad(5_000), wad(3));

        assert_eq!(pool.current_epoch(), 1);
        assert_eq!(pool.current_scale(), 0);
        assert_eq!(pool.product(), WAD);
        assert_eq!(pool.total_deposits(), U256::ZERO);

        // deposit is gone, but the collateral earned before the drain stays
        assert_eq!(pool.compounded_deposit(addr(2)).unwrap(), U256::ZERO);
        assert_eq!(
            pool.collateral_gains(addr(2)).unwrap(),
            vec![(ASSET_A, wad(3))]
        );

        // withdrawing returns no coin but pays the gains
        let outcome = pool
            .withdraw_all(addr(2), &mut coin, &mut issuance)
            .unwrap();
        assert_eq!(outcome.amount, U256::ZERO);
        assert_eq!(outcome.coll_gains, vec![(ASSET_A, wad(3))]);
        assert_eq!(pool.deposit_of(addr(2)), U256::ZERO);
    }

    #[test]
    fn test_deep_offsets_advance_scale() {
        let mut pool = StabilityPool::new();
        let mut coin = funded_book(&[(addr(3), 10_000)]);
        let mut issuance = ConstantIssuance::new(U256::ZERO);

        pool.provide(addr(3), wad(10_000), &mut coin, &mut issuance)
            .unwrap();
        // wipe out 99.99%, then 99.9999% of the remainder
        offset(&mut pool, ASSET_A, wad(9_999), wad(2));
        assert_eq!(pool.current_scale(), 0);
        offset(
            &mut pool,
            ASSET_A,
            U256::from(999_999_000_000_000_000u64),
            wad(1),
        );

        assert_eq!(pool.current_epoch(), 0);
        assert_eq!(pool.current_scale(), 1);
        // the product was stretched by 1e9 instead of underflowing
        assert!(pool.product() >= SCALE_FACTOR);
        assert!(pool.product() > U256::from(9u64) * pow10(16));

        // what's left of the deposit is under the one-millionth dust floor
        assert_eq!(pool.compounded_deposit(addr(3)).unwrap(), U256::ZERO);

        // collateral gains survive the rescale: 2 + 1 minus rounding dust
        let gains = pool.collateral_gains(addr(3)).unwrap();
        assert_eq!(gains.len(), 1);
        assert_eq!(gains[0].0, ASSET_A);
        assert_eq!(gains[0].1, U256::from(2_999_999_999_999_990_000u64));
    }

    #[test]
    fn test_multi_asset_gains() {
        let mut pool = StabilityPool::new();
        let mut coin = funded_book(&[(addr(4), 10_000)]);
        let mut issuance = ConstantIssuance::new(U256::ZERO);

        pool.provide(addr(4), wad(10_000), &mut coin, &mut issuance)
            .unwrap();
        offset(&mut pool, ASSET_A, wad(1_000), wad(1));
        offset(&mut pool, ASSET_B, wad(2_000), wad(3));

        let gains = pool.collateral_gains(addr(4)).unwrap();
        assert_eq!(gains.len(), 2);
        let gain_a = gains.iter().find(|(a, _)| *a == ASSET_A).unwrap().1;
        let gain_b = gains.iter().find(|(a, _)| *a == ASSET_B).unwrap().1;
        assert_eq!(gain_a, wad(1));
        // second offset divides by a post-offset P, so only dust is lost
        assert!(gain_b <= wad(3));
        assert!(wad(3) - gain_b < U256::from(1_000_000u64));
    }

    #[test]
    fn test_reward_stream_split_by_share() {
        let mut pool = StabilityPool::new();
        let mut coin = funded_book(&[(addr(5), 1_000), (addr(6), 1_000)]);
        let mut issuance = ConstantIssuance::new(wad(100));

        // first provide finds an empty pool: no fold happens
        pool.provide(addr(5), wad(1_000), &mut coin, &mut issuance)
            .unwrap();
        assert_eq!(pool.reward_gain(addr(5)).unwrap(), U256::ZERO);

        // second provide folds 100 into G while only addr(5) is deposited
        pool.provide(addr(6), wad(1_000), &mut coin, &mut issuance)
            .unwrap();
        assert_eq!(pool.reward_gain(addr(5)).unwrap(), wad(100));
        assert_eq!(pool.reward_gain(addr(6)).unwrap(), U256::ZERO);

        // a zero-amount withdraw claims: folds another 100, split evenly
        let outcome = pool
            .withdraw(addr(5), U256::ZERO, &mut coin, &mut issuance)
            .unwrap();
        assert_eq!(outcome.reward_gain, wad(150));
        assert_eq!(outcome.new_deposit, wad(1_000));
        assert_eq!(pool.reward_gain(addr(5)).unwrap(), U256::ZERO);
        assert_eq!(pool.reward_gain(addr(6)).unwrap(), wad(50));
    }

    #[test]
    fn test_rejected_provide_preserves_pending_issuance() {
        let mut pool = StabilityPool::new();
        let mut coin = funded_book(&[(addr(1), 1_000)]);
        let mut zero = ConstantIssuance::new(U256::ZERO);
        pool.provide(addr(1), wad(1_000), &mut coin, &mut zero)
            .unwrap();

        let mut issuance = DripIssuance { pending: wad(50) };

        // unfunded depositor: rejected before the trigger is consumed
        assert_eq!(
            pool.provide(addr(2), wad(5), &mut coin, &mut issuance),
            Err(LedgerError::InsufficientBalance)
        );
        assert_eq!(issuance.pending, wad(50));
        assert_eq!(pool.reward_gain(addr(1)).unwrap(), U256::ZERO);

        // the next funded touch folds the whole 50 into G for addr(1)
        coin.mint(addr(2), wad(5)).unwrap();
        pool.provide(addr(2), wad(5), &mut coin, &mut issuance)
            .unwrap();
        assert_eq!(issuance.pending, U256::ZERO);
        assert_eq!(pool.reward_gain(addr(1)).unwrap(), wad(50));
        assert_eq!(pool.reward_gain(addr(2)).unwrap(), U256::ZERO);
    }

    #[test]
    fn test_withdraw_caps_at_compounded() {
        let mut pool = StabilityPool::new();
        let mut coin = funded_book(&[(addr(7), 500)]);
        let mut issuance = ConstantIssuance::new(U256::ZERO);

        pool.provide(addr(7), wad(500), &mut coin, &mut issuance)
            .unwrap();
        let outcome = pool
            .withdraw(addr(7), wad(9_999), &mut coin, &mut issuance)
            .unwrap();
        assert_eq!(outcome.amount, wad(500));
        assert_eq!(coin.balance_of(addr(7)), wad(500));
        assert_eq!(pool.total_deposits(), U256::ZERO);
        assert_eq!(
            pool.withdraw(addr(7), wad(1), &mut coin, &mut issuance),
            Err(LedgerError::NoDeposit)
        );
    }

    #[test]
    fn test_offset_plan_rejects_bad_amounts() {
        let mut pool = StabilityPool::new();
        let mut coin = funded_book(&[(addr(8), 100)]);
        let mut issuance = ConstantIssuance::new(U256::ZERO);

        assert_eq!(
            pool.plan_offset(ASSET_A, wad(1), wad(1)).unwrap_err(),
            LedgerError::NoStakes
        );

        pool.provide(addr(8), wad(100), &mut coin, &mut issuance)
            .unwrap();
        assert_eq!(
            pool.plan_offset(ASSET_A, wad(101), wad(1)).unwrap_err(),
            LedgerError::NoStakes
        );
        assert_eq!(
            pool.plan_offset(ASSET_A, U256::ZERO, wad(1)).unwrap_err(),
            LedgerError::NoStakes
        );
    }

    #[test]
    fn test_dust_offset_within_carried_error() {
        let mut pool = StabilityPool::new();
        let mut coin = funded_book(&[(addr(9), 10_000)]);
        let mut issuance = ConstantIssuance::new(U256::ZERO);

        pool.provide(addr(9), wad(10_000), &mut coin, &mut issuance)
            .unwrap();
        // 5000 divides 10000 exactly, so the rounded-up loss overshoots by
        // one per unit and the carry lands at the full pre-offset total
        offset(&mut pool, ASSET_A, wad(5_000), wad(3));
        assert_eq!(pool.last_debt_error, wad(10_000));

        let p_before = pool.product();
        let compounded_before = pool.compounded_deposit(addr(9)).unwrap();

        // 1000 wei of debt scales to less than the carry: P stays put and
        // only the carry is consumed
        offset(&mut pool, ASSET_A, U256::from(1_000u64), U256::from(1u64));

        assert_eq!(pool.product(), p_before);
        assert_eq!(pool.current_scale(), 0);
        assert_eq!(pool.current_epoch(), 0);
        assert_eq!(pool.last_debt_error, wad(9_000));
        assert_eq!(pool.total_deposits(), wad(5_000) - U256::from(1_000u64));
        assert_eq!(
            pool.compounded_deposit(addr(9)).unwrap(),
            compounded_before
        );

        // larger offsets keep draining the carry through the normal path
        offset(&mut pool, ASSET_A, wad(1_000), wad(1));
        assert!(pool.product() < p_before);
    }

    #[test]
    fn test_later_depositor_unaffected_by_earlier_losses() {
        let mut pool = StabilityPool::new();
        let mut coin = funded_book(&[(addr(1), 10_000), (addr(2), 10_000)]);
        let mut issuance = ConstantIssuance::new(U256::ZERO);

        pool.provide(addr(1), wad(10_000), &mut coin, &mut issuance)
            .unwrap();
        offset(&mut pool, ASSET_A, wad(4_000), wad(2));

        // addr(2) deposits after the offset: no losses, no gains
        pool.provide(addr(2), wad(4_000), &mut coin, &mut issuance)
            .unwrap();
        assert_eq!(pool.compounded_deposit(addr(2)).unwrap(), wad(4_000));
        assert!(pool.collateral_gains(addr(2)).unwrap().is_empty());

        // the earlier depositor still carries the loss
        let compounded_1 = pool.compounded_deposit(addr(1)).unwrap();
        assert!(compounded_1 < wad(6_000));
        assert!(compounded_1 > wad(5_999));
    }
}
