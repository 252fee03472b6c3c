//! Collaborator seams.
//!
//! The engine never talks to an oracle, a token contract or an issuance
//! schedule directly; it receives these traits per call. The in-memory
//! implementations below back the replay binary and the test suite.

use std::collections::HashMap;

use alloy::primitives::{Address, U256};

use crate::error::{LedgerError, LedgerResult};

/// Price source for collateral assets, WAD-denominated.
///
/// Staleness and aggregation are the oracle collaborator's problem; the
/// engine treats whatever it returns as current truth.
pub trait PriceFeed {
    fn price(&self, asset: Address) -> LedgerResult<U256>;
}

/// The stablecoin token ledger.
///
/// Debt increases mint to the owner, repayments and redemptions burn from
/// the payer, and the stability buffer pulls/pushes deposits through the
/// same two calls.
pub trait StablecoinLedger {
    fn mint(&mut self, to: Address, amount: U256) -> LedgerResult<()>;
    fn burn_from(&mut self, holder: Address, amount: U256) -> LedgerResult<()>;
    fn balance_of(&self, holder: Address) -> U256;
}

/// Reward-token issuance schedule for stability depositors.
pub trait RewardIssuance {
    /// Amount newly issued since the previous trigger.
    fn issue(&mut self) -> LedgerResult<U256>;
}

/// Fixed price table with explicit updates. Unset or zero prices are
/// reported as [`LedgerError::ZeroPrice`].
#[derive(Debug, Clone, Default)]
pub struct StaticPriceFeed {
    prices: HashMap<Address, U256>,
}

impl StaticPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&mut self, asset: Address, price: U256) {
        self.prices.insert(asset, price);
    }
}

impl PriceFeed for StaticPriceFeed {
    fn price(&self, asset: Address) -> LedgerResult<U256> {
        match self.prices.get(&asset) {
            Some(price) if !price.is_zero() => Ok(*price),
            _ => Err(LedgerError::ZeroPrice),
        }
    }
}

/// Plain balance book implementing [`StablecoinLedger`].
#[derive(Debug, Clone, Default)]
pub struct TokenBook {
    balances: HashMap<Address, U256>,
    total_supply: U256,
}

impl TokenBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_supply(&self) -> U256 {
        self.total_supply
    }
}

impl StablecoinLedger for TokenBook {
    fn mint(&mut self, to: Address, amount: U256) -> LedgerResult<()> {
        if to == Address::ZERO {
            return Err(LedgerError::ZeroIdentifier);
        }
        let balance = self.balances.entry(to).or_default();
        *balance = balance.checked_add(amount).ok_or(LedgerError::Overflow)?;
        self.total_supply = self
            .total_supply
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    fn burn_from(&mut self, holder: Address, amount: U256) -> LedgerResult<()> {
        let balance = self
            .balances
            .get_mut(&holder)
            .ok_or(LedgerError::InsufficientBalance)?;
        if *balance < amount {
            return Err(LedgerError::InsufficientBalance);
        }
        *balance -= amount;
        self.total_supply -= amount;
        Ok(())
    }

    fn balance_of(&self, holder: Address) -> U256 {
        self.balances.get(&holder).copied().unwrap_or_default()
    }
}

/// Issues the same amount on every trigger. `ConstantIssuance::new(0)`
/// disables the reward stream entirely.
#[derive(Debug, Clone, Copy)]
pub struct ConstantIssuance {
    per_trigger: U256,
}

impl ConstantIssuance {
    pub fn new(per_trigger: U256) -> Self {
        Self { per_trigger }
    }
}

impl RewardIssuance for ConstantIssuance {
    fn issue(&mut self) -> LedgerResult<U256> {
        Ok(self.per_trigger)
    }
}
