//! Trove Engine Scenario Replay
//!
//! Drives a trove ledger through a TOML-scripted sequence of operations
//! (opens, adjustments, price moves, liquidations, redemptions, stability
//! deposits) against in-memory collaborators, then prints the final ledger
//! state as a JSON report.
//!
//! Configuration comes from a `TROVES_CONFIG` TOML file or the profiles
//! selected by `TROVES_PROFILE`; the scenario file is the first CLI
//! argument (or `TROVES_SCENARIO`). Accounts and assets are named by free
//! labels in the scenario and mapped to synthetic addresses.

use std::collections::{BTreeMap, HashMap};

use alloy::primitives::{Address, U256};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use troves_core::config::{AssetParams, ProtocolConfig, ProtocolParams};
use troves_core::wad_math::{f64_to_wad, wad_to_f64};
use troves_core::{
    ConstantIssuance, InsertHints, StablecoinLedger, StaticPriceFeed, TokenBook, TroveChange,
    TroveLedger,
};

/// Environment variable names.
mod env {
    pub const TROVES_CONFIG: &str = "TROVES_CONFIG";
    pub const TROVES_SCENARIO: &str = "TROVES_SCENARIO";
}

fn main() -> Result<()> {
    print_banner();

    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,troves_core=debug")),
        )
        .init();

    // Protocol parameters: explicit file wins over the named profiles
    let mut config = match std::env::var(env::TROVES_CONFIG) {
        Ok(path) => ProtocolConfig::from_file(&path)?,
        Err(_) => ProtocolConfig::from_env(),
    };
    config.expand_env_vars();
    config.log_config();
    let params = config.resolve()?;

    let scenario_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(env::TROVES_SCENARIO).ok());
    let Some(scenario_path) = scenario_path else {
        bail!("usage: troves <scenario.toml> (or set {})", env::TROVES_SCENARIO);
    };
    let content = std::fs::read_to_string(&scenario_path)
        .with_context(|| format!("reading scenario {scenario_path}"))?;
    let scenario: Scenario = toml::from_str(&content).context("parsing scenario TOML")?;
    info!(
        scenario = %scenario_path,
        assets = scenario.assets.len(),
        steps = scenario.steps.len(),
        "scenario loaded"
    );

    let mut replay = Replay::new(params, &scenario)?;
    for (index, step) in scenario.steps.iter().enumerate() {
        replay
            .run_step(step)
            .with_context(|| format!("step {} failed", index + 1))?;
    }

    let report = replay.report()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// --- scenario format ---

#[derive(Debug, Deserialize)]
struct Scenario {
    /// Reward tokens granted to stability depositors per issuance trigger.
    #[serde(default)]
    issuance_per_trigger: f64,
    #[serde(default)]
    assets: Vec<ScenarioAsset>,
    #[serde(default)]
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
struct ScenarioAsset {
    symbol: String,
    price: f64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Step {
    Open {
        owner: String,
        asset: Option<String>,
        coll: f64,
        debt: f64,
    },
    Adjust {
        owner: String,
        asset: Option<String>,
        #[serde(default)]
        deposit: f64,
        #[serde(default)]
        withdraw: f64,
        #[serde(default)]
        borrow: f64,
        #[serde(default)]
        repay: f64,
    },
    Close {
        owner: String,
        asset: Option<String>,
    },
    SetPrice {
        asset: Option<String>,
        price: f64,
    },
    /// Faucet for funding redeemers and depositors beyond their borrowings.
    Mint {
        to: String,
        amount: f64,
    },
    Provide {
        depositor: String,
        amount: f64,
    },
    Withdraw {
        depositor: String,
        amount: f64,
    },
    WithdrawAll {
        depositor: String,
    },
    Liquidate {
        owner: String,
        asset: Option<String>,
    },
    BatchLiquidate {
        owners: Vec<String>,
        asset: Option<String>,
    },
    Redeem {
        redeemer: String,
        amount: f64,
        asset: Option<String>,
    },
    ClaimSurplus {
        owner: String,
        asset: Option<String>,
    },
}

// --- execution ---

struct Replay {
    ledger: TroveLedger,
    feed: StaticPriceFeed,
    coin: TokenBook,
    issuance: ConstantIssuance,
    /// Caller identity used on the front-door mutators.
    operator: Address,
    /// Scenario label -> synthetic account address.
    accounts: BTreeMap<String, Address>,
    next_account: u8,
    /// Asset symbol -> address, in scenario declaration order.
    assets: BTreeMap<String, Address>,
    default_asset: Option<Address>,
    /// Last price per symbol, mirrored for the report.
    prices: BTreeMap<String, f64>,
}

impl Replay {
    fn new(mut params: ProtocolParams, scenario: &Scenario) -> Result<Self> {
        let mut feed = StaticPriceFeed::new();
        let mut assets = BTreeMap::new();
        let mut prices = BTreeMap::new();
        let mut default_asset = None;

        for (index, entry) in scenario.assets.iter().enumerate() {
            // Deployed asset lists keep their configured addresses;
            // anything else gets a synthetic one.
            let known = params
                .assets
                .iter()
                .find(|a| a.symbol == entry.symbol)
                .map(|a| a.address);
            let address = match known {
                Some(address) => address,
                None => {
                    let Some(byte) = 0xA0u8.checked_add(index as u8) else {
                        bail!("scenario declares too many assets");
                    };
                    let address = Address::with_last_byte(byte);
                    params.assets.push(AssetParams {
                        symbol: entry.symbol.clone(),
                        address,
                    });
                    address
                }
            };
            feed.set_price(address, f64_to_wad(entry.price));
            assets.insert(entry.symbol.clone(), address);
            prices.insert(entry.symbol.clone(), entry.price);
            default_asset.get_or_insert(address);
        }

        let operator = if params.front_door == Address::ZERO {
            Address::repeat_byte(0xFE)
        } else {
            params.front_door
        };

        Ok(Self {
            ledger: TroveLedger::new(params),
            feed,
            coin: TokenBook::new(),
            issuance: ConstantIssuance::new(f64_to_wad(scenario.issuance_per_trigger)),
            operator,
            accounts: BTreeMap::new(),
            next_account: 0,
            assets,
            default_asset,
            prices,
        })
    }

    fn account(&mut self, label: &str) -> Result<Address> {
        if let Some(address) = self.accounts.get(label) {
            return Ok(*address);
        }
        if self.next_account >= 0xF0 {
            bail!("scenario uses too many accounts");
        }
        self.next_account += 1;
        let address = Address::repeat_byte(self.next_account);
        self.accounts.insert(label.to_string(), address);
        Ok(address)
    }

    fn asset(&self, symbol: Option<&String>) -> Result<Address> {
        match symbol {
            Some(symbol) => self
                .assets
                .get(symbol)
                .copied()
                .with_context(|| format!("asset {symbol} not declared in scenario")),
            None => self.default_asset.context("scenario declares no assets"),
        }
    }

    fn run_step(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::Open {
                owner,
                asset,
                coll,
                debt,
            } => {
                let owner_addr = self.account(owner)?;
                let asset_addr = self.asset(asset.as_ref())?;
                self.ledger.open_trove(
                    self.operator,
                    owner_addr,
                    asset_addr,
                    f64_to_wad(*coll),
                    f64_to_wad(*debt),
                    InsertHints::none(),
                    &mut self.coin,
                )?;
                info!(owner = %owner, coll, debt, "open");
            }
            Step::Adjust {
                owner,
                asset,
                deposit,
                withdraw,
                borrow,
                repay,
            } => {
                let owner_addr = self.account(owner)?;
                let asset_addr = self.asset(asset.as_ref())?;
                let change = TroveChange::default()
                    .deposit_collateral(f64_to_wad(*deposit))
                    .withdraw_collateral(f64_to_wad(*withdraw))
                    .borrow(f64_to_wad(*borrow))
                    .repay(f64_to_wad(*repay));
                self.ledger.update_trove(
                    self.operator,
                    owner_addr,
                    asset_addr,
                    change,
                    InsertHints::none(),
                    &mut self.coin,
                )?;
                info!(owner = %owner, deposit, withdraw, borrow, repay, "adjust");
            }
            Step::Close { owner, asset } => {
                let owner_addr = self.account(owner)?;
                let asset_addr = self.asset(asset.as_ref())?;
                self.ledger
                    .close_trove(self.operator, owner_addr, asset_addr, &mut self.coin)?;
                info!(owner = %owner, "close");
            }
            Step::SetPrice { asset, price } => {
                let asset_addr = self.asset(asset.as_ref())?;
                self.feed.set_price(asset_addr, f64_to_wad(*price));
                let symbol = self
                    .assets
                    .iter()
                    .find(|(_, &a)| a == asset_addr)
                    .map(|(s, _)| s.clone())
                    .unwrap_or_default();
                self.prices.insert(symbol.clone(), *price);
                info!(asset = %symbol, price, "set price");
            }
            Step::Mint { to, amount } => {
                let to_addr = self.account(to)?;
                self.coin.mint(to_addr, f64_to_wad(*amount))?;
                info!(to = %to, amount, "mint");
            }
            Step::Provide { depositor, amount } => {
                let depositor_addr = self.account(depositor)?;
                let outcome = self.ledger.provide_to_pool(
                    depositor_addr,
                    f64_to_wad(*amount),
                    &mut self.coin,
                    &mut self.issuance,
                )?;
                info!(
                    depositor = %depositor,
                    amount,
                    new_deposit = wad_to_f64(outcome.new_deposit),
                    "provide"
                );
            }
            Step::Withdraw { depositor, amount } => {
                let depositor_addr = self.account(depositor)?;
                let outcome = self.ledger.withdraw_from_pool(
                    depositor_addr,
                    f64_to_wad(*amount),
                    &mut self.coin,
                    &mut self.issuance,
                )?;
                info!(
                    depositor = %depositor,
                    withdrawn = wad_to_f64(outcome.amount),
                    new_deposit = wad_to_f64(outcome.new_deposit),
                    "withdraw"
                );
            }
            Step::WithdrawAll { depositor } => {
                let depositor_addr = self.account(depositor)?;
                let outcome = self.ledger.withdraw_all_from_pool(
                    depositor_addr,
                    &mut self.coin,
                    &mut self.issuance,
                )?;
                info!(depositor = %depositor, withdrawn = wad_to_f64(outcome.amount), "withdraw all");
            }
            Step::Liquidate { owner, asset } => {
                let owner_addr = self.account(owner)?;
                let asset_addr = self.asset(asset.as_ref())?;
                let totals =
                    self.ledger
                        .liquidate(asset_addr, owner_addr, &self.feed, &mut self.issuance)?;
                info!(
                    owner = %owner,
                    debt = wad_to_f64(totals.entire_debt),
                    offset = wad_to_f64(totals.debt_to_offset),
                    redistributed = wad_to_f64(totals.debt_to_redistribute),
                    "liquidate"
                );
            }
            Step::BatchLiquidate { owners, asset } => {
                let asset_addr = self.asset(asset.as_ref())?;
                let mut candidates = Vec::with_capacity(owners.len());
                for owner in owners {
                    candidates.push(self.account(owner)?);
                }
                let totals = self.ledger.batch_liquidate(
                    asset_addr,
                    &candidates,
                    &self.feed,
                    &mut self.issuance,
                )?;
                info!(
                    candidates = owners.len(),
                    debt = wad_to_f64(totals.entire_debt),
                    offset = wad_to_f64(totals.debt_to_offset),
                    redistributed = wad_to_f64(totals.debt_to_redistribute),
                    "batch liquidate"
                );
            }
            Step::Redeem {
                redeemer,
                amount,
                asset,
            } => {
                let redeemer_addr = self.account(redeemer)?;
                let asset_addr = self.asset(asset.as_ref())?;
                let outcome = self.ledger.redeem_collateral(
                    redeemer_addr,
                    asset_addr,
                    f64_to_wad(*amount),
                    &self.feed,
                    &mut self.coin,
                )?;
                info!(
                    redeemer = %redeemer,
                    used = wad_to_f64(outcome.stablecoin_used),
                    collateral = wad_to_f64(outcome.collateral_redeemed),
                    closed = outcome.positions_closed,
                    "redeem"
                );
            }
            Step::ClaimSurplus { owner, asset } => {
                let owner_addr = self.account(owner)?;
                let asset_addr = self.asset(asset.as_ref())?;
                let amount = self
                    .ledger
                    .claim_surplus(self.operator, owner_addr, asset_addr)?;
                info!(owner = %owner, amount = wad_to_f64(amount), "claim surplus");
            }
        }
        Ok(())
    }

    fn report(&self) -> Result<Report> {
        let labels: HashMap<Address, &str> = self
            .accounts
            .iter()
            .map(|(label, address)| (*address, label.as_str()))
            .collect();

        let mut assets = Vec::with_capacity(self.assets.len());
        for (symbol, &address) in &self.assets {
            let price = self.prices.get(symbol).copied().unwrap_or_default();
            let price_wad = f64_to_wad(price);

            let mut positions = Vec::new();
            for owner in self.ledger.registry().iter(address) {
                let Some(trove) = self.ledger.trove(address, owner) else {
                    continue;
                };
                let (debt, coll) = self.ledger.trove_debt_and_coll(address, owner)?;
                let icr = self.ledger.current_icr(address, owner, price_wad)?;
                positions.push(PositionReport {
                    owner: labels.get(&owner).unwrap_or(&"?").to_string(),
                    debt: wad_to_f64(debt),
                    collateral: wad_to_f64(coll),
                    stake: wad_to_f64(trove.stake),
                    icr: (icr != U256::MAX).then(|| wad_to_f64(icr)),
                });
            }

            assets.push(AssetReport {
                symbol: symbol.clone(),
                price,
                total_collateral: wad_to_f64(self.ledger.total_collateral(address)),
                total_debt: wad_to_f64(self.ledger.total_debt(address)),
                total_stakes: wad_to_f64(self.ledger.total_stakes(address)),
                recovery_mode: self.ledger.is_recovery_mode(address, price_wad)?,
                pool_collateral: wad_to_f64(self.ledger.pool().coll_balance(address)),
                positions,
            });
        }

        let mut accounts = BTreeMap::new();
        for (label, &address) in &self.accounts {
            let mut surplus = BTreeMap::new();
            for (symbol, &asset_addr) in &self.assets {
                let claimable = self.ledger.claimable_surplus(address, asset_addr);
                if !claimable.is_zero() {
                    surplus.insert(symbol.clone(), wad_to_f64(claimable));
                }
            }
            accounts.insert(
                label.clone(),
                AccountReport {
                    stablecoin: wad_to_f64(self.coin.balance_of(address)),
                    pool_deposit: wad_to_f64(self.ledger.pool().compounded_deposit(address)?),
                    reward_gain: wad_to_f64(self.ledger.pool().reward_gain(address)?),
                    surplus,
                },
            );
        }

        Ok(Report {
            assets,
            pool: PoolReport {
                total_deposits: wad_to_f64(self.ledger.pool().total_deposits()),
                product: wad_to_f64(self.ledger.pool().product()),
                epoch: self.ledger.pool().current_epoch(),
                scale: self.ledger.pool().current_scale(),
            },
            stablecoin_supply: wad_to_f64(self.coin.total_supply()),
            accounts,
        })
    }
}

// --- report format ---

#[derive(Debug, Serialize)]
struct Report {
    assets: Vec<AssetReport>,
    pool: PoolReport,
    stablecoin_supply: f64,
    accounts: BTreeMap<String, AccountReport>,
}

#[derive(Debug, Serialize)]
struct AssetReport {
    symbol: String,
    price: f64,
    total_collateral: f64,
    total_debt: f64,
    total_stakes: f64,
    recovery_mode: bool,
    pool_collateral: f64,
    /// Active positions in registry order, highest NICR first.
    positions: Vec<PositionReport>,
}

#[derive(Debug, Serialize)]
struct PositionReport {
    owner: String,
    debt: f64,
    collateral: f64,
    stake: f64,
    /// Absent when the position carries no debt.
    icr: Option<f64>,
}

#[derive(Debug, Serialize)]
struct PoolReport {
    total_deposits: f64,
    product: f64,
    epoch: u64,
    scale: u64,
}

#[derive(Debug, Serialize)]
struct AccountReport {
    stablecoin: f64,
    /// Compounded stability deposit.
    pool_deposit: f64,
    reward_gain: f64,
    /// Claimable redemption surplus per asset symbol; empty entries are
    /// omitted.
    surplus: BTreeMap<String, f64>,
}

/// Print startup banner.
fn print_banner() {
    println!(
        r#"
    ╔╦╗┬─┐┌─┐┬  ┬┌─┐┌─┐
     ║ ├┬┘│ │└┐┌┘├┤ └─┐
     ╩ ┴└─└─┘ └┘ └─┘└─┘
    Trove Engine v0.1.0
    "#
    );
}
