//! Protocol configuration.
//!
//! Two layers: [`ProtocolConfig`] is the serde/TOML surface with defaults
//! and named profiles, [`ProtocolParams`] is what the engine actually
//! consumes after `resolve()` turned basis points and whole-token integers
//! into exact WAD values.

use alloy::primitives::{Address, U256};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::wad_math::{bps_to_wad, WAD};

fn default_profile() -> String {
    "default".to_string()
}

fn default_mcr_bps() -> u32 {
    11_000
}

fn default_ccr_bps() -> u32 {
    15_000
}

fn default_liquidation_reserve() -> u64 {
    200
}

fn default_min_debt() -> u64 {
    2_000
}

fn default_max_positions() -> usize {
    10_000_000
}

/// One collateral asset entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    pub symbol: String,
    /// 0x-prefixed account address; `${VAR}` patterns are expanded from the
    /// environment before parsing.
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Minimum collateralization ratio in basis points (11000 = 110%).
    #[serde(default = "default_mcr_bps")]
    pub mcr_bps: u32,

    /// Critical ratio in basis points; the asset enters recovery mode when
    /// its total collateral ratio falls below this (15000 = 150%).
    #[serde(default = "default_ccr_bps")]
    pub ccr_bps: u32,

    /// Liquidation reserve in whole stablecoin units. Half of it, valued in
    /// USD, is the per-liquidation caller compensation target.
    #[serde(default = "default_liquidation_reserve")]
    pub liquidation_reserve: u64,

    /// Minimum position debt in whole stablecoin units.
    #[serde(default = "default_min_debt")]
    pub min_debt: u64,

    /// Registry capacity per collateral asset.
    #[serde(default = "default_max_positions")]
    pub max_positions_per_asset: usize,

    /// Address of the only caller allowed on the position mutators.
    #[serde(default)]
    pub front_door: String,

    #[serde(default)]
    pub assets: Vec<AssetConfig>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            mcr_bps: default_mcr_bps(),
            ccr_bps: default_ccr_bps(),
            liquidation_reserve: default_liquidation_reserve(),
            min_debt: default_min_debt(),
            max_positions_per_asset: default_max_positions(),
            front_door: String::new(),
            assets: Vec::new(),
        }
    }
}

impl ProtocolConfig {
    /// Profile for test deployments: same ratios, low debt floor and a
    /// small registry so capacity paths are reachable.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            mcr_bps: 11_000,
            ccr_bps: 15_000,
            liquidation_reserve: 200,
            min_debt: 100,                 // low floor for small fixtures
            max_positions_per_asset: 1_000,
            front_door: String::new(),
            assets: Vec::new(),
        }
    }

    /// Select a profile from `TROVES_PROFILE` (defaults to `default`).
    pub fn from_env() -> Self {
        let profile = std::env::var("TROVES_PROFILE").unwrap_or_default();
        match profile.as_str() {
            "testing" => {
                info!("using testing protocol profile");
                Self::testing()
            }
            _ => Self::default(),
        }
    }

    /// Load from a TOML file. Missing fields fall back to defaults.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config {}", path.as_ref().display()))?;
        let config: ProtocolConfig = toml::from_str(&content).context("parsing config TOML")?;
        Ok(config)
    }

    /// Expand `${VAR_NAME}` patterns in address fields.
    pub fn expand_env_vars(&mut self) {
        self.front_door = expand_env(&self.front_door);
        for asset in &mut self.assets {
            asset.address = expand_env(&asset.address);
        }
    }

    /// Validate and convert into exact engine parameters.
    pub fn resolve(&self) -> anyhow::Result<ProtocolParams> {
        if self.mcr_bps <= 10_000 {
            bail!("mcr_bps must exceed 10000 (100%), got {}", self.mcr_bps);
        }
        if self.ccr_bps < self.mcr_bps {
            bail!(
                "ccr_bps ({}) must be at least mcr_bps ({})",
                self.ccr_bps,
                self.mcr_bps
            );
        }
        if self.max_positions_per_asset == 0 {
            bail!("max_positions_per_asset must be non-zero");
        }

        let front_door = if self.front_door.is_empty() {
            Address::ZERO
        } else {
            self.front_door
                .parse::<Address>()
                .with_context(|| format!("invalid front_door address {}", self.front_door))?
        };

        let mut assets = Vec::with_capacity(self.assets.len());
        for asset in &self.assets {
            let address = asset
                .address
                .parse::<Address>()
                .with_context(|| format!("invalid address for asset {}", asset.symbol))?;
            assets.push(AssetParams {
                symbol: asset.symbol.clone(),
                address,
            });
        }

        Ok(ProtocolParams {
            mcr: bps_to_wad(self.mcr_bps),
            ccr: bps_to_wad(self.ccr_bps),
            gas_comp_usd: U256::from(self.liquidation_reserve) * WAD / U256::from(2u64),
            min_debt: U256::from(self.min_debt) * WAD,
            max_positions_per_asset: self.max_positions_per_asset,
            front_door,
            assets,
        })
    }

    /// Log the effective configuration at startup.
    pub fn log_config(&self) {
        info!(profile = %self.profile, "protocol configuration");
        info!(
            mcr_bps = self.mcr_bps,
            ccr_bps = self.ccr_bps,
            liquidation_reserve = self.liquidation_reserve,
            min_debt = self.min_debt,
            "ratios and floors"
        );
        info!(
            max_positions_per_asset = self.max_positions_per_asset,
            assets = self.assets.len(),
            front_door = %self.front_door,
            "deployment"
        );
    }
}

/// Exact parameters the engine computes with.
#[derive(Debug, Clone)]
pub struct ProtocolParams {
    /// Minimum collateralization ratio, WAD (1.1e18 = 110%).
    pub mcr: U256,
    /// Critical ratio for recovery mode, WAD.
    pub ccr: U256,
    /// USD value of the per-liquidation caller compensation, WAD.
    pub gas_comp_usd: U256,
    /// Minimum position debt, WAD.
    pub min_debt: U256,
    pub max_positions_per_asset: usize,
    pub front_door: Address,
    pub assets: Vec<AssetParams>,
}

#[derive(Debug, Clone)]
pub struct AssetParams {
    pub symbol: String,
    pub address: Address,
}

/// Expand ${VAR_NAME} patterns with environment variable values.
fn expand_env(s: &str) -> String {
    let mut result = s.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}").unwrap();

    for cap in re.captures_iter(s) {
        if let (Some(full_match), Some(var_match)) = (cap.get(0), cap.get(1)) {
            if let Ok(value) = std::env::var(var_match.as_str()) {
                result = result.replace(full_match.as_str(), &value);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = ProtocolConfig::default();
        assert_eq!(config.mcr_bps, 11_000);
        assert_eq!(config.ccr_bps, 15_000);
        assert_eq!(config.liquidation_reserve, 200);
        assert_eq!(config.min_debt, 2_000);
        assert_eq!(config.max_positions_per_asset, 10_000_000);
        assert!(config.assets.is_empty());
    }

    #[test]
    fn test_testing_profile() {
        let config = ProtocolConfig::testing();
        assert_eq!(config.profile, "testing");
        assert_eq!(config.min_debt, 100);
        assert_eq!(config.max_positions_per_asset, 1_000);
    }

    #[test]
    fn test_resolve_exact_values() {
        let params = ProtocolConfig::default().resolve().unwrap();
        // 11000 bps -> 1.1e18, 15000 bps -> 1.5e18
        assert_eq!(params.mcr, U256::from(1_100_000_000_000_000_000u64));
        assert_eq!(params.ccr, U256::from(1_500_000_000_000_000_000u64));
        // reserve 200 -> 100 USD compensation target
        assert_eq!(params.gas_comp_usd, U256::from(100u64) * WAD);
        assert_eq!(params.min_debt, U256::from(2_000u64) * WAD);
        assert_eq!(params.front_door, Address::ZERO);
    }

    #[test]
    fn test_resolve_rejects_bad_ratios() {
        let mut config = ProtocolConfig::default();
        config.mcr_bps = 10_000;
        assert!(config.resolve().is_err());

        let mut config = ProtocolConfig::default();
        config.ccr_bps = 10_500;
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_resolve_parses_addresses() {
        let mut config = ProtocolConfig::default();
        config.front_door = "0x1111111111111111111111111111111111111111".to_string();
        config.assets.push(AssetConfig {
            symbol: "WETH".to_string(),
            address: "0x2222222222222222222222222222222222222222".to_string(),
        });

        let params = config.resolve().unwrap();
        assert_eq!(params.front_door, Address::repeat_byte(0x11));
        assert_eq!(params.assets.len(), 1);
        assert_eq!(params.assets[0].symbol, "WETH");
        assert_eq!(params.assets[0].address, Address::repeat_byte(0x22));

        config.assets[0].address = "not-an-address".to_string();
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_toml_partial_fields_use_defaults() {
        let toml_str = r#"
            mcr_bps = 12000

            [[assets]]
            symbol = "WBTC"
            address = "0x3333333333333333333333333333333333333333"
        "#;
        let config: ProtocolConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mcr_bps, 12_000);
        assert_eq!(config.ccr_bps, 15_000);
        assert_eq!(config.min_debt, 2_000);
        assert_eq!(config.assets.len(), 1);
        assert_eq!(config.assets[0].symbol, "WBTC");
    }

    #[test]
    fn test_expand_env() {
        // Use unique var name to avoid conflicts with parallel tests
        std::env::set_var("TROVES_TEST_FRONT_DOOR", "0x4444444444444444444444444444444444444444");
        let mut config = ProtocolConfig::default();
        config.front_door = "${TROVES_TEST_FRONT_DOOR}".to_string();
        config.expand_env_vars();
        assert_eq!(
            config.front_door,
            "0x4444444444444444444444444444444444444444"
        );
        std::env::remove_var("TROVES_TEST_FRONT_DOOR");

        assert_eq!(expand_env("no_vars"), "no_vars");
    }

    #[test]
    fn test_config_round_trip() {
        let config = ProtocolConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: ProtocolConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.mcr_bps, config.mcr_bps);
        assert_eq!(deserialized.min_debt, config.min_debt);
    }
}
