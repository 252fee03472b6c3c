//! Native U256 fixed-point arithmetic for the trove engine.
//!
//! All amounts, prices and ratios are 18-decimal WAD values. Multiplication
//! and division truncate toward zero; call sites that must not lose dust
//! carry the remainder in an explicit error register instead. Overflow is
//! never allowed to wrap: every product goes through `checked_mul` and
//! surfaces as [`LedgerError::Overflow`].

use alloy::primitives::U256;

use crate::error::{LedgerError, LedgerResult};

/// WAD constant: 1e18 for 18-decimal fixed-point arithmetic
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// Half WAD: 5e17, used for half-up rounding inside `dec_pow`
pub const HALF_WAD: U256 = U256::from_limbs([500_000_000_000_000_000u64, 0, 0, 0]);

/// Nominal-ICR precision: 1e20 (limbs encode 5 * 2^64 + 7766279631452241920)
pub const NICR_PRECISION: U256 = U256::from_limbs([7_766_279_631_452_241_920u64, 5, 0, 0]);

/// Stability-pool scale factor: 1e9, the rescale threshold for the product `P`
pub const SCALE_FACTOR: U256 = U256::from_limbs([1_000_000_000u64, 0, 0, 0]);

/// Basis points denominator (10000 = 100%)
pub const BPS_DENOMINATOR: U256 = U256::from_limbs([10_000u64, 0, 0, 0]);

/// Pre-computed powers of 10 for fast decimal conversion
const POW10: [u128; 39] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
    1_000_000_000_000,
    10_000_000_000_000,
    100_000_000_000_000,
    1_000_000_000_000_000,
    10_000_000_000_000_000,
    100_000_000_000_000_000,
    1_000_000_000_000_000_000,
    10_000_000_000_000_000_000,
    100_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000_000_000,
];

/// Fast power of 10 lookup (up to 10^38)
#[inline(always)]
pub fn pow10(exp: u8) -> U256 {
    if exp < 39 {
        U256::from(POW10[exp as usize])
    } else {
        U256::from(10u64).pow(U256::from(exp))
    }
}

/// Convert a basis-point parameter to a WAD ratio.
///
/// Example: bps_to_wad(11000) = 1.1e18
#[inline(always)]
pub fn bps_to_wad(bps: u32) -> U256 {
    (U256::from(bps) * WAD) / BPS_DENOMINATOR
}

/// Multiply two WAD values: (a * b) / WAD, truncating.
#[inline(always)]
pub fn wad_mul(a: U256, b: U256) -> LedgerResult<U256> {
    let product = a.checked_mul(b).ok_or(LedgerError::Overflow)?;
    Ok(product / WAD)
}

/// Divide two WAD values: (a * WAD) / b, truncating.
///
/// Zero denominators are rejected; the zero-debt ICR sentinel lives in
/// [`compute_cr`], not here.
#[inline(always)]
pub fn wad_div(a: U256, b: U256) -> LedgerResult<U256> {
    if b.is_zero() {
        return Err(LedgerError::DivisionByZero);
    }
    let scaled = a.checked_mul(WAD).ok_or(LedgerError::Overflow)?;
    Ok(scaled / b)
}

/// Full-precision (a * b) / denominator, truncating.
#[inline(always)]
pub fn mul_div(a: U256, b: U256, denominator: U256) -> LedgerResult<U256> {
    if denominator.is_zero() {
        return Err(LedgerError::DivisionByZero);
    }
    let product = a.checked_mul(b).ok_or(LedgerError::Overflow)?;
    Ok(product / denominator)
}

/// Individual collateralization ratio: collateral * price / debt.
///
/// Returns `U256::MAX` for zero-debt positions so that a debt-free position
/// always ranks as maximally collateralized.
#[inline(always)]
pub fn compute_cr(collateral: U256, price: U256, debt: U256) -> LedgerResult<U256> {
    if debt.is_zero() {
        return Ok(U256::MAX);
    }
    let value = collateral.checked_mul(price).ok_or(LedgerError::Overflow)?;
    Ok(value / debt)
}

/// Nominal collateralization ratio: collateral * 1e20 / debt, price-free.
///
/// The registry orders positions by this value; it only moves when the
/// position's own collateral or debt changes, never with the oracle.
#[inline(always)]
pub fn compute_nominal_cr(collateral: U256, debt: U256) -> LedgerResult<U256> {
    if debt.is_zero() {
        return Ok(U256::MAX);
    }
    let scaled = collateral
        .checked_mul(NICR_PRECISION)
        .ok_or(LedgerError::Overflow)?;
    Ok(scaled / debt)
}

/// WAD exponentiation by squaring with half-up rounding per step.
///
/// Example: dec_pow(0.9e18, 2) = 0.81e18
pub fn dec_pow(base: U256, exponent: u64) -> LedgerResult<U256> {
    if exponent == 0 {
        return Ok(WAD);
    }

    let mut x = base;
    let mut y = WAD;
    let mut n = exponent;
    while n > 1 {
        if n % 2 == 1 {
            y = round_mul(x, y)?;
        }
        x = round_mul(x, x)?;
        n /= 2;
    }
    round_mul(x, y)
}

/// (a * b + WAD/2) / WAD, the half-up product used by `dec_pow`
#[inline(always)]
fn round_mul(a: U256, b: U256) -> LedgerResult<U256> {
    let product = a.checked_mul(b).ok_or(LedgerError::Overflow)?;
    let bumped = product.checked_add(HALF_WAD).ok_or(LedgerError::Overflow)?;
    Ok(bumped / WAD)
}

/// WAD square root: floor(sqrt(x * 1e18)), so wad_sqrt(4e18) = 2e18.
pub fn wad_sqrt(x: U256) -> LedgerResult<U256> {
    if x.is_zero() {
        return Ok(U256::ZERO);
    }
    let scaled = x.checked_mul(WAD).ok_or(LedgerError::Overflow)?;

    // Newton iteration on integers; converges in <= 256 steps.
    let mut result = scaled;
    let mut candidate = (scaled >> 1) + U256::from(1u64);
    while candidate < result {
        result = candidate;
        candidate = (scaled / candidate + candidate) >> 1;
    }
    Ok(result)
}

/// Convert WAD (18 decimals) to f64.
/// Use only for display/logging, not for computation.
#[inline(always)]
pub fn wad_to_f64(wad: U256) -> f64 {
    if wad <= U256::from(u128::MAX) {
        let value: u128 = wad.to();
        value as f64 / 1e18
    } else {
        let limbs = wad.as_limbs();
        let high = limbs[1] as f64 * (u64::MAX as f64 + 1.0);
        let low = limbs[0] as f64;
        (high + low) / 1e18
    }
}

/// Convert f64 to WAD (18 decimals).
/// Use for converting scenario/config input, not for internal math.
#[inline(always)]
pub fn f64_to_wad(value: f64) -> U256 {
    if value <= 0.0 {
        return U256::ZERO;
    }
    U256::from((value * 1e18) as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wad(n: u64) -> U256 {
        U256::from(n) * WAD
    }

    #[test]
    fn test_constants() {
        assert_eq!(WAD, pow10(18));
        assert_eq!(NICR_PRECISION, pow10(20));
        assert_eq!(SCALE_FACTOR, pow10(9));
        assert_eq!(HALF_WAD * U256::from(2u64), WAD);
    }

    #[test]
    fn test_bps_to_wad() {
        // 11000 bps = 110% = 1.1e18
        assert_eq!(bps_to_wad(11000), U256::from(1_100_000_000_000_000_000u64));
        // 15000 bps = 150% = 1.5e18
        assert_eq!(bps_to_wad(15000), U256::from(1_500_000_000_000_000_000u64));
        assert_eq!(bps_to_wad(10000), WAD);
        assert_eq!(bps_to_wad(0), U256::ZERO);
    }

    #[test]
    fn test_wad_mul_truncates() {
        // 1.5 * 2.5 = 3.75
        let a = U256::from(1_500_000_000_000_000_000u64);
        let b = U256::from(2_500_000_000_000_000_000u64);
        assert_eq!(wad_mul(a, b).unwrap(), U256::from(3_750_000_000_000_000_000u64));

        // smallest representable product truncates to zero: 1e-18 * 1e-18
        assert_eq!(wad_mul(U256::from(1u64), U256::from(1u64)).unwrap(), U256::ZERO);
    }

    #[test]
    fn test_wad_mul_overflow() {
        assert_eq!(wad_mul(U256::MAX, U256::from(2u64)), Err(LedgerError::Overflow));
    }

    #[test]
    fn test_wad_div() {
        // 3 / 2 = 1.5
        assert_eq!(
            wad_div(wad(3), wad(2)).unwrap(),
            U256::from(1_500_000_000_000_000_000u64)
        );
        assert_eq!(wad_div(wad(1), U256::ZERO), Err(LedgerError::DivisionByZero));
    }

    #[test]
    fn test_mul_div() {
        let r = mul_div(wad(10), wad(30), wad(20)).unwrap();
        assert_eq!(r, wad(15));
        assert_eq!(
            mul_div(wad(1), wad(1), U256::ZERO),
            Err(LedgerError::DivisionByZero)
        );
    }

    #[test]
    fn test_compute_cr() {
        // 10 collateral at price 1000 against 15000 debt -> ICR = 0.666..e18
        let icr = compute_cr(wad(10), wad(1000), wad(15000)).unwrap();
        assert_eq!(icr, U256::from(666_666_666_666_666_666u64));

        // 10 collateral at price 1000 against 5000 debt -> ICR = 2.0e18
        let icr = compute_cr(wad(10), wad(1000), wad(5000)).unwrap();
        assert_eq!(icr, wad(2));
    }

    #[test]
    fn test_compute_cr_zero_debt_sentinel() {
        assert_eq!(compute_cr(wad(10), wad(1000), U256::ZERO).unwrap(), U256::MAX);
        assert_eq!(compute_nominal_cr(wad(10), U256::ZERO).unwrap(), U256::MAX);
    }

    #[test]
    fn test_compute_nominal_cr() {
        // 10 collateral / 5000 debt -> 0.002 * 1e20 = 2e17
        let nicr = compute_nominal_cr(wad(10), wad(5000)).unwrap();
        assert_eq!(nicr, U256::from(200_000_000_000_000_000u64));
    }

    #[test]
    fn test_dec_pow() {
        assert_eq!(dec_pow(wad(2), 0).unwrap(), WAD);
        assert_eq!(dec_pow(wad(2), 1).unwrap(), wad(2));
        assert_eq!(dec_pow(wad(2), 10).unwrap(), wad(1024));

        // 0.9^2 = 0.81 exactly
        let nine_tenths = U256::from(900_000_000_000_000_000u64);
        assert_eq!(
            dec_pow(nine_tenths, 2).unwrap(),
            U256::from(810_000_000_000_000_000u64)
        );
    }

    #[test]
    fn test_wad_sqrt() {
        assert_eq!(wad_sqrt(U256::ZERO).unwrap(), U256::ZERO);
        assert_eq!(wad_sqrt(wad(4)).unwrap(), wad(2));
        assert_eq!(wad_sqrt(WAD).unwrap(), WAD);
        // floor(sqrt(2) * 1e18) = 1414213562373095048
        assert_eq!(
            wad_sqrt(wad(2)).unwrap(),
            U256::from(1_414_213_562_373_095_048u64)
        );
    }

    #[test]
    fn test_wad_f64_round_trip() {
        let wad_val = wad(1000);
        let f = wad_to_f64(wad_val);
        assert!((f - 1000.0).abs() < 0.001);
        assert_eq!(f64_to_wad(1000.0), wad_val);
        assert_eq!(f64_to_wad(-1.0), U256::ZERO);
    }

    #[test]
    fn test_pow10_lookup() {
        assert_eq!(pow10(0), U256::from(1u64));
        assert_eq!(pow10(6), U256::from(1_000_000u64));
        assert_eq!(pow10(18), U256::from(1_000_000_000_000_000_000u64));
    }
}
