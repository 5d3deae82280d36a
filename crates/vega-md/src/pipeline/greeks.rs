//! Black-Scholes reference implementation of [`GreeksCalculator`].
//!
//! Implied volatility is solved with Newton-Raphson on vega, falling back to
//! bisection when the Newton step leaves the search bracket or vega
//! vanishes. Theta is per calendar day, vega per volatility point.

use std::f64::consts::{PI, SQRT_2};

use vega_core::ports::{GreeksCalculator, GreeksError, GreeksInput};
use vega_core::time_util;
use vega_core::types::{Greeks, OptionKind};

const MIN_VOL: f64 = 1e-4;
const MAX_VOL: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct BlackScholes {
    /// Annualized, continuously compounded.
    pub risk_free_rate: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
}

impl BlackScholes {
    pub fn new(risk_free_rate: f64) -> Self {
        Self {
            risk_free_rate,
            tolerance: 1e-6,
            max_iterations: 100,
        }
    }
}

fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + libm::erf(x / SQRT_2))
}

fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
}

fn d1_d2(spot: f64, strike: f64, t: f64, r: f64, vol: f64) -> (f64, f64) {
    let sqrt_t = t.sqrt();
    let d1 = ((spot / strike).ln() + (r + 0.5 * vol * vol) * t) / (vol * sqrt_t);
    (d1, d1 - vol * sqrt_t)
}

/// Theoretical price.
pub fn price(kind: OptionKind, spot: f64, strike: f64, t: f64, r: f64, vol: f64) -> f64 {
    let (d1, d2) = d1_d2(spot, strike, t, r, vol);
    let df = (-r * t).exp();
    match kind {
        OptionKind::Call => spot * norm_cdf(d1) - strike * df * norm_cdf(d2),
        OptionKind::Put => strike * df * norm_cdf(-d2) - spot * norm_cdf(-d1),
    }
}

fn raw_vega(spot: f64, strike: f64, t: f64, r: f64, vol: f64) -> f64 {
    let (d1, _) = d1_d2(spot, strike, t, r, vol);
    spot * norm_pdf(d1) * t.sqrt()
}

impl BlackScholes {
    fn implied_vol(
        &self,
        kind: OptionKind,
        target: f64,
        spot: f64,
        strike: f64,
        t: f64,
    ) -> Result<f64, GreeksError> {
        let r = self.risk_free_rate;
        let df = (-r * t).exp();
        let (lower, upper) = match kind {
            OptionKind::Call => ((spot - strike * df).max(0.0), spot),
            OptionKind::Put => ((strike * df - spot).max(0.0), strike * df),
        };
        if target < lower - self.tolerance || target >= upper {
            return Err(GreeksError::NoSolution { price: target });
        }

        // Brenner-Subrahmanyam seed.
        let mut vol = ((2.0 * PI / t).sqrt() * target / spot).clamp(0.05, 3.0);
        for _ in 0..self.max_iterations {
            let diff = price(kind, spot, strike, t, r, vol) - target;
            if diff.abs() < self.tolerance {
                return Ok(vol);
            }
            let vega = raw_vega(spot, strike, t, r, vol);
            if vega < 1e-10 {
                break;
            }
            let next = vol - diff / vega;
            if !(MIN_VOL..=MAX_VOL).contains(&next) {
                break;
            }
            vol = next;
        }
        self.bisect(kind, target, spot, strike, t)
    }

    fn bisect(
        &self,
        kind: OptionKind,
        target: f64,
        spot: f64,
        strike: f64,
        t: f64,
    ) -> Result<f64, GreeksError> {
        let r = self.risk_free_rate;
        let (mut lo, mut hi) = (MIN_VOL, MAX_VOL);
        let f = |v: f64| price(kind, spot, strike, t, r, v) - target;
        if f(lo) > self.tolerance || f(hi) < -self.tolerance {
            return Err(GreeksError::NoSolution { price: target });
        }
        let iterations = self.max_iterations * 2;
        for _ in 0..iterations {
            let mid = 0.5 * (lo + hi);
            let diff = f(mid);
            if diff.abs() < self.tolerance || hi - lo < 1e-12 {
                return Ok(mid);
            }
            if diff > 0.0 {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        Err(GreeksError::NoConvergence { iterations })
    }
}

impl GreeksCalculator for BlackScholes {
    fn compute(&self, input: &GreeksInput) -> Result<Greeks, GreeksError> {
        let GreeksInput {
            market_price,
            spot,
            strike,
            expiry,
            valuation_time,
            kind,
        } = *input;
        if !(market_price.is_finite() && market_price > 0.0) {
            return Err(GreeksError::InvalidInput(format!("market price {market_price}")));
        }
        if !(spot.is_finite() && spot > 0.0) {
            return Err(GreeksError::InvalidInput(format!("spot {spot}")));
        }
        if !(strike.is_finite() && strike > 0.0) {
            return Err(GreeksError::InvalidInput(format!("strike {strike}")));
        }
        let t = time_util::year_fraction(valuation_time, expiry);
        if t <= 0.0 {
            return Err(GreeksError::Expired);
        }

        let r = self.risk_free_rate;
        let iv = self.implied_vol(kind, market_price, spot, strike, t)?;
        let (d1, d2) = d1_d2(spot, strike, t, r, iv);
        let sqrt_t = t.sqrt();
        let df = (-r * t).exp();
        let pdf = norm_pdf(d1);

        let delta = match kind {
            OptionKind::Call => norm_cdf(d1),
            OptionKind::Put => norm_cdf(d1) - 1.0,
        };
        let gamma = pdf / (spot * iv * sqrt_t);
        let decay = -spot * pdf * iv / (2.0 * sqrt_t);
        let theta_year = match kind {
            OptionKind::Call => decay - r * strike * df * norm_cdf(d2),
            OptionKind::Put => decay + r * strike * df * norm_cdf(-d2),
        };

        Ok(Greeks {
            iv,
            delta,
            gamma,
            theta: theta_year / 365.0,
            vega: spot * pdf * sqrt_t / 100.0,
        })
    }
}
