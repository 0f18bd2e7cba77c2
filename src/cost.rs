//! Pure cost model
//!
//! Shared by the assigner (marginal-cost placement) and by baseline
//! computation, so a device's "stay on the current plan" cost and its
//! candidate pool costs are always priced by the same arithmetic.
//!
//! Overage is `max(0, usage - included) / data_per_overage_charge *
//! overage_rate_per_unit`. Pooled plans apply this to the pool's cumulative
//! usage against the shared allowance; non-pooling plans apply it per device.

use crate::types::RatePlan;
use serde::{Deserialize, Serialize};

/// Reference month length used to scale prorated rate charges
const PRORATION_BASE_DAYS: f64 = 30.0;

/// Which cost terms to include
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeType {
    /// Fixed monthly rate only, no overage term
    RateChargeOnly,
    /// Overage term only (incremental / partial-period evaluation)
    OverageOnly,
    /// Monthly rate plus overage
    RateChargeAndOverage,
}

/// Rate-term scaling for partial billing windows
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum Proration {
    /// Full monthly rate
    #[default]
    None,
    /// Scale the rate term by `days / 30.0`
    Days(u32),
}

impl Proration {
    fn factor(&self) -> f64 {
        match self {
            Proration::None => 1.0,
            Proration::Days(days) => *days as f64 / PRORATION_BASE_DAYS,
        }
    }
}

/// Overage charge for `usage_mb` against a plan's allowance.
///
/// Plans that failed eligibility never reach this point, but a zero
/// `data_per_overage_charge` still yields 0.0 rather than a division blowup.
pub fn overage_cost(plan: &RatePlan, usage_mb: f64) -> f64 {
    let excess = (usage_mb - plan.included_data_mb).max(0.0);
    if excess <= 0.0 || plan.data_per_overage_charge <= 0.0 {
        return 0.0;
    }
    excess / plan.data_per_overage_charge * plan.overage_rate_per_unit
}

/// Cost of `usage_mb` on `plan` under the requested charge type and proration
pub fn plan_cost(plan: &RatePlan, usage_mb: f64, charge: ChargeType, proration: Proration) -> f64 {
    let rate_term = plan.monthly_rate * proration.factor();
    match charge {
        ChargeType::RateChargeOnly => rate_term,
        ChargeType::OverageOnly => overage_cost(plan, usage_mb),
        ChargeType::RateChargeAndOverage => rate_term + overage_cost(plan, usage_mb),
    }
}

/// Sum of per-device baseline costs (the cost of changing nothing)
pub fn baseline_total(devices: &[crate::types::Device]) -> f64 {
    devices.iter().map(|d| d.baseline_cost).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Device;

    fn plan() -> RatePlan {
        // $20/mo, 1000 MB included, $0.10 per 10 MB of overage
        RatePlan::new(1, 1, 20.0, 1000.0).with_overage(0.10, 10.0)
    }

    #[test]
    fn test_no_overage_under_allowance() {
        assert_eq!(overage_cost(&plan(), 800.0), 0.0);
        assert_eq!(overage_cost(&plan(), 1000.0), 0.0);
    }

    #[test]
    fn test_overage_proportional_to_excess() {
        // 1005 MB: 5 MB excess / 10 MB per charge → 0.5 units → $0.05
        assert!((overage_cost(&plan(), 1005.0) - 0.05).abs() < 1e-9);
        // 1100 MB: 100 MB excess → 10 units → $1.00
        assert!((overage_cost(&plan(), 1100.0) - 1.00).abs() < 1e-9);
    }

    #[test]
    fn test_charge_type_selection() {
        let p = plan();
        let usage = 1100.0;

        let rate_only = plan_cost(&p, usage, ChargeType::RateChargeOnly, Proration::None);
        let overage_only = plan_cost(&p, usage, ChargeType::OverageOnly, Proration::None);
        let both = plan_cost(&p, usage, ChargeType::RateChargeAndOverage, Proration::None);

        assert!((rate_only - 20.0).abs() < 1e-9);
        assert!((overage_only - 1.0).abs() < 1e-9);
        assert!((both - 21.0).abs() < 1e-9);
    }

    #[test]
    fn test_proration_scales_rate_term_only() {
        let p = plan();
        // 15 days of a 30-day base → half the monthly rate, full overage
        let cost = plan_cost(&p, 1100.0, ChargeType::RateChargeAndOverage, Proration::Days(15));
        assert!((cost - (10.0 + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_baseline_total() {
        let devices = vec![
            Device::new(1, 100.0, 1).with_baseline(21.0),
            Device::new(2, 200.0, 1).with_baseline(19.5),
        ];
        assert!((baseline_total(&devices) - 40.5).abs() < 1e-9);
    }
}
