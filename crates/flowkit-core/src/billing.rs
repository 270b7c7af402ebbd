//! Credit accounting: token-usage pricing and billing-cycle rollover.
//!
//! Credits are integer units. Provider cost is computed in cents from
//! per-million-token pricing, inflated by the platform markup, converted to
//! credits, and ceiling-rounded so fractional credits are never under-charged.

use chrono::{DateTime, Months, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::constants::CATCH_UP_ITERATION_CAP;
use crate::error::AppError;
use crate::models::User;

/// Percentage surcharge applied to underlying provider cost.
pub const MARKUP_PERCENT: i64 = 20;

/// Conversion ratio from marked-up cents to credit units.
pub const CENTS_PER_CREDIT: i64 = 1;

/// Listed per-token cost of a model, in cents per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_cents_per_mtok: i64,
    pub output_cents_per_mtok: i64,
}

/// Pricing catalog. A step referencing a model absent from this table fails
/// with a configuration error before any tokens are spent.
pub fn pricing_for(model: &str) -> Option<ModelPricing> {
    let (input, output) = match model {
        "gpt-4o" => (250, 1000),
        "gpt-4o-mini" => (15, 60),
        "claude-sonnet-4" => (300, 1500),
        "claude-haiku-3.5" => (80, 400),
        _ => return None,
    };
    Some(ModelPricing {
        input_cents_per_mtok: input,
        output_cents_per_mtok: output,
    })
}

/// Convert provider-reported token usage into credits, markup included,
/// rounded up.
pub fn cost_credits(tokens_in: u64, tokens_out: u64, pricing: &ModelPricing) -> i64 {
    let mtok = Decimal::from(1_000_000u64);
    let raw_cents = Decimal::from(tokens_in) * Decimal::from(pricing.input_cents_per_mtok) / mtok
        + Decimal::from(tokens_out) * Decimal::from(pricing.output_cents_per_mtok) / mtok;
    let marked_up = raw_cents * Decimal::from(100 + MARKUP_PERCENT) / Decimal::from(100);
    let credits = (marked_up / Decimal::from(CENTS_PER_CREDIT)).ceil();
    credits.to_i64().unwrap_or(i64::MAX)
}

/// Result of a billing-cycle rollover: the reset balance and the advanced
/// period end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleRollover {
    pub credits_remaining: i64,
    pub period_end: DateTime<Utc>,
}

/// Compute the billing-cycle rollover for a user, if one is due.
///
/// A user on a paid plan with an active or trialing subscription whose stored
/// period end has passed gets their balance reset to the plan allotment and
/// the period end advanced by whole billing intervals until it is back in the
/// future — several intervals at once when reads were stale for a long time.
/// Free-plan and non-subscribed users are untouched. Pure: persisting the
/// rollover (exactly once, under a conditional update) is the caller's job.
pub fn roll_billing_cycle(user: &User, now: DateTime<Utc>) -> Result<Option<CycleRollover>, AppError> {
    if !user.has_entitled_subscription() {
        return Ok(None);
    }
    let (Some(interval), Some(mut period_end)) =
        (user.stripe_billing_interval, user.stripe_current_period_end)
    else {
        return Ok(None);
    };
    if period_end > now {
        return Ok(None);
    }

    let mut iterations = 0u32;
    while period_end <= now {
        iterations += 1;
        if iterations >= CATCH_UP_ITERATION_CAP {
            return Err(AppError::Configuration(format!(
                "billing cycle catch-up exceeded {} iterations for user {}",
                CATCH_UP_ITERATION_CAP, user.id
            )));
        }
        period_end = period_end
            .checked_add_months(Months::new(interval.months()))
            .ok_or_else(|| {
                AppError::Configuration("billing period end overflows calendar range".to_string())
            })?;
    }

    Ok(Some(CycleRollover {
        credits_remaining: user.plan.monthly_credits(),
        period_end,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingInterval, Plan, SubscriptionStatus};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn user(plan: Plan, status: Option<SubscriptionStatus>, period_end: Option<DateTime<Utc>>) -> User {
        User {
            id: Uuid::new_v4(),
            email: "dev@example.com".into(),
            name: None,
            plan,
            credits_remaining: 42,
            stripe_customer_id: Some("cus_123".into()),
            stripe_subscription_id: Some("sub_123".into()),
            stripe_subscription_status: status,
            stripe_billing_interval: Some(BillingInterval::Month),
            stripe_current_period_end: period_end,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn tiny_usage_rounds_up_to_one_credit() {
        let pricing = pricing_for("gpt-4o-mini").unwrap();
        assert_eq!(cost_credits(1_000, 500, &pricing), 1);
    }

    #[test]
    fn exact_cents_need_no_rounding() {
        // 2M in + 1M out on gpt-4o: 1500 cents, +20% markup = 1800 credits.
        let pricing = pricing_for("gpt-4o").unwrap();
        assert_eq!(cost_credits(2_000_000, 1_000_000, &pricing), 1800);
    }

    #[test]
    fn fractional_cost_ceils() {
        // 333_333 input tokens on gpt-4o: 83.33325 cents, ×1.2 = 99.9999 → 100.
        let pricing = pricing_for("gpt-4o").unwrap();
        assert_eq!(cost_credits(333_333, 0, &pricing), 100);
    }

    #[test]
    fn zero_usage_is_free() {
        let pricing = pricing_for("gpt-4o").unwrap();
        assert_eq!(cost_credits(0, 0, &pricing), 0);
    }

    #[test]
    fn unknown_model_has_no_pricing() {
        assert!(pricing_for("gpt-imaginary").is_none());
    }

    #[test]
    fn rollover_advances_past_missed_cycles() {
        // Period end 40 days stale on a monthly plan: two intervals advance.
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let period_end = Utc.with_ymd_and_hms(2024, 2, 4, 12, 0, 0).unwrap();
        let user = user(Plan::Pro, Some(SubscriptionStatus::Active), Some(period_end));

        let rollover = roll_billing_cycle(&user, now).unwrap().unwrap();
        assert_eq!(
            rollover.period_end,
            Utc.with_ymd_and_hms(2024, 4, 4, 12, 0, 0).unwrap()
        );
        assert_eq!(rollover.credits_remaining, Plan::Pro.monthly_credits());
    }

    #[test]
    fn rollover_skips_free_plan() {
        let now = Utc::now();
        let stale = now - chrono::Duration::days(90);
        let user = user(Plan::Free, Some(SubscriptionStatus::Active), Some(stale));
        assert!(roll_billing_cycle(&user, now).unwrap().is_none());
    }

    #[test]
    fn rollover_skips_lapsed_subscription() {
        let now = Utc::now();
        let stale = now - chrono::Duration::days(10);
        let user = user(Plan::Pro, Some(SubscriptionStatus::Canceled), Some(stale));
        assert!(roll_billing_cycle(&user, now).unwrap().is_none());
    }

    #[test]
    fn rollover_not_due_when_period_end_in_future() {
        let now = Utc::now();
        let future = now + chrono::Duration::days(3);
        let user = user(Plan::Pro, Some(SubscriptionStatus::Trialing), Some(future));
        assert!(roll_billing_cycle(&user, now).unwrap().is_none());
    }

    #[test]
    fn yearly_interval_advances_by_year() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let period_end = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
        let mut user = user(Plan::Scale, Some(SubscriptionStatus::Active), Some(period_end));
        user.stripe_billing_interval = Some(BillingInterval::Year);

        let rollover = roll_billing_cycle(&user, now).unwrap().unwrap();
        assert_eq!(
            rollover.period_end,
            Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap()
        );
    }
}
