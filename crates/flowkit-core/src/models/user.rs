use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BillingInterval, Plan, SubscriptionStatus};

/// User row with the billing snapshot the orchestration core reads.
///
/// `credits_remaining` is the only column mutated by concurrent runs; every
/// write goes through an atomic conditional decrement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub plan: Plan,
    pub credits_remaining: i64,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_subscription_status: Option<SubscriptionStatus>,
    pub stripe_billing_interval: Option<BillingInterval>,
    pub stripe_current_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// True when the user is on a paid plan with an active or trialing
    /// subscription — the precondition for billing-cycle rollover.
    pub fn has_entitled_subscription(&self) -> bool {
        self.plan.is_paid()
            && self
                .stripe_subscription_status
                .map(|s| s.is_entitled())
                .unwrap_or(false)
    }
}
