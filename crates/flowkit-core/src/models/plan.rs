use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Subscription plan type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "text", rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Scale,
}

impl Plan {
    /// Credit allotment granted per billing cycle (or once, for free users).
    pub fn monthly_credits(&self) -> i64 {
        match self {
            Plan::Free => 500,
            Plan::Pro => 10_000,
            Plan::Scale => 50_000,
        }
    }

    /// Paid plans get their balance reset on billing-cycle rollover; the free
    /// plan is a one-time allotment with no recurring top-up.
    pub fn is_paid(&self) -> bool {
        !matches!(self, Plan::Free)
    }
}

impl Display for Plan {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Plan::Free => write!(f, "free"),
            Plan::Pro => write!(f, "pro"),
            Plan::Scale => write!(f, "scale"),
        }
    }
}

impl FromStr for Plan {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Plan::Free),
            "pro" => Ok(Plan::Pro),
            "scale" => Ok(Plan::Scale),
            _ => Err(anyhow::anyhow!("Invalid plan: {}", s)),
        }
    }
}

/// Subscription status, mirroring the values Stripe reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "text", rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
}

impl SubscriptionStatus {
    /// Statuses under which the subscription entitles the user to recurring
    /// credit top-ups.
    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

/// Stripe billing interval
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "text", rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn months(&self) -> u32 {
        match self {
            BillingInterval::Month => 1,
            BillingInterval::Year => 12,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_round_trip() {
        for plan in [Plan::Free, Plan::Pro, Plan::Scale] {
            assert_eq!(plan.to_string().parse::<Plan>().unwrap(), plan);
        }
        assert!("platinum".parse::<Plan>().is_err());
    }

    #[test]
    fn entitlement() {
        assert!(SubscriptionStatus::Active.is_entitled());
        assert!(SubscriptionStatus::Trialing.is_entitled());
        assert!(!SubscriptionStatus::PastDue.is_entitled());
        assert!(!SubscriptionStatus::Canceled.is_entitled());
    }
}
