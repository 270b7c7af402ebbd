use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use flowkit_core::billing::CycleRollover;
use flowkit_core::models::{BillingInterval, Plan, SubscriptionStatus, User};

const USER_COLUMNS: &str = r#"
    id,
    email,
    name,
    plan,
    credits_remaining,
    stripe_customer_id,
    stripe_subscription_id,
    stripe_subscription_status,
    stripe_billing_interval,
    stripe_current_period_end,
    created_at,
    updated_at
"#;

#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self))]
    pub async fn create(&self, email: &str, name: Option<&str>, plan: Plan) -> Result<User> {
        let user: User = sqlx::query_as::<Postgres, User>(&format!(
            r#"
            INSERT INTO users (email, name, plan, credits_remaining)
            VALUES ($1, $2, $3, $4)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(email)
        .bind(name)
        .bind(plan)
        .bind(plan.monthly_credits())
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert user")?;

        tracing::info!(user_id = %user.id, plan = %plan, "User created");
        Ok(user)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, user_id: Uuid) -> Result<Option<User>> {
        let user: Option<User> = sqlx::query_as::<Postgres, User>(&format!(
            r#"
            SELECT {USER_COLUMNS}
            FROM users
            WHERE id = $1
            "#
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user")?;

        Ok(user)
    }

    /// Overwrite the Stripe snapshot, as the checkout/webhook collaborator
    /// reports it.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip(self))]
    pub async fn update_subscription(
        &self,
        user_id: Uuid,
        plan: Plan,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
        status: Option<SubscriptionStatus>,
        interval: Option<BillingInterval>,
        current_period_end: Option<DateTime<Utc>>,
        credits_remaining: i64,
    ) -> Result<Option<User>> {
        let user: Option<User> = sqlx::query_as::<Postgres, User>(&format!(
            r#"
            UPDATE users
            SET plan = $2,
                stripe_customer_id = $3,
                stripe_subscription_id = $4,
                stripe_subscription_status = $5,
                stripe_billing_interval = $6,
                stripe_current_period_end = $7,
                credits_remaining = $8,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(plan)
        .bind(customer_id)
        .bind(subscription_id)
        .bind(status)
        .bind(interval)
        .bind(current_period_end)
        .bind(credits_remaining)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update subscription")?;

        Ok(user)
    }

    /// Atomic conditional decrement of the credit balance. Fails — does not
    /// saturate — when the balance is insufficient, so two simultaneously
    /// executing runs can never drive it negative.
    #[tracing::instrument(skip(self))]
    pub async fn try_debit_credits(&self, user_id: Uuid, amount: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET credits_remaining = credits_remaining - $2,
                updated_at = NOW()
            WHERE id = $1 AND credits_remaining >= $2
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await
        .context("Failed to debit credits")?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    pub async fn credits_remaining(&self, user_id: Uuid) -> Result<Option<i64>> {
        let credits: Option<i64> =
            sqlx::query_scalar::<Postgres, i64>("SELECT credits_remaining FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch credit balance")?;

        Ok(credits)
    }

    /// Load a user, lazily applying a billing-cycle rollover when one is due.
    ///
    /// The check runs on relevant reads rather than on a cron, tolerating
    /// staleness up to the next read. Losing the conditional update means
    /// another reader rolled the cycle first; the fresh snapshot is returned
    /// either way.
    #[tracing::instrument(skip(self))]
    pub async fn get_with_rollover(&self, user_id: Uuid) -> Result<Option<User>> {
        let Some(user) = self.get(user_id).await? else {
            return Ok(None);
        };

        match flowkit_core::billing::roll_billing_cycle(&user, Utc::now()) {
            Ok(None) => Ok(Some(user)),
            Ok(Some(rollover)) => {
                let previous = user
                    .stripe_current_period_end
                    .context("rollover computed without a stored period end")?;
                if !self.apply_cycle_rollover(user_id, previous, &rollover).await? {
                    tracing::debug!(user_id = %user_id, "Lost rollover race, re-reading");
                }
                self.get(user_id).await
            }
            Err(e) => {
                // A rollover that cannot be computed must not block reads.
                tracing::error!(user_id = %user_id, error = %e, "Billing cycle rollover failed");
                Ok(Some(user))
            }
        }
    }

    /// Persist a billing-cycle rollover, keyed on the period end that was
    /// read. Returns false when another reader rolled the cycle first; the
    /// caller re-reads and proceeds with the fresh snapshot.
    #[tracing::instrument(skip(self))]
    pub async fn apply_cycle_rollover(
        &self,
        user_id: Uuid,
        previous_period_end: DateTime<Utc>,
        rollover: &CycleRollover,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET credits_remaining = $3,
                stripe_current_period_end = $4,
                updated_at = NOW()
            WHERE id = $1 AND stripe_current_period_end = $2
            "#,
        )
        .bind(user_id)
        .bind(previous_period_end)
        .bind(rollover.credits_remaining)
        .bind(rollover.period_end)
        .execute(&self.pool)
        .await
        .context("Failed to apply billing cycle rollover")?;

        let applied = result.rows_affected() == 1;
        if applied {
            tracing::info!(
                user_id = %user_id,
                period_end = %rollover.period_end,
                credits = rollover.credits_remaining,
                "Billing cycle rolled over"
            );
        }
        Ok(applied)
    }
}
