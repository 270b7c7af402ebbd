//! Credit service: balance reads with lazy billing-cycle rollover.

use uuid::Uuid;

use flowkit_core::models::User;
use flowkit_core::AppError;
use flowkit_db::UserRepository;

#[derive(Clone)]
pub struct CreditService {
    users: UserRepository,
}

impl CreditService {
    pub fn new(users: UserRepository) -> Self {
        Self { users }
    }

    /// Current user snapshot. The read applies any due billing-cycle rollover
    /// first, so a stale period end is corrected exactly once before the
    /// balance is reported.
    pub async fn current_user(&self, user_id: Uuid) -> Result<User, AppError> {
        self.users
            .get_with_rollover(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".into()))
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<i64, AppError> {
        Ok(self.current_user(user_id).await?.credits_remaining)
    }
}
