use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::model::{Actor, ActorRole};
use crate::observability;

/// Shared-password auth. The login name carries the caller's identity as
/// `role:ulid`; anything else is turned away before the password check.
#[derive(Debug)]
pub struct RoomwiseAuthSource {
    password: String,
}

impl RoomwiseAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for RoomwiseAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        actor_for_login(login.user())?;
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Resolve the acting user from a startup login name.
pub fn actor_for_login(user: Option<&str>) -> PgWireResult<Actor> {
    match user.and_then(Actor::from_login) {
        Some(actor) if actor.role != ActorRole::System => Ok(actor),
        _ => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!(
                    "login must look like member:<ulid>, staff:<ulid> or admin:<ulid>, got {:?}",
                    user.unwrap_or_default()
                ),
            ))))
        }
    }
}
