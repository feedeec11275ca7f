use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};

use crate::model::Actor;

/// Login name that maps to `Actor::Anonymous`.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Cleartext password lookup: the shared anonymous password plus one entry
/// per configured account. Cloned into every connection.
#[derive(Debug, Clone)]
pub struct AccountAuthSource {
    anonymous_password: Arc<str>,
    accounts: Arc<HashMap<String, String>>,
}

impl AccountAuthSource {
    pub fn new(anonymous_password: String, accounts: HashMap<String, String>) -> Self {
        Self {
            anonymous_password: anonymous_password.into(),
            accounts: Arc::new(accounts),
        }
    }

    fn password_for(&self, user: &str) -> Option<&str> {
        if user == ANONYMOUS_USER {
            Some(&*self.anonymous_password)
        } else {
            self.accounts.get(user).map(String::as_str)
        }
    }
}

#[async_trait]
impl AuthSource for AccountAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        match self.password_for(user) {
            Some(pw) => Ok(Password::new(None, pw.as_bytes().to_vec())),
            None => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                tracing::debug!("login refused for unknown user {user:?}");
                Err(PgWireError::InvalidPassword(user.to_string()))
            }
        }
    }
}

/// Map an authenticated login name to the actor it acts as.
pub fn actor_for(user: Option<&str>) -> Actor {
    match user {
        None | Some(ANONYMOUS_USER) | Some("") => Actor::Anonymous,
        Some(account) => Actor::Authenticated(account.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> AccountAuthSource {
        let accounts = HashMap::from([("alice".to_string(), "wonderland".to_string())]);
        AccountAuthSource::new("guest".into(), accounts)
    }

    #[test]
    fn looks_up_accounts_and_anonymous() {
        let src = source();
        assert_eq!(src.password_for("alice"), Some("wonderland"));
        assert_eq!(src.password_for(ANONYMOUS_USER), Some("guest"));
        assert_eq!(src.password_for("mallory"), None);
    }

    #[test]
    fn login_name_to_actor() {
        assert_eq!(actor_for(Some("alice")), Actor::Authenticated("alice".into()));
        assert_eq!(actor_for(Some(ANONYMOUS_USER)), Actor::Anonymous);
        assert_eq!(actor_for(None), Actor::Anonymous);
    }
}
