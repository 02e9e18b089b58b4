use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Credentials accepted at startup. The admin user has its own password;
/// every other login name shares the user password and becomes the session's
/// user id.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_password: String,
    pub admin_user: String,
    pub admin_password: String,
}

impl Credentials {
    pub fn is_admin(&self, user: &str) -> bool {
        user == self.admin_user
    }

    pub fn password_for(&self, user: Option<&str>) -> &str {
        match user {
            Some(u) if self.is_admin(u) => &self.admin_password,
            _ => &self.user_password,
        }
    }
}

#[derive(Debug)]
pub struct ParkdAuthSource {
    credentials: Credentials,
}

impl ParkdAuthSource {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for ParkdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let password = self.credentials.password_for(login.user());
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}
