use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// One shared cleartext password for every client; user names are not checked.
#[derive(Debug)]
pub struct FleetbookAuthSource {
    password: Vec<u8>,
}

impl FleetbookAuthSource {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into().into_bytes(),
        }
    }
}

#[async_trait]
impl AuthSource for FleetbookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.clone()))
    }
}
