use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

impl Organization {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub organization: String,
    pub roles: Vec<String>,
}

impl User {
    pub fn new(username: impl Into<String>, organization: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            organization: organization.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

/// Directory used to resolve the identity a job runs under.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn get_organization(&self, id: &str) -> Result<Organization, IdentityError>;

    /// Load `username` within `organization`.
    async fn load_user(&self, username: &str, organization: &str) -> Result<User, IdentityError>;
}
