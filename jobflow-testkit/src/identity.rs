use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jobflow::*;
use parking_lot::RwLock;

/// Identity directory backed by fixed maps.
///
/// A permissive directory resolves any organization and user it does not
/// know by synthesizing one.
#[derive(Clone, Debug, Default)]
pub struct StaticIdentityDirectory {
    organizations: Arc<RwLock<HashMap<String, Organization>>>,
    users: Arc<RwLock<HashMap<(String, String), User>>>,
    permissive: bool,
}

impl StaticIdentityDirectory {
    /// Directory resolving only what was added to it.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::default()
        }
    }

    pub fn with_organization(self, organization: Organization) -> Self {
        self.organizations
            .write()
            .insert(organization.id.clone(), organization);
        self
    }

    pub fn with_user(self, user: User) -> Self {
        self.users
            .write()
            .insert((user.username.clone(), user.organization.clone()), user);
        self
    }
}

#[async_trait]
impl IdentityDirectory for StaticIdentityDirectory {
    async fn get_organization(&self, id: &str) -> Result<Organization, IdentityError> {
        if let Some(org) = self.organizations.read().get(id) {
            return Ok(org.clone());
        }
        if self.permissive {
            return Ok(Organization::new(id, id));
        }
        Err(IdentityError::OrganizationNotFound(id.to_string()))
    }

    async fn load_user(&self, username: &str, organization: &str) -> Result<User, IdentityError> {
        let key = (username.to_string(), organization.to_string());
        if let Some(user) = self.users.read().get(&key) {
            return Ok(user.clone());
        }
        if self.permissive {
            return Ok(User::new(username, organization));
        }
        Err(IdentityError::UserNotFound {
            user: username.to_string(),
            organization: organization.to_string(),
        })
    }
}
