use versa_core::Resource;

use crate::error::EngineError;

/// The caller a bundle is executed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Authorization decisions. Each method returns the reason access is granted,
/// or `None` to deny.
pub trait AccessRules: Send + Sync {
    fn reason_create_allowed(&self, user: &User, resource: &Resource) -> Option<String>;

    fn reason_read_allowed(&self, user: &User, resource: &Resource) -> Option<String>;

    fn reason_update_allowed(&self, user: &User, old: &Resource, new: &Resource) -> Option<String>;

    fn reason_delete_allowed(&self, user: &User, old: &Resource) -> Option<String>;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessRules for AllowAll {
    fn reason_create_allowed(&self, _user: &User, _resource: &Resource) -> Option<String> {
        Some("allowed for all users".into())
    }

    fn reason_read_allowed(&self, _user: &User, _resource: &Resource) -> Option<String> {
        Some("allowed for all users".into())
    }

    fn reason_update_allowed(&self, _user: &User, _old: &Resource, _new: &Resource) -> Option<String> {
        Some("allowed for all users".into())
    }

    fn reason_delete_allowed(&self, _user: &User, _old: &Resource) -> Option<String> {
        Some("allowed for all users".into())
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Access {
    Create,
    Read,
    Update,
    Delete,
}

impl Access {
    fn verb(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Turns a denial into `Forbidden`.
pub(crate) fn require(
    reason: Option<String>,
    access: Access,
    user: &User,
    resource: &Resource,
) -> Result<(), EngineError> {
    match reason {
        Some(reason) => {
            tracing::debug!(
                target: "versa::command",
                user = %user.name,
                resource_type = %resource.resource_type,
                access = access.verb(),
                reason = %reason,
                "access granted"
            );
            Ok(())
        }
        None => Err(EngineError::Forbidden(format!(
            "{} of {} not allowed for user {}",
            access.verb(),
            resource.resource_type,
            user.name
        ))),
    }
}
