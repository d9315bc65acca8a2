//! Per-member access control

use crate::RemotingError;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{Arc, LazyLock};

/// Decides whether a member of a leased object may be used.
///
/// Returning a policy rather than a flag lets a policy narrow what may be
/// done with objects reached through the member.
pub trait AccessPolicy: Send + Sync + Debug {
    /// Policy for `member`, or [`RemotingError::AccessDenied`]
    fn access_policy(&self, member: &str) -> Result<Arc<dyn AccessPolicy>, RemotingError>;
}

static ALLOWED: LazyLock<Arc<dyn AccessPolicy>> = LazyLock::new(|| Arc::new(Allowed));
static DENIED: LazyLock<Arc<dyn AccessPolicy>> = LazyLock::new(|| Arc::new(Denied));

/// Permits every member
#[derive(Debug, Clone, Copy, Default)]
pub struct Allowed;

impl Allowed {
    /// Shared instance
    pub fn shared() -> Arc<dyn AccessPolicy> {
        Arc::clone(&ALLOWED)
    }
}

impl AccessPolicy for Allowed {
    fn access_policy(&self, _member: &str) -> Result<Arc<dyn AccessPolicy>, RemotingError> {
        Ok(Self::shared())
    }
}

/// Refuses every member
#[derive(Debug, Clone, Copy, Default)]
pub struct Denied;

impl Denied {
    /// Shared instance
    pub fn shared() -> Arc<dyn AccessPolicy> {
        Arc::clone(&DENIED)
    }
}

impl AccessPolicy for Denied {
    fn access_policy(&self, member: &str) -> Result<Arc<dyn AccessPolicy>, RemotingError> {
        Err(RemotingError::AccessDenied(member.to_string()))
    }
}

/// Permits only the listed members.
///
/// Objects returned from a permitted member get `inner`.
#[derive(Debug, Clone)]
pub struct AllowList {
    members: HashSet<String>,
    inner: Arc<dyn AccessPolicy>,
}

impl AllowList {
    /// Permit the given members, objects reached through them are unrestricted
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
            inner: Allowed::shared(),
        }
    }

    /// Policy applied to objects returned from permitted members
    pub fn returning(mut self, inner: Arc<dyn AccessPolicy>) -> Self {
        self.inner = inner;
        self
    }
}

impl AccessPolicy for AllowList {
    fn access_policy(&self, member: &str) -> Result<Arc<dyn AccessPolicy>, RemotingError> {
        if self.members.contains(member) {
            Ok(Arc::clone(&self.inner))
        } else {
            Err(RemotingError::AccessDenied(member.to_string()))
        }
    }
}
