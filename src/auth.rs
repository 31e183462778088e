//! Authorization interface consumed by the Session Hub, per spec §6.4.
//! Token issuance and the principal's identity itself are out of scope;
//! the core only consumes an already-validated principal id plus a
//! decision function.

use async_trait::async_trait;

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Injected authorization callback, checked once per inbound frame
/// (spec §4.4, "Authorization check-point").
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, principal: &str, action: &str, resource: Option<&str>) -> Decision;
}

/// Permits everything; useful for tests and for embedders that enforce
/// authorization upstream of this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllAuthorizer;

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn authorize(&self, _principal: &str, _action: &str, _resource: Option<&str>) -> Decision {
        Decision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_always_allows() {
        let auth = AllowAllAuthorizer;
        assert_eq!(
            auth.authorize("user-1", "submit_task", None).await,
            Decision::Allow
        );
    }
}
