//! Boundary to the role and permission collaborator.
//!
//! The engine only decides when roles are created or granted; what that means
//! for a given database is up to the implementation plugged into [`crate::Strata`].

use crate::db::Connection;
use crate::error::Result;
use crate::feedback::Feedback;

/// Which role operations an install or upgrade should perform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleOptions {
    pub create_roles: bool,
    pub grant: bool,
}

impl RoleOptions {
    /// Progress steps the role phase contributes.
    pub fn step_count(&self) -> usize {
        match (self.create_roles, self.grant) {
            (false, _) => 0,
            (true, false) => 1,
            (true, true) => 2,
        }
    }
}

#[async_trait::async_trait]
pub trait RoleProvisioner: Send + Sync {
    /// Create the configured roles. With `grant`, permissions follow in a separate call.
    async fn create_roles(&self, conn: &Connection, grant: bool, feedback: &dyn Feedback) -> Result<()>;

    async fn grant_permissions(&self, conn: &Connection, feedback: &dyn Feedback) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_count() {
        assert_eq!(RoleOptions::default().step_count(), 0);
        assert_eq!(
            RoleOptions { create_roles: false, grant: true }.step_count(),
            0
        );
        assert_eq!(
            RoleOptions { create_roles: true, grant: false }.step_count(),
            1
        );
        assert_eq!(
            RoleOptions { create_roles: true, grant: true }.step_count(),
            2
        );
    }
}
