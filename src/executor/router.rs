use std::sync::Arc;

use super::Executor;
use crate::catalog::PrivilegeLevel;

/// Maps a privilege level to its executor. Selection uses nothing but the
/// declared level.
pub struct PrivilegeRouter {
    user: Arc<dyn Executor>,
    automation: Arc<dyn Executor>,
    elevated: Arc<dyn Executor>,
}

impl PrivilegeRouter {
    pub fn new(user: Arc<dyn Executor>, automation: Arc<dyn Executor>, elevated: Arc<dyn Executor>) -> Self {
        Self {
            user,
            automation,
            elevated,
        }
    }

    pub fn route(&self, level: PrivilegeLevel) -> Arc<dyn Executor> {
        match level {
            PrivilegeLevel::User => self.user.clone(),
            PrivilegeLevel::Automation => self.automation.clone(),
            PrivilegeLevel::Elevated => self.elevated.clone(),
        }
    }

    pub fn cancel_all(&self) {
        self.user.cancel();
        self.automation.cancel();
        self.elevated.cancel();
    }
}
