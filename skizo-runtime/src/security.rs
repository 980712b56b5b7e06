//! Per-domain permission set. Trusted domains may do anything; untrusted
//! domains must hold a named permission or the demand aborts.

use std::collections::HashSet;

pub struct SecurityManager {
    is_trusted: bool,
    permissions: HashSet<String>,
}

impl SecurityManager {
    pub fn new(is_trusted: bool, permissions: Vec<String>) -> Self {
        SecurityManager {
            is_trusted,
            permissions: permissions.into_iter().collect(),
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.is_trusted
    }

    pub fn has_permission(&self, name: &str) -> bool {
        self.is_trusted || self.permissions.contains(name)
    }

    /// Ok for trusted domains or granted permissions; Err means the
    /// caller must abort with DISALLOWED_CALL.
    pub fn demand_permission(&self, name: &str) -> Result<(), String> {
        if self.has_permission(name) {
            Ok(())
        } else {
            Err(format!("Permission '{}' denied in untrusted domain", name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trusted_has_everything() {
        let sec = SecurityManager::new(true, vec![]);
        assert!(sec.demand_permission("FileIOPermission").is_ok());
    }

    #[test]
    fn test_untrusted_needs_grants() {
        let sec = SecurityManager::new(false, vec!["FileIOPermission".to_string()]);
        assert!(sec.demand_permission("FileIOPermission").is_ok());
        assert!(sec.demand_permission("ProcessPermission").is_err());
    }
}
