//! Instance identity: an opaque origin tag stamped on every backplane
//! envelope plus the human-readable name shown to clients.

use uuid::Uuid;

/// Identity of this process within a cluster of hubs.
///
/// The `id` is regenerated on every start so two processes never share an
/// origin tag, even when they run on the same host with the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub id: Uuid,
    pub name: String,
}

impl InstanceIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

/// Host name of this machine, falling back to a fixed label.
pub fn default_instance_name() -> String {
    hostname().unwrap_or_else(|| "presence-hub".to_string())
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|s| !s.is_empty())
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_are_distinct() {
        let a = InstanceIdentity::new("node");
        let b = InstanceIdentity::new("node");
        assert_eq!(a.name, b.name);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn default_name_is_not_empty() {
        assert!(!default_instance_name().is_empty());
    }
}
