//! Key scheme for the shared store.

/// Builds store keys, optionally namespaced by a prefix.
///
/// With an empty prefix the keys are exactly `pending:{partition}`,
/// `active:{partition}`, `completed:{partition}`, `task:{id}` and the
/// `updates` channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}:{}", self.prefix, name)
        }
    }

    pub fn pending(&self, partition: &str) -> String {
        self.key(&format!("pending:{partition}"))
    }

    pub fn active(&self, partition: &str) -> String {
        self.key(&format!("active:{partition}"))
    }

    pub fn completed(&self, partition: &str) -> String {
        self.key(&format!("completed:{partition}"))
    }

    pub fn task(&self, task_id: &str) -> String {
        self.key(&format!("task:{task_id}"))
    }

    /// Pub/sub channel receiving lifecycle events.
    pub fn updates_channel(&self) -> String {
        self.key("updates")
    }

    /// Glob pattern matching every pending ordering.
    pub fn pending_pattern(&self) -> String {
        self.key("pending:*")
    }

    /// Extract the partition name from a pending key, if it is one.
    pub fn partition_from_pending(&self, key: &str) -> Option<String> {
        let prefix = self.key("pending:");
        key.strip_prefix(&prefix)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprefixed_keys() {
        let keys = KeySpace::default();
        assert_eq!(keys.pending("s1"), "pending:s1");
        assert_eq!(keys.active("s1"), "active:s1");
        assert_eq!(keys.completed("s1"), "completed:s1");
        assert_eq!(keys.task("abc"), "task:abc");
        assert_eq!(keys.updates_channel(), "updates");
    }

    #[test]
    fn prefixed_keys() {
        let keys = KeySpace::new("prod");
        assert_eq!(keys.pending("s1"), "prod:pending:s1");
        assert_eq!(keys.pending_pattern(), "prod:pending:*");
        assert_eq!(keys.updates_channel(), "prod:updates");
    }

    #[test]
    fn partition_extraction() {
        let keys = KeySpace::new("prod");
        assert_eq!(
            keys.partition_from_pending("prod:pending:session-9"),
            Some("session-9".to_string())
        );
        assert_eq!(keys.partition_from_pending("prod:active:session-9"), None);
        assert_eq!(keys.partition_from_pending("prod:pending:"), None);
    }
}
