//! Canonical key layout.
//!
//! Every key the queue touches is `<prefix>:<queue>:<suffix>`. Scripts receive
//! these pre-built so the layout lives in exactly one place.

pub const DEFAULT_PREFIX: &str = "bull";

/// Key builder for one queue.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
    queue: String,
    base: String,
}

impl KeySpace {
    pub fn new(prefix: &str, queue: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            queue: queue.to_string(),
            base: format!("{prefix}:{queue}:"),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// `<prefix>:<queue>:<suffix>`
    pub fn to_key(&self, suffix: &str) -> String {
        format!("{}{}", self.base, suffix)
    }

    pub fn id(&self) -> String {
        self.to_key("id")
    }

    pub fn wait(&self) -> String {
        self.to_key("wait")
    }

    pub fn paused(&self) -> String {
        self.to_key("paused")
    }

    pub fn active(&self) -> String {
        self.to_key("active")
    }

    pub fn prioritized(&self) -> String {
        self.to_key("prioritized")
    }

    /// Monotonic counter feeding the low bits of the prioritized score.
    pub fn priority_counter(&self) -> String {
        self.to_key("pc")
    }

    pub fn delayed(&self) -> String {
        self.to_key("delayed")
    }

    pub fn completed(&self) -> String {
        self.to_key("completed")
    }

    pub fn failed(&self) -> String {
        self.to_key("failed")
    }

    pub fn waiting_children(&self) -> String {
        self.to_key("waiting-children")
    }

    pub fn stalled_check(&self) -> String {
        self.to_key("stalled-check")
    }

    pub fn stalled(&self) -> String {
        self.to_key("stalled")
    }

    pub fn marker(&self) -> String {
        self.to_key("marker")
    }

    pub fn events(&self) -> String {
        self.to_key("events")
    }

    pub fn meta(&self) -> String {
        self.to_key("meta")
    }

    pub fn repeat(&self) -> String {
        self.to_key("repeat")
    }

    pub fn repeat_def(&self, key_hash: &str) -> String {
        self.to_key(&format!("repeat:{key_hash}"))
    }

    pub fn limiter(&self) -> String {
        self.to_key("limiter")
    }

    pub fn limiter_group(&self, group: &str) -> String {
        self.to_key(&format!("limiter:{group}"))
    }

    pub fn job(&self, job_id: &str) -> String {
        self.to_key(job_id)
    }

    pub fn job_lock(&self, job_id: &str) -> String {
        self.to_key(&format!("{job_id}:lock"))
    }

    pub fn job_logs(&self, job_id: &str) -> String {
        self.to_key(&format!("{job_id}:logs"))
    }

    /// Pending children of a parent, as qualified job keys.
    pub fn job_dependencies(&self, job_id: &str) -> String {
        self.to_key(&format!("{job_id}:dependencies"))
    }

    /// Child return values, keyed by qualified job key.
    pub fn job_processed(&self, job_id: &str) -> String {
        self.to_key(&format!("{job_id}:processed"))
    }

    /// Failure reasons of ignored children, keyed by qualified job key.
    pub fn job_ignored_failures(&self, job_id: &str) -> String {
        self.to_key(&format!("{job_id}:ignored-children-failures"))
    }

    /// Qualified job key used in cross-queue parent references.
    pub fn qualified(&self, job_id: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.queue, job_id)
    }

    /// `<prefix>:<queue>` without the trailing separator; scripts append
    /// suffixes for cross-queue parent keys.
    pub fn queue_key(&self) -> String {
        format!("{}:{}", self.prefix, self.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed() {
        let keys = KeySpace::new("bull", "mail");
        assert_eq!(keys.wait(), "bull:mail:wait");
        assert_eq!(keys.job("42"), "bull:mail:42");
        assert_eq!(keys.job_lock("42"), "bull:mail:42:lock");
        assert_eq!(keys.repeat_def("abc"), "bull:mail:repeat:abc");
        assert_eq!(keys.qualified("42"), "bull:mail:42");
    }

    #[test]
    fn custom_prefix() {
        let keys = KeySpace::new("app", "video");
        assert_eq!(keys.events(), "app:video:events");
        assert_eq!(keys.limiter_group("tenant-1"), "app:video:limiter:tenant-1");
    }
}
