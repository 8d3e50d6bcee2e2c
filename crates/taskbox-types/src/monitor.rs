//! Component-scoped leveled logging.

use std::fmt;
use std::sync::Arc;

/// Leveled logger carrying a set of tags.
///
/// Engines derive sub-loggers with [`Monitor::with_tag`] so that every event
/// emitted from a sandbox or virtual machine carries the task it belongs to.
/// Events are forwarded to `tracing`, with the tags rendered as one field.
#[derive(Clone, Default)]
pub struct Monitor {
    tags: Arc<Vec<(String, String)>>,
}

impl Monitor {
    /// Create a monitor for the named component.
    pub fn new(component: impl Into<String>) -> Self {
        Self::default().with_tag("component", component)
    }

    /// Derive a monitor with an additional tag; an existing key is replaced.
    pub fn with_tag(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let mut tags: Vec<(String, String)> = self
            .tags
            .iter()
            .filter(|(k, _)| *k != key)
            .cloned()
            .collect();
        tags.push((key, value.into()));
        Self {
            tags: Arc::new(tags),
        }
    }

    /// Look up a tag value.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn debug(&self, message: impl fmt::Display) {
        tracing::debug!(tags = %self, "{}", message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        tracing::info!(tags = %self, "{}", message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        tracing::warn!(tags = %self, "{}", message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        tracing::error!(tags = %self, "{}", message);
    }
}

impl fmt::Display for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Monitor({})", self)
    }
}
