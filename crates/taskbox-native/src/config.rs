//! Native engine configuration.

/// Configuration for the native engine.
#[derive(Debug, Clone, Default)]
pub struct NativeConfig {
    /// Run each task as a freshly created OS user in its own temporary
    /// folder. Requires root. When off, tasks run as the worker's user in
    /// its home folder.
    pub create_user: bool,

    /// Supplementary groups for created users.
    pub groups: Vec<String>,
}

impl NativeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a throwaway user per task.
    pub fn with_create_user(mut self, create_user: bool) -> Self {
        self.create_user = create_user;
        self
    }

    /// Set supplementary groups for created users.
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }
}
