use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identifies one logical account binding: an instance id plus the
/// directory holding its persisted credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    instance_id: String,
    session_path: PathBuf,
}

impl InstanceKey {
    pub fn new(instance_id: impl Into<String>, session_path: impl Into<PathBuf>) -> Self {
        Self {
            instance_id: instance_id.into(),
            session_path: session_path.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn session_path(&self) -> &Path {
        &self.session_path
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.instance_id, self.session_path.display())
    }
}
