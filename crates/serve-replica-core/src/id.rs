//! Stable identities for deployments and replicas.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a deployment within an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentID {
    pub app_name: String,
    pub name: String,
}

impl DeploymentID {
    pub fn new(app_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            name: name.into(),
        }
    }

    /// Component name used in logs and metric labels.
    ///
    /// Prefixed with the app name when one is set.
    pub fn component_name(&self) -> String {
        if self.app_name.is_empty() {
            self.name.clone()
        } else {
            format!("{}_{}", self.app_name, self.name)
        }
    }
}

impl fmt::Display for DeploymentID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.component_name())
    }
}

/// Stable identity of a single replica of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaID {
    pub deployment_id: DeploymentID,
    pub unique_id: String,
}

impl ReplicaID {
    pub fn new(deployment_id: DeploymentID, unique_id: impl Into<String>) -> Self {
        Self {
            deployment_id,
            unique_id: unique_id.into(),
        }
    }
}

impl fmt::Display for ReplicaID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.deployment_id, self.unique_id)
    }
}
