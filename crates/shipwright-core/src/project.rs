//! Projects and the records a job references.

use serde::{Deserialize, Serialize};

/// A source repository holding playbooks and inventories
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Project ID
    pub id: u64,
    /// Display name
    pub name: String,
    /// Clone URL
    pub repo_url: String,
    /// Branch tracked on the `origin` remote
    pub repo_branch: String,
    /// User for SSH authentication
    pub repo_user: String,
    /// Key for SSH authentication
    pub ssh_key: Option<Key>,
}

impl Project {
    /// Returns true when the clone URL uses http or https
    #[must_use]
    pub fn is_http(&self) -> bool {
        let url = self.repo_url.trim_start().to_ascii_lowercase();
        url.starts_with("http://") || url.starts_with("https://")
    }

    /// Returns true when the repository can only be reached over SSH and no
    /// key is configured
    #[must_use]
    pub fn missing_ssh_key(&self) -> bool {
        self.ssh_key.is_none() && !self.is_http()
    }
}

/// Inventory source inside a project
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    /// Inventory ID
    pub id: u64,
    /// Display name
    pub name: String,
    /// Inventory path relative to the checkout
    pub source_file: String,
    /// Owning project
    pub project_id: Option<u64>,
}

/// Deployable application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// Application ID
    pub id: u64,
    /// Display name
    pub name: String,
    /// Identifier passed to the playbook as `app`
    pub ansible_name: String,
    /// Owning project
    pub project_id: Option<u64>,
}

/// Private key material
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// Key ID, also the file name under the keys directory
    pub id: u64,
    /// Display title
    pub title: String,
    /// Key content
    pub key: String,
}

/// A user account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User ID
    pub id: u64,
    /// Display name
    pub name: String,
    /// Email address
    pub email: String,
}
