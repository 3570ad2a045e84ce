//! Automation command invocation.

use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::ExecutorResult;
use crate::command::CommandSpec;

/// Variable appended to every extra-variables file
pub const WORKER_MARKER: &str = "shipwright_worker: true";

/// Environment forcing colored, non-interactive runs without host key prompts
pub const PLAYBOOK_ENV: [(&str, &str); 2] = [
    ("ANSIBLE_FORCE_COLOR", "true"),
    ("ANSIBLE_HOST_KEY_CHECKING", "False"),
];

/// Temporary file with a job's extra variables
///
/// The file is removed when the value is dropped.
#[derive(Debug)]
pub struct ExtraVarsFile {
    file: NamedTempFile,
    contents: String,
}

impl ExtraVarsFile {
    /// Writes the job's variable text followed by [`WORKER_MARKER`]
    ///
    /// # Errors
    ///
    /// Returns an error when the temporary file cannot be created or written.
    pub fn write(variables: &str) -> ExecutorResult<Self> {
        let contents = format!("{variables}\n{WORKER_MARKER}\n");
        let mut file = tempfile::Builder::new()
            .prefix("extra-vars-")
            .suffix(".yml")
            .tempfile()?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        Ok(Self { file, contents })
    }

    /// File path
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Text written to the file
    #[must_use]
    pub fn contents(&self) -> &str {
        &self.contents
    }
}

/// Arguments of one automation command run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybookInvocation {
    program: String,
    private_key: Option<PathBuf>,
    inventory: String,
    variables: Vec<(String, String)>,
    extra_vars_file: Option<PathBuf>,
    vault_key: Option<PathBuf>,
    playbook: String,
    dir: PathBuf,
}

impl PlaybookInvocation {
    /// Runs `program` against `inventory` and `playbook` inside `dir`
    pub fn new(
        program: impl Into<String>,
        inventory: impl Into<String>,
        playbook: impl Into<String>,
        dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            private_key: None,
            inventory: inventory.into(),
            variables: Vec::new(),
            extra_vars_file: None,
            vault_key: None,
            playbook: playbook.into(),
            dir: dir.into(),
        }
    }

    /// Key file used to reach the hosts
    #[must_use]
    pub fn private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }

    /// Adds a `-e key=value` argument
    #[must_use]
    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.push((key.into(), value.into()));
        self
    }

    /// Adds a `-e @file` argument
    #[must_use]
    pub fn extra_vars_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_vars_file = Some(path.into());
        self
    }

    /// Key file decrypting vaulted variables
    #[must_use]
    pub fn vault_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.vault_key = Some(path.into());
        self
    }

    /// Builds the command
    #[must_use]
    pub fn to_command(&self) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.program).current_dir(&self.dir);
        if let Some(key) = &self.private_key {
            spec = spec.arg("--private-key").arg(key.to_string_lossy());
        }
        spec = spec.arg("-i").arg(&self.inventory);
        for (key, value) in &self.variables {
            spec = spec.arg("-e").arg(format!("{key}={value}"));
        }
        if let Some(file) = &self.extra_vars_file {
            spec = spec.arg("-e").arg(format!("@{}", file.display()));
        }
        spec = spec.arg(&self.playbook);
        if let Some(vault) = &self.vault_key {
            spec = spec.arg("--vault-id").arg(vault.to_string_lossy());
        }
        PLAYBOOK_ENV
            .iter()
            .fold(spec, |spec, (key, value)| spec.env(*key, *value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extra_vars_file() {
        let vars = ExtraVarsFile::write("region: eu-west-1").unwrap();
        let expected = "region: eu-west-1\nshipwright_worker: true\n";
        assert_eq!(vars.contents(), expected);
        assert_eq!(std::fs::read_to_string(vars.path()).unwrap(), expected);

        let path = vars.path().to_path_buf();
        drop(vars);
        assert!(!path.exists());
    }

    #[test]
    fn test_deployment_command() {
        let spec = PlaybookInvocation::new(
            "ansible-playbook",
            "inventories/prod",
            "deploy.yml",
            "/srv/storage/repositories/3",
        )
        .private_key("/srv/storage/keys/4")
        .variable("app", "billing")
        .variable("version", "1.4.2")
        .extra_vars_file("/tmp/extra-vars-x.yml")
        .vault_key("/srv/storage/keys/5")
        .to_command();

        assert_eq!(
            spec.args,
            vec![
                "--private-key",
                "/srv/storage/keys/4",
                "-i",
                "inventories/prod",
                "-e",
                "app=billing",
                "-e",
                "version=1.4.2",
                "-e",
                "@/tmp/extra-vars-x.yml",
                "deploy.yml",
                "--vault-id",
                "/srv/storage/keys/5",
            ]
        );
        assert_eq!(spec.dir, Some(PathBuf::from("/srv/storage/repositories/3")));
        assert_eq!(
            spec.env,
            vec![
                ("ANSIBLE_FORCE_COLOR".to_string(), "true".to_string()),
                ("ANSIBLE_HOST_KEY_CHECKING".to_string(), "False".to_string()),
            ]
        );
    }

    #[test]
    fn test_minimal_command() {
        let spec = PlaybookInvocation::new("ansible-playbook", "hosts", "site.yml", "/work")
            .to_command();
        assert_eq!(spec.command_line(), "ansible-playbook -i hosts site.yml");
    }
}
