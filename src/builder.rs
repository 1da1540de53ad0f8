/// Launch recipe for an external builder's `run` program.
///
/// A builder is a directory with a `bin/run` executable. The run program is
/// invoked as `bin/run <build_output_dir> <run_metadata_dir>` with an
/// environment restricted to the builder's propagated variables.
use crate::config::BuilderConfig;
use crate::session::Invocation;
use std::path::{Path, PathBuf};

/// Variables handed through to the run program when the builder config
/// doesn't name its own list.
pub const DEFAULT_PROPAGATE_ENVIRONMENT: &[&str] = &["LD_LIBRARY_PATH", "LIBPATH", "PATH", "TMPDIR"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Builder {
    /// Display name, embedded verbatim in run failure messages.
    pub name: String,
    /// Root directory of the builder (contains `bin/run`).
    pub location: PathBuf,
    pub propagate_environment: Vec<String>,
}

impl Builder {
    /// Builder with the default propagation list.
    #[cfg(test)]
    pub fn new(name: impl Into<String>, location: impl Into<PathBuf>) -> Self {
        Self::from(&BuilderConfig {
            name: name.into(),
            location: location.into(),
            ..BuilderConfig::default()
        })
    }

    /// Path to the builder's run executable.
    pub fn run_program(&self) -> PathBuf {
        self.location.join("bin").join("run")
    }

    /// Build the invocation for `bin/run`.
    pub fn run_invocation(&self, build_output_dir: &Path, run_metadata_dir: &Path) -> Invocation {
        Invocation::new(self.run_program())
            .name(&self.name)
            .arg(build_output_dir)
            .arg(run_metadata_dir)
            .working_dir(build_output_dir)
            .env_exact(self.environment())
    }

    /// The propagated variables that are actually set in our environment.
    fn environment(&self) -> Vec<(String, String)> {
        self.propagate_environment
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect()
    }
}

impl From<&BuilderConfig> for Builder {
    fn from(config: &BuilderConfig) -> Self {
        Self {
            name: config.name.clone(),
            location: config.location.clone(),
            propagate_environment: config.propagate_environment.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn test_run_program_path() {
        let builder = Builder::new("acme", "/opt/builders/acme");
        assert_eq!(
            builder.run_program(),
            PathBuf::from("/opt/builders/acme/bin/run")
        );
    }

    #[test]
    fn test_default_propagate_environment() {
        let builder = Builder::new("acme", "/opt/builders/acme");
        assert_eq!(
            builder.propagate_environment,
            vec!["LD_LIBRARY_PATH", "LIBPATH", "PATH", "TMPDIR"]
        );
    }

    #[test]
    fn test_run_invocation_args_and_working_dir() {
        let builder = Builder::new("acme", "/opt/builders/acme");
        let inv = builder.run_invocation(Path::new("/work/build"), Path::new("/tmp/run-1"));
        assert_eq!(inv.name, "acme");
        assert_eq!(inv.program, PathBuf::from("/opt/builders/acme/bin/run"));
        assert_eq!(
            inv.args,
            vec![OsString::from("/work/build"), OsString::from("/tmp/run-1")]
        );
        assert_eq!(inv.working_dir, Some(PathBuf::from("/work/build")));
    }

    #[test]
    fn test_environment_only_includes_set_propagated_vars() {
        let mut builder = Builder::new("acme", "/opt/builders/acme");
        builder.propagate_environment = vec![
            "PATH".to_string(),
            "RUNWARDEN_SURELY_UNSET_VARIABLE".to_string(),
        ];
        let inv = builder.run_invocation(Path::new("/b"), Path::new("/m"));
        let env = inv.env.unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].0, "PATH");
        assert_eq!(env[0].1, std::env::var("PATH").unwrap());
    }

    #[test]
    fn test_empty_propagation_list_clears_environment() {
        let mut builder = Builder::new("acme", "/opt/builders/acme");
        builder.propagate_environment.clear();
        let inv = builder.run_invocation(Path::new("/b"), Path::new("/m"));
        assert_eq!(inv.env, Some(vec![]));
    }

    #[test]
    fn test_from_config() {
        let config = BuilderConfig {
            name: "golang".to_string(),
            location: PathBuf::from("/builders/golang"),
            propagate_environment: vec!["HOME".to_string()],
        };
        let builder = Builder::from(&config);
        assert_eq!(builder.name, "golang");
        assert_eq!(builder.location, PathBuf::from("/builders/golang"));
        assert_eq!(builder.propagate_environment, vec!["HOME"]);
    }
}
