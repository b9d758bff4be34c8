use std::{fs, path::Path, path::PathBuf};

use crate::os::OsServices;
use crate::prelude::*;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "autopin.yaml";

const DEFAULT_COMM_TIMEOUT_SECS: u64 = 60;
const DEFAULT_LOGGER_INTERVAL_MS: u64 = 100;

/// Configuration of an autopin run, usually read from `autopin.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AutopinConfig {
    #[serde(flatten)]
    pub process: ProcessConfig,
    /// Cores used by the static pinning strategy
    pub pinning: Option<Vec<usize>>,
    pub external_logger: Option<ExternalLoggerConfig>,
}

/// How the observed process is obtained and controlled.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessConfig {
    #[serde(default)]
    pub trace: bool,
    pub comm_chan: Option<CommChan>,
    pub comm_chan_timeout: Option<i64>,
    pub attach: Option<AttachTarget>,
    pub exec: Option<ExecCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CommChan {
    /// `true` selects the default socket path
    Enabled(bool),
    Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AttachTarget {
    Pid(i32),
    /// A process name, or a pid written as a string
    Name(String),
}

impl AttachTarget {
    /// The literal pid, if the target is numeric.
    pub fn pid(&self) -> Option<i32> {
        match self {
            AttachTarget::Pid(pid) => Some(*pid),
            AttachTarget::Name(name) if name.bytes().all(|b| b.is_ascii_digit()) => {
                name.parse().ok()
            }
            AttachTarget::Name(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ExecCommand {
    Line(String),
    Args(Vec<String>),
}

impl ExecCommand {
    /// The command as a single line; list items are joined with single spaces.
    pub fn command_line(&self) -> String {
        match self {
            ExecCommand::Line(line) => line.clone(),
            ExecCommand::Args(args) => args.join(" "),
        }
    }
}

/// The process to observe, once the configuration has been validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Attach(AttachTarget),
    Exec(String),
}

impl ProcessConfig {
    pub fn subject(&self) -> Result<Subject> {
        match (&self.attach, &self.exec) {
            (Some(_), Some(_)) => Err(Error::bad_config(
                "inconsistent",
                "Attach and Exec cannot be configured at the same time",
            )),
            (None, None) => Err(Error::bad_config("option_missing", "No process configured")),
            (Some(target), None) => match target.pid() {
                Some(pid) if pid <= 0 => Err(Error::bad_config(
                    "option_format",
                    format!("Attach must name a process or a positive pid, got {pid}"),
                )),
                _ => Ok(Subject::Attach(target.clone())),
            },
            (None, Some(exec)) => {
                let command_line = exec.command_line();
                if command_line.trim().is_empty() {
                    return Err(Error::bad_config("option_format", "Exec is empty"));
                }
                Ok(Subject::Exec(command_line))
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.subject()?;
        self.control_addr()?;
        Ok(())
    }

    /// Path of the control socket, `None` if no control channel is requested.
    pub fn control_addr(&self) -> Result<Option<PathBuf>> {
        match &self.comm_chan {
            None | Some(CommChan::Enabled(false)) => Ok(None),
            Some(CommChan::Enabled(true)) => OsServices::default_control_addr().map(Some),
            Some(CommChan::Path(path)) if path.as_os_str().is_empty() => Err(Error::bad_config(
                "option_format",
                "CommChan must be a boolean or a non-empty path",
            )),
            Some(CommChan::Path(path)) => Ok(Some(path.clone())),
        }
    }

    /// Seconds to wait for the observed process to connect; non-positive values use the default.
    pub fn comm_timeout(&self) -> u64 {
        match self.comm_chan_timeout {
            Some(timeout) if timeout > 0 => timeout as u64,
            _ => DEFAULT_COMM_TIMEOUT_SECS,
        }
    }
}

/// An external command receiving monitor values on its stdin.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExternalLoggerConfig {
    pub command: Vec<String>,
    /// Sampling interval in milliseconds
    #[serde(default = "default_logger_interval")]
    pub interval: u64,
    /// Only report the first task of each monitor
    #[serde(default)]
    pub systemwide: bool,
}

fn default_logger_interval() -> u64 {
    DEFAULT_LOGGER_INTERVAL_MS
}

impl AutopinConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::bad_config("option_format", format!("Invalid configuration: {e}")))
    }

    /// Loads and validates the configuration at `path`.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::bad_config(
                "config_file",
                format!("Could not read the configuration at {}: {e}", path.display()),
            )
            .with_io_source(&e)
        })?;

        let config = Self::from_yaml(&content)?;
        config.process.validate()?;
        debug!("Config loaded from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
impl ProcessConfig {
    /// Spawning `command` without tracing or control channel
    pub fn test(command: &str) -> Self {
        Self {
            exec: Some(ExecCommand::Line(command.into())),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    #[test]
    fn test_parse_full_config() {
        let config = AutopinConfig::from_yaml(
            r#"
Trace: true
CommChan: /tmp/autopin.sock
CommChanTimeout: 5
Exec: ./app --threads 4
Pinning: [0, 2]
ExternalLogger:
  Command: [cat, "-u"]
  Systemwide: true
"#,
        )
        .unwrap();

        assert!(config.process.trace);
        assert_eq!(
            config.process.control_addr().unwrap(),
            Some(PathBuf::from("/tmp/autopin.sock"))
        );
        assert_eq!(config.process.comm_timeout(), 5);
        assert_eq!(
            config.process.subject().unwrap(),
            Subject::Exec("./app --threads 4".into())
        );
        assert_eq!(config.pinning, Some(vec![0, 2]));

        let logger = config.external_logger.unwrap();
        assert_eq!(logger.command, vec!["cat", "-u"]);
        assert_eq!(logger.interval, 100);
        assert!(logger.systemwide);
    }

    #[rstest]
    #[case("Attach: 1234", Some(1234))]
    #[case("Attach: '1234'", Some(1234))]
    #[case("Attach: firefox", None)]
    fn test_attach_target(#[case] yaml: &str, #[case] pid: Option<i32>) {
        let config = AutopinConfig::from_yaml(yaml).unwrap();
        let Subject::Attach(target) = config.process.subject().unwrap() else {
            panic!("expected an attach subject");
        };
        assert_eq!(target.pid(), pid);
    }

    #[test]
    fn test_exec_list_is_joined() {
        let config = AutopinConfig::from_yaml("Exec: [sleep, '10']").unwrap();
        assert_eq!(
            config.process.subject().unwrap(),
            Subject::Exec("sleep 10".into())
        );
    }

    #[rstest]
    #[case("Attach: 1\nExec: ls", "inconsistent")]
    #[case("Trace: true", "option_missing")]
    #[case("Exec: ''", "option_format")]
    #[case("Attach: -1", "option_format")]
    #[case("Attach: 0", "option_format")]
    #[case("Attach: '0'", "option_format")]
    fn test_invalid_subject(#[case] yaml: &str, #[case] tag: &str) {
        let config = AutopinConfig::from_yaml(yaml).unwrap();
        let err = config.process.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadConfig);
        assert_eq!(err.tag(), tag);
    }

    #[rstest]
    #[case(None, 60)]
    #[case(Some(0), 60)]
    #[case(Some(-3), 60)]
    #[case(Some(12), 12)]
    fn test_comm_timeout(#[case] configured: Option<i64>, #[case] expected: u64) {
        let config = ProcessConfig {
            comm_chan_timeout: configured,
            ..ProcessConfig::test("ls")
        };
        assert_eq!(config.comm_timeout(), expected);
    }

    #[test]
    fn test_comm_chan_true_uses_home() {
        temp_env::with_var("HOME", Some("/home/observer"), || {
            let config = AutopinConfig::from_yaml("CommChan: true\nExec: ls").unwrap();
            assert_eq!(
                config.process.control_addr().unwrap(),
                Some(PathBuf::from("/home/observer/.autopin_socket"))
            );
        });
    }

    #[test]
    fn test_comm_chan_false_disables_channel() {
        let config = AutopinConfig::from_yaml("CommChan: false\nExec: ls").unwrap();
        assert_eq!(config.process.control_addr().unwrap(), None);
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Exec: sleep 1\nPinning: [1]").unwrap();

        let config = AutopinConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.pinning, Some(vec![1]));
    }

    #[test]
    fn test_load_from_missing_path() {
        let err = AutopinConfig::load_from_path(Path::new("/nonexistent/autopin.yaml")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadConfig);
        assert!(err.message().contains("/nonexistent/autopin.yaml"));
    }

    #[test]
    fn test_load_rejects_inconsistent_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Attach: 12\nExec: sleep 1").unwrap();

        let err = AutopinConfig::load_from_path(file.path()).unwrap_err();
        assert_eq!(err.tag(), "inconsistent");
    }
}
