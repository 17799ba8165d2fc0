use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::TranscodeSection;

/// CPU throttling wrapper placed in front of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuLimit {
    pub program: PathBuf,
    pub percent: u32,
}

impl CpuLimit {
    pub fn from_transcode(section: &TranscodeSection) -> Option<Self> {
        (section.cpu_limit > 0).then(|| Self {
            program: section.cpulimit_path.clone(),
            percent: section.cpu_limit,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cpu_limit: Option<CpuLimit>,
    pub current_dir: Option<PathBuf>,
}

impl CommandRequest {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cpu_limit: None,
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_cpu_limit(mut self, cpu_limit: Option<CpuLimit>) -> Self {
        self.cpu_limit = cpu_limit;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Program and arguments actually executed once the wrapper is applied:
    /// `<cpulimit> -i -l <percent> -- <program> <args...>`.
    pub fn argv(&self) -> (PathBuf, Vec<OsString>) {
        match &self.cpu_limit {
            Some(limit) => {
                let mut argv: Vec<OsString> = vec![
                    "-i".into(),
                    "-l".into(),
                    limit.percent.to_string().into(),
                    "--".into(),
                    self.program.clone().into_os_string(),
                ];
                argv.extend(self.args.iter().map(OsString::from));
                (limit.program.clone(), argv)
            }
            None => (
                self.program.clone(),
                self.args.iter().map(OsString::from).collect(),
            ),
        }
    }

    /// Value after `flag`, e.g. the input of `-i`.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|arg| arg == flag)
            .and_then(|index| self.args.get(index + 1))
            .map(String::as_str)
    }

    pub fn display(&self) -> String {
        let (program, argv) = self.argv();
        let mut rendered = program.display().to_string();
        for arg in argv {
            rendered.push(' ');
            rendered.push_str(&arg.to_string_lossy());
        }
        rendered
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub success: bool,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self {
            status: Some(0),
            success: true,
            stderr: String::new(),
        }
    }

    pub fn failure(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            success: false,
            stderr: stderr.into(),
        }
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, request: &CommandRequest) -> std::io::Result<CommandOutput>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, request: &CommandRequest) -> std::io::Result<CommandOutput> {
        let (program, argv) = request.argv();
        let mut command = Command::new(&program);
        command
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(dir) = request.current_dir.as_deref() {
            command.current_dir(dir);
        }
        let output = command.output().await?;
        Ok(CommandOutput {
            status: output.status.code(),
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
