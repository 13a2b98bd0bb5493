//! Access to the host being converged
//!
//! `Host` bundles the three things every probe and reconciler touches:
//! a filesystem root that absolute artifact paths are resolved under, a
//! `CommandRunner` for external tools, and the program search path
//! captured at startup. Production uses `/` and real processes; tests use
//! a temporary directory and a `ScriptedRunner`.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A program and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Most useful single-line explanation of a failure
    pub fn detail(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.status {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Trait for executing external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A program that cannot be found yields an
    /// `io::ErrorKind::NotFound` error, distinct from a non-zero exit.
    async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput>;
}

/// Production runner spawning real processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        let output = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(std::process::Stdio::null())
            .output()
            .await?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

type Handler = dyn Fn(&Invocation) -> io::Result<CommandOutput> + Send + Sync;

/// Test-double runner that records invocations and answers through a handler
pub struct ScriptedRunner {
    handler: Box<Handler>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Invocation) -> io::Result<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// A runner for which every program succeeds with empty output
    pub fn succeeding() -> Self {
        Self::new(|_| Ok(CommandOutput::ok("")))
    }

    /// Every invocation so far, in order
    pub fn invocations(&self) -> Vec<Invocation> {
        match self.invocations.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Invocations whose rendered command line starts with `prefix`
    pub fn count_matching(&self, prefix: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|inv| inv.to_string().starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        match self.invocations.lock() {
            Ok(mut log) => log.push(invocation.clone()),
            Err(poisoned) => poisoned.into_inner().push(invocation.clone()),
        }
        (self.handler)(invocation)
    }
}

/// The machine being converged
#[derive(Clone)]
pub struct Host {
    root: PathBuf,
    runner: Arc<dyn CommandRunner>,
    search_path: Vec<PathBuf>,
    effective_uid: u32,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("root", &self.root)
            .field("search_path", &self.search_path)
            .field("effective_uid", &self.effective_uid)
            .finish()
    }
}

impl Host {
    /// The real machine, rooted at `/`
    pub fn system(search_path: Vec<PathBuf>) -> Self {
        Self {
            root: PathBuf::from("/"),
            runner: Arc::new(SystemRunner),
            search_path,
            effective_uid: current_euid(),
        }
    }

    /// A host rooted at `root`, privileged, with an empty search path
    pub fn with_root(root: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            root: root.into(),
            runner,
            search_path: Vec::new(),
            effective_uid: 0,
        }
    }

    pub fn with_search_path(mut self, search_path: Vec<PathBuf>) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn with_effective_uid(mut self, uid: u32) -> Self {
        self.effective_uid = uid;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn effective_uid(&self) -> u32 {
        self.effective_uid
    }

    /// Resolve an absolute host path under this host's root
    pub fn path(&self, absolute: &Path) -> PathBuf {
        let relative: PathBuf = absolute
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        self.root.join(relative)
    }

    /// Read a file; a missing file is `None`, any other failure is an error
    pub fn read_optional(&self, absolute: &Path) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.path(absolute)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Like `read_optional`, decoding as UTF-8 (lossily)
    pub fn read_string_optional(&self, absolute: &Path) -> io::Result<Option<String>> {
        Ok(self
            .read_optional(absolute)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Permission bits of a file, `None` when it does not exist
    pub fn file_mode(&self, absolute: &Path) -> io::Result<Option<u32>> {
        match std::fs::metadata(self.path(absolute)) {
            Ok(meta) => Ok(Some(permission_bits(&meta))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn set_mode(&self, absolute: &Path, mode: u32) -> io::Result<()> {
        set_permission_bits(&self.path(absolute), mode)
    }

    /// Run a program through the host's runner
    pub async fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let invocation = Invocation::new(program, args.iter().copied());
        let result = self.runner.run(&invocation).await;
        match &result {
            Ok(output) => tracing::debug!("`{}` exited with {:?}", invocation, output.status),
            Err(e) => tracing::debug!("`{}` could not run: {}", invocation, e),
        }
        result
    }

    /// Locate the executable `name` in the search path.
    ///
    /// The returned path is host-absolute. Files without an execute bit
    /// do not count.
    pub fn find_program(&self, name: &str) -> Option<PathBuf> {
        let dirs: Vec<PathBuf> = self.search_path.iter().map(|dir| self.path(dir)).collect();
        let joined = std::env::join_paths(dirs).ok()?;
        let found = which::which_in(name, Some(joined), &self.root).ok()?;
        let relative = found.strip_prefix(&self.root).ok()?;
        Some(Path::new("/").join(relative))
    }
}

/// Whether an error from `Host::run` means the program is not installed
pub fn is_missing_program(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(_meta: &std::fs::Metadata) -> u32 {
    0
}

/// Set permission bits on a real filesystem path
#[cfg(unix)]
pub fn set_permission_bits(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_permission_bits(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

fn current_euid() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail
        unsafe { libc::geteuid() }
    }
    #[cfg(not(unix))]
    {
        u32::MAX
    }
}
