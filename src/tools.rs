//! Locating and running the external build and signing tools.

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{PatcherError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Failure output kept in [`PatcherError::ToolFailed`].
const MAX_ERROR_OUTPUT: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolKind {
    Apktool,
    Zipalign,
    Apksigner,
    Keytool,
    Codesign,
    Security,
}

impl ToolKind {
    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::Apktool => "apktool",
            ToolKind::Zipalign => "zipalign",
            ToolKind::Apksigner => "apksigner",
            ToolKind::Keytool => "keytool",
            ToolKind::Codesign => "codesign",
            ToolKind::Security => "security",
        }
    }

    /// Environment variable that overrides the executable location.
    pub fn env_override(&self) -> &'static str {
        match self {
            ToolKind::Apktool => "AUTOPROXY_APKTOOL",
            ToolKind::Zipalign => "AUTOPROXY_ZIPALIGN",
            ToolKind::Apksigner => "AUTOPROXY_APKSIGNER",
            ToolKind::Keytool => "AUTOPROXY_KEYTOOL",
            ToolKind::Codesign => "AUTOPROXY_CODESIGN",
            ToolKind::Security => "AUTOPROXY_SECURITY",
        }
    }

    fn in_build_tools(&self) -> bool {
        matches!(self, ToolKind::Zipalign | ToolKind::Apksigner)
    }

    fn install_hint(&self) -> &'static str {
        match self {
            ToolKind::Apktool => "Install apktool (https://apktool.org) and put it on PATH.",
            ToolKind::Zipalign | ToolKind::Apksigner => {
                "Install the Android SDK build-tools and set ANDROID_HOME."
            }
            ToolKind::Keytool => "Install a JDK and put keytool on PATH.",
            ToolKind::Codesign | ToolKind::Security => "Install the Xcode command line tools.",
        }
    }
}

/// Captured output of a successful run.
#[derive(Clone, Debug, Default)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct Tool {
    name: String,
    program: PathBuf,
}

impl Tool {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
        }
    }

    /// Find `kind` via its override variable, then `PATH`, then the Android
    /// SDK build-tools (newest version first).
    pub fn resolve(kind: ToolKind) -> Result<Self> {
        if let Some(value) = env::var_os(kind.env_override()) {
            let path = PathBuf::from(value);
            if path.is_file() {
                return Ok(Self::new(kind.name(), path));
            }
            return Err(PatcherError::ToolNotFound {
                tool: kind.name().to_string(),
                hint: format!("{} points to missing file {}", kind.env_override(), path.display()),
            });
        }

        if let Some(path) = find_on_path(kind.name()) {
            return Ok(Self::new(kind.name(), path));
        }

        if kind.in_build_tools() {
            for var in ["ANDROID_HOME", "ANDROID_SDK_ROOT"] {
                if let Some(root) = env::var_os(var) {
                    if let Some(path) = find_in_build_tools(Path::new(&root), kind.name()) {
                        return Ok(Self::new(kind.name(), path));
                    }
                }
            }
        }

        Err(PatcherError::ToolNotFound {
            tool: kind.name().to_string(),
            hint: kind.install_hint().to_string(),
        })
    }

    /// Run to completion, killing the process once `timeout` elapses.
    pub fn run<I, S>(&self, args: I, timeout: Duration) -> Result<ToolOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        debug!(tool = %self.name, program = %self.program.display(), ?args, "running");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => PatcherError::ToolNotFound {
                    tool: self.name.clone(),
                    hint: format!("{} could not be executed", self.program.display()),
                },
                _ => PatcherError::from_io_error(&self.program, e),
            })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    if let Err(err) = child.kill() {
                        warn!(tool = %self.name, "failed to kill timed out process: {err}");
                    }
                    let _ = child.wait();
                    // Readers are left detached: grandchildren may still hold the pipes.
                    return Err(PatcherError::ToolTimeout {
                        tool: self.name.clone(),
                        timeout_secs: timeout.as_secs(),
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => return Err(PatcherError::from_io_error(&self.program, err)),
            }
        };

        let output = ToolOutput {
            stdout: collect(stdout),
            stderr: collect(stderr),
        };

        if !status.success() {
            return Err(PatcherError::ToolFailed {
                tool: self.name.clone(),
                code: status.code().unwrap_or(-1),
                output: failure_text(&output),
            });
        }
        debug!(tool = %self.name, "finished");
        Ok(output)
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn failure_text(output: &ToolOutput) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut text = match (stderr.trim(), stdout.trim()) {
        ("", out) => out.to_string(),
        (err, "") => err.to_string(),
        (err, out) => format!("{err}\n{out}"),
    };
    if text.len() > MAX_ERROR_OUTPUT {
        let mut cut = MAX_ERROR_OUTPUT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}

fn executable_names(name: &str) -> Vec<String> {
    if cfg!(windows) {
        vec![format!("{name}.exe"), format!("{name}.bat"), name.to_string()]
    } else {
        vec![name.to_string()]
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path).find_map(|dir| {
        executable_names(name)
            .into_iter()
            .map(|file| dir.join(file))
            .find(|candidate| candidate.is_file())
    })
}

fn find_in_build_tools(sdk_root: &Path, name: &str) -> Option<PathBuf> {
    let build_tools = sdk_root.join("build-tools");
    let mut versions: Vec<(Vec<u32>, PathBuf)> = fs::read_dir(&build_tools)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| {
            let version = entry
                .file_name()
                .to_string_lossy()
                .split(|c: char| !c.is_ascii_digit())
                .filter_map(|part| part.parse().ok())
                .collect();
            (version, entry.path())
        })
        .collect();
    versions.sort_by(|a, b| b.0.cmp(&a.0));

    versions.into_iter().find_map(|(_, dir)| {
        executable_names(name)
            .into_iter()
            .map(|file| dir.join(file))
            .find(|candidate| candidate.is_file())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn newest_build_tools_win() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        for version in ["30.0.3", "34.0.0", "9.0.0"] {
            let dir = temp.path().join("build-tools").join(version);
            fs::create_dir_all(&dir)?;
            fs::write(dir.join("zipalign"), b"")?;
        }
        fs::create_dir_all(temp.path().join("build-tools/35.0.0-rc1"))?;

        let found = find_in_build_tools(temp.path(), "zipalign").unwrap();
        assert!(found.ends_with("34.0.0/zipalign"));
        Ok(())
    }

    #[test]
    fn failure_text_prefers_stderr_and_truncates() {
        let output = ToolOutput {
            stdout: b"progress".to_vec(),
            stderr: b"bad password\n".to_vec(),
        };
        assert_eq!(failure_text(&output), "bad password\nprogress");

        let output = ToolOutput {
            stdout: vec![b'x'; MAX_ERROR_OUTPUT * 2],
            stderr: Vec::new(),
        };
        assert_eq!(failure_text(&output).len(), MAX_ERROR_OUTPUT + 3);
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_tool_failed() {
        let tool = Tool::new("sh", "/bin/sh");
        let err = tool
            .run(["-c", "echo oops >&2; exit 3"], Duration::from_secs(10))
            .unwrap_err();
        match err {
            PatcherError::ToolFailed { tool, code, output } => {
                assert_eq!(tool, "sh");
                assert_eq!(code, 3);
                assert_eq!(output, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout() -> anyhow::Result<()> {
        let tool = Tool::new("sh", "/bin/sh");
        let output = tool.run(["-c", "printf hello"], Duration::from_secs(10))?;
        assert_eq!(output.stdout, b"hello");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn slow_tool_times_out() {
        let tool = Tool::new("sh", "/bin/sh");
        let started = Instant::now();
        let err = tool
            .run(["-c", "exec sleep 30"], Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, PatcherError::ToolTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_program_is_tool_not_found() {
        let tool = Tool::new("ghost", "/definitely/not/here/ghost");
        let err = tool.run(["--version"], Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, PatcherError::ToolNotFound { .. }));
    }
}
