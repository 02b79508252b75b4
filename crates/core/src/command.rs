//! Command rewriting
//!
//! Turns a codec tool invocation into the argument vector that is actually
//! spawned: either the local fallback binary, or the remote shell carrying the
//! worker-side binary. Everything is composed as a token list; no local shell
//! is ever involved.

use crate::config::Config;
use crate::model::Host;
use std::borrow::Cow;
use std::fmt;
use std::process::Stdio;

/// Exit status the remote shell reserves for its own transport errors
pub const REMOTE_SHELL_TRANSPORT_FAILURE: i32 = 255;

/// Which codec tool is being wrapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Ffmpeg,
    Ffprobe,
}

impl Tool {
    /// Identify the tool from the name this program was started under.
    ///
    /// Returns `None` for the control CLI (`rffmpeg ...`).
    pub fn from_program_name(name: &str) -> Option<Tool> {
        let base = name.rsplit('/').next().unwrap_or(name);
        if base.contains("ffprobe") {
            Some(Tool::Ffprobe)
        } else if base.starts_with("rffmpeg") {
            None
        } else {
            Some(Tool::Ffmpeg)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::Ffmpeg => "ffmpeg",
            Tool::Ffprobe => "ffprobe",
        }
    }

    /// Binary path on the worker hosts
    pub fn remote_binary<'a>(&self, config: &'a Config) -> &'a str {
        match self {
            Tool::Ffmpeg => &config.commands.ffmpeg,
            Tool::Ffprobe => &config.commands.ffprobe,
        }
    }

    /// Binary path used when running locally
    pub fn local_binary<'a>(&self, config: &'a Config) -> &'a str {
        match self {
            Tool::Ffmpeg => &config.commands.fallback_ffmpeg,
            Tool::Ffprobe => &config.commands.fallback_ffprobe,
        }
    }
}

/// One call of a codec tool, as received from the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tool: Tool,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(tool: Tool, args: Vec<String>) -> Self {
        Self { tool, args }
    }

    /// True when any argument is one of `special_flags`
    pub fn is_special(&self, special_flags: &[String]) -> bool {
        self.args
            .iter()
            .any(|arg| special_flags.iter().any(|flag| flag == arg))
    }
}

/// A program plus its argument vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Build from a token list; the first token is the program.
    ///
    /// Returns `None` for an empty list.
    pub fn from_tokens(tokens: Vec<String>) -> Option<Self> {
        let mut tokens = tokens.into_iter();
        let program = tokens.next()?;
        Some(Self {
            program,
            args: tokens.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Spawnable command with stdio inherited from this process
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_./:=,+@%^".contains(c)
}

/// Quote one argument for the POSIX shell on the remote side.
///
/// The remote shell joins its trailing arguments with spaces and re-parses
/// them, so anything outside a conservative character set is single-quoted.
pub fn quote_remote_arg(arg: &str) -> Cow<'_, str> {
    if !arg.is_empty() && arg.chars().all(is_shell_safe) {
        return Cow::Borrowed(arg);
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    Cow::Owned(quoted)
}

/// Build the local command: fallback binary plus the original arguments
pub fn build_local_command(config: &Config, invocation: &Invocation) -> CommandLine {
    CommandLine {
        program: invocation.tool.local_binary(config).to_string(),
        args: invocation.args.clone(),
    }
}

/// Build the remote command for `host`
///
/// Layout:
/// - `commands.pre` tokens
/// - remote shell binary with `-q -t`
/// - connection multiplexing options when `remote.persist > 0`
/// - `remote.args`
/// - `-l <user>` when a user is configured
/// - target hostname
/// - worker-side binary followed by the quoted original arguments
pub fn build_remote_command(config: &Config, host: &Host, invocation: &Invocation) -> CommandLine {
    let mut tokens: Vec<String> = config
        .commands
        .pre
        .iter()
        .filter(|t| !t.is_empty())
        .cloned()
        .collect();

    tokens.push(config.commands.ssh.clone());
    tokens.push("-q".to_string());
    tokens.push("-t".to_string());

    if config.remote.persist > 0 {
        let control_path = config.directories.persist.join("ssh-%r@%h:%p");
        tokens.push("-o".to_string());
        tokens.push("ControlMaster=auto".to_string());
        tokens.push("-o".to_string());
        tokens.push(format!("ControlPath={}", control_path.display()));
        tokens.push("-o".to_string());
        tokens.push(format!("ControlPersist={}", config.remote.persist));
    }

    tokens.extend(config.remote.args.iter().cloned());

    if !config.remote.user.is_empty() {
        tokens.push("-l".to_string());
        tokens.push(config.remote.user.clone());
    }

    tokens.push(host.hostname.clone());
    tokens.push(invocation.tool.remote_binary(config).to_string());
    tokens.extend(
        invocation
            .args
            .iter()
            .map(|arg| quote_remote_arg(arg).into_owned()),
    );

    // tokens always holds at least the remote shell binary
    let mut tokens = tokens.into_iter();
    CommandLine {
        program: tokens.next().unwrap_or_default(),
        args: tokens.collect(),
    }
}
