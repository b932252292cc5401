//! # Process Launch
//!
//! Options for starting a target under debugger control.
//!
//! The process is always created with its initial thread suspended. The
//! session attaches, waits for the create-process event, and only then resumes
//! the main thread, so no instruction of the target runs before breakpoints
//! can be installed.

use std::path::{Path, PathBuf};

use crate::types::{Handle, ProcessId, ThreadId};

/// What to start and where
///
/// ## Example
///
/// ```rust
/// use snare_core::launch::LaunchOptions;
///
/// let options = LaunchOptions::new("C:\\Tools\\app.exe")
///     .arg("--verbose")
///     .arg("input file.txt")
///     .current_dir("C:\\Work");
/// assert_eq!(
///     options.command_line(),
///     "\"C:\\Tools\\app.exe\" --verbose \"input file.txt\""
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions
{
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl LaunchOptions
{
    /// Start `program` with no arguments in the debugger's working directory.
    pub fn new(program: impl Into<PathBuf>) -> Self
    {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self
    {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the target in `dir`.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self
    {
        self.cwd = Some(dir.into());
        self
    }

    /// Program to start.
    pub fn program(&self) -> &Path
    {
        &self.program
    }

    /// Arguments, program name excluded.
    pub fn arguments(&self) -> &[String]
    {
        &self.args
    }

    /// Working directory, if one was set.
    pub fn working_dir(&self) -> Option<&Path>
    {
        self.cwd.as_deref()
    }

    /// Full command line, program first, quoted the way the MSVC runtime
    /// splits `argv`.
    pub fn command_line(&self) -> String
    {
        let mut line = String::new();
        // The program name is always quoted; argv[0] parsing has no escapes.
        line.push('"');
        line.push_str(&self.program.to_string_lossy());
        line.push('"');

        for arg in &self.args {
            line.push(' ');
            quote_argument(arg, &mut line);
        }
        line
    }
}

fn quote_argument(arg: &str, out: &mut String)
{
    let needs_quotes = arg.is_empty() || arg.contains([' ', '\t', '\n', '\x0b', '"']);
    if !needs_quotes {
        out.push_str(arg);
        return;
    }

    out.push('"');
    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                // Backslashes before a quote are doubled, plus one for the quote.
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
}

/// A process created suspended by [`DebugBackend::create_suspended`](crate::backend::DebugBackend::create_suspended)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchedProcess
{
    /// Id of the new process
    pub pid: ProcessId,
    /// Id of its (suspended) initial thread
    pub tid: ThreadId,
    /// Process handle
    pub process: Handle,
    /// Handle of the initial thread
    pub thread: Handle,
}
