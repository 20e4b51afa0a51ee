use crate::command::{CommandFactory, ExecutableCommand, ExitCode};
use crate::redirect;
use crate::session::{PromptMode, Session};
use crate::source::source_script;
use crate::vm::exec::HostStreams;
use crate::vm::partition::{HeapProbe, ProbeParams, probe_largest_chunk};
use crate::vm::{self, SpawnContext};
use anyhow::{Context, Result};
use argh::{EarlyExit, FromArgs};
use regex::RegexBuilder;
use std::env;
use std::fs;
use std::io::BufRead;
use std::io::BufReader;
use std::io::{Read, Write};
use std::path::PathBuf;

/// Built-in commands known to the shell at compile time.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and executed
/// directly in-process. Redirections were already applied at the descriptor
/// level by the time a builtin runs.
pub(crate) trait BuiltinCommand: Sized + FromArgs {
    /// Canonical name of the command, e.g. "echo" or "spawn".
    fn name() -> &'static str;

    /// Alternative names answering to the same command (e.g. `.` for
    /// `source`).
    fn aliases() -> &'static [&'static str] {
        &[]
    }

    /// Executes the command using provided IO streams and session.
    ///
    /// Return value follows shell conventions: 0 for success, non-zero for
    /// error.
    fn execute(
        self,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        session: &mut Session,
    ) -> Result<ExitCode>;
}

impl<T: BuiltinCommand> ExecutableCommand for T {
    fn execute(
        self: Box<Self>,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        session: &mut Session,
    ) -> Result<ExitCode> {
        match T::execute(*self, stdin, stdout, session) {
            Ok(x) => Ok(x),
            Err(e) => {
                // Errors go to the (possibly redirected) error stream.
                eprintln!("{}: {:#}", T::name(), e);
                Ok(1)
            }
        }
    }
}

struct InvalidArgs {
    output: String,
    is_error: bool,
}

impl ExecutableCommand for InvalidArgs {
    fn execute(
        self: Box<Self>,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        stdout.write_all(self.output.as_bytes())?;
        Ok(if self.is_error { 1 } else { 0 })
    }
}

/// Factory allows creating instances of ExecutableCommand for one builtin.
pub(crate) struct Factory<T> {
    _phantom: std::marker::PhantomData<T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<T: BuiltinCommand + 'static> CommandFactory for Factory<T> {
    fn try_create(
        &self,
        _session: &Session,
        name: &str,
        args: &[&str],
    ) -> Option<Box<dyn ExecutableCommand>> {
        if name == T::name() || T::aliases().contains(&name) {
            Some(match T::from_args(&[name], args) {
                Ok(cmd) => Box::new(cmd),
                Err(EarlyExit { output, status }) => Box::new(InvalidArgs {
                    output,
                    is_error: status.is_err(),
                }),
            })
        } else {
            None
        }
    }
}

#[derive(FromArgs)]
/// Print the current working directory to standard output.
pub struct Pwd {}

impl BuiltinCommand for Pwd {
    fn name() -> &'static str {
        "pwd"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        session: &mut Session,
    ) -> Result<ExitCode> {
        writeln!(stdout, "{}", session.current_dir.to_string_lossy())?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Change the current working directory.
/// If no target is provided, changes to the directory specified by the HOME variable.
pub struct Cd {
    #[argh(positional)]
    /// directory to switch to; absolute or relative to the current directory. Defaults to $HOME when omitted.
    pub target: Option<String>,
}

impl BuiltinCommand for Cd {
    fn name() -> &'static str {
        "cd"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        session: &mut Session,
    ) -> Result<ExitCode> {
        let target = match &self.target {
            Some(t) if !t.is_empty() => PathBuf::from(t),
            _ => {
                if let Some(home) = session.get_var("HOME") {
                    PathBuf::from(home)
                } else {
                    return Err(anyhow::anyhow!("no target and HOME not set"));
                }
            }
        };

        let new_dir = if target.is_absolute() {
            target
        } else {
            session.current_dir.join(target)
        };

        let canonical = fs::canonicalize(&new_dir)
            .with_context(|| format!("can't canonicalize {}", new_dir.display()))?;

        env::set_current_dir(&canonical)
            .with_context(|| format!("can't chdir to {}", canonical.display()))?;
        session.current_dir = canonical;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// End the session, optionally with an explicit status.
pub struct Exit {
    #[argh(positional)]
    /// status to report; defaults to 0.
    pub status: Option<i32>,
}

impl BuiltinCommand for Exit {
    fn name() -> &'static str {
        "exit"
    }

    fn aliases() -> &'static [&'static str] {
        &["quit"]
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        session: &mut Session,
    ) -> Result<ExitCode> {
        eprintln!("exit");
        session.should_exit = true;
        session.exit_status = self.status.unwrap_or(0);
        Ok(session.exit_status)
    }
}

#[derive(FromArgs)]
/// write the arguments to standard output, separated by spaces.
/// by default, a trailing newline is printed.
pub struct Echo {
    #[argh(switch, short = 'n')]
    /// do not output the trailing newline.
    pub no_newline: bool,

    #[argh(positional, greedy)]
    /// values to print as-is, separated by spaces.
    pub args: Vec<String>,
}

impl BuiltinCommand for Echo {
    fn name() -> &'static str {
        "echo"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        let s = self.args.join(" ");
        if self.no_newline {
            write!(stdout, "{}", s)?;
        } else {
            writeln!(stdout, "{}", s)?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// print file(s) to stdout
pub struct Cat {
    #[argh(positional, greedy)]
    pub files: Vec<String>,
}

impl BuiltinCommand for Cat {
    fn name() -> &'static str {
        "cat"
    }

    fn execute(
        self,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        if self.files.is_empty() {
            let mut buf = Vec::new();
            stdin.read_to_end(&mut buf)?;
            stdout.write_all(&buf)?;
            return Ok(0);
        }
        for fname in self.files {
            let mut f = fs::File::open(&fname)
                .map_err(|e| anyhow::anyhow!("{}: {}", fname, e))?;
            std::io::copy(&mut f, stdout)?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// count lines, words and bytes
pub struct Wc {
    #[argh(positional, greedy)]
    pub files: Vec<String>,
}

impl BuiltinCommand for Wc {
    fn name() -> &'static str {
        "wc"
    }

    fn execute(
        self,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        if self.files.is_empty() {
            let mut buf = String::new();
            stdin.read_to_string(&mut buf)?;
            let lines = buf.lines().count();
            let words = buf.split_whitespace().count();
            let bytes = buf.len();
            writeln!(stdout, "{} {} {}", lines, words, bytes)?;
            return Ok(0);
        }
        for fname in self.files {
            let s = fs::read_to_string(&fname)
                .map_err(|e| anyhow::anyhow!("{}: {}", fname, e))?;
            let lines = s.lines().count();
            let words = s.split_whitespace().count();
            writeln!(stdout, "{} {} {} {}", lines, words, s.len(), fname)?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// print lines matching a pattern
pub struct Grep {
    #[argh(positional)]
    /// the pattern to search for (a regular expression)
    pub pattern: String,

    #[argh(positional, greedy)]
    /// files to search. If none provided, reads from stdin.
    pub files: Vec<String>,

    #[argh(switch, short = 'w')]
    /// match only whole words
    pub word_regexp: bool,

    #[argh(switch, short = 'i')]
    /// ignore case distinctions
    pub ignore_case: bool,
}

impl Grep {
    fn scan(
        &self,
        reader: &mut dyn Read,
        stdout: &mut dyn Write,
        file_name: Option<&str>,
        re: &regex::Regex,
    ) -> Result<ExitCode> {
        let reader = BufReader::new(reader);
        let prefix = file_name.map(|n| format!("{}:", n)).unwrap_or_default();
        for line in reader.lines() {
            let line = line?;
            if re.is_match(&line) {
                writeln!(stdout, "{}{}", prefix, line)?;
            }
        }
        Ok(0)
    }
}

impl BuiltinCommand for Grep {
    fn name() -> &'static str {
        "grep"
    }

    fn execute(
        self,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        let pattern = if self.word_regexp {
            format!(r"\b({})\b", self.pattern)
        } else {
            self.pattern.clone()
        };

        let re = RegexBuilder::new(&pattern)
            .case_insensitive(self.ignore_case)
            .build()
            .with_context(|| format!("invalid regex pattern: {}", pattern))?;

        if self.files.is_empty() {
            return self.scan(stdin, stdout, None, &re);
        }
        let mut final_code = 0;
        for file_name in &self.files {
            match fs::File::open(file_name) {
                Ok(mut f) => {
                    self.scan(&mut f, stdout, Some(file_name), &re)?;
                }
                Err(e) => {
                    writeln!(stdout, "grep: {}: {}", file_name, e)?;
                    final_code = 1;
                }
            }
        }
        Ok(final_code)
    }
}

#[derive(FromArgs)]
/// list a directory: inode, size, type and name per entry
pub struct Ls {
    #[argh(positional)]
    /// directory to list; defaults to the current one.
    pub dir: Option<String>,
}

impl BuiltinCommand for Ls {
    fn name() -> &'static str {
        "ls"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        use std::os::unix::fs::MetadataExt;
        let dir = self.dir.as_deref().unwrap_or(".");
        let mut entries: Vec<_> = fs::read_dir(dir)
            .with_context(|| format!("opening '{}'", dir))?
            .collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let meta = entry.metadata()?;
            let kind = if meta.is_dir() {
                'd'
            } else if meta.file_type().is_symlink() {
                'l'
            } else {
                ' '
            };
            writeln!(
                stdout,
                "{:>9}\t{:>8}\t{}\t{}",
                meta.ino(),
                meta.len(),
                kind,
                entry.file_name().to_string_lossy()
            )?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// create directories
pub struct Mkdir {
    #[argh(switch, short = 'p')]
    /// create parent directories as needed
    pub parents: bool,

    #[argh(positional, greedy)]
    pub dirs: Vec<String>,
}

impl BuiltinCommand for Mkdir {
    fn name() -> &'static str {
        "mkdir"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        if self.dirs.is_empty() {
            return Err(anyhow::anyhow!("missing directory name"));
        }
        for dir in &self.dirs {
            if self.parents {
                fs::create_dir_all(dir).with_context(|| format!("creating '{}'", dir))?;
            } else {
                fs::create_dir(dir).with_context(|| format!("creating '{}'", dir))?;
            }
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// delete (unlink) files
pub struct Rm {
    #[argh(positional, greedy)]
    pub files: Vec<String>,
}

impl BuiltinCommand for Rm {
    fn name() -> &'static str {
        "rm"
    }

    fn aliases() -> &'static [&'static str] {
        &["unlink"]
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        let mut status = 0;
        for file in &self.files {
            if let Err(e) = fs::remove_file(file) {
                eprintln!("rm: removing '{}' failed: {}", file, e);
                status = 1;
            }
        }
        Ok(status)
    }
}

#[derive(FromArgs)]
/// create empty files, or update their timestamps
pub struct Touch {
    #[argh(positional, greedy)]
    pub files: Vec<String>,
}

impl BuiltinCommand for Touch {
    fn name() -> &'static str {
        "touch"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        let mut status = 0;
        for file in &self.files {
            let res = fs::OpenOptions::new().create(true).append(true).open(file);
            if let Err(e) = res {
                eprintln!("touch: '{}': {}", file, e);
                status += 1;
            }
        }
        Ok(status)
    }
}

#[derive(FromArgs)]
/// show file metadata
pub struct Stat {
    #[argh(positional, greedy)]
    pub files: Vec<String>,
}

impl BuiltinCommand for Stat {
    fn name() -> &'static str {
        "stat"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        use std::os::unix::fs::MetadataExt;
        let mut status = 0;
        for file in &self.files {
            match fs::metadata(file) {
                Ok(m) => writeln!(
                    stdout,
                    "stat: dev={}, ino={}, mode={:#o}, nlink={}, size={}",
                    m.dev(),
                    m.ino(),
                    m.mode(),
                    m.nlink(),
                    m.len()
                )?,
                Err(e) => {
                    eprintln!("stat: '{}': {}", file, e);
                    status = 1;
                }
            }
        }
        Ok(status)
    }
}

#[derive(FromArgs)]
/// Assign/change a session variable's value
pub struct Setenv {
    #[argh(positional)]
    pub name: String,
    #[argh(positional)]
    pub value: String,
}

impl BuiltinCommand for Setenv {
    fn name() -> &'static str {
        "setenv"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        session: &mut Session,
    ) -> Result<ExitCode> {
        session.set_var(self.name, self.value);
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Delete a variable from the session environment
pub struct Unsetenv {
    #[argh(positional)]
    pub name: String,
}

impl BuiltinCommand for Unsetenv {
    fn name() -> &'static str {
        "unsetenv"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        session: &mut Session,
    ) -> Result<ExitCode> {
        session.unset_var(&self.name);
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Print one session variable
pub struct Getenv {
    #[argh(positional)]
    pub name: String,
}

impl BuiltinCommand for Getenv {
    fn name() -> &'static str {
        "getenv"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        session: &mut Session,
    ) -> Result<ExitCode> {
        if let Some(v) = session.get_var(&self.name) {
            writeln!(stdout, "{}", v)?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Print the whole session environment
pub struct EnvList {}

impl BuiltinCommand for EnvList {
    fn name() -> &'static str {
        "env"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        session: &mut Session,
    ) -> Result<ExitCode> {
        for pair in session.environ() {
            writeln!(stdout, "{}", pair)?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Select the prompt mode: 0 none, 1 fixed, 2 working directory
pub struct Prompt {
    #[argh(positional)]
    pub mode: Option<i64>,
}

impl BuiltinCommand for Prompt {
    fn name() -> &'static str {
        "prompt"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        session: &mut Session,
    ) -> Result<ExitCode> {
        match self.mode {
            Some(code) => session.prompt = PromptMode::from_code(code),
            None => writeln!(stdout, "Usage: prompt <mode>\n\t0:no prompt; 1:fixed; 2:cwd")?,
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Report the largest memory block obtainable right now
pub struct Free {}

impl BuiltinCommand for Free {
    fn name() -> &'static str {
        "free"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        let measured = probe_largest_chunk(&mut HeapProbe, &ProbeParams::for_report());
        let (scaled, prefix) = human_size(measured);
        let exp = if measured > 0 { measured.ilog2() } else { 0 };
        writeln!(stdout, "Free (max. alloc): {:.2}{}B (2^{})", scaled, prefix, exp)?;
        Ok(0)
    }
}

fn human_size(bytes: u64) -> (f64, &'static str) {
    let b = bytes as f64;
    if b > 1e12 {
        (b / 1e12, "T")
    } else if b > 1e9 {
        (b / 1e9, "G")
    } else if b > 1e6 {
        (b / 1e6, "M")
    } else if b > 1e3 {
        (b / 1e3, "K")
    } else {
        (b, "")
    }
}

#[derive(FromArgs)]
/// Duplicate descriptor OLD onto NEW
pub struct Dup2 {
    #[argh(positional)]
    pub old: i32,
    #[argh(positional)]
    pub new: i32,
    #[argh(switch, short = 's')]
    /// do not report the result
    pub silent: bool,
}

impl BuiltinCommand for Dup2 {
    fn name() -> &'static str {
        "dup2"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        match redirect::dup2(self.old, self.new) {
            Ok(()) => {
                if !self.silent {
                    eprintln!("dup2({}, {}) = {}", self.old, self.new, self.new);
                }
                Ok(0)
            }
            Err(e) => {
                if !self.silent {
                    eprintln!("dup2({}, {}): {}", self.old, self.new, e);
                }
                Ok(1)
            }
        }
    }
}

#[derive(FromArgs)]
/// Close an open descriptor
pub struct CloseFd {
    #[argh(positional)]
    pub fd: i32,
    #[argh(switch, short = 's')]
    /// do not report errors
    pub silent: bool,
}

impl BuiltinCommand for CloseFd {
    fn name() -> &'static str {
        "close"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        match redirect::close(self.fd) {
            Ok(()) => Ok(0),
            Err(e) => {
                if !self.silent {
                    eprintln!("close({}): {}", self.fd, e);
                }
                Ok(1)
            }
        }
    }
}

#[derive(FromArgs)]
/// Validate, load and run a program image, waiting for its status
pub struct Spawn {
    #[argh(positional)]
    /// the candidate binary; its execute bit is the only gate before validation.
    pub file: String,

    #[argh(positional, greedy)]
    /// arguments passed to the child through its argument block.
    pub args: Vec<String>,
}

impl BuiltinCommand for Spawn {
    fn name() -> &'static str {
        "spawn"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        session: &mut Session,
    ) -> Result<ExitCode> {
        let mut io = HostStreams;
        match vm::spawn(&self.file, &self.args, session, &SpawnContext::root(), &mut io) {
            Ok(status) => Ok(status),
            Err(e) => {
                eprintln!("spawn: {}", e);
                Ok(-1)
            }
        }
    }
}

#[derive(FromArgs)]
/// Run a script of statements on this interpreter, without nesting
pub struct Source {
    #[argh(positional)]
    pub file: String,
}

impl BuiltinCommand for Source {
    fn name() -> &'static str {
        "source"
    }

    fn aliases() -> &'static [&'static str] {
        &["."]
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        session: &mut Session,
    ) -> Result<ExitCode> {
        source_script(&self.file, session)
    }
}

#[derive(FromArgs)]
/// Show available commands and redirections
pub struct Help {}

impl BuiltinCommand for Help {
    fn name() -> &'static str {
        "help"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        writeln!(stdout, "{}", HELP_TEXT)?;
        Ok(0)
    }
}

pub(crate) const HELP_TEXT: &str = "\
vmsh: a shell for single-address-space program images
File system commands:
   cat cd close dup2 echo env exit(=quit) free getenv grep help ls
   mkdir prompt pwd rm(=unlink) setenv source(=.) spawn stat touch
   unsetenv wc
Available redirections:
   '> file'  '>> file'  '2> file'  '< file'  '<< TOKEN'
Engine commands:
   query rule";

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    fn lock_current_dir() -> MutexGuard<'static, ()> {
        static MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
        MUTEX.get_or_init(|| Mutex::new(())).lock().unwrap()
    }

    fn quiet_session() -> Session {
        Session::new()
    }

    #[test]
    fn test_pwd_prints_current_dir() {
        let _lock = lock_current_dir();
        let mut session = quiet_session();
        let cur = session.current_dir.clone();

        let mut out = Vec::new();
        let cmd = Pwd {};
        cmd.execute(&mut Cursor::new(Vec::new()), &mut out, &mut session)
            .unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!("{}\n", cur.to_string_lossy())
        );
    }

    #[test]
    fn test_echo_with_and_without_newline() {
        let mut session = quiet_session();

        let mut out1 = Vec::new();
        let echo1 = Echo {
            no_newline: false,
            args: vec!["hello".to_string(), "world".to_string()],
        };
        echo1
            .execute(&mut Cursor::new(Vec::new()), &mut out1, &mut session)
            .unwrap();
        assert_eq!(String::from_utf8(out1).unwrap(), "hello world\n");

        let mut out2 = Vec::new();
        let echo2 = Echo {
            no_newline: true,
            args: vec!["foo".to_string(), "bar".to_string()],
        };
        echo2
            .execute(&mut Cursor::new(Vec::new()), &mut out2, &mut session)
            .unwrap();
        assert_eq!(String::from_utf8(out2).unwrap(), "foo bar");
    }

    #[test]
    fn test_cd_to_absolute_path_and_back() {
        let _lock = lock_current_dir();
        let orig = env::current_dir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let canonical = fs::canonicalize(temp.path()).unwrap();

        let mut session = quiet_session();
        let cmd = Cd {
            target: Some(canonical.to_string_lossy().into_owned()),
        };
        cmd.execute(&mut Cursor::new(Vec::new()), &mut Vec::new(), &mut session)
            .unwrap();

        assert_eq!(session.current_dir, canonical);
        assert_eq!(fs::canonicalize(env::current_dir().unwrap()).unwrap(), canonical);

        env::set_current_dir(orig).unwrap();
    }

    #[test]
    fn test_cd_nonexistent_path_errors() {
        let _lock = lock_current_dir();
        let orig = env::current_dir().unwrap();
        let mut session = quiet_session();

        let cmd = Cd {
            target: Some(format!("no_such_dir_{}", std::process::id())),
        };
        let res = cmd.execute(&mut Cursor::new(Vec::new()), &mut Vec::new(), &mut session);
        assert!(res.is_err());
        assert_eq!(env::current_dir().unwrap(), orig);
    }

    #[test]
    fn test_cat_reads_file_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat.txt");
        fs::write(&path, "hello\nworld\n").unwrap();

        let mut session = quiet_session();
        let mut out = Vec::new();
        let cat = Cat {
            files: vec![path.to_string_lossy().into_owned()],
        };
        cat.execute(&mut Cursor::new(Vec::new()), &mut out, &mut session)
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "hello\nworld\n");

        let mut out = Vec::new();
        let cat = Cat { files: Vec::new() };
        cat.execute(&mut Cursor::new(b"from stdin\n".to_vec()), &mut out, &mut session)
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "from stdin\n");
    }

    #[test]
    fn test_wc_counts_stdin() {
        let mut session = quiet_session();
        let mut out = Vec::new();
        let wc = Wc { files: Vec::new() };
        wc.execute(&mut Cursor::new(b"a b\nc\n".to_vec()), &mut out, &mut session)
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "2 3 6\n");
    }

    #[test]
    fn test_grep_matches_lines() {
        let mut session = quiet_session();
        let mut out = Vec::new();
        let grep = Grep {
            pattern: "^b".to_string(),
            files: Vec::new(),
            word_regexp: false,
            ignore_case: false,
        };
        grep.execute(
            &mut Cursor::new(b"alpha\nbeta\ngamma\nbravo\n".to_vec()),
            &mut out,
            &mut session,
        )
        .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "beta\nbravo\n");
    }

    #[test]
    fn test_setenv_getenv_roundtrip_through_factory() {
        let mut session = quiet_session();
        let factory = Factory::<Setenv>::default();
        let cmd = factory.try_create(&session, "setenv", &["K", "V"]).unwrap();
        cmd.execute(&mut Cursor::new(Vec::new()), &mut Vec::new(), &mut session)
            .unwrap();
        assert_eq!(session.get_var("K"), Some("V".to_string()));

        let factory = Factory::<Getenv>::default();
        let cmd = factory.try_create(&session, "getenv", &["K"]).unwrap();
        let mut out = Vec::new();
        cmd.execute(&mut Cursor::new(Vec::new()), &mut out, &mut session)
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "V\n");
    }

    #[test]
    fn test_exit_sets_session_flags() {
        let mut session = quiet_session();
        let cmd = Exit { status: Some(3) };
        cmd.execute(&mut Cursor::new(Vec::new()), &mut Vec::new(), &mut session)
            .unwrap();
        assert!(session.should_exit);
        assert_eq!(session.exit_status, 3);
    }

    #[test]
    fn test_factory_honors_aliases() {
        let session = quiet_session();
        let factory = Factory::<Exit>::default();
        assert!(factory.try_create(&session, "exit", &[]).is_some());
        assert!(factory.try_create(&session, "quit", &[]).is_some());
        assert!(factory.try_create(&session, "bye", &[]).is_none());

        let factory = Factory::<Source>::default();
        assert!(factory.try_create(&session, ".", &["x"]).is_some());
    }

    #[test]
    fn test_invalid_args_reports_help_not_error() {
        let mut session = quiet_session();
        let factory = Factory::<Echo>::default();
        // An unknown switch produces argh's error text with status 1.
        let cmd = factory.try_create(&session, "echo", &["--definitely-not-a-flag"]).unwrap();
        let mut out = Vec::new();
        let code = cmd
            .execute(&mut Cursor::new(Vec::new()), &mut out, &mut session)
            .unwrap();
        assert_eq!(code, 1);
        assert!(!out.is_empty());
    }

    #[test]
    fn test_prompt_mode_switch() {
        let mut session = quiet_session();
        let cmd = Prompt { mode: Some(0) };
        cmd.execute(&mut Cursor::new(Vec::new()), &mut Vec::new(), &mut session)
            .unwrap();
        assert_eq!(session.prompt, PromptMode::Silent);
    }

    #[test]
    fn test_free_reports_a_size() {
        let mut session = quiet_session();
        let mut out = Vec::new();
        let cmd = Free {};
        cmd.execute(&mut Cursor::new(Vec::new()), &mut out, &mut session)
            .unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.starts_with("Free (max. alloc):"));
    }

    #[test]
    fn test_human_size_prefixes() {
        assert_eq!(human_size(512).1, "");
        assert_eq!(human_size(20_000).1, "K");
        assert_eq!(human_size(5_000_000).1, "M");
        assert_eq!(human_size(7_000_000_000).1, "G");
    }

    #[test]
    fn test_mkdir_rm_touch_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("a/b");
        let mut session = quiet_session();

        let cmd = Mkdir {
            parents: true,
            dirs: vec![sub.to_string_lossy().into_owned()],
        };
        let code = cmd
            .execute(&mut Cursor::new(Vec::new()), &mut Vec::new(), &mut session)
            .unwrap();
        assert_eq!(code, 0);
        assert!(sub.is_dir());

        let file = sub.join("f.txt");
        let cmd = Touch {
            files: vec![file.to_string_lossy().into_owned()],
        };
        assert_eq!(
            cmd.execute(&mut Cursor::new(Vec::new()), &mut Vec::new(), &mut session)
                .unwrap(),
            0
        );
        assert!(file.is_file());

        let cmd = Rm {
            files: vec![file.to_string_lossy().into_owned()],
        };
        assert_eq!(
            cmd.execute(&mut Cursor::new(Vec::new()), &mut Vec::new(), &mut session)
                .unwrap(),
            0
        );
        assert!(!file.exists());
    }
}
