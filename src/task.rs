//! Supervised Task
//!
//! Forks and composes the container's process. Everything between fork
//! and exec runs in the child, in a fixed order:
//!
//! 1. new session, cgroup attach (freezer must hold the task before it
//!    can fork anything)
//! 2. namespaces: enter the parent container's set, or unshare a new one
//! 3. rootfs: binds, pivot, /proc mask, /dev
//! 4. hostname
//! 5. rlimits
//! 6. stdio
//! 7. capability drop, setgroups/setresgid/setresuid
//! 8. execvp
//!
//! Exec failure is reported to the parent through a close-on-exec pipe:
//! the child writes the errno, the parent reads it; a clean exec closes
//! the pipe and the parent reads EOF.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use caps::CapsHashSet;
use log::warn;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{chdir, execvp, fork, pipe2, read, setsid, write, ForkResult, Pid};

use crate::cgroup::Cgroup;
use crate::cred::{drop_bounding_caps, Cred};
use crate::error::{Error, ErrorKind};
use crate::namespace::{set_hostname, unshare_namespaces, NsFlags, NsSet};
use crate::rlimit::{apply_ulimits, Rlimit};
use crate::rootfs::RootFs;

/// Everything the child needs, assembled by the container before fork.
pub struct TaskEnv {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub stdin_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub rootfs: RootFs,
    pub ns_flags: NsFlags,
    pub parent_ns: Option<NsSet>,
    pub cgroups: Vec<Cgroup>,
    pub cred: Cred,
    pub keep_caps: Option<CapsHashSet>,
    pub rlimits: Vec<Rlimit>,
    pub hostname: Option<String>,
    pub root_readonly: bool,
}

/// Split a command string into argv, honouring quotes and backslashes.
pub fn split_command(command: &str) -> Result<Vec<String>, Error> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else if c == '\\' && q == '"' {
                    match chars.next() {
                        Some(next) => current.push(next),
                        None => {
                            return Err(Error::new(
                                ErrorKind::InvalidCommand,
                                "trailing backslash",
                            ))
                        }
                    }
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                '\\' => match chars.next() {
                    Some(next) => {
                        current.push(next);
                        in_word = true;
                    }
                    None => {
                        return Err(Error::new(
                            ErrorKind::InvalidCommand,
                            "trailing backslash",
                        ))
                    }
                },
                c if c.is_whitespace() => {
                    if in_word {
                        argv.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err(Error::new(ErrorKind::InvalidCommand, "unterminated quote"));
    }
    if in_word {
        argv.push(current);
    }

    Ok(argv)
}

/// A running supervised process.
#[derive(Debug)]
pub struct Task {
    pid: Pid,
}

impl Task {
    /// Fork and compose. Returns once the child has either exec'd or
    /// reported a composition error.
    pub fn start(env: TaskEnv) -> Result<Task, Error> {
        if env.argv.is_empty() {
            return Err(Error::new(ErrorKind::InvalidCommand, "empty command"));
        }

        let (err_read, err_write) = pipe2(OFlag::O_CLOEXEC)?;

        // SAFETY: the child only calls async-signal-safe syscalls plus
        // composition helpers that do not touch the parent's locks; on any
        // failure it reports through the pipe and _exits without running
        // destructors.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                drop(err_write);

                let mut buf = [0u8; 4];
                let n = read(err_read.as_raw_fd(), &mut buf).unwrap_or(0);
                if n == 4 {
                    let errno = i32::from_ne_bytes(buf);
                    // The child never exec'd; reap it here.
                    let _ = waitpid(child, None);
                    return Err(Error::with_errno(
                        ErrorKind::InvalidCommand,
                        errno,
                        format!("exec failed: errno {}", errno),
                    ));
                }

                Ok(Task { pid: child })
            }
            ForkResult::Child => {
                let errno = match compose_and_exec(&env) {
                    Err(e) => e.errno.unwrap_or(libc::EINVAL),
                    Ok(never) => match never {},
                };
                let _ = write(&err_write, &errno.to_ne_bytes());
                // SAFETY: _exit is the only safe way out of a forked child.
                unsafe { libc::_exit(libc::EXIT_FAILURE) }
            }
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn kill(&self, signal: Signal) -> Result<(), Error> {
        kill(self.pid, signal)?;
        Ok(())
    }

    /// Non-blocking liveness check; does not reap (the reaper owns wait).
    pub fn is_alive(&self) -> bool {
        kill(self.pid, None).is_ok()
    }

    /// Attach to a pid found in a freezer cgroup during recovery.
    pub fn from_pid(pid: i32) -> Task {
        Task {
            pid: Pid::from_raw(pid),
        }
    }
}

enum Never {}

fn compose_and_exec(env: &TaskEnv) -> Result<Never, Error> {
    setsid()?;

    // The freezer (and every other controller) must own this task before
    // it can spawn anything.
    let self_pid = std::process::id() as i32;
    for cgroup in &env.cgroups {
        cgroup.attach(self_pid)?;
    }

    match &env.parent_ns {
        // A shared child adopts the ancestor's filesystem view wholesale;
        // composing again would double its mounts.
        Some(ns) => ns.enter()?,
        None => {
            unshare_namespaces(env.ns_flags)?;
            if env.ns_flags.contains(NsFlags::MOUNT) {
                env.rootfs
                    .compose(env.hostname.as_deref(), env.root_readonly)?;
            }
        }
    }

    if let Some(hostname) = &env.hostname {
        set_hostname(hostname)?;
    }

    apply_ulimits(&env.rlimits)?;

    if !env.cwd.as_os_str().is_empty() {
        chdir(env.cwd.as_path())?;
    }

    setup_stdio(env)?;

    if let Some(keep) = &env.keep_caps {
        drop_bounding_caps(keep)?;
    }
    env.cred.apply()?;

    let argv: Vec<CString> = env
        .argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<_, _>>()
        .map_err(|_| Error::new(ErrorKind::InvalidCommand, "NUL in argv"))?;

    for (key, value) in &env.env {
        std::env::set_var(key, value);
    }

    // execvp returns only on failure.
    let err = execvp(&argv[0], &argv).unwrap_err();
    Err(Error::with_errno(
        ErrorKind::InvalidCommand,
        err as i32,
        "execvp",
    ))
}

fn setup_stdio(env: &TaskEnv) -> Result<(), Error> {
    let stdin = OpenOptions::new()
        .read(true)
        .open(&env.stdin_path)
        .map_err(|e| stdio_error(&env.stdin_path, e))?;
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&env.stdout_path)
        .map_err(|e| stdio_error(&env.stdout_path, e))?;
    let stderr = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&env.stderr_path)
        .map_err(|e| stdio_error(&env.stderr_path, e))?;

    for (file, target) in [(&stdin, 0), (&stdout, 1), (&stderr, 2)] {
        // SAFETY: both descriptors are valid; dup2 is a plain syscall.
        if unsafe { libc::dup2(file.as_raw_fd(), target) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

fn stdio_error(path: &Path, e: std::io::Error) -> Error {
    Error::with_errno(
        ErrorKind::InvalidPath,
        e.raw_os_error().unwrap_or(0),
        format!("open {}: {}", path.display(), e),
    )
}

// ============================================================================
// Exit Status
// ============================================================================

/// Decode a raw wait status.
pub fn decode_status(status: i32) -> (Option<i32>, Option<i32>) {
    if libc::WIFEXITED(status) {
        (Some(libc::WEXITSTATUS(status)), None)
    } else if libc::WIFSIGNALED(status) {
        (None, Some(libc::WTERMSIG(status)))
    } else {
        (None, None)
    }
}

// ============================================================================
// Stdio Tail Reads
// ============================================================================

/// Read the last `limit` bytes of a stdio file, rotating it down to the
/// cap first when it has overgrown.
pub fn read_tail(path: &Path, limit: u64) -> Result<String, Error> {
    rotate(path, limit)?;

    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let start = size.saturating_sub(limit);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::with_capacity((size - start) as usize);
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

/// Cut a stdio file down to its last `limit` bytes in place.
pub fn rotate(path: &Path, limit: u64) -> Result<(), Error> {
    let Ok(meta) = std::fs::metadata(path) else {
        return Ok(());
    };
    if limit == 0 || meta.len() <= limit {
        return Ok(());
    }

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(meta.len() - limit))?;
    let mut tail = Vec::with_capacity(limit as usize);
    file.read_to_end(&mut tail)?;

    let tmp = path.with_extension("rotate");
    std::fs::write(&tmp, &tail)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        warn!("rotate {}: {}", path.display(), e);
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_split_command_plain() {
        assert_eq!(
            split_command("sleep 1000").unwrap(),
            vec!["sleep", "1000"]
        );
        assert_eq!(split_command("  true  ").unwrap(), vec!["true"]);
        assert!(split_command("").unwrap().is_empty());
    }

    #[test]
    fn test_split_command_quotes() {
        assert_eq!(
            split_command("sh -c 'echo a b'").unwrap(),
            vec!["sh", "-c", "echo a b"]
        );
        assert_eq!(
            split_command("echo \"x 'y' z\"").unwrap(),
            vec!["echo", "x 'y' z"]
        );
        assert_eq!(split_command("echo a\\ b").unwrap(), vec!["echo", "a b"]);
        assert_eq!(split_command("echo ''").unwrap(), vec!["echo", ""]);
    }

    #[test]
    fn test_split_command_rejects() {
        assert!(split_command("echo 'oops").is_err());
        assert!(split_command("echo oops\\").is_err());
    }

    #[test]
    fn test_decode_status() {
        // exit(3)
        assert_eq!(decode_status(3 << 8), (Some(3), None));
        // SIGKILL
        assert_eq!(decode_status(9), (None, Some(9)));
        // exit(0)
        assert_eq!(decode_status(0), (Some(0), None));
    }

    #[test]
    fn test_read_tail_and_rotate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stdout");
        std::fs::write(&path, b"0123456789").unwrap();

        assert_eq!(read_tail(&path, 4).unwrap(), "6789");
        // The rotate pass cut the file down to the cap.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4);

        assert_eq!(read_tail(&path, 100).unwrap(), "6789");
    }

    #[test]
    fn test_read_tail_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(read_tail(&dir.path().join("nope"), 10).is_err());
        // rotate on a missing file is a no-op
        rotate(&dir.path().join("nope"), 10).unwrap();
    }
}
