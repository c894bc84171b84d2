//! Daemonizing spawn for process-group leaders.
//!
//! Leaders run detached from the component: an intermediate child calls
//! `setsid`, forks the leader, reports the leader pid back through a pipe,
//! and exits. The component reaps only the intermediate directly; leaders
//! reparent to the component once it registers as a child subreaper, and
//! [`reap_exited`] collects them as they finish.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::errno::Errno;
use nix::libc;
use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, execve, fork, pipe, setgid, setsid, setuid};
use nix::unistd::{ForkResult, Gid, Pid, Uid, User};
use tracing::{debug, warn};

use super::ProcessGroup;
use crate::error::{Result, TorusError};

/// Everything a leader needs, assembled before any fork.
///
/// The child side of a fork in a threaded program must not allocate, so
/// argv, envp, and the redirection fds are all prepared here in the
/// parent. Stdio files are opened with the component's privileges; the
/// inherited descriptors stay usable after the leader drops to the
/// target user.
pub struct LaunchPlan {
    exe: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    stdin: File,
    stdout: File,
    stderr: File,
    uid: Uid,
    gid: Gid,
}

impl LaunchPlan {
    /// Assemble the launcher invocation for one process group.
    ///
    /// The launcher is invoked as `<basename> -np <size> -partition
    /// <location[0]> -mode <mode> -cwd <cwd> -exe <executable>`, with
    /// `-args`, `-env`, and `-kernel_options` appended when present.
    /// Verbatim pass-through arguments replace the whole constructed
    /// argument list.
    pub fn build(pg: &ProcessGroup, launcher: &Path, uid: Uid, gid: Gid) -> Result<Self> {
        let partition = pg
            .location
            .first()
            .ok_or_else(|| TorusError::Creation("no location".to_string()))?;
        let basename = launcher
            .file_name()
            .unwrap_or(launcher.as_os_str())
            .to_string_lossy()
            .into_owned();

        let mut argv = vec![basename];
        if let Some(pass) = &pg.true_launch_args {
            argv.extend(pass.iter().cloned());
        } else {
            argv.push("-np".to_string());
            argv.push(pg.size.to_string());
            argv.push("-partition".to_string());
            argv.push(partition.clone());
            argv.push("-mode".to_string());
            argv.push(pg.mode.clone());
            argv.push("-cwd".to_string());
            argv.push(pg.cwd.clone());
            argv.push("-exe".to_string());
            argv.push(pg.executable.clone());
            if !pg.args.is_empty() {
                argv.push("-args".to_string());
                argv.push(pg.args.join(" "));
            }
            if !pg.env.is_empty() {
                argv.push("-env".to_string());
                let pairs: Vec<String> =
                    pg.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                argv.push(pairs.join(" "));
            }
            if let Some(options) = &pg.kernel_options {
                argv.push("-kernel_options".to_string());
                argv.push(options.clone());
            }
        }

        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        env.extend(pg.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert("TORUS_JOBID".to_string(), pg.id.to_string());
        env.insert("TORUS_PARTITION".to_string(), partition.clone());
        env.insert("TORUS_USER".to_string(), pg.user.clone());
        env.insert("TORUS_JOBSIZE".to_string(), pg.size.to_string());

        let stdin = match &pg.stdin {
            Some(path) => File::open(path).map_err(|e| {
                TorusError::Creation(format!("cannot open stdin file {}: {}", path, e))
            })?,
            None => File::open("/dev/null")?,
        };
        let stdout = open_output(pg.stdout.as_deref(), "stdout")?;
        let stderr = open_output(pg.stderr.as_deref(), "stderr")?;

        Ok(Self {
            exe: cstr(launcher.to_string_lossy().into_owned())?,
            argv: argv.into_iter().map(cstr).collect::<Result<Vec<_>>>()?,
            envp: env
                .iter()
                .map(|(k, v)| cstr(format!("{}={}", k, v)))
                .collect::<Result<Vec<_>>>()?,
            stdin,
            stdout,
            stderr,
            uid,
            gid,
        })
    }
}

fn cstr(s: String) -> Result<CString> {
    CString::new(s)
        .map_err(|_| TorusError::Creation("embedded NUL in launch arguments".to_string()))
}

/// Open a leader output file in append mode, created as 0600.
///
/// An unopenable path is not fatal: the failure is logged and the stream
/// goes to /dev/null instead.
fn open_output(path: Option<&str>, stream: &str) -> Result<File> {
    if let Some(path) = path {
        match OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(path)
        {
            Ok(file) => return Ok(file),
            Err(e) => warn!(path, stream, error = %e, "cannot open output file, output will be lost"),
        }
    }
    Ok(OpenOptions::new().write(true).open("/dev/null")?)
}

/// Look up the uid and gid for a user name before any fork happens.
pub fn resolve_user(name: &str) -> Result<(Uid, Gid)> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok((user.uid, user.gid)),
        Ok(None) => Err(TorusError::Creation(format!(
            "error getting uid/gid for {}",
            name
        ))),
        Err(e) => Err(TorusError::Creation(format!(
            "error getting uid/gid for {}: {}",
            name, e
        ))),
    }
}

/// Mark this process as a child subreaper.
///
/// Leaders are grandchildren; without this they would reparent to pid 1
/// on daemonization and their exit statuses would be lost to us.
pub fn install_subreaper() -> Result<()> {
    prctl::set_child_subreaper(true)
        .map_err(|e| TorusError::Spawn(format!("cannot become child subreaper: {}", e)))
}

/// Double-fork the leader and return its pid.
///
/// The intermediate child detaches with `setsid`, forks the leader,
/// writes the leader pid through a pipe, and exits; this function reaps
/// the intermediate synchronously so only leaders are left for
/// [`reap_exited`] to find.
pub fn spawn(plan: &LaunchPlan) -> Result<i32> {
    let (pipe_r, pipe_w) = pipe().map_err(|e| TorusError::Spawn(format!("pipe: {}", e)))?;
    // SAFETY: both child branches restrict themselves to async-signal-safe
    // calls until exec or _exit; all allocation happened in the plan.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            drop(pipe_w);
            let mut head = [0u8; 4];
            let mut reader = File::from(pipe_r);
            reader.read_exact(&mut head).map_err(|e| {
                TorusError::Spawn(format!("no leader pid from intermediate process: {}", e))
            })?;
            match waitpid(child, None) {
                Ok(status) => {
                    debug!(pid = child.as_raw(), ?status, "intermediate process exited")
                }
                Err(e) => {
                    warn!(pid = child.as_raw(), error = %e, "waitpid on intermediate process failed")
                }
            }
            Ok(i32::from_ne_bytes(head))
        }
        Ok(ForkResult::Child) => {
            let _ = close(pipe_r.as_raw_fd());
            let _ = setsid();
            match unsafe { fork() } {
                Ok(ForkResult::Parent { child }) => {
                    let mut writer = File::from(pipe_w);
                    let code = match writer.write_all(&child.as_raw().to_ne_bytes()) {
                        Ok(()) => 0,
                        Err(_) => 1,
                    };
                    unsafe { libc::_exit(code) }
                }
                Ok(ForkResult::Child) => leader_exec(plan, pipe_w.as_raw_fd()),
                Err(_) => unsafe { libc::_exit(1) },
            }
        }
        Err(e) => Err(TorusError::Spawn(format!("fork: {}", e))),
    }
}

/// Leader side: redirect stdio, drop privileges, exec the launcher.
///
/// Exits 1 on any setup failure and 127 when exec itself fails, so a
/// launch that never ran is distinguishable from the launcher's own
/// statuses.
fn leader_exec(plan: &LaunchPlan, pipe_w: i32) -> ! {
    let _ = close(pipe_w);
    if dup2(plan.stdin.as_raw_fd(), 0).is_err()
        || dup2(plan.stdout.as_raw_fd(), 1).is_err()
        || dup2(plan.stderr.as_raw_fd(), 2).is_err()
    {
        unsafe { libc::_exit(1) }
    }
    if setgid(plan.gid).is_err() || setuid(plan.uid).is_err() {
        unsafe { libc::_exit(1) }
    }
    let _ = execve(&plan.exe, &plan.argv, &plan.envp);
    unsafe { libc::_exit(127) }
}

/// One child collected by the reaper.
#[derive(Debug, Clone, Copy)]
pub struct ReapedChild {
    pub pid: i32,
    pub status: i32,
}

/// Collect every exited child without blocking.
///
/// Signal-terminated children report `128 + signo`, shell style. Pids
/// the caller does not recognize are its problem; this just drains the
/// kernel's list.
pub fn reap_exited() -> Vec<ReapedChild> {
    let mut reaped = Vec::new();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, status)) => reaped.push(ReapedChild {
                pid: pid.as_raw(),
                status,
            }),
            Ok(WaitStatus::Signaled(pid, signal, _)) => reaped.push(ReapedChild {
                pid: pid.as_raw(),
                status: 128 + signal as i32,
            }),
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                warn!(error = %e, "waitpid failed while reaping");
                break;
            }
        }
    }
    reaped
}

/// Parse a signal name like `SIGTERM` or `term`.
pub fn parse_signal(name: &str) -> Option<Signal> {
    let upper = name.to_ascii_uppercase();
    let short = upper.strip_prefix("SIG").unwrap_or(&upper);
    let signal = match short {
        "HUP" => Signal::SIGHUP,
        "INT" => Signal::SIGINT,
        "QUIT" => Signal::SIGQUIT,
        "ABRT" => Signal::SIGABRT,
        "KILL" => Signal::SIGKILL,
        "USR1" => Signal::SIGUSR1,
        "USR2" => Signal::SIGUSR2,
        "TERM" => Signal::SIGTERM,
        "CONT" => Signal::SIGCONT,
        "STOP" => Signal::SIGSTOP,
        "TSTP" => Signal::SIGTSTP,
        _ => return None,
    };
    Some(signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SpawnState;

    fn group() -> ProcessGroup {
        ProcessGroup {
            id: 7,
            jobid: None,
            user: "alice".to_string(),
            location: vec!["P64".to_string()],
            size: 64,
            cwd: "/tmp".to_string(),
            executable: "/bin/hostname".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            mode: "co".to_string(),
            kernel_options: None,
            true_launch_args: None,
            stdin: None,
            stdout: None,
            stderr: None,
            head_pid: None,
            exit_status: None,
            spawn_state: SpawnState::Spawning,
        }
    }

    fn argv_strings(plan: &LaunchPlan) -> Vec<String> {
        plan.argv
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn argv_follows_launcher_convention() {
        let plan = LaunchPlan::build(
            &group(),
            Path::new("/usr/bin/mpirun"),
            Uid::current(),
            Gid::current(),
        )
        .expect("build");
        let argv = argv_strings(&plan);
        assert_eq!(argv[0], "mpirun");
        let np = argv.iter().position(|a| a == "-np").expect("-np");
        assert_eq!(argv[np + 1], "64");
        let part = argv.iter().position(|a| a == "-partition").expect("-partition");
        assert_eq!(argv[part + 1], "P64");
        let exe = argv.iter().position(|a| a == "-exe").expect("-exe");
        assert_eq!(argv[exe + 1], "/bin/hostname");
        assert!(!argv.iter().any(|a| a == "-args"));
        assert!(!argv.iter().any(|a| a == "-env"));
    }

    #[test]
    fn args_env_and_kernel_options_are_appended() {
        let mut pg = group();
        pg.args = vec!["-v".to_string(), "--fast".to_string()];
        pg.env.insert("A".to_string(), "1".to_string());
        pg.env.insert("B".to_string(), "2".to_string());
        pg.kernel_options = Some("bigmem".to_string());
        let plan = LaunchPlan::build(
            &pg,
            Path::new("/usr/bin/mpirun"),
            Uid::current(),
            Gid::current(),
        )
        .expect("build");
        let argv = argv_strings(&plan);
        let args = argv.iter().position(|a| a == "-args").expect("-args");
        assert_eq!(argv[args + 1], "-v --fast");
        let env = argv.iter().position(|a| a == "-env").expect("-env");
        assert_eq!(argv[env + 1], "A=1 B=2");
        let kopts = argv.iter().position(|a| a == "-kernel_options").unwrap();
        assert_eq!(argv[kopts + 1], "bigmem");
    }

    #[test]
    fn pass_through_args_replace_the_argument_list() {
        let mut pg = group();
        pg.true_launch_args = Some(vec!["-weird".to_string(), "flags".to_string()]);
        let plan = LaunchPlan::build(
            &pg,
            Path::new("/usr/bin/mpirun"),
            Uid::current(),
            Gid::current(),
        )
        .expect("build");
        assert_eq!(argv_strings(&plan), vec!["mpirun", "-weird", "flags"]);
    }

    #[test]
    fn launch_environment_is_exported() {
        let mut pg = group();
        pg.env.insert("JOBVAR".to_string(), "yes".to_string());
        let plan = LaunchPlan::build(
            &pg,
            Path::new("/usr/bin/mpirun"),
            Uid::current(),
            Gid::current(),
        )
        .expect("build");
        let envp: Vec<String> = plan
            .envp
            .iter()
            .map(|e| e.to_string_lossy().into_owned())
            .collect();
        assert!(envp.iter().any(|e| e == "TORUS_PARTITION=P64"));
        assert!(envp.iter().any(|e| e == "TORUS_JOBID=7"));
        assert!(envp.iter().any(|e| e == "JOBVAR=yes"));
    }

    #[test]
    fn embedded_nul_is_a_creation_error() {
        let mut pg = group();
        pg.executable = "/bin/ho\0stname".to_string();
        let result = LaunchPlan::build(
            &pg,
            Path::new("/usr/bin/mpirun"),
            Uid::current(),
            Gid::current(),
        );
        assert!(matches!(result, Err(TorusError::Creation(_))));
    }

    #[test]
    fn missing_stdin_file_is_a_creation_error() {
        let mut pg = group();
        pg.stdin = Some("/no/such/stdin".to_string());
        let result = LaunchPlan::build(
            &pg,
            Path::new("/usr/bin/mpirun"),
            Uid::current(),
            Gid::current(),
        );
        assert!(matches!(result, Err(TorusError::Creation(_))));
    }

    #[test]
    fn unopenable_stdout_falls_back_to_null() {
        let mut pg = group();
        pg.stdout = Some("/no/such/dir/out.log".to_string());
        assert!(LaunchPlan::build(
            &pg,
            Path::new("/usr/bin/mpirun"),
            Uid::current(),
            Gid::current(),
        )
        .is_ok());
    }

    #[test]
    fn signal_names_parse_in_any_dress() {
        assert_eq!(parse_signal("SIGTERM"), Some(Signal::SIGTERM));
        assert_eq!(parse_signal("term"), Some(Signal::SIGTERM));
        assert_eq!(parse_signal("Int"), Some(Signal::SIGINT));
        assert_eq!(parse_signal("SIGWHATEVER"), None);
        assert_eq!(parse_signal(""), None);
    }

    #[test]
    fn unknown_user_fails_resolution() {
        assert!(resolve_user("no-such-user-torus").is_err());
    }
}
