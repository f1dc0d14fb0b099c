//! OS process signaling. One contract, one backend per platform family.

use std::sync::Arc;

pub trait ProcessControl: Send + Sync + std::fmt::Debug {
    /// Forcefully terminates `pid` (and its process group where supported).
    /// A process that is already gone counts as success.
    fn kill(&self, pid: u32) -> std::io::Result<()>;

    /// Whether `pid` currently exists. Never cached.
    fn is_alive(&self, pid: u32) -> bool;
}

pub fn native() -> Arc<dyn ProcessControl> {
    #[cfg(unix)]
    {
        Arc::new(posix::Posix)
    }
    #[cfg(windows)]
    {
        Arc::new(windows::Windows)
    }
}

#[cfg(unix)]
pub mod posix {
    use super::ProcessControl;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct Posix;

    fn signal(pid: i32, sig: i32) -> std::io::Result<()> {
        // SAFETY: kill(2) has no memory-safety requirements.
        let rc = unsafe { libc::kill(pid, sig) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    fn is_esrch(err: &std::io::Error) -> bool {
        err.raw_os_error() == Some(libc::ESRCH)
    }

    impl ProcessControl for Posix {
        fn kill(&self, pid: u32) -> std::io::Result<()> {
            let Ok(pid) = i32::try_from(pid) else {
                return Ok(());
            };
            if pid <= 0 {
                return Ok(());
            }
            // Children are started as group leaders, so take the whole group
            // first and fall back to the single pid.
            match signal(-pid, libc::SIGKILL) {
                Ok(()) => Ok(()),
                Err(_) => match signal(pid, libc::SIGKILL) {
                    Ok(()) => Ok(()),
                    Err(e) if is_esrch(&e) => Ok(()),
                    Err(e) => Err(e),
                },
            }
        }

        fn is_alive(&self, pid: u32) -> bool {
            match i32::try_from(pid) {
                Ok(pid) if pid > 0 => signal(pid, 0).is_ok(),
                _ => false,
            }
        }
    }
}

#[cfg(windows)]
pub mod windows {
    use std::process::{Command, Stdio};

    use super::ProcessControl;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct Windows;

    impl ProcessControl for Windows {
        fn kill(&self, pid: u32) -> std::io::Result<()> {
            let status = Command::new("taskkill")
                .args(["/F", "/T", "/PID", &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()?;
            if status.success() || !self.is_alive(pid) {
                return Ok(());
            }
            Err(std::io::Error::other(format!("taskkill exited with {status}")))
        }

        fn is_alive(&self, pid: u32) -> bool {
            let filter = format!("PID eq {pid}");
            let Ok(out) = Command::new("tasklist")
                .args(["/FI", &filter, "/FO", "CSV", "/NH"])
                .stderr(Stdio::null())
                .output()
            else {
                return false;
            };
            let needle = format!("\"{pid}\"");
            String::from_utf8_lossy(&out.stdout).contains(&needle)
        }
    }
}
