use anyhow::{anyhow, Context, Result};
use std::process::{Child, ChildStdout, ExitStatus};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::decoder::DecoderArgs;

const WAIT_POLL: Duration = Duration::from_millis(50);

/// Anything the capture loop can ask "are you still alive?".
pub trait Liveness: Send + Sync {
    fn is_running(&self) -> bool;
}

/// A running decoder subprocess.
///
/// Owned by the supervisor; the capture actor only holds it to check liveness.
#[derive(Debug)]
pub struct DecoderProcess {
    pid: u32,
    child: Mutex<Child>,
}

impl DecoderProcess {
    /// Spawn the decoder and detach its stdout for the capture actor.
    pub fn spawn(args: &DecoderArgs) -> Result<(Self, ChildStdout)> {
        let mut child = args
            .command()
            .spawn()
            .with_context(|| format!("failed to spawn decoder '{}'", args.program))?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("failed to capture decoder stdout"));
            }
        };
        let process = Self {
            pid: child.id(),
            child: Mutex::new(child),
        };
        Ok((process, stdout))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Politely ask the process to exit (SIGTERM on unix).
    ///
    /// A process that has already been reaped is not signalled; its pid may
    /// belong to someone else by now. The child lock is held across the check
    /// and the signal so nothing can reap it in between.
    pub fn terminate(&self) -> Result<()> {
        let mut child = self.lock();
        let exited = child
            .try_wait()
            .with_context(|| format!("failed to poll decoder {}", self.pid))?;
        if exited.is_some() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            let pid = libc::pid_t::try_from(self.pid)
                .map_err(|_| anyhow!("decoder pid {} out of range", self.pid))?;
            // SAFETY: plain syscall on a pid we spawned and have not reaped.
            let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(anyhow!("failed to signal decoder {}: {}", self.pid, err));
                }
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            match child.kill() {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                Err(err) => Err(anyhow!("failed to kill decoder {}: {}", self.pid, err)),
            }
        }
    }

    /// Force the process down.
    pub fn kill(&self) -> Result<()> {
        let mut child = self.lock();
        match child.kill() {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(anyhow!("failed to kill decoder {}: {}", self.pid, err)),
        }
    }

    /// Wait up to `timeout` for the process to exit.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    /// Block until the process exits.
    pub fn wait(&self) -> Result<ExitStatus> {
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(status);
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    fn try_wait(&self) -> Result<Option<ExitStatus>> {
        self.lock()
            .try_wait()
            .with_context(|| format!("failed to poll decoder {}", self.pid))
    }

    fn lock(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Liveness for DecoderProcess {
    fn is_running(&self) -> bool {
        matches!(self.lock().try_wait(), Ok(None))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> DecoderArgs {
        DecoderArgs {
            program: "sh".to_string(),
            global_args: vec!["-c".to_string(), script.to_string(), "decoder".to_string()],
            hwaccel_args: vec![],
            input_args: vec![],
            input: "test".to_string(),
            output_args: vec![],
        }
    }

    #[test]
    fn terminate_stops_a_cooperative_process() -> Result<()> {
        let (process, _stdout) = DecoderProcess::spawn(&shell("exec sleep 30"))?;
        assert!(process.is_running());
        process.terminate()?;
        let status = process.wait_timeout(Duration::from_secs(5))?;
        assert!(status.is_some());
        assert!(!process.is_running());
        Ok(())
    }

    #[test]
    fn kill_stops_a_process_that_ignores_terminate() -> Result<()> {
        let (process, _stdout) =
            DecoderProcess::spawn(&shell("trap '' TERM; while :; do sleep 1; done"))?;
        std::thread::sleep(Duration::from_millis(100));
        process.terminate()?;
        assert!(process.wait_timeout(Duration::from_millis(300))?.is_none());
        process.kill()?;
        process.wait()?;
        assert!(!process.is_running());
        Ok(())
    }

    #[test]
    fn terminate_after_reap_does_not_signal() -> Result<()> {
        let (process, _stdout) = DecoderProcess::spawn(&shell("exit 0"))?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while process.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        // `is_running` reaped the child; the stored status answers from now on.
        assert!(!process.is_running());
        process.terminate()?;
        let status = process.wait_timeout(Duration::from_millis(100))?;
        assert!(status.is_some_and(|status| status.success()));
        Ok(())
    }

    #[test]
    fn spawn_failure_is_reported() {
        let mut args = shell("true");
        args.program = "/nonexistent/decoder".to_string();
        assert!(DecoderProcess::spawn(&args).is_err());
    }
}
