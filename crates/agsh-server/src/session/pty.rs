//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal running the agent CLI in a given working
//! directory, providing blocking read/write handles for the session pumps
//! plus resize, kill, and exit-wait operations.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use agsh_core::{AgshError, AgshResult};

/// A managed PTY instance backing one session.
pub struct PtyProcess {
    /// Blocking output handle, taken once by the session's output pump.
    reader: StdMutex<Option<Box<dyn Read + Send>>>,
    /// Blocking input handle, taken once by the session's input pump.
    writer: StdMutex<Option<Box<dyn Write + Send>>>,
    /// The master side, kept for resize (Mutex because MasterPty is not Sync).
    master: StdMutex<Box<dyn MasterPty + Send>>,
    /// Child handle, consumed by `wait`.
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    /// Cloned killer so `kill` never contends with a pending `wait`.
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyProcess {
    /// Spawn the command on a fresh pseudo-terminal.
    pub fn spawn(
        command: &str,
        args: &[String],
        workdir: &Path,
        env: &HashMap<String, String>,
        rows: u16,
        cols: u16,
    ) -> AgshResult<Self> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| AgshError::Spawn(format!("failed to open PTY: {e}")))?;

        if command.is_empty() {
            return Err(AgshError::Spawn("empty command".into()));
        }
        let mut cmd = CommandBuilder::new(command);
        cmd.args(args);
        cmd.cwd(workdir);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| AgshError::Spawn(format!("failed to spawn {command}: {e}")))?;

        info!(command, workdir = %workdir.display(), rows, cols, "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| AgshError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| AgshError::Spawn(format!("failed to take PTY writer: {e}")))?;
        let killer = child.clone_killer();

        Ok(Self {
            reader: StdMutex::new(Some(reader)),
            writer: StdMutex::new(Some(writer)),
            master: StdMutex::new(pair.master),
            child: Arc::new(Mutex::new(child)),
            killer: StdMutex::new(killer),
        })
    }

    /// Hand the blocking output handle to the session's output pump.
    pub fn take_reader(&self) -> Option<Box<dyn Read + Send>> {
        self.reader.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Hand the blocking input handle to the session's input pump.
    pub fn take_writer(&self) -> Option<Box<dyn Write + Send>> {
        self.writer.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Change the terminal geometry seen by the child.
    pub fn resize(&self, rows: u16, cols: u16) -> AgshResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self
            .master
            .lock()
            .map_err(|_| AgshError::Other("PTY master lock poisoned".into()))?;
        master
            .resize(size)
            .map_err(|e| AgshError::Other(format!("PTY resize failed: {e}")))?;
        debug!(rows, cols, "PTY resized");
        Ok(())
    }

    /// Wait for the child to exit. Resolves exactly once with the exit code.
    pub async fn wait(&self) -> AgshResult<i32> {
        let child = self.child.clone();
        let status = tokio::task::spawn_blocking(move || {
            let mut child = child.blocking_lock();
            child.wait()
        })
        .await
        .map_err(|e| AgshError::Other(format!("join error: {e}")))?
        .map_err(|e| AgshError::Other(format!("wait error: {e}")))?;

        Ok(i32::try_from(status.exit_code()).unwrap_or(-1))
    }

    /// Terminate the child process.
    pub fn kill(&self) -> AgshResult<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| AgshError::Other("PTY killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| AgshError::Other(format!("kill failed: {e}")))?;
        Ok(())
    }
}
