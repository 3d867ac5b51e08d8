//! Interactive debug shell.
//!
//! A process-wide singleton: one Unix-domain socket under a private temp
//! directory, one attached session at a time. A paused thread with a usable
//! result handle attaches the shell to that step's container state; the
//! client reaches it through an external attach tool pointed at the socket,
//! spawned via a `runInTerminal` reverse request. Shell-side failures are
//! reported inline to the terminal, never as DAP failures.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kiln_llb::{ExecConfig, InvokeConfig, ResultHandle, StatConfig};

use crate::error::AdapterError;

/// Invoked with the socket path when a pause wants a client terminal; the
/// adapter installs a closure that issues the `runInTerminal` reverse
/// request.
pub type TerminalRequester = Box<dyn Fn(&PathBuf) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Command executed inside the paused step's container.
    pub command: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command: "/bin/sh".into(),
        }
    }
}

struct Listening {
    path: PathBuf,
    // Keeps the socket directory alive for the process lifetime.
    _dir: TempDir,
}

#[derive(Default)]
struct Session {
    /// A connection accepted but not yet claimed by an attach.
    pending: Option<UnixStream>,
    /// True while an attach owns a connection.
    active: bool,
}

pub struct Shell {
    config: ShellConfig,
    listening: Mutex<Option<Listening>>,
    session: Mutex<Session>,
    connected: Notify,
    sem: Arc<Semaphore>,
    terminal: Mutex<Option<TerminalRequester>>,
}

impl Shell {
    pub fn new(config: ShellConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            listening: Mutex::new(None),
            session: Mutex::new(Session::default()),
            connected: Notify::new(),
            sem: Arc::new(Semaphore::new(1)),
            terminal: Mutex::new(None),
        })
    }

    /// Install the reverse-request hook used to open a client terminal.
    pub fn set_terminal_requester(&self, requester: TerminalRequester) {
        *self.terminal.lock().unwrap_or_else(|e| e.into_inner()) = Some(requester);
    }

    /// Bind the socket and start the accept loop. Idempotent; returns the
    /// socket path.
    pub fn init(self: &Arc<Self>) -> Result<PathBuf, AdapterError> {
        let mut listening = self.listening.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(l) = listening.as_ref() {
            return Ok(l.path.clone());
        }

        let dir = tempfile::Builder::new().prefix("kiln-dap-exec-").tempdir()?;
        let path = dir.path().join("s.sock");
        let listener = UnixListener::bind(&path)?;
        *listening = Some(Listening {
            path: path.clone(),
            _dir: dir,
        });

        let shell = self.clone();
        tokio::spawn(async move {
            shell.accept_loop(listener).await;
        });

        Ok(path)
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        self.listening
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|l| l.path.clone())
    }

    /// Accept clients forever. The first idle connection becomes the shell's
    /// stdio forwarder; anyone else is turned away.
    async fn accept_loop(self: Arc<Self>, listener: UnixListener) {
        loop {
            let Ok((conn, _)) = listener.accept().await else {
                debug!("shell accept loop ended");
                return;
            };
            let mut rejected = None;
            {
                let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
                if session.active || session.pending.is_some() {
                    rejected = Some(conn);
                } else {
                    session.pending = Some(conn);
                    self.connected.notify_one();
                }
            }
            if let Some(mut conn) = rejected {
                let _ = conn.write_all(b"Already connected\n").await;
                let _ = conn.shutdown().await;
            }
        }
    }

    /// Attach the shell to a paused step. Waits for a client connection,
    /// verifies the configured command exists in the step's filesystem,
    /// then execs it in TTY mode against the connection. Returns when the
    /// session ends or `cancel` fires.
    pub async fn attach(
        self: &Arc<Self>,
        cancel: CancellationToken,
        handle: Arc<dyn ResultHandle>,
        line: i64,
    ) -> Result<(), AdapterError> {
        self.init()?;
        self.request_terminal();

        let Some(mut conn) = self.wait_for_client(&cancel).await else {
            return Ok(());
        };

        match handle.stat_file(&self.config.command, StatConfig::default()).await {
            Ok(stat) if stat.is_regular() && stat.is_executable() => {}
            outcome => {
                let why = match outcome {
                    Err(err) => err.to_string(),
                    _ => "not an executable regular file".to_owned(),
                };
                let message =
                    format!("cannot attach: {} is unusable ({why})\n", self.config.command);
                let _ = conn.write_all(message.as_bytes()).await;
                cancel.cancelled().await;
                self.reset_session();
                return Ok(());
            }
        }

        // One interactive session at a time, process wide.
        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                self.reset_session();
                return Ok(());
            }
            permit = self.sem.clone().acquire_owned() => permit,
        };
        let _permit = match permit {
            Ok(p) => p,
            Err(_) => {
                self.reset_session();
                return Ok(());
            }
        };

        let container = match handle
            .new_container(InvokeConfig {
                entrypoint: vec![self.config.command.clone()],
                cwd: None,
                tty: true,
            })
            .await
        {
            Ok(container) => container,
            Err(err) => {
                let _ = conn
                    .write_all(format!("cannot attach: {err}\n").as_bytes())
                    .await;
                self.reset_session();
                return Ok(());
            }
        };

        let banner = format!("kiln-dap shell: paused at line {line}\n");
        let _ = conn.write_all(banner.as_bytes()).await;

        let (mut reader, mut writer) = conn.into_split();
        let mut stderr = tokio::io::sink();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            outcome = container.exec(
                ExecConfig {
                    args: vec![self.config.command.clone()],
                    env: Default::default(),
                    cwd: None,
                    tty: true,
                },
                &mut reader,
                &mut writer,
                &mut stderr,
            ) => outcome,
        };
        if let Err(err) = &outcome {
            warn!(error = %err, "shell exec failed");
        }
        let _ = writer.write_all(b"\n").await;
        container.release().await;
        self.reset_session();
        Ok(())
    }

    /// Claim the pending connection, waiting for one to arrive.
    async fn wait_for_client(&self, cancel: &CancellationToken) -> Option<UnixStream> {
        loop {
            {
                let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(conn) = session.pending.take() {
                    session.active = true;
                    return Some(conn);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.connected.notified() => {}
            }
        }
    }

    fn request_terminal(&self) {
        let session_idle = {
            let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
            !session.active && session.pending.is_none()
        };
        if !session_idle {
            return;
        }
        let path = self.socket_path();
        let terminal = self.terminal.lock().unwrap_or_else(|e| e.into_inner());
        if let (Some(requester), Some(path)) = (terminal.as_ref(), path) {
            requester(&path);
        }
    }

    fn reset_session(&self) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.active = false;
        session.pending = None;
    }
}
