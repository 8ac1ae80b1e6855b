use std::path::Path;

use log::{debug, error, info, trace, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};
use vampirc_uci::{parse_one, UciMessage};

use super::types::{
    EngineError, EngineResult, EngineState, ENGINE_INIT_TIMEOUT, ENGINE_QUIT_GRACE,
};
use crate::chess::PositionKey;
use crate::config::EngineOption;

/// A running UCI engine process.
///
/// Owns stdin and the lifecycle state. Stdout is handed back from [`EngineProcess::new`]
/// so that the worker can read it concurrently with sending commands.
#[derive(Debug)]
pub struct EngineProcess {
    stdin: ChildStdin,
    child: Option<Child>,
    state: EngineState,
}

impl EngineProcess {
    /// Spawn the engine, run the UCI handshake and apply `options`.
    pub async fn new(
        path: &Path,
        options: &[EngineOption],
    ) -> EngineResult<(Self, Lines<BufReader<ChildStdout>>)> {
        info!("Initializing engine from path: {:?}", path);

        let mut child = Self::spawn_engine_process(path)?;
        let (mut stdin, mut lines) = Self::get_io_handles(&mut child)?;

        let handshake = Self::initialize_uci(&mut stdin, &mut lines, options);
        match timeout(ENGINE_INIT_TIMEOUT, handshake).await {
            Ok(Ok(())) => {
                info!("Engine initialized successfully: {:?}", path);
            }
            Ok(Err(e)) => {
                error!("Failed to initialize engine {:?}: {}", path, e);
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                error!("Engine initialization timeout: {:?}", path);
                let _ = child.kill().await;
                return Err(EngineError::InitTimeout);
            }
        }

        Self::spawn_stderr_handler(child.stderr.take());

        Ok((
            Self {
                stdin,
                child: Some(child),
                state: EngineState::Idle,
            },
            lines,
        ))
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, EngineState::Analyzing)
    }

    /// Set up `position` and start an infinite search.
    pub async fn start_search(&mut self, position: &PositionKey) -> EngineResult<()> {
        self.transition_state(EngineState::Analyzing)?;
        if let Err(e) = self.send_search_commands(position).await {
            // Nothing was started, so no bestmove will follow.
            self.state = EngineState::Idle;
            return Err(e);
        }
        debug!("Search started for {}", position);
        Ok(())
    }

    /// Ask the engine to stop. The search is over once `bestmove` arrives.
    pub async fn request_stop(&mut self) -> EngineResult<()> {
        if !self.is_running() {
            debug!("Engine not running, stop request ignored");
            return Ok(());
        }
        self.transition_state(EngineState::Stopping)?;
        self.send_command("stop\n").await
    }

    /// `bestmove` received: the search has ended.
    pub fn handle_bestmove(&mut self) -> EngineResult<()> {
        trace!("Received bestmove in state {:?}", self.state);
        if self.state == EngineState::Idle {
            return Ok(());
        }
        self.transition_state(EngineState::Idle)
    }

    /// Send `stop` again while a `bestmove` is overdue.
    pub async fn repeat_stop(&mut self) -> EngineResult<()> {
        if self.state != EngineState::Stopping {
            return Ok(());
        }
        warn!("bestmove overdue, repeating stop");
        self.send_command("stop\n").await
    }

    /// Terminate the engine process
    pub async fn kill(&mut self) -> EngineResult<()> {
        info!("Terminating engine process");

        if let Err(e) = self.transition_state(EngineState::Terminated) {
            warn!("Failed to transition to terminated state: {}", e);
        }

        match self.send_command("quit\n").await {
            Ok(()) => {
                tokio::time::sleep(ENGINE_QUIT_GRACE).await;
            }
            Err(EngineError::BrokenPipe) => {
                debug!("Broken pipe while sending quit command, engine already dead");
            }
            Err(e) => {
                warn!("Failed to send quit command: {}, will force kill", e);
            }
        }

        if let Some(mut child) = self.child.take() {
            match child.kill().await {
                Ok(()) => debug!("Engine process killed successfully"),
                Err(e) => warn!("Failed to kill engine process: {}", e),
            }
            if let Err(e) = child.wait().await {
                warn!("Error waiting for engine process to die: {}", e);
            }
        }

        Ok(())
    }

    // =============================================================================
    // Private Implementation
    // =============================================================================

    fn spawn_engine_process(path: &Path) -> EngineResult<Child> {
        debug!("Spawning engine process: {:?}", path);

        let mut command = Command::new(path);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        command.current_dir(dir.unwrap_or_else(|| Path::new(".")));
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .env("TERM", "dumb");

        command.spawn().map_err(|e| {
            error!("Failed to spawn engine process {:?}: {}", path, e);
            EngineError::Io(e)
        })
    }

    fn get_io_handles(
        child: &mut Child,
    ) -> EngineResult<(ChildStdin, Lines<BufReader<ChildStdout>>)> {
        let stdin = child.stdin.take().ok_or_else(|| {
            error!("Failed to get stdin handle from engine process");
            EngineError::NoStdin
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            error!("Failed to get stdout handle from engine process");
            EngineError::NoStdout
        })?;

        Ok((stdin, BufReader::with_capacity(1024, stdout).lines()))
    }

    async fn initialize_uci(
        stdin: &mut ChildStdin,
        lines: &mut Lines<BufReader<ChildStdout>>,
        options: &[EngineOption],
    ) -> EngineResult<()> {
        debug!("Starting UCI initialization");

        write_command(stdin, "uci\n").await?;
        Self::wait_for(lines, UciMessage::UciOk).await?;

        for option in options {
            let command = format!("setoption name {} value {}\n", option.name, option.value);
            write_command(stdin, &command).await?;
        }

        write_command(stdin, "isready\n").await?;
        Self::wait_for(lines, UciMessage::ReadyOk).await?;

        debug!("Engine is ready");
        Ok(())
    }

    async fn wait_for(
        lines: &mut Lines<BufReader<ChildStdout>>,
        expected: UciMessage,
    ) -> EngineResult<()> {
        while let Some(line) = lines.next_line().await? {
            trace!("Engine response: {}", line);
            match parse_one(&line) {
                UciMessage::Id { name: Some(name), .. } => debug!("Engine name: {}", name),
                message if message == expected => return Ok(()),
                _ => {}
            }
        }
        Err(EngineError::UnexpectedEof)
    }

    fn spawn_stderr_handler(stderr: Option<tokio::process::ChildStderr>) {
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut stderr_lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = stderr_lines.next_line().await {
                    warn!("Engine stderr: {}", line);
                }
            });
        }
    }

    async fn send_search_commands(&mut self, position: &PositionKey) -> EngineResult<()> {
        let command = format!("position fen {}\n", position.to_fen());
        self.send_command(&command).await?;
        self.send_command("go infinite\n").await
    }

    async fn send_command(&mut self, command: &str) -> EngineResult<()> {
        write_command(&mut self.stdin, command).await
    }

    fn transition_state(&mut self, new_state: EngineState) -> EngineResult<()> {
        if !is_valid_transition(&self.state, &new_state) {
            return Err(EngineError::InvalidTransition {
                from: self.state.clone(),
                to: new_state,
            });
        }

        debug!("Engine state transition: {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
        Ok(())
    }
}

fn is_valid_transition(from: &EngineState, to: &EngineState) -> bool {
    matches!(
        (from, to),
        (EngineState::Idle, EngineState::Analyzing)
            | (EngineState::Analyzing, EngineState::Stopping)
            | (EngineState::Stopping, EngineState::Idle)
            | (EngineState::Analyzing, EngineState::Idle)
            | (_, EngineState::Terminated)
    )
}

async fn write_command(stdin: &mut ChildStdin, command: &str) -> EngineResult<()> {
    debug!("Sending UCI command: {}", command.trim());

    stdin
        .write_all(command.as_bytes())
        .await
        .map_err(|e| pipe_error(command, e))?;
    stdin.flush().await.map_err(|e| pipe_error(command, e))
}

fn pipe_error(command: &str, e: std::io::Error) -> EngineError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::ConnectionReset => {
            warn!("Broken pipe while sending command: {}", command.trim());
            EngineError::BrokenPipe
        }
        _ => {
            error!("Failed to send command '{}': {}", command.trim(), e);
            EngineError::Io(e)
        }
    }
}
