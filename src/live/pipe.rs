//! Subprocess connector source.
//!
//! Hosts an external exchange connector as a child process that emits one
//! JSON event per stdout line (`{"type":"trade",...}` / `{"type":"depth",...}`
//! / `{"status":...}`) and accepts JSON commands on stdin. Only the transport
//! differs from the other sources; reconnection and stale detection live in
//! the generic stream service.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::live::{LiveEvent, LiveSource};
use crate::parser;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Live source speaking JSON lines over a child-process pipe.
pub struct PipeSource {
    command: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    lines: Option<Lines<BufReader<ChildStdout>>>,
    events: u64,
    error_count: u64,
}

impl PipeSource {
    pub fn new(command: String) -> Self {
        Self {
            command,
            child: None,
            stdin: None,
            lines: None,
            events: 0,
            error_count: 0,
        }
    }

    fn process_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

#[async_trait]
impl LiveSource for PipeSource {
    async fn connect(&mut self) -> Result<()> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Transient(format!("spawn connector: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Transient("connector stdout unavailable".into()))?;
        self.stdin = child.stdin.take();
        self.lines = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        info!(command = %self.command, "connector subprocess started");
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.stdin = None;
        self.lines = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
                Ok(_) => info!("connector subprocess stopped"),
                Err(_) => warn!("connector subprocess did not exit within timeout"),
            }
        }
    }

    async fn subscribe(&mut self, symbol: &str, channels: &[&str]) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(EngineError::Transient("connector stdin unavailable".into()));
        };
        for channel in channels {
            let command = json!({
                "command": "subscribe",
                "channel": channel,
                "symbol": symbol,
            });
            let line = format!("{command}\n");
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| EngineError::Transient(format!("connector subscribe: {e}")))?;
        }
        stdin
            .flush()
            .await
            .map_err(|e| EngineError::Transient(format!("connector flush: {e}")))?;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<LiveEvent>> {
        if !self.process_alive() {
            return Err(EngineError::Transient("connector process died".into()));
        }
        let lines = self
            .lines
            .as_mut()
            .ok_or_else(|| EngineError::Transient("connector not connected".into()))?;

        let line = match tokio::time::timeout(POLL_TIMEOUT, lines.next_line()).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) => return Err(EngineError::Transient(format!("connector read: {e}"))),
            Ok(Ok(None)) => return Err(EngineError::Transient("connector stdout closed".into())),
            Ok(Ok(Some(line))) => line,
        };

        let value: Value = match serde_json::from_str(line.trim()) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "skipping non-JSON connector line");
                return Ok(None);
            }
        };

        if let Some(status) = value.get("status").and_then(Value::as_str) {
            if status == "error" {
                self.error_count += 1;
                warn!(
                    error = value.get("error").and_then(|v| v.as_str()).unwrap_or("?"),
                    "connector reported error"
                );
            }
            return Ok(Some(LiveEvent::Status(status.to_string())));
        }

        match value.get("type").and_then(Value::as_str) {
            Some("trade") => match parser::parse_connector_trade(&value) {
                Ok(trade) => {
                    self.events += 1;
                    Ok(Some(LiveEvent::Trade(trade)))
                }
                Err(e) => {
                    debug!(error = %e, "skipping unparseable connector trade");
                    Ok(None)
                }
            },
            Some("depth") => match parser::parse_connector_depth(&value) {
                Ok(depth) => {
                    self.events += 1;
                    Ok(Some(LiveEvent::Depth(depth)))
                }
                Err(e) => {
                    debug!(error = %e, "skipping unparseable connector depth");
                    Ok(None)
                }
            },
            _ => Ok(None),
        }
    }

    fn is_connected(&self) -> bool {
        self.child.is_some()
    }

    fn health(&self) -> Value {
        json!({
            "transport": "pipe",
            "command": self.command,
            "connected": self.is_connected(),
            "events": self.events,
            "error_count": self.error_count,
        })
    }
}
