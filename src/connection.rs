//! Per-connection Assuan session handling.
//!
//! Each accepted socket connection is driven by [`serve_connection`]: it
//! greets the client, then reads one command line at a time and answers it
//! before reading the next. `GETPIN` suspends the connection (not the
//! server) on the [`PinPrompt`] capability until the human responds.
//!
//! Session state (`SETDESC`/`SETPROMPT` values) is owned by the connection
//! and dropped when it closes; it is never shared across connections.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};

use crate::assuan::{self, Response};

/// Internal control line used for instance handover.
///
/// Not part of the public protocol: it is recognized before command
/// dispatch, never answered, and never advertised via `HELP`.
pub const STOP_SENTINEL: &str = "__stop_server__";

/// External capability that obtains a secret from a human.
///
/// The value is always collected masked. `Ok(None)` means the human
/// cancelled the prompt.
#[async_trait]
pub trait PinPrompt: Send + Sync {
    async fn prompt_for_secret(
        &self,
        title: Option<&str>,
        prompt: Option<&str>,
    ) -> anyhow::Result<Option<String>>;
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The peer disconnected or sent `BYE`.
    Closed,
    /// The peer sent the internal stop sentinel; the listener should shut
    /// down.
    StopRequested,
}

/// Mutable per-session state, set by `SETDESC`/`SETPROMPT` and read by
/// `GETPIN`.
#[derive(Debug, Default)]
struct Session {
    description: Option<String>,
    prompt: Option<String>,
}

/// Drive one Assuan session over `stream` until the peer disconnects,
/// sends `BYE`, or requests server shutdown.
///
/// Commands are handled strictly one at a time: a pending `GETPIN` blocks
/// further reads on this connection until the prompt resolves.
pub async fn serve_connection<S>(stream: S, pin_prompt: Arc<dyn PinPrompt>) -> io::Result<Outcome>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();
    let mut session = Session::default();

    send(&mut writer, &Response::ok("Pleased to meet you")).await?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim_start();
        if line == STOP_SENTINEL {
            log::info!("stop sentinel received, requesting listener shutdown");
            return Ok(Outcome::StopRequested);
        }

        let (command, param) = assuan::parse_line(line);
        log::debug!("command: {command}");
        match command {
            "" | "#" => {}
            "OPTION" | "SETKEYINFO" => {
                send(&mut writer, &Response::Comment("ignored".to_string())).await?;
                send(&mut writer, &Response::Ok(None)).await?;
            }
            "SETDESC" => {
                session.description = Some(param);
                send(&mut writer, &Response::Ok(None)).await?;
            }
            "SETPROMPT" => {
                session.prompt = Some(param);
                send(&mut writer, &Response::Ok(None)).await?;
            }
            "GETPIN" => {
                let result = pin_prompt
                    .prompt_for_secret(session.description.as_deref(), session.prompt.as_deref())
                    .await;
                match result {
                    Ok(Some(pin)) => {
                        send(&mut writer, &Response::Data(pin)).await?;
                        send(&mut writer, &Response::Ok(None)).await?;
                    }
                    Ok(None) => {
                        // Human cancelled: no D line, just OK.
                        send(&mut writer, &Response::Ok(None)).await?;
                    }
                    Err(e) => {
                        log::warn!("prompt failed: {e:#}");
                        send(&mut writer, &Response::err(e.to_string())).await?;
                    }
                }
            }
            "HELP" => {
                for cmd in ["GETPIN", "HELP", "BYE"] {
                    send(&mut writer, &Response::Comment(cmd.to_string())).await?;
                }
                send(&mut writer, &Response::Ok(None)).await?;
            }
            "BYE" => {
                send(&mut writer, &Response::ok("closing connection")).await?;
                return Ok(Outcome::Closed);
            }
            other => {
                send(&mut writer, &Response::err(format!("Unexpected {other}"))).await?;
            }
        }
        writer.flush().await?;
    }

    Ok(Outcome::Closed)
}

async fn send<S>(writer: &mut WriteHalf<S>, response: &Response) -> io::Result<()>
where
    S: AsyncWrite + Send,
{
    writer.write_all(response.to_wire().as_bytes()).await
}
