//! JSON-lines command shell
//!
//! Each input line is one `ClusterCommand`. Every command produces exactly one
//! response line (a `CommandResponse`, tagged by `status`). Cluster events are
//! interleaved as they happen, tagged by `event`. Blank lines are ignored.

use serde::Serialize;
use synod_core::{ClusterCommand, ClusterService, CommandResponse, ErrorKind};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info, warn};

use crate::metrics::record_command;

const INVALID_COMMAND: &str = "INVALID_COMMAND";

async fn write_line<W, T>(output: &mut W, value: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}

async fn handle_line(service: &ClusterService, line: &str) -> CommandResponse {
    match serde_json::from_str::<ClusterCommand>(line) {
        Ok(command) => {
            let name = command.name();
            debug!("Executing command {}", name);
            let response = service.execute(command).await;
            record_command(name, response.is_ok());
            response
        }
        Err(e) => {
            warn!("Invalid command line: {}", e);
            record_command("invalid", false);
            CommandResponse::Rejected {
                code: INVALID_COMMAND.to_string(),
                kind: ErrorKind::InvalidState,
                reason: e.to_string(),
            }
        }
    }
}

/// Serve commands from `input` until end of input.
///
/// Events still queued when input ends are written before returning.
pub async fn run<R, W>(service: &ClusterService, input: R, mut output: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut events = service.subscribe();
    let mut events_open = true;
    let mut lines = input.lines();

    info!("Command shell ready");

    loop {
        tokio::select! {
            biased;
            event = events.recv(), if events_open => match event {
                Ok(event) => write_line(&mut output, &event).await?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Shell fell behind, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => events_open = false,
            },
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    let response = handle_line(service, line.trim()).await;
                    write_line(&mut output, &response).await?;
                }
                None => break,
            },
        }
    }

    while events_open {
        match events.try_recv() {
            Ok(event) => write_line(&mut output, &event).await?,
            Err(TryRecvError::Lagged(skipped)) => {
                warn!("Shell fell behind, {} events skipped", skipped);
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }

    info!("Command shell finished");
    Ok(())
}
