//! JSON Lines over a pair of byte streams.
//!
//! Thread design:
//! - reader thread: blocking line reads -> frame channel
//! - async side: every frame goes to the session, which answers on the
//!   response channel
//! - writer task: response channel -> one JSON object per line, flushed

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;

use lingai_config::WorkerConfig;
use lingai_engine::ComputeEngine;
use lingai_types::WorkerResponse;
use lingai_worker::{ChannelTransport, WorkerSession};
use log::{debug, error, info};
use tokio::sync::mpsc;

/// Counters reported when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub frames_received: usize,
    pub responses_written: usize,
}

/// Read non-empty lines on a dedicated thread. The channel closes at EOF or on
/// a read error.
pub fn spawn_line_reader<R>(reader: R) -> mpsc::UnboundedReceiver<String>
where
    R: BufRead + Send + 'static,
{
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        for line in reader.lines() {
            match line {
                Ok(l) if !l.trim().is_empty() => {
                    if line_tx.send(l).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("[WORKER] Input read error: {e}");
                    break;
                }
            }
        }
        debug!("[WORKER] Reader thread exiting");
    });
    line_rx
}

/// Write each response as one line until the channel closes.
pub async fn write_responses<W: Write>(
    mut responses: mpsc::UnboundedReceiver<WorkerResponse>,
    mut out: W,
) -> io::Result<usize> {
    let mut written = 0;
    while let Some(response) = responses.recv().await {
        let line = match serde_json::to_string(&response) {
            Ok(line) => line,
            Err(e) => {
                error!("[WORKER] Failed to serialize {:?} response: {e}", response.kind);
                continue;
            }
        };
        writeln!(out, "{line}")?;
        out.flush()?;
        written += 1;
    }
    debug!("[WORKER] Writer task exiting");
    Ok(written)
}

/// Run one session until `frames` closes, then shut it down and drain
/// every response to `out`.
pub async fn serve<W>(
    engine: Arc<dyn ComputeEngine>,
    config: &WorkerConfig,
    mut frames: mpsc::UnboundedReceiver<String>,
    out: W,
) -> io::Result<ServeSummary>
where
    W: Write + Send + 'static,
{
    let (transport, responses) = ChannelTransport::new();
    let writer = tokio::spawn(write_responses(responses, out));
    let session = WorkerSession::new(engine, Arc::new(transport), config);

    info!("[WORKER] Ready, waiting for commands...");
    let mut frames_received = 0;
    while let Some(frame) = frames.recv().await {
        frames_received += 1;
        session.on_receive(frame);
    }

    info!("[WORKER] Input closed, shutting down");
    session.shutdown().await;
    // Last transport handle; the writer stops once it has drained the channel.
    drop(session);

    let responses_written = match writer.await {
        Ok(result) => result?,
        Err(e) => return Err(io::Error::other(e)),
    };
    Ok(ServeSummary {
        frames_received,
        responses_written,
    })
}
