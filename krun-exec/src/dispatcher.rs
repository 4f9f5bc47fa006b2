//! Parallel remote-exec dispatcher.
//!
//! Runs one argv on every endpoint concurrently. Each endpoint's stdout and
//! stderr are scanned line by line; every line becomes an [`OutputRecord`]
//! posted to a single bounded channel, and one drain task serializes the
//! records to the caller's sinks as `"[endpoint] text\n"`. Lines are never
//! interleaved mid-line across endpoints. The drain only exits after every
//! producer has returned and the channel has closed; that ordering is what
//! guarantees no output is dropped.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

use krun_core::Endpoint;

use crate::error::ExecError;
use crate::transport::{OutputPipe, StreamRequest, Transport};

/// Capacity of the shared output channel. Blocked senders back-pressure the
/// line scanners, which in turn back-pressure the remote process's pipes.
pub const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Which of the caller's sinks a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Stdout,
    Stderr,
}

/// One scanned line from one endpoint.
#[derive(Debug, Clone)]
pub struct OutputRecord {
    pub prefix: String,
    pub text: String,
    pub sink: SinkKind,
}

/// Per-invocation outcome summary. Endpoint failures never cancel siblings;
/// they are reported to the stderr sink and collected here.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub completed: usize,
    pub failures: Vec<(String, ExecError)>,
}

impl DispatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Execute `argv` on every endpoint in parallel with prefixed output.
///
/// `stdin`, when given, is written to every endpoint's stdin and closed.
/// Returns `Err(ExecError::Cancelled)` when the shutdown signal fires;
/// per-endpoint errors live in the report.
pub async fn run_on_endpoints<O, E>(
    transport: Arc<dyn Transport>,
    endpoints: &[Endpoint],
    argv: &[String],
    stdin: Option<Vec<u8>>,
    stdout: O,
    stderr: E,
    shutdown: &broadcast::Sender<()>,
) -> Result<DispatchReport, ExecError>
where
    O: AsyncWrite + Send + Unpin + 'static,
    E: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel::<OutputRecord>(LOG_CHANNEL_CAPACITY);
    let drain = tokio::spawn(drain_records(rx, stdout, stderr));

    let mut tasks = JoinSet::new();
    for endpoint in endpoints {
        let transport = transport.clone();
        let endpoint = endpoint.clone();
        let argv = argv.to_vec();
        let stdin = stdin.clone();
        let tx = tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tasks.spawn(async move {
            let outcome = tokio::select! {
                res = exec_endpoint(transport, &endpoint, &argv, stdin, tx.clone()) => res,
                _ = shutdown_rx.recv() => Err(ExecError::Cancelled),
            };
            if let Err(err) = &outcome {
                if !matches!(err, ExecError::Cancelled) {
                    let _ = tx
                        .send(OutputRecord {
                            prefix: endpoint.prefix(),
                            text: format!("error: {err}"),
                            sink: SinkKind::Stderr,
                        })
                        .await;
                }
            }
            (endpoint.name.clone(), outcome)
        });
    }
    drop(tx);

    let mut report = DispatchReport::default();
    let mut cancelled = false;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => report.completed += 1,
            Ok((_, Err(ExecError::Cancelled))) => cancelled = true,
            Ok((name, Err(err))) => report.failures.push((name, err)),
            Err(err) => report
                .failures
                .push(("<unknown>".to_string(), ExecError::Task(err.to_string()))),
        }
    }

    // All producers have returned and every sender clone is gone, so the
    // drain sees channel close, flushes, and exits.
    match drain.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(ExecError::Task(format!("output drain: {err}"))),
        Err(err) => return Err(ExecError::Task(format!("output drain: {err}"))),
    }

    if cancelled {
        return Err(ExecError::Cancelled);
    }
    Ok(report)
}

async fn exec_endpoint(
    transport: Arc<dyn Transport>,
    endpoint: &Endpoint,
    argv: &[String],
    stdin: Option<Vec<u8>>,
    tx: mpsc::Sender<OutputRecord>,
) -> Result<(), ExecError> {
    let streams = StreamRequest {
        stdin: stdin.is_some(),
        stdout: true,
        stderr: true,
    };
    let mut session = transport.open(endpoint, argv, streams).await?;
    let stdout = session.take_stdout()?;
    let stderr = session.take_stderr()?;

    let out_scan = tokio::spawn(scan_lines(
        stdout,
        endpoint.prefix(),
        SinkKind::Stdout,
        tx.clone(),
    ));
    let err_scan = tokio::spawn(scan_lines(stderr, endpoint.prefix(), SinkKind::Stderr, tx));

    // Scanners are live before the stdin payload goes out, so an endpoint
    // that talks while reading cannot wedge either pipe.
    if let Some(payload) = stdin {
        let mut pipe = session.take_stdin()?;
        pipe.write_all(&payload)
            .await
            .map_err(|e| ExecError::Stream {
                endpoint: endpoint.name.clone(),
                source: e,
            })?;
        let _ = pipe.shutdown().await;
    }

    let result = session.wait().await;

    // Scanners end on EOF once the remote process is gone; awaiting them here
    // means every line was posted before this producer returns.
    let _ = out_scan.await;
    let _ = err_scan.await;
    result
}

async fn scan_lines(
    reader: OutputPipe,
    prefix: String,
    sink: SinkKind,
    tx: mpsc::Sender<OutputRecord>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                if tx
                    .send(OutputRecord {
                        prefix: prefix.clone(),
                        text,
                        sink,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(%prefix, error = %err, "line scan ended");
                break;
            }
        }
    }
}

async fn drain_records<O, E>(
    mut rx: mpsc::Receiver<OutputRecord>,
    mut stdout: O,
    mut stderr: E,
) -> std::io::Result<()>
where
    O: AsyncWrite + Send + Unpin + 'static,
    E: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(record) = rx.recv().await {
        let line = format!("{} {}\n", record.prefix, record.text);
        match record.sink {
            SinkKind::Stdout => stdout.write_all(line.as_bytes()).await?,
            SinkKind::Stderr => stderr.write_all(line.as_bytes()).await?,
        }
    }
    stdout.flush().await?;
    stderr.flush().await?;
    Ok(())
}
