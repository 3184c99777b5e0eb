//! Plugin Runner
//!
//! Owns one plugin subprocess. Four tasks run per process:
//! - writer: frames requests onto stdin; closing the request channel closes stdin
//! - reader: decodes framed responses from stdout and checks item hashes
//! - stderr: every non-empty line becomes an error response with no request id
//! - supervisor: waits for exit, reports a failed exit status, then sends `closed`
//!
//! The supervisor is the only task that sends `closed`, so the stream always
//! ends with exactly one. The stream is terminated when the plugin sends its
//! own `closed` (which is not forwarded) or commits a protocol violation
//! (undecodable frame, hash mismatch). From then on the writer stops, stdout
//! is drained silently so the plugin can still exit, and stderr is only logged.
//! A failed exit is reported either way. The subprocess is never killed.

use dataq_protocol::{
    decode_message, encode_message, spawn_frame_stream, write_frame_async, PluginRequest,
    PluginResponse, ResponsePayload, DEFAULT_STREAM_CAPACITY,
};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, WorkerError};

/// Capacity of the response channel; a slow consumer throttles stdout reads.
const RESPONSE_BUFFER: usize = 64;

/// How to start one plugin process
#[derive(Debug, Clone)]
pub struct RunnerSpec {
    pub plugin_id: String,
    pub binary: PathBuf,
    pub work_dir: PathBuf,
    pub request_buffer: usize,
}

/// Channels to a running plugin process.
pub struct RunnerHandle {
    pub plugin_id: String,
    pub requests: mpsc::Sender<PluginRequest>,
    pub responses: mpsc::Receiver<PluginResponse>,
    /// Finishes once the process has exited and `closed` was sent
    pub supervisor: JoinHandle<()>,
}

/// Start the plugin process and its I/O tasks.
pub fn spawn_runner(spec: RunnerSpec) -> Result<RunnerHandle> {
    let spawn_err = |source: std::io::Error| WorkerError::Spawn {
        plugin_id: spec.plugin_id.clone(),
        binary: spec.binary.clone(),
        source,
    };

    std::fs::create_dir_all(&spec.work_dir).map_err(spawn_err)?;

    let mut child = Command::new(&spec.binary)
        .current_dir(&spec.work_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_err)?;

    let missing = |name: &str| {
        spawn_err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("failed to capture {}", name),
        ))
    };
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    info!(
        "[plugin {}] Started {} (pid {:?}) in {}",
        spec.plugin_id,
        spec.binary.display(),
        child.id(),
        spec.work_dir.display()
    );

    let (req_tx, req_rx) = mpsc::channel(spec.request_buffer.max(1));
    let (resp_tx, resp_rx) = mpsc::channel(RESPONSE_BUFFER);
    let terminated = CancellationToken::new();

    let plugin_id = spec.plugin_id.clone();
    let writer = tokio::spawn(write_requests(
        plugin_id.clone(),
        stdin,
        req_rx,
        terminated.clone(),
    ));
    let reader = tokio::spawn(read_responses(
        plugin_id.clone(),
        stdout,
        resp_tx.clone(),
        terminated.clone(),
    ));
    let stderr_task = tokio::spawn(forward_stderr(
        plugin_id.clone(),
        stderr,
        resp_tx.clone(),
        terminated.clone(),
    ));
    let supervisor = tokio::spawn(supervise(Supervised {
        plugin_id: plugin_id.clone(),
        child,
        writer,
        reader,
        stderr_task,
        terminated,
        responses: resp_tx,
    }));

    Ok(RunnerHandle {
        plugin_id,
        requests: req_tx,
        responses: resp_rx,
        supervisor,
    })
}

// ============================================================================
// Loops
// ============================================================================

async fn write_requests(
    plugin_id: String,
    mut stdin: ChildStdin,
    mut requests: mpsc::Receiver<PluginRequest>,
    stop: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = stop.cancelled() => {
                debug!("[plugin {}] Writer stopped", plugin_id);
                break;
            }
            request = requests.recv() => match request {
                Some(request) => request,
                None => {
                    debug!("[plugin {}] No more requests, closing stdin", plugin_id);
                    break;
                }
            },
        };

        let body = match encode_message(&request) {
            Ok(body) => body,
            Err(e) => {
                warn!("[plugin {}] Failed to encode request {}: {}", plugin_id, request.id, e);
                continue;
            }
        };
        if let Err(e) = write_frame_async(&mut stdin, &body).await {
            warn!("[plugin {}] Failed to write request {}: {}", plugin_id, request.id, e);
            break;
        }
        debug!(
            "[plugin {}] Sent {} request {}",
            plugin_id, request.operation, request.id
        );
    }
    // stdin is dropped here, which the plugin sees as EOF
}

async fn read_responses(
    plugin_id: String,
    stdout: ChildStdout,
    responses: mpsc::Sender<PluginResponse>,
    terminated: CancellationToken,
) {
    let mut stream = spawn_frame_stream(stdout, DEFAULT_STREAM_CAPACITY);

    while let Some(frame) = stream.frames.recv().await {
        if terminated.is_cancelled() {
            // Keep draining so the plugin never blocks on a full pipe
            continue;
        }

        let response: PluginResponse = match decode_message(&frame) {
            Ok(response) => response,
            Err(e) => {
                violation(&plugin_id, "", format!("undecodable response: {}", e), &responses).await;
                terminated.cancel();
                continue;
            }
        };

        if let ResponsePayload::Item { item } = &response.payload {
            if let Err(e) = item.verify() {
                violation(&plugin_id, &response.request_id, e.to_string(), &responses).await;
                terminated.cancel();
                continue;
            }
        }

        if response.is_closed() {
            debug!("[plugin {}] Plugin closed its stream", plugin_id);
            terminated.cancel();
            continue;
        }
        if responses.send(response).await.is_err() {
            terminated.cancel();
        }
    }

    if !terminated.is_cancelled() {
        if let Err(e) = stream.finish().await {
            let message = format!("plugin {} stdout: {}", plugin_id, e);
            warn!("[plugin {}] {}", plugin_id, message);
            let _ = responses
                .send(PluginResponse::error(&plugin_id, "", message))
                .await;
        }
    }
}

async fn violation(
    plugin_id: &str,
    request_id: &str,
    reason: String,
    responses: &mpsc::Sender<PluginResponse>,
) {
    let message = format!("protocol violation by plugin {}: {}", plugin_id, reason);
    warn!("[plugin {}] {}", plugin_id, message);
    let _ = responses
        .send(PluginResponse::error(plugin_id, request_id, message))
        .await;
}

async fn forward_stderr(
    plugin_id: String,
    stderr: ChildStderr,
    responses: mpsc::Sender<PluginResponse>,
    terminated: CancellationToken,
) {
    let mut lines = BufReader::new(stderr).lines();
    let mut consumer_gone = false;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("[plugin {}] stderr read error: {}", plugin_id, e);
                break;
            }
        };
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        warn!("[plugin {}] stderr: {}", plugin_id, line);
        if !consumer_gone && !terminated.is_cancelled() {
            consumer_gone = responses
                .send(PluginResponse::error(&plugin_id, "", line))
                .await
                .is_err();
        }
    }
}

struct Supervised {
    plugin_id: String,
    child: Child,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
    terminated: CancellationToken,
    responses: mpsc::Sender<PluginResponse>,
}

async fn supervise(mut s: Supervised) {
    let status = s.child.wait().await;

    // Output produced before exit is delivered ahead of the exit report
    let _ = s.reader.await;
    let _ = s.stderr_task.await;
    s.terminated.cancel();
    let _ = s.writer.await;

    let failure = match &status {
        Ok(status) if status.success() => None,
        Ok(status) => Some(describe_exit(status)),
        Err(e) => Some(format!("failed to wait for process: {}", e)),
    };

    match failure {
        Some(reason) => {
            let message = format!("plugin {} {}", s.plugin_id, reason);
            warn!("[plugin {}] {}", s.plugin_id, message);
            let _ = s
                .responses
                .send(PluginResponse::error(&s.plugin_id, "", message))
                .await;
        }
        None => info!("[plugin {}] Exited cleanly", s.plugin_id),
    }

    let _ = s.responses.send(PluginResponse::closed(&s.plugin_id)).await;
}

fn describe_exit(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {}", code),
        None => format!("terminated abnormally ({})", status),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use dataq_protocol::{write_frame, Action, DataItem};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn spec(dir: &TempDir, binary: PathBuf) -> RunnerSpec {
        RunnerSpec {
            plugin_id: "p".into(),
            binary,
            work_dir: dir.path().join("work"),
            request_buffer: 1,
        }
    }

    async fn collect(mut handle: RunnerHandle) -> Vec<PluginResponse> {
        drop(handle.requests);
        let mut out = Vec::new();
        let collect = async {
            while let Some(resp) = handle.responses.recv().await {
                out.push(resp);
            }
        };
        tokio::time::timeout(Duration::from_secs(10), collect)
            .await
            .expect("runner did not finish");
        out
    }

    fn assert_closed_last(responses: &[PluginResponse]) {
        let closed: Vec<_> = responses.iter().filter(|r| r.is_closed()).collect();
        assert_eq!(closed.len(), 1, "{:?}", responses);
        assert!(responses.last().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_error_then_closed() {
        let tmp = TempDir::new().unwrap();
        let handle = spawn_runner(spec(&tmp, script(tmp.path(), "fail.sh", "exit 3"))).unwrap();

        let responses = collect(handle).await;
        assert_eq!(responses.len(), 2, "{:?}", responses);
        match &responses[0].payload {
            ResponsePayload::Error { message } => assert!(message.contains("code 3"), "{}", message),
            other => panic!("expected error, got {:?}", other),
        }
        assert_closed_last(&responses);
    }

    #[tokio::test]
    async fn test_stderr_lines_become_errors() {
        let tmp = TempDir::new().unwrap();
        let body = "echo 'first problem' >&2\necho >&2\necho 'second problem' >&2\nexit 0";
        let handle = spawn_runner(spec(&tmp, script(tmp.path(), "noisy.sh", body))).unwrap();

        let responses = collect(handle).await;
        let messages: Vec<&str> = responses
            .iter()
            .filter_map(|r| match &r.payload {
                ResponsePayload::Error { message } => Some(message.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(messages, vec!["first problem", "second problem"]);
        assert!(responses.iter().all(|r| r.request_id.is_empty()));
        assert_closed_last(&responses);
    }

    #[tokio::test]
    async fn test_runs_in_work_dir() {
        let tmp = TempDir::new().unwrap();
        let handle =
            spawn_runner(spec(&tmp, script(tmp.path(), "touch.sh", "touch marker"))).unwrap();
        collect(handle).await;
        assert!(tmp.path().join("work").join("marker").exists());
    }

    #[tokio::test]
    async fn test_garbage_stdout_is_a_violation() {
        let tmp = TempDir::new().unwrap();
        // 8 bytes of text parse as an absurd frame length
        let handle =
            spawn_runner(spec(&tmp, script(tmp.path(), "junk.sh", "printf 'garbage!'"))).unwrap();

        let responses = collect(handle).await;
        assert!(matches!(responses[0].payload, ResponsePayload::Error { .. }));
        assert_closed_last(&responses);
    }

    #[tokio::test]
    async fn test_echoed_requests_are_undecodable() {
        let tmp = TempDir::new().unwrap();
        let mut handle = spawn_runner(spec(&tmp, script(tmp.path(), "echo.sh", "exec cat"))).unwrap();

        handle
            .requests
            .send(PluginRequest::extract("r1", "p", Action::new("scan")))
            .await
            .unwrap();

        let first = handle.responses.recv().await.unwrap();
        match &first.payload {
            ResponsePayload::Error { message } => {
                assert!(message.contains("protocol violation"), "{}", message)
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert!(handle.responses.recv().await.unwrap().is_closed());

        // The writer was stopped, so cat sees EOF and exits; nothing else arrives
        let rest = collect(handle).await;
        assert!(rest.is_empty(), "{:?}", rest);
    }

    #[tokio::test]
    async fn test_hash_mismatch_terminates_stream() {
        let tmp = TempDir::new().unwrap();

        // Pre-record a response stream: a forged item followed by a valid done
        let mut item = DataItem::new("p", "src", "file", "text/plain", b"real".to_vec());
        item.seal();
        item.raw_data = b"forged".to_vec();
        let mut frames = Vec::new();
        for resp in [
            PluginResponse::item("p", "r1", item),
            PluginResponse::done("p", "r1"),
        ] {
            write_frame(&mut frames, &encode_message(&resp).unwrap()).unwrap();
        }
        let recorded = tmp.path().join("recorded.bin");
        std::fs::write(&recorded, frames).unwrap();

        let body = format!("cat '{}'", recorded.display());
        let handle = spawn_runner(spec(&tmp, script(tmp.path(), "forge.sh", &body))).unwrap();

        let responses = collect(handle).await;
        assert_eq!(responses.len(), 2, "{:?}", responses);
        assert_eq!(responses[0].request_id, "r1");
        match &responses[0].payload {
            ResponsePayload::Error { message } => assert!(message.contains("mismatch"), "{}", message),
            other => panic!("expected error, got {:?}", other),
        }
        assert!(responses[1].is_closed());
    }

    fn record(dir: &Path, responses: &[PluginResponse]) -> PathBuf {
        let mut frames = Vec::new();
        for resp in responses {
            write_frame(&mut frames, &encode_message(resp).unwrap()).unwrap();
        }
        let path = dir.join("recorded.bin");
        std::fs::write(&path, frames).unwrap();
        path
    }

    #[tokio::test]
    async fn test_nothing_follows_plugin_closed() {
        let tmp = TempDir::new().unwrap();
        let recorded = record(
            tmp.path(),
            &[PluginResponse::done("p", "r1"), PluginResponse::closed("p")],
        );
        let body = format!(
            "cat '{}'\nexec 1>&-\nsleep 0.3\necho 'late warning' >&2\nexit 0",
            recorded.display()
        );
        let handle = spawn_runner(spec(&tmp, script(tmp.path(), "late.sh", &body))).unwrap();

        let responses = collect(handle).await;
        assert_eq!(responses.len(), 2, "{:?}", responses);
        assert!(matches!(responses[0].payload, ResponsePayload::Done));
        assert_closed_last(&responses);
    }

    #[tokio::test]
    async fn test_failed_exit_after_plugin_closed_is_reported() {
        let tmp = TempDir::new().unwrap();
        let recorded = record(tmp.path(), &[PluginResponse::closed("p")]);
        let body = format!("cat '{}'\nexit 4", recorded.display());
        let handle = spawn_runner(spec(&tmp, script(tmp.path(), "crash.sh", &body))).unwrap();

        let responses = collect(handle).await;
        assert_eq!(responses.len(), 2, "{:?}", responses);
        match &responses[0].payload {
            ResponsePayload::Error { message } => assert!(message.contains("code 4"), "{}", message),
            other => panic!("expected error, got {:?}", other),
        }
        assert_closed_last(&responses);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let tmp = TempDir::new().unwrap();
        let result = spawn_runner(spec(&tmp, tmp.path().join("does-not-exist")));
        assert!(matches!(result, Err(WorkerError::Spawn { .. })));
    }
}
