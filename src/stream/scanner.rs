use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;

use super::StopSignal;
use crate::Result;
use crate::utils::sse::read_next_line_bytes_limited;

/// Reads upstream lines into `lines` until EOF, a read error, or `stop`.
///
/// The reader is owned here, so the upstream body is released exactly once when this returns.
pub(super) async fn scan_lines<R>(
    mut reader: R,
    lines: mpsc::Sender<Result<String>>,
    stop: StopSignal,
    max_line_bytes: usize,
) where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::<u8>::new();
    loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            read = read_next_line_bytes_limited(&mut reader, &mut buf, max_line_bytes) => read,
        };
        let line = match read {
            Ok(true) => String::from_utf8_lossy(&buf)
                .trim_end_matches(['\r', '\n'])
                .to_string(),
            Ok(false) => break,
            Err(err) => {
                let _ = lines.send(Err(err)).await;
                break;
            }
        };
        if line.is_empty() {
            continue;
        }
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            sent = lines.send(Ok(line)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    drop(reader);
    tracing::trace!("upstream reader released");
}
