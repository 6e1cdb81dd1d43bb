//! One download attempt: probe, pick an offset, stream to the temp file.
//!
//! Every await point races the attempt's cancellation token, so pausing or
//! deleting a record stops the transfer promptly. Whatever bytes were
//! accepted before the stop are flushed and stay on disk for the next
//! attempt.

use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::DownloadError;
use super::progress::ProgressWriter;
use super::record::{AttemptGuard, DownloadRecord};
use super::transport::{FetchResponse, Transport};

/// How an attempt ended.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Every byte is on disk; the record is now complete.
    Completed,
    /// The attempt stopped on an error; bytes so far are kept.
    Failed(DownloadError),
    /// The attempt was cancelled by pause, delete, or shutdown.
    Cancelled,
    /// No attempt was started (already running, paused, complete, or rate limited).
    Skipped,
}

impl AttemptOutcome {
    /// True for [`AttemptOutcome::Completed`].
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

enum StreamEnd {
    Complete,
    Cancelled,
}

/// Runs the attempt the guard was issued for.
///
/// The guard is held until the function returns, so the record cannot start
/// a second attempt meanwhile.
#[instrument(skip_all, fields(url = %guard.record().url(), attempt = guard.record().attempt_count()))]
pub(crate) async fn run(
    guard: AttemptGuard,
    transport: &dyn Transport,
    cancel: &CancellationToken,
) -> AttemptOutcome {
    let record = guard.record();
    info!("download attempt started");

    let outcome = match stream_once(record, transport, cancel).await {
        Ok(StreamEnd::Complete) => {
            record.mark_complete();
            info!(bytes = record.downloaded_bytes(), "download complete");
            AttemptOutcome::Completed
        }
        Ok(StreamEnd::Cancelled) => {
            guard.release_spacing();
            debug!(bytes = record.downloaded_bytes(), "download attempt cancelled");
            AttemptOutcome::Cancelled
        }
        Err(error) => {
            warn!(
                error = %error,
                bytes = record.downloaded_bytes(),
                transient = error.is_transient(),
                "download attempt failed"
            );
            record.record_failure(&error);
            AttemptOutcome::Failed(error)
        }
    };
    drop(guard);
    outcome
}

async fn stream_once(
    record: &DownloadRecord,
    transport: &dyn Transport,
    cancel: &CancellationToken,
) -> Result<StreamEnd, DownloadError> {
    let url = record.url();

    tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
        probed = record.probe(transport) => { probed?; }
    }

    let path = record.temp_file();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    let existing = file
        .metadata()
        .await
        .map_err(|e| DownloadError::io(path, e))?
        .len();

    let resumable = record.is_resumable();
    let total = record.total_bytes();
    let mut offset = 0;
    if existing > 0 {
        match total {
            Some(total) if resumable && existing == total => {
                record.set_downloaded(existing);
                info!(bytes = existing, "temp file already holds every byte");
                return Ok(StreamEnd::Complete);
            }
            Some(total) if resumable && existing > total => {
                warn!(existing, total, "temp file longer than source, restarting");
                truncate(&file, record).await?;
            }
            _ if resumable => offset = existing,
            _ => {
                info!(existing, "source does not accept ranges, restarting from zero");
                truncate(&file, record).await?;
            }
        }
    }

    let requested = (offset > 0).then_some(offset);
    let response = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
        fetched = transport.fetch(url, requested) => fetched,
    };
    let FetchResponse { meta, mut body } = match response {
        Ok(response) => response,
        Err(error @ DownloadError::HttpStatus { status: 416, .. }) => {
            // The server no longer agrees on the range; start over next time.
            truncate(&file, record).await?;
            return Err(error);
        }
        Err(error) => return Err(error),
    };

    if offset > 0 && !meta.is_partial() {
        warn!(offset, status = meta.status, "range request ignored, restarting from zero");
        truncate(&file, record).await?;
        record.set_resumable(false);
        offset = 0;
    }
    let total = match meta.content_length {
        Some(length) if meta.is_partial() => Some(offset.saturating_add(length)),
        Some(length) => Some(length),
        None => record.total_bytes(),
    };
    if let Some(total) = total {
        record.set_total(total);
    }
    record.capture_filename_hint(meta.filename_hint());
    record.begin_measurement(offset);
    debug!(offset, total = ?total, "streaming response body");

    let mut writer = ProgressWriter::new(BufWriter::new(file), |n| record.on_bytes_written(n));
    let end = loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break Ok(StreamEnd::Cancelled),
            next = body.next() => next,
        };
        let chunk = match next {
            None => break Ok(StreamEnd::Complete),
            Some(Err(error)) => break Err(error),
            Some(Ok(chunk)) => chunk,
        };

        let remaining = total.map(|t| t.saturating_sub(record.downloaded_bytes()));
        let take = remaining.map_or(chunk.len(), |r| {
            usize::try_from(r).unwrap_or(usize::MAX).min(chunk.len())
        });
        if let Err(error) = writer.write_all(&chunk[..take]).await {
            break Err(DownloadError::io(path, error));
        }
        if remaining.is_some_and(|r| r <= take as u64) {
            if take < chunk.len() {
                debug!(extra = chunk.len() - take, "discarding bytes past declared length");
            }
            break Ok(StreamEnd::Complete);
        }
    };

    let flushed = writer.flush().await;
    drop(writer);
    // Bytes the writer accepted but could not flush are not on disk.
    if let Ok(metadata) = tokio::fs::metadata(path).await {
        record.set_downloaded(metadata.len());
    }
    flushed.map_err(|e| DownloadError::io(path, e))?;

    match end? {
        StreamEnd::Complete => finish(record, total),
        StreamEnd::Cancelled => Ok(StreamEnd::Cancelled),
    }
}

/// Decides whether a cleanly ended body means the download is done.
fn finish(record: &DownloadRecord, total: Option<u64>) -> Result<StreamEnd, DownloadError> {
    let downloaded = record.downloaded_bytes();
    match total {
        Some(total) if downloaded < total => Err(DownloadError::stream(
            record.url(),
            format!("body ended after {downloaded} of {total} bytes"),
        )),
        _ => Ok(StreamEnd::Complete),
    }
}

async fn truncate(file: &File, record: &DownloadRecord) -> Result<(), DownloadError> {
    file.set_len(0)
        .await
        .map_err(|e| DownloadError::io(record.temp_file(), e))?;
    record.set_downloaded(0);
    Ok(())
}
