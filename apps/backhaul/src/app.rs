//! Wires storage, the upload job and signal handling together.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use backhaul_storage::s3::S3Connector;
use backhaul_upload::{JobSummary, UploadEvent, UploadJob};

use crate::config::Config;

/// Runs one upload job until it finishes or Ctrl-C is pressed.
pub async fn run(config: Config) -> anyhow::Result<JobSummary> {
    let connector = Arc::new(S3Connector::new()?);
    let mut job = UploadJob::connect(config.upload, connector).await?;

    if let Some(mut events) = job.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_event(&event);
            }
        });
    }

    run_until(Arc::new(job), async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::warn!("SIGINT received, shutting down"),
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGINT");
                std::future::pending::<()>().await;
            }
        }
    })
    .await
}

/// Drives `job` to completion, closing it as soon as `shutdown` resolves.
///
/// The run itself is never dropped: a shutdown goes through
/// [`UploadJob::close`] and the job unwinds its open upload on its own.
pub async fn run_until<F>(job: Arc<UploadJob>, shutdown: F) -> anyhow::Result<JobSummary>
where
    F: Future<Output = ()> + Send + 'static,
{
    let closer = {
        let job = Arc::clone(&job);
        tokio::spawn(async move {
            shutdown.await;
            job.close().await;
        })
    };

    let outcome = job.run().await;
    let interrupted = job.is_closed() && outcome.is_err();
    closer.abort();
    job.close().await;

    if interrupted {
        return outcome.context("upload interrupted");
    }
    Ok(outcome?)
}

fn log_event(event: &UploadEvent) {
    match event {
        UploadEvent::FileStarted {
            key_name,
            size,
            chunks,
        } => tracing::debug!(key = %key_name, size, chunks, "file started"),
        UploadEvent::ChunkFinished {
            key_name,
            part_number,
            attempts,
            success,
            ..
        } => tracing::debug!(key = %key_name, part = part_number, attempts, success, "chunk finished"),
        UploadEvent::FileCompleted { key_name, bytes } => {
            tracing::info!(key = %key_name, bytes, "file uploaded")
        }
        UploadEvent::FileCancelled { key_name, reason } => {
            tracing::warn!(key = %key_name, reason = %reason, "file cancelled")
        }
    }
}
