/*
 * Channel Ingest CLI - Audio Acquirer
 * Copyright (c) 2025 Channel Ingest Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use crate::audio::{wav_duration_s, SAMPLE_RATE};
use crate::config::Config;
use crate::error::IngestError;
use crate::types::{AudioArtifact, SourceType, VideoReference};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Task-unique scratch directory. The backing `TempDir` deletes itself on
/// drop, which covers success, failure, and cancellation alike.
#[derive(Debug)]
pub struct TaskWorkspace {
    dir: tempfile::TempDir,
}

impl TaskWorkspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn wav_path(&self) -> PathBuf {
        self.dir.path().join("audio.wav")
    }
}

/// Resolves a video reference to a local mono 16 kHz WAV inside a fresh
/// task workspace. Subprocess-based: yt-dlp for YouTube, ffmpeg for local
/// files, matching the tooling the rest of the pipeline assumes present.
pub struct AudioAcquirer {
    source_type: SourceType,
    temp_root: PathBuf,
    local_root: Option<PathBuf>,
    io_retries: u32,
    task_timeout: Duration,
    fetch_captions: bool,
}

impl AudioAcquirer {
    pub fn new(config: &Config, local_root: Option<PathBuf>) -> Self {
        Self {
            source_type: config.source_type,
            temp_root: config.temp_root.clone(),
            local_root,
            io_retries: config.io_retries.max(1),
            task_timeout: Duration::from_secs(config.task_timeout_s),
            fetch_captions: config.speaker.allow_external_captions,
        }
    }

    /// Acquire audio for one reference. Retriable faults are retried here
    /// with exponential backoff and jitter; what escapes is already
    /// classified for the orchestrator.
    pub async fn acquire(
        &self,
        reference: &VideoReference,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<(AudioArtifact, TaskWorkspace), IngestError> {
        std::fs::create_dir_all(&self.temp_root).map_err(|e| {
            IngestError::Environment(format!(
                "cannot create temp root {}: {e}",
                self.temp_root.display()
            ))
        })?;

        let workspace = tempfile::Builder::new()
            .prefix(&format!("ingest-{}-a{attempt}-", sanitize_id(&reference.video_id)))
            .tempdir_in(&self.temp_root)
            .map(|dir| TaskWorkspace { dir })
            .map_err(|e| IngestError::acquisition(format!("failed to create workspace: {e}"), true))?;

        let result = tokio::time::timeout(self.task_timeout, self.acquire_into(reference, &workspace, cancel)).await;

        match result {
            Ok(Ok(artifact)) => Ok((artifact, workspace)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(IngestError::acquisition(
                format!("acquisition timed out after {}s", self.task_timeout.as_secs()),
                true,
            )),
        }
    }

    async fn acquire_into(
        &self,
        reference: &VideoReference,
        workspace: &TaskWorkspace,
        cancel: &CancellationToken,
    ) -> Result<AudioArtifact, IngestError> {
        let wav_path = workspace.wav_path();
        let mut last_error: Option<IngestError> = None;

        for retry in 0..self.io_retries {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            if retry > 0 {
                let backoff_ms = 1000u64 * (1 << retry.min(6)) + rand::thread_rng().gen_range(0..500);
                tracing::debug!(
                    "retrying acquisition of {} in {}ms (retry {})",
                    reference.video_id,
                    backoff_ms,
                    retry
                );
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                    _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                }
            }

            let outcome = match self.source_type {
                SourceType::Youtube => self.download_youtube(reference, workspace, cancel).await,
                SourceType::Local => self.transcode_local(reference, &wav_path, cancel).await,
            };

            match outcome {
                Ok(()) => {
                    match wav_duration_s(&wav_path) {
                        Ok(duration_s) if duration_s > 0.0 => {
                            let captions_path = self.existing_captions(workspace);
                            tracing::info!(
                                "acquired {} ({duration_s:.0}s{})",
                                reference.video_id,
                                if captions_path.is_some() { ", captions" } else { "" }
                            );
                            return Ok(AudioArtifact { wav_path, duration_s, captions_path });
                        }
                        Ok(_) => {
                            last_error = Some(IngestError::acquisition(
                                "empty audio output".to_string(),
                                true,
                            ));
                        }
                        Err(e) => {
                            last_error = Some(IngestError::acquisition(
                                format!("unreadable output WAV: {e}"),
                                true,
                            ));
                        }
                    }
                }
                Err(e @ IngestError::Cancelled) => return Err(e),
                Err(e) if e.is_retriable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| IngestError::acquisition("acquisition failed with no attempts", false)))
    }

    async fn download_youtube(
        &self,
        reference: &VideoReference,
        workspace: &TaskWorkspace,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError> {
        let url = reference
            .canonical_url
            .clone()
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", reference.video_id));

        let mut command = Command::new("yt-dlp");
        command
            .arg("-f")
            .arg("bestaudio/best")
            .arg("-x")
            .arg("--audio-format")
            .arg("wav")
            .arg("--postprocessor-args")
            .arg(format!("ffmpeg:-ar {SAMPLE_RATE} -ac 1"))
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("-o")
            .arg(workspace.path().join("audio.%(ext)s"))
            .arg(&url);
        if self.fetch_captions {
            // Manual subtitles only; auto-captions are ASR output and
            // defeat the point of bypassing our own.
            command.arg("--write-subs").arg("--sub-langs").arg("en.*,en").arg("--convert-subs").arg("vtt");
        }

        run_tool(command, "yt-dlp", cancel, classify_ytdlp_stderr).await
    }

    async fn transcode_local(
        &self,
        reference: &VideoReference,
        wav_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError> {
        let root = self.local_root.as_deref().unwrap_or_else(|| Path::new("."));
        let input = crate::sources::local_path_for(root, &reference.video_id);
        if !input.exists() {
            return Err(IngestError::acquisition(
                format!("local file not found: {}", input.display()),
                false,
            ));
        }

        let mut command = Command::new("ffmpeg");
        command
            .arg("-y")
            .arg("-i")
            .arg(&input)
            .arg("-vn")
            .arg("-ar")
            .arg(SAMPLE_RATE.to_string())
            .arg("-ac")
            .arg("1")
            .arg("-f")
            .arg("wav")
            .arg(wav_path);

        run_tool(command, "ffmpeg", cancel, classify_ffmpeg_stderr).await
    }

    fn existing_captions(&self, workspace: &TaskWorkspace) -> Option<PathBuf> {
        if !self.fetch_captions {
            return None;
        }
        let entries = std::fs::read_dir(workspace.path()).ok()?;
        entries
            .flatten()
            .map(|e| e.path())
            .find(|p| p.extension().and_then(|e| e.to_str()) == Some("vtt"))
    }
}

async fn run_tool(
    mut command: Command,
    tool: &str,
    cancel: &CancellationToken,
    classify: fn(&str) -> bool,
) -> Result<(), IngestError> {
    command.stdout(Stdio::null()).stderr(Stdio::piped()).stdin(Stdio::null()).kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|e| IngestError::Environment(format!("{tool} is not runnable: {e}")))?;

    let output = tokio::select! {
        output = child.wait_with_output() => output
            .map_err(|e| IngestError::acquisition(format!("{tool} failed to run: {e}"), true))?,
        _ = cancel.cancelled() => return Err(IngestError::Cancelled),
    };

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail = stderr.lines().rev().take(4).collect::<Vec<_>>().join(" | ");
    let retriable = classify(&stderr);
    Err(IngestError::acquisition(format!("{tool} exited {}: {tail}", output.status), retriable))
}

/// Transient network trouble retries; removed or forbidden content is
/// terminal immediately.
fn classify_ytdlp_stderr(stderr: &str) -> bool {
    const TERMINAL: &[&str] = &[
        "Video unavailable",
        "Private video",
        "has been removed",
        "account associated with this video has been terminated",
        "Sign in to confirm your age",
        "members-only",
        "This live event",
        "Unsupported URL",
    ];
    if TERMINAL.iter().any(|needle| stderr.contains(needle)) {
        return false;
    }
    const RETRIABLE: &[&str] = &[
        "HTTP Error 429",
        "HTTP Error 5",
        "timed out",
        "Connection reset",
        "Connection refused",
        "Temporary failure",
        "urlopen error",
        "The read operation timed out",
        "Got error",
    ];
    RETRIABLE.iter().any(|needle| stderr.contains(needle))
}

fn classify_ffmpeg_stderr(stderr: &str) -> bool {
    // Local transcode failures are almost always malformed input; only
    // resource exhaustion is worth retrying.
    stderr.contains("Resource temporarily unavailable") || stderr.contains("Cannot allocate memory")
}

fn sanitize_id(video_id: &str) -> String {
    video_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(40)
        .collect()
}
