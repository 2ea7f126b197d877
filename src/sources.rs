/*
 * Channel Ingest CLI - Video Listing Adapters
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

use crate::types::VideoReference;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// A finite, lazy stream of video references. The pipeline depends only on
/// this contract; the adapters own the details of where references come
/// from.
#[async_trait]
pub trait VideoSource: Send {
    /// The next reference, or `None` when the listing is exhausted.
    async fn next_reference(&mut self) -> Result<Option<VideoReference>>;

    fn describe(&self) -> String;
}

/// Fixed set of references. Used by tests and by internal re-runs.
pub struct StaticSource {
    items: VecDeque<VideoReference>,
    label: String,
}

impl StaticSource {
    pub fn new(items: Vec<VideoReference>, label: impl Into<String>) -> Self {
        Self { items: items.into(), label: label.into() }
    }
}

#[async_trait]
impl VideoSource for StaticSource {
    async fn next_reference(&mut self) -> Result<Option<VideoReference>> {
        Ok(self.items.pop_front())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

#[derive(Debug, Deserialize)]
struct FlatPlaylist {
    #[serde(default)]
    entries: Vec<FlatEntry>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    channel_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    upload_date: Option<String>,
    #[serde(default)]
    view_count: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    availability: Option<String>,
}

/// Full channel listing through `yt-dlp --flat-playlist`. The whole
/// listing is fetched on the first pull; after that it drains lazily.
pub struct YoutubeChannelSource {
    channel_url: String,
    limit: Option<usize>,
    fetched: bool,
    pending: VecDeque<VideoReference>,
}

impl YoutubeChannelSource {
    pub fn new(channel_url: impl Into<String>, limit: Option<usize>) -> Self {
        Self { channel_url: channel_url.into(), limit, fetched: false, pending: VecDeque::new() }
    }

    async fn fetch_listing(&mut self) -> Result<()> {
        let mut command = Command::new("yt-dlp");
        command
            .arg("--flat-playlist")
            .arg("-J")
            .arg("--no-warnings")
            .arg(&self.channel_url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(limit) = self.limit {
            command.arg("--playlist-end").arg(limit.to_string());
        }

        tracing::info!("Listing channel: {}", self.channel_url);
        let output = command.output().await.context("failed to run yt-dlp for channel listing")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("yt-dlp listing failed: {}", stderr.lines().last().unwrap_or("unknown"));
        }

        let playlist: FlatPlaylist =
            serde_json::from_slice(&output.stdout).context("failed to parse yt-dlp listing JSON")?;

        for entry in playlist.entries {
            let mut reference = VideoReference::new(entry.id.clone());
            reference.title = entry.title;
            reference.duration_seconds = entry.duration.map(|d| d.max(0.0) as u64);
            reference.published_at = entry.upload_date.as_deref().and_then(parse_upload_date);
            reference.view_count = entry.view_count;
            reference.description = entry.description;
            reference.channel_name = playlist.channel.clone();
            reference.channel_url = playlist.channel_url.clone();
            reference.canonical_url = Some(
                entry
                    .url
                    .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", entry.id)),
            );
            reference.accessible = !matches!(
                entry.availability.as_deref(),
                Some("private") | Some("premium_only") | Some("subscriber_only") | Some("needs_auth")
            );
            self.pending.push_back(reference);
        }

        tracing::info!("Channel listing produced {} entries", self.pending.len());
        Ok(())
    }
}

#[async_trait]
impl VideoSource for YoutubeChannelSource {
    async fn next_reference(&mut self) -> Result<Option<VideoReference>> {
        if !self.fetched {
            self.fetched = true;
            self.fetch_listing().await?;
        }
        Ok(self.pending.pop_front())
    }

    fn describe(&self) -> String {
        format!("youtube channel {}", self.channel_url)
    }
}

/// Explicit URL list. Ids are extracted locally; full metadata is captured
/// later during acquisition.
pub struct UrlListSource {
    pending: VecDeque<VideoReference>,
    count: usize,
}

impl UrlListSource {
    pub fn new(urls: &[String]) -> Result<Self> {
        let mut pending = VecDeque::new();
        for url in urls {
            let video_id = extract_video_id(url)
                .with_context(|| format!("could not extract a video id from {url}"))?;
            let mut reference = VideoReference::new(video_id);
            reference.canonical_url = Some(url.clone());
            pending.push_back(reference);
        }
        let count = pending.len();
        Ok(Self { pending, count })
    }
}

#[async_trait]
impl VideoSource for UrlListSource {
    async fn next_reference(&mut self) -> Result<Option<VideoReference>> {
        Ok(self.pending.pop_front())
    }

    fn describe(&self) -> String {
        format!("{} explicit urls", self.count)
    }
}

const MEDIA_EXTENSIONS: &[&str] =
    &["wav", "mp3", "m4a", "flac", "ogg", "opus", "mp4", "mkv", "webm", "mov"];

/// Recursive walker over a local media directory. `video_id` is the path
/// relative to the root so re-runs stay idempotent.
pub struct LocalWalkerSource {
    root: PathBuf,
    walked: bool,
    pending: VecDeque<VideoReference>,
}

impl LocalWalkerSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), walked: false, pending: VecDeque::new() }
    }

    fn walk(&mut self) -> Result<()> {
        let mut files: Vec<PathBuf> = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir)
                .with_context(|| format!("failed to read directory {}", dir.display()))?;
            for entry in entries {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| MEDIA_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
                {
                    files.push(path);
                }
            }
        }
        files.sort();

        for path in files {
            let relative = path.strip_prefix(&self.root).unwrap_or(&path);
            let mut reference = VideoReference::new(relative.to_string_lossy().to_string());
            reference.title = path.file_stem().map(|s| s.to_string_lossy().to_string());
            reference.canonical_url = Some(path.to_string_lossy().to_string());
            self.pending.push_back(reference);
        }
        tracing::info!("Local walk of {} found {} media files", self.root.display(), self.pending.len());
        Ok(())
    }
}

#[async_trait]
impl VideoSource for LocalWalkerSource {
    async fn next_reference(&mut self) -> Result<Option<VideoReference>> {
        if !self.walked {
            self.walked = true;
            self.walk()?;
        }
        Ok(self.pending.pop_front())
    }

    fn describe(&self) -> String {
        format!("local walk of {}", self.root.display())
    }
}

/// Pull a YouTube video id out of the common URL shapes, or accept a bare
/// 11-character id.
pub fn extract_video_id(url: &str) -> Option<String> {
    let id_ok = |s: &str| {
        s.len() == 11 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    };

    if id_ok(url) {
        return Some(url.to_string());
    }
    if let Some(idx) = url.find("v=") {
        let id: String = url[idx + 2..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        if id_ok(&id) {
            return Some(id);
        }
    }
    for marker in ["youtu.be/", "/shorts/", "/live/", "/embed/"] {
        if let Some(idx) = url.find(marker) {
            let id: String = url[idx + marker.len()..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .collect();
            if id_ok(&id) {
                return Some(id);
            }
        }
    }
    None
}

/// Resolve the path behind a local `video_id` produced by the walker.
pub fn local_path_for(root: &Path, video_id: &str) -> PathBuf {
    root.join(video_id)
}

fn parse_upload_date(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
