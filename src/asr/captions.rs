/*
 * Channel Ingest CLI - External Caption Parsing
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

use crate::error::IngestError;
use crate::types::{RawSegment, SpeakerLabel};
use std::path::Path;

/// Parse a WebVTT caption track into raw segments. Captions carry no
/// speaker evidence, so every cue is labelled UNKNOWN; the optimizer's
/// default-label policy may rewrite them later.
pub fn parse_vtt_file(path: &Path) -> Result<Vec<RawSegment>, IngestError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| IngestError::acquisition(format!("unreadable caption file: {e}"), false))?;
    parse_vtt(&raw)
}

pub fn parse_vtt(raw: &str) -> Result<Vec<RawSegment>, IngestError> {
    let mut segments: Vec<RawSegment> = Vec::new();
    let mut lines = raw.lines().peekable();

    while let Some(line) = lines.next() {
        let Some((start_s, end_s)) = parse_cue_timing(line) else {
            continue;
        };

        let mut text_lines: Vec<String> = Vec::new();
        while let Some(&next) = lines.peek() {
            if next.trim().is_empty() {
                break;
            }
            text_lines.push(strip_cue_tags(next));
            lines.next();
        }

        let text = text_lines.join(" ").trim().to_string();
        if text.is_empty() || end_s <= start_s {
            continue;
        }

        // Rolling caption tracks repeat the previous cue's text; keep the
        // first occurrence only.
        if segments.last().map(|prev| prev.text == text).unwrap_or(false) {
            if let Some(prev) = segments.last_mut() {
                prev.end_s = prev.end_s.max(end_s);
            }
            continue;
        }

        segments.push(RawSegment {
            start_s,
            end_s,
            text,
            speaker_label: SpeakerLabel::Unknown,
            speaker_confidence: None,
            avg_logprob: None,
            compression_ratio: None,
            no_speech_prob: None,
            temperature_used: None,
            is_overlap: false,
            needs_refinement: false,
            words: Vec::new(),
        });
    }

    if segments.is_empty() {
        return Err(IngestError::acquisition("caption track contained no usable cues", false));
    }
    segments.sort_by(|a, b| a.start_s.partial_cmp(&b.start_s).unwrap_or(std::cmp::Ordering::Equal));
    Ok(segments)
}

/// `HH:MM:SS.mmm --> HH:MM:SS.mmm` (hours optional), ignoring cue settings
/// after the end stamp.
fn parse_cue_timing(line: &str) -> Option<(f64, f64)> {
    let (start_raw, rest) = line.split_once("-->")?;
    let end_raw = rest.trim().split_whitespace().next()?;
    Some((parse_timestamp(start_raw.trim())?, parse_timestamp(end_raw)?))
}

fn parse_timestamp(raw: &str) -> Option<f64> {
    let parts: Vec<&str> = raw.split(':').collect();
    let (h, m, s) = match parts.as_slice() {
        [h, m, s] => (h.parse::<f64>().ok()?, m.parse::<f64>().ok()?, s.parse::<f64>().ok()?),
        [m, s] => (0.0, m.parse::<f64>().ok()?, s.parse::<f64>().ok()?),
        _ => return None,
    };
    Some(h * 3600.0 + m * 60.0 + s)
}

fn strip_cue_tags(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_tag = false;
    for c in line.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}
