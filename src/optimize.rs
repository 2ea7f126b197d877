/*
 * Channel Ingest CLI - Segment Optimizer
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

use crate::config::SegmentConfig;
use crate::error::IngestError;
use crate::types::{OptimizedSegment, RawSegment, SpeakerLabel};
use std::collections::HashSet;

/// What happens to segments that finished attribution without evidence.
/// `default_to_host` is only ever set when speaker identification did NOT
/// run (captions, speaker ID disabled) on a host-dominant channel;
/// evidence-backed UNKNOWN labels are never rewritten.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelPolicy {
    pub default_to_host: bool,
}

/// Optimizer output plus the counters the caller logs and aggregates.
#[derive(Debug, Clone)]
pub struct OptimizeReport {
    pub segments: Vec<OptimizedSegment>,
    pub duplicates_removed: usize,
    pub default_labels_applied: usize,
}

/// Convert raw ASR output into retrieval-sized, speaker-homogeneous,
/// deduplicated units. Pure function of its inputs and config; passes run
/// in a fixed order: merge, split, dedup, coalesce, default-label.
pub fn optimize(
    raw: &[RawSegment],
    config: &SegmentConfig,
    policy: LabelPolicy,
) -> Result<OptimizeReport, IngestError> {
    if raw.is_empty() {
        return Ok(OptimizeReport { segments: Vec::new(), duplicates_removed: 0, default_labels_applied: 0 });
    }

    let mut segments: Vec<OptimizedSegment> = raw
        .iter()
        .filter(|s| !s.text.trim().is_empty() && s.end_s > s.start_s && s.start_s >= 0.0)
        .map(OptimizedSegment::from)
        .collect();
    segments.sort_by(|a, b| a.start_s.partial_cmp(&b.start_s).unwrap_or(std::cmp::Ordering::Equal));

    let (segments, merge_duplicates) = merge_pass(segments, config);
    let segments = split_pass(segments, config);
    let (segments, dedup_duplicates) = dedup_pass(segments);
    let segments = coalesce_pass(segments, config);
    let (segments, default_labels_applied) = default_label_pass(segments, policy);
    let duplicates_removed = merge_duplicates + dedup_duplicates;

    if segments.is_empty() {
        // Non-empty input collapsing to nothing means a pass ate real
        // content; that is a bug, not a data problem.
        return Err(IngestError::Optimizer(format!(
            "optimizer produced empty output from {} raw segments",
            raw.len()
        )));
    }

    #[cfg(debug_assertions)]
    if let Err(violation) = validate_invariants(&segments, config) {
        return Err(IngestError::Optimizer(violation));
    }

    Ok(OptimizeReport { segments, duplicates_removed, default_labels_applied })
}

/// Canonical text form used for dedup and the store's uniqueness key:
/// lowercased, whitespace collapsed, leading/trailing punctuation trimmed.
pub fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_string()
}

/// Sweep in start order, growing an accumulator while the next segment has
/// the same speaker, a small enough gap, and the union stays within the
/// duration and hard character caps. The accumulator closes once it
/// reaches the target length. A chunk repeating the accumulator's latest
/// text verbatim (the ASR's looping pathology) is swallowed and counted
/// instead of appended.
fn merge_pass(
    segments: Vec<OptimizedSegment>,
    config: &SegmentConfig,
) -> (Vec<OptimizedSegment>, usize) {
    let mut out: Vec<OptimizedSegment> = Vec::with_capacity(segments.len());
    let mut last_chunk_norm = String::new();
    let mut suppressed = 0usize;

    for segment in segments {
        match out.last_mut() {
            Some(acc)
                if acc.speaker_label == segment.speaker_label
                    && segment.start_s - acc.end_s <= config.max_gap_s
                    && segment.end_s - acc.start_s <= config.max_duration_s =>
            {
                let norm = normalize_text(&segment.text);
                if norm == last_chunk_norm {
                    acc.end_s = acc.end_s.max(segment.end_s);
                    suppressed += 1;
                    continue;
                }
                if acc.text.chars().count() < config.max_chars
                    && acc.text.chars().count() + 1 + segment.text.chars().count()
                        <= config.hard_cap_chars
                {
                    merge_into(acc, &segment);
                    last_chunk_norm = norm;
                } else {
                    last_chunk_norm = norm;
                    out.push(segment);
                }
            }
            _ => {
                last_chunk_norm = normalize_text(&segment.text);
                out.push(segment);
            }
        }
    }
    (out, suppressed)
}

fn merge_into(acc: &mut OptimizedSegment, next: &OptimizedSegment) {
    acc.text.push(' ');
    acc.text.push_str(&next.text);
    acc.end_s = acc.end_s.max(next.end_s);
    acc.is_overlap |= next.is_overlap;
    // Quality metrics keep the worse side so a merged unit never looks
    // cleaner than its weakest part.
    acc.avg_logprob = min_opt(acc.avg_logprob, next.avg_logprob);
    acc.no_speech_prob = max_opt(acc.no_speech_prob, next.no_speech_prob);
    acc.compression_ratio = max_opt(acc.compression_ratio, next.compression_ratio);
    acc.speaker_confidence = min_opt(acc.speaker_confidence, next.speaker_confidence);
}

/// Any segment above the hard cap is cut at sentence boundaries (then
/// semicolons, then the longest whitespace run), with `overlap_chars` from
/// the end of each piece re-prepended to the next. Timing interpolates
/// proportional to character offset in the original text.
fn split_pass(segments: Vec<OptimizedSegment>, config: &SegmentConfig) -> Vec<OptimizedSegment> {
    let mut out = Vec::with_capacity(segments.len());
    for segment in segments {
        if segment.text.chars().count() <= config.hard_cap_chars {
            out.push(segment);
        } else {
            out.extend(split_segment(segment, config));
        }
    }
    out
}

fn split_segment(segment: OptimizedSegment, config: &SegmentConfig) -> Vec<OptimizedSegment> {
    let chars: Vec<char> = segment.text.chars().collect();
    let total = chars.len();
    let span = segment.end_s - segment.start_s;
    // Leave room for the overlap prefix and joining space later pieces get.
    let target = config.hard_cap_chars.saturating_sub(config.overlap_chars + 1).max(1);

    let mut pieces = Vec::new();
    let mut cursor = 0usize;
    let mut carry = String::new();

    while cursor < total {
        let remaining = total - cursor;
        let core_len = if remaining <= target { remaining } else { find_cut(&chars[cursor..], target) };
        let core: String = chars[cursor..cursor + core_len].iter().collect();

        let start_s = segment.start_s + span * (cursor as f64 / total as f64);
        let end_s = segment.start_s + span * ((cursor + core_len) as f64 / total as f64);

        let text = if carry.is_empty() {
            core.trim().to_string()
        } else {
            format!("{} {}", carry.trim(), core.trim())
        };

        carry = core
            .chars()
            .rev()
            .take(config.overlap_chars)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        if !text.is_empty() {
            pieces.push(OptimizedSegment { start_s, end_s, text, ..segment.clone() });
        }
        cursor += core_len;
    }
    pieces
}

/// Best cut position within the first `target` characters: the last
/// sentence end, else the last semicolon, else the middle of the longest
/// whitespace run, else a hard cut.
fn find_cut(chars: &[char], target: usize) -> usize {
    let window = &chars[..target.min(chars.len())];
    let floor = target / 4;

    let sentence_end = window
        .iter()
        .enumerate()
        .rev()
        .find(|(i, c)| {
            matches!(c, '.' | '?' | '!')
                && window.get(i + 1).map(|n| n.is_whitespace()).unwrap_or(true)
        })
        .map(|(i, _)| i + 1);
    if let Some(cut) = sentence_end {
        if cut > floor {
            return cut;
        }
    }

    let semicolon = window.iter().rposition(|c| *c == ';').map(|i| i + 1);
    if let Some(cut) = semicolon {
        if cut > floor {
            return cut;
        }
    }

    // Longest whitespace run, cut at its end.
    let mut best: Option<(usize, usize)> = None; // (run length, end index)
    let mut run_start: Option<usize> = None;
    for (i, c) in window.iter().enumerate() {
        if c.is_whitespace() {
            run_start.get_or_insert(i);
        } else if let Some(start) = run_start.take() {
            let len = i - start;
            if best.map(|(b, _)| len > b).unwrap_or(true) && i > floor {
                best = Some((len, i));
            }
        }
    }
    if let Some((_, cut)) = best {
        return cut;
    }

    target.min(chars.len())
}

/// Within one video, keep only the first occurrence of each normalized
/// text. Kills the repeated-short-segment pathology of the ASR backend.
fn dedup_pass(segments: Vec<OptimizedSegment>) -> (Vec<OptimizedSegment>, usize) {
    let mut seen: HashSet<String> = HashSet::with_capacity(segments.len());
    let before = segments.len();
    let kept: Vec<OptimizedSegment> = segments
        .into_iter()
        .filter(|segment| seen.insert(normalize_text(&segment.text)))
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}

/// Merge stranded micro-segments into a same-speaker neighbour, preferring
/// forward, ignoring the gap limit. Bounded by the duration and hard
/// character caps so no other invariant breaks.
fn coalesce_pass(segments: Vec<OptimizedSegment>, config: &SegmentConfig) -> Vec<OptimizedSegment> {
    if segments.len() < 2 {
        return segments;
    }

    let fits = |a: &OptimizedSegment, b: &OptimizedSegment| {
        a.speaker_label == b.speaker_label
            && b.end_s.max(a.end_s) - a.start_s.min(b.start_s) <= config.max_duration_s
            && a.text.chars().count() + 1 + b.text.chars().count() <= config.hard_cap_chars
    };

    let mut segments = segments;
    let mut i = 0;
    while i < segments.len() {
        if segments[i].text.chars().count() >= config.min_coalesce_chars {
            i += 1;
            continue;
        }

        if i + 1 < segments.len() && fits(&segments[i], &segments[i + 1]) {
            let micro = segments.remove(i);
            let neighbour = &mut segments[i];
            neighbour.start_s = neighbour.start_s.min(micro.start_s);
            neighbour.end_s = neighbour.end_s.max(micro.end_s);
            neighbour.text = format!("{} {}", micro.text, neighbour.text);
            neighbour.is_overlap |= micro.is_overlap;
            neighbour.speaker_confidence =
                min_opt(neighbour.speaker_confidence, micro.speaker_confidence);
            // Re-examine position i: the combined unit may still be micro.
        } else if i > 0 && fits(&segments[i - 1], &segments[i]) {
            let micro = segments.remove(i);
            merge_into(&mut segments[i - 1], &micro);
        } else {
            // No same-speaker neighbour fits: kept as-is, never dropped.
            i += 1;
        }
    }
    segments
}

fn default_label_pass(
    mut segments: Vec<OptimizedSegment>,
    policy: LabelPolicy,
) -> (Vec<OptimizedSegment>, usize) {
    if !policy.default_to_host {
        return (segments, 0);
    }
    let mut applied = 0;
    for segment in &mut segments {
        if segment.speaker_label == SpeakerLabel::Unknown && segment.speaker_confidence.is_none() {
            segment.speaker_label = SpeakerLabel::Host;
            applied += 1;
        }
    }
    if applied > 0 {
        tracing::info!("default-label policy rewrote {applied} unlabeled segments to HOST");
    }
    (segments, applied)
}

/// Post-optimization invariants. Run on every output in debug builds;
/// exposed for tests.
pub fn validate_invariants(
    segments: &[OptimizedSegment],
    config: &SegmentConfig,
) -> Result<(), String> {
    let mut seen = HashSet::new();
    let mut last_start = f64::NEG_INFINITY;

    for (i, segment) in segments.iter().enumerate() {
        if segment.start_s < 0.0 {
            return Err(format!("segment {i} has negative start {}", segment.start_s));
        }
        if segment.end_s <= segment.start_s {
            return Err(format!(
                "segment {i} has non-positive span [{}, {}]",
                segment.start_s, segment.end_s
            ));
        }
        if segment.text.chars().count() > config.hard_cap_chars {
            return Err(format!(
                "segment {i} exceeds hard cap: {} > {}",
                segment.text.chars().count(),
                config.hard_cap_chars
            ));
        }
        if segment.start_s < last_start {
            return Err(format!("segment {i} breaks start-time ordering"));
        }
        last_start = segment.start_s;
        if !seen.insert(normalize_text(&segment.text)) {
            return Err(format!("segment {i} duplicates normalized text"));
        }
    }
    Ok(())
}

fn min_opt(a: Option<f32>, b: Option<f32>) -> Option<f32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn max_opt(a: Option<f32>, b: Option<f32>) -> Option<f32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(start: f64, end: f64, text: &str, label: SpeakerLabel) -> RawSegment {
        RawSegment {
            start_s: start,
            end_s: end,
            text: text.to_string(),
            speaker_label: label,
            speaker_confidence: if label == SpeakerLabel::Unknown { None } else { Some(0.9) },
            avg_logprob: Some(-0.25),
            compression_ratio: Some(1.2),
            no_speech_prob: Some(0.02),
            temperature_used: Some(0.0),
            is_overlap: false,
            needs_refinement: false,
            words: Vec::new(),
        }
    }

    fn config() -> SegmentConfig {
        SegmentConfig::default()
    }

    #[test]
    fn empty_input_is_empty_output() {
        let report = optimize(&[], &config(), LabelPolicy::default()).unwrap();
        assert!(report.segments.is_empty());
        assert_eq!(report.duplicates_removed, 0);
    }

    #[test]
    fn monologue_merges_into_single_segment() {
        // Ten 120-char host segments over 60 seconds collapse into one.
        let sentence = "a".repeat(110) + " ok end.Z"; // 119 chars + merge spaces
        let raw_segments: Vec<RawSegment> = (0..10)
            .map(|i| raw(i as f64 * 6.0, i as f64 * 6.0 + 5.5, &sentence.replace('Z', &i.to_string()), SpeakerLabel::Host))
            .collect();

        let report = optimize(&raw_segments, &config(), LabelPolicy::default()).unwrap();
        assert_eq!(report.segments.len(), 1);
        let merged = &report.segments[0];
        assert_eq!(merged.speaker_label, SpeakerLabel::Host);
        assert!(merged.start_s.abs() < 1e-9);
        assert!((merged.end_s - 59.5).abs() < 1e-9);
        assert!(merged.text.chars().count() <= config().hard_cap_chars);
    }

    #[test]
    fn merge_never_crosses_speakers() {
        let raw_segments = vec![
            raw(0.0, 5.0, "host speaking for a while here", SpeakerLabel::Host),
            raw(5.2, 10.0, "guest replying with something", SpeakerLabel::Unknown),
            raw(10.2, 15.0, "host coming back again now", SpeakerLabel::Host),
        ];
        let report = optimize(&raw_segments, &config(), LabelPolicy::default()).unwrap();
        assert_eq!(report.segments.len(), 3);
        for segment in &report.segments {
            assert!(matches!(segment.speaker_label, SpeakerLabel::Host | SpeakerLabel::Unknown));
        }
    }

    #[test]
    fn merge_respects_gap_limit() {
        let raw_segments = vec![
            raw(0.0, 5.0, "the first chunk of host speech runs for a comfortable while", SpeakerLabel::Host),
            raw(30.0, 35.0, "the second chunk resumes after a long stretch of silence", SpeakerLabel::Host),
        ];
        let report = optimize(&raw_segments, &config(), LabelPolicy::default()).unwrap();
        assert_eq!(report.segments.len(), 2);
    }

    #[test]
    fn oversize_segment_splits_under_hard_cap() {
        let cfg = config();
        let long_text = "This is a sentence that keeps going for a while. ".repeat(80); // ~4000 chars
        let raw_segments = vec![raw(0.0, 400.0, long_text.trim(), SpeakerLabel::Host)];

        let report = optimize(&raw_segments, &cfg, LabelPolicy::default()).unwrap();
        assert!(report.segments.len() >= 2);
        for segment in &report.segments {
            assert!(segment.text.chars().count() <= cfg.hard_cap_chars);
            assert!(segment.end_s > segment.start_s);
        }
        // Timing interpolation covers the original span in order.
        let first = report.segments.first().unwrap();
        let last = report.segments.last().unwrap();
        assert!(first.start_s.abs() < 1e-9);
        assert!((last.end_s - 400.0).abs() < 1.0);
    }

    #[test]
    fn split_pieces_carry_overlap_prefix() {
        let cfg = config();
        let long_text = "Sentence one ends here. ".repeat(120);
        let raw_segments = vec![raw(0.0, 100.0, long_text.trim(), SpeakerLabel::Host)];

        let report = optimize(&raw_segments, &cfg, LabelPolicy::default()).unwrap();
        assert!(report.segments.len() >= 2);
        let head_tail: String = report.segments[0]
            .text
            .chars()
            .rev()
            .take(20)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        assert!(report.segments[1].text.contains(head_tail.trim()));
    }

    #[test]
    fn duplicates_within_video_are_removed_and_counted() {
        // Scenario: the ASR emits 32 copies of "Yeah." in 30 seconds.
        let mut raw_segments = Vec::new();
        for i in 0..32 {
            raw_segments.push(raw(i as f64, i as f64 + 0.8, "Yeah.", SpeakerLabel::Host));
        }
        let report = optimize(&raw_segments, &config(), LabelPolicy::default()).unwrap();

        let yeah_count = report
            .segments
            .iter()
            .filter(|s| normalize_text(&s.text).contains("yeah"))
            .count();
        assert_eq!(yeah_count, 1);
        assert_eq!(report.duplicates_removed, 31);
    }

    #[test]
    fn stranded_micro_segment_with_no_neighbour_is_kept() {
        let raw_segments = vec![raw(0.0, 0.6, "Yeah.", SpeakerLabel::Unknown)];
        let report = optimize(&raw_segments, &config(), LabelPolicy::default()).unwrap();
        assert_eq!(report.segments.len(), 1);
        assert_eq!(report.segments[0].text, "Yeah.");
    }

    #[test]
    fn micro_segment_coalesces_forward_ignoring_gap() {
        let cfg = config();
        let long = "this neighbouring segment is long enough to not be micro at all";
        let raw_segments = vec![
            raw(0.0, 0.5, "Yeah.", SpeakerLabel::Host),
            // Gap far beyond max_gap_s; coalesce ignores it.
            raw(20.0, 25.0, long, SpeakerLabel::Host),
        ];
        let report = optimize(&raw_segments, &cfg, LabelPolicy::default()).unwrap();
        assert_eq!(report.segments.len(), 1);
        assert!(report.segments[0].text.starts_with("Yeah."));
        assert!(report.segments[0].start_s.abs() < 1e-9);
    }

    #[test]
    fn micro_segment_does_not_coalesce_across_speakers() {
        let raw_segments = vec![
            raw(0.0, 0.5, "Yeah.", SpeakerLabel::Unknown),
            raw(20.0, 25.0, "host segment that is comfortably long enough", SpeakerLabel::Host),
        ];
        let report = optimize(&raw_segments, &config(), LabelPolicy::default()).unwrap();
        assert_eq!(report.segments.len(), 2);
    }

    #[test]
    fn default_label_policy_is_gated_by_the_flag() {
        // The policy flag is only ever set when attribution did not run,
        // so an Unknown here carries no evidence.
        let raw_segments =
            vec![raw(0.0, 5.0, "a caption cue with no speaker evidence", SpeakerLabel::Unknown)];

        let report = optimize(
            &raw_segments,
            &config(),
            LabelPolicy { default_to_host: true },
        )
        .unwrap();
        assert_eq!(report.segments[0].speaker_label, SpeakerLabel::Host);
        assert_eq!(report.default_labels_applied, 1);

        let report = optimize(&raw_segments, &config(), LabelPolicy::default()).unwrap();
        assert_eq!(report.segments[0].speaker_label, SpeakerLabel::Unknown);
        assert_eq!(report.default_labels_applied, 0);
    }

    #[test]
    fn optimize_is_idempotent() {
        let long_text = "A fairly normal sentence that ends properly. ".repeat(50);
        let opener = "An opener from the host that is long enough to stand on its own. ".repeat(5);
        let raw_segments = vec![
            raw(0.0, 10.0, opener.trim(), SpeakerLabel::Host),
            raw(10.5, 60.0, long_text.trim(), SpeakerLabel::Host),
            raw(61.0, 61.5, "Yeah.", SpeakerLabel::Host),
            raw(62.0, 70.0, "an unknown speaker closes things out here", SpeakerLabel::Unknown),
        ];
        let cfg = config();

        let once = optimize(&raw_segments, &cfg, LabelPolicy::default()).unwrap();
        let as_raw: Vec<RawSegment> = once
            .segments
            .iter()
            .map(|s| RawSegment {
                start_s: s.start_s,
                end_s: s.end_s,
                text: s.text.clone(),
                speaker_label: s.speaker_label,
                speaker_confidence: s.speaker_confidence,
                avg_logprob: s.avg_logprob,
                compression_ratio: s.compression_ratio,
                no_speech_prob: s.no_speech_prob,
                temperature_used: None,
                is_overlap: s.is_overlap,
                needs_refinement: false,
                words: Vec::new(),
            })
            .collect();
        let twice = optimize(&as_raw, &cfg, LabelPolicy::default()).unwrap();

        assert_eq!(once.segments.len(), twice.segments.len());
        for (a, b) in once.segments.iter().zip(&twice.segments) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.speaker_label, b.speaker_label);
            assert!((a.start_s - b.start_s).abs() < 1e-9);
        }
    }

    #[test]
    fn output_passes_invariant_validation() {
        let raw_segments = vec![
            raw(0.0, 5.0, "first segment of reasonable length here", SpeakerLabel::Host),
            raw(5.1, 9.0, "second segment also fine", SpeakerLabel::Host),
            raw(12.0, 16.0, "an unknown one to finish", SpeakerLabel::Unknown),
        ];
        let cfg = config();
        let report = optimize(&raw_segments, &cfg, LabelPolicy::default()).unwrap();
        assert!(validate_invariants(&report.segments, &cfg).is_ok());
    }

    #[test]
    fn validator_rejects_violations() {
        let cfg = config();
        let good = OptimizedSegment {
            start_s: 0.0,
            end_s: 2.0,
            text: "fine".into(),
            speaker_label: SpeakerLabel::Host,
            speaker_confidence: None,
            avg_logprob: None,
            compression_ratio: None,
            no_speech_prob: None,
            is_overlap: false,
            embedding: None,
        };

        let inverted = OptimizedSegment { start_s: 3.0, end_s: 2.0, ..good.clone() };
        assert!(validate_invariants(&[inverted], &cfg).is_err());

        let duplicate = vec![good.clone(), OptimizedSegment { start_s: 5.0, end_s: 6.0, ..good.clone() }];
        assert!(validate_invariants(&duplicate, &cfg).is_err());

        let oversize = OptimizedSegment { text: "x".repeat(cfg.hard_cap_chars + 1), ..good };
        assert!(validate_invariants(&[oversize], &cfg).is_err());
    }

    #[test]
    fn normalize_text_collapses_case_whitespace_and_punctuation() {
        assert_eq!(normalize_text("  Hello,   WORLD!  "), "hello, world");
        assert_eq!(normalize_text("Yeah."), "yeah");
        assert_eq!(normalize_text("yeah"), normalize_text("  YEAH!!  "));
    }
}
