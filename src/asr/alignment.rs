/*
 * Channel Ingest CLI - ASR / Diarization Alignment
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

use crate::asr::attribution::ClusterAttribution;
use crate::config::SpeakerConfig;
use crate::diarize::{Diarization, SpeakerTurn};
use crate::types::{RawSegment, SpeakerLabel, WordTiming};
use std::collections::HashMap;

/// Intersect ASR segments with diarization turns and stamp speaker labels.
///
/// A segment inside a single turn takes that turn's verdict whole. A
/// segment spanning several turns is split at the turn boundaries; text is
/// redistributed by word timestamps when the backend provided them,
/// proportionally by characters otherwise. Uncovered spans stay UNKNOWN
/// and are flagged for refinement.
pub fn align_segments(
    asr: Vec<RawSegment>,
    diarization: &Diarization,
    attributions: &HashMap<usize, ClusterAttribution>,
    config: &SpeakerConfig,
    media_duration_s: f64,
) -> Vec<RawSegment> {
    let mut out: Vec<RawSegment> = Vec::with_capacity(asr.len());

    for mut segment in asr {
        // Timing values are clamped to the artifact before anything else.
        segment.start_s = segment.start_s.clamp(0.0, media_duration_s);
        segment.end_s = segment.end_s.clamp(0.0, media_duration_s);
        if segment.end_s <= segment.start_s {
            continue;
        }

        let overlapping: Vec<&SpeakerTurn> = diarization
            .turns
            .iter()
            .filter(|turn| turn.start_s < segment.end_s && turn.end_s > segment.start_s)
            .collect();

        match overlapping.len() {
            0 => {
                segment.speaker_label = SpeakerLabel::Unknown;
                segment.speaker_confidence = None;
                segment.needs_refinement = true;
                out.push(segment);
            }
            1 => {
                let turn = overlapping[0];
                apply_turn(&mut segment, turn, attributions, config);
                out.push(segment);
            }
            _ => out.extend(split_across_turns(segment, &overlapping, attributions, config)),
        }
    }

    out.sort_by(|a, b| a.start_s.partial_cmp(&b.start_s).unwrap_or(std::cmp::Ordering::Equal));
    out
}

fn apply_turn(
    segment: &mut RawSegment,
    turn: &SpeakerTurn,
    attributions: &HashMap<usize, ClusterAttribution>,
    config: &SpeakerConfig,
) {
    segment.is_overlap = turn.is_overlap;
    match attributions.get(&turn.cluster) {
        Some(verdict) => {
            let (label, confidence) =
                verdict.label_for_segment(segment.duration_s(), turn.is_overlap, config);
            segment.speaker_label = label;
            segment.speaker_confidence = confidence;
        }
        None => {
            segment.speaker_label = SpeakerLabel::Unknown;
            segment.speaker_confidence = None;
        }
    }
}

fn split_across_turns(
    segment: RawSegment,
    turns: &[&SpeakerTurn],
    attributions: &HashMap<usize, ClusterAttribution>,
    config: &SpeakerConfig,
) -> Vec<RawSegment> {
    // Cut points: every turn edge strictly inside the segment.
    let mut cuts: Vec<f64> = vec![segment.start_s];
    for turn in turns {
        for edge in [turn.start_s, turn.end_s] {
            if edge > segment.start_s && edge < segment.end_s {
                cuts.push(edge);
            }
        }
    }
    cuts.push(segment.end_s);
    cuts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    cuts.dedup_by(|a, b| (*a - *b).abs() < 1e-6);

    let spans: Vec<(f64, f64)> = cuts.windows(2).map(|w| (w[0], w[1])).collect();
    let texts = if segment.words.is_empty() {
        split_text_proportionally(&segment.text, &spans, segment.start_s, segment.end_s)
    } else {
        split_text_by_words(&segment.words, &spans)
    };

    let mut pieces = Vec::new();
    for ((span_start, span_end), text) in spans.into_iter().zip(texts) {
        let text = text.trim().to_string();
        if text.is_empty() {
            continue;
        }
        let mut piece = RawSegment {
            start_s: span_start,
            end_s: span_end,
            text,
            speaker_label: SpeakerLabel::Unknown,
            speaker_confidence: None,
            avg_logprob: segment.avg_logprob,
            compression_ratio: segment.compression_ratio,
            no_speech_prob: segment.no_speech_prob,
            temperature_used: segment.temperature_used,
            is_overlap: false,
            needs_refinement: false,
            words: words_within(&segment.words, span_start, span_end),
        };

        let midpoint = (span_start + span_end) / 2.0;
        match turns.iter().find(|t| midpoint >= t.start_s && midpoint < t.end_s) {
            Some(turn) => apply_turn(&mut piece, turn, attributions, config),
            None => piece.needs_refinement = true,
        }
        pieces.push(piece);
    }
    pieces
}

/// Distribute text across spans proportional to their share of the
/// segment duration, cutting at the whitespace nearest each target
/// offset so words never split mid-character.
fn split_text_proportionally(
    text: &str,
    spans: &[(f64, f64)],
    start_s: f64,
    end_s: f64,
) -> Vec<String> {
    let total = (end_s - start_s).max(1e-9);
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::with_capacity(spans.len());
    let mut cursor = 0usize;

    for (i, &(_, span_end)) in spans.iter().enumerate() {
        if i == spans.len() - 1 {
            out.push(chars[cursor..].iter().collect());
            break;
        }
        let target = (((span_end - start_s) / total) * chars.len() as f64) as usize;
        let cut = nearest_whitespace(&chars, target.clamp(cursor, chars.len()));
        out.push(chars[cursor..cut].iter().collect());
        cursor = cut;
    }
    while out.len() < spans.len() {
        out.push(String::new());
    }
    out
}

fn split_text_by_words(words: &[WordTiming], spans: &[(f64, f64)]) -> Vec<String> {
    spans
        .iter()
        .map(|&(span_start, span_end)| {
            words
                .iter()
                .filter(|w| {
                    let mid = (w.start_s + w.end_s) / 2.0;
                    mid >= span_start && mid < span_end
                })
                .map(|w| w.word.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

fn words_within(words: &[WordTiming], start_s: f64, end_s: f64) -> Vec<WordTiming> {
    words
        .iter()
        .filter(|w| {
            let mid = (w.start_s + w.end_s) / 2.0;
            mid >= start_s && mid < end_s
        })
        .cloned()
        .collect()
}

fn nearest_whitespace(chars: &[char], target: usize) -> usize {
    if target >= chars.len() {
        return chars.len();
    }
    let mut best = target;
    let mut best_distance = usize::MAX;
    for (i, &c) in chars.iter().enumerate() {
        if c.is_whitespace() {
            let distance = i.abs_diff(target);
            if distance < best_distance {
                best = i;
                best_distance = distance;
            }
        }
    }
    if best_distance == usize::MAX {
        target
    } else {
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diarize::SpeakerCluster;

    fn segment(start: f64, end: f64, text: &str) -> RawSegment {
        RawSegment {
            start_s: start,
            end_s: end,
            text: text.to_string(),
            speaker_label: SpeakerLabel::Unknown,
            speaker_confidence: None,
            avg_logprob: Some(-0.2),
            compression_ratio: Some(1.2),
            no_speech_prob: Some(0.01),
            temperature_used: Some(0.0),
            is_overlap: false,
            needs_refinement: false,
            words: Vec::new(),
        }
    }

    fn host_verdict() -> ClusterAttribution {
        ClusterAttribution {
            label: SpeakerLabel::Host,
            similarity: 0.9,
            margin: 0.3,
            threshold: 0.82,
            matched_profile: Some("host".into()),
        }
    }

    fn diarization(turns: Vec<SpeakerTurn>) -> Diarization {
        let max_cluster = turns.iter().map(|t| t.cluster).max().unwrap_or(0);
        let clusters = (0..=max_cluster)
            .map(|id| SpeakerCluster {
                id,
                centroid: vec![1.0, 0.0],
                total_speech_s: 10.0,
                window_count: 5,
            })
            .collect();
        Diarization { turns, clusters }
    }

    #[test]
    fn single_turn_labels_whole_segment() {
        let diar = diarization(vec![SpeakerTurn { start_s: 0.0, end_s: 10.0, cluster: 0, is_overlap: false }]);
        let mut attributions = HashMap::new();
        attributions.insert(0, host_verdict());

        let out = align_segments(
            vec![segment(1.0, 5.0, "hello there everyone")],
            &diar,
            &attributions,
            &SpeakerConfig::default(),
            10.0,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].speaker_label, SpeakerLabel::Host);
        assert_eq!(out[0].speaker_confidence, Some(0.9));
    }

    #[test]
    fn segment_spanning_two_clusters_is_split_proportionally() {
        let diar = diarization(vec![
            SpeakerTurn { start_s: 0.0, end_s: 5.0, cluster: 0, is_overlap: false },
            SpeakerTurn { start_s: 5.0, end_s: 10.0, cluster: 1, is_overlap: false },
        ]);
        let mut attributions = HashMap::new();
        attributions.insert(0, host_verdict());
        attributions.insert(1, ClusterAttribution::unknown_for_tests());

        let text = "one two three four five six seven eight";
        let out = align_segments(
            vec![segment(0.0, 10.0, text)],
            &diar,
            &attributions,
            &SpeakerConfig::default(),
            10.0,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].speaker_label, SpeakerLabel::Host);
        assert_eq!(out[1].speaker_label, SpeakerLabel::Unknown);
        assert!((out[0].end_s - 5.0).abs() < 1e-9);
        // Roughly half the words land on each side, none duplicated.
        let rejoined = format!("{} {}", out[0].text, out[1].text);
        assert_eq!(rejoined.split_whitespace().count(), 8);
    }

    #[test]
    fn word_timestamps_split_exactly() {
        let diar = diarization(vec![
            SpeakerTurn { start_s: 0.0, end_s: 2.0, cluster: 0, is_overlap: false },
            SpeakerTurn { start_s: 2.0, end_s: 4.0, cluster: 1, is_overlap: false },
        ]);
        let mut attributions = HashMap::new();
        attributions.insert(0, host_verdict());
        attributions.insert(1, host_verdict());

        let mut seg = segment(0.0, 4.0, "alpha beta gamma delta");
        seg.words = vec![
            WordTiming { start_s: 0.0, end_s: 0.9, word: "alpha".into() },
            WordTiming { start_s: 0.9, end_s: 1.8, word: "beta".into() },
            WordTiming { start_s: 2.1, end_s: 3.0, word: "gamma".into() },
            WordTiming { start_s: 3.0, end_s: 3.9, word: "delta".into() },
        ];

        let out =
            align_segments(vec![seg], &diar, &attributions, &SpeakerConfig::default(), 4.0);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text, "alpha beta");
        assert_eq!(out[1].text, "gamma delta");
    }

    #[test]
    fn uncovered_segment_stays_unknown_and_flagged() {
        let diar = diarization(vec![SpeakerTurn { start_s: 20.0, end_s: 30.0, cluster: 0, is_overlap: false }]);
        let mut attributions = HashMap::new();
        attributions.insert(0, host_verdict());

        let out = align_segments(
            vec![segment(1.0, 5.0, "nobody was diarized here")],
            &diar,
            &attributions,
            &SpeakerConfig::default(),
            30.0,
        );
        assert_eq!(out[0].speaker_label, SpeakerLabel::Unknown);
        assert!(out[0].needs_refinement);
    }

    #[test]
    fn timings_are_clamped_to_media_duration() {
        let diar = diarization(vec![SpeakerTurn { start_s: 0.0, end_s: 60.0, cluster: 0, is_overlap: false }]);
        let mut attributions = HashMap::new();
        attributions.insert(0, host_verdict());

        let out = align_segments(
            vec![segment(58.0, 65.0, "runs past the end")],
            &diar,
            &attributions,
            &SpeakerConfig::default(),
            60.0,
        );
        assert!((out[0].end_s - 60.0).abs() < 1e-9);
    }

    impl ClusterAttribution {
        fn unknown_for_tests() -> Self {
            Self {
                label: SpeakerLabel::Unknown,
                similarity: 0.5,
                margin: 0.01,
                threshold: 0.0,
                matched_profile: None,
            }
        }
    }
}
