/*
 * Channel Ingest CLI - Attribution Pipeline Tests
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

//! End-to-end scenarios for the attribution + alignment + optimizer
//! chain, with diarization and profiles constructed directly so no audio
//! models are involved.

use channel_ingest_rs::asr::alignment::align_segments;
use channel_ingest_rs::asr::attribution::label_clusters;
use channel_ingest_rs::asr::whisper::parse_whisper_json;
use channel_ingest_rs::config::{SegmentConfig, SpeakerConfig};
use channel_ingest_rs::diarize::{Diarization, SpeakerCluster, SpeakerTurn, VOICE_EMBEDDING_DIM};
use channel_ingest_rs::optimize::{optimize, validate_invariants, LabelPolicy};
use channel_ingest_rs::types::{RawSegment, SpeakerLabel};
use channel_ingest_rs::voices::{VoiceProfile, VoiceProfileStore};

fn axis(hot: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; VOICE_EMBEDDING_DIM];
    v[hot] = 1.0;
    v
}

/// Unit vector whose cosine against `axis(0)` is exactly `sim`.
fn with_host_similarity(sim: f32) -> Vec<f32> {
    let mut v = vec![0.0f32; VOICE_EMBEDDING_DIM];
    v[0] = sim;
    v[1] = (1.0 - sim * sim).sqrt();
    v
}

fn profiles_with_host() -> VoiceProfileStore {
    let mut store = VoiceProfileStore::disabled();
    store.host = Some(VoiceProfile {
        name: "host".into(),
        centroid: axis(0),
        sample_count: 10,
        threshold_hint: None,
        created_at: None,
    });
    store
}

fn raw(start: f64, end: f64, text: &str) -> RawSegment {
    RawSegment {
        start_s: start,
        end_s: end,
        text: text.to_string(),
        speaker_label: SpeakerLabel::Unknown,
        speaker_confidence: None,
        avg_logprob: Some(-0.3),
        compression_ratio: Some(1.4),
        no_speech_prob: Some(0.02),
        temperature_used: Some(0.0),
        is_overlap: false,
        needs_refinement: false,
        words: Vec::new(),
    }
}

/// Two-speaker interview: cluster A matches the host at 0.91, cluster B
/// sits at 0.62, below the 0.82 floor. A-side segments become HOST,
/// B-side become UNKNOWN (never GUEST without an enrolled guest), and the
/// optimizer keeps speakers separate.
#[test]
fn two_speaker_interview_attributes_host_and_unknown() {
    let speaker_config = SpeakerConfig::default();
    let profiles = profiles_with_host();

    // Alternating 15 s turns over 5 minutes: even turns cluster 0 (host).
    let turns: Vec<SpeakerTurn> = (0..20)
        .map(|i| SpeakerTurn {
            start_s: i as f64 * 15.0,
            end_s: (i + 1) as f64 * 15.0,
            cluster: i % 2,
            is_overlap: false,
        })
        .collect();
    let diarization = Diarization {
        turns,
        clusters: vec![
            SpeakerCluster {
                id: 0,
                centroid: with_host_similarity(0.91),
                total_speech_s: 150.0,
                window_count: 100,
            },
            SpeakerCluster {
                id: 1,
                centroid: with_host_similarity(0.62),
                total_speech_s: 150.0,
                window_count: 100,
            },
        ],
    };

    // 40 raw ASR segments of 7.5 s each, two per turn.
    let raw_segments: Vec<RawSegment> = (0..40)
        .map(|i| {
            let start = i as f64 * 7.5;
            raw(start, start + 7.3, &format!("segment number {i} with some distinct words"))
        })
        .collect();

    let attributions = label_clusters(&diarization.clusters, &profiles, &speaker_config);
    let aligned = align_segments(raw_segments, &diarization, &attributions, &speaker_config, 300.0);

    for segment in &aligned {
        let turn_index = (segment.start_s / 15.0) as usize % 2;
        match turn_index {
            0 => assert_eq!(segment.speaker_label, SpeakerLabel::Host, "at {}", segment.start_s),
            _ => assert_eq!(segment.speaker_label, SpeakerLabel::Unknown, "at {}", segment.start_s),
        }
        assert_ne!(segment.speaker_label, SpeakerLabel::Guest);
    }

    let segment_config = SegmentConfig::default();
    let report = optimize(&aligned, &segment_config, LabelPolicy::default()).unwrap();
    assert!(report.segments.len() <= 20, "got {} segments", report.segments.len());
    assert!(validate_invariants(&report.segments, &segment_config).is_ok());
    for segment in &report.segments {
        assert!(matches!(segment.speaker_label, SpeakerLabel::Host | SpeakerLabel::Unknown));
    }
}

/// Close-call region: best similarity clears the floor but the margin over
/// the runner-up is 0.026 < attr_margin, so the region is UNKNOWN.
#[test]
fn narrow_margin_region_goes_unknown() {
    let mut speaker_config = SpeakerConfig::default();
    speaker_config.host_min_sim = 0.5;
    speaker_config.guest_min_sim = 0.5;
    speaker_config.attr_margin = 0.05;

    let mut profiles = profiles_with_host();
    profiles.guests.push(VoiceProfile {
        name: "guest-a".into(),
        centroid: axis(1),
        sample_count: 4,
        threshold_hint: None,
        created_at: None,
    });

    // Nearly equidistant from host and guest axes.
    let mut ambiguous = vec![0.0f32; VOICE_EMBEDDING_DIM];
    ambiguous[0] = 0.83;
    ambiguous[1] = 0.80;
    let diarization = Diarization {
        turns: vec![SpeakerTurn { start_s: 0.0, end_s: 3.0, cluster: 0, is_overlap: true }],
        clusters: vec![SpeakerCluster {
            id: 0,
            centroid: ambiguous,
            total_speech_s: 3.0,
            window_count: 2,
        }],
    };

    let attributions = label_clusters(&diarization.clusters, &profiles, &speaker_config);
    let aligned = align_segments(
        vec![raw(0.2, 2.8, "both people talking at once here")],
        &diarization,
        &attributions,
        &speaker_config,
        3.0,
    );

    assert_eq!(aligned.len(), 1);
    assert_eq!(aligned[0].speaker_label, SpeakerLabel::Unknown);
    assert!(aligned[0].is_overlap);
}

/// Whisper JSON straight through alignment and optimization, fast-path
/// style: every segment HOST, one merged retrieval unit, validator clean.
#[test]
fn whisper_output_flows_through_optimizer() {
    let json = serde_json::json!({
        "segments": (0..10).map(|i| serde_json::json!({
            "start": i as f64 * 6.0,
            "end": i as f64 * 6.0 + 5.8,
            "text": format!(" Sentence {i} about a topic, spoken clearly and at length by one person."),
            "avg_logprob": -0.2,
            "compression_ratio": 1.3,
            "no_speech_prob": 0.01,
            "temperature": 0.0
        })).collect::<Vec<_>>()
    })
    .to_string();

    let mut segments = parse_whisper_json(&json).unwrap();
    for segment in &mut segments {
        segment.speaker_label = SpeakerLabel::Host;
        segment.speaker_confidence = Some(0.93);
    }

    let segment_config = SegmentConfig::default();
    let report = optimize(&segments, &segment_config, LabelPolicy::default()).unwrap();
    assert_eq!(report.segments.len(), 1);
    assert_eq!(report.segments[0].speaker_label, SpeakerLabel::Host);
    assert!((report.segments[0].start_s - 0.0).abs() < 1e-9);
    assert!((report.segments[0].end_s - 59.8).abs() < 1e-9);
    assert!(validate_invariants(&report.segments, &segment_config).is_ok());
}

/// An ASR segment that spans a host turn and an unknown turn is split at
/// the boundary; no optimized segment ends up with mixed speakers.
#[test]
fn boundary_spanning_segment_never_mixes_speakers() {
    let speaker_config = SpeakerConfig::default();
    let profiles = profiles_with_host();

    let diarization = Diarization {
        turns: vec![
            SpeakerTurn { start_s: 0.0, end_s: 10.0, cluster: 0, is_overlap: false },
            SpeakerTurn { start_s: 10.0, end_s: 20.0, cluster: 1, is_overlap: false },
        ],
        clusters: vec![
            SpeakerCluster {
                id: 0,
                centroid: with_host_similarity(0.95),
                total_speech_s: 10.0,
                window_count: 6,
            },
            SpeakerCluster {
                id: 1,
                centroid: with_host_similarity(0.30),
                total_speech_s: 10.0,
                window_count: 6,
            },
        ],
    };

    let attributions = label_clusters(&diarization.clusters, &profiles, &speaker_config);
    let aligned = align_segments(
        vec![raw(6.0, 14.0, "the host finishes a thought and the guest starts their answer")],
        &diarization,
        &attributions,
        &speaker_config,
        20.0,
    );

    assert_eq!(aligned.len(), 2);
    assert_eq!(aligned[0].speaker_label, SpeakerLabel::Host);
    assert_eq!(aligned[1].speaker_label, SpeakerLabel::Unknown);
    assert!((aligned[0].end_s - 10.0).abs() < 1e-9);
    assert!((aligned[1].start_s - 10.0).abs() < 1e-9);

    let report = optimize(&aligned, &SegmentConfig::default(), LabelPolicy::default()).unwrap();
    for segment in &report.segments {
        assert!(matches!(segment.speaker_label, SpeakerLabel::Host | SpeakerLabel::Unknown));
    }
}
