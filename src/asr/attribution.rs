/*
 * Channel Ingest CLI - Speaker Attribution
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

use crate::config::SpeakerConfig;
use crate::diarize::{cosine_similarity, SpeakerCluster};
use crate::types::SpeakerLabel;
use crate::voices::VoiceProfileStore;
use std::collections::HashMap;

/// Attribution verdict for one diarization cluster. Carries the evidence
/// so segment-level guardrails (overlap bonus, minimum duration) can be
/// re-checked without recomputing similarities.
#[derive(Debug, Clone)]
pub struct ClusterAttribution {
    pub label: SpeakerLabel,
    pub similarity: f32,
    pub margin: f32,
    /// The threshold the winning profile was required to clear.
    pub threshold: f32,
    pub matched_profile: Option<String>,
}

impl ClusterAttribution {
    fn unknown(similarity: f32, margin: f32) -> Self {
        Self { label: SpeakerLabel::Unknown, similarity, margin, threshold: 0.0, matched_profile: None }
    }

    /// Re-evaluate this verdict for a single segment. UNKNOWN is always
    /// safe; a positive label must survive every guardrail.
    pub fn label_for_segment(
        &self,
        duration_s: f64,
        in_overlap: bool,
        config: &SpeakerConfig,
    ) -> (SpeakerLabel, Option<f32>) {
        if self.label == SpeakerLabel::Unknown {
            return (SpeakerLabel::Unknown, None);
        }
        if duration_s < config.min_attribution_duration_s {
            return (SpeakerLabel::Unknown, None);
        }
        // Overlap regions demand a stricter similarity.
        if in_overlap && !(self.similarity > self.threshold + config.overlap_bonus) {
            return (SpeakerLabel::Unknown, None);
        }
        (self.label, Some(self.similarity))
    }
}

/// Compare each cluster centroid against the host and guest profiles and
/// apply the attribution guardrails: similarity floor, top-2 margin. All
/// comparisons use strict inequality; any failed guardrail yields UNKNOWN.
pub fn label_clusters(
    clusters: &[SpeakerCluster],
    profiles: &VoiceProfileStore,
    config: &SpeakerConfig,
) -> HashMap<usize, ClusterAttribution> {
    let mut out = HashMap::new();

    for cluster in clusters {
        out.insert(cluster.id, label_one_cluster(cluster, profiles, config));
    }
    out
}

fn label_one_cluster(
    cluster: &SpeakerCluster,
    profiles: &VoiceProfileStore,
    config: &SpeakerConfig,
) -> ClusterAttribution {
    // (label, name, similarity, required threshold) per enrolled profile.
    let mut candidates: Vec<(SpeakerLabel, String, f32, f32)> = Vec::new();

    if let Some(host) = &profiles.host {
        let sim = cosine_similarity(&cluster.centroid, &host.centroid);
        let threshold = host.threshold_hint.unwrap_or(config.host_min_sim);
        candidates.push((SpeakerLabel::Host, host.name.clone(), sim, threshold));
    }
    for guest in &profiles.guests {
        let sim = cosine_similarity(&cluster.centroid, &guest.centroid);
        let threshold = guest.threshold_hint.unwrap_or(config.guest_min_sim);
        candidates.push((SpeakerLabel::Guest, guest.name.clone(), sim, threshold));
    }

    if candidates.is_empty() {
        return ClusterAttribution::unknown(0.0, 0.0);
    }

    candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    let (label, name, best_sim, threshold) = candidates[0].clone();
    let second_sim = candidates.get(1).map(|c| c.2).unwrap_or(-1.0);
    let margin = best_sim - second_sim.max(0.0);

    if !(best_sim > threshold) {
        tracing::debug!(
            "cluster {} below similarity floor ({best_sim:.3} <= {threshold:.3}) -> UNKNOWN",
            cluster.id
        );
        return ClusterAttribution::unknown(best_sim, margin);
    }
    if candidates.len() > 1 && !(best_sim - second_sim > config.attr_margin) {
        tracing::debug!(
            "cluster {} ambiguous (margin {:.3} <= {:.3}) -> UNKNOWN",
            cluster.id,
            best_sim - second_sim,
            config.attr_margin
        );
        return ClusterAttribution::unknown(best_sim, best_sim - second_sim);
    }

    ClusterAttribution { label, similarity: best_sim, margin, threshold, matched_profile: Some(name) }
}
