//! Nearest-match identification over the enrolled descriptor gallery.

use crate::types::{Descriptor, MatchResult};

/// Strategy for finding the enrolled identity nearest to a probe
/// descriptor. The linear scan below is fine for a human-scale roster;
/// an ANN index can be slotted in behind this trait without touching
/// callers.
pub trait Matcher {
    fn find_best(
        &self,
        probe: &Descriptor,
        gallery: &[(String, Descriptor)],
        threshold: f32,
    ) -> Option<MatchResult>;
}

/// Euclidean nearest-within-threshold matcher.
///
/// A candidate becomes the current best only when its distance is
/// strictly below both the threshold and the best distance seen so far,
/// so the first-seen entry wins exact ties.
pub struct NearestMatcher;

impl Matcher for NearestMatcher {
    fn find_best(
        &self,
        probe: &Descriptor,
        gallery: &[(String, Descriptor)],
        threshold: f32,
    ) -> Option<MatchResult> {
        let mut best: Option<(usize, f32)> = None;

        for (i, (_, descriptor)) in gallery.iter().enumerate() {
            let distance = probe.euclidean_distance(descriptor);
            if distance >= threshold {
                continue;
            }
            let improves = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if improves {
                best = Some((i, distance));
            }
        }

        best.map(|(i, distance)| MatchResult {
            student_id: gallery[i].0.clone(),
            distance,
            confidence: (1.0 - distance) * 100.0,
        })
    }
}
