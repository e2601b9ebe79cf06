//! Nearest-signature search with a deployment-wide acceptance threshold.

use crate::types::{FaceSignature, IdentityId};

/// Default acceptance threshold in Euclidean distance units.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// A stored signature offered as a match candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub identity_id: IdentityId,
    pub signature: FaceSignature,
}

/// Outcome of matching one query against a candidate population.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    Accepted {
        identity_id: IdentityId,
        distance: f32,
    },
    /// No candidate within the threshold. `closest` is the best distance seen,
    /// if any comparable candidate existed.
    NoMatch { closest: Option<f32> },
}

impl MatchDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Running minimum over a stream of candidates.
///
/// Candidates are fed one at a time so a store can stream rows straight from
/// its cursor. The first candidate reaching the minimum distance is kept;
/// later equal distances do not replace it.
#[derive(Debug)]
pub struct BestMatch<'q> {
    query: &'q FaceSignature,
    best: Option<(IdentityId, f32)>,
    compared: usize,
    skipped: usize,
}

impl<'q> BestMatch<'q> {
    pub fn new(query: &'q FaceSignature) -> Self {
        Self {
            query,
            best: None,
            compared: 0,
            skipped: 0,
        }
    }

    pub fn offer(&mut self, identity_id: IdentityId, signature: &FaceSignature) {
        let Some(distance) = self.query.distance(signature) else {
            self.skipped += 1;
            return;
        };
        self.compared += 1;
        // NaN never compares below anything, so it cannot win.
        let better = match self.best {
            None => !distance.is_nan(),
            Some((_, best)) => distance < best,
        };
        if better {
            self.best = Some((identity_id, distance));
        }
    }

    pub fn compared(&self) -> usize {
        self.compared
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Accept the running minimum iff it is strictly below `threshold`.
    pub fn decide(&self, threshold: f32) -> MatchDecision {
        if self.skipped > 0 {
            tracing::warn!(
                skipped = self.skipped,
                dimension = self.query.dimension(),
                "ignored candidates with mismatched signature dimension"
            );
        }
        match self.best {
            Some((identity_id, distance)) if distance < threshold => MatchDecision::Accepted {
                identity_id,
                distance,
            },
            best => MatchDecision::NoMatch {
                closest: best.map(|(_, d)| d),
            },
        }
    }
}

/// Linear-scan matcher over Euclidean distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EuclideanMatcher {
    threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Start an incremental search for `query`.
    pub fn begin<'q>(&self, query: &'q FaceSignature) -> BestMatch<'q> {
        BestMatch::new(query)
    }

    pub fn find_best_match<I>(&self, query: &FaceSignature, candidates: I) -> MatchDecision
    where
        I: IntoIterator<Item = Candidate>,
    {
        let mut best = self.begin(query);
        for candidate in candidates {
            best.offer(candidate.identity_id, &candidate.signature);
        }
        best.decide(self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(values: &[f32]) -> FaceSignature {
        FaceSignature::new(values.to_vec(), None)
    }

    fn cand(identity_id: IdentityId, values: &[f32]) -> Candidate {
        Candidate { identity_id, signature: sig(values) }
    }

    #[test]
    fn test_identical_signature_accepted_at_zero() {
        let query = sig(&[0.6, 0.8, 0.0]);
        let decision = EuclideanMatcher::default()
            .find_best_match(&query, vec![cand(7, &[0.6, 0.8, 0.0])]);
        assert_eq!(decision, MatchDecision::Accepted { identity_id: 7, distance: 0.0 });
    }

    #[test]
    fn test_picks_nearest_in_full_scan() {
        let query = sig(&[1.0, 0.0, 0.0]);
        let candidates = vec![
            cand(1, &[0.0, 1.0, 0.0]),
            cand(2, &[0.0, 0.0, 1.0]),
            cand(3, &[0.9, 0.1, 0.0]),
        ];
        match EuclideanMatcher::default().find_best_match(&query, candidates) {
            MatchDecision::Accepted { identity_id, distance } => {
                assert_eq!(identity_id, 3);
                assert!((distance - 0.02f32.sqrt()).abs() < 1e-6);
            }
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn test_distance_at_threshold_is_rejected() {
        let query = sig(&[0.0, 0.0]);
        let decision = EuclideanMatcher::new(0.5).find_best_match(&query, vec![cand(1, &[0.5, 0.0])]);
        assert_eq!(decision, MatchDecision::NoMatch { closest: Some(0.5) });
    }

    #[test]
    fn test_empty_population_is_no_match() {
        let decision = EuclideanMatcher::default().find_best_match(&sig(&[1.0]), vec![]);
        assert_eq!(decision, MatchDecision::NoMatch { closest: None });
        assert!(!decision.is_accepted());
    }

    #[test]
    fn test_tie_keeps_first_encountered() {
        let query = sig(&[0.0, 0.0]);
        let candidates = vec![cand(4, &[0.1, 0.0]), cand(9, &[0.0, 0.1]), cand(5, &[-0.1, 0.0])];
        match EuclideanMatcher::default().find_best_match(&query, candidates) {
            MatchDecision::Accepted { identity_id, .. } => assert_eq!(identity_id, 4),
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn test_nan_candidate_never_wins() {
        let query = sig(&[0.0, 0.0]);
        let candidates = vec![cand(1, &[f32::NAN, 0.0]), cand(2, &[0.3, 0.0])];
        match EuclideanMatcher::default().find_best_match(&query, candidates) {
            MatchDecision::Accepted { identity_id, .. } => assert_eq!(identity_id, 2),
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn test_mismatched_dimension_skipped() {
        let query = sig(&[1.0, 0.0]);
        let matcher = EuclideanMatcher::default();
        let mut best = matcher.begin(&query);
        best.offer(1, &sig(&[1.0, 0.0, 0.0]));
        best.offer(2, &sig(&[1.0, 0.1]));
        assert_eq!((best.compared(), best.skipped()), (1, 1));
        assert!(matches!(
            best.decide(matcher.threshold()),
            MatchDecision::Accepted { identity_id: 2, .. }
        ));
    }

    #[test]
    fn test_threshold_monotonicity() {
        let query = sig(&[0.0, 0.0, 0.0]);
        let population = vec![
            cand(1, &[0.7, 0.0, 0.0]),
            cand(2, &[0.0, 0.9, 0.1]),
            cand(3, &[0.3, 0.3, 0.3]),
        ];
        let thresholds = [0.1, 0.3, 0.5, 0.52, 0.6, 0.8, 1.5];
        let decisions: Vec<MatchDecision> = thresholds
            .iter()
            .map(|&t| EuclideanMatcher::new(t).find_best_match(&query, population.clone()))
            .collect();
        for pair in decisions.windows(2) {
            if pair[0].is_accepted() {
                assert_eq!(pair[0], pair[1], "raising the threshold changed an accepted match");
            }
        }
        assert!(!decisions[0].is_accepted());
        assert!(decisions.last().unwrap().is_accepted());
    }

    #[test]
    fn test_streamed_and_eager_agree() {
        let query = sig(&[0.2, 0.4]);
        let population = vec![cand(1, &[0.0, 0.0]), cand(2, &[0.25, 0.35]), cand(3, &[0.2, 0.5])];
        let matcher = EuclideanMatcher::default();
        let eager = matcher.find_best_match(&query, population.clone());
        let mut streamed = matcher.begin(&query);
        population.iter().for_each(|c| streamed.offer(c.identity_id, &c.signature));
        assert_eq!(eager, streamed.decide(matcher.threshold()));
    }
}
