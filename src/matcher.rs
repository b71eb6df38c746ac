//! Nearest-identity lookup over a gallery snapshot.

use crate::defaults::DEFAULT_THRESHOLD;
use crate::error::GalleryError;
use crate::model::{FaceRecord, MatchResult};
use std::sync::Arc;

/// Decides who a query embedding belongs to.
///
/// Implementations are defined by their result only: the nearest record by
/// L2 distance, reported as [`MatchResult::Match`] when strictly under the
/// threshold, [`MatchResult::Unknown`] otherwise, and [`MatchResult::Empty`]
/// for an empty snapshot. An indexed implementation can replace the linear
/// scan without callers noticing.
pub trait Matcher: Send + Sync {
    fn find_nearest(
        &self,
        query: &[f32],
        snapshot: &[Arc<FaceRecord>],
    ) -> Result<MatchResult, GalleryError>;

    fn threshold(&self) -> f32;
}

/// Brute-force scan. O(N·D) per query.
#[derive(Debug, Clone)]
pub struct LinearMatcher {
    threshold: f32,
}

impl LinearMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Default for LinearMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl Matcher for LinearMatcher {
    fn find_nearest(
        &self,
        query: &[f32],
        snapshot: &[Arc<FaceRecord>],
    ) -> Result<MatchResult, GalleryError> {
        let mut best: Option<(&FaceRecord, f64)> = None;

        for record in snapshot {
            let d2 = squared_l2(query, &record.embedding)?;
            // Strict comparison: the first record reaching the minimum wins.
            if best.map_or(true, |(_, best_d2)| d2 < best_d2) {
                best = Some((record.as_ref(), d2));
            }
        }

        let Some((record, d2)) = best else {
            return Ok(MatchResult::Empty);
        };

        let distance = d2.sqrt() as f32;
        if distance < self.threshold {
            Ok(MatchResult::Match {
                identity: record.identity.clone(),
                distance,
            })
        } else {
            Ok(MatchResult::Unknown { distance })
        }
    }

    fn threshold(&self) -> f32 {
        self.threshold
    }
}

/// Squared Euclidean distance with f64 accumulation.
pub fn squared_l2(a: &[f32], b: &[f32]) -> Result<f64, GalleryError> {
    if a.len() != b.len() {
        return Err(GalleryError::DimensionMismatch {
            expected: b.len(),
            actual: a.len(),
        });
    }
    Ok(a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum())
}

/// Euclidean (L2) distance between two vectors of equal length.
pub fn l2_distance(a: &[f32], b: &[f32]) -> Result<f32, GalleryError> {
    Ok(squared_l2(a, b)?.sqrt() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlobRef;
    use chrono::Utc;

    fn rec(identity: &str, embedding: Vec<f32>) -> Arc<FaceRecord> {
        Arc::new(FaceRecord {
            identity: identity.to_string(),
            embedding,
            blob_ref: BlobRef(format!("{identity}.jpg")),
            registered_at: Utc::now(),
        })
    }

    #[test]
    fn test_l2_distance() {
        assert_eq!(l2_distance(&[0.0, 0.0], &[3.0, 4.0]).unwrap(), 5.0);
        assert_eq!(l2_distance(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]).unwrap(), 0.0);
        assert!(l2_distance(&[1.0], &[1.0, 0.0]).is_err());
    }

    #[test]
    fn test_empty_snapshot_is_empty_not_unknown() {
        let m = LinearMatcher::default();
        assert_eq!(m.find_nearest(&[0.0, 0.0], &[]).unwrap(), MatchResult::Empty);
    }

    #[test]
    fn test_self_match_is_exact() {
        let m = LinearMatcher::default();
        let e = vec![0.12, -0.5, 0.33, 0.9];
        let snapshot = vec![rec("Bob", vec![1.0, 1.0, 1.0, 1.0]), rec("X", e.clone())];
        assert_eq!(
            m.find_nearest(&e, &snapshot).unwrap(),
            MatchResult::Match { identity: "X".into(), distance: 0.0 }
        );
    }

    #[test]
    fn test_threshold_boundary() {
        let m = LinearMatcher::new(0.8);
        let snapshot = vec![rec("A", vec![0.0, 0.0])];

        match m.find_nearest(&[0.79, 0.0], &snapshot).unwrap() {
            MatchResult::Match { identity, distance } => {
                assert_eq!(identity, "A");
                assert!((distance - 0.79).abs() < 1e-6);
            }
            other => panic!("expected match, got {other:?}"),
        }

        match m.find_nearest(&[0.81, 0.0], &snapshot).unwrap() {
            MatchResult::Unknown { distance } => assert!((distance - 0.81).abs() < 1e-6),
            other => panic!("expected unknown, got {other:?}"),
        }

        // Exactly at the threshold is not a match.
        assert!(matches!(
            m.find_nearest(&[0.8, 0.0], &snapshot).unwrap(),
            MatchResult::Unknown { .. }
        ));
    }

    #[test]
    fn test_alice_bob_scenario() {
        // ||e_A - e_B|| = 1.2, ||q - e_A|| = 0.3, ||q - e_B|| = 1.1
        let e_a = vec![0.0f32, 0.0];
        let e_b = vec![1.2f32, 0.0];
        let x = 0.4f64 / 3.0;
        let y = (0.09f64 - x * x).sqrt();
        let q = vec![x as f32, y as f32];

        assert!((l2_distance(&e_a, &e_b).unwrap() - 1.2).abs() < 1e-6);
        assert!((l2_distance(&q, &e_b).unwrap() - 1.1).abs() < 1e-5);

        let snapshot = vec![rec("Alice", e_a), rec("Bob", e_b)];
        match LinearMatcher::new(0.8).find_nearest(&q, &snapshot).unwrap() {
            MatchResult::Match { identity, distance } => {
                assert_eq!(identity, "Alice");
                assert!((distance - 0.3).abs() < 1e-5);
            }
            other => panic!("expected Alice, got {other:?}"),
        }
    }

    #[test]
    fn test_tie_goes_to_first_in_snapshot() {
        let snapshot = vec![rec("A", vec![1.0, 0.0]), rec("B", vec![-1.0, 0.0])];
        let result = LinearMatcher::new(2.0).find_nearest(&[0.0, 0.0], &snapshot).unwrap();
        assert_eq!(result.identity(), Some("A"));
    }

    #[test]
    fn test_query_dimension_mismatch_fails() {
        let snapshot = vec![rec("A", vec![1.0, 0.0])];
        assert!(matches!(
            LinearMatcher::default().find_nearest(&[1.0, 0.0, 0.0], &snapshot),
            Err(GalleryError::DimensionMismatch { expected: 2, actual: 3 })
        ));
    }
}
