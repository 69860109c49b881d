//! Cosine matching of face embeddings against enrolled identities.

/// Distance reported for vectors that cannot be compared.
pub const MAX_DISTANCE: f64 = 2.0;

pub type Embedding = Vec<f64>;

/// `1 - clamp(a·b, -1, 1)` for unit-length embeddings. Empty or
/// mismatched vectors are maximally distant.
pub fn cosine_distance(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return MAX_DISTANCE;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    if !dot.is_finite() {
        return MAX_DISTANCE;
    }
    1.0 - dot.clamp(-1.0, 1.0)
}

/// Scales `values` to unit length. Zero or non-finite vectors have no direction.
pub fn normalize(values: &[f64]) -> Option<Embedding> {
    let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
    if !norm.is_finite() || norm <= f64::EPSILON {
        return None;
    }
    Some(values.iter().map(|v| v / norm).collect())
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrolledIdentity {
    pub username: String,
    pub templates: Vec<Embedding>,
}

impl EnrolledIdentity {
    pub fn new(username: impl Into<String>, templates: Vec<Embedding>) -> Self {
        Self {
            username: username.into(),
            templates,
        }
    }

    /// Smallest distance between `candidate` and any of this identity's templates.
    pub fn min_distance(&self, candidate: &[f64]) -> Option<f64> {
        self.templates
            .iter()
            .map(|template| cosine_distance(candidate, template))
            .min_by(f64::total_cmp)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub best_distance: f64,
    pub best_identity: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchVerdict {
    Accepted,
    /// Within threshold, but the closest identity is someone else.
    CrossIdentity { matched: String, distance: f64 },
    NoMatch,
}

impl MatchResult {
    pub fn verdict(&self, claimed: &str, threshold: f64) -> MatchVerdict {
        if self.best_distance >= threshold {
            return MatchVerdict::NoMatch;
        }
        if self.best_identity == claimed {
            MatchVerdict::Accepted
        } else {
            MatchVerdict::CrossIdentity {
                matched: self.best_identity.clone(),
                distance: self.best_distance,
            }
        }
    }
}

/// Searches every enrolled identity for the closest template.
pub fn best_match(candidate: &[f64], identities: &[EnrolledIdentity]) -> Option<MatchResult> {
    let mut best: Option<MatchResult> = None;
    for identity in identities {
        let Some(distance) = identity.min_distance(candidate) else {
            continue;
        };
        let closer = best
            .as_ref()
            .map_or(true, |current| distance < current.best_distance);
        if closer {
            best = Some(MatchResult {
                best_distance: distance,
                best_identity: identity.username.clone(),
            });
        }
    }
    best
}

/// Greedy in-frame deduplication. Returns the indices of the embeddings that
/// represent distinct faces; an embedding closer than `merge_threshold` to an
/// already kept one is merged into it.
pub fn deduplicate(embeddings: &[Embedding], merge_threshold: f64) -> Vec<usize> {
    let mut kept: Vec<usize> = Vec::new();
    for (idx, embedding) in embeddings.iter().enumerate() {
        let duplicate = kept
            .iter()
            .any(|&rep| cosine_distance(embedding, &embeddings[rep]) < merge_threshold);
        if !duplicate {
            kept.push(idx);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(values: &[f64]) -> Embedding {
        normalize(values).unwrap()
    }

    #[test]
    fn normalize_rejects_zero_vectors() {
        assert!(normalize(&[0.0, 0.0]).is_none());
        let unit = normalize(&[3.0, 4.0]).unwrap();
        assert!((unit[0] - 0.6).abs() < 1e-12 && (unit[1] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn mismatched_and_empty_vectors_are_maximally_distant() {
        assert_eq!(cosine_distance(&[], &[]), MAX_DISTANCE);
        assert_eq!(cosine_distance(&[1.0], &[1.0, 0.0]), MAX_DISTANCE);
    }

    #[test]
    fn opposite_vectors_reach_two() {
        let a = unit(&[1.0, 0.0]);
        let b = unit(&[-1.0, 0.0]);
        assert!((cosine_distance(&a, &b) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn best_match_searches_all_identities() {
        let identities = vec![
            EnrolledIdentity::new("alice", vec![unit(&[1.0, 0.0, 0.0])]),
            EnrolledIdentity::new("bob", vec![unit(&[0.0, 1.0, 0.0]), unit(&[0.0, 0.9, 0.1])]),
        ];
        let result = best_match(&unit(&[0.0, 1.0, 0.05]), &identities).unwrap();
        assert_eq!(result.best_identity, "bob");
        assert!(result.best_distance < 0.01);
    }

    #[test]
    fn cross_identity_match_is_not_accepted() {
        let result = MatchResult {
            best_distance: 0.1,
            best_identity: "bob".into(),
        };
        assert_eq!(
            result.verdict("alice", 0.4),
            MatchVerdict::CrossIdentity {
                matched: "bob".into(),
                distance: 0.1
            }
        );
        assert_eq!(result.verdict("bob", 0.4), MatchVerdict::Accepted);
        assert_eq!(result.verdict("bob", 0.1), MatchVerdict::NoMatch);
    }

    #[test]
    fn identities_without_templates_are_skipped() {
        let identities = vec![EnrolledIdentity::new("empty", Vec::new())];
        assert!(best_match(&unit(&[1.0, 0.0]), &identities).is_none());
    }

    #[test]
    fn deduplicate_keeps_first_representative() {
        let embeddings = vec![
            unit(&[1.0, 0.0]),
            unit(&[1.0, 0.01]),
            unit(&[0.0, 1.0]),
        ];
        assert_eq!(deduplicate(&embeddings, 0.15), vec![0, 2]);
    }
}
