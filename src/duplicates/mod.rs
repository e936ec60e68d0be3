//! Near-duplicate detection over a batch of embeddings.
//!
//! Two images are linked when their cosine distance is below the threshold;
//! groups are the connected components of that graph. Small batches compare
//! every pair. Larger ones draw candidate pairs from random-hyperplane LSH
//! buckets and verify each candidate with the exact distance.

use chrono::NaiveDateTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::clip::cosine_distance;
use crate::config::{DuplicateConfig, RepresentativeRule};

const LSH_TABLES: usize = 16;
const LSH_BITS: usize = 8;
const LSH_SEED: u64 = 0x5eed_f11e;

/// One image as seen by the detector.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    /// Caller-side identifier, echoed back in groups.
    pub id: usize,
    pub path: &'a Path,
    pub embedding: &'a [f32],
    pub captured_at: Option<NaiveDateTime>,
    pub resolution: Option<u64>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    /// Member ids, representative first, the rest in path order.
    pub members: Vec<usize>,
    pub representative: usize,
    pub rule: RepresentativeRule,
}

#[derive(Debug, Clone)]
pub struct DuplicateDetector {
    threshold: f32,
    rule: RepresentativeRule,
    exact_limit: usize,
}

impl DuplicateDetector {
    pub fn new(config: &DuplicateConfig) -> Self {
        Self {
            threshold: config.threshold,
            rule: config.representative,
            exact_limit: config.exact_limit,
        }
    }

    /// Group near-identical candidates. Singletons are not reported.
    /// Groups come back ordered by their representative's path.
    pub fn find_groups(&self, candidates: &[Candidate<'_>]) -> Vec<DuplicateGroup> {
        if candidates.len() < 2 {
            return Vec::new();
        }

        let mut sets = UnionFind::new(candidates.len());
        let compared = if candidates.len() <= self.exact_limit {
            self.link_all_pairs(candidates, &mut sets)
        } else {
            self.link_lsh_candidates(candidates, &mut sets)
        };

        let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..candidates.len() {
            components.entry(sets.find(i)).or_default().push(i);
        }

        let mut groups: Vec<(usize, DuplicateGroup)> = components
            .into_values()
            .filter(|members| members.len() > 1)
            .map(|mut members| {
                members.sort_by(|&a, &b| self.compare(&candidates[a], &candidates[b]));
                let head = members[0];
                // Keep non-representatives in plain path order.
                members[1..].sort_by(|&a, &b| candidates[a].path.cmp(candidates[b].path));
                let group = DuplicateGroup {
                    members: members.iter().map(|&i| candidates[i].id).collect(),
                    representative: candidates[head].id,
                    rule: self.rule,
                };
                (head, group)
            })
            .collect();

        groups.sort_by(|(a, _), (b, _)| candidates[*a].path.cmp(candidates[*b].path));

        tracing::debug!(
            images = candidates.len(),
            comparisons = compared,
            groups = groups.len(),
            "Duplicate detection finished"
        );

        groups.into_iter().map(|(_, group)| group).collect()
    }

    fn is_duplicate(&self, a: &Candidate<'_>, b: &Candidate<'_>) -> bool {
        cosine_distance(a.embedding, b.embedding) < self.threshold
    }

    fn link_all_pairs(&self, candidates: &[Candidate<'_>], sets: &mut UnionFind) -> usize {
        let mut compared = 0;
        for i in 0..candidates.len() {
            for j in (i + 1)..candidates.len() {
                compared += 1;
                if self.is_duplicate(&candidates[i], &candidates[j]) {
                    sets.union(i, j);
                }
            }
        }
        compared
    }

    fn link_lsh_candidates(&self, candidates: &[Candidate<'_>], sets: &mut UnionFind) -> usize {
        let dim = candidates[0].embedding.len();
        let mut rng = StdRng::seed_from_u64(LSH_SEED);
        let mut seen: HashSet<(usize, usize)> = HashSet::new();
        let mut compared = 0;

        for _ in 0..LSH_TABLES {
            let planes: Vec<Vec<f32>> = (0..LSH_BITS)
                .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
                .collect();

            let mut buckets: HashMap<u32, Vec<usize>> = HashMap::new();
            for (i, candidate) in candidates.iter().enumerate() {
                buckets
                    .entry(signature(candidate.embedding, &planes))
                    .or_default()
                    .push(i);
            }

            for bucket in buckets.values().filter(|b| b.len() > 1) {
                for (k, &i) in bucket.iter().enumerate() {
                    for &j in &bucket[k + 1..] {
                        if !seen.insert((i, j)) || sets.find(i) == sets.find(j) {
                            continue;
                        }
                        compared += 1;
                        if self.is_duplicate(&candidates[i], &candidates[j]) {
                            sets.union(i, j);
                        }
                    }
                }
            }
        }

        compared
    }

    /// Total order used to pick the representative: rule first, path last.
    fn compare(&self, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
        let by_rule = match self.rule {
            RepresentativeRule::LexicographicPath => Ordering::Equal,
            RepresentativeRule::EarliestCapture => {
                present_first(a.captured_at, b.captured_at, |x, y| x.cmp(&y))
            }
            RepresentativeRule::HighestResolution => {
                present_first(a.resolution, b.resolution, |x, y| y.cmp(&x))
            }
            RepresentativeRule::LargestFile => b.size_bytes.cmp(&a.size_bytes),
        };
        by_rule.then_with(|| a.path.cmp(b.path))
    }
}

/// Known values sort before unknown ones.
fn present_first<T: Copy>(a: Option<T>, b: Option<T>, cmp: impl Fn(T, T) -> Ordering) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => cmp(x, y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn signature(embedding: &[f32], planes: &[Vec<f32>]) -> u32 {
    planes.iter().enumerate().fold(0u32, |sig, (bit, plane)| {
        let dot: f32 = plane.iter().zip(embedding).map(|(p, x)| p * x).sum();
        if dot >= 0.0 {
            sig | (1 << bit)
        } else {
            sig
        }
    })
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            Ordering::Less => self.parent[ra] = rb,
            Ordering::Greater => self.parent[rb] = ra,
            Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::l2_normalize;
    use std::path::PathBuf;

    struct Fixture {
        paths: Vec<PathBuf>,
        vectors: Vec<Vec<f32>>,
    }

    impl Fixture {
        fn new(items: &[(&str, Vec<f32>)]) -> Self {
            Self {
                paths: items.iter().map(|(p, _)| PathBuf::from(p)).collect(),
                vectors: items.iter().map(|(_, v)| l2_normalize(v.clone())).collect(),
            }
        }

        fn candidates(&self) -> Vec<Candidate<'_>> {
            self.paths
                .iter()
                .zip(&self.vectors)
                .enumerate()
                .map(|(id, (path, embedding))| Candidate {
                    id,
                    path,
                    embedding,
                    captured_at: None,
                    resolution: None,
                    size_bytes: 0,
                })
                .collect()
        }
    }

    fn detector(rule: RepresentativeRule, exact_limit: usize) -> DuplicateDetector {
        DuplicateDetector::new(&DuplicateConfig {
            threshold: 0.05,
            representative: rule,
            exact_limit,
            ..DuplicateConfig::default()
        })
    }

    /// Unit vector at cosine distance `d` from the x axis.
    fn at_distance(d: f32) -> Vec<f32> {
        let cos = 1.0 - d;
        vec![cos, (1.0 - cos * cos).sqrt(), 0.0]
    }

    #[test]
    fn test_close_pair_forms_group() {
        let fx = Fixture::new(&[
            ("/p/b.jpg", vec![1.0, 0.0, 0.0]),
            ("/p/a.jpg", at_distance(0.01)),
            ("/p/c.jpg", vec![0.0, 0.0, 1.0]),
        ]);
        let groups = detector(RepresentativeRule::LexicographicPath, 2048).find_groups(&fx.candidates());

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].representative, 1);
        assert_eq!(groups[0].members, vec![1, 0]);
    }

    #[test]
    fn test_distance_equal_to_threshold_is_not_linked() {
        let fx = Fixture::new(&[("/p/a.jpg", vec![1.0, 0.0, 0.0]), ("/p/b.jpg", at_distance(0.05))]);
        let c = fx.candidates();
        let d = cosine_distance(c[0].embedding, c[1].embedding);

        let at = |threshold: f32| {
            DuplicateDetector::new(&DuplicateConfig {
                threshold,
                ..DuplicateConfig::default()
            })
            .find_groups(&c)
        };
        assert!(at(d).is_empty());
        assert_eq!(at(d + 1e-4).len(), 1);
    }

    #[test]
    fn test_groups_are_transitive_closure() {
        // a-b and b-c are within threshold, a-c is not.
        let b = l2_normalize(vec![1.0, 0.22, 0.0]);
        let fx = Fixture::new(&[
            ("/p/a.jpg", vec![1.0, 0.0, 0.0]),
            ("/p/b.jpg", b),
            ("/p/c.jpg", vec![1.0, 0.45, 0.0]),
        ]);
        let c = fx.candidates();
        assert!(cosine_distance(c[0].embedding, c[2].embedding) > 0.05);

        let groups = detector(RepresentativeRule::LexicographicPath, 2048).find_groups(&c);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members, vec![0, 1, 2]);
    }

    #[test]
    fn test_input_order_does_not_change_membership() {
        let items = [
            ("/p/a.jpg", vec![1.0, 0.0, 0.0]),
            ("/p/b.jpg", at_distance(0.02)),
            ("/p/c.jpg", vec![0.0, 1.0, 0.0]),
        ];
        let forward = Fixture::new(&items);
        let mut reversed_items = items.to_vec();
        reversed_items.reverse();
        let backward = Fixture::new(&reversed_items);

        let d = detector(RepresentativeRule::LexicographicPath, 2048);
        let paths = |fx: &Fixture, groups: Vec<DuplicateGroup>| -> Vec<Vec<PathBuf>> {
            groups
                .iter()
                .map(|g| g.members.iter().map(|&id| fx.paths[id].clone()).collect())
                .collect()
        };

        assert_eq!(
            paths(&forward, d.find_groups(&forward.candidates())),
            paths(&backward, d.find_groups(&backward.candidates()))
        );
    }

    #[test]
    fn test_representative_rules_fall_back_to_path() {
        let fx = Fixture::new(&[
            ("/p/z.jpg", vec![1.0, 0.0, 0.0]),
            ("/p/m.jpg", at_distance(0.001)),
            ("/p/a.jpg", at_distance(0.002)),
        ]);
        let mut c = fx.candidates();
        let day = |d: u32| {
            chrono::NaiveDate::from_ymd_opt(2024, 5, d)
                .and_then(|date| date.and_hms_opt(12, 0, 0))
        };
        c[0].captured_at = day(1);
        c[1].captured_at = day(2);
        c[0].resolution = Some(100);
        c[1].resolution = Some(400);
        c[2].resolution = Some(400);
        c[0].size_bytes = 10;
        c[1].size_bytes = 30;
        c[2].size_bytes = 20;

        let rep = |rule| detector(rule, 2048).find_groups(&c)[0].representative;
        assert_eq!(rep(RepresentativeRule::LexicographicPath), 2);
        assert_eq!(rep(RepresentativeRule::EarliestCapture), 0);
        // Tie on resolution between m and a: path decides.
        assert_eq!(rep(RepresentativeRule::HighestResolution), 2);
        assert_eq!(rep(RepresentativeRule::LargestFile), 1);
    }

    #[test]
    fn test_lsh_matches_exact_grouping() {
        let mut items: Vec<(String, Vec<f32>)> = Vec::new();
        for k in 0..20 {
            let mut base = vec![0.0f32; 32];
            base[k] = 1.0;
            items.push((format!("/p/{:02}_a.jpg", k), base.clone()));
            base[(k + 1) % 32] = 0.02;
            items.push((format!("/p/{:02}_b.jpg", k), base));
        }
        let borrowed: Vec<(&str, Vec<f32>)> =
            items.iter().map(|(p, v)| (p.as_str(), v.clone())).collect();
        let fx = Fixture::new(&borrowed);
        let c = fx.candidates();

        let exact = detector(RepresentativeRule::LexicographicPath, 2048).find_groups(&c);
        let hashed = detector(RepresentativeRule::LexicographicPath, 0).find_groups(&c);

        assert_eq!(exact.len(), 20);
        assert_eq!(exact, hashed);
    }

    #[test]
    fn test_no_groups_for_distinct_images() {
        let fx = Fixture::new(&[
            ("/p/a.jpg", vec![1.0, 0.0, 0.0]),
            ("/p/b.jpg", vec![0.0, 1.0, 0.0]),
        ]);
        assert!(detector(RepresentativeRule::LexicographicPath, 2048)
            .find_groups(&fx.candidates())
            .is_empty());
    }
}
