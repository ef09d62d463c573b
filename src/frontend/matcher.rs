//! Brute-force descriptor matching with Lowe's ratio test.

use anyhow::{Result, bail};

use super::{Descriptors, FeatureMatcher, Features, Match};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceNorm {
    Hamming,
    L2,
}

/// Hamming distance between two binary descriptors, in bits.
pub fn hamming_distance(a: &[u8], b: &[u8]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[derive(Debug, Clone)]
pub struct BruteForceMatcher {
    norm: DistanceNorm,
    ratio: f32,
    max_distance: Option<f32>,
}

impl BruteForceMatcher {
    pub fn new(norm: DistanceNorm, ratio: f32) -> Self {
        Self {
            norm,
            ratio,
            max_distance: None,
        }
    }

    /// Reject best matches farther than `max_distance`.
    pub fn with_max_distance(mut self, max_distance: f32) -> Self {
        self.max_distance = Some(max_distance);
        self
    }

    pub fn norm(&self) -> DistanceNorm {
        self.norm
    }

    fn best_two<F>(&self, n_train: usize, dist: F) -> Option<(usize, f32, f32)>
    where
        F: Fn(usize) -> f32,
    {
        let mut best: Option<(usize, f32)> = None;
        let mut second = f32::INFINITY;
        for j in 0..n_train {
            let d = dist(j);
            match best {
                Some((_, b)) if d >= b => {
                    if d < second {
                        second = d;
                    }
                }
                Some((_, b)) => {
                    second = b;
                    best = Some((j, d));
                }
                None => best = Some((j, d)),
            }
        }
        best.map(|(j, d)| (j, d, second))
    }

    fn accept(&self, best: f32, second: f32) -> bool {
        if let Some(max) = self.max_distance {
            if best > max {
                return false;
            }
        }
        // A lone candidate has no second best to compare against.
        !second.is_finite() || best < self.ratio * second
    }
}

impl FeatureMatcher for BruteForceMatcher {
    fn match_features(&self, a: &Features, b: &Features) -> Result<Vec<Match>> {
        let mut matches = Vec::new();
        match (&a.descriptors, &b.descriptors, self.norm) {
            (Descriptors::Binary(da), Descriptors::Binary(db), DistanceNorm::Hamming) => {
                for (i, qa) in da.iter().enumerate() {
                    let found = self.best_two(db.len(), |j| hamming_distance(qa, &db[j]) as f32);
                    if let Some((j, best, second)) = found {
                        if self.accept(best, second) {
                            matches.push(Match {
                                query: i,
                                train: j,
                                distance: best,
                            });
                        }
                    }
                }
            }
            (Descriptors::Float(da), Descriptors::Float(db), DistanceNorm::L2) => {
                for (i, qa) in da.iter().enumerate() {
                    let found = self.best_two(db.len(), |j| l2_distance(qa, &db[j]));
                    if let Some((j, best, second)) = found {
                        if self.accept(best, second) {
                            matches.push(Match {
                                query: i,
                                train: j,
                                distance: best,
                            });
                        }
                    }
                }
            }
            (_, _, norm) => bail!("descriptor type does not match {:?} norm", norm),
        }
        Ok(matches)
    }
}
