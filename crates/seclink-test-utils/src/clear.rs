//! A cleartext re-implementation of the linkage score.
//!
//! Replicates the fixed-point pipeline of the oblivious circuit bit for
//! bit — rescaled weights, truncating dice division, cross-product maxima —
//! using exact integer arithmetic, so tests can compare revealed results
//! against it without any tolerance except where rounding itself is under
//! test.

use seclink::{
    config::{rescale_weight, Comparator, LinkageConfig},
    input::{popcount, Database, Record},
};

/// A score quotient as revealed by the circuit's debug path, with the raw
/// (unshifted) denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearScore {
    /// Sum of field weights, carrying the dice precision.
    pub numerator: u64,
    /// Sum of weights, without the dice scale.
    pub denominator: u64,
}

/// Cleartext outcome of linking one query record against a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearResult {
    /// First database index achieving the maximal score.
    pub best_index: usize,
    /// All database indices achieving the maximal score. An oblivious
    /// backend may return any of these, so tests should check membership
    /// rather than a specific tied index.
    pub max_indices: Vec<usize>,
    /// Strictly above the match threshold.
    pub matched: bool,
    /// Strictly above the tentative threshold.
    pub tentative: bool,
    /// The maximal score quotient.
    pub score: ClearScore,
}

/// Links one record against the database in cleartext.
pub fn linkage(cfg: &LinkageConfig, record: &Record, database: &Database) -> ClearResult {
    let scores: Vec<ClearScore> = (0..database.size())
        .map(|r| record_score(cfg, record, database, r))
        .collect();

    let mut best = 0;
    for (i, score) in scores.iter().enumerate().skip(1) {
        if cross_gt(score, &scores[best]) {
            best = i;
        }
    }
    let max_indices = (0..scores.len())
        .filter(|&i| !cross_gt(&scores[best], &scores[i]))
        .collect();
    let score = scores[best];
    ClearResult {
        best_index: best,
        max_indices,
        matched: above_threshold(cfg, cfg.threshold(), score),
        tentative: above_threshold(cfg, cfg.tthreshold(), score),
        score,
    }
}

/// Counts how many database records clear each threshold for one record.
pub fn count(cfg: &LinkageConfig, record: &Record, database: &Database) -> (u64, u64) {
    let mut matches = 0;
    let mut tentative_matches = 0;
    for r in 0..database.size() {
        let score = record_score(cfg, record, database, r);
        matches += u64::from(above_threshold(cfg, cfg.threshold(), score));
        tentative_matches += u64::from(above_threshold(cfg, cfg.tthreshold(), score));
    }
    (matches, tentative_matches)
}

/// The score quotient of one record pair: exchange groups resolved to their
/// best alignment, remaining fields compared in place.
pub fn record_score(
    cfg: &LinkageConfig,
    record: &Record,
    database: &Database,
    row: usize,
) -> ClearScore {
    let mut numerator = 0;
    let mut denominator = 0;
    for group in cfg.exchange_groups() {
        let best = best_group_score(cfg, record, database, row, group);
        numerator += best.numerator;
        denominator += best.denominator;
    }
    for &f in cfg.ungrouped() {
        let (fw, w) = field_weight(cfg, record, database, row, f, f);
        numerator += fw;
        denominator += w;
    }
    ClearScore {
        numerator,
        denominator,
    }
}

fn above_threshold(cfg: &LinkageConfig, threshold: f64, score: ClearScore) -> bool {
    let t = cfg.scaled_threshold(threshold) as u128;
    t * (score.denominator as u128) < score.numerator as u128
}

/// Quotient comparison without division: `a > b` iff `a.num·b.den > b.num·a.den`.
fn cross_gt(a: &ClearScore, b: &ClearScore) -> bool {
    a.numerator as u128 * b.denominator as u128 > b.numerator as u128 * a.denominator as u128
}

fn best_group_score(
    cfg: &LinkageConfig,
    record: &Record,
    database: &Database,
    row: usize,
    group: &[usize],
) -> ClearScore {
    let mut perm = group.to_vec();
    let mut best: Option<ClearScore> = None;
    loop {
        let mut score = ClearScore {
            numerator: 0,
            denominator: 0,
        };
        for (&left, &right) in group.iter().zip(&perm) {
            let (fw, w) = field_weight(cfg, record, database, row, left, right);
            score.numerator += fw;
            score.denominator += w;
        }
        best = Some(match best {
            Some(current) if !cross_gt(&score, &current) => current,
            _ => score,
        });
        if !next_permutation(&mut perm) {
            break;
        }
    }
    best.expect("a group has at least one permutation")
}

/// The `(field_weight, weight)` contribution of comparing the client's
/// `left` field with the server's `right` field, mirroring the circuit:
/// presence folds in multiplicatively, the dice division truncates, a zero
/// divisor yields zero.
fn field_weight(
    cfg: &LinkageConfig,
    record: &Record,
    database: &Database,
    row: usize,
    left: usize,
    right: usize,
) -> (u64, u64) {
    let fleft = &cfg.fields()[left];
    let fright = &cfg.fields()[right];
    let weight_r = rescale_weight(
        (fleft.weight + fright.weight) / 2.0,
        cfg.weight_precision(),
        cfg.max_weight(),
    );

    let (Some(x), Some(y)) = (record.value(left), database.column(right)[row].as_ref()) else {
        return (0, 0);
    };

    let comparison = match fleft.comparator {
        Comparator::Exact => u64::from(x == y) << cfg.dice_precision(),
        Comparator::Dice => {
            let hw_and: u64 = x.iter().zip(y).map(|(&a, &b)| (a & b).count_ones() as u64).sum();
            let hw_plus = popcount(x) + popcount(y);
            if hw_plus == 0 {
                0
            } else {
                (hw_and << (cfg.dice_precision() + 1)) / hw_plus
            }
        }
    };
    (weight_r * comparison, weight_r)
}

fn next_permutation(perm: &mut [usize]) -> bool {
    if perm.len() < 2 {
        return false;
    }
    let mut i = perm.len() - 1;
    while i > 0 && perm[i - 1] >= perm[i] {
        i -= 1;
    }
    if i == 0 {
        return false;
    }
    let mut j = perm.len() - 1;
    while perm[j] <= perm[i - 1] {
        j -= 1;
    }
    perm.swap(i - 1, j);
    perm[i..].reverse();
    true
}
