//! Construction of the oblivious linkage circuit.
//!
//! Everything here is pure graph building against a [`ShareBackend`]: the
//! topology depends only on public configuration (field count, group
//! structure, bit widths, database size), never on a secret value. Candidate
//! records form the batch dimension of every share, so one construction
//! covers the whole database in a single vectorized protocol pass.

use tracing::debug;

use crate::{
    backend::{OutputId, RevealTo, Role, ShareBackend},
    config::{ceil_log2_min1, rescale_weight, Comparator, LinkageConfig},
    input::{bitbytes, integer_bitmask, popcount, Bitmask, Database, Record},
};

/// The result of one field comparison: `fw = weight · comparison · presence`
/// and `w = weight · presence`, both arithmetic-domain shares.
struct FieldWeight<B: ShareBackend> {
    fw: B::Arith,
    w: B::Arith,
}

/// A similarity quotient: sums of field weights over sums of weights.
/// Only ever evaluated by comparison, never by division.
struct Quotient<B: ShareBackend> {
    num: B::Arith,
    den: B::Arith,
}

/// Input shares of one side of one field: the value itself, its precomputed
/// hamming weight (similarity fields only, reused across all pairings), and
/// the presence flag `delta` (1 if the field holds data, 0 otherwise).
struct ValueShares<B: ShareBackend> {
    val: B::Bool,
    hw: Option<B::Bool>,
    delta: B::Arith,
}

struct FieldShares<B: ShareBackend> {
    client: ValueShares<B>,
    server: ValueShares<B>,
}

/// Output handles of a linkage circuit, readable after execution.
pub(crate) struct LinkageOutputs {
    pub(crate) index: OutputId,
    pub(crate) matched: OutputId,
    pub(crate) tentative: OutputId,
    #[cfg(debug_assertions)]
    pub(crate) score: (OutputId, OutputId),
}

/// Output handles of a counting circuit.
pub(crate) struct CountOutputs {
    pub(crate) matches: OutputId,
    pub(crate) tentative_matches: OutputId,
}

/// Builder for the per-request share graph.
pub(crate) struct LinkageCircuit<'a, B: ShareBackend> {
    cfg: &'a LinkageConfig,
    backend: &'a mut B,
    nvals: usize,
    shares: Vec<FieldShares<B>>,
}

impl<'a, B: ShareBackend> LinkageCircuit<'a, B> {
    pub(crate) fn new(cfg: &'a LinkageConfig, backend: &'a mut B, nvals: usize) -> Self {
        Self {
            cfg,
            backend,
            nvals,
            shares: Vec::new(),
        }
    }

    /// Creates the input shares for both sides of every field. A side
    /// without cleartext data contributes dummy shares of matching shape,
    /// to be filled in by the engine from the peer's real inputs.
    pub(crate) fn set_inputs(&mut self, client: Option<&Record>, server: Option<&Database>) {
        debug_assert!(self.shares.is_empty(), "inputs already set");
        for f in 0..self.cfg.num_fields() {
            let client_side = match client {
                Some(record) => self.client_shares(f, record),
                None => self.dummy_shares(Role::Client, f),
            };
            let server_side = match server {
                Some(database) => self.server_shares(f, database),
                None => self.dummy_shares(Role::Server, f),
            };
            self.shares.push(FieldShares {
                client: client_side,
                server: server_side,
            });
        }
    }

    /// Builds the linkage graph: per-field weights, exchange-group
    /// resolution, score aggregation, best-match selection, threshold
    /// classification and the final reveal.
    pub(crate) fn build_linkage(&mut self, to: RevealTo) -> LinkageOutputs {
        let total = self.score_quotient();
        debug!(nvals = self.nvals, "built score aggregation");

        // Reduce across candidate records, tracking the winning index with
        // a public per-lane index constant.
        let idx_lanes: Vec<u64> = (0..self.nvals as u64).collect();
        let const_idx = self
            .backend
            .bool_constant_lanes(&idx_lanes, ceil_log2_min1(self.nvals));
        let (num, den, idx) = self.backend.argmax_quotient(&total.num, &total.den, &const_idx);

        let (matched, tentative) = self.classify(&num, &den, 1);

        LinkageOutputs {
            index: self.backend.reveal_bool(&idx, to),
            matched: self.backend.reveal_bool(&matched, to),
            tentative: self.backend.reveal_bool(&tentative, to),
            #[cfg(debug_assertions)]
            score: (
                self.backend.reveal_arith(&num, to),
                self.backend.reveal_arith(&den, to),
            ),
        }
    }

    /// Builds the counting graph: classifies every candidate record against
    /// both thresholds and reveals only the two totals.
    pub(crate) fn build_count(&mut self, to: RevealTo) -> CountOutputs {
        let total = self.score_quotient();
        let (matched, tentative) = self.classify(&total.num, &total.den, self.nvals);
        let matched = self.backend.to_arith(&matched);
        let tentative = self.backend.to_arith(&tentative);
        let matches = self.backend.sum_lanes(&matched);
        let tentative_matches = self.backend.sum_lanes(&tentative);
        CountOutputs {
            matches: self.backend.reveal_arith(&matches, to),
            tentative_matches: self.backend.reveal_arith(&tentative_matches, to),
        }
    }

    /// Sums group and individual field weights into one quotient per lane.
    fn score_quotient(&mut self) -> Quotient<B> {
        let cfg = self.cfg;
        let mut weights = Vec::with_capacity(cfg.exchange_groups().len() + cfg.ungrouped().len());
        for group in cfg.exchange_groups() {
            weights.push(self.best_group_weight(group));
        }
        for &f in cfg.ungrouped() {
            weights.push(self.field_weight(f, f));
        }
        self.sum(&weights)
    }

    /// Strict threshold comparison of a quotient, lane-wise:
    /// `matched = T·den < num` with `T` public on the dice scale. An exact
    /// tie at a threshold classifies as non-match.
    fn classify(&mut self, num: &B::Arith, den: &B::Arith, batch: usize) -> (B::Bool, B::Bool) {
        let cfg = self.cfg;
        let t = self.backend.arith_constant(cfg.scaled_threshold(cfg.threshold()), batch);
        let tt = self
            .backend
            .arith_constant(cfg.scaled_threshold(cfg.tthreshold()), batch);
        let t_den = self.backend.mul(&t, den);
        let tt_den = self.backend.mul(&tt, den);
        let b_num = self.backend.to_bool(num);
        let b_t = self.backend.to_bool(&t_den);
        let b_tt = self.backend.to_bool(&tt_den);
        let matched = self.backend.gt(&b_num, &b_t);
        let tentative = self.backend.gt(&b_num, &b_tt);
        (matched, tentative)
    }

    /// Resolves an exchange group: evaluates every permutation's aggregate
    /// weight and obliviously keeps the maximum, so neither party learns
    /// which alignment won. The winning quotient is reinterpreted as a
    /// field-weight pair for the outer sum.
    fn best_group_weight(&mut self, group: &[usize]) -> FieldWeight<B> {
        let mut perm = group.to_vec();
        let mut best = self.permutation_quotient(group, &perm);
        while next_permutation(&mut perm) {
            let quotient = self.permutation_quotient(group, &perm);
            best = self.max_quotient(best, quotient);
        }
        FieldWeight {
            fw: best.num,
            w: best.den,
        }
    }

    /// The aggregate weight of one alignment of an exchange group: client
    /// field `group[i]` compared against server field `perm[i]`.
    fn permutation_quotient(&mut self, group: &[usize], perm: &[usize]) -> Quotient<B> {
        let pairs: Vec<FieldWeight<B>> = group
            .iter()
            .zip(perm)
            .map(|(&left, &right)| self.field_weight(left, right))
            .collect();
        self.sum(&pairs)
    }

    /// Sums all field weights and all weights independently.
    fn sum(&mut self, pairs: &[FieldWeight<B>]) -> Quotient<B> {
        let mut num = pairs[0].fw.clone();
        let mut den = pairs[0].w.clone();
        for pair in &pairs[1..] {
            num = self.backend.add(&num, &pair.fw);
            den = self.backend.add(&den, &pair.w);
        }
        Quotient { num, den }
    }

    /// Oblivious maximum of two quotients without division: `a ≥ b` iff
    /// `a.num·b.den ≥ b.num·a.den`. The comparison runs strictly, so `a`
    /// survives an exact tie.
    fn max_quotient(&mut self, a: Quotient<B>, b: Quotient<B>) -> Quotient<B> {
        let n1d2 = self.backend.mul(&a.num, &b.den);
        let n2d1 = self.backend.mul(&b.num, &a.den);
        let lhs = self.backend.to_bool(&n1d2);
        let rhs = self.backend.to_bool(&n2d1);
        let b_wins = self.backend.gt(&rhs, &lhs);
        self.select_quotient(&b_wins, &b, &a)
    }

    /// Obliviously selects `t` where `cond` is 1, `f` otherwise:
    /// `f + cond·(t − f)` in the arithmetic ring.
    fn select_quotient(&mut self, cond: &B::Bool, t: &Quotient<B>, f: &Quotient<B>) -> Quotient<B> {
        let sel = self.backend.to_arith(cond);
        let num = self.blend(&sel, &t.num, &f.num);
        let den = self.blend(&sel, &t.den, &f.den);
        Quotient { num, den }
    }

    fn blend(&mut self, sel: &B::Arith, t: &B::Arith, f: &B::Arith) -> B::Arith {
        let diff = self.backend.sub(t, f);
        let picked = self.backend.mul(sel, &diff);
        self.backend.add(f, &picked)
    }

    /// The weight contribution of comparing the client's `left` field with
    /// the server's `right` field:
    /// - the rescaled weight is a public constant (average of both fields'
    ///   weights),
    /// - presence folds in multiplicatively via `delta`, so an absent field
    ///   contributes zero to numerator and denominator alike,
    /// - the comparison result is brought onto the dice scale in both
    ///   comparator arms.
    fn field_weight(&mut self, left: usize, right: usize) -> FieldWeight<B> {
        let cfg = self.cfg;
        let fleft = &cfg.fields()[left];
        let fright = &cfg.fields()[right];
        debug_assert_eq!(fleft.comparator, fright.comparator);
        debug_assert_eq!(fleft.bits, fright.bits);

        let weight_r = rescale_weight(
            (fleft.weight + fright.weight) / 2.0,
            cfg.weight_precision(),
            cfg.max_weight(),
        );
        let client = &self.shares[left].client;
        let server = &self.shares[right].server;
        let (c_delta, s_delta) = (client.delta.clone(), server.delta.clone());
        let delta = self.backend.mul(&c_delta, &s_delta);
        let weight = self.backend.mul_constant(&delta, weight_r);

        let comp = match fleft.comparator {
            Comparator::Dice => {
                let client = &self.shares[left].client;
                let server = &self.shares[right].server;
                let (x, y) = (client.val.clone(), server.val.clone());
                let (hw_x, hw_y) = (
                    client.hw.clone().expect("similarity field without hamming weight"),
                    server.hw.clone().expect("similarity field without hamming weight"),
                );
                let dice = self.dice_coefficient(&x, &y, &hw_x, &hw_y);
                self.backend.to_arith(&dice)
            }
            Comparator::Exact => {
                let client = &self.shares[left].client;
                let server = &self.shares[right].server;
                let (x, y) = (client.val.clone(), server.val.clone());
                let equal = self.backend.eq(&x, &y);
                // A single-bit conversion followed by a free constant
                // multiplication is cheaper than shifting the boolean share.
                let equal = self.backend.to_arith(&equal);
                self.backend
                    .mul_constant(&equal, 1u64 << cfg.dice_precision())
            }
        };

        let fw = self.backend.mul(&weight, &comp);
        FieldWeight { fw, w: weight }
    }

    /// The dice coefficient of two bit vectors at the configured precision:
    /// `popcount(x & y)`, shifted by `precision + 1` to fold in the factor
    /// of two, divided by `popcount(x) + popcount(y)` with the backend's
    /// fixed-point divider.
    fn dice_coefficient(
        &mut self,
        x: &B::Bool,
        y: &B::Bool,
        hw_x: &B::Bool,
        hw_y: &B::Bool,
    ) -> B::Bool {
        let anded = self.backend.and(x, y);
        let hw_and = self.backend.popcount(&anded);
        let shifted = self
            .backend
            .shift_left(&hw_and, self.cfg.dice_precision() + 1);
        let hw_plus = self.backend.bool_add(hw_x, hw_y);
        self.backend.fixed_div(&shifted, &hw_plus)
    }

    fn client_shares(&mut self, f: usize, record: &Record) -> ValueShares<B> {
        let cfg = self.cfg;
        let spec = &cfg.fields()[f];
        let entry = record.value(f);
        let value = entry
            .cloned()
            .unwrap_or_else(|| vec![0; bitbytes(spec.bits)]);
        let present = u64::from(entry.is_some());

        let lanes = vec![value.clone(); self.nvals];
        let val = self.backend.bool_input(Role::Client, spec.bits, &lanes);
        let hw = (spec.comparator == Comparator::Dice).then(|| {
            let hw_lanes = vec![integer_bitmask(popcount(&value), cfg.hw_width()); self.nvals];
            self.backend
                .bool_input(Role::Client, cfg.hw_width(), &hw_lanes)
        });
        let delta = self
            .backend
            .arith_input(Role::Client, &vec![present; self.nvals]);
        ValueShares { val, hw, delta }
    }

    fn server_shares(&mut self, f: usize, database: &Database) -> ValueShares<B> {
        let cfg = self.cfg;
        let spec = &cfg.fields()[f];
        let column = database.column(f);
        debug_assert_eq!(column.len(), self.nvals);
        let values: Vec<Bitmask> = column
            .iter()
            .map(|entry| {
                entry
                    .clone()
                    .unwrap_or_else(|| vec![0; bitbytes(spec.bits)])
            })
            .collect();

        let val = self.backend.bool_input(Role::Server, spec.bits, &values);
        let hw = (spec.comparator == Comparator::Dice).then(|| {
            let hw_lanes: Vec<Bitmask> = values
                .iter()
                .map(|v| integer_bitmask(popcount(v), cfg.hw_width()))
                .collect();
            self.backend
                .bool_input(Role::Server, cfg.hw_width(), &hw_lanes)
        });
        let deltas: Vec<u64> = column.iter().map(|e| u64::from(e.is_some())).collect();
        let delta = self.backend.arith_input(Role::Server, &deltas);
        ValueShares { val, hw, delta }
    }

    fn dummy_shares(&mut self, role: Role, f: usize) -> ValueShares<B> {
        let cfg = self.cfg;
        let spec = &cfg.fields()[f];
        let val = self.backend.bool_dummy(role, spec.bits, self.nvals);
        let hw = (spec.comparator == Comparator::Dice)
            .then(|| self.backend.bool_dummy(role, cfg.hw_width(), self.nvals));
        let delta = self.backend.arith_dummy(role, self.nvals);
        ValueShares { val, hw, delta }
    }
}

/// Advances `perm` to its lexicographic successor, returning `false` once
/// the last permutation has been passed. Plain iterative generation: the
/// loop bounds of every caller stay public.
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
