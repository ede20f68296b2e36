//! Linkage configuration: the field schema, exchange groups and the
//! fixed-point precision derivation that keeps the oblivious circuit free of
//! arithmetic overflows.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Input width of the fixed-point integer-division primitive the share
/// backend provides (see [`crate::backend::ShareBackend::fixed_div`]).
pub const DIV_WIDTH: u16 = 16;

/// How two field values are compared inside the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    /// Oblivious equality of the raw values, scaled to the dice range.
    Exact,
    /// Dice coefficient `2·|A∩B| / (|A|+|B|)` over bit vectors.
    Dice,
}

/// The cleartext domain a field value is drawn from.
///
/// The circuit itself only ever sees bit vectors; the domain is carried for
/// the config-loading layer and input validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueDomain {
    /// Fixed-width integers, e.g. dates or postal codes.
    Integer,
    /// Strings, compared as their encoded bytes.
    String,
    /// Bloom-filter style bit vectors.
    Bitmask,
}

/// Schema entry for a single record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Unique field name.
    pub name: String,
    /// Positive matching weight.
    pub weight: f64,
    /// Comparator used for this field.
    pub comparator: Comparator,
    /// Cleartext domain of the field.
    pub domain: ValueDomain,
    /// Width of the field value in bits.
    pub bits: u16,
}

impl FieldSpec {
    /// Creates a field with an explicit weight.
    pub fn new(
        name: impl Into<String>,
        weight: f64,
        comparator: Comparator,
        domain: ValueDomain,
        bits: u16,
    ) -> Self {
        Self {
            name: name.into(),
            weight,
            comparator,
            domain,
            bits,
        }
    }

    /// Creates a field whose weight is derived from an error-rate prior as
    /// `log2((1 - error_rate) / frequency)`.
    pub fn from_error_rate(
        name: impl Into<String>,
        frequency: f64,
        error_rate: f64,
        comparator: Comparator,
        domain: ValueDomain,
        bits: u16,
    ) -> Self {
        let weight = ((1.0 - error_rate) / frequency).log2();
        Self::new(name, weight, comparator, domain, bits)
    }
}

/// Errors rejecting an invalid linkage configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// The field schema is empty.
    #[error("the field schema must not be empty")]
    EmptyFields,
    /// Two fields share the same name.
    #[error("duplicate field name '{0}'")]
    DuplicateField(String),
    /// A field has a non-positive or non-finite weight.
    #[error("field '{0}' must have a positive weight")]
    InvalidWeight(String),
    /// A field has a zero bit width.
    #[error("field '{0}' must have a positive bit width")]
    ZeroWidth(String),
    /// The word size is zero or exceeds the supported share width.
    #[error("word size must lie in 1..=64, got {0}")]
    InvalidWordSize(u16),
    /// A threshold lies outside `(0, 1]`.
    #[error("thresholds must lie in (0, 1], got {0}")]
    InvalidThreshold(f64),
    /// The tentative threshold exceeds the match threshold.
    #[error("tentative threshold {tentative} exceeds match threshold {threshold}")]
    ThresholdOrder {
        /// Tentative threshold.
        tentative: f64,
        /// Match threshold.
        threshold: f64,
    },
    /// An exchange group is empty.
    #[error("exchange groups must not be empty")]
    EmptyGroup,
    /// An exchange group names a field that is not part of the schema.
    #[error("exchange group member '{0}' is not a configured field")]
    UnknownGroupField(String),
    /// A field appears in more than one exchange group.
    #[error("exchange groups must be distinct, field '{0}' appears more than once")]
    OverlappingGroups(String),
    /// Two fields of one exchange group use different comparators.
    #[error("cannot compare field '{left}' of type {left_comparator:?} with field '{right}' of type {right_comparator:?}")]
    GroupComparatorMismatch {
        /// First group member.
        left: String,
        /// Its comparator.
        left_comparator: Comparator,
        /// Mismatching group member.
        right: String,
        /// Its comparator.
        right_comparator: Comparator,
    },
    /// Two fields of one exchange group have different bit widths.
    #[error("cannot compare field '{left}' of bit width {left_bits} with field '{right}' of bit width {right_bits}")]
    GroupWidthMismatch {
        /// First group member.
        left: String,
        /// Its bit width.
        left_bits: u16,
        /// Mismatching group member.
        right: String,
        /// Its bit width.
        right_bits: u16,
    },
    /// The widest similarity field does not leave room for any fractional
    /// dice bits within the division primitive.
    #[error("similarity fields of {0} bits exceed the {DIV_WIDTH}-bit division primitive")]
    DiceFieldTooWide(u16),
    /// The requested dice precision overflows the division primitive.
    #[error("dice precision {dice} plus hamming-weight width {hw_width} overflows the {DIV_WIDTH}-bit division primitive")]
    DicePrecisionTooLarge {
        /// Requested dice precision.
        dice: u16,
        /// Width of hamming-weight shares.
        hw_width: u16,
    },
    /// The precisions would overflow the share word size.
    #[error(
        "dice precision {dice} and weight precision {weight} would overflow \
         the {word_size}-bit share width for {fields} fields"
    )]
    PrecisionOverflow {
        /// Dice precision.
        dice: u16,
        /// Weight precision.
        weight: u16,
        /// Share word size in bits.
        word_size: u16,
        /// Number of configured fields.
        fields: usize,
    },
}

/// A validated linkage configuration.
///
/// Fields are held in a dense arena sorted by name; all cross-references
/// (exchange groups, ungrouped fields) are stored as indices into it, so the
/// circuit builder never touches a field name. Built once per deployment and
/// reused across requests.
#[derive(Debug, Clone)]
pub struct LinkageConfig {
    fields: Vec<FieldSpec>,
    index: HashMap<String, usize>,
    exchange_groups: Vec<Vec<usize>>,
    ungrouped: Vec<usize>,
    threshold: f64,
    tthreshold: f64,
    word_size: u16,
    dice_precision: u16,
    weight_precision: u16,
    hw_width: u16,
    max_weight: f64,
}

impl LinkageConfig {
    /// Validates the schema and derives the fixed-point precisions.
    ///
    /// The dice precision is chosen as large as the backend's
    /// [`DIV_WIDTH`]-bit division primitive allows for the widest similarity
    /// field; the weight precision takes half of the remaining bit budget,
    /// so that products of the form `sum(dice·w) · sum(w)` cannot overflow
    /// `word_size` bits:
    ///
    /// `dice_precision + 2·weight_precision + ceil_log2(n_fields²) <= word_size`
    pub fn new(
        fields: Vec<FieldSpec>,
        exchange_groups: Vec<Vec<String>>,
        threshold: f64,
        tthreshold: f64,
        word_size: u16,
    ) -> Result<Self, ConfigError> {
        if fields.is_empty() {
            return Err(ConfigError::EmptyFields);
        }
        if word_size == 0 || word_size > 64 {
            return Err(ConfigError::InvalidWordSize(word_size));
        }
        for t in [threshold, tthreshold] {
            if !(t > 0.0 && t <= 1.0) {
                return Err(ConfigError::InvalidThreshold(t));
            }
        }
        if tthreshold > threshold {
            return Err(ConfigError::ThresholdOrder {
                tentative: tthreshold,
                threshold,
            });
        }

        let mut fields = fields;
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        for pair in fields.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(ConfigError::DuplicateField(pair[0].name.clone()));
            }
        }
        for field in &fields {
            if !(field.weight > 0.0 && field.weight.is_finite()) {
                return Err(ConfigError::InvalidWeight(field.name.clone()));
            }
            if field.bits == 0 {
                return Err(ConfigError::ZeroWidth(field.name.clone()));
            }
        }

        let index: HashMap<String, usize> = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();

        let mut groups = Vec::with_capacity(exchange_groups.len());
        let mut grouped = vec![false; fields.len()];
        for group in &exchange_groups {
            let mut members = Vec::with_capacity(group.len());
            for name in group {
                let &f = index
                    .get(name)
                    .ok_or_else(|| ConfigError::UnknownGroupField(name.clone()))?;
                if grouped[f] {
                    return Err(ConfigError::OverlappingGroups(name.clone()));
                }
                grouped[f] = true;
                members.push(f);
            }
            members.sort_unstable();
            let &first = members.first().ok_or(ConfigError::EmptyGroup)?;
            for &f in &members[1..] {
                if fields[f].comparator != fields[first].comparator {
                    return Err(ConfigError::GroupComparatorMismatch {
                        left: fields[first].name.clone(),
                        left_comparator: fields[first].comparator,
                        right: fields[f].name.clone(),
                        right_comparator: fields[f].comparator,
                    });
                }
                if fields[f].bits != fields[first].bits {
                    return Err(ConfigError::GroupWidthMismatch {
                        left: fields[first].name.clone(),
                        left_bits: fields[first].bits,
                        right: fields[f].name.clone(),
                        right_bits: fields[f].bits,
                    });
                }
            }
            groups.push(members);
        }
        let ungrouped = (0..fields.len()).filter(|&f| !grouped[f]).collect();

        // Dice precision: the widest similarity field determines how many
        // fractional bits still fit the division primitive, -1 for the
        // factor of two in the dice coefficient.
        let max_dice_bits = fields
            .iter()
            .filter(|f| f.comparator == Comparator::Dice)
            .map(|f| f.bits)
            .max()
            .unwrap_or(0);
        let hw_width = hw_width(max_dice_bits);
        let dice_precision = (DIV_WIDTH - 1)
            .checked_sub(hw_width)
            .filter(|&p| p >= 1)
            .ok_or(ConfigError::DiceFieldTooWide(max_dice_bits))?;
        let reserved = ceil_log2(fields.len() * fields.len());
        let weight_precision = (word_size as i32 - reserved as i32 - dice_precision as i32) / 2;
        if weight_precision < 0 {
            return Err(ConfigError::PrecisionOverflow {
                dice: dice_precision,
                weight: 0,
                word_size,
                fields: fields.len(),
            });
        }
        let max_weight = fields.iter().fold(0.0_f64, |m, f| m.max(f.weight));

        let mut cfg = Self {
            fields,
            index,
            exchange_groups: groups,
            ungrouped,
            threshold,
            tthreshold,
            word_size,
            dice_precision: 0,
            weight_precision: 0,
            hw_width,
            max_weight,
        };
        cfg.set_precisions(dice_precision, weight_precision as u16)?;
        debug!(
            word_size,
            fields = cfg.fields.len(),
            dice_precision = cfg.dice_precision,
            weight_precision = cfg.weight_precision,
            "derived fixed-point precisions"
        );
        Ok(cfg)
    }

    /// Overrides the derived precisions, re-validating the overflow
    /// invariant. On rejection the previous precisions stay in effect.
    pub fn set_precisions(&mut self, dice: u16, weight: u16) -> Result<(), ConfigError> {
        if self.hw_width + dice + 1 > DIV_WIDTH {
            return Err(ConfigError::DicePrecisionTooLarge {
                dice,
                hw_width: self.hw_width,
            });
        }
        let reserved = ceil_log2(self.fields.len() * self.fields.len());
        if dice as u32 + 2 * weight as u32 + reserved as u32 > self.word_size as u32 {
            return Err(ConfigError::PrecisionOverflow {
                dice,
                weight,
                word_size: self.word_size,
                fields: self.fields.len(),
            });
        }
        self.dice_precision = dice;
        self.weight_precision = weight;
        Ok(())
    }

    /// Splits the available bit budget evenly between the dice coefficient
    /// and the weight. A remainder of one bit goes to the dice precision; a
    /// remainder of two is consumed by the weight precision, which counts
    /// twice in the budget.
    pub fn set_ideal_precisions(&mut self) -> Result<(), ConfigError> {
        let available = self.word_size - ceil_log2(self.fields.len() * self.fields.len());
        let mut dice = available / 3;
        let mut weight = dice;
        match available % 3 {
            1 => dice += 1,
            2 => weight += 1,
            _ => {}
        }
        self.set_precisions(dice, weight)
    }

    /// The field arena, sorted by name.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Number of configured fields.
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Looks up a field's index in the arena.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Exchange groups as sorted index lists into the field arena.
    pub fn exchange_groups(&self) -> &[Vec<usize>] {
        &self.exchange_groups
    }

    /// Indices of all fields not covered by an exchange group.
    pub fn ungrouped(&self) -> &[usize] {
        &self.ungrouped
    }

    /// Match threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Tentative-match threshold.
    pub fn tthreshold(&self) -> f64 {
        self.tthreshold
    }

    /// Bit length of arithmetic shares.
    pub fn word_size(&self) -> u16 {
        self.word_size
    }

    /// Fractional bits of the dice coefficient.
    pub fn dice_precision(&self) -> u16 {
        self.dice_precision
    }

    /// Fractional bits of rescaled field weights.
    pub fn weight_precision(&self) -> u16 {
        self.weight_precision
    }

    /// Width of hamming-weight shares, shared by all similarity fields.
    pub fn hw_width(&self) -> u16 {
        self.hw_width
    }

    /// The largest configured field weight, reference point for rescaling.
    pub fn max_weight(&self) -> f64 {
        self.max_weight
    }

    /// A threshold as a fixed-point constant on the dice scale.
    pub fn scaled_threshold(&self, threshold: f64) -> u64 {
        (threshold * (1u64 << self.dice_precision) as f64) as u64
    }
}

/// Smallest `b` such that `2^b >= x`; 0 for `x <= 1`.
pub(crate) fn ceil_log2(x: usize) -> u16 {
    (usize::BITS - x.saturating_sub(1).leading_zeros()) as u16
}

/// [`ceil_log2`], but at least 1.
pub(crate) fn ceil_log2_min1(x: usize) -> u16 {
    ceil_log2(x).max(1)
}

/// Bits needed to hold the population count of a `bits`-wide vector.
pub(crate) fn hw_width(bits: u16) -> u16 {
    ceil_log2_min1(bits as usize + 1)
}

/// Rescales a weight to an integer such that `max_weight` maps to the
/// all-ones value at the given precision.
pub fn rescale_weight(weight: f64, precision: u16, max_weight: f64) -> u64 {
    let max_element = (1u64 << precision) - 1;
    ((weight / max_weight) * max_element as f64).round() as u64
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn field(name: &str, weight: f64, comparator: Comparator, bits: u16) -> FieldSpec {
        let domain = match comparator {
            Comparator::Exact => ValueDomain::Integer,
            Comparator::Dice => ValueDomain::Bitmask,
        };
        FieldSpec::new(name, weight, comparator, domain, bits)
    }

    fn four_field_config(groups: Vec<Vec<String>>) -> Result<LinkageConfig, ConfigError> {
        LinkageConfig::new(
            vec![
                field("int_1", 1.0, Comparator::Exact, 29),
                field("int_2", 3.0, Comparator::Exact, 32),
                field("bm_1", 2.0, Comparator::Dice, 8),
                field("bm_2", 4.0, Comparator::Dice, 8),
            ],
            groups,
            0.9,
            0.7,
            32,
        )
    }

    #[test]
    fn derives_precisions_without_dice_fields() {
        let cfg = LinkageConfig::new(
            vec![field("int_1", 1.0, Comparator::Exact, 29)],
            vec![],
            0.9,
            0.7,
            32,
        )
        .unwrap();
        // No similarity field: hamming width defaults to 1, so the divider
        // leaves 14 fractional bits, and (32 - 0 - 14) / 2 = 9 for weights.
        assert_eq!(cfg.dice_precision(), 14);
        assert_eq!(cfg.weight_precision(), 9);
        assert_eq!(cfg.hw_width(), 1);
    }

    #[test]
    fn derives_precisions_for_mixed_schema() {
        let cfg = four_field_config(vec![]).unwrap();
        // 8-bit bitmasks: hw fits 4 bits, dice = 16 - 1 - 4 = 11,
        // weight = (32 - ceil_log2(16) - 11) / 2 = 8.
        assert_eq!(cfg.hw_width(), 4);
        assert_eq!(cfg.dice_precision(), 11);
        assert_eq!(cfg.weight_precision(), 8);
        assert_eq!(cfg.max_weight(), 4.0);
    }

    #[test]
    fn fields_are_sorted_and_indexed() {
        let cfg = four_field_config(vec![]).unwrap();
        let names: Vec<_> = cfg.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["bm_1", "bm_2", "int_1", "int_2"]);
        assert_eq!(cfg.field_index("int_1"), Some(2));
        assert_eq!(cfg.field_index("missing"), None);
    }

    #[test]
    fn rejects_duplicate_fields() {
        let err = LinkageConfig::new(
            vec![
                field("a", 1.0, Comparator::Exact, 8),
                field("a", 2.0, Comparator::Exact, 8),
            ],
            vec![],
            0.9,
            0.7,
            32,
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateField("a".into()));
    }

    #[test]
    fn rejects_bad_thresholds() {
        let fields = vec![field("a", 1.0, Comparator::Exact, 8)];
        let err = LinkageConfig::new(fields.clone(), vec![], 1.2, 0.7, 32).unwrap_err();
        assert_eq!(err, ConfigError::InvalidThreshold(1.2));
        let err = LinkageConfig::new(fields, vec![], 0.7, 0.9, 32).unwrap_err();
        assert_eq!(
            err,
            ConfigError::ThresholdOrder {
                tentative: 0.9,
                threshold: 0.7
            }
        );
    }

    #[test]
    fn rejects_overlapping_groups() {
        let err = four_field_config(vec![
            vec!["bm_1".into(), "bm_2".into()],
            vec!["bm_2".into(), "int_1".into()],
        ])
        .unwrap_err();
        assert_eq!(err, ConfigError::OverlappingGroups("bm_2".into()));
    }

    #[test]
    fn rejects_mixed_comparator_groups() {
        let err = four_field_config(vec![vec!["bm_1".into(), "int_1".into()]]).unwrap_err();
        assert!(matches!(err, ConfigError::GroupComparatorMismatch { .. }));
    }

    #[test]
    fn rejects_mixed_width_groups() {
        let err = four_field_config(vec![vec!["int_1".into(), "int_2".into()]]).unwrap_err();
        assert!(matches!(err, ConfigError::GroupWidthMismatch { .. }));
    }

    #[test]
    fn rejected_override_keeps_previous_precisions() {
        let mut cfg = four_field_config(vec![]).unwrap();
        let (dice, weight) = (cfg.dice_precision(), cfg.weight_precision());
        assert!(cfg.set_precisions(11, 30).is_err());
        assert_eq!(cfg.dice_precision(), dice);
        assert_eq!(cfg.weight_precision(), weight);
        cfg.set_precisions(10, 8).unwrap();
        assert_eq!(cfg.dice_precision(), 10);
        assert_eq!(cfg.weight_precision(), 8);
    }

    #[test]
    fn ideal_precisions_use_the_whole_budget() {
        let mut cfg = four_field_config(vec![]).unwrap();
        // 32 - ceil_log2(16) = 28 available, remainder 1 goes to dice.
        cfg.set_ideal_precisions().unwrap();
        assert_eq!(cfg.dice_precision(), 10);
        assert_eq!(cfg.weight_precision(), 9);
    }

    #[test]
    fn weight_from_error_rate() {
        let f = FieldSpec::from_error_rate(
            "birth_month",
            0.0833,
            0.002,
            Comparator::Exact,
            ValueDomain::Integer,
            4,
        );
        assert!((f.weight - ((1.0_f64 - 0.002) / 0.0833).log2()).abs() < 1e-12);
    }

    #[test]
    fn ceil_log2_matches_definition() {
        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(16), 4);
        assert_eq!(hw_width(8), 4);
        assert_eq!(hw_width(500), 9);
    }

    #[test]
    fn rescale_maps_max_weight_to_all_ones() {
        assert_eq!(rescale_weight(4.0, 8, 4.0), 255);
        assert_eq!(rescale_weight(2.0, 8, 4.0), 128);
        assert_eq!(rescale_weight(1.0, 9, 1.0), 511);
    }

    proptest! {
        #[test]
        fn invariant_holds_after_construction(
            n_fields in 1usize..12,
            bits in 1u16..600,
            word_size in 24u16..=64,
        ) {
            let fields = (0..n_fields)
                .map(|i| field(&format!("f{i}"), 1.0 + i as f64, Comparator::Dice, bits))
                .collect();
            if let Ok(cfg) = LinkageConfig::new(fields, vec![], 0.9, 0.7, word_size) {
                let reserved = ceil_log2(n_fields * n_fields);
                prop_assert!(
                    cfg.dice_precision() + 2 * cfg.weight_precision() + reserved
                        <= cfg.word_size()
                );
                prop_assert!(cfg.hw_width() + cfg.dice_precision() + 1 <= DIV_WIDTH);
            }
        }
    }
}
