use seclink::{
    backend::{RevealTo, Role},
    config::{rescale_weight, Comparator, FieldSpec, LinkageConfig, ValueDomain},
    input::{integer_bitmask, ClientInput, Database, Record, ServerInput},
    linker::{Error, LinkageResult, SecureLinker},
    mock::MockBackend,
};
use seclink_test_utils::{clear, random::RandomInputGenerator};

const THRESHOLD: f64 = 0.9;
const TTHRESHOLD: f64 = 0.7;

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn field(name: &str, weight: f64, comparator: Comparator, bits: u16) -> FieldSpec {
    let domain = match comparator {
        Comparator::Exact => ValueDomain::Integer,
        Comparator::Dice => ValueDomain::Bitmask,
    };
    FieldSpec::new(name, weight, comparator, domain, bits)
}

fn test_fields() -> Vec<FieldSpec> {
    vec![
        field("int_1", 1.0, Comparator::Exact, 29),
        field("int_2", 3.0, Comparator::Exact, 32),
        field("bm_1", 2.0, Comparator::Dice, 8),
        field("bm_2", 4.0, Comparator::Dice, 8),
    ]
}

fn config(fields: Vec<FieldSpec>, groups: Vec<Vec<String>>) -> LinkageConfig {
    LinkageConfig::new(fields, groups, THRESHOLD, TTHRESHOLD, 32).unwrap()
}

fn linker_for(cfg: &LinkageConfig) -> SecureLinker<MockBackend> {
    SecureLinker::new(cfg.clone(), MockBackend::new(cfg.word_size()))
}

fn run_linkage(cfg: &LinkageConfig, records: Vec<Record>, database: Database) -> Vec<LinkageResult> {
    let num_records = records.len();
    let database_size = database.size();
    let mut linker = linker_for(cfg);
    linker.build(num_records, database_size).unwrap();
    linker.run_setup().unwrap();
    linker
        .set_both_inputs(
            ClientInput {
                records,
                database_size,
            },
            ServerInput {
                database,
                num_records,
            },
        )
        .unwrap();
    linker
        .run_linkage()
        .unwrap()
        .expect("mock reveals to both parties")
}

fn run_count(cfg: &LinkageConfig, records: Vec<Record>, database: Database) -> (u64, u64) {
    let num_records = records.len();
    let database_size = database.size();
    let mut linker = linker_for(cfg);
    linker.build(num_records, database_size).unwrap();
    linker.run_setup().unwrap();
    linker
        .set_both_inputs(
            ClientInput {
                records,
                database_size,
            },
            ServerInput {
                database,
                num_records,
            },
        )
        .unwrap();
    let counts = linker
        .run_count()
        .unwrap()
        .expect("mock reveals to both parties");
    (counts.matches, counts.tentative_matches)
}

fn assert_agrees_with_oracle(
    cfg: &LinkageConfig,
    result: &LinkageResult,
    oracle: &clear::ClearResult,
) {
    assert_eq!(result.matched, oracle.matched);
    assert_eq!(result.tentative, oracle.tentative);
    // Ties may resolve to any maximal index.
    assert!(
        oracle.max_indices.contains(&(result.index as usize)),
        "index {} not maximal, expected one of {:?}",
        result.index,
        oracle.max_indices
    );
    #[cfg(debug_assertions)]
    assert_eq!(
        result.score,
        (
            oracle.score.numerator,
            oracle.score.denominator << cfg.dice_precision()
        )
    );
    #[cfg(not(debug_assertions))]
    let _ = cfg;
}

#[test]
fn identical_exact_field_matches_for_any_database_size() {
    let cfg = config(vec![field("int_1", 1.0, Comparator::Exact, 29)], vec![]);
    for n in 1..=5 {
        let record =
            Record::from_named(&cfg, [("int_1", Some(integer_bitmask(0xDEAD_BEEF, 29)))]).unwrap();
        let database = Database::from_records(&cfg, &vec![record.clone(); n]).unwrap();
        let results = run_linkage(&cfg, vec![record.clone()], database.clone());
        assert_eq!(results.len(), 1);
        assert!(results[0].matched);
        assert!(results[0].tentative);
        let oracle = clear::linkage(&cfg, &record, &database);
        assert_eq!(oracle.max_indices.len(), n);
        assert_agrees_with_oracle(&cfg, &results[0], &oracle);
    }
}

#[test]
fn dice_coefficient_stays_within_the_configured_precision() {
    let cfg = config(vec![field("bm_1", 1.0, Comparator::Dice, 8)], vec![]);
    let record = Record::from_named(&cfg, [("bm_1", Some(vec![0b0111_0111]))]).unwrap();
    let candidate = Record::from_named(&cfg, [("bm_1", Some(vec![0b1110_1110]))]).unwrap();
    let database = Database::from_records(&cfg, &[candidate]).unwrap();
    let results = run_linkage(&cfg, vec![record.clone()], database.clone());
    let oracle = clear::linkage(&cfg, &record, &database);
    assert_agrees_with_oracle(&cfg, &results[0], &oracle);

    // hw(x) = hw(y) = 6, hw(x & y) = 4: the true coefficient is 2/3.
    #[cfg(debug_assertions)]
    {
        let (num, den) = results[0].score;
        let secret_dice = num as f64 / den as f64;
        let true_dice = 2.0 * 4.0 / 12.0;
        assert!(secret_dice <= true_dice);
        assert!(true_dice - secret_dice <= 1.0 / (1u64 << cfg.dice_precision()) as f64);
    }
}

#[test]
fn exchange_group_resolves_to_the_best_alignment() {
    let grouped = config(test_fields(), vec![vec!["bm_1".into(), "bm_2".into()]]);
    let straight = config(test_fields(), vec![]);
    let entries = |bm_1: u8, bm_2: u8| {
        [
            ("bm_1", Some(vec![bm_1])),
            ("bm_2", Some(vec![bm_2])),
            ("int_1", Some(integer_bitmask(0xDEAD_BEEF, 29))),
            ("int_2", Some(integer_bitmask(0xDECE_A5ED, 32))),
        ]
    };
    let client = Record::from_named(&grouped, entries(0x33, 0x43)).unwrap();
    let server = Record::from_named(&grouped, entries(0x44, 0x35)).unwrap();
    let database = Database::from_records(&grouped, &[server]).unwrap();

    let results = run_linkage(&grouped, vec![client.clone()], database.clone());
    let oracle = clear::linkage(&grouped, &client, &database);
    assert_agrees_with_oracle(&grouped, &results[0], &oracle);

    // The swapped alignment scores far better here (0x33 vs 0x35 overlaps
    // in 3 bits), so resolving the group must beat in-place comparison.
    let in_place = clear::record_score(&straight, &client, &database, 0);
    let resolved = oracle.score;
    assert!(
        resolved.numerator as u128 * in_place.denominator as u128
            > in_place.numerator as u128 * resolved.denominator as u128
    );
}

#[test]
fn three_field_exchange_group_matches_the_cleartext_maximum() {
    let names = ["g_1".to_string(), "g_2".to_string(), "g_3".to_string()];
    let cfg = config(
        vec![
            field("g_1", 1.0, Comparator::Dice, 8),
            field("g_2", 2.0, Comparator::Dice, 8),
            field("g_3", 3.0, Comparator::Dice, 8),
        ],
        vec![names.to_vec()],
    );
    // The server's fields are a rotation of the client's, so the best of
    // the six alignments is a perfect score.
    let client = Record::from_named(
        &cfg,
        [
            ("g_1", Some(vec![0x0F])),
            ("g_2", Some(vec![0xF0])),
            ("g_3", Some(vec![0x3C])),
        ],
    )
    .unwrap();
    let server = Record::from_named(
        &cfg,
        [
            ("g_1", Some(vec![0xF0])),
            ("g_2", Some(vec![0x3C])),
            ("g_3", Some(vec![0x0F])),
        ],
    )
    .unwrap();
    let database = Database::from_records(&cfg, &[server]).unwrap();
    let results = run_linkage(&cfg, vec![client.clone()], database.clone());
    let oracle = clear::linkage(&cfg, &client, &database);
    assert!(results[0].matched);
    assert_agrees_with_oracle(&cfg, &results[0], &oracle);
}

#[test]
fn absent_fields_contribute_nothing() {
    let cfg = config(
        vec![
            field("bm_1", 2.0, Comparator::Dice, 8),
            field("bm_2", 4.0, Comparator::Dice, 8),
        ],
        vec![],
    );
    let client = Record::from_named(&cfg, [("bm_2", Some(vec![0x44]))]).unwrap();
    let database = Database::from_columns(
        &cfg,
        [
            // Absent for the client in any case; absent for record 0 on
            // both sides.
            ("bm_1", vec![None, Some(vec![0x31])]),
            ("bm_2", vec![Some(vec![0x43]), Some(vec![0x44])]),
        ],
    )
    .unwrap();

    let results = run_linkage(&cfg, vec![client.clone()], database.clone());
    let oracle = clear::linkage(&cfg, &client, &database);
    assert_agrees_with_oracle(&cfg, &results[0], &oracle);

    // Only bm_2's weight may appear in any denominator.
    let bm_2_weight = rescale_weight(4.0, cfg.weight_precision(), cfg.max_weight());
    for row in 0..database.size() {
        let score = clear::record_score(&cfg, &client, &database, row);
        assert_eq!(score.denominator, bm_2_weight);
    }
    // Record 1 holds the exact bm_2 value and must win.
    assert_eq!(results[0].index, 1);
}

#[test]
fn threshold_ties_classify_as_non_match() {
    // A single similarity field scoring exactly 1/2: hw(x) = 1, hw(y) = 3,
    // hw(x & y) = 1. With a threshold of exactly 0.5 the strict comparison
    // must reject, while the lower tentative threshold accepts.
    let cfg = LinkageConfig::new(
        vec![field("bm_1", 1.0, Comparator::Dice, 8)],
        vec![],
        0.5,
        0.25,
        32,
    )
    .unwrap();
    let client = Record::from_named(&cfg, [("bm_1", Some(vec![0b0000_0001]))]).unwrap();
    let server = Record::from_named(&cfg, [("bm_1", Some(vec![0b0000_0111]))]).unwrap();
    let database = Database::from_records(&cfg, &[server]).unwrap();

    let results = run_linkage(&cfg, vec![client.clone()], database.clone());
    assert!(!results[0].matched);
    assert!(results[0].tentative);
    assert_eq!(run_count(&cfg, vec![client.clone()], database.clone()), (0, 1));
    let oracle = clear::linkage(&cfg, &client, &database);
    assert_agrees_with_oracle(&cfg, &results[0], &oracle);
}

/// A patient-record schema with error-rate derived weights. `jitter` varies
/// the priors so repeated runs also cover different weight configurations.
fn patient_config(jitter: f64) -> LinkageConfig {
    let dice = |name: &str, frequency: f64, error_rate: f64| {
        FieldSpec::from_error_rate(
            name,
            frequency * (1.0 + jitter),
            error_rate,
            Comparator::Dice,
            ValueDomain::Bitmask,
            500,
        )
    };
    let exact = |name: &str, frequency: f64, error_rate: f64, bits| {
        FieldSpec::from_error_rate(
            name,
            frequency * (1.0 + jitter),
            error_rate,
            Comparator::Exact,
            ValueDomain::Integer,
            bits,
        )
    };
    LinkageConfig::new(
        vec![
            dice("first_name", 0.000235, 0.01),
            dice("last_name", 0.0000271, 0.008),
            dice("birth_name", 0.0000271, 0.008),
            exact("birth_day", 0.0333, 0.005, 5),
            exact("birth_month", 0.0833, 0.002, 4),
            exact("birth_year", 0.0286, 0.004, 11),
            exact("zip_code", 0.01, 0.04, 40),
            dice("city", 0.01, 0.04),
        ],
        vec![vec![
            "first_name".into(),
            "last_name".into(),
            "birth_name".into(),
        ]],
        THRESHOLD,
        TTHRESHOLD,
        32,
    )
    .unwrap()
}

#[test]
fn randomized_inputs_agree_with_the_cleartext_oracle() {
    for seed in 0..5 {
        let cfg = patient_config(seed as f64 * 0.17);
        let mut generator = RandomInputGenerator::new(seed);
        let record = generator.record(&cfg);
        let database = generator.database(&cfg, 7);
        let results = run_linkage(&cfg, vec![record.clone()], database.clone());
        let oracle = clear::linkage(&cfg, &record, &database);
        assert_agrees_with_oracle(&cfg, &results[0], &oracle);
    }
}

#[test]
fn count_mode_agrees_with_the_cleartext_oracle() {
    let cfg = patient_config(0.0);
    let mut generator = RandomInputGenerator::new(42);
    generator.set_absent_probability(0.4);
    let records = vec![generator.record(&cfg), generator.record(&cfg)];
    let database = generator.database(&cfg, 5);

    let (matches, tentative) = run_count(&cfg, records.clone(), database.clone());
    let mut expected = (0, 0);
    for record in &records {
        let (m, t) = clear::count(&cfg, record, &database);
        expected.0 += m;
        expected.1 += t;
    }
    assert_eq!((matches, tentative), expected);
}

#[test]
fn multiple_query_records_yield_one_result_each() {
    let cfg = config(test_fields(), vec![]);
    let mut generator = RandomInputGenerator::new(7);
    let records = vec![generator.record(&cfg), generator.record(&cfg)];
    let database = generator.database(&cfg, 4);
    let results = run_linkage(&cfg, records.clone(), database.clone());
    assert_eq!(results.len(), 2);
    for (record, result) in records.iter().zip(&results) {
        let oracle = clear::linkage(&cfg, record, &database);
        assert_agrees_with_oracle(&cfg, result, &oracle);
    }
}

#[test]
fn implicit_phases_produce_the_same_result() {
    init_logging();
    let cfg = config(test_fields(), vec![]);
    let mut generator = RandomInputGenerator::new(3);
    let record = generator.record(&cfg);
    let database = generator.database(&cfg, 3);
    let explicit = run_linkage(&cfg, vec![record.clone()], database.clone());

    // Neither build nor setup called: both phases run implicitly.
    let mut linker = linker_for(&cfg);
    linker
        .set_both_inputs(
            ClientInput {
                records: vec![record],
                database_size: 3,
            },
            ServerInput {
                database,
                num_records: 1,
            },
        )
        .unwrap();
    let implicit = linker.run_linkage().unwrap().unwrap();
    assert_eq!(explicit, implicit);
}

#[test]
fn setup_before_build_is_rejected() {
    let cfg = config(test_fields(), vec![]);
    let mut linker = linker_for(&cfg);
    assert!(matches!(linker.run_setup(), Err(Error::NotBuilt)));
}

#[test]
fn running_without_input_is_rejected() {
    let cfg = config(test_fields(), vec![]);
    let mut linker = linker_for(&cfg);
    linker.build(1, 2).unwrap();
    assert!(matches!(linker.run_linkage(), Err(Error::MissingInput)));
}

#[test]
fn mismatched_sizes_are_rejected() {
    let cfg = config(test_fields(), vec![]);
    let mut generator = RandomInputGenerator::new(11);
    let record = generator.record(&cfg);
    let mut linker = linker_for(&cfg);
    linker.build(1, 2).unwrap();
    let err = linker
        .set_client_input(ClientInput {
            records: vec![record],
            database_size: 3,
        })
        .unwrap_err();
    assert!(matches!(err, Error::Input(_)));
}

#[test]
fn a_second_request_requires_an_explicit_reset() {
    let cfg = config(test_fields(), vec![]);
    let mut generator = RandomInputGenerator::new(5);
    let record = generator.record(&cfg);
    let database = generator.database(&cfg, 2);

    let mut linker = linker_for(&cfg);
    linker
        .set_both_inputs(
            ClientInput {
                records: vec![record.clone()],
                database_size: 2,
            },
            ServerInput {
                database: database.clone(),
                num_records: 1,
            },
        )
        .unwrap();
    let first = linker.run_linkage().unwrap().unwrap();

    // The request is spent: everything except reset is refused.
    assert!(matches!(linker.run_linkage(), Err(Error::ResetRequired)));
    assert!(matches!(
        linker.set_client_input(ClientInput {
            records: vec![record.clone()],
            database_size: 2,
        }),
        Err(Error::ResetRequired)
    ));

    linker.reset();
    linker
        .set_both_inputs(
            ClientInput {
                records: vec![record],
                database_size: 2,
            },
            ServerInput {
                database,
                num_records: 1,
            },
        )
        .unwrap();
    let second = linker.run_linkage().unwrap().unwrap();
    assert_eq!(first, second);
}

#[test]
fn results_are_hidden_from_non_recipients() {
    let cfg = config(test_fields(), vec![]);
    let mut generator = RandomInputGenerator::new(13);
    let record = generator.record(&cfg);
    let database = generator.database(&cfg, 2);

    for (role, visible) in [(Role::Client, true), (Role::Server, false)] {
        let mut linker = SecureLinker::new(cfg.clone(), MockBackend::with_role(32, role));
        linker.set_reveal_target(RevealTo::Client);
        linker
            .set_both_inputs(
                ClientInput {
                    records: vec![record.clone()],
                    database_size: 2,
                },
                ServerInput {
                    database: database.clone(),
                    num_records: 1,
                },
            )
            .unwrap();
        let results = linker.run_linkage().unwrap();
        assert_eq!(results.is_some(), visible);
    }
}
