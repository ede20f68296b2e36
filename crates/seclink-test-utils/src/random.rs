//! Random linkage inputs for round-trip testing.

use rand::{rngs::StdRng, Rng, SeedableRng};
use seclink::{
    config::LinkageConfig,
    input::{bitbytes, Database, Record},
};

/// Generates records and databases matching a schema, with a configurable
/// probability of absent fields. Seeded, so failures reproduce.
pub struct RandomInputGenerator {
    rng: StdRng,
    absent_probability: f64,
}

impl RandomInputGenerator {
    /// A generator with a 20% chance of absent fields.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            absent_probability: 0.2,
        }
    }

    /// Changes the probability of a field being absent.
    pub fn set_absent_probability(&mut self, p: f64) {
        self.absent_probability = p;
    }

    /// A random record for the given schema.
    pub fn record(&mut self, cfg: &LinkageConfig) -> Record {
        let values = cfg
            .fields()
            .iter()
            .map(|field| {
                if self.rng.random_bool(self.absent_probability) {
                    return None;
                }
                let mut bytes = vec![0u8; bitbytes(field.bits)];
                self.rng.fill(bytes.as_mut_slice());
                if field.bits % 8 != 0 {
                    let last = bytes.len() - 1;
                    bytes[last] &= (1u8 << (field.bits % 8)) - 1;
                }
                Some(bytes)
            })
            .collect();
        Record::new(cfg, values).expect("generated values match the schema")
    }

    /// A random database of the given size.
    pub fn database(&mut self, cfg: &LinkageConfig, size: usize) -> Database {
        let records: Vec<Record> = (0..size).map(|_| self.record(cfg)).collect();
        Database::from_records(cfg, &records).expect("generated records match the schema")
    }
}
