//! Cleartext linkage inputs: query records, the candidate database, and
//! their validation against a [`LinkageConfig`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LinkageConfig;

/// A field value as a little-endian byte vector.
pub type Bitmask = Vec<u8>;

/// Number of bytes needed to hold `bits` bits.
pub fn bitbytes(bits: u16) -> usize {
    bits as usize / 8 + usize::from(bits % 8 != 0)
}

/// Population count of a bit vector.
pub fn popcount(bytes: &[u8]) -> u64 {
    bytes.iter().map(|b| b.count_ones() as u64).sum()
}

/// Encodes an integer as a little-endian bit vector of the given width.
/// Bits beyond the width are masked off.
pub fn integer_bitmask(value: u64, bits: u16) -> Bitmask {
    let masked = if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    };
    let mut bytes = vec![0; bitbytes(bits)];
    let le = masked.to_le_bytes();
    let used = bytes.len().min(le.len());
    bytes[..used].copy_from_slice(&le[..used]);
    bytes
}

/// Errors rejecting malformed records or databases.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    /// A value was supplied for a field that is not part of the schema.
    #[error("unknown field '{0}'")]
    UnknownField(String),
    /// A value has the wrong number of bytes for its field.
    #[error("field '{field}' expects {expected} bytes, got {actual}")]
    WrongByteLength {
        /// Field name.
        field: String,
        /// Expected byte count derived from the field's bit width.
        expected: usize,
        /// Provided byte count.
        actual: usize,
    },
    /// A record holds the wrong number of fields for the configuration.
    #[error("record holds {actual} fields, the configuration has {expected}")]
    FieldCountMismatch {
        /// Number of configured fields.
        expected: usize,
        /// Number of fields in the record.
        actual: usize,
    },
    /// Database columns disagree in length.
    #[error("database column '{field}' has {actual} entries, expected {expected}")]
    ColumnLengthMismatch {
        /// Field name of the offending column.
        field: String,
        /// Expected number of entries.
        expected: usize,
        /// Provided number of entries.
        actual: usize,
    },
    /// The database holds no records.
    #[error("the database must not be empty")]
    EmptyDatabase,
    /// A request carries no query records.
    #[error("a request must carry at least one query record")]
    NoRecords,
    /// The number of query records does not match the built circuit.
    #[error("expected {expected} query records, got {actual}")]
    RecordCountMismatch {
        /// Record count the circuit was built for.
        expected: usize,
        /// Provided record count.
        actual: usize,
    },
    /// The database size does not match the built circuit.
    #[error("expected a database of {expected} records, got {actual}")]
    DatabaseSizeMismatch {
        /// Database size the circuit was built for.
        expected: usize,
        /// Provided database size.
        actual: usize,
    },
}

fn check_value(
    cfg: &LinkageConfig,
    field: usize,
    value: &Option<Bitmask>,
) -> Result<(), InputError> {
    if let Some(bytes) = value {
        let expected = bitbytes(cfg.fields()[field].bits);
        if bytes.len() != expected {
            return Err(InputError::WrongByteLength {
                field: cfg.fields()[field].name.clone(),
                expected,
                actual: bytes.len(),
            });
        }
    }
    Ok(())
}

/// One record: per-field optional values aligned to the field order of a
/// [`LinkageConfig`]. `None` means "no data" for that field, not zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    values: Vec<Option<Bitmask>>,
}

impl Record {
    /// Builds a record from values in configuration field order.
    pub fn new(cfg: &LinkageConfig, values: Vec<Option<Bitmask>>) -> Result<Self, InputError> {
        if values.len() != cfg.num_fields() {
            return Err(InputError::FieldCountMismatch {
                expected: cfg.num_fields(),
                actual: values.len(),
            });
        }
        for (f, value) in values.iter().enumerate() {
            check_value(cfg, f, value)?;
        }
        Ok(Self { values })
    }

    /// Builds a record from `(name, value)` pairs. Fields without an entry
    /// are absent.
    pub fn from_named<'a>(
        cfg: &LinkageConfig,
        entries: impl IntoIterator<Item = (&'a str, Option<Bitmask>)>,
    ) -> Result<Self, InputError> {
        let mut values = vec![None; cfg.num_fields()];
        for (name, value) in entries {
            let f = cfg
                .field_index(name)
                .ok_or_else(|| InputError::UnknownField(name.to_string()))?;
            check_value(cfg, f, &value)?;
            values[f] = value;
        }
        Ok(Self { values })
    }

    /// The value of the field at the given arena index, if present.
    pub fn value(&self, field: usize) -> Option<&Bitmask> {
        self.values[field].as_ref()
    }

    pub(crate) fn num_fields(&self) -> usize {
        self.values.len()
    }
}

/// The server-side candidate database, stored column-major: one column of
/// optional values per configured field, all of equal length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    columns: Vec<Vec<Option<Bitmask>>>,
    size: usize,
}

impl Database {
    /// Builds a database from row-oriented records.
    pub fn from_records(cfg: &LinkageConfig, records: &[Record]) -> Result<Self, InputError> {
        if records.is_empty() {
            return Err(InputError::EmptyDatabase);
        }
        let mut columns = vec![Vec::with_capacity(records.len()); cfg.num_fields()];
        for record in records {
            if record.num_fields() != cfg.num_fields() {
                return Err(InputError::FieldCountMismatch {
                    expected: cfg.num_fields(),
                    actual: record.num_fields(),
                });
            }
            for (f, column) in columns.iter_mut().enumerate() {
                column.push(record.values[f].clone());
            }
        }
        Ok(Self {
            columns,
            size: records.len(),
        })
    }

    /// Builds a database from named columns. Fields without a column are
    /// absent for every record; all provided columns must agree in length.
    pub fn from_columns<'a>(
        cfg: &LinkageConfig,
        columns: impl IntoIterator<Item = (&'a str, Vec<Option<Bitmask>>)>,
    ) -> Result<Self, InputError> {
        let mut size = None;
        let mut table = vec![None; cfg.num_fields()];
        for (name, column) in columns {
            let f = cfg
                .field_index(name)
                .ok_or_else(|| InputError::UnknownField(name.to_string()))?;
            let expected = *size.get_or_insert(column.len());
            if column.len() != expected {
                return Err(InputError::ColumnLengthMismatch {
                    field: name.to_string(),
                    expected,
                    actual: column.len(),
                });
            }
            for value in &column {
                check_value(cfg, f, value)?;
            }
            table[f] = Some(column);
        }
        let size = size.filter(|&s| s > 0).ok_or(InputError::EmptyDatabase)?;
        let columns = table
            .into_iter()
            .map(|column| column.unwrap_or_else(|| vec![None; size]))
            .collect();
        Ok(Self { columns, size })
    }

    /// Number of records.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The column of the field at the given arena index.
    pub fn column(&self, field: usize) -> &[Option<Bitmask>] {
        &self.columns[field]
    }

    pub(crate) fn num_fields(&self) -> usize {
        self.columns.len()
    }
}

/// The client's linkage request: query records plus the size of the remote
/// database, which is a public protocol parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInput {
    /// Query records, evaluated one circuit execution each.
    pub records: Vec<Record>,
    /// Number of records in the server's database.
    pub database_size: usize,
}

/// The server's side of a linkage request: its database plus the number of
/// query records the client will send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInput {
    /// The candidate database.
    pub database: Database,
    /// Number of query records in the client's request.
    pub num_records: usize,
}
