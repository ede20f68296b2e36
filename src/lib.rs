//! Privacy-preserving probabilistic record linkage over secure two-party
//! computation.
//!
//! A client holding query records and a server holding a database jointly
//! evaluate the EpiLink weighted-similarity score without either side
//! learning the other's field values: per-field comparisons (exact equality
//! or dice coefficients over bit vectors), oblivious resolution of
//! exchangeable fields (e.g. transposed first/last names), best-match
//! selection across all candidate records, and threshold classification all
//! run on secret-shared values. Only the match decisions and the index of
//! the best candidate are revealed, and only to the designated parties.
//!
//! The secure-computation engine itself is not part of this crate: all
//! share operations go through the [`backend::ShareBackend`] trait, and the
//! circuit never branches on a secret value — its structure is fixed by
//! public configuration alone. Fixed-point precisions are derived at
//! configuration time so that no intermediate value can overflow the share
//! word size.
//!
//! ## Main Components
//!
//! * [`config`]: field schema, exchange groups and precision derivation.
//! * [`input`]: cleartext records and databases, validated per schema.
//! * [`backend`]: the share-operation interface an engine implements.
//! * [`linker`]: the request interface — build, setup, inputs, run, reset.
//! * [`mock`]: an in-process backend for tests and cleartext verification.
//!
//! ## Example
//!
//! Linking a single query record against a one-record database with the
//! in-process mock backend:
//!
//! ```
//! use seclink::{
//!     config::{Comparator, FieldSpec, LinkageConfig, ValueDomain},
//!     input::{integer_bitmask, ClientInput, Database, Record, ServerInput},
//!     linker::SecureLinker,
//!     mock::MockBackend,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = LinkageConfig::new(
//!     vec![FieldSpec::new(
//!         "card_id",
//!         1.0,
//!         Comparator::Exact,
//!         ValueDomain::Integer,
//!         32,
//!     )],
//!     vec![],
//!     0.9,
//!     0.7,
//!     32,
//! )?;
//! let record = Record::from_named(&cfg, [("card_id", Some(integer_bitmask(42, 32)))])?;
//! let database = Database::from_records(&cfg, &[record.clone()])?;
//!
//! let mut linker = SecureLinker::new(cfg, MockBackend::new(32));
//! linker.build(1, 1)?;
//! linker.run_setup()?;
//! linker.set_both_inputs(
//!     ClientInput { records: vec![record], database_size: 1 },
//!     ServerInput { database, num_records: 1 },
//! )?;
//! let results = linker.run_linkage()?.expect("mock reveals to both parties");
//! assert!(results[0].matched);
//! # Ok(())
//! # }
//! ```
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod backend;
mod circuit;
pub mod config;
pub mod input;
pub mod linker;
pub mod mock;
