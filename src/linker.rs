//! The public linkage interface: request phases, input handling and result
//! readback.
//!
//! A [`SecureLinker`] wraps a [`ShareBackend`] and walks one linkage request
//! through its phases: `build` fixes the public circuit shape, `run_setup`
//! triggers the engine's precomputation, the inputs arrive from one side (or
//! both, with an in-process backend), and `run_linkage`/`run_count` execute
//! the graph and read the revealed outputs. Skipped phases are run
//! implicitly with a warning where the request itself provides the missing
//! information; a finished or failed request requires an explicit
//! [`reset`](SecureLinker::reset) before the next one.

use tracing::{debug, warn};

use crate::{
    backend::{self, RevealTo, ShareBackend},
    circuit::LinkageCircuit,
    config::LinkageConfig,
    input::{ClientInput, InputError, ServerInput},
};

/// Outcome of linking one query record against the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkageResult {
    /// Index of the best-matching database record.
    pub index: u64,
    /// Whether the best score exceeds the match threshold.
    pub matched: bool,
    /// Whether the best score exceeds the tentative threshold.
    pub tentative: bool,
    /// Raw score numerator and denominator on a common fixed-point scale,
    /// for verification against a cleartext oracle. Only available in debug
    /// builds.
    #[cfg(debug_assertions)]
    pub score: (u64, u64),
}

/// Totals of a counting request: how many database records cleared each
/// threshold, summed over all query records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CountResult {
    /// Records above the match threshold.
    pub matches: u64,
    /// Records above the tentative threshold.
    pub tentative_matches: u64,
}

/// Errors raised while orchestrating a linkage request.
#[derive(Debug)]
pub enum Error {
    /// A record or database failed validation against the configuration.
    Input(InputError),
    /// The secure-computation engine failed. The in-flight request is lost;
    /// the linker must be reset before the next one.
    Backend(backend::Error),
    /// Setup was requested before the circuit shape was known.
    NotBuilt,
    /// A run was attempted without any input set.
    MissingInput,
    /// A previous request finished or failed; `reset` must run first.
    ResetRequired,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Input(e) => write!(f, "invalid input: {e}"),
            Error::Backend(e) => write!(f, "backend failure: {e}"),
            Error::NotBuilt => f.write_str("the circuit must be built before running setup"),
            Error::MissingInput => f.write_str("no input was set for this request"),
            Error::ResetRequired => {
                f.write_str("a previous request is still pending teardown, reset first")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<InputError> for Error {
    fn from(e: InputError) -> Self {
        Self::Input(e)
    }
}

impl From<backend::Error> for Error {
    fn from(e: backend::Error) -> Self {
        Self::Backend(e)
    }
}

/// Drives linkage requests against a share backend.
pub struct SecureLinker<B: ShareBackend> {
    cfg: LinkageConfig,
    backend: B,
    reveal_to: RevealTo,
    num_records: usize,
    database_size: usize,
    is_built: bool,
    is_setup: bool,
    needs_reset: bool,
    client: Option<ClientInput>,
    server: Option<ServerInput>,
}

impl<B: ShareBackend> SecureLinker<B> {
    /// Creates a linker revealing results to both parties.
    pub fn new(cfg: LinkageConfig, backend: B) -> Self {
        Self {
            cfg,
            backend,
            reveal_to: RevealTo::Both,
            num_records: 0,
            database_size: 0,
            is_built: false,
            is_setup: false,
            needs_reset: false,
            client: None,
            server: None,
        }
    }

    /// Changes which party learns the revealed results.
    pub fn set_reveal_target(&mut self, to: RevealTo) {
        self.reveal_to = to;
    }

    /// The configuration this linker was built with.
    pub fn config(&self) -> &LinkageConfig {
        &self.cfg
    }

    /// Fixes the public circuit shape: the number of query records and the
    /// size of the candidate database.
    pub fn build(&mut self, num_records: usize, database_size: usize) -> Result<(), Error> {
        if self.needs_reset {
            return Err(Error::ResetRequired);
        }
        if num_records == 0 {
            return Err(InputError::NoRecords.into());
        }
        if database_size == 0 {
            return Err(InputError::EmptyDatabase.into());
        }
        debug!(num_records, database_size, "building linkage circuit");
        self.num_records = num_records;
        self.database_size = database_size;
        self.is_built = true;
        Ok(())
    }

    /// Runs the engine's precomputation phase.
    pub fn run_setup(&mut self) -> Result<(), Error> {
        if self.needs_reset {
            return Err(Error::ResetRequired);
        }
        if !self.is_built {
            return Err(Error::NotBuilt);
        }
        self.backend.run_setup()?;
        self.is_setup = true;
        Ok(())
    }

    /// Sets the client side of the request. Builds the circuit implicitly
    /// (with a warning) if that has not happened yet.
    pub fn set_client_input(&mut self, input: ClientInput) -> Result<(), Error> {
        if self.needs_reset {
            return Err(Error::ResetRequired);
        }
        if !self.is_built {
            warn!(
                num_records = input.records.len(),
                database_size = input.database_size,
                "circuit was not built explicitly, building it now"
            );
            self.build(input.records.len(), input.database_size)?;
        }
        if input.records.len() != self.num_records {
            return Err(InputError::RecordCountMismatch {
                expected: self.num_records,
                actual: input.records.len(),
            }
            .into());
        }
        if input.database_size != self.database_size {
            return Err(InputError::DatabaseSizeMismatch {
                expected: self.database_size,
                actual: input.database_size,
            }
            .into());
        }
        for record in &input.records {
            if record.num_fields() != self.cfg.num_fields() {
                return Err(InputError::FieldCountMismatch {
                    expected: self.cfg.num_fields(),
                    actual: record.num_fields(),
                }
                .into());
            }
        }
        self.client = Some(input);
        Ok(())
    }

    /// Sets the server side of the request. Builds the circuit implicitly
    /// (with a warning) if that has not happened yet.
    pub fn set_server_input(&mut self, input: ServerInput) -> Result<(), Error> {
        if self.needs_reset {
            return Err(Error::ResetRequired);
        }
        if !self.is_built {
            warn!(
                num_records = input.num_records,
                database_size = input.database.size(),
                "circuit was not built explicitly, building it now"
            );
            self.build(input.num_records, input.database.size())?;
        }
        if input.num_records != self.num_records {
            return Err(InputError::RecordCountMismatch {
                expected: self.num_records,
                actual: input.num_records,
            }
            .into());
        }
        if input.database.size() != self.database_size {
            return Err(InputError::DatabaseSizeMismatch {
                expected: self.database_size,
                actual: input.database.size(),
            }
            .into());
        }
        if input.database.num_fields() != self.cfg.num_fields() {
            return Err(InputError::FieldCountMismatch {
                expected: self.cfg.num_fields(),
                actual: input.database.num_fields(),
            }
            .into());
        }
        self.server = Some(input);
        Ok(())
    }

    /// Sets both sides at once. Only meaningful with a backend that plays
    /// both roles in one process, e.g. [`crate::mock::MockBackend`].
    pub fn set_both_inputs(
        &mut self,
        client: ClientInput,
        server: ServerInput,
    ) -> Result<(), Error> {
        self.set_client_input(client)?;
        self.set_server_input(server)
    }

    /// Links every query record against the database and reveals one result
    /// per record. Returns `None` if this party is not a designated
    /// recipient of the results.
    pub fn run_linkage(&mut self) -> Result<Option<Vec<LinkageResult>>, Error> {
        self.ensure_ready()?;
        let outcome = self.run_linkage_records();
        // Successful or not, the request is spent.
        self.is_setup = false;
        self.needs_reset = true;
        outcome
    }

    /// Counts how many database records clear each threshold, summed over
    /// all query records; reveals only the totals. Returns `None` if this
    /// party is not a designated recipient.
    pub fn run_count(&mut self) -> Result<Option<CountResult>, Error> {
        self.ensure_ready()?;
        let outcome = self.run_count_records();
        self.is_setup = false;
        self.needs_reset = true;
        outcome
    }

    /// Tears down all request-scoped state: graph, input shares, revealed
    /// outputs and the cleartext inputs held by this linker. Required
    /// between independent requests.
    pub fn reset(&mut self) {
        self.backend.reset();
        self.client = None;
        self.server = None;
        self.is_built = false;
        self.is_setup = false;
        self.needs_reset = false;
    }

    fn ensure_ready(&mut self) -> Result<(), Error> {
        if self.needs_reset {
            return Err(Error::ResetRequired);
        }
        if self.client.is_none() && self.server.is_none() {
            return Err(Error::MissingInput);
        }
        if !self.is_setup {
            warn!("setup phase was not run explicitly, running it now");
            self.run_setup()?;
        }
        Ok(())
    }

    fn run_linkage_records(&mut self) -> Result<Option<Vec<LinkageResult>>, Error> {
        let mut results = Vec::with_capacity(self.num_records);
        for r in 0..self.num_records {
            if r > 0 {
                // Each query record is one graph execution; the engine
                // needs fresh graph state and setup in between.
                self.backend.reset();
                self.backend.run_setup()?;
            }
            match self.run_one_linkage(r)? {
                Some(result) => results.push(result),
                None => return Ok(None),
            }
        }
        Ok(Some(results))
    }

    fn run_one_linkage(&mut self, record: usize) -> Result<Option<LinkageResult>, Error> {
        let client_record = self.client.as_ref().map(|c| &c.records[record]);
        let server_db = self.server.as_ref().map(|s| &s.database);
        let mut circuit = LinkageCircuit::new(&self.cfg, &mut self.backend, self.database_size);
        circuit.set_inputs(client_record, server_db);
        let outputs = circuit.build_linkage(self.reveal_to);
        self.backend.execute()?;

        let Some(index) = self.backend.clear_output(outputs.index) else {
            return Ok(None);
        };
        let Some(matched) = self.backend.clear_output(outputs.matched) else {
            return Ok(None);
        };
        let Some(tentative) = self.backend.clear_output(outputs.tentative) else {
            return Ok(None);
        };
        #[cfg(debug_assertions)]
        let score = {
            let Some(num) = self.backend.clear_output(outputs.score.0) else {
                return Ok(None);
            };
            let Some(den) = self.backend.clear_output(outputs.score.1) else {
                return Ok(None);
            };
            // Shift the denominator onto the numerator's scale, which
            // carries the dice precision.
            (num[0], den[0] << self.cfg.dice_precision())
        };
        Ok(Some(LinkageResult {
            index: index[0],
            matched: matched[0] != 0,
            tentative: tentative[0] != 0,
            #[cfg(debug_assertions)]
            score,
        }))
    }

    fn run_count_records(&mut self) -> Result<Option<CountResult>, Error> {
        let mut totals = CountResult::default();
        for r in 0..self.num_records {
            if r > 0 {
                self.backend.reset();
                self.backend.run_setup()?;
            }
            let client_record = self.client.as_ref().map(|c| &c.records[r]);
            let server_db = self.server.as_ref().map(|s| &s.database);
            let mut circuit = LinkageCircuit::new(&self.cfg, &mut self.backend, self.database_size);
            circuit.set_inputs(client_record, server_db);
            let outputs = circuit.build_count(self.reveal_to);
            self.backend.execute()?;

            let Some(matches) = self.backend.clear_output(outputs.matches) else {
                return Ok(None);
            };
            let Some(tentative) = self.backend.clear_output(outputs.tentative_matches) else {
                return Ok(None);
            };
            totals.matches += matches[0];
            totals.tentative_matches += tentative[0];
        }
        Ok(Some(totals))
    }
}
