//! The share-operation interface the linkage circuit is built against.
//!
//! A [`ShareBackend`] wraps a concrete secure-computation engine: it hands
//! out opaque handles to secret-shared values in a boolean and an arithmetic
//! domain, records the operations applied to them as an oblivious graph, and
//! executes that graph in one blocking protocol exchange with the peer. The
//! circuit in this crate never inspects or branches on a handle's content;
//! everything secret stays behind this trait.

use serde::{Deserialize, Serialize};

use crate::input::Bitmask;

/// The two parties of the linkage protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Holds the query records.
    Client,
    /// Holds the candidate database.
    Server,
}

/// Which party (or parties) a revealed output is disclosed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevealTo {
    /// Only the client learns the cleartext.
    Client,
    /// Only the server learns the cleartext.
    Server,
    /// Both parties learn the cleartext.
    Both,
}

impl RevealTo {
    /// Whether the given role is a designated recipient.
    pub fn includes(self, role: Role) -> bool {
        match self {
            RevealTo::Client => role == Role::Client,
            RevealTo::Server => role == Role::Server,
            RevealTo::Both => true,
        }
    }
}

/// Handle to a revealed circuit output, readable once
/// [`ShareBackend::execute`] has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputId(usize);

impl OutputId {
    /// Wraps a backend-assigned output slot.
    pub fn new(slot: usize) -> Self {
        Self(slot)
    }

    /// The backend-assigned output slot.
    pub fn slot(self) -> usize {
        self.0
    }
}

/// An error surfaced by the share backend. Unrecoverable for the current
/// request; the caller must reset before starting another one.
#[derive(Debug)]
pub struct Error {
    /// The protocol phase during which the error occurred.
    pub phase: String,
    /// The specific failure.
    pub reason: ErrorKind,
}

/// The specific failure a backend ran into.
#[derive(Debug)]
pub enum ErrorKind {
    /// The connection to the peer could not be established.
    Connection(String),
    /// The peer disconnected mid-protocol.
    PeerDisconnected,
    /// A cryptographic protocol step failed.
    Protocol(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            ErrorKind::Connection(e) => write!(f, "connection failed during {}: {e}", self.phase),
            ErrorKind::PeerDisconnected => write!(f, "peer disconnected during {}", self.phase),
            ErrorKind::Protocol(e) => write!(f, "protocol failure during {}: {e}", self.phase),
        }
    }
}

impl std::error::Error for Error {}

/// Share operations of a two-party secure-computation engine.
///
/// Handles come in two domains: `Bool` values are bit vectors of a stated
/// width, `Arith` values live in the ring `2^word_size`. All handles carry a
/// batch dimension: one lane per candidate record, processed in a single
/// vectorized protocol pass. Graph construction is plain bookkeeping and
/// must not fail; all protocol work happens in [`execute`].
///
/// [`execute`]: ShareBackend::execute
pub trait ShareBackend {
    /// Handle to a boolean-domain share.
    type Bool: Clone;
    /// Handle to an arithmetic-domain share.
    type Arith: Clone;

    /// A public constant, replicated across all lanes.
    fn bool_constant(&mut self, value: u64, bits: u16, batch: usize) -> Self::Bool;
    /// A public constant with an individual value per lane.
    fn bool_constant_lanes(&mut self, lanes: &[u64], bits: u16) -> Self::Bool;
    /// A public arithmetic constant, replicated across all lanes.
    fn arith_constant(&mut self, value: u64, batch: usize) -> Self::Arith;

    /// A boolean input share fed by `owner`, one bit vector per lane.
    fn bool_input(&mut self, owner: Role, bits: u16, lanes: &[Bitmask]) -> Self::Bool;
    /// An arithmetic input share fed by `owner`, one value per lane.
    fn arith_input(&mut self, owner: Role, lanes: &[u64]) -> Self::Arith;
    /// A placeholder for the other party's boolean input of the same shape.
    fn bool_dummy(&mut self, owner: Role, bits: u16, batch: usize) -> Self::Bool;
    /// A placeholder for the other party's arithmetic input.
    fn arith_dummy(&mut self, owner: Role, batch: usize) -> Self::Arith;

    /// Lane-wise addition in the arithmetic ring.
    fn add(&mut self, x: &Self::Arith, y: &Self::Arith) -> Self::Arith;
    /// Lane-wise subtraction in the arithmetic ring.
    fn sub(&mut self, x: &Self::Arith, y: &Self::Arith) -> Self::Arith;
    /// Lane-wise multiplication in the arithmetic ring.
    fn mul(&mut self, x: &Self::Arith, y: &Self::Arith) -> Self::Arith;
    /// Lane-wise multiplication by a public constant (free of protocol
    /// interaction in additive sharings).
    fn mul_constant(&mut self, x: &Self::Arith, c: u64) -> Self::Arith;

    /// Lane-wise bitwise AND of two equally wide boolean shares.
    fn and(&mut self, x: &Self::Bool, y: &Self::Bool) -> Self::Bool;
    /// Lane-wise left shift by a public amount, widening the share.
    fn shift_left(&mut self, x: &Self::Bool, amount: u16) -> Self::Bool;
    /// Lane-wise unsigned addition of boolean shares.
    fn bool_add(&mut self, x: &Self::Bool, y: &Self::Bool) -> Self::Bool;
    /// Lane-wise equality, producing a single-bit share.
    fn eq(&mut self, x: &Self::Bool, y: &Self::Bool) -> Self::Bool;
    /// Lane-wise unsigned `x > y`, producing a single-bit share.
    fn gt(&mut self, x: &Self::Bool, y: &Self::Bool) -> Self::Bool;
    /// Lane-wise population count.
    fn popcount(&mut self, x: &Self::Bool) -> Self::Bool;
    /// Lane-wise fixed-point integer division at
    /// [`DIV_WIDTH`](crate::config::DIV_WIDTH) bits. The dividend carries
    /// the fractional scale; behavior on a zero divisor is
    /// backend-defined (any such result is discarded by a zero weight).
    fn fixed_div(&mut self, num: &Self::Bool, den: &Self::Bool) -> Self::Bool;

    /// Converts an arithmetic share to the boolean domain at full word size.
    fn to_bool(&mut self, x: &Self::Arith) -> Self::Bool;
    /// Converts a boolean share to the arithmetic domain.
    fn to_arith(&mut self, x: &Self::Bool) -> Self::Arith;

    /// Reduces a batch of quotients to the maximal one, comparing lanes by
    /// the cross products `n_i·d_j ≥ n_j·d_i` and carrying `idx` along in
    /// lock-step. Returns single-lane `(num, den, idx)` shares. Which lane
    /// wins an exact tie is backend-defined.
    fn argmax_quotient(
        &mut self,
        num: &Self::Arith,
        den: &Self::Arith,
        idx: &Self::Bool,
    ) -> (Self::Arith, Self::Arith, Self::Bool);
    /// Sums all lanes of an arithmetic share into a single-lane share.
    fn sum_lanes(&mut self, x: &Self::Arith) -> Self::Arith;

    /// Registers a boolean share for disclosure to the given recipients.
    fn reveal_bool(&mut self, x: &Self::Bool, to: RevealTo) -> OutputId;
    /// Registers an arithmetic share for disclosure to the given recipients.
    fn reveal_arith(&mut self, x: &Self::Arith, to: RevealTo) -> OutputId;

    /// Runs the engine's precomputation phase. Expensive, amortizable, and
    /// required before inputs take part in an execution.
    fn run_setup(&mut self) -> Result<(), Error>;
    /// Executes the constructed graph, blocking until all registered
    /// outputs are revealed.
    fn execute(&mut self) -> Result<(), Error>;
    /// Cleartext lanes of a revealed output. `None` before [`execute`] has
    /// run or when this party is not a designated recipient.
    ///
    /// [`execute`]: ShareBackend::execute
    fn clear_output(&self, id: OutputId) -> Option<Vec<u64>>;
    /// Discards all graph state, input shares and revealed outputs.
    fn reset(&mut self);
}
