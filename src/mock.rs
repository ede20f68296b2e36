//! An in-process [`ShareBackend`] that evaluates the share graph over
//! cleartext lanes.
//!
//! This is the single-process debug configuration: one `MockBackend` plays
//! both roles and holds both parties' inputs, so the circuit can be driven
//! and verified against a cleartext oracle without a network peer. It is
//! selected purely by constructing it — the circuit code is identical to a
//! run against a real engine. [`MockBackend::with_role`] restricts reveals
//! to one role, which makes output targeting observable in tests.

use crate::{
    backend::{Error, OutputId, RevealTo, Role, ShareBackend},
    config::DIV_WIDTH,
    input::{bitbytes, popcount, Bitmask},
};

#[derive(Debug, Clone)]
struct BoolNode {
    bits: u16,
    lanes: Vec<Bitmask>,
}

#[derive(Debug, Clone)]
struct ArithNode {
    lanes: Vec<u64>,
}

#[derive(Debug, Clone)]
enum Output {
    Bool(MockBool, RevealTo),
    Arith(MockArith, RevealTo),
}

/// Handle to a boolean-domain node of the mock graph.
#[derive(Debug, Clone, Copy)]
pub struct MockBool(usize);

/// Handle to an arithmetic-domain node of the mock graph.
#[derive(Debug, Clone, Copy)]
pub struct MockArith(usize);

/// Cleartext stand-in for a secure-computation engine.
#[derive(Debug)]
pub struct MockBackend {
    word_size: u16,
    role: Option<Role>,
    bools: Vec<BoolNode>,
    ariths: Vec<ArithNode>,
    outputs: Vec<Output>,
    executed: bool,
}

impl MockBackend {
    /// A backend playing both roles: every reveal is visible.
    pub fn new(word_size: u16) -> Self {
        Self {
            word_size,
            role: None,
            bools: Vec::new(),
            ariths: Vec::new(),
            outputs: Vec::new(),
            executed: false,
        }
    }

    /// A backend restricted to one role: reveals targeted at the other
    /// party return no cleartext.
    pub fn with_role(word_size: u16, role: Role) -> Self {
        Self {
            role: Some(role),
            ..Self::new(word_size)
        }
    }

    fn mask(&self, value: u64) -> u64 {
        if self.word_size >= 64 {
            value
        } else {
            value & ((1u64 << self.word_size) - 1)
        }
    }

    fn push_bool(&mut self, bits: u16, lanes: Vec<Bitmask>) -> MockBool {
        self.bools.push(BoolNode { bits, lanes });
        MockBool(self.bools.len() - 1)
    }

    fn push_arith(&mut self, lanes: Vec<u64>) -> MockArith {
        self.ariths.push(ArithNode { lanes });
        MockArith(self.ariths.len() - 1)
    }

    fn bool_node(&self, x: MockBool) -> &BoolNode {
        &self.bools[x.0]
    }

    fn arith_node(&self, x: MockArith) -> &ArithNode {
        &self.ariths[x.0]
    }

    /// Lane-wise map of two boolean nodes into integer values.
    fn bool_zip(&mut self, x: MockBool, y: MockBool, bits: u16, f: impl Fn(u128, u128) -> u128) -> MockBool {
        let (x, y) = (self.bool_node(x), self.bool_node(y));
        debug_assert_eq!(x.lanes.len(), y.lanes.len());
        let lanes = x
            .lanes
            .iter()
            .zip(&y.lanes)
            .map(|(a, b)| encode(f(decode(a), decode(b)), bits))
            .collect();
        self.push_bool(bits, lanes)
    }
}

/// Little-endian bytes to integer; mock boolean values wider than 128 bits
/// only ever flow through [`ShareBackend::and`] and [`ShareBackend::eq`],
/// which work on raw bytes.
fn decode(bytes: &[u8]) -> u128 {
    debug_assert!(bytes.len() <= 16);
    let mut le = [0u8; 16];
    le[..bytes.len()].copy_from_slice(bytes);
    u128::from_le_bytes(le)
}

fn encode(value: u128, bits: u16) -> Bitmask {
    let bytes = bitbytes(bits);
    debug_assert!(bytes <= 16);
    value.to_le_bytes()[..bytes].to_vec()
}

impl ShareBackend for MockBackend {
    type Bool = MockBool;
    type Arith = MockArith;

    fn bool_constant(&mut self, value: u64, bits: u16, batch: usize) -> MockBool {
        let lanes = vec![encode(value as u128, bits); batch];
        self.push_bool(bits, lanes)
    }

    fn bool_constant_lanes(&mut self, lanes: &[u64], bits: u16) -> MockBool {
        let lanes = lanes.iter().map(|&v| encode(v as u128, bits)).collect();
        self.push_bool(bits, lanes)
    }

    fn arith_constant(&mut self, value: u64, batch: usize) -> MockArith {
        let value = self.mask(value);
        self.push_arith(vec![value; batch])
    }

    fn bool_input(&mut self, _owner: Role, bits: u16, lanes: &[Bitmask]) -> MockBool {
        debug_assert!(lanes.iter().all(|l| l.len() == bitbytes(bits)));
        self.push_bool(bits, lanes.to_vec())
    }

    fn arith_input(&mut self, _owner: Role, lanes: &[u64]) -> MockArith {
        let lanes = lanes.iter().map(|&v| self.mask(v)).collect();
        self.push_arith(lanes)
    }

    fn bool_dummy(&mut self, _owner: Role, bits: u16, batch: usize) -> MockBool {
        self.push_bool(bits, vec![vec![0; bitbytes(bits)]; batch])
    }

    fn arith_dummy(&mut self, _owner: Role, batch: usize) -> MockArith {
        self.push_arith(vec![0; batch])
    }

    fn add(&mut self, x: &MockArith, y: &MockArith) -> MockArith {
        let (x, y) = (self.arith_node(*x), self.arith_node(*y));
        let lanes = x
            .lanes
            .iter()
            .zip(&y.lanes)
            .map(|(&a, &b)| a.wrapping_add(b))
            .collect::<Vec<_>>();
        let lanes = lanes.into_iter().map(|v| self.mask(v)).collect();
        self.push_arith(lanes)
    }

    fn sub(&mut self, x: &MockArith, y: &MockArith) -> MockArith {
        let (x, y) = (self.arith_node(*x), self.arith_node(*y));
        let lanes = x
            .lanes
            .iter()
            .zip(&y.lanes)
            .map(|(&a, &b)| a.wrapping_sub(b))
            .collect::<Vec<_>>();
        let lanes = lanes.into_iter().map(|v| self.mask(v)).collect();
        self.push_arith(lanes)
    }

    fn mul(&mut self, x: &MockArith, y: &MockArith) -> MockArith {
        let (x, y) = (self.arith_node(*x), self.arith_node(*y));
        let lanes = x
            .lanes
            .iter()
            .zip(&y.lanes)
            .map(|(&a, &b)| a.wrapping_mul(b))
            .collect::<Vec<_>>();
        let lanes = lanes.into_iter().map(|v| self.mask(v)).collect();
        self.push_arith(lanes)
    }

    fn mul_constant(&mut self, x: &MockArith, c: u64) -> MockArith {
        let lanes = self
            .arith_node(*x)
            .lanes
            .iter()
            .map(|&a| a.wrapping_mul(c))
            .collect::<Vec<_>>();
        let lanes = lanes.into_iter().map(|v| self.mask(v)).collect();
        self.push_arith(lanes)
    }

    fn and(&mut self, x: &MockBool, y: &MockBool) -> MockBool {
        let (x, y) = (self.bool_node(*x), self.bool_node(*y));
        debug_assert_eq!(x.bits, y.bits);
        let bits = x.bits;
        let lanes = x
            .lanes
            .iter()
            .zip(&y.lanes)
            .map(|(a, b)| a.iter().zip(b).map(|(&a, &b)| a & b).collect())
            .collect();
        self.push_bool(bits, lanes)
    }

    fn shift_left(&mut self, x: &MockBool, amount: u16) -> MockBool {
        let bits = self.bool_node(*x).bits + amount;
        debug_assert!(bits as usize <= 128);
        let lanes = self
            .bool_node(*x)
            .lanes
            .iter()
            .map(|l| encode(decode(l) << amount, bits))
            .collect();
        self.push_bool(bits, lanes)
    }

    fn bool_add(&mut self, x: &MockBool, y: &MockBool) -> MockBool {
        let bits = self.bool_node(*x).bits.max(self.bool_node(*y).bits) + 1;
        self.bool_zip(*x, *y, bits, |a, b| a + b)
    }

    fn eq(&mut self, x: &MockBool, y: &MockBool) -> MockBool {
        let (x, y) = (self.bool_node(*x), self.bool_node(*y));
        debug_assert_eq!(x.bits, y.bits);
        let lanes = x
            .lanes
            .iter()
            .zip(&y.lanes)
            .map(|(a, b)| vec![u8::from(a == b)])
            .collect();
        self.push_bool(1, lanes)
    }

    fn gt(&mut self, x: &MockBool, y: &MockBool) -> MockBool {
        self.bool_zip(*x, *y, 1, |a, b| u128::from(a > b))
    }

    fn popcount(&mut self, x: &MockBool) -> MockBool {
        let node = self.bool_node(*x);
        let bits = crate::config::hw_width(node.bits);
        let lanes = node
            .lanes
            .iter()
            .map(|l| encode(popcount(l) as u128, bits))
            .collect();
        self.push_bool(bits, lanes)
    }

    fn fixed_div(&mut self, num: &MockBool, den: &MockBool) -> MockBool {
        self.bool_zip(*num, *den, DIV_WIDTH, |n, d| if d == 0 { 0 } else { n / d })
    }

    fn to_bool(&mut self, x: &MockArith) -> MockBool {
        let bits = self.word_size;
        let lanes = self
            .arith_node(*x)
            .lanes
            .iter()
            .map(|&v| encode(v as u128, bits))
            .collect();
        self.push_bool(bits, lanes)
    }

    fn to_arith(&mut self, x: &MockBool) -> MockArith {
        let lanes = self
            .bool_node(*x)
            .lanes
            .iter()
            .map(|l| decode(l) as u64)
            .collect::<Vec<_>>();
        let lanes = lanes.into_iter().map(|v| self.mask(v)).collect();
        self.push_arith(lanes)
    }

    fn argmax_quotient(
        &mut self,
        num: &MockArith,
        den: &MockArith,
        idx: &MockBool,
    ) -> (MockArith, MockArith, MockBool) {
        let nums = &self.arith_node(*num).lanes;
        let dens = &self.arith_node(*den).lanes;
        debug_assert_eq!(nums.len(), dens.len());
        // Strict comparison: the first maximal lane wins ties.
        let mut best = 0;
        for i in 1..nums.len() {
            if nums[i] as u128 * dens[best] as u128 > nums[best] as u128 * dens[i] as u128 {
                best = i;
            }
        }
        let num_lane = nums[best];
        let den_lane = dens[best];
        let idx_node = self.bool_node(*idx);
        let (idx_bits, idx_lane) = (idx_node.bits, idx_node.lanes[best].clone());
        (
            self.push_arith(vec![num_lane]),
            self.push_arith(vec![den_lane]),
            self.push_bool(idx_bits, vec![idx_lane]),
        )
    }

    fn sum_lanes(&mut self, x: &MockArith) -> MockArith {
        let sum = self
            .arith_node(*x)
            .lanes
            .iter()
            .fold(0u64, |acc, &v| acc.wrapping_add(v));
        let sum = self.mask(sum);
        self.push_arith(vec![sum])
    }

    fn reveal_bool(&mut self, x: &MockBool, to: RevealTo) -> OutputId {
        self.outputs.push(Output::Bool(*x, to));
        OutputId::new(self.outputs.len() - 1)
    }

    fn reveal_arith(&mut self, x: &MockArith, to: RevealTo) -> OutputId {
        self.outputs.push(Output::Arith(*x, to));
        OutputId::new(self.outputs.len() - 1)
    }

    fn run_setup(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn execute(&mut self) -> Result<(), Error> {
        self.executed = true;
        Ok(())
    }

    fn clear_output(&self, id: OutputId) -> Option<Vec<u64>> {
        if !self.executed {
            return None;
        }
        let (to, lanes) = match &self.outputs[id.slot()] {
            Output::Bool(x, to) => (
                *to,
                self.bool_node(*x)
                    .lanes
                    .iter()
                    .map(|l| decode(l) as u64)
                    .collect(),
            ),
            Output::Arith(x, to) => (*to, self.arith_node(*x).lanes.clone()),
        };
        if let Some(role) = self.role {
            if !to.includes(role) {
                return None;
            }
        }
        Some(lanes)
    }

    fn reset(&mut self) {
        self.bools.clear();
        self.ariths.clear();
        self.outputs.clear();
        self.executed = false;
    }
}
