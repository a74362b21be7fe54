//! Leakage models predicting the value manipulated by the target for every key hypothesis.
use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::{Error, corpus::Corpus, trace::Trace};

pub mod sm4;

/// Number of hypotheses for one key byte.
pub const NUM_HYPOTHESES: usize = 256;

/// Hamming weight of a value.
pub fn hw(value: u32) -> u32 {
    value.count_ones()
}

/// Hamming distance between two values.
pub fn hd(a: u32, b: u32) -> u32 {
    hw(a ^ b)
}

/// Intermediate value of the first attacked round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Position {
    /// S-box output, 8 bits.
    AfterSubstitution,
    /// Output of the linear transform applied to one S-box output, i.e. a T-table entry.
    AfterLinearTransform,
    /// Output of a caller-provided 8→32 bits lookup table.
    TableLookup,
}

impl Position {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AfterSubstitution => "after-substitution",
            Self::AfterLinearTransform => "after-linear-transform",
            Self::TableLookup => "table-lookup",
        }
    }
}

impl FromStr for Position {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "after-substitution" | "LUT/SM4_AFTER_SBOX" | "LUT/SM4_WHITEBOX_SBOX" => {
                Ok(Self::AfterSubstitution)
            }
            "after-linear-transform" | "LUT/SM4_WHITEBOX_T_OUTPUT" => {
                Ok(Self::AfterLinearTransform)
            }
            "table-lookup" | "LUT/SM4_WHITEBOX_LUT" => Ok(Self::TableLookup),
            _ => Err(Error::config(format!("unknown attack position {s:?}"))),
        }
    }
}

impl TryFrom<String> for Position {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Position> for String {
    fn from(value: Position) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an intermediate value maps to a predicted leakage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LeakageModel {
    #[default]
    HammingWeight,
    /// Hamming distance to the state word overwritten by the round output.
    HammingDistance,
    /// Single bit of the intermediate value.
    Bit(u8),
}

impl LeakageModel {
    fn apply(&self, value: u32, previous: u32) -> f64 {
        match *self {
            Self::HammingWeight => hw(value) as f64,
            Self::HammingDistance => hd(value, previous) as f64,
            Self::Bit(bit) => ((value >> bit) & 1) as f64,
        }
    }
}

impl FromStr for LeakageModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hw" => Ok(Self::HammingWeight),
            "hd" => Ok(Self::HammingDistance),
            _ => match s.strip_prefix("bit").map(str::parse::<u8>) {
                Some(Ok(bit)) if bit < 8 => Ok(Self::Bit(bit)),
                _ => Err(Error::config(format!("unknown leakage model {s:?}"))),
            },
        }
    }
}

impl TryFrom<String> for LeakageModel {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LeakageModel> for String {
    fn from(value: LeakageModel) -> Self {
        match value {
            LeakageModel::HammingWeight => "hw".to_string(),
            LeakageModel::HammingDistance => "hd".to_string(),
            LeakageModel::Bit(bit) => format!("bit{bit}"),
        }
    }
}

/// A 256-entry lookup table, possibly embedding key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct LookupTable(Box<[u32; 256]>);

impl LookupTable {
    pub fn new(entries: [u32; 256]) -> Self {
        Self(Box::new(entries))
    }

    pub fn get(&self, index: u8) -> u32 {
        self.0[index as usize]
    }

    /// Whether all entries fit in a byte.
    pub fn is_byte_wide(&self) -> bool {
        self.0.iter().all(|&entry| entry <= 0xff)
    }
}

impl Default for LookupTable {
    /// The SM4 S-box.
    fn default() -> Self {
        Self::new(sm4::sbox_table())
    }
}

impl TryFrom<Vec<u32>> for LookupTable {
    type Error = Error;

    fn try_from(value: Vec<u32>) -> Result<Self, Self::Error> {
        let len = value.len();
        let entries: Box<[u32; 256]> = value
            .into_boxed_slice()
            .try_into()
            .map_err(|_| Error::config(format!("lookup table has {len} entries, 256 expected")))?;

        Ok(Self(entries))
    }
}

impl From<LookupTable> for Vec<u32> {
    fn from(value: LookupTable) -> Self {
        value.0.to_vec()
    }
}

/// One key byte sub-attack: everything needed to predict the leakage of a trace.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub position: Position,
    pub model: LeakageModel,
    pub round: usize,
    /// Byte index in the round key word, 0 is the most significant byte.
    pub byte: u8,
    /// Round keys of the rounds preceding `round`.
    pub known_round_keys: &'a [u32],
    pub table: &'a LookupTable,
}

impl Target<'_> {
    /// State words `(X_r, X_r+1, X_r+2, X_r+3)` entering the attacked round.
    ///
    /// # Panics
    /// Panics if `input` is shorter than an SM4 block or if fewer than `round` round keys are
    /// known.
    pub fn state(&self, input: &[u8]) -> [u32; 4] {
        self.known_round_keys[..self.round]
            .iter()
            .fold(sm4::words(input), |state, &rk| sm4::round(state, rk))
    }

    fn shift(&self) -> u32 {
        24 - 8 * self.byte as u32
    }

    /// Predicted leakage for `hypothesis` given the round state.
    fn predict_state(&self, state: &[u32; 4], hypothesis: u8) -> f64 {
        let shift = self.shift();
        let byte_of = |word: u32| (word >> shift) as u8;
        let index = byte_of(state[1] ^ state[2] ^ state[3]) ^ hypothesis;

        let (value, previous) = match self.position {
            Position::AfterSubstitution => (sm4::sbox(index) as u32, byte_of(state[0]) as u32),
            Position::AfterLinearTransform => {
                (sm4::l((sm4::sbox(index) as u32) << shift), state[0])
            }
            Position::TableLookup if self.table.is_byte_wide() => {
                (self.table.get(index), byte_of(state[0]) as u32)
            }
            Position::TableLookup => (self.table.get(index), state[0]),
        };

        self.model.apply(value, previous)
    }

    /// Predicted leakage of `trace` under `hypothesis`.
    pub fn predict(&self, hypothesis: u8, trace: &Trace) -> f64 {
        self.predict_state(&self.state(trace.input()), hypothesis)
    }

    /// Prediction vectors of every hypothesis for every trace of the corpus.
    pub fn predictions(&self, corpus: &Corpus) -> Predictions {
        let mut values = Array2::zeros((corpus.len(), NUM_HYPOTHESES));
        for (mut row, input) in values.rows_mut().into_iter().zip(corpus.inputs()) {
            let state = self.state(input);
            for (hypothesis, value) in row.iter_mut().enumerate() {
                *value = self.predict_state(&state, hypothesis as u8);
            }
        }

        Predictions { values }
    }
}

/// Predicted leakages, one row per trace and one column per hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct Predictions {
    values: Array2<f64>,
}

impl Predictions {
    pub fn from_array(values: Array2<f64>) -> Self {
        Self { values }
    }

    /// Prediction vector of a hypothesis.
    pub fn vector(&self, hypothesis: usize) -> ArrayView1<f64> {
        self.values.column(hypothesis)
    }

    pub fn view(&self) -> ArrayView2<f64> {
        self.values.view()
    }

    pub fn num_traces(&self) -> usize {
        self.values.nrows()
    }

    pub fn num_hypotheses(&self) -> usize {
        self.values.ncols()
    }
}

#[cfg(test)]
mod tests {
    use super::{LeakageModel, LookupTable, NUM_HYPOTHESES, Position, Target, hw, sm4};
    use crate::{
        corpus::{AlignmentPolicy, Corpus},
        trace::Trace,
    };

    const INPUT: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ];

    fn target(position: Position, model: LeakageModel, byte: u8) -> Target<'static> {
        static TABLE: std::sync::OnceLock<LookupTable> = std::sync::OnceLock::new();
        Target {
            position,
            model,
            round: 0,
            byte,
            known_round_keys: &[],
            table: TABLE.get_or_init(LookupTable::default),
        }
    }

    #[test]
    fn test_parse_position() {
        assert_eq!("after-substitution".parse::<Position>().unwrap(), Position::AfterSubstitution);
        assert_eq!("LUT/SM4_WHITEBOX_SBOX".parse::<Position>().unwrap(), Position::AfterSubstitution);
        assert_eq!(
            "LUT/SM4_WHITEBOX_T_OUTPUT".parse::<Position>().unwrap(),
            Position::AfterLinearTransform
        );
        assert_eq!("LUT/SM4_WHITEBOX_LUT".parse::<Position>().unwrap(), Position::TableLookup);
        assert!("LUT/AES_AFTER_SBOX".parse::<Position>().is_err());
    }

    #[test]
    fn test_parse_model() {
        assert_eq!("hw".parse::<LeakageModel>().unwrap(), LeakageModel::HammingWeight);
        assert_eq!("bit7".parse::<LeakageModel>().unwrap(), LeakageModel::Bit(7));
        assert!("bit8".parse::<LeakageModel>().is_err());
        assert!("rank".parse::<LeakageModel>().is_err());
    }

    #[test]
    fn test_lookup_table_length() {
        assert!(LookupTable::try_from(vec![0u32; 255]).is_err());
        let table = LookupTable::try_from((0..256).collect::<Vec<u32>>()).unwrap();
        assert_eq!(table.get(0x42), 0x42);
        assert!(table.is_byte_wide());
    }

    #[test]
    fn test_sbox_prediction() {
        let trace = Trace::new(INPUT.to_vec(), &[0u8], 0);
        // byte 1 of X1 ^ X2 ^ X3 = 0x55 ^ 0x99 ^ 0xdd = 0x11
        let target = target(Position::AfterSubstitution, LeakageModel::HammingWeight, 1);
        assert_eq!(
            target.predict(0x2a, &trace),
            hw(sm4::sbox(0x11 ^ 0x2a) as u32) as f64
        );

        let target = Target {
            model: LeakageModel::HammingDistance,
            ..target
        };
        assert_eq!(
            target.predict(0x2a, &trace),
            hw((sm4::sbox(0x11 ^ 0x2a) ^ 0x11) as u32) as f64
        );

        let target = Target {
            model: LeakageModel::Bit(0),
            ..target
        };
        assert_eq!(
            target.predict(0x2a, &trace),
            (sm4::sbox(0x11 ^ 0x2a) & 1) as f64
        );
    }

    #[test]
    fn test_linear_transform_prediction() {
        let trace = Trace::new(INPUT.to_vec(), &[0u8], 0);
        let target = target(Position::AfterLinearTransform, LeakageModel::HammingWeight, 0);
        // byte 0 of X1 ^ X2 ^ X3 = 0x44 ^ 0x88 ^ 0xcc = 0x00
        let expected = hw(sm4::l((sm4::sbox(0x07) as u32) << 24)) as f64;
        assert_eq!(target.predict(0x07, &trace), expected);
    }

    #[test]
    fn test_predict_deterministic() {
        let trace = Trace::new(INPUT.to_vec(), &[0u8], 0);
        for position in [
            Position::AfterSubstitution,
            Position::AfterLinearTransform,
            Position::TableLookup,
        ] {
            let target = target(position, LeakageModel::HammingDistance, 3);
            for hypothesis in 0..=255 {
                let a = target.predict(hypothesis, &trace);
                let b = target.predict(hypothesis, &trace);
                assert_eq!(a.to_bits(), b.to_bits());
            }
        }
    }

    #[test]
    fn test_later_round_state() {
        let round_keys = sm4::expand_key(&[7; 16]);
        let table = LookupTable::default();
        let target = Target {
            position: Position::AfterSubstitution,
            model: LeakageModel::HammingWeight,
            round: 2,
            byte: 0,
            known_round_keys: &round_keys[..2],
            table: &table,
        };
        let expected = sm4::round(sm4::round(sm4::words(&INPUT), round_keys[0]), round_keys[1]);
        assert_eq!(target.state(&INPUT), expected);
    }

    #[test]
    fn test_predictions_matrix() {
        let corpus = Corpus::from_traces(
            16,
            AlignmentPolicy::Reject,
            [
                Trace::new(INPUT.to_vec(), &[0u8], 0),
                Trace::new([0xab; 16].to_vec(), &[0u8], 0),
            ],
        )
        .unwrap();
        let target = target(Position::TableLookup, LeakageModel::HammingWeight, 2);
        let predictions = target.predictions(&corpus);
        assert_eq!(predictions.num_traces(), 2);
        assert_eq!(predictions.num_hypotheses(), NUM_HYPOTHESES);
        for hypothesis in 0..NUM_HYPOTHESES {
            for (i, trace) in corpus.traces().iter().enumerate() {
                assert_eq!(
                    predictions.vector(hypothesis)[i],
                    target.predict(hypothesis as u8, trace)
                );
            }
        }
    }
}
