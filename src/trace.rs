use ndarray::{Array1, ArrayView1};
use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};

/// One traced execution of the target: the input block, the leakage samples recorded while the
/// instruction pointer was in the traced range, and the output block.
///
/// Leakage is stored as an `Array1<f64>`, one sample per recorded memory access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Input block, big-endian
    input: Vec<u8>,
    /// Leakage waveform
    samples: Array1<f64>,
    /// Output block as parsed from the target
    output: u128,
}

impl Trace {
    pub fn new<T: AsPrimitive<f64>>(input: Vec<u8>, samples: &[T], output: u128) -> Self {
        Self {
            input,
            samples: samples.iter().map(|x| x.as_()).collect(),
            output,
        }
    }

    pub fn from_array(input: Vec<u8>, samples: Array1<f64>, output: u128) -> Self {
        Self {
            input,
            samples,
            output,
        }
    }

    pub fn input(&self) -> &[u8] {
        &self.input
    }

    pub fn samples(&self) -> ArrayView1<f64> {
        self.samples.view()
    }

    pub fn output(&self) -> u128 {
        self.output
    }

    /// Returns the number of points in the leakage waveform.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
