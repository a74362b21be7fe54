//! Append-only store of traced executions.
use ndarray::{Array1, Array2, s};
use serde::{Deserialize, Serialize};

use crate::{Error, trace::Trace};

/// What to do with a trace whose sample count differs from the corpus one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlignmentPolicy {
    /// Refuse the trace.
    #[default]
    Reject,
    /// Keep the common prefix of all traces.
    Truncate,
    /// Zero-pad shorter traces; longer traces are refused.
    Pad,
}

/// An ordered set of [`Trace`]s sharing the same block size and sample count.
///
/// Traces are never modified once pushed. With [`AlignmentPolicy::Truncate`] the stored traces
/// keep their full length and only the first [`Corpus::num_samples`] samples are exposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Corpus {
    block_size: usize,
    policy: AlignmentPolicy,
    num_samples: Option<usize>,
    traces: Vec<Trace>,
}

impl Corpus {
    pub fn new(block_size: usize, policy: AlignmentPolicy) -> Self {
        Self {
            block_size,
            policy,
            num_samples: None,
            traces: Vec::new(),
        }
    }

    /// Builds a corpus from an iterator of traces, stopping at the first rejected one.
    pub fn from_traces<I>(block_size: usize, policy: AlignmentPolicy, traces: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = Trace>,
    {
        let mut corpus = Self::new(block_size, policy);
        for trace in traces {
            corpus.push(trace)?;
        }

        Ok(corpus)
    }

    /// Appends a trace.
    pub fn push(&mut self, trace: Trace) -> Result<(), Error> {
        if trace.input().len() != self.block_size {
            return Err(Error::BlockSizeMismatch {
                expected: self.block_size,
                found: trace.input().len(),
            });
        }

        let Some(expected) = self.num_samples else {
            self.num_samples = Some(trace.len());
            self.traces.push(trace);
            return Ok(());
        };

        let found = trace.len();
        let trace = match self.policy {
            _ if found == expected => trace,
            AlignmentPolicy::Reject => {
                return Err(Error::SampleLengthMismatch { expected, found });
            }
            AlignmentPolicy::Truncate => {
                self.num_samples = Some(expected.min(found));
                trace
            }
            AlignmentPolicy::Pad if found < expected => {
                let mut samples = Array1::zeros(expected);
                samples.slice_mut(s![..found]).assign(&trace.samples());
                Trace::from_array(trace.input().to_vec(), samples, trace.output())
            }
            AlignmentPolicy::Pad => {
                return Err(Error::SampleLengthMismatch { expected, found });
            }
        };
        self.traces.push(trace);

        Ok(())
    }

    /// Returns a copy of the corpus without the trace at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn without(&self, index: usize) -> Self {
        assert!(index < self.len());

        let mut corpus = self.clone();
        corpus.traces.remove(index);
        if corpus.traces.is_empty() {
            corpus.num_samples = None;
        }

        corpus
    }

    /// Leakage matrix, one row per trace.
    pub fn leakages(&self) -> Array2<f64> {
        let num_samples = self.num_samples();
        let mut leakages = Array2::zeros((self.len(), num_samples));
        for (mut row, trace) in leakages.rows_mut().into_iter().zip(&self.traces) {
            row.assign(&trace.samples().slice(s![..num_samples]));
        }

        leakages
    }

    /// Input blocks, in trace order.
    pub fn inputs(&self) -> impl Iterator<Item = &[u8]> {
        self.traces.iter().map(|trace| trace.input())
    }

    pub fn traces(&self) -> &[Trace] {
        &self.traces
    }

    pub fn get(&self, index: usize) -> Option<&Trace> {
        self.traces.get(index)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn policy(&self) -> AlignmentPolicy {
        self.policy
    }

    /// Number of samples per trace, 0 for an empty corpus.
    pub fn num_samples(&self) -> usize {
        self.num_samples.unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }
}
