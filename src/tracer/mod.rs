//! Collection of execution traces from an instrumented target.
//!
//! The [`Tracer`] feeds random input blocks to an [`Instrumentation`] backend, keeps the memory
//! writes performed inside an [`AddressRange`] as leakage samples and gathers the executions in a
//! [`Corpus`].
use log::{debug, info, warn};
use rand::{RngCore, SeedableRng, rngs::StdRng};
use rayon::prelude::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

use crate::{
    Error,
    codec::parse_output,
    corpus::{AlignmentPolicy, Corpus},
    error::TraceFailure,
    trace::Trace,
    util::CancellationToken,
};

pub mod events;
pub mod process;

pub use events::{AccessKind, MemoryEvent};
pub use process::ProcessBackend;

/// Half-open range of instruction addresses `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddressRange {
    start: u64,
    end: u64,
}

impl AddressRange {
    pub fn new(start: u64, end: u64) -> Result<Self, Error> {
        if start >= end {
            return Err(Error::config(format!(
                "empty address range {start:#x}-{end:#x}"
            )));
        }

        Ok(Self { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.start..self.end).contains(&address)
    }
}

impl FromStr for AddressRange {
    type Err = Error;

    /// Parses `"0xSTART-0xEND"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_bound = |bound: &str| {
            let bound = bound.trim();
            let digits = bound
                .strip_prefix("0x")
                .or_else(|| bound.strip_prefix("0X"))
                .unwrap_or(bound);
            u64::from_str_radix(digits, 16)
                .map_err(|_| Error::config(format!("invalid address {bound:?} in range {s:?}")))
        };

        let Some((start, end)) = s.trim().split_once('-') else {
            return Err(Error::config(format!(
                "address range {s:?} is not of the form 0xSTART-0xEND"
            )));
        };

        Self::new(parse_bound(start)?, parse_bound(end)?)
    }
}

impl TryFrom<String> for AddressRange {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AddressRange> for String {
    fn from(value: AddressRange) -> Self {
        value.to_string()
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.start, self.end)
    }
}

/// What the instrumentation observed during one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Execution {
    pub stdout: String,
    pub events: Vec<MemoryEvent>,
}

/// Runs the target on one input block under instrumentation.
///
/// Per-execution problems are reported as [`Error::TraceFailure`] and only drop that sample; any
/// other error aborts the tracing run.
pub trait Instrumentation: Sync {
    fn execute(&self, sample: usize, input: &[u8], timeout: Duration) -> Result<Execution, Error>;
}

/// In-process instrumentation, e.g. a simulated target.
impl<F> Instrumentation for F
where
    F: Fn(&[u8]) -> Result<Execution, TraceFailure> + Sync,
{
    fn execute(&self, sample: usize, input: &[u8], _timeout: Duration) -> Result<Execution, Error> {
        self(input).map_err(|failure| Error::TraceFailure { sample, failure })
    }
}

/// Tracing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerConfig {
    /// Instructions whose memory accesses are recorded
    pub range: AddressRange,
    /// Input block size in bytes
    pub block_size: usize,
    /// Number of executions
    pub sample_count: usize,
    /// Maximum duration of one execution
    pub timeout: Duration,
    /// Worker threads, all cores when `None`
    pub threads: Option<usize>,
    /// Seed of the input generator, random inputs when `None`
    pub seed: Option<u64>,
    /// Also record memory reads as samples
    pub record_reads: bool,
    pub alignment: AlignmentPolicy,
}

impl TracerConfig {
    pub fn new(range: AddressRange, sample_count: usize) -> Self {
        Self {
            range,
            block_size: 16,
            sample_count,
            timeout: Duration::from_secs(10),
            threads: None,
            seed: None,
            record_reads: false,
            alignment: AlignmentPolicy::default(),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if !(1..=16).contains(&self.block_size) {
            return Err(Error::config(format!(
                "block size must be between 1 and 16 bytes, got {}",
                self.block_size
            )));
        }
        if self.sample_count == 0 {
            return Err(Error::config("sample count must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(Error::config("timeout must be positive"));
        }
        if self.threads == Some(0) {
            return Err(Error::config("thread count must be positive"));
        }

        Ok(())
    }
}

/// Output of a tracing run.
#[derive(Debug)]
pub struct TraceRun {
    pub corpus: Corpus,
    /// Dropped executions, by sample index
    pub failures: Vec<(usize, TraceFailure)>,
    /// Whether the run was stopped before all executions were launched
    pub cancelled: bool,
}

enum Outcome {
    Traced(Trace),
    Failed(TraceFailure),
    Skipped,
    Fatal(Error),
}

pub struct Tracer {
    config: TracerConfig,
}

impl Tracer {
    pub fn new(config: TracerConfig) -> Result<Self, Error> {
        config.validate()?;

        Ok(Self { config })
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    /// Input block of the given sample.
    ///
    /// With a seed, the block only depends on the seed and the sample index.
    pub fn input_block(&self, sample: usize) -> Vec<u8> {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(sample as u64)),
            None => StdRng::from_entropy(),
        };
        let mut block = vec![0u8; self.config.block_size];
        rng.fill_bytes(&mut block);

        block
    }

    /// Samples recorded during an execution.
    fn samples(&self, execution: &Execution) -> Vec<f64> {
        execution
            .events
            .iter()
            .filter(|event| {
                (event.kind == AccessKind::Write || self.config.record_reads)
                    && self.config.range.contains(event.ip)
            })
            .map(|event| event.value as f64)
            .collect()
    }

    fn trace_one<B: Instrumentation>(&self, backend: &B, sample: usize) -> Outcome {
        let input = self.input_block(sample);
        let execution = match backend.execute(sample, &input, self.config.timeout) {
            Ok(execution) => execution,
            Err(Error::TraceFailure { failure, .. }) => return Outcome::Failed(failure),
            Err(e) => return Outcome::Fatal(e),
        };

        match parse_output(&execution.stdout) {
            Ok(output) => {
                let samples = self.samples(&execution);
                debug!(
                    "sample {sample}: {} samples, output {output:#034x}",
                    samples.len()
                );
                Outcome::Traced(Trace::new(input, samples.as_slice(), output))
            }
            Err(failure) => Outcome::Failed(failure),
        }
    }

    /// Runs the target `sample_count` times and gathers the successful executions.
    ///
    /// Cancelling `cancel` stops launching new executions; the traces collected so far are
    /// returned.
    pub fn run<B: Instrumentation>(
        &self,
        backend: &B,
        cancel: &CancellationToken,
    ) -> Result<TraceRun, Error> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(threads) = self.config.threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder
            .build()
            .map_err(|e| Error::config(format!("cannot build thread pool: {e}")))?;

        info!(
            "tracing {} executions over {}",
            self.config.sample_count, self.config.range
        );

        #[cfg(feature = "progress_bar")]
        let progress = crate::util::progress_bar(self.config.sample_count);

        // A fatal error stops the other workers through this token.
        let abort = CancellationToken::new();
        let outcomes: Vec<Outcome> = pool.install(|| {
            (0..self.config.sample_count)
                .into_par_iter()
                .map(|sample| {
                    if cancel.is_cancelled() || abort.is_cancelled() {
                        return Outcome::Skipped;
                    }
                    let outcome = self.trace_one(backend, sample);
                    if matches!(outcome, Outcome::Fatal(_)) {
                        abort.cancel();
                    }
                    #[cfg(feature = "progress_bar")]
                    progress.inc(1);
                    outcome
                })
                .collect()
        });

        #[cfg(feature = "progress_bar")]
        progress.finish();

        let mut corpus = Corpus::new(self.config.block_size, self.config.alignment);
        let mut failures = Vec::new();
        let mut cancelled = false;
        for (sample, outcome) in outcomes.into_iter().enumerate() {
            let failure = match outcome {
                Outcome::Traced(trace) => match corpus.push(trace) {
                    Ok(()) => continue,
                    Err(Error::SampleLengthMismatch { expected, found }) => {
                        TraceFailure::Misaligned { expected, found }
                    }
                    Err(e) => return Err(e),
                },
                Outcome::Failed(failure) => failure,
                Outcome::Skipped => {
                    cancelled = true;
                    continue;
                }
                Outcome::Fatal(e) => return Err(e),
            };
            warn!("sample {sample} dropped: {failure}");
            failures.push((sample, failure));
        }

        info!(
            "collected {} traces of {} samples, {} failed{}",
            corpus.len(),
            corpus.num_samples(),
            failures.len(),
            if cancelled { ", cancelled" } else { "" }
        );

        Ok(TraceRun {
            corpus,
            failures,
            cancelled,
        })
    }
}

/// Parses `range` and traces `sample_count` executions of `block_size` bytes inputs.
///
/// The range is checked before anything is executed.
pub fn trace<B: Instrumentation>(
    backend: &B,
    range: &str,
    block_size: usize,
    sample_count: usize,
) -> Result<TraceRun, Error> {
    let config = TracerConfig {
        block_size,
        ..TracerConfig::new(range.parse()?, sample_count)
    };

    Tracer::new(config)?.run(backend, &CancellationToken::new())
}
