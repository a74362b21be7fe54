use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use rayon::prelude::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::{fs::File, iter::zip, ops::Add, path::Path};

use crate::{
    Error,
    corpus::Corpus,
    leakage_model::Predictions,
    util::{argmax_by, argsort_by},
};

/// Default number of traces per batch fed to a [`CpaProcessor`].
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Maximum number of partial processors computed in parallel by [`cpa`].
const MAX_PARTIALS: usize = 16;

/// Compute the [`Cpa`] of the given leakages using [`CpaProcessor`].
///
/// `leakages` has one row per trace, `predictions` has one row per trace and one column per
/// hypothesis.
///
/// # Panics
/// - Panic if `leakages.shape()[0] != predictions.shape()[0]`
/// - Panic if `batch_size` is 0.
pub fn cpa(leakages: ArrayView2<f64>, predictions: ArrayView2<f64>, batch_size: usize) -> Cpa {
    assert_eq!(leakages.shape()[0], predictions.shape()[0]);
    assert!(batch_size > 0);

    let num_traces = leakages.shape()[0];
    let new_processor = || CpaProcessor::new(leakages.shape()[1], predictions.shape()[1]);

    // Contiguous groups of batches, each folded in trace order, then merged in group order: the
    // result does not depend on scheduling.
    let num_batches = num_traces.div_ceil(batch_size);
    let group_len = num_batches.div_ceil(num_batches.clamp(1, MAX_PARTIALS)) * batch_size;
    let partials: Vec<CpaProcessor> = (0..num_traces.div_ceil(group_len.max(1)))
        .into_par_iter()
        .map(|group| {
            let (start, end) = (group * group_len, ((group + 1) * group_len).min(num_traces));
            let mut cpa = new_processor();
            for (leakage_batch, prediction_batch) in zip(
                leakages.slice(s![start..end, ..]).axis_chunks_iter(Axis(0), batch_size),
                predictions.slice(s![start..end, ..]).axis_chunks_iter(Axis(0), batch_size),
            ) {
                cpa.update(leakage_batch, prediction_batch);
            }

            cpa
        })
        .collect();

    partials
        .into_iter()
        .fold(new_processor(), |a, b| a + b)
        .finalize()
}

/// Rank the hypotheses of `predictions` against the leakage of `corpus`.
///
/// # Panics
/// Panic if `predictions` was not built from `corpus`.
pub fn rank(corpus: &Corpus, predictions: &Predictions) -> Vec<Correlation> {
    cpa(
        corpus.leakages().view(),
        predictions.view(),
        DEFAULT_BATCH_SIZE,
    )
    .rank()
}

/// Best correlation of a hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub hypothesis: usize,
    /// Sample column where the correlation peaks
    pub column: usize,
    /// Signed Pearson correlation coefficient
    pub coefficient: f64,
}

/// Result of the CPA[^1] on some traces.
///
/// [^1]: <https://www.iacr.org/archive/ches2004/31560016/31560016.pdf>
#[derive(Debug)]
pub struct Cpa {
    /// Pearson correlation coefficients, one row per hypothesis
    pub(crate) corr: Array2<f64>,
}

impl Cpa {
    /// Rank hypotheses by decreasing absolute coefficient.
    ///
    /// Ties are broken by lowest hypothesis, then lowest column.
    pub fn rank(&self) -> Vec<Correlation> {
        let max_corr = self.max_corr();
        let order = argsort_by(&max_corr, |a, b| {
            b.coefficient.abs().total_cmp(&a.coefficient.abs())
        });

        order.into_iter().map(|i| max_corr[i]).collect()
    }

    /// Return the Pearson correlation coefficients.
    pub fn corr(&self) -> ArrayView2<f64> {
        self.corr.view()
    }

    /// Return the hypothesis with the highest absolute Pearson correlation coefficient.
    pub fn best_guess(&self) -> Option<Correlation> {
        self.rank().into_iter().next()
    }

    /// Return the maximum absolute Pearson correlation coefficient of each hypothesis.
    pub fn max_corr(&self) -> Vec<Correlation> {
        self.corr
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(hypothesis, row)| {
                if row.is_empty() {
                    return Correlation {
                        hypothesis,
                        column: 0,
                        coefficient: 0.,
                    };
                }
                let column = argmax_by(row, |a, b| a.abs().total_cmp(&b.abs()));
                Correlation {
                    hypothesis,
                    column,
                    coefficient: row[column],
                }
            })
            .collect()
    }
}

/// Mean and centred second moment of one variable across the processed traces.
///
/// `min` and `max` let [`CpaProcessor::finalize`] spot constant variables exactly instead of
/// trusting a variance that rounding may leave slightly off zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Moments {
    /// Values of the first processed trace, `mean` is relative to it
    reference: Array1<f64>,
    mean: Array1<f64>,
    /// Sum of squared deviations from `mean`
    m2: Array1<f64>,
    min: Array1<f64>,
    max: Array1<f64>,
}

impl Moments {
    fn new(size: usize) -> Self {
        Self {
            reference: Array1::zeros(size),
            mean: Array1::zeros(size),
            m2: Array1::zeros(size),
            min: Array1::zeros(size),
            max: Array1::zeros(size),
        }
    }

    /// Moments of a non-empty batch, along with the batch centred on its mean.
    ///
    /// Values are shifted by the first row of the batch so that large constant offsets do not eat
    /// the precision of the deviations.
    fn from_batch(batch: ArrayView2<f64>) -> (Self, Array2<f64>) {
        let reference = batch.row(0).to_owned();
        let shifted = &batch - &reference;
        let offset = shifted
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(batch.ncols()));
        let centred = shifted - &offset;

        let moments = Self {
            reference,
            mean: offset,
            m2: centred.mapv(|x| x * x).sum_axis(Axis(0)),
            min: batch.fold_axis(Axis(0), f64::INFINITY, |acc, &x| acc.min(x)),
            max: batch.fold_axis(Axis(0), f64::NEG_INFINITY, |acc, &x| acc.max(x)),
        };

        (moments, centred)
    }

    /// Difference of the means of `rhs` and `self`.
    fn delta(&self, rhs: &Self) -> Array1<f64> {
        (&rhs.reference - &self.reference) + (&rhs.mean - &self.mean)
    }

    /// Merges `rhs`, computed over `nb` traces, into `self`, computed over `na` traces.
    ///
    /// `delta` is [`Moments::delta`] of `self` and `rhs`.
    fn merge(&mut self, rhs: Self, delta: &Array1<f64>, na: f64, nb: f64) {
        let n = na + nb;
        self.mean.scaled_add(nb / n, delta);
        self.m2 += &rhs.m2;
        self.m2.scaled_add(na * nb / n, &delta.mapv(|d| d * d));
        self.min.zip_mut_with(&rhs.min, |a, &b| *a = a.min(b));
        self.max.zip_mut_with(&rhs.max, |a, &b| *a = a.max(b));
    }

    /// Sum of squared deviations, exactly zero for constant variables.
    fn m2(&self) -> Array1<f64> {
        let mut m2 = self.m2.clone();
        for (i, v) in m2.iter_mut().enumerate() {
            if self.min[i] == self.max[i] || *v < 0. {
                *v = 0.;
            }
        }

        m2
    }
}

/// A processor that computes the [`Cpa`] of the given leakages.
///
/// Statistics are kept centred (means and co-moments) and merged with the pairwise update of
/// Chan et al., so constant offsets in the samples do not degrade the coefficients.
/// Processors fed with disjoint sets of traces can be merged with `+`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpaProcessor {
    /// Number of samples per trace
    num_samples: usize,
    /// Number of hypotheses
    num_hypotheses: usize,
    /// Leakage moments per sample column
    leakages: Moments,
    /// Prediction moments per hypothesis
    predictions: Moments,
    /// Co-moment of predictions and leakages, one row per hypothesis
    cov: Array2<f64>,
    /// Number of traces processed
    num_traces: usize,
}

impl CpaProcessor {
    pub fn new(num_samples: usize, num_hypotheses: usize) -> Self {
        Self {
            num_samples,
            num_hypotheses,
            leakages: Moments::new(num_samples),
            predictions: Moments::new(num_hypotheses),
            cov: Array2::zeros((num_hypotheses, num_samples)),
            num_traces: 0,
        }
    }

    /// # Panics
    /// - Panic in debug if `leakage_batch.shape()[0] != prediction_batch.shape()[0]`.
    /// - Panic in debug if `leakage_batch.shape()[1] != self.num_samples`.
    /// - Panic in debug if `prediction_batch.shape()[1] != self.num_hypotheses`.
    pub fn update(&mut self, leakage_batch: ArrayView2<f64>, prediction_batch: ArrayView2<f64>) {
        debug_assert_eq!(leakage_batch.shape()[0], prediction_batch.shape()[0]);
        debug_assert_eq!(leakage_batch.shape()[1], self.num_samples);
        debug_assert_eq!(prediction_batch.shape()[1], self.num_hypotheses);

        if leakage_batch.shape()[0] == 0 {
            return;
        }

        let (leakages, centred_leakages) = Moments::from_batch(leakage_batch);
        let (predictions, centred_predictions) = Moments::from_batch(prediction_batch);

        self.merge(Self {
            num_samples: self.num_samples,
            num_hypotheses: self.num_hypotheses,
            leakages,
            predictions,
            cov: centred_predictions.t().dot(&centred_leakages),
            num_traces: leakage_batch.shape()[0],
        });
    }

    /// Process a single trace.
    pub fn update_trace(&mut self, leakage: ArrayView1<f64>, predictions: ArrayView1<f64>) {
        self.update(leakage.insert_axis(Axis(0)), predictions.insert_axis(Axis(0)));
    }

    fn merge(&mut self, rhs: Self) {
        if rhs.num_traces == 0 {
            return;
        }
        if self.num_traces == 0 {
            *self = rhs;
            return;
        }

        let na = self.num_traces as f64;
        let nb = rhs.num_traces as f64;
        let delta_leakages = self.leakages.delta(&rhs.leakages);
        let delta_predictions = self.predictions.delta(&rhs.predictions);

        self.cov += &rhs.cov;
        self.cov.scaled_add(
            na * nb / (na + nb),
            &delta_predictions
                .view()
                .insert_axis(Axis(1))
                .dot(&delta_leakages.view().insert_axis(Axis(0))),
        );
        self.leakages.merge(rhs.leakages, &delta_leakages, na, nb);
        self.predictions
            .merge(rhs.predictions, &delta_predictions, na, nb);
        self.num_traces += rhs.num_traces;
    }

    /// Finalize the calculation after feeding the overall traces.
    ///
    /// Coefficients involving a constant sample column or a constant prediction vector are 0.
    pub fn finalize(&self) -> Cpa {
        let m2_leakages = self.leakages.m2();
        let m2_predictions = self.predictions.m2();

        let rows: Vec<Vec<f64>> = (0..self.num_hypotheses)
            .into_par_iter()
            .map(|guess| {
                (0..self.num_samples)
                    .map(|u| {
                        let denominator = m2_predictions[guess] * m2_leakages[u];
                        if denominator <= 0. {
                            return 0.;
                        }

                        (self.cov[[guess, u]] / denominator.sqrt()).clamp(-1., 1.)
                    })
                    .collect()
            })
            .collect();

        let corr = Array2::from_shape_fn((self.num_hypotheses, self.num_samples), |(g, u)| {
            rows[g][u]
        });

        Cpa { corr }
    }

    /// Number of traces processed so far.
    pub fn num_traces(&self) -> usize {
        self.num_traces
    }

    /// Determine if two [`CpaProcessor`] are compatible for addition.
    ///
    /// If they were created with the same parameters, they are compatible.
    fn is_compatible_with(&self, other: &Self) -> bool {
        self.num_samples == other.num_samples && self.num_hypotheses == other.num_hypotheses
    }

    /// Save the [`CpaProcessor`] to a file.
    ///
    /// # Warning
    /// The file format is not stable. It might change between versions.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = File::create(path)?;
        serde_json::to_writer(file, self)?;

        Ok(())
    }

    /// Load a [`CpaProcessor`] from a file.
    ///
    /// # Warning
    /// The file format is not stable. It might change between versions.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path)?;
        let p: CpaProcessor = serde_json::from_reader(file)?;

        Ok(p)
    }
}

impl Add for CpaProcessor {
    type Output = Self;

    /// Merge computations of two [`CpaProcessor`]. Processors need to be compatible to be merged
    /// together, otherwise it can panic or yield incoherent result (see
    /// [`CpaProcessor::is_compatible_with`]).
    ///
    /// # Panics
    /// Panics in debug if the processors are not compatible.
    fn add(mut self, rhs: Self) -> Self::Output {
        debug_assert!(self.is_compatible_with(&rhs));

        self.merge(rhs);

        self
    }
}

#[cfg(test)]
mod tests {
    use super::{CpaProcessor, cpa};
    use ndarray::{Array2, ArrayView, Axis, Dimension, array, s};
    use serde::Deserialize;
    use std::iter::zip;

    fn fixture() -> (Array2<f64>, Array2<f64>) {
        let traces = array![
            [77., 137., 51., 91.],
            [72., 61., 91., 83.],
            [39., 49., 52., 23.],
            [26., 114., 63., 45.],
            [30., 8., 97., 91.],
            [13., 68., 7., 45.],
            [17., 181., 60., 34.],
            [43., 88., 76., 78.],
            [0., 36., 35., 0.],
            [93., 191., 49., 26.],
        ];
        let plaintexts = [1usize, 3, 1, 2, 3, 2, 2, 1, 3, 1];
        let predictions =
            Array2::from_shape_fn((10, 256), |(i, guess)| ((plaintexts[i] ^ guess) as u32).count_ones() as f64);

        (traces, predictions)
    }

    fn assert_close<D: Dimension>(a: ArrayView<f64, D>, b: ArrayView<f64, D>, tolerance: f64) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in zip(a, b) {
            assert!((x - y).abs() < tolerance, "{x} != {y}");
        }
    }

    /// Plain two-pass Pearson coefficient.
    fn pearson(x: &[f64], y: &[f64]) -> f64 {
        let n = x.len() as f64;
        let mx = x.iter().sum::<f64>() / n;
        let my = y.iter().sum::<f64>() / n;
        let cov: f64 = zip(x, y).map(|(a, b)| (a - mx) * (b - my)).sum();
        let vx: f64 = x.iter().map(|a| (a - mx).powi(2)).sum();
        let vy: f64 = y.iter().map(|b| (b - my).powi(2)).sum();
        cov / (vx * vy).sqrt()
    }

    #[test]
    fn test_cpa_matches_pearson() {
        let (traces, predictions) = fixture();
        let cpa = cpa(traces.view(), predictions.view(), 3);

        for guess in [0usize, 1, 2, 5, 255] {
            for u in 0..traces.shape()[1] {
                let expected = pearson(
                    &traces.column(u).to_vec(),
                    &predictions.column(guess).to_vec(),
                );
                assert!((cpa.corr()[[guess, u]] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_cpa_helper() {
        let (traces, predictions) = fixture();

        let mut processor = CpaProcessor::new(traces.shape()[1], 256);
        for (trace, prediction) in zip(traces.rows(), predictions.rows()) {
            processor.update_trace(trace, prediction);
        }
        let sequential = processor.finalize();
        let parallel = cpa(traces.view(), predictions.view(), 2);

        for (a, b) in zip(sequential.corr(), parallel.corr()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_rank_complete_and_bounded() {
        let (traces, predictions) = fixture();
        let rank = cpa(traces.view(), predictions.view(), 4).rank();

        assert_eq!(rank.len(), 256);
        let mut seen = [false; 256];
        for c in &rank {
            assert!((-1.0..=1.0).contains(&c.coefficient));
            seen[c.hypothesis] = true;
        }
        assert!(seen.iter().all(|&s| s));
        for pair in rank.windows(2) {
            let (a, b) = (pair[0].coefficient.abs(), pair[1].coefficient.abs());
            assert!(a > b || (a == b && pair[0].hypothesis < pair[1].hypothesis));
        }
    }

    #[test]
    fn test_shift_invariance() {
        let (traces, predictions) = fixture();
        let mut shifted = traces.clone();
        shifted.column_mut(2).mapv_inplace(|x| x + 1000.);

        let a = cpa(traces.view(), predictions.view(), 4);
        let b = cpa(shifted.view(), predictions.view(), 4);
        for (x, y) in zip(a.corr().column(2), b.corr().column(2)) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_large_offset() {
        let (traces, predictions) = fixture();
        let leak = predictions.column(0x2a).to_owned();
        let mut offset = traces.clone();
        offset.column_mut(0).assign(&leak);
        offset
            .column_mut(1)
            .assign(&leak.mapv(|x| x + 0x7ffd_1234_0000u64 as f64));

        for batch_size in [1, 3, 10] {
            let cpa = cpa(offset.view(), predictions.view(), batch_size);
            for guess in 0..256 {
                let (a, b) = (cpa.corr()[[guess, 0]], cpa.corr()[[guess, 1]]);
                assert!((a - b).abs() < 1e-9, "guess {guess}: {a} != {b}");
            }
            assert!((cpa.corr()[[0x2a, 1]] - 1.).abs() < 1e-9);
        }
    }

    #[test]
    fn test_deterministic_across_thread_counts() {
        let (traces, predictions) = fixture();
        let traces = ndarray::concatenate![Axis(0), traces, traces.mapv(|x| x * 1.5 + 0.1), traces];
        let predictions = ndarray::concatenate![Axis(0), predictions, predictions, predictions];

        let run = |threads| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap()
                .install(|| cpa(traces.view(), predictions.view(), 2))
        };
        let reference = run(1);
        for threads in [2, 4, 8] {
            let other = run(threads);
            for (a, b) in zip(reference.corr(), other.corr()) {
                assert_eq!(a.to_bits(), b.to_bits());
            }
            assert_eq!(reference.rank(), other.rank());
        }
    }

    #[test]
    fn test_degenerate_is_zero() {
        let (mut traces, predictions) = fixture();
        traces.column_mut(1).fill(0.1);
        let mut predictions = predictions;
        predictions.column_mut(7).fill(3.);

        let cpa = cpa(traces.view(), predictions.view(), 3);
        assert!(cpa.corr().column(1).iter().all(|&c| c == 0.));
        assert!(cpa.corr().row(7).iter().all(|&c| c == 0.));
        assert!(cpa.corr().iter().all(|c| !c.is_nan()));
    }

    #[test]
    fn test_single_trace_and_empty() {
        let (traces, predictions) = fixture();
        let cpa_one = cpa(
            traces.slice(s![..1, ..]),
            predictions.slice(s![..1, ..]),
            1,
        );
        assert!(cpa_one.corr().iter().all(|&c| c == 0.));

        let cpa_none = cpa(
            traces.slice(s![..0, ..]),
            predictions.slice(s![..0, ..]),
            1,
        );
        assert_eq!(cpa_none.rank().len(), 256);
    }

    #[test]
    fn test_column_tie_keeps_lowest() {
        let (mut traces, predictions) = fixture();
        let column = predictions.column(9).to_owned();
        traces.column_mut(1).assign(&column);
        traces.column_mut(3).assign(&column);

        let best = cpa(traces.view(), predictions.view(), 5)
            .max_corr()
            .into_iter()
            .find(|c| c.hypothesis == 9)
            .unwrap();
        assert_eq!(best.column, 1);
        assert!((best.coefficient - 1.).abs() < 1e-12);
    }

    #[test]
    fn test_serialize_deserialize_processor() {
        let (traces, predictions) = fixture();
        let mut processor = CpaProcessor::new(traces.shape()[1], 256);
        for (trace_batch, prediction_batch) in zip(
            traces.axis_chunks_iter(Axis(0), 4),
            predictions.axis_chunks_iter(Axis(0), 4),
        ) {
            processor.update(trace_batch, prediction_batch);
        }

        let serialized = serde_json::to_string(&processor).unwrap();
        let mut deserializer = serde_json::Deserializer::from_str(serialized.as_str());
        let restored_processor = CpaProcessor::deserialize(&mut deserializer).unwrap();

        assert_eq!(processor.num_samples, restored_processor.num_samples);
        assert_eq!(processor.num_hypotheses, restored_processor.num_hypotheses);
        assert_eq!(processor.num_traces, restored_processor.num_traces);
        assert_close(processor.cov.view(), restored_processor.cov.view(), 1e-9);
        assert_close(
            processor.leakages.mean.view(),
            restored_processor.leakages.mean.view(),
            1e-9,
        );
        assert_close(
            processor.predictions.m2.view(),
            restored_processor.predictions.m2.view(),
            1e-9,
        );
        assert_close(
            processor.finalize().corr(),
            restored_processor.finalize().corr(),
            1e-12,
        );
    }
}
