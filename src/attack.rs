//! Key recovery from a traced corpus.
//!
//! An [`AttackConfig`] names an intermediate value of one SM4 round and the key bytes to recover.
//! Every byte is attacked independently: its failure never prevents the other bytes from being
//! reported.
use log::{info, warn};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

use crate::{
    Error,
    corpus::Corpus,
    distinguishers::cpa::{Correlation, DEFAULT_BATCH_SIZE, cpa},
    leakage_model::{LeakageModel, LookupTable, Position, Target, sm4},
    util::CancellationToken,
};

/// Number of bytes of a round key.
pub const ROUND_KEY_BYTES: u8 = 4;

/// Attacked cipher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[default]
    #[serde(rename = "SM4", alias = "sm4")]
    Sm4,
}

/// Key bytes of the round key to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ByteSelector", into = "ByteSelector")]
pub enum TargetBytes {
    Single(u8),
    All,
}

impl TargetBytes {
    /// Attacked byte indices, in increasing order.
    pub fn indices(&self) -> Vec<u8> {
        match *self {
            Self::Single(byte) => vec![byte],
            Self::All => (0..ROUND_KEY_BYTES).collect(),
        }
    }
}

impl Default for TargetBytes {
    fn default() -> Self {
        Self::Single(0)
    }
}

impl fmt::Display for TargetBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(byte) => write!(f, "{byte}"),
            Self::All => f.write_str("all"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ByteSelector {
    Index(u64),
    Name(String),
}

impl TryFrom<ByteSelector> for TargetBytes {
    type Error = Error;

    fn try_from(value: ByteSelector) -> Result<Self, Self::Error> {
        match value {
            ByteSelector::Index(byte) if byte < ROUND_KEY_BYTES as u64 => Ok(Self::Single(byte as u8)),
            ByteSelector::Name(name) if name.eq_ignore_ascii_case("all") => Ok(Self::All),
            ByteSelector::Index(byte) => Err(Error::config(format!(
                "bytenum must be between 0 and {}, got {byte}",
                ROUND_KEY_BYTES - 1
            ))),
            ByteSelector::Name(name) => Err(Error::config(format!("invalid bytenum {name:?}"))),
        }
    }
}

impl From<TargetBytes> for ByteSelector {
    fn from(value: TargetBytes) -> Self {
        match value {
            TargetBytes::Single(byte) => Self::Index(byte as u64),
            TargetBytes::All => Self::Name("all".to_string()),
        }
    }
}

/// Description of one attack, as found in an attack configuration file.
///
/// ```json
/// { "algorithm": "SM4", "position": "LUT/SM4_WHITEBOX_SBOX", "round": 0, "bytenum": "all" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttackConfig {
    #[serde(default)]
    pub algorithm: Algorithm,
    pub position: Position,
    /// Attacked round, 0 is the first one
    #[serde(default)]
    pub round: usize,
    #[serde(default, rename = "bytenum")]
    pub bytes: TargetBytes,
    #[serde(default)]
    pub model: LeakageModel,
    /// Table of [`Position::TableLookup`], the SM4 S-box when absent
    #[serde(default)]
    pub table: LookupTable,
    /// Round keys of the rounds preceding `round`
    #[serde(default)]
    pub known_round_keys: Vec<u32>,
}

impl AttackConfig {
    pub fn new(position: Position) -> Self {
        Self {
            algorithm: Algorithm::Sm4,
            position,
            round: 0,
            bytes: TargetBytes::default(),
            model: LeakageModel::default(),
            table: LookupTable::default(),
            known_round_keys: Vec::new(),
        }
    }

    /// Checks the configuration can be run against `corpus`.
    pub fn validate(&self, corpus: &Corpus) -> Result<(), Error> {
        if self.round >= sm4::ROUNDS {
            return Err(Error::config(format!(
                "round must be below {}, got {}",
                sm4::ROUNDS,
                self.round
            )));
        }
        if self.known_round_keys.len() < self.round {
            return Err(Error::config(format!(
                "attacking round {} requires {} known round keys, {} given",
                self.round,
                self.round,
                self.known_round_keys.len()
            )));
        }
        if let TargetBytes::Single(byte) = self.bytes {
            if byte >= ROUND_KEY_BYTES {
                return Err(Error::config(format!("invalid byte index {byte}")));
            }
        }
        if corpus.block_size() != sm4::BLOCK_SIZE {
            return Err(Error::config(format!(
                "{:?} attacks need {} bytes inputs, corpus has {}",
                self.algorithm,
                sm4::BLOCK_SIZE,
                corpus.block_size()
            )));
        }

        Ok(())
    }

    /// Leakage target of one byte of the attacked round key.
    pub fn target(&self, byte: u8) -> Target<'_> {
        Target {
            position: self.position,
            model: self.model,
            round: self.round,
            byte,
            known_round_keys: &self.known_round_keys[..self.round],
            table: &self.table,
        }
    }
}

/// Tuning of the correlation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackSettings {
    /// Minimum number of traces below which a byte is not attacked
    pub min_traces: usize,
    /// Number of traces per [`crate::distinguishers::cpa::CpaProcessor`] batch
    pub batch_size: usize,
}

impl Default for AttackSettings {
    fn default() -> Self {
        Self {
            min_traces: 2,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// A recovered key byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ByteRecovery {
    pub byte_index: u8,
    pub value: u8,
    /// Sample column where the best hypothesis correlates the most
    pub column: usize,
    pub coefficient: f64,
    /// All hypotheses, best first
    pub ranking: Vec<Correlation>,
}

#[derive(Debug)]
pub struct ByteOutcome {
    pub byte_index: u8,
    pub result: Result<ByteRecovery, Error>,
}

/// Outcome of an [`attack`], one entry per attacked byte in index order.
#[derive(Debug)]
pub struct AttackReport {
    pub position: Position,
    pub round: usize,
    pub outcomes: Vec<ByteOutcome>,
}

impl AttackReport {
    /// Recovered byte values, `None` for failed bytes.
    pub fn recovered(&self) -> Vec<Option<u8>> {
        self.outcomes
            .iter()
            .map(|outcome| outcome.result.as_ref().ok().map(|recovery| recovery.value))
            .collect()
    }

    /// The round key, if all of its bytes were recovered.
    pub fn round_key(&self) -> Option<u32> {
        if self.outcomes.len() != ROUND_KEY_BYTES as usize {
            return None;
        }

        self.outcomes.iter().try_fold(0u32, |key, outcome| {
            let recovery = outcome.result.as_ref().ok()?;
            Some(key | (recovery.value as u32) << (24 - 8 * recovery.byte_index as u32))
        })
    }
}

fn attack_byte(
    corpus: &Corpus,
    leakages: ArrayView2<f64>,
    target: Target,
    settings: &AttackSettings,
    cancel: &CancellationToken,
) -> Result<ByteRecovery, Error> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled {
            position: target.position,
            byte: target.byte,
        });
    }

    let minimum = settings.min_traces.max(2);
    if corpus.len() < minimum {
        return Err(Error::CorpusTooSmall {
            position: target.position,
            byte: target.byte,
            size: corpus.len(),
            minimum,
        });
    }

    let predictions = target.predictions(corpus);
    let ranking = cpa(leakages, predictions.view(), settings.batch_size.max(1)).rank();
    let best = ranking[0];

    Ok(ByteRecovery {
        byte_index: target.byte,
        value: best.hypothesis as u8,
        column: best.column,
        coefficient: best.coefficient,
        ranking,
    })
}

/// Runs `config` against `corpus`.
///
/// Invalid configurations are rejected before any byte is attacked. Once cancelled, the remaining
/// bytes are reported as [`Error::Cancelled`].
pub fn attack(
    corpus: &Corpus,
    config: &AttackConfig,
    settings: &AttackSettings,
    cancel: &CancellationToken,
) -> Result<AttackReport, Error> {
    config.validate(corpus)?;

    info!(
        "attacking {} round {} bytes {} ({} traces)",
        config.position,
        config.round,
        config.bytes,
        corpus.len()
    );

    let leakages = corpus.leakages();
    let outcomes = config
        .bytes
        .indices()
        .into_iter()
        .map(|byte| {
            let result = attack_byte(corpus, leakages.view(), config.target(byte), settings, cancel);
            match &result {
                Ok(recovery) => info!(
                    "{} byte {byte}: {:#04x} (coefficient {:.4} at sample {})",
                    config.position, recovery.value, recovery.coefficient, recovery.column
                ),
                Err(e) => warn!("{e}"),
            }

            ByteOutcome {
                byte_index: byte,
                result,
            }
        })
        .collect();

    Ok(AttackReport {
        position: config.position,
        round: config.round,
        outcomes,
    })
}

/// Runs several named configurations against the same corpus.
pub fn attack_all(
    corpus: &Corpus,
    configs: &BTreeMap<String, AttackConfig>,
    settings: &AttackSettings,
    cancel: &CancellationToken,
) -> BTreeMap<String, Result<AttackReport, Error>> {
    configs
        .iter()
        .map(|(name, config)| {
            info!("running attack {name}");
            (name.clone(), attack(corpus, config, settings, cancel))
        })
        .collect()
}

/// Round keys recovered by [`recover_master_key`].
#[derive(Debug)]
pub struct KeyRecovery {
    pub round_keys: Vec<u32>,
    /// One report per attacked round
    pub reports: Vec<AttackReport>,
}

impl KeyRecovery {
    /// The master key, once the four first round keys are known.
    pub fn master_key(&self) -> Option<[u8; 16]> {
        let round_keys: [u32; 4] = self.round_keys.get(..4)?.try_into().ok()?;

        Some(sm4::master_key_from_round_keys(round_keys))
    }
}

/// Recovers the four first round keys one round after the other, then the master key.
///
/// Stops at the first round whose key is not fully recovered.
pub fn recover_master_key(
    corpus: &Corpus,
    position: Position,
    model: LeakageModel,
    settings: &AttackSettings,
    cancel: &CancellationToken,
) -> Result<KeyRecovery, Error> {
    let mut recovery = KeyRecovery {
        round_keys: Vec::new(),
        reports: Vec::new(),
    };

    for round in 0..4 {
        let config = AttackConfig {
            round,
            bytes: TargetBytes::All,
            model,
            known_round_keys: recovery.round_keys.clone(),
            ..AttackConfig::new(position)
        };
        let report = attack(corpus, &config, settings, cancel)?;
        let round_key = report.round_key();
        recovery.reports.push(report);

        match round_key {
            Some(round_key) => {
                info!("round {round} key: {round_key:08x}");
                recovery.round_keys.push(round_key);
            }
            None => {
                warn!("round {round} key not recovered, stopping");
                break;
            }
        }
    }

    Ok(recovery)
}
