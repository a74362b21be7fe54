use anyhow::{Context, Result, bail};
use clap::Parser;
use itertools::Itertools;
use log::error;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};
use wbdca::{
    attack::{AttackConfig, AttackReport, AttackSettings, attack_all, recover_master_key},
    corpus::AlignmentPolicy,
    leakage_model::{LeakageModel, Position},
    tracer::{AddressRange, ProcessBackend, Tracer, TracerConfig},
    util::CancellationToken,
};

/// Differential computation analysis of a white-box SM4 binary.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Target binary, taking the input block as hex tokens and printing an OUTPUT line
    binary: PathBuf,
    /// Instructions whose memory writes are recorded, 0xSTART-0xEND
    #[arg(long)]
    range: AddressRange,
    #[arg(long, default_value_t = 16)]
    block_size: usize,
    /// Number of executions
    #[arg(long, default_value_t = 1000)]
    samples: usize,
    /// Timeout of one execution in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
    /// Worker threads, all cores by default
    #[arg(long)]
    threads: Option<usize>,
    /// Seed of the input generator
    #[arg(long)]
    seed: Option<u64>,
    /// Also record memory reads
    #[arg(long)]
    record_reads: bool,
    /// reject, truncate or pad traces of unexpected length
    #[arg(long, default_value = "reject", value_parser = parse_alignment)]
    alignment: AlignmentPolicy,
    /// Minimum number of traces to attack a byte
    #[arg(long, default_value_t = 2)]
    min_traces: usize,
    /// Tracer command wrapping the target; `{trace}` and `{target}` are substituted
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    tracer: Vec<String>,
    /// Directory receiving the memory access logs
    #[arg(long)]
    trace_dir: Option<PathBuf>,
    /// JSON file mapping attack names to attack configurations
    #[arg(long)]
    attacks: Option<PathBuf>,
    /// Chain the four first rounds at this position and print the master key
    #[arg(long)]
    master_key: Option<Position>,
    /// Leakage model of --master-key
    #[arg(long, default_value = "hw")]
    model: LeakageModel,
}

fn parse_alignment(s: &str) -> Result<AlignmentPolicy, String> {
    match s {
        "reject" => Ok(AlignmentPolicy::Reject),
        "truncate" => Ok(AlignmentPolicy::Truncate),
        "pad" => Ok(AlignmentPolicy::Pad),
        _ => Err(format!("unknown alignment policy {s:?}")),
    }
}

fn load_attacks(path: &Path) -> Result<BTreeMap<String, AttackConfig>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read attack configurations {}", path.display()))?;

    serde_json::from_str(&text)
        .with_context(|| format!("invalid attack configurations {}", path.display()))
}

fn print_report(name: &str, report: &AttackReport) {
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(recovery) => println!(
                "{name} round {} byte {}: {:02x} (coefficient {:+.4} at sample {}, then {})",
                report.round,
                outcome.byte_index,
                recovery.value,
                recovery.coefficient,
                recovery.column,
                recovery
                    .ranking
                    .iter()
                    .skip(1)
                    .take(3)
                    .map(|c| format!("{:02x} {:+.4}", c.hypothesis, c.coefficient))
                    .join(", ")
            ),
            Err(e) => println!(
                "{name} round {} byte {}: {e}",
                report.round, outcome.byte_index
            ),
        }
    }
    if let Some(round_key) = report.round_key() {
        println!("{name} round {} key: {round_key:08x}", report.round);
    }
}

fn run(args: Args) -> Result<()> {
    if args.attacks.is_none() && args.master_key.is_none() {
        bail!("nothing to do, give --attacks and/or --master-key");
    }
    let configs = args.attacks.as_deref().map(load_attacks).transpose()?;

    let tracer = Tracer::new(TracerConfig {
        block_size: args.block_size,
        timeout: Duration::from_millis(args.timeout_ms),
        threads: args.threads,
        seed: args.seed,
        record_reads: args.record_reads,
        alignment: args.alignment,
        ..TracerConfig::new(args.range, args.samples)
    })?;

    let mut backend = ProcessBackend::new(&args.binary).with_tracer(args.tracer.clone());
    if let Some(dir) = &args.trace_dir {
        backend = backend.with_trace_dir(dir);
    }

    let cancel = CancellationToken::new();
    let run = tracer
        .run(&backend, &cancel)
        .with_context(|| format!("cannot trace {}", args.binary.display()))?;
    println!(
        "traced {} executions of {} samples, {} dropped",
        run.corpus.len(),
        run.corpus.num_samples(),
        run.failures.len()
    );

    let settings = AttackSettings {
        min_traces: args.min_traces,
        ..AttackSettings::default()
    };

    let mut misconfigured = Vec::new();
    if let Some(configs) = &configs {
        for (name, report) in attack_all(&run.corpus, configs, &settings, &cancel) {
            match report {
                Ok(report) => print_report(&name, &report),
                Err(e) => {
                    println!("{name}: {e}");
                    misconfigured.push(name);
                }
            }
        }
    }

    if let Some(position) = args.master_key {
        let recovery = recover_master_key(&run.corpus, position, args.model, &settings, &cancel)?;
        for report in &recovery.reports {
            print_report("master-key", report);
        }
        match recovery.master_key() {
            Some(key) => println!("master key: {}", hex::encode(key)),
            None => println!(
                "master key not recovered, round keys: [{}]",
                recovery
                    .round_keys
                    .iter()
                    .map(|rk| format!("{rk:08x}"))
                    .join(", ")
            ),
        }
    }

    if !misconfigured.is_empty() {
        bail!("invalid attack configurations: {}", misconfigured.join(", "));
    }

    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
