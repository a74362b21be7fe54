//! Instrumentation through an external process.
use log::{debug, warn};
use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tempfile::NamedTempFile;

use super::{Execution, Instrumentation, events::parse_events};
use crate::{Error, codec::encode_block, error::TraceFailure};

/// Placeholder of the tracer arguments replaced by the memory access log path.
pub const TRACE_PLACEHOLDER: &str = "{trace}";
/// Placeholder of the tracer arguments replaced by the target path.
pub const TARGET_PLACEHOLDER: &str = "{target}";

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Runs the target binary, optionally wrapped by a tracer command.
///
/// The command line is `tracer... target args... input tokens...`. When the tracer arguments
/// contain [`TARGET_PLACEHOLDER`] the target path is substituted there instead of being appended.
/// When they contain [`TRACE_PLACEHOLDER`], the memory access log is read from that file,
/// otherwise from the process stderr.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    target: PathBuf,
    args: Vec<String>,
    tracer: Vec<String>,
    trace_dir: PathBuf,
}

impl ProcessBackend {
    pub fn new<P: AsRef<Path>>(target: P) -> Self {
        Self {
            target: target.as_ref().to_path_buf(),
            args: Vec::new(),
            tracer: Vec::new(),
            trace_dir: std::env::temp_dir(),
        }
    }

    /// Fixed arguments given to the target before the input tokens.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Tracer command wrapping the target.
    pub fn with_tracer<I, S>(mut self, tracer: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tracer = tracer.into_iter().map(Into::into).collect();
        self
    }

    /// Directory receiving the memory access logs.
    pub fn with_trace_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.trace_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Fresh log file of a sample, removed when dropped, if the tracer writes its log to a file.
    fn trace_file(&self, sample: usize) -> Result<Option<NamedTempFile>, Error> {
        if !self.tracer.iter().any(|arg| arg.contains(TRACE_PLACEHOLDER)) {
            return Ok(None);
        }

        let file = tempfile::Builder::new()
            .prefix(&format!("wbdca-{sample}-"))
            .suffix(".trace")
            .tempfile_in(&self.trace_dir)?;

        Ok(Some(file))
    }

    fn command(&self, input: &[u8], trace_path: Option<&Path>) -> Command {
        let target = self.target.to_string_lossy();
        let trace = trace_path.map(|p| p.to_string_lossy()).unwrap_or_default();
        let substitute = |arg: &String| {
            arg.replace(TRACE_PLACEHOLDER, &trace)
                .replace(TARGET_PLACEHOLDER, &target)
        };

        let mut argv: Vec<String> = self.tracer.iter().map(substitute).collect();
        if !self.tracer.iter().any(|arg| arg.contains(TARGET_PLACEHOLDER)) {
            argv.push(target.to_string());
        }
        argv.extend(self.args.iter().cloned());
        argv.extend(encode_block(input));

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        command
    }

    fn program(&self) -> String {
        self.tracer
            .first()
            .cloned()
            .unwrap_or_else(|| self.target.to_string_lossy().into_owned())
    }
}

fn read_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_string(&mut text)?;
        }
        Ok(text)
    })
}

fn join_pipe(handle: JoinHandle<io::Result<String>>) -> Result<String, TraceFailure> {
    handle
        .join()
        .map_err(|_| TraceFailure::Io("pipe reader panicked".to_string()))?
        .map_err(|e| TraceFailure::Io(e.to_string()))
}

/// Waits for `child`, killing it once `timeout` has elapsed.
fn wait_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

impl ProcessBackend {
    fn run(
        &self,
        sample: usize,
        input: &[u8],
        timeout: Duration,
        trace_path: Option<&Path>,
    ) -> Result<Execution, Error> {
        let fail = |failure| Error::TraceFailure { sample, failure };
        let io_failure = |e: io::Error| fail(TraceFailure::Io(e.to_string()));

        let mut child = self
            .command(input, trace_path)
            .spawn()
            .map_err(|source| Error::Launch {
                program: self.program(),
                source,
            })?;

        let stdout = read_pipe(child.stdout.take());
        let stderr = read_pipe(child.stderr.take());

        let Some(status) = wait_timeout(&mut child, timeout).map_err(io_failure)? else {
            // Readers may be blocked on grandchildren still holding the pipes, leave them.
            return Err(fail(TraceFailure::Timeout { after: timeout }));
        };
        let stdout = join_pipe(stdout).map_err(fail)?;
        let stderr = join_pipe(stderr).map_err(fail)?;

        if !status.success() {
            return Err(fail(TraceFailure::Crashed {
                status: status.to_string(),
            }));
        }

        let log = match trace_path {
            Some(path) => fs::read_to_string(path).map_err(io_failure)?,
            None => stderr,
        };
        let events = parse_events(&log).map_err(fail)?;

        Ok(Execution { stdout, events })
    }
}

impl Instrumentation for ProcessBackend {
    fn execute(&self, sample: usize, input: &[u8], timeout: Duration) -> Result<Execution, Error> {
        let trace_file = self.trace_file(sample)?;
        debug!("sample {sample}: launching {}", self.program());

        let result = self.run(sample, input, timeout, trace_file.as_ref().map(NamedTempFile::path));
        if let Some(file) = trace_file {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                warn!("cannot remove trace log {}: {e}", path.display());
            }
        }

        result
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::ProcessBackend;
    use crate::{
        Error,
        error::TraceFailure,
        tracer::{AccessKind, Instrumentation, Tracer, TracerConfig},
        util::CancellationToken,
    };
    use std::{fs, path::Path, time::Duration};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn shell(script: &str) -> ProcessBackend {
        ProcessBackend::new("/bin/sh").with_args(["-c", script, "sh"])
    }

    #[test]
    fn test_execute_reads_stdout_and_stderr() {
        let backend = shell(
            "printf 'INPUT: %s %s\\nOUTPUT:    %s %s\\n' \"$1\" \"$2\" \"$2\" \"$1\"; \
             echo \"[W] 0x1000 0x2000 1 0x$1\" >&2",
        );
        let execution = backend.execute(0, &[0xab, 0x01], TIMEOUT).unwrap();
        assert_eq!(execution.stdout, "INPUT: ab 01\nOUTPUT:    01 ab\n");
        assert_eq!(execution.events.len(), 1);
        assert_eq!(execution.events[0].kind, AccessKind::Write);
        assert_eq!(execution.events[0].value, 0xab);
    }

    fn file_tracer(script: &str, dir: &Path) -> ProcessBackend {
        ProcessBackend::new("ignored")
            .with_tracer(["/bin/sh", "-c", script, "{trace}"])
            .with_trace_dir(dir)
    }

    fn is_empty(dir: &Path) -> bool {
        fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn test_execute_trace_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = file_tracer(
            "echo \"[W] 0x10 0x20 2 0x$2$3\" > \"$0\"; echo OUTPUT: 00",
            dir.path(),
        );
        let execution = backend.execute(7, &[0x12, 0x34], TIMEOUT).unwrap();
        // `$1` is the target path, the input tokens follow.
        assert_eq!(execution.events[0].value, 0x1234);
        assert!(is_empty(dir.path()));
    }

    #[test]
    fn test_trace_file_removed_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = file_tracer("echo \"[W] 0x10 0x20 1 0x$2\" > \"$0\"; exit 9", dir.path());
        assert!(matches!(
            backend.execute(2, &[0x55], TIMEOUT),
            Err(Error::TraceFailure {
                sample: 2,
                failure: TraceFailure::Crashed { .. }
            })
        ));

        let backend = file_tracer("echo \"[W] 0x10 0x20 1 0x$2\" > \"$0\"; sleep 5", dir.path());
        assert!(matches!(
            backend.execute(3, &[0x55], Duration::from_millis(100)),
            Err(Error::TraceFailure {
                sample: 3,
                failure: TraceFailure::Timeout { .. }
            })
        ));
        assert!(is_empty(dir.path()));
    }

    #[test]
    fn test_missing_trace_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = file_tracer("echo OUTPUT: 00", &dir.path().join("missing"));
        assert!(matches!(
            backend.execute(0, &[0], TIMEOUT),
            Err(Error::IoError(_))
        ));
    }

    #[test]
    fn test_execute_crash() {
        let backend = shell("echo OUTPUT: 00; exit 3");
        assert!(matches!(
            backend.execute(4, &[0], TIMEOUT),
            Err(Error::TraceFailure {
                sample: 4,
                failure: TraceFailure::Crashed { .. }
            })
        ));
    }

    #[test]
    fn test_execute_timeout() {
        let backend = shell("sleep 5");
        assert!(matches!(
            backend.execute(1, &[0], Duration::from_millis(100)),
            Err(Error::TraceFailure {
                sample: 1,
                failure: TraceFailure::Timeout { .. }
            })
        ));
    }

    #[test]
    fn test_run_continues_after_timeouts() {
        // Inputs whose first byte is below 0x80 hang.
        let backend = shell(
            "if [ $((0x$1)) -lt 128 ]; then sleep 5; fi; \
             echo \"OUTPUT: $*\"; echo \"[W] 0x100 0x2000 1 0x$1\" >&2",
        );
        let tracer = Tracer::new(TracerConfig {
            timeout: Duration::from_millis(200),
            threads: Some(4),
            seed: Some(5),
            ..TracerConfig::new("0x100-0x200".parse().unwrap(), 16)
        })
        .unwrap();
        let hangs = |sample: usize| tracer.input_block(sample)[0] < 0x80;

        let run = tracer.run(&backend, &CancellationToken::new()).unwrap();
        assert!(!run.cancelled);
        assert!(!run.failures.is_empty());
        assert!(!run.corpus.is_empty());
        assert_eq!(run.failures.len() + run.corpus.len(), 16);
        for (sample, failure) in &run.failures {
            assert!(hangs(*sample), "sample {sample}");
            assert!(matches!(failure, TraceFailure::Timeout { .. }));
        }
        for trace in run.corpus.traces() {
            assert!(trace.input()[0] >= 0x80);
            assert_eq!(trace.samples().to_vec(), vec![trace.input()[0] as f64]);
        }
    }

    #[test]
    fn test_launch_failure() {
        let backend = ProcessBackend::new("/nonexistent/wb_sm4_challenge");
        assert!(matches!(
            backend.execute(0, &[0], TIMEOUT),
            Err(Error::Launch { .. })
        ));
    }
}
