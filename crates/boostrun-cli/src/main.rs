//! boostrun CLI - Run and supervise boostrun workers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

use boostrun_core::{ExchangeRequest, JobSpec, Mode, Timing, DEFAULT_ADDRESS, DEFAULT_INTERPRETER};
use boostrun_supervisor::{discover_buffers, render, Supervisor, WORKER_OUTPUT_TARGET};

/// boostrun CLI - Worker supervision tool
#[derive(Parser)]
#[command(name = "boostrun")]
#[command(about = "Launch, serve and train boostrun workers", long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Job(JobCommand),

    /// Print the rendered worker source of a job without running it
    Render {
        #[command(subcommand)]
        job: JobCommand,
    },

    /// Kill and remove whatever a previous run of a job left behind
    Cleanup {
        #[command(subcommand)]
        job: JobCommand,
    },
}

#[derive(Subcommand)]
enum JobCommand {
    /// Serve predictions; reads one JSON request per line from stdin
    Serve {
        #[command(flatten)]
        common: CommonArgs,

        /// Host the worker binds to
        #[arg(long, default_value = DEFAULT_ADDRESS)]
        address: String,

        /// Port the worker binds to
        #[arg(short, long)]
        port: u16,

        /// Buffers to load (default: every buffer in the data root)
        #[arg(long = "buffer")]
        buffers: Vec<String>,

        /// Seconds the worker gets to answer its health check
        #[arg(long, default_value = "120")]
        readiness_timeout: u64,

        /// Seconds a single request may take
        #[arg(long, default_value = "30")]
        request_timeout: u64,
    },

    /// Train the bucket models of one buffer
    #[command(name = "train-model")]
    TrainModel {
        #[command(flatten)]
        common: CommonArgs,

        /// Buffer to train
        #[arg(long)]
        buffer: String,

        /// Maximum error a model may have to be kept
        #[arg(long)]
        threshold: f64,

        /// Continue training from the existing models
        #[arg(long)]
        continue_training: bool,

        /// Kill the worker after this many seconds
        #[arg(long)]
        run_timeout: Option<u64>,
    },

    /// Train the ensemble combining all buffers
    #[command(name = "train-ensemble")]
    TrainEnsemble {
        #[command(flatten)]
        common: CommonArgs,

        /// Buffers to combine (default: every buffer in the data root)
        #[arg(long = "buffer")]
        buffers: Vec<String>,

        /// Kill the worker after this many seconds
        #[arg(long)]
        run_timeout: Option<u64>,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Directory holding the buffer and ensemble data
    #[arg(short, long)]
    data_root: PathBuf,

    /// Bucket identifiers, in training order
    #[arg(short, long = "bucket", required = true)]
    buckets: Vec<String>,

    /// Worker template file (default: built-in template)
    #[arg(long)]
    template: Option<PathBuf>,

    /// Program executing the rendered worker
    #[arg(long, default_value = DEFAULT_INTERPRETER)]
    interpreter: String,

    /// Forward the worker's output to the log, at info level under the
    /// `boostrun::worker` target even when RUST_LOG is quieter
    #[arg(long)]
    debug: bool,
}

impl Commands {
    fn job(&self) -> &JobCommand {
        match self {
            Commands::Job(job) | Commands::Render { job } | Commands::Cleanup { job } => job,
        }
    }
}

impl JobCommand {
    fn common(&self) -> &CommonArgs {
        match self {
            JobCommand::Serve { common, .. }
            | JobCommand::TrainModel { common, .. }
            | JobCommand::TrainEnsemble { common, .. } => common,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = log_filter(cli.verbose, cli.command.job().common().debug, env.as_deref())?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Job(job) => {
            let spec = job_spec(job)?;
            match spec.mode() {
                Mode::Serving => serve(spec).await?,
                Mode::Batch => train(spec).await?,
            }
        }
        Commands::Render { job } => {
            let source = render(&job_spec(job)?)?;
            print!("{}", String::from_utf8_lossy(&source));
        }
        Commands::Cleanup { job } => {
            let spec = job_spec(job)?;
            info!(data_root = %spec.data_root.display(), workload = spec.workload.name(), "Cleaning up");
            Supervisor::new(spec)?.cleanup().await?;
        }
    }

    Ok(())
}

/// Log filter from `RUST_LOG`, or the crate default when it is unset or invalid.
///
/// Forwarded worker output stays enabled whenever it was asked for.
fn log_filter(verbose: bool, worker_output: bool, env: Option<&str>) -> Result<EnvFilter, ParseError> {
    let default_level = if verbose { "boostrun=debug" } else { "boostrun=info" };
    let filter = env
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level));

    if worker_output {
        Ok(filter.add_directive(format!("{}=info", WORKER_OUTPUT_TARGET).parse()?))
    } else {
        Ok(filter)
    }
}

/// Build the job spec a subcommand describes.
fn job_spec(job: JobCommand) -> Result<JobSpec, Box<dyn std::error::Error>> {
    let mut timing = Timing::default();

    let (spec, common) = match job {
        JobCommand::Serve {
            common,
            address,
            port,
            buffers,
            readiness_timeout,
            request_timeout,
        } => {
            timing.readiness_timeout = Duration::from_secs(readiness_timeout);
            timing.request_timeout = Duration::from_secs(request_timeout);
            let buffers = buffers_or_discovered(buffers, &common.data_root)?;
            let spec = JobSpec::serving(&common.data_root, port)
                .with_address(address)
                .with_buffers(buffers);
            (spec, common)
        }
        JobCommand::TrainModel {
            common,
            buffer,
            threshold,
            continue_training,
            run_timeout,
        } => {
            timing.run_timeout = run_timeout.map(Duration::from_secs);
            let spec = JobSpec::train_model(&common.data_root, buffer)
                .with_threshold(threshold)
                .with_continue_training(continue_training);
            (spec, common)
        }
        JobCommand::TrainEnsemble {
            common,
            buffers,
            run_timeout,
        } => {
            timing.run_timeout = run_timeout.map(Duration::from_secs);
            let buffers = buffers_or_discovered(buffers, &common.data_root)?;
            let spec = JobSpec::train_ensemble(&common.data_root).with_buffers(buffers);
            (spec, common)
        }
    };

    let mut spec = spec
        .with_buckets(common.buckets)
        .with_interpreter(common.interpreter)
        .with_debug(common.debug)
        .with_timing(timing);

    if let Some(path) = common.template {
        spec = spec.with_template(std::fs::read_to_string(&path).map_err(|e| {
            format!("failed to read template {}: {}", path.display(), e)
        })?);
    }

    spec.validate()?;
    Ok(spec)
}

fn buffers_or_discovered(
    buffers: Vec<String>,
    data_root: &Path,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    if !buffers.is_empty() {
        return Ok(buffers);
    }

    let found = discover_buffers(data_root)
        .map_err(|e| format!("failed to list buffers in {}: {}", data_root.display(), e))?;
    info!(count = found.len(), "Discovered buffers");
    Ok(found)
}

/// Restore the worker and answer requests from stdin until EOF or Ctrl-C.
async fn serve(spec: JobSpec) -> Result<(), Box<dyn std::error::Error>> {
    let mut supervisor = Supervisor::new(spec)?;
    supervisor.restore().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break, // EOF
            Err(e) => {
                error!(error = %e, "Failed to read request");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: ExchangeRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Skipping malformed request");
                continue;
            }
        };

        match supervisor.exchange(&request).await {
            Ok(prediction) => println!("{}", prediction),
            Err(e) => error!(error = %e, "Exchange failed"),
        }
    }

    supervisor.sigkill().await?;
    Ok(())
}

/// Run a batch worker and print its outcome as JSON.
async fn train(spec: JobSpec) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = Supervisor::new(spec)?.train().await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_follows_verbosity() {
        assert_eq!(log_filter(false, false, None).unwrap().to_string(), "boostrun=info");
        assert_eq!(log_filter(true, false, None).unwrap().to_string(), "boostrun=debug");
    }

    #[test]
    fn test_worker_output_survives_quiet_env() {
        let filter = log_filter(false, true, Some("warn")).unwrap().to_string();
        assert!(filter.contains("boostrun::worker=info"), "{}", filter);
        assert!(filter.contains("warn"), "{}", filter);
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let filter = log_filter(true, false, Some("boostrun=loud")).unwrap().to_string();
        assert_eq!(filter, "boostrun=debug");
    }

    #[test]
    fn test_debug_flag_reaches_filter() {
        let cli = Cli::try_parse_from([
            "boostrun", "train-ensemble", "--data-root", "/data", "--bucket", "m1", "--debug",
        ])
        .unwrap();
        assert!(cli.command.job().common().debug);
    }
}
