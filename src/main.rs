// ========================================================================================
//
//                          Command-line front end for xdeconv
//
// ========================================================================================
//
// Reads an observation table and a starting mixture, runs the fit through the library
// driver and writes the fitted mixture back out. All numerical work lives in the
// library; this file only wires files, options, logging and progress together.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use xdeconv::config::FitOptions;
use xdeconv::diagnostics::DiagnosticLog;
use xdeconv::interface::data::load_observations;
use xdeconv::interface::model::MixtureFile;
use xdeconv::progress::{FitObserver, FitPhase};
use xdeconv::splitmerge::SmemRanker;
use xdeconv::{FitStatus, fit_with};

#[derive(Parser)]
#[command(
    name = "xdeconv",
    version,
    about = "Fit Gaussian mixture densities to noisy, projected observations"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a mixture model with extreme deconvolution
    #[command(about = "Fit a mixture model (outputs: fitted model TOML)")]
    Fit(FitArgs),

    /// Evaluate the average log-likelihood of a model without fitting
    #[command(about = "Print the average log-likelihood of the data under a model")]
    Loglike(LoglikeArgs),
}

#[derive(Args)]
struct FitArgs {
    /// Observation table (TSV with y1.., var1.. or cov{r}_{c}, optional proj{r}_{c} and weight columns)
    #[arg(long, value_name = "PATH")]
    data: PathBuf,

    /// Starting mixture model (TOML)
    #[arg(long, value_name = "PATH")]
    model: PathBuf,

    /// Where to write the fitted mixture model
    #[arg(long, value_name = "PATH")]
    out: PathBuf,

    /// Fit options file (TOML); command-line flags take precedence
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Convergence tolerance on the average log-likelihood
    #[arg(long)]
    tol: Option<f64>,

    /// Maximum number of EM iterations
    #[arg(long)]
    maxiter: Option<usize>,

    /// Covariance regularization added to the diagonal
    #[arg(long)]
    w: Option<f64>,

    /// Number of split-and-merge trials per round
    #[arg(long, conflicts_with = "maxsnm")]
    splitnmerge: Option<usize>,

    /// Try every split-and-merge triple, K(K-1)(K-2)/2 per round
    #[arg(long)]
    maxsnm: bool,

    /// Basename for the diagnostic logs (<BASE>_c.log and <BASE>_loglike.log)
    #[arg(long, value_name = "BASE")]
    logfile: Option<String>,

    /// Seed for split-and-merge perturbations
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args)]
struct LoglikeArgs {
    /// Observation table (TSV)
    #[arg(long, value_name = "PATH")]
    data: PathBuf,

    /// Mixture model (TOML)
    #[arg(long, value_name = "PATH")]
    model: PathBuf,
}

/// Reports EM progress on a spinner; hidden when stderr is not a terminal.
struct SpinnerObserver {
    bar: ProgressBar,
}

impl SpinnerObserver {
    fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(None, draw_target);
        if let Ok(style) = ProgressStyle::with_template("> [{elapsed_precise}] {spinner} {msg}") {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }
}

impl FitObserver for SpinnerObserver {
    fn on_iteration(&mut self, phase: FitPhase, iteration: usize, avg_log_like: f64) {
        self.bar.set_message(format!(
            "{phase} iteration {iteration}: average log-likelihood {avg_log_like:.6}"
        ));
    }

    fn on_split_merge_trial(&mut self, merge: (usize, usize), split: usize, accepted: bool) {
        if accepted {
            self.bar.println(format!(
                "Accepted split-and-merge trial: merged {} and {}, split {split}",
                merge.0, merge.1
            ));
        }
    }

    fn on_finish(&mut self, avg_log_like: f64) {
        self.bar
            .finish_with_message(format!("done, average log-likelihood {avg_log_like:.6}"));
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fit(args) => run_fit(args),
        Commands::Loglike(args) => run_loglike(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_fit(args: FitArgs) -> Result<(), Box<dyn Error>> {
    let mut options = match &args.config {
        Some(path) => FitOptions::load(path)?,
        None => FitOptions::default(),
    };
    if let Some(tol) = args.tol {
        options.tol = tol;
    }
    if let Some(max_iter) = args.maxiter {
        options.max_iter = max_iter;
    }
    if let Some(w) = args.w {
        options.regularization = w;
    }
    if let Some(trials) = args.splitnmerge {
        options.split_and_merge = trials;
        options.max_split_and_merge = false;
    }
    if args.maxsnm {
        options.max_split_and_merge = true;
    }
    if let Some(seed) = args.seed {
        options.seed = seed;
    }
    if let Some(base) = &args.logfile {
        options = options.with_log_basename(base);
    }
    options.validate()?;

    let mut log = DiagnosticLog::open(options.log_file.as_deref(), options.trace_file.as_deref())?;
    let dataset = load_observations(&args.data)?;
    let (mut mixture, fixed) = MixtureFile::load(&args.model)?.into_parts()?;

    let mut observer = SpinnerObserver::new();
    let report = fit_with(
        &dataset,
        &mut mixture,
        &fixed,
        &options,
        &SmemRanker,
        &mut log,
        &mut observer,
    )?;

    MixtureFile::from_mixture(&mixture, &fixed).save(&args.out)?;
    if report.status == FitStatus::MaxIterReached {
        log::warn!("The iteration limit was reached before convergence.");
    }
    if !report.collapsed.is_empty() {
        log::warn!("Collapsed components: {:?}", report.collapsed);
    }
    println!(
        "Average log-likelihood {:.10} after {} iterations ({} of {} split-and-merge trials kept). Model written to {}",
        report.avg_log_like,
        report.iterations,
        report.accepted_trials,
        report.attempted_trials,
        args.out.display()
    );
    Ok(())
}

fn run_loglike(args: LoglikeArgs) -> Result<(), Box<dyn Error>> {
    let dataset = load_observations(&args.data)?;
    let (mut mixture, fixed) = MixtureFile::load(&args.model)?.into_parts()?;
    let options = FitOptions {
        likelihood_only: true,
        ..FitOptions::default()
    };
    let report = xdeconv::fit(&dataset, &mut mixture, &fixed, &options)?;
    println!("{:.10}", report.avg_log_like);
    Ok(())
}
