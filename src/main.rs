//! hlmrf CLI: ground and solve hinge-loss Markov random fields.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use hlmrf::config::InferenceConfig;
use hlmrf::database::durable::FactArchive;
use hlmrf::database::{Database, loader};
use hlmrf::evaluation;
use hlmrf::inference::{Inference, write_tsv};
use hlmrf::model::{Model, ModelDocument};
use hlmrf::online::SessionEnd;

#[derive(Parser)]
#[command(name = "hlmrf", version, about = "Hinge-loss Markov random field inference")]
struct Cli {
    /// TOML inference config.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Worker threads for the parallel reasoners (0 = all cores).
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ground the model and print term counts per rule.
    Ground {
        /// Model document (JSON).
        #[arg(long)]
        model: PathBuf,
        /// Directory holding observations.tsv and targets.tsv.
        #[arg(long)]
        data: PathBuf,
    },

    /// Ground, optimize and write the inferred target values.
    Infer {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        data: PathBuf,
        /// Write inferred values here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Persist the facts, inferred values included, to a redb archive in this directory.
        #[arg(long)]
        db: Option<PathBuf>,
        /// Print the optimization report as JSON.
        #[arg(long)]
        json: bool,
        /// Ground lazily, activating targets as optimization raises them.
        #[arg(long)]
        lazy: bool,
        /// Score the inferred values against this truth file.
        #[arg(long)]
        truth: Option<PathBuf>,
    },

    /// Read online protocol commands from stdin.
    Online {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        data: PathBuf,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => InferenceConfig::load(path)?,
        None => InferenceConfig::default(),
    };
    if let Some(threads) = cli.threads {
        config.set_threads(threads);
    }
    tracing::debug!(config = %config.to_toml()?, "effective config");

    match cli.command {
        Commands::Ground { model, data } => {
            let (model, database) = load_problem(&model, &data)?;
            let inference = Inference::new(model, database, config)?;
            let (mut store, report) = inference.ground()?;
            println!("Ground {} terms from {} ground rules:", report.terms, report.ground_rules);
            for (rule, count) in &report.per_rule {
                println!("  {rule}: {count} terms  {}", inference.model().rule(*rule)?);
            }
            println!("  atoms: {}", inference.atoms().len());
            store.close()?;
        }

        Commands::Infer {
            model,
            data,
            output,
            db,
            json,
            lazy,
            truth,
        } => {
            let (model, database) = load_problem(&model, &data)?;
            let inference = Inference::new(model, database, config)?;
            let (optimization, targets) = if lazy {
                let report = inference.run_lazy()?;
                eprintln!("{report}");
                (report.optimization, report.targets)
            } else {
                let result = inference.run()?;
                (result.optimization, result.targets)
            };

            if json {
                let report = serde_json::to_string_pretty(&optimization).into_diagnostic()?;
                eprintln!("{report}");
            } else {
                eprintln!("{optimization}");
            }

            if let Some(path) = &truth {
                let truth = evaluation::load_truth(inference.model(), path)?;
                let scores = evaluation::evaluate(&targets, &truth, &inference.config().evaluation)?;
                if json {
                    eprintln!("{}", serde_json::to_string_pretty(&scores).into_diagnostic()?);
                } else {
                    eprintln!("{scores}");
                }
            }

            match &output {
                Some(path) => {
                    let file = std::fs::File::create(path).into_diagnostic()?;
                    write_tsv(inference.model(), &targets, std::io::BufWriter::new(file))?;
                    eprintln!("Wrote {} target values to {}", targets.len(), path.display());
                }
                None => write_tsv(inference.model(), &targets, std::io::stdout().lock())?,
            }

            if let Some(dir) = db {
                inference.commit(&targets)?;
                let archive = FactArchive::open(&dir)?;
                let saved = archive.save(inference.database(), inference.model())?;
                eprintln!("Persisted {saved} facts to {}", dir.display());
            }
        }

        Commands::Online { model, data } => {
            let (model, database) = load_problem(&model, &data)?;
            let mut session = Inference::new(model, database, config)?.into_online()?;
            let stdin = std::io::stdin();
            let end = session.run_session(stdin.lock(), std::io::stdout().lock())?;
            tracing::info!(?end, "online session finished");
            session.close()?;
            if end == SessionEnd::EndOfInput {
                eprintln!("End of input.");
            }
        }
    }

    Ok(())
}

/// Read the model document and its fact files.
fn load_problem(model: &Path, data: &Path) -> Result<(Model, Arc<Database>)> {
    let model = ModelDocument::load(model)?.build()?;
    let database = Database::new();
    let facts = loader::load_directory(&database, &model, data)?;
    tracing::info!(
        predicates = model.predicates().len(),
        rules = model.rules().count(),
        facts,
        "loaded problem"
    );
    Ok((model, Arc::new(database)))
}
