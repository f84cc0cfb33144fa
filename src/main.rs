use anyhow::Context;
use clap::{Parser, Subcommand};
use rdf_bulk_loader::{dump, sort::SpillThreshold, Loader, LoaderConfig};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    opts: Opts,
}

#[derive(Subcommand)]
enum Opts {
    /// Bulk load n-triples / n-quads files into a new store
    Load {
        /// Directory to create the store in; must not exist yet
        #[clap(short = 'l', long)]
        location: PathBuf,

        /// Files or directories to load. Directories are searched for .nt and .nq files
        #[clap(required = true)]
        inputs: Vec<PathBuf>,

        /// TOML file with loader settings
        #[clap(short = 'c', long)]
        config: Option<PathBuf>,

        /// Scope for blank node labels; defaults to the current time
        #[clap(long)]
        run_id: Option<String>,

        /// Spill sort buffers after this many records
        #[clap(long)]
        sort_records: Option<usize>,

        /// Directory for temporary sort runs
        #[clap(long)]
        spill_dir: Option<PathBuf>,

        /// Index block size in bytes
        #[clap(long)]
        block_size: Option<usize>,

        /// Do not write the statistics file
        #[clap(long)]
        no_stats: bool,
    },
    /// Write the statements of a store as n-triples / n-quads
    Dump {
        /// Store directory
        #[clap(short = 'l', long)]
        location: PathBuf,

        /// File to write to instead of stdout
        #[clap(short = 'o', long)]
        out_file: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.opts {
        Opts::Load { location, inputs, config, run_id, sort_records, spill_dir, block_size, no_stats } => {
            let mut config = match config {
                Some(path) => LoaderConfig::load(&path)?,
                None => LoaderConfig::default(),
            };

            if let Some(records) = sort_records {
                config.sort.threshold = SpillThreshold::Records(records);
            }
            if spill_dir.is_some() {
                config.sort.spill_dir = spill_dir;
            }
            if let Some(block_size) = block_size {
                config.index.block_size = block_size;
            }
            if no_stats {
                config.build.stats = false;
            }
            config.validate()?;

            let run_id = run_id.or_else(|| config.build.run_id.clone()).unwrap_or_else(|| {
                let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
                secs.to_string()
            });

            let summary = Loader::new(config, run_id)
                .load(&location, &inputs)
                .with_context(|| format!("failed to load into {}", location.display()))?;

            for index in &summary.indexes {
                tracing::debug!(order = %index.order, records = index.records, height = index.height, "index");
            }
            tracing::info!(
                files = summary.files,
                statements = summary.node_table.statements,
                terms = summary.node_table.terms,
                "loaded {} in {:.2} s",
                summary.location.display(),
                summary.elapsed.as_secs_f64(),
            );
        },
        Opts::Dump { location, out_file } => {
            let mut out: Box<dyn Write> = match out_file {
                Some(path) => Box::new(BufWriter::new(
                    File::options()
                        .write(true)
                        .create_new(true)
                        .open(&path)
                        .with_context(|| format!("cannot create {}", path.display()))?,
                )),
                None => Box::new(BufWriter::new(io::stdout().lock())),
            };

            let written = dump(&location, &mut out).with_context(|| format!("failed to dump {}", location.display()))?;
            out.flush()?;

            tracing::info!(statements = written, "dumped {}", location.display());
        },
    }

    Ok(())
}
