use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use bvbrc_fetch::app::{self, App, TableOptions};
use bvbrc_fetch::config::{ConfigLoader, Settings};
use bvbrc_fetch::domain::{
    ArtifactKind, ArtifactSelection, BatchItem, GenomeId, REMOTE_AMR_PHENOTYPES,
    REMOTE_GENOME_METADATA,
};
use bvbrc_fetch::error::FetchError;
use bvbrc_fetch::output::{JsonOutput, LogSink, OutputMode, describe_process};
use bvbrc_fetch::process::ExternalCommand;
use bvbrc_fetch::progress::CancelFlag;
use bvbrc_fetch::tui::Tui;

const DEFAULT_VIEW_ROWS: usize = 20;

#[derive(Parser)]
#[command(name = "bvbrc-fetch")]
#[command(about = "Download BV-BRC genome data over FTP and browse metadata tables")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download one remote file")]
    File(FileArgs),
    #[command(about = "Download the genome metadata table")]
    Metadata(DirArgs),
    #[command(about = "Download the AMR phenotype table")]
    Amr(DirArgs),
    #[command(about = "Download contigs and/or features for genomes")]
    Genomes(GenomesArgs),
    #[command(about = "Show the last-modified time of a remote file")]
    Modified(ModifiedArgs),
    #[command(about = "Browse a TSV table")]
    Browse(BrowseArgs),
    #[command(about = "Run an external tool and stream its output")]
    Run(RunArgs),
}

#[derive(Args)]
struct FileArgs {
    remote: String,

    #[arg(long)]
    dir: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct DirArgs {
    #[arg(long)]
    dir: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct GenomesArgs {
    #[arg(long = "id", conflicts_with = "list")]
    ids: Vec<String>,

    #[arg(long)]
    list: Option<Utf8PathBuf>,

    #[arg(long)]
    contigs: bool,

    #[arg(long)]
    features: bool,

    #[arg(long)]
    dir: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct ModifiedArgs {
    remote: String,
}

#[derive(Args)]
struct BrowseArgs {
    path: Utf8PathBuf,

    #[arg(long, default_value_t = DEFAULT_VIEW_ROWS)]
    rows: usize,

    /// Column to sort by; repeat for secondary keys.
    #[arg(long)]
    sort: Vec<String>,

    /// `COLUMN=TEXT`, case-insensitive substring match.
    #[arg(long)]
    filter: Option<String>,

    #[arg(long)]
    export: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    program: String,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    #[arg(long)]
    cwd: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<FetchError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &FetchError) -> u8 {
    match error {
        FetchError::InvalidGenomeId(_)
        | FetchError::InvalidArtifactKind(_)
        | FetchError::ConfigRead(_)
        | FetchError::ConfigParse(_)
        | FetchError::TableParse { .. }
        | FetchError::MissingColumn(_) => 2,
        FetchError::Connection { .. }
        | FetchError::SizeUnknown(_)
        | FetchError::Protocol { .. }
        | FetchError::SizeMismatch { .. }
        | FetchError::Process(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let Some(command) = cli.command else {
        return Err(miette::Report::msg(
            "command required (try `bvbrc-fetch --help`)",
        ));
    };
    let settings = ConfigLoader::resolve(cli.config.as_deref())?;

    match command {
        Commands::File(args) => run_file(&settings, args.remote, args.dir, output_mode),
        Commands::Metadata(args) => {
            run_file(&settings, REMOTE_GENOME_METADATA.to_string(), args.dir, output_mode)
        }
        Commands::Amr(args) => {
            run_file(&settings, REMOTE_AMR_PHENOTYPES.to_string(), args.dir, output_mode)
        }
        Commands::Genomes(args) => run_genomes(&settings, args, output_mode),
        Commands::Modified(args) => {
            let app = App::from_settings(&settings);
            let result = app.last_modified(&args.remote)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_modified(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    println!("{}  {}", result.modified, result.remote);
                    Ok(())
                }
            }
        }
        Commands::Browse(args) => run_browse(args, output_mode),
        Commands::Run(args) => run_program(&settings, args, output_mode),
    }
}

fn run_file(
    settings: &Settings,
    remote: String,
    dir: Option<Utf8PathBuf>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let app = App::from_settings(settings);
    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.fetch_file(&remote, dir.as_deref(), &CancelFlag::new(), &LogSink)?;
            JsonOutput::print_file(&result).into_diagnostic()
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(format!("Fetching {remote}"));
            let result = tui.run(move |cancel, sink| {
                app.fetch_file(&remote, dir.as_deref(), cancel, sink)
            })?;
            match &result.path {
                Some(path) => println!("Saved {} ({} bytes)", path, result.bytes),
                None => println!("Download of {} cancelled", result.remote),
            }
            Ok(())
        }
    }
}

fn run_genomes(
    settings: &Settings,
    args: GenomesArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let items = match (&args.list, args.ids.is_empty()) {
        (Some(list), _) => app::load_batch_items(list.as_std_path())?,
        (None, false) => args
            .ids
            .iter()
            .map(|id| id.parse::<GenomeId>().map(BatchItem::from_id))
            .collect::<Result<Vec<_>, _>>()?,
        (None, true) => {
            return Err(miette::Report::msg("genomes requires --id or --list"));
        }
    };

    let mut kinds = Vec::new();
    if args.contigs {
        kinds.push(ArtifactKind::Contigs);
    }
    if args.features {
        kinds.push(ArtifactKind::Features);
    }
    let selection = ArtifactSelection::from_kinds(&kinds);
    let app = App::from_settings(settings);
    let root = args.dir;

    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.fetch_genomes(
                &items,
                selection,
                root.as_deref(),
                &CancelFlag::new(),
                &LogSink,
            )?;
            JsonOutput::print_batch(&result).into_diagnostic()
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(format!("Fetching {} genomes", items.len()));
            let result = tui.run(move |cancel, sink| {
                app.fetch_genomes(&items, selection, root.as_deref(), cancel, sink)
            })?;
            println!(
                "{} of {} artifacts saved under {}",
                result.completed.len(),
                result.total,
                result.root
            );
            for failure in &result.failed {
                println!("  failed {} {}: {}", failure.id, failure.kind, failure.error);
            }
            for manifest in &result.manifests {
                println!("  manifest {manifest}");
            }
            if result.cancelled {
                println!("Batch cancelled");
            }
            Ok(())
        }
    }
}

fn run_browse(args: BrowseArgs, output_mode: OutputMode) -> miette::Result<()> {
    let filter = args
        .filter
        .as_deref()
        .map(|raw| {
            raw.split_once('=')
                .map(|(column, needle)| (column.to_string(), needle.to_string()))
                .ok_or_else(|| miette::Report::msg("--filter expects COLUMN=TEXT"))
        })
        .transpose()?;
    let options = TableOptions {
        capacity: args.rows,
        sort: args.sort,
        filter,
    };
    let mut table = app::open_table(&args.path, &options)?;

    match output_mode {
        OutputMode::NonInteractive => {
            if let Some(path) = &args.export {
                let result = table.export(path)?;
                return JsonOutput::print_export(&result).into_diagnostic();
            }
            JsonOutput::print_table(&table.snapshot()).into_diagnostic()
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(args.path.to_string());
            tui.browse(&mut table, args.export.as_deref())
        }
    }
}

fn run_program(settings: &Settings, args: RunArgs, output_mode: OutputMode) -> miette::Result<()> {
    let mut command = ExternalCommand::new(args.program).args(args.args);
    if let Some(dir) = args.cwd {
        command = command.current_dir(dir);
    }
    let app = App::from_settings(settings);

    let result = match output_mode {
        OutputMode::NonInteractive => app.run_program(&command, &CancelFlag::new(), &LogSink)?,
        OutputMode::Interactive => {
            let mut tui = Tui::new(format!("Running {}", command.program()));
            tui.run(move |cancel, sink| app.run_program(&command, cancel, sink))?
        }
    };
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_process(&result).into_diagnostic(),
        OutputMode::Interactive => {
            println!("{}", describe_process(&result.outcome));
            Ok(())
        }
    }
}
