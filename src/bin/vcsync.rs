use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use variant_catalog_sync::app::App;
use variant_catalog_sync::catalog::{
    CatalogClient, CatalogCohort, CatalogFile, CatalogHttpClient, CatalogJob, CatalogProject,
    CatalogSample, PageRequest, SampleIndexDoc,
};
use variant_catalog_sync::config::{ConfigLoader, ResolvedConfig};
use variant_catalog_sync::domain::{CohortStatus, EntityKind, IndexStatus, StudyName};
use variant_catalog_sync::error::SyncError;
use variant_catalog_sync::output::{HumanOutput, JsonOutput, OutputMode};
use variant_catalog_sync::store::MetadataStore;

#[derive(Parser)]
#[command(name = "vcsync")]
#[command(about = "Keep an entity catalog in step with the variant storage metadata store")]
#[command(version, author)]
struct Cli {
    /// Path to vcsync.json; defaults to ./vcsync.json when present.
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Reconcile the catalog against storage")]
    Sync(SyncArgs),
    #[command(about = "List studies registered in storage")]
    Studies,
    #[command(about = "Dump storage records of one kind for a study")]
    Inspect(InspectArgs),
    #[command(about = "Project-level metadata")]
    Project(ProjectArgs),
}

#[derive(Args)]
struct SyncArgs {
    #[command(subcommand)]
    command: SyncCommand,
}

#[derive(Subcommand)]
enum SyncCommand {
    #[command(about = "Files, samples and cohorts of one study")]
    Study(StudySyncArgs),
    #[command(about = "File index statuses of one study")]
    Files(StudyArg),
    #[command(about = "Sample index statuses of one study")]
    Samples(StudyArg),
    #[command(about = "Cohort membership and statuses of one study")]
    Cohorts(StudyArg),
    #[command(about = "Every study in storage")]
    All,
    #[command(about = "Reset the catalog side of a study removed from storage")]
    Removed(RemovedArgs),
}

#[derive(Args)]
struct StudySyncArgs {
    study: String,

    /// Restrict the pass to these files and their samples.
    #[arg(long = "file")]
    files: Vec<String>,
}

#[derive(Args)]
struct StudyArg {
    study: String,
}

#[derive(Args)]
struct RemovedArgs {
    /// Catalog study identifier.
    study: String,
}

#[derive(Args)]
struct InspectArgs {
    study: String,

    #[arg(long, value_enum)]
    kind: EntityKind,
}

#[derive(Args)]
struct ProjectArgs {
    #[command(subcommand)]
    command: ProjectCommand,
}

#[derive(Subcommand)]
enum ProjectCommand {
    #[command(about = "Copy organism, assembly and release from the catalog project")]
    Organism(OrganismArgs),
}

#[derive(Args)]
struct OrganismArgs {
    #[arg(long)]
    catalog_project: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::StudyNotFound(_)
        | SyncError::FileNotFound { .. }
        | SyncError::SampleNotFound { .. }
        | SyncError::CohortNotFound { .. }
        | SyncError::TaskNotFound { .. } => 2,
        SyncError::MissingConfig
        | SyncError::ConfigRead(_)
        | SyncError::ConfigParse(_)
        | SyncError::InvalidConfig(_)
        | SyncError::MissingOrganism => 2,
        SyncError::CatalogHttp(_)
        | SyncError::CatalogStatus { .. }
        | SyncError::CatalogNotFound(_)
        | SyncError::LockTimeout { .. }
        | SyncError::LockLost { .. }
        | SyncError::DeadlineExceeded(_) => 3,
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
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let config = ConfigLoader::resolve_or_default(cli.config.as_deref())?;
    info!("metadata store at {}", config.store_path);
    let store = Arc::new(MetadataStore::open(&config.store_path, config.store_options())?);

    match cli.command {
        Commands::Sync(args) => {
            let app = App::new(store, catalog_client(&config)?, &config);
            run_sync(args.command, &app, output_mode)
        }
        Commands::Studies => {
            let app = App::new(store, NoCatalog, &config);
            let result = app.studies()?;
            print(output_mode, || JsonOutput::print_studies(&result), || {
                HumanOutput::print_studies(&result)
            })
        }
        Commands::Inspect(args) => {
            let app = App::new(store, NoCatalog, &config);
            let study: StudyName = args.study.parse()?;
            let result = app.inspect(&study, args.kind)?;
            // Records are printed as JSON in both modes.
            print(OutputMode::Json, || JsonOutput::print_inspect(&result), || Ok(()))
        }
        Commands::Project(args) => match args.command {
            ProjectCommand::Organism(args) => {
                let app = App::new(store, catalog_client(&config)?, &config);
                let result = app.project_organism(&args.catalog_project)?;
                print(output_mode, || JsonOutput::print_project(&result), || {
                    HumanOutput::print_project(&result)
                })
            }
        },
    }
}

fn run_sync<C: CatalogClient>(
    command: SyncCommand,
    app: &App<C>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let result = match command {
        SyncCommand::Study(args) => app.sync_study(&args.study.parse::<StudyName>()?, &args.files)?,
        SyncCommand::Files(args) => app.sync_files(&args.study.parse::<StudyName>()?)?,
        SyncCommand::Samples(args) => app.sync_samples(&args.study.parse::<StudyName>()?)?,
        SyncCommand::Cohorts(args) => app.sync_cohorts(&args.study.parse::<StudyName>()?)?,
        SyncCommand::All => app.sync_all()?,
        SyncCommand::Removed(args) => app.sync_removed(&args.study)?,
    };
    print(output_mode, || JsonOutput::print_sync(&result), || {
        HumanOutput::print_sync(&result)
    })
}

fn print(
    output_mode: OutputMode,
    json: impl FnOnce() -> std::io::Result<()>,
    human: impl FnOnce() -> std::io::Result<()>,
) -> miette::Result<()> {
    let written = match output_mode {
        OutputMode::Json => json(),
        OutputMode::Human => human(),
    };
    written.map_err(|err| miette::Report::msg(format!("failed to write output: {err}")))
}

fn catalog_client(config: &ResolvedConfig) -> Result<CatalogHttpClient, SyncError> {
    let catalog = config.catalog.as_ref().ok_or_else(|| {
        SyncError::InvalidConfig("catalog.base_url is required for this command".to_string())
    })?;
    CatalogHttpClient::new(&catalog.base_url, catalog.token.as_deref())
}

/// Stand-in for commands that only read storage.
struct NoCatalog;

fn offline() -> SyncError {
    SyncError::InvalidConfig("no catalog available for this command".to_string())
}

impl CatalogClient for NoCatalog {
    fn files_by_uri(&self, _: &str, _: &[String]) -> Result<Vec<CatalogFile>, SyncError> {
        Err(offline())
    }

    fn files_by_index_status(
        &self,
        _: &str,
        _: &[IndexStatus],
        _: PageRequest,
    ) -> Result<Vec<CatalogFile>, SyncError> {
        Err(offline())
    }

    fn update_file_index_status(
        &self,
        _: &str,
        _: &str,
        _: IndexStatus,
        _: &str,
    ) -> Result<(), SyncError> {
        Err(offline())
    }

    fn update_file_annotation_index(&self, _: &str, _: &str, _: IndexStatus) -> Result<(), SyncError> {
        Err(offline())
    }

    fn update_file_secondary_annotation_index(
        &self,
        _: &str,
        _: &str,
        _: IndexStatus,
    ) -> Result<(), SyncError> {
        Err(offline())
    }

    fn rederive_file_metadata(&self, _: &str, _: &str) -> Result<(), SyncError> {
        Err(offline())
    }

    fn samples(&self, _: &str, _: &[String]) -> Result<Vec<CatalogSample>, SyncError> {
        Err(offline())
    }

    fn update_sample_index(&self, _: &str, _: &str, _: IndexStatus) -> Result<(), SyncError> {
        Err(offline())
    }

    fn update_sample_annotation_index(&self, _: &str, _: &str, _: IndexStatus) -> Result<(), SyncError> {
        Err(offline())
    }

    fn update_sample_secondary_annotation_index(
        &self,
        _: &str,
        _: &str,
        _: IndexStatus,
    ) -> Result<(), SyncError> {
        Err(offline())
    }

    fn update_sample_secondary_sample_index(
        &self,
        _: &str,
        _: &str,
        _: &SampleIndexDoc,
    ) -> Result<(), SyncError> {
        Err(offline())
    }

    fn cohort(&self, _: &str, _: &str) -> Result<Option<CatalogCohort>, SyncError> {
        Err(offline())
    }

    fn cohorts(&self, _: &str, _: &[String]) -> Result<Vec<CatalogCohort>, SyncError> {
        Err(offline())
    }

    fn set_cohort_status(&self, _: &str, _: &str, _: CohortStatus, _: &str) -> Result<(), SyncError> {
        Err(offline())
    }

    fn set_cohort_samples(&self, _: &str, _: &str, _: &[String]) -> Result<(), SyncError> {
        Err(offline())
    }

    fn running_jobs(&self, _: &str, _: &str, _: &str) -> Result<Vec<CatalogJob>, SyncError> {
        Err(offline())
    }

    fn project(&self, _: &str) -> Result<CatalogProject, SyncError> {
        Err(offline())
    }
}
