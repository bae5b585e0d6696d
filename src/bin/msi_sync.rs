use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use msi_sync::app::{App, ProgressSink, SyncResult};
use msi_sync::config::{ConfigLoader, ResolvedConfig};
use msi_sync::domain::DataSourceKey;
use msi_sync::error::SyncError;
use msi_sync::output::{JsonOutput, OutputMode, StderrProgress};
use msi_sync::query::{FilterParameter, Query, SortParameter};
use msi_sync::source::DataSource;

#[derive(Parser)]
#[command(name = "msi-sync")]
#[command(about = "Keep a local copy of maritime safety information feeds in sync")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Path to msi-sync.json (defaults to ./msi-sync.json when present).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Refresh data sources from the remote service")]
    Sync(SyncArgs),
    #[command(about = "List stored records of one data source")]
    List(ListArgs),
    #[command(about = "Show record counts and last sync per data source")]
    Status,
    #[command(about = "Download an electronic publication")]
    Download(DownloadArgs),
}

#[derive(Args)]
struct SyncArgs {
    /// Sources to refresh; all configured sources when omitted.
    sources: Vec<String>,

    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct ListArgs {
    source: String,

    /// `field<op>value`, with op one of = != > >= < <= ~
    #[arg(long = "filter")]
    filters: Vec<String>,

    /// `field`, `field:asc` or `field:desc`; replaces the default sort.
    #[arg(long = "sort")]
    sorts: Vec<String>,

    /// Group records under headers of the first sort field.
    #[arg(long)]
    sections: bool,

    #[arg(long, default_value_t = 1)]
    pages: usize,
}

#[derive(Args)]
struct DownloadArgs {
    key: String,

    /// File name inside the download directory.
    #[arg(long)]
    output: Option<String>,
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
        SyncError::UnknownDataSource(_)
        | SyncError::MissingConfig
        | SyncError::ConfigRead(_)
        | SyncError::ConfigParse(_) => 2,
        error if error.is_remote() => 3,
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

    let config = ConfigLoader::resolve_or_default(cli.config.as_deref())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;
    runtime.block_on(run_command(cli.command, config, output_mode))
}

async fn run_command(
    command: Commands,
    config: ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let app = App::open(config)?;
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Interactive => &StderrProgress,
        OutputMode::NonInteractive => &JsonOutput,
    };
    match command {
        Commands::Sync(args) => run_sync(&app, args, sink).await,
        Commands::List(args) => run_list(&app, args).await,
        Commands::Status => {
            let result = app.status().await?;
            JsonOutput::print_status(&result).into_diagnostic()
        }
        Commands::Download(args) => {
            let result = app
                .download(&args.key, args.output.as_deref(), sink)
                .await?;
            JsonOutput::print_download(&result).into_diagnostic()
        }
    }
}

async fn run_sync(app: &App, args: SyncArgs, sink: &dyn ProgressSink) -> miette::Result<()> {
    if args.sources.is_empty() {
        let result = app.refresh_all(args.force, sink).await;
        JsonOutput::print_sync(&result).into_diagnostic()?;
        let failed = result.failures().count();
        if failed > 0 {
            return Err(miette::Report::msg(format!(
                "{failed} of {} sources failed to refresh",
                result.items.len()
            )));
        }
        return Ok(());
    }

    let mut items = Vec::new();
    for source in &args.sources {
        let key: DataSourceKey = source.parse()?;
        items.push(app.refresh(&key, args.force, sink).await?);
    }
    JsonOutput::print_sync(&SyncResult { items }).into_diagnostic()
}

async fn run_list(app: &App, args: ListArgs) -> miette::Result<()> {
    let key: DataSourceKey = args.source.parse()?;
    let source = app.config().source(&key)?;
    let query = list_query(source, &args)?;
    let result = app.list(query, args.pages).await?;
    JsonOutput::print_list(&result).into_diagnostic()
}

/// The source's default query with the `--sort`, `--sections` and
/// `--filter` overrides applied.
fn list_query(source: &DataSource, args: &ListArgs) -> Result<Query, SyncError> {
    let mut query = source.default_query();
    if !args.sorts.is_empty() {
        query.sort = args
            .sorts
            .iter()
            .map(|value| value.parse::<SortParameter>())
            .collect::<Result<Vec<_>, SyncError>>()?;
    }
    if args.sections {
        let first = query.sort.first_mut().ok_or_else(|| {
            SyncError::InvalidSort(format!("--sections needs a sort field for {}", source.key))
        })?;
        first.section = true;
    }
    for expression in &args.filters {
        query.filter.push(FilterParameter::parse(expression, |field| {
            source.field_kind(field)
        })?);
    }
    query.validate()?;
    Ok(query)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use msi_sync::source::find;

    fn args(sorts: &[&str], sections: bool) -> ListArgs {
        ListArgs {
            source: "modu".to_string(),
            filters: Vec::new(),
            sorts: sorts.iter().map(|sort| sort.to_string()).collect(),
            sections,
            pages: 1,
        }
    }

    #[test]
    fn sections_flag_applies_to_the_default_sort() {
        let mut modu = find(&"modu".parse().unwrap()).unwrap();
        for entry in &mut modu.default_sort {
            entry.section = false;
        }
        let query = list_query(&modu, &args(&[], true)).unwrap();
        assert_eq!(query.section_field(), Some("date"));

        let query = list_query(&modu, &args(&[], false)).unwrap();
        assert_eq!(query.section_field(), None);
    }

    #[test]
    fn sections_flag_applies_to_an_explicit_sort() {
        let modu = find(&"modu".parse().unwrap()).unwrap();
        let query = list_query(&modu, &args(&["rigStatus", "date:desc"], true)).unwrap();
        assert_eq!(query.section_field(), Some("rigStatus"));
        assert!(!query.sort[1].section);
    }

    #[test]
    fn sections_flag_without_any_sort_is_rejected() {
        let mut modu = find(&"modu".parse().unwrap()).unwrap();
        modu.default_sort.clear();
        assert_matches!(
            list_query(&modu, &args(&[], true)),
            Err(SyncError::InvalidSort(_))
        );
    }
}
