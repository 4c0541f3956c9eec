use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use datacensus::assistant::Assistant;
use datacensus::config::AppConfig;
use datacensus::export::{self, ExportFormat};
use datacensus::filter::{self, DemographicFilter, FilterCriteria, GeographicFilter, Selection, SexFilter};
use datacensus::normalize::Normalizer;
use datacensus::processing::{self, GroupOrder};
use datacensus::render::{ChartKind, ChartOptions};
use datacensus::session::{self, IdentityProvider, LocalIdentityProvider, RolePolicy, SessionCache};
use datacensus::state::ChartData;
use datacensus::storage::{self, DatasetCatalog, LocalBlobStore};
use datacensus::types::{CensusRecord, GroupKey};
use datacensus::{data, server};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print headline totals and per-region population
    Summary {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Read this spreadsheet instead of the latest uploaded dataset
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,
    },
    /// Export the (optionally filtered) dataset or its charts
    Export {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,
        /// csv, xlsx, png or pdf
        #[arg(short, long, default_value = "csv")]
        format: String,
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
        /// pyramid, region or age (png/pdf only)
        #[arg(long)]
        chart: Option<String>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        comuna: Option<String>,
        #[arg(long)]
        age_group: Option<String>,
        /// H or M
        #[arg(long)]
        sex: Option<String>,
    },
    /// Store a spreadsheet and register it in the dataset catalog
    Upload {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        file: PathBuf,
        /// Recorded as the uploader; defaults to the signed-in user
        #[arg(long)]
        by: Option<String>,
    },
    /// Send a question to the assistant webhook
    Ask {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        query: String,
    },
    /// Sign in and remember the user locally
    Login {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        email: String,
        password: String,
    },
    /// Forget the locally remembered user
    Logout {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Serve the dashboard API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Summary { config, input } => {
            let app_config = AppConfig::load_from_file(&config)?;
            let records = load_records(&app_config, input.as_deref()).await?;

            let stats = processing::summarize(&records);
            println!("Registros:        {}", records.len());
            println!("Población total:  {}", stats.total);
            println!("Hombres:          {}", stats.male_total);
            println!("Mujeres:          {}", stats.female_total);
            println!("Razón H/M:        {}", stats.sex_ratio);
            println!();
            for (region, total) in processing::group_totals(&records, GroupKey::Region, GroupOrder::Sorted) {
                println!("  {:<40} {}", region, total);
            }
        }
        Commands::Export { config, input, format, output, chart, region, comuna, age_group, sex } => {
            let app_config = AppConfig::load_from_file(&config)?;
            let format: ExportFormat = format.parse()?;
            let chart = chart
                .map(|c| parse_chart_kind(&c))
                .transpose()?;
            let records = load_records(&app_config, input.as_deref()).await?;

            let criteria = criteria_from_args(region, comuna, age_group, sex.as_deref())?;
            let active = filter::apply(&records, &criteria);
            info!(rows = active.len(), of = records.len(), "filtered rows for export");

            let bytes = match format {
                ExportFormat::Csv => export::to_csv(&active)?,
                ExportFormat::Xlsx => export::to_xlsx(&active)?,
                ExportFormat::Png => {
                    let charts = chart_data(&active);
                    export::to_png(chart.unwrap_or(ChartKind::Pyramid), &charts, ChartOptions::default())?
                }
                ExportFormat::Pdf => {
                    let charts = chart_data(&active);
                    let kinds = chart.map(|k| vec![k]).unwrap_or_else(|| ChartKind::ALL.to_vec());
                    export::to_pdf(&charts, &kinds, ChartOptions::default())?
                }
            };

            let output = output.unwrap_or_else(|| PathBuf::from(format.default_file_name()));
            std::fs::write(&output, bytes)
                .with_context(|| format!("Failed to write export: {:?}", output))?;
            println!("Exported {:?}", output);
        }
        Commands::Upload { config, file, by } => {
            let app_config = AppConfig::load_from_file(&config)?;
            let uploaded_by = by
                .or_else(|| SessionCache::new(&app_config.storage.session_cache).load().map(|u| u.email))
                .unwrap_or_else(|| "cli".to_string());

            let bytes = std::fs::read(&file).with_context(|| format!("Failed to read {:?}", file))?;
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("Invalid file name: {:?}", file))?;

            let store = LocalBlobStore::new(&app_config.storage.root);
            let catalog = DatasetCatalog::in_store(&store);
            let entry = storage::upload_dataset(&store, &catalog, name, &bytes, &uploaded_by)?;
            println!(
                "Archivo subido: {} ({})",
                entry.title,
                entry.description.as_deref().unwrap_or_default()
            );
        }
        Commands::Ask { config, query } => {
            let app_config = AppConfig::load_from_file(&config)?;
            let assistant = Assistant::from_config(&app_config.assistant)
                .map_err(|e| anyhow!("{}", e))?;
            match assistant.ask(&query).await {
                Ok(reply) => println!("{}", reply),
                Err(e) => {
                    tracing::error!(error = %e, "assistant failed");
                    println!("{}", e.user_message());
                }
            }
        }
        Commands::Login { config, email, password } => {
            let app_config = AppConfig::load_from_file(&config)?;
            let policy = RolePolicy::new(&app_config.auth.admin_emails);
            let idp = LocalIdentityProvider::new(&app_config.storage.users_file, policy);
            let session = idp.sign_in(&email, &password)?;
            SessionCache::new(&app_config.storage.session_cache).save(&session)?;
            println!(
                "Bienvenido, {} ({:?}); inicio: {:?}",
                session.claims.display_name,
                session.role,
                session::landing_page(&session)
            );
        }
        Commands::Logout { config } => {
            let app_config = AppConfig::load_from_file(&config)?;
            SessionCache::new(&app_config.storage.session_cache).clear()?;
            println!("Sesión cerrada");
        }
        Commands::Serve { config } => {
            info!("Serving dashboard with config: {:?}", config);
            let app_config = AppConfig::load_from_file(&config)?;
            server::start_server(app_config).await?;
        }
    }

    Ok(())
}

async fn load_records(config: &AppConfig, input: Option<&Path>) -> Result<Vec<CensusRecord>> {
    let normalizer = Normalizer::new(config.columns.clone());
    let records = match input {
        Some(path) => {
            let rows = data::load_rows(path)?;
            let (records, report) = normalizer.normalize(&rows);
            info!(rows = report.rows, repaired = report.repaired_cells(), "normalized {:?}", path);
            records
        }
        None => {
            let store = LocalBlobStore::new(&config.storage.root);
            let catalog = DatasetCatalog::in_store(&store);
            match storage::load_latest(&store, &catalog, &normalizer).await? {
                Some((_, records)) => records,
                None => bail!("No hay datasets registrados; use `upload` or pass --input"),
            }
        }
    };
    Ok(records)
}

fn parse_chart_kind(name: &str) -> Result<ChartKind> {
    match name.to_lowercase().as_str() {
        "pyramid" => Ok(ChartKind::Pyramid),
        "region" => Ok(ChartKind::Region),
        "age" => Ok(ChartKind::Age),
        other => Err(anyhow!("Unknown chart: {}", other)),
    }
}

fn criteria_from_args(
    region: Option<String>,
    comuna: Option<String>,
    age_group: Option<String>,
    sex: Option<&str>,
) -> Result<FilterCriteria> {
    let sex = match sex {
        None => SexFilter::All,
        Some(s) => serde_json::from_value(serde_json::Value::String(s.to_string()))
            .with_context(|| format!("Unknown sex filter: {}", s))?,
    };
    let geographic = GeographicFilter {
        region: Selection::or_sentinel(region, filter::ANY_PLACE),
        comuna: Selection::or_sentinel(comuna, filter::ANY_PLACE),
    };
    let demographic = DemographicFilter { age_group: Selection::or_sentinel(age_group, filter::ANY_AGE_GROUP), sex };
    Ok(FilterCriteria {
        geographic: (geographic != GeographicFilter::default()).then_some(geographic),
        demographic: (demographic != DemographicFilter::default()).then_some(demographic),
    })
}

fn chart_data(records: &[&CensusRecord]) -> ChartData {
    ChartData {
        pyramid: processing::population_pyramid(records),
        by_region: processing::group_totals(records, GroupKey::Region, GroupOrder::FirstSeen),
        by_age: processing::group_totals(records, GroupKey::AgeGroup, GroupOrder::FirstSeen),
    }
}
