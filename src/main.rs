use anyhow::{bail, Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use finance_migration::{
    logging, report, EntityStore, MappingRequest, MigrationConfig, MigrationService, SqliteStore,
};

const DEFAULT_DB: &str = "migration.db";

/// Parsed `import` arguments.
struct ImportArgs {
    request: PathBuf,
    owner: Option<String>,
    db: PathBuf,
    report: Option<PathBuf>,
    csv: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 && args[1] == "import" {
        let import = parse_import(&args[2..])?;
        run_import(import).await?;
    } else {
        print_usage();
    }

    Ok(())
}

fn print_usage() {
    println!("finance-migration {}", finance_migration::VERSION);
    println!();
    println!("Usage:");
    println!("  finance-migration import <request.json> [--owner <id>] [--db <path>]");
    println!("                           [--report <out.json>] [--csv <out.csv>]");
    println!();
    println!("Environment:");
    println!("  FINANCE_MIGRATION_LOG         tracing filter (default finance_migration=info)");
    println!("  FINANCE_MIGRATION_LOG_JSON=1  JSON log lines");
    println!("  FINANCE_MIGRATION_*           batch sizes, workers, retries (see config)");
}

fn parse_import(args: &[String]) -> Result<ImportArgs> {
    let mut request = None;
    let mut owner = None;
    let mut db = PathBuf::from(DEFAULT_DB);
    let mut report = None;
    let mut csv = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{} needs a value", flag))
        };
        match arg.as_str() {
            "--owner" => owner = Some(value("--owner")?),
            "--db" => db = PathBuf::from(value("--db")?),
            "--report" => report = Some(PathBuf::from(value("--report")?)),
            "--csv" => csv = Some(PathBuf::from(value("--csv")?)),
            flag if flag.starts_with("--") => bail!("unknown option {}", flag),
            path if request.is_none() => request = Some(PathBuf::from(path)),
            extra => bail!("unexpected argument {}", extra),
        }
    }

    Ok(ImportArgs {
        request: request.context("missing <request.json>")?,
        owner,
        db,
        report,
        csv,
    })
}

fn load_request(path: &Path) -> Result<MappingRequest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let request: MappingRequest = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse mapping request {}", path.display()))?;
    Ok(request)
}

async fn run_import(args: ImportArgs) -> Result<()> {
    println!("🔁 Finance Migration - Mapping Request → SQLite");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // 1. Load request
    println!("\n📂 Loading request...");
    let request = load_request(&args.request)?;
    println!(
        "✓ Loaded {} groups, {} records",
        request.mappings.len(),
        request.total_items()
    );

    // 2. Open store
    println!("\n🔧 Opening database...");
    let store: Arc<dyn EntityStore> = Arc::new(SqliteStore::open(&args.db)?);
    println!("✓ Database ready at {} (WAL mode)", args.db.display());

    // 3. Map
    println!("\n💾 Migrating...");
    let service = MigrationService::start(store, MigrationConfig::from_env());
    let result = service
        .map_request(args.owner.as_deref(), request)
        .await
        .context("Migration did not complete")?;

    // 4. Report
    if let Some(path) = &args.report {
        report::export_json(path, &result)?;
        println!("✓ JSON report written to {}", path.display());
    }
    if let Some(path) = &args.csv {
        report::export_csv(path, &result)?;
        println!("✓ CSV report written to {}", path.display());
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if result.success {
        println!("🎉 Migration COMPLETE!");
    } else {
        println!("⚠️  Migration finished with failures");
    }
    println!("✓ {}", result.summary());
    for warning in &result.warnings {
        println!("  ⚠️  {}: {}", warning.entity_id, warning.message);
    }

    Ok(())
}
