use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use loan_extract::{
    build_extractor, export_fields, load_fields, load_rules, default_rules, logging, validate,
    AppConfig, BatchEvent, BatchProcessor, CancelToken, DocType, DocumentFile, DocumentStore,
    ExportFormat, Queue, ReviewSession, Session, SqliteStore, ValidationReport, ValidationRule,
};

#[derive(Parser, Debug)]
#[command(name = "loan-extract", version, about = "Extract structured fields from loan documents")]
struct Cli {
    /// Config file (defaults to ./loan-extract.toml when present)
    #[arg(long, global = true, env = "LOAN_EXTRACT_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract one document and show the reviewed fields
    Extract {
        file: PathBuf,

        /// Pay Stub, Bank Statement, Tax Return, Loan Application, Other
        #[arg(long = "type", short = 't')]
        doc_type: DocType,

        /// Write extracted_data.<ext> into --out
        #[arg(long)]
        export: Option<ExportFormat>,

        #[arg(long, default_value = ".")]
        out: PathBuf,

        /// Store the document for the configured user
        #[arg(long)]
        save: bool,
    },

    /// Process several documents of one type, one at a time
    Batch {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long = "type", short = 't')]
        doc_type: DocType,
    },

    /// Validate a field list (.json or .csv)
    Validate {
        fields: PathBuf,

        /// JSON rule file (overrides config)
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Convert a field list to the JSON or CSV download format
    Export {
        fields: PathBuf,

        #[arg(long, short = 'f')]
        format: ExportFormat,

        /// Output file (stdout when omitted)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// List stored documents for the configured user
    Documents,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.debug);

    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Extract { file, doc_type, export, out, save } => {
            run_extract(&config, &file, doc_type, export, &out, save).await
        }
        Commands::Batch { files, doc_type } => run_batch(&config, &files, doc_type).await,
        Commands::Validate { fields, rules, json } => run_validate(&config, &fields, rules.as_deref(), json),
        Commands::Export { fields, format, output } => run_export(&fields, format, output.as_deref()),
        Commands::Documents => run_documents(&config).await,
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn session_from_config(config: &AppConfig) -> Option<Session> {
    let user_id = config.auth.user_id.clone()?;
    let mut session = Session::new(user_id);
    if let Some(email) = &config.auth.email {
        session = session.with_email(email.clone());
    }
    Some(session)
}

fn open_store(config: &AppConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.storage.database_path, &config.storage.blob_dir)
        .context("Failed to open document store")
}

fn rules_for(config: &AppConfig, override_path: Option<&Path>) -> Result<Vec<ValidationRule>> {
    match override_path.or(config.validation.rules_path.as_deref()) {
        Some(path) => load_rules(path),
        None => Ok(default_rules()),
    }
}

fn print_fields(review: &ReviewSession, report: &ValidationReport) {
    for record in review.records() {
        let marker = if report.errors_for(&record.field).next().is_some() { "⚠️ " } else { "✓ " };
        println!(
            "{}{:<32} {:<40} {:>4.0}%",
            marker,
            record.field,
            record.value,
            record.confidence * 100.0
        );
        for finding in report.errors_for(&record.field) {
            println!("     └─ {:?}: {}", finding.severity, finding.message);
        }
    }
}

async fn run_extract(
    config: &AppConfig,
    path: &Path,
    doc_type: DocType,
    export: Option<ExportFormat>,
    out: &Path,
    save: bool,
) -> Result<()> {
    let extractor = build_extractor(&config.extraction)?;
    let file = DocumentFile::from_path(path)?;

    println!("🔍 Extracting {} as {}...", file.name, doc_type);
    let review = ReviewSession::analyze(&extractor, file, doc_type)
        .await
        .context("Failed to process document")?
        .with_rules(rules_for(config, None)?);

    let report = review.validation();
    print_fields(&review, &report);
    println!("\n{}", report.summary());

    if let Some(format) = export {
        let written = review.export_to_dir(out, format)?;
        println!("💾 Exported {:?}", written);
    }

    if save {
        let session = session_from_config(config);
        let store = open_store(config)?;
        let stored = review.save(&store, session.as_ref()).await?;
        println!("✓ Stored as {} ({})", stored.file_path, stored.id);
    }

    Ok(())
}

async fn run_batch(config: &AppConfig, paths: &[PathBuf], doc_type: DocType) -> Result<()> {
    let extractor = build_extractor(&config.extraction)?;
    let store = open_store(config)?;
    let session = session_from_config(config);

    let mut queue = Queue::new();
    let mut names = HashMap::new();
    for path in paths {
        let file = DocumentFile::from_path(path)?;
        let name = file.name.clone();
        names.insert(queue.enqueue_typed(file, doc_type), name);
    }
    let queue = Arc::new(Mutex::new(queue));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let processor = BatchProcessor::new(queue, extractor, store).with_events(tx);

    let cancel = CancelToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        let label = |id: &str| names.get(id).cloned().unwrap_or_else(|| id.to_string());
        while let Some(event) = rx.recv().await {
            match event {
                BatchEvent::ItemStarted { id } => println!("⏳ {}", label(&id)),
                BatchEvent::ItemCompleted { id, fields } => println!("✓ {} ({} fields)", label(&id), fields),
                BatchEvent::ItemFailed { id, error } => println!("❌ {}: {}", label(&id), error),
                BatchEvent::Completed(report) => {
                    println!("\n🎉 {}", report.summary());
                    break;
                }
            }
        }
    });

    let result = processor.run(session.as_ref(), &cancel).await;
    drop(processor);
    let _ = printer.await;

    let report = result?;
    if report.failed > 0 {
        bail!("{} document(s) failed", report.failed);
    }
    Ok(())
}

fn run_validate(config: &AppConfig, fields: &Path, rules: Option<&Path>, json: bool) -> Result<()> {
    let records = load_fields(fields)?;
    let report = validate(&records, &rules_for(config, rules)?);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for finding in &report.errors {
            println!("{}", finding);
        }
        println!("{}", report.summary());
    }
    Ok(())
}

fn run_export(fields: &Path, format: ExportFormat, output: Option<&Path>) -> Result<()> {
    let records = load_fields(fields)?;
    let content = export_fields(&records, format);

    match output {
        Some(path) => {
            std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;
            println!("💾 Wrote {:?}", path);
        }
        None => println!("{}", content),
    }
    Ok(())
}

async fn run_documents(config: &AppConfig) -> Result<()> {
    let Some(session) = session_from_config(config) else {
        bail!("no user configured (set [auth] user_id or LOAN_EXTRACT_USER)");
    };
    let store = open_store(config)?;
    let docs = store.list_for_user(&session.user_id).await?;

    if docs.is_empty() {
        println!("No documents found. Upload one to get started!");
        return Ok(());
    }

    for doc in docs {
        println!(
            "{:<24} {:<18} {}  {} fields",
            doc.display_name(),
            doc.doc_type,
            doc.created_at.format("%Y-%m-%d %H:%M"),
            doc.extracted_data.len()
        );
    }
    Ok(())
}
