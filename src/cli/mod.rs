//! Command-line interface for sbs2.
//!
//! Provides commands for serving intake over HTTP, ingesting URLs into a
//! library, and browsing entries and blobs.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{self, LibraryBackend, ResolvedConfig, DEFAULT_LIBRARY_NAME};
use crate::domain::{BlobId, EntryId};
use crate::intake::{Intake, IntakeRequest};
use crate::library::{PageToken, Registry};
use crate::server;

/// sbs2 - Content-addressed blob and entry storage
#[derive(Parser, Debug)]
#[command(name = "sbs2")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the intake HTTP API
    Serve {
        /// Address to bind to (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Download URLs into a new entry and wait for the result
    Ingest {
        /// Source URLs, in entry order
        #[arg(required = true)]
        urls: Vec<String>,

        /// Target library
        #[arg(short, long, default_value = DEFAULT_LIBRARY_NAME)]
        library: String,

        /// Tags to apply (comma-separated)
        #[arg(short, long)]
        tags: Option<String>,

        /// Attributes as key=value (repeatable)
        #[arg(short, long = "attribute", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,
    },

    /// List entries, newest first
    Entries {
        #[arg(short, long, default_value = DEFAULT_LIBRARY_NAME)]
        library: String,

        /// Maximum number of entries to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Continue from a previous listing
        #[arg(long)]
        page_token: Option<String>,
    },

    /// Show one entry
    Show {
        entry_id: String,

        #[arg(short, long, default_value = DEFAULT_LIBRARY_NAME)]
        library: String,
    },

    /// Write a blob to a file or stdout
    Blob {
        blob_id: String,

        #[arg(short, long, default_value = DEFAULT_LIBRARY_NAME)]
        library: String,

        /// Output file (stdout if not provided)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List configured libraries
    Libraries,

    /// Show resolved configuration (debug)
    Config,
}

fn parse_attribute(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty attribute key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::Serve { bind } => serve(cfg, bind).await,
            Commands::Ingest {
                urls,
                library,
                tags,
                attributes,
            } => ingest(cfg, library, urls, tags, attributes).await,
            Commands::Entries {
                library,
                limit,
                page_token,
            } => list_entries(cfg, &library, limit, page_token).await,
            Commands::Show { entry_id, library } => show_entry(cfg, &library, &entry_id).await,
            Commands::Blob {
                blob_id,
                library,
                output,
            } => write_blob(cfg, &library, &blob_id, output).await,
            Commands::Libraries => list_libraries(cfg),
            Commands::Config => show_config(cfg),
        }
    }
}

async fn open_registry(cfg: &ResolvedConfig) -> Result<Arc<Registry>> {
    let registry = Registry::from_config(&cfg.libraries)
        .await
        .context("Failed to open libraries")?;
    Ok(Arc::new(registry))
}

async fn serve(cfg: &ResolvedConfig, bind: Option<String>) -> Result<()> {
    let registry = open_registry(cfg).await?;
    let intake = Arc::new(Intake::new(registry, cfg.intake.clone()));
    let bind = bind.unwrap_or_else(|| cfg.server.bind.clone());
    server::serve(intake, &bind).await
}

async fn ingest(
    cfg: &ResolvedConfig,
    library: String,
    urls: Vec<String>,
    tags: Option<String>,
    attributes: Vec<(String, String)>,
) -> Result<()> {
    let registry = open_registry(cfg).await?;
    let intake = Intake::new(registry, cfg.intake.clone());

    let mut request = IntakeRequest::new(library, urls);
    for tag in tags.iter().flat_map(|t| t.split(',')) {
        let tag = tag.trim();
        if !tag.is_empty() {
            request = request.with_tag(tag);
        }
    }
    for (key, value) in attributes {
        request = request.with_attribute(key, value);
    }

    let handle = intake.submit(request)?;
    eprintln!("Ingestion {} started", handle.id);
    let watched = handle.clone();

    match handle.wait().await {
        Ok(entry_id) => {
            println!("{}", entry_id);
            Ok(())
        }
        Err(err) => {
            for download in watched.snapshot().downloads {
                eprintln!("  {}: {}", download.url, download.summary);
            }
            Err(err).context("Ingestion failed")
        }
    }
}

async fn list_entries(
    cfg: &ResolvedConfig,
    library: &str,
    limit: usize,
    page_token: Option<String>,
) -> Result<()> {
    let library = open_registry(cfg).await?.lookup(library)?;
    let token = page_token
        .map(|t| t.parse::<PageToken>())
        .transpose()
        .context("Invalid page token")?;

    let page = library.list_entries(token.as_ref(), limit).await?;
    if page.entries.is_empty() {
        println!("No entries found");
        return Ok(());
    }

    println!("{:<26} {:<6} {:<30}", "ENTRY ID", "BLOBS", "TAGS");
    println!("{}", "-".repeat(64));
    for entry in &page.entries {
        let tags: Vec<&str> = entry.metadata.tags.iter().map(String::as_str).collect();
        println!(
            "{:<26} {:<6} {:<30}",
            entry.entry_id,
            entry.blob_sequence.len(),
            tags.join(",")
        );
    }

    if let Some(next) = page.next_page_token {
        eprintln!("\nMore entries: --page-token {}", next);
    }

    Ok(())
}

async fn show_entry(cfg: &ResolvedConfig, library: &str, entry_id: &str) -> Result<()> {
    let entry_id: EntryId = entry_id.parse()?;
    let library = open_registry(cfg).await?.lookup(library)?;
    let entry = library.get_entry(&entry_id).await?;

    println!("Entry:   {}", entry.entry_id);
    println!("Library: {}", library.name());
    if let Some(created) = entry.entry_id.created_at() {
        println!("Created: {}", created.format("%Y-%m-%d %H:%M:%S%.3f UTC"));
    }
    if !entry.metadata.tags.is_empty() {
        let tags: Vec<&str> = entry.metadata.tags.iter().map(String::as_str).collect();
        println!("Tags:    {}", tags.join(", "));
    }
    if !entry.metadata.attributes.is_empty() {
        println!("\nAttributes:");
        for (key, value) in &entry.metadata.attributes {
            println!("  {}: {}", key, value);
        }
    }
    println!("\nBlobs:");
    for (i, blob_id) in entry.blob_sequence.iter().enumerate() {
        println!("  {:>3}. {}", i + 1, blob_id);
    }

    Ok(())
}

async fn write_blob(
    cfg: &ResolvedConfig,
    library: &str,
    blob_id: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let blob_id: BlobId = blob_id.parse()?;
    let library = open_registry(cfg).await?.lookup(library)?;
    let content = library.get_blob(&blob_id).await?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, content.bytes())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {} bytes ({}) to {}", content.len(), content.mime_type(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(content.bytes())
                .context("Failed to write to stdout")?;
            stdout.flush()?;
        }
    }

    Ok(())
}

fn list_libraries(cfg: &ResolvedConfig) -> Result<()> {
    println!("{:<20} {:<12} {}", "NAME", "KIND", "LOCATION");
    println!("{}", "-".repeat(64));
    for library in &cfg.libraries {
        let (kind, location) = match &library.backend {
            LibraryBackend::Filesystem { root } => ("filesystem", root.display().to_string()),
            LibraryBackend::Sqlite { root } => ("sqlite", root.display().to_string()),
            LibraryBackend::Aws { bucket, table, .. } => {
                ("aws", format!("s3://{} + dynamodb:{}", bucket, table))
            }
        };
        println!("{:<20} {:<12} {}", library.name, kind, location);
    }
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    let yaml = serde_yaml::to_string(cfg).context("Failed to render configuration")?;
    print!("{}", yaml);
    Ok(())
}
