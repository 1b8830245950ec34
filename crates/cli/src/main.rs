use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use markd::{
    domain, format_age, BookmarkDraft, BookmarkId, DashboardSession, DashboardView,
    DeleteOutcome, MarkdConfig, RemoteBackend, UserId,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "markd")]
#[command(about = "markd CLI - Browse and edit your bookmarks from the terminal")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Relay URL, overrides the config file
    #[arg(long, env = "MARKD_SERVER", global = true)]
    server: Option<String>,

    /// User whose bookmarks to open
    #[arg(long, env = "MARKD_USER", global = true)]
    user: Option<String>,

    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List saved bookmarks
    List {
        /// Only show bookmarks whose title or URL contains this
        #[arg(short, long)]
        query: Option<String>,
    },

    /// Save a bookmark
    Add {
        url: String,

        /// Defaults to the URL's hostname
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Delete a bookmark by id
    Rm { id: String },

    /// Follow the list as it changes, until interrupted
    Watch {
        #[arg(short, long)]
        query: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => MarkdConfig::load(path)?,
        None => MarkdConfig::default(),
    };
    if let Some(server) = cli.server {
        config.remote.url = server;
    }

    let user = cli
        .user
        .map(UserId::new)
        .context("no user given, pass --user or set MARKD_USER")?;

    debug!(url = %config.remote.url, user = %user, "connecting");
    let backend = RemoteBackend::connect(config.remote.clone()).await?;
    let session = DashboardSession::open(Arc::new(backend), user, config.session.clone()).await?;

    let result = match cli.command {
        Commands::List { query } => list_command(&session, query),
        Commands::Add { url, title } => add_command(&session, url, title).await,
        Commands::Rm { id } => rm_command(&session, BookmarkId::new(id)).await,
        Commands::Watch { query } => watch_command(&session, query).await,
    };

    session.close().await;
    result
}

fn list_command(session: &DashboardSession, query: Option<String>) -> Result<()> {
    session.set_query(query.unwrap_or_default())?;
    print_view(&session.view()?);
    Ok(())
}

async fn add_command(session: &DashboardSession, url: String, title: Option<String>) -> Result<()> {
    let draft = BookmarkDraft::new(url, title.unwrap_or_default()).with_guessed_title();
    let bookmark = session.create(&draft).await?;

    info!(id = %bookmark.id, "bookmark saved");
    println!("Saved \"{}\" ({})", bookmark.title, bookmark.id);
    Ok(())
}

async fn rm_command(session: &DashboardSession, id: BookmarkId) -> Result<()> {
    if !session.bookmarks()?.iter().any(|b| b.id == id) {
        anyhow::bail!("no bookmark with id {}", id);
    }

    match session.delete(&id).await? {
        DeleteOutcome::Deleted => println!("Deleted {}", id),
        DeleteOutcome::AlreadyPending => println!("Delete of {} already in progress", id),
    }
    Ok(())
}

async fn watch_command(session: &DashboardSession, query: Option<String>) -> Result<()> {
    session.set_query(query.unwrap_or_default())?;
    let mut changes = session.changes();

    print_view(&session.view()?);

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                println!();
                print_view(&session.view()?);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

fn print_view(view: &DashboardView) {
    let now = Utc::now();

    println!("[{}] {}", view.status.label(), view.summary);
    if let Some(empty) = &view.empty {
        println!("{}", empty.message());
    }

    for row in &view.rows {
        let marker = if row.deleting { " (deleting)" } else { "" };
        println!(
            "{}  {}  {}  {}{}",
            row.bookmark.id,
            row.bookmark.title,
            domain(&row.bookmark.url),
            format_age(row.bookmark.created_at, now),
            marker
        );
    }
}
