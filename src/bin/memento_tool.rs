use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use memento_rebind::{
    EncodingFormat, FileMementoPersister, FilePersisterOptions, GraphMemento, Memento,
    MementoPersister, ObjectKind, PlaceholderLookup, RebindConfig, SerializerConfig,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "memento-tool")]
#[command(about = "Offline tooling for memento stores written by the file persister")]
struct Cli {
    /// Encoding of the store. Ignored when --config names a serializer.
    #[arg(long, global = true, default_value = "json")]
    format: String,
    /// Rebind configuration (JSON) supplying the serializer settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prints what a rebind would load from the store.
    Inspect {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Folds the journal into a fresh snapshot.
    Compact {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Lists references that point at objects missing from the store.
    CheckRefs {
        #[arg(long)]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let serializer = serializer_config(&cli.format, cli.config.as_deref())?;

    match cli.command {
        Command::Inspect { dir } => inspect(&dir, serializer).await,
        Command::Compact { dir } => compact(&dir, serializer).await,
        Command::CheckRefs { dir } => check_refs(&dir, serializer).await,
    }
}

fn serializer_config(format: &str, config: Option<&Path>) -> Result<SerializerConfig> {
    if let Some(path) = config {
        let config = RebindConfig::from_json_file(path)
            .with_context(|| format!("Failed to read rebind config '{}'", path.display()))?;
        return Ok(config.serializer);
    }
    let format: EncodingFormat = format
        .parse()
        .with_context(|| format!("Unsupported format '{}'", format))?;
    Ok(SerializerConfig::default().with_format(format))
}

fn open_store(dir: &Path, serializer: SerializerConfig) -> Result<FileMementoPersister> {
    if !dir.is_dir() {
        bail!("'{}' is not a memento store directory", dir.display());
    }
    let options = FilePersisterOptions::default()
        .with_serializer(serializer)
        .with_compact_after_deltas(0);
    FileMementoPersister::open(dir, options)
        .with_context(|| format!("Failed to open memento store '{}'", dir.display()))
}

async fn load(store: &FileMementoPersister) -> Result<(GraphMemento, PlaceholderLookup)> {
    let lookup = PlaceholderLookup::new();
    let graph = store
        .load_all(&lookup)
        .await
        .with_context(|| format!("Failed to load mementos from '{}'", store.dir().display()))?;
    Ok((graph, lookup))
}

async fn inspect(dir: &Path, serializer: SerializerConfig) -> Result<()> {
    let store = open_store(dir, serializer)?;
    let frames = store.journal_frames().await;
    if let Some(side) = store.set_aside_tail().await {
        println!("Torn journal tail moved to {}", side.display());
    }
    if let Some(reason) = store.journal_damage().await {
        bail!("Journal in '{}' is corrupt: {}", dir.display(), reason);
    }
    let (graph, _) = load(&store).await?;

    println!("Store: {}", dir.display());
    println!("Format: {}", store.serializer().format());
    println!("Journal frames since snapshot: {}", frames);
    println!(
        "Objects: {} entities, {} locations, {} policies",
        graph.entities.len(),
        graph.locations.len(),
        graph.policies.len()
    );
    let applications = graph.application_ids();
    if !applications.is_empty() {
        println!("Applications: {}", applications.join(", "));
    }
    for memento in graph.entities.values() {
        println!("  entity   {} ({})", memento.id(), memento.type_name());
    }
    for memento in graph.locations.values() {
        println!("  location {} ({})", memento.id(), memento.type_name());
    }
    for memento in graph.policies.values() {
        println!("  policy   {} ({})", memento.id(), memento.type_name());
    }
    Ok(())
}

async fn compact(dir: &Path, serializer: SerializerConfig) -> Result<()> {
    let store = open_store(dir, serializer)?;
    let frames = store.journal_frames().await;
    store
        .compact()
        .await
        .with_context(|| format!("Failed to compact '{}'", dir.display()))?;
    store.stop().await?;
    println!("Compacted {} journal frame(s) into {}", frames, dir.display());
    Ok(())
}

async fn check_refs(dir: &Path, serializer: SerializerConfig) -> Result<()> {
    let store = open_store(dir, serializer)?;
    let (graph, lookup) = load(&store).await?;

    let mut missing: BTreeSet<(ObjectKind, String)> = graph.dangling_references();
    for id in lookup.entity_ids() {
        if !graph.contains(ObjectKind::Entity, &id) {
            missing.insert((ObjectKind::Entity, id));
        }
    }
    for id in lookup.location_ids() {
        if !graph.contains(ObjectKind::Location, &id) {
            missing.insert((ObjectKind::Location, id));
        }
    }

    if missing.is_empty() {
        println!("All references resolve ({} objects)", graph.len());
        return Ok(());
    }
    for (kind, id) in &missing {
        println!("missing {} {}", kind, id);
    }
    bail!("{} dangling reference(s)", missing.len())
}
