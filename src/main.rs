use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use eventlens::config::{Config, ImageModelConfig};
use eventlens::db::{CopyPlan, Database, FaceHit, GroupRename, ImageFilter, ImageHit, ModelKind};
use eventlens::embedding::OnnxImageEmbedder;
use eventlens::export::{export_images, ExportFormat};
use eventlens::faces::OnnxFaceDetector;
use eventlens::indexing::{
    EmbeddingIndexer, FaceIndexer, IndexOptions, IndexingStatus, ObjectIndexer, RunSummary,
};
use eventlens::ingest::{import_directory, ImportOptions, ImportProgress};
use eventlens::logging::{self, LogTarget};
use eventlens::objects::OnnxObjectDetector;
use eventlens::search::{SearchEngine, SearchPage};

/// Similarity search over an event photo archive
#[derive(Parser)]
#[command(name = "eventlens")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "EVENTLENS_CONFIG")]
    config: Option<PathBuf>,

    /// Log to stderr instead of journald or the log file
    #[arg(long, global = true)]
    stderr_log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default config (if missing) and create the store
    Init,

    /// Register the images of one or more album directories
    Import {
        /// Album directories inside the data directory
        #[arg(required = true)]
        albums: Vec<PathBuf>,

        /// Group name instead of the one parsed from the directory name
        #[arg(long, requires = "year")]
        group: Option<String>,

        /// Group year, used with --group
        #[arg(long)]
        year: Option<i32>,

        /// Group kind
        #[arg(long, default_value = "conference")]
        kind: String,

        /// Base URL the album is published under
        #[arg(long)]
        url_prefix: Option<String>,
    },

    /// List catalogued images
    List {
        #[command(flatten)]
        filter: FilterArgs,

        /// Maximum number of rows to print
        #[arg(short, long, default_value = "50")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show groups with their image counts
    Groups,

    /// Show indexing coverage per declared model
    Status,

    /// Compute missing whole-image embeddings
    Embed {
        /// Image model name (defaults to the first configured one)
        #[arg(short, long)]
        model: Option<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Detect faces on images not yet scanned
    Faces {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Detect labelled objects on images not yet scanned
    Objects {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Search images by a text description or an example image file
    Search {
        /// Text query
        #[arg(required_unless_present = "image")]
        query: Option<String>,

        /// Query with an image file instead of text
        #[arg(long, conflicts_with = "query")]
        image: Option<PathBuf>,

        /// Image model name (defaults to the first configured one)
        #[arg(short, long)]
        model: Option<String>,

        #[command(flatten)]
        page: PageArgs,
    },

    /// Find images similar to a catalogued image
    Similar {
        image_id: i64,

        #[arg(short, long)]
        model: Option<String>,

        #[command(flatten)]
        page: PageArgs,
    },

    /// List the faces detected on an image
    FacesOf {
        image_id: i64,

        #[arg(long)]
        json: bool,
    },

    /// List the objects detected on an image
    ObjectsOf {
        image_id: i64,

        #[arg(long)]
        json: bool,
    },

    /// Object labels with the number of images showing each
    Labels {
        /// Ignore detections below this confidence
        #[arg(long, default_value = "0.0")]
        min_confidence: f32,

        #[arg(long)]
        json: bool,
    },

    /// List images showing an object label (e.g. "laptop")
    WithLabel {
        label: String,

        #[arg(long, default_value = "0.0")]
        min_confidence: f32,

        /// Restrict to these groups (repeatable)
        #[arg(short, long = "group")]
        groups: Vec<String>,

        #[arg(long)]
        json: bool,
    },

    /// Find other images of the person behind a detected face
    SamePerson {
        face_id: String,

        #[arg(short, long)]
        limit: Option<usize>,

        /// Restrict to these groups (repeatable)
        #[arg(short, long = "group")]
        groups: Vec<String>,

        #[arg(long)]
        json: bool,
    },

    /// Rename groups, from the command line or the config's rename list
    RenameGroups {
        #[arg(long, requires = "to")]
        from: Option<String>,

        #[arg(long, requires = "from")]
        to: Option<String>,

        /// Set group_year to this value on the renamed rows
        #[arg(long)]
        year: Option<i32>,

        /// Report matching rows without changing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Merge catalog and index rows from another store
    CopyStore {
        source: PathBuf,

        /// Which tables to copy
        #[arg(long, value_enum, default_value = "all")]
        only: CopyScope,
    },

    /// Delete every stored vector of one image model
    PurgeModel {
        model: String,

        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Export the catalog as JSON or CSV
    Export {
        output: PathBuf,

        /// Output format (guessed from the file extension if omitted)
        #[arg(long, value_enum)]
        format: Option<FormatArg>,

        #[command(flatten)]
        filter: FilterArgs,
    },
}

#[derive(Args)]
struct FilterArgs {
    #[arg(long)]
    group: Option<String>,

    #[arg(long)]
    year: Option<i32>,

    #[arg(long)]
    collection: Option<String>,
}

impl From<FilterArgs> for ImageFilter {
    fn from(args: FilterArgs) -> Self {
        ImageFilter {
            group_name: args.group,
            group_year: args.year,
            collection_id: args.collection,
        }
    }
}

#[derive(Args)]
struct RunArgs {
    /// Recompute: every image for embeddings, a full reset for faces and objects
    #[arg(long)]
    force: bool,

    /// Process at most this many images
    #[arg(long)]
    limit: Option<usize>,

    /// Override the configured batch size
    #[arg(long)]
    batch_size: Option<usize>,
}

#[derive(Args)]
struct PageArgs {
    #[arg(short, long)]
    limit: Option<usize>,

    #[arg(long, default_value = "0")]
    offset: usize,

    /// Restrict to these groups (repeatable)
    #[arg(short, long = "group")]
    groups: Vec<String>,

    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum CopyScope {
    All,
    Images,
    Embeddings,
    Faces,
    Objects,
}

impl From<CopyScope> for CopyPlan {
    fn from(scope: CopyScope) -> Self {
        match scope {
            CopyScope::All => CopyPlan::all(),
            CopyScope::Images => CopyPlan {
                images: true,
                ..CopyPlan::default()
            },
            CopyScope::Embeddings => CopyPlan {
                embeddings: true,
                ..CopyPlan::default()
            },
            CopyScope::Faces => CopyPlan {
                faces: true,
                ..CopyPlan::default()
            },
            CopyScope::Objects => CopyPlan {
                objects: true,
                ..CopyPlan::default()
            },
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Csv,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let target = if cli.stderr_log {
        LogTarget::Stderr
    } else {
        LogTarget::System { log_dir: None }
    };
    if let Err(e) = logging::init(target) {
        eprintln!("Warning: logging unavailable: {}", e);
    }

    let config = Config::load(cli.config.as_deref())?;

    if matches!(cli.command, Commands::Init) {
        let db = open_store(&config)?;
        let path = cli.config.clone().unwrap_or_else(Config::default_path);
        println!("Config: {}", path.display());
        println!("Store:  {} ({} images)", config.db_path.display(), db.count_images()?);
        println!("Data:   {}", config.data_dir.display());
        return Ok(());
    }

    let db = open_store(&config)?;
    run_command(cli.command, &config, &db)
}

fn open_store(config: &Config) -> Result<Database> {
    let db = Database::open(&config.db_path)
        .with_context(|| format!("Failed to open store {}", config.db_path.display()))?;
    db.initialize()?;
    Ok(db)
}

fn run_command(command: Commands, config: &Config, db: &Database) -> Result<()> {
    match command {
        Commands::Init => Ok(()),

        Commands::Import {
            albums,
            group,
            year,
            kind,
            url_prefix,
        } => {
            let mut options = ImportOptions::new(config.scanner.image_extensions.clone());
            options.group = group.zip(year);
            options.group_kind = kind;
            options.url_prefix = url_prefix;

            for album in albums {
                let (tx, rx) = mpsc::channel();
                let printer = thread::spawn(move || {
                    for update in rx {
                        if let ImportProgress::Started { total_files } = update {
                            eprintln!("Found {} files", total_files);
                        }
                    }
                });
                let report = import_directory(db, &config.data_dir, &album, &options, Some(tx));
                let _ = printer.join();
                let report = report?;
                println!(
                    "{} ({}): {} registered, {} already known, {} unreadable",
                    report.group_name, report.group_year, report.registered, report.existing, report.unreadable
                );
            }
            Ok(())
        }

        Commands::List { filter, limit, json } => {
            let images = db.list_images(&filter.into())?;
            let shown: Vec<_> = images.into_iter().take(limit).collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&shown)?);
            } else {
                for image in &shown {
                    println!(
                        "{:>6}  {:<28} {:>4}  {}",
                        image.id,
                        image.group_name,
                        image.group_year,
                        image.storage_path.as_deref().unwrap_or(&image.source_url)
                    );
                }
            }
            Ok(())
        }

        Commands::Groups => {
            for group in db.group_summary()? {
                println!("{:<40} {:>4} {:>7}", group.group_name, group.group_year, group.count);
            }
            Ok(())
        }

        Commands::Status => {
            println!("Images: {}", db.count_images()?);
            for spec in db.models()? {
                match spec.kind {
                    ModelKind::Image => {
                        let stats = db.embedding_stats(&spec.name)?;
                        println!(
                            "{} [image, {}d]: {}/{} embedded, {} pending",
                            spec.name,
                            spec.dim,
                            stats.embedded,
                            stats.total_indexable,
                            stats.pending()
                        );
                    }
                    ModelKind::Face => {
                        let stats = db.face_stats(&spec.name)?;
                        println!(
                            "{} [face, {}d]: {}/{} scanned, {} faces",
                            spec.name, spec.dim, stats.processed, stats.total_indexable, stats.faces
                        );
                    }
                }
            }
            let objects = db.object_stats(&config.objects.model_name)?;
            println!(
                "{} [objects]: {}/{} scanned, {} objects",
                config.objects.model_name, objects.processed, objects.total_indexable, objects.objects
            );
            Ok(())
        }

        Commands::Embed { model, run } => {
            let model_config = resolve_image_model(config, model.as_deref())?;
            let embedder = OnnxImageEmbedder::load_visual(model_config, &config.models_dir)?;
            let options = index_options(config, &run);

            let (tx, printer) = spawn_progress_printer();
            let summary = EmbeddingIndexer::new(db, &embedder).run(&options, Some(tx));
            let _ = printer.join();
            print_summary(&summary?);
            Ok(())
        }

        Commands::Faces { run } => {
            let detector = OnnxFaceDetector::load(&config.faces, &config.models_dir)?;
            let options = index_options(config, &run);

            let (tx, printer) = spawn_progress_printer();
            let summary = FaceIndexer::new(db, &detector).run(&options, Some(tx));
            let _ = printer.join();
            print_summary(&summary?);
            Ok(())
        }

        Commands::Objects { run } => {
            let detector = OnnxObjectDetector::load(&config.objects, &config.models_dir)?;
            let options = index_options(config, &run);

            let (tx, printer) = spawn_progress_printer();
            let summary = ObjectIndexer::new(db, &detector).run(&options, Some(tx));
            let _ = printer.join();
            print_summary(&summary?);
            Ok(())
        }

        Commands::Search {
            query,
            image,
            model,
            page,
        } => {
            let model_config = resolve_image_model(config, model.as_deref())?;
            let engine = SearchEngine::new(db, config.search.clone());
            let limit = page.limit.unwrap_or(engine.default_limit());
            let groups = groups_arg(&page.groups);

            let results = match (image, query) {
                (Some(path), _) => {
                    let embedder = OnnxImageEmbedder::load_visual(model_config, &config.models_dir)?;
                    engine.search_by_image_file(&embedder, &path, limit, page.offset, groups)?
                }
                (None, Some(text)) => {
                    let embedder = OnnxImageEmbedder::load_text(model_config, &config.models_dir)?;
                    engine.search_by_text(&embedder, &text, limit, page.offset, groups)?
                }
                (None, None) => bail!("Either a text query or --image is required"),
            };
            print_page(&results, page.json)
        }

        Commands::Similar {
            image_id,
            model,
            page,
        } => {
            let model_name = resolve_image_model(config, model.as_deref())?.name.clone();
            let engine = SearchEngine::new(db, config.search.clone());
            let limit = page.limit.unwrap_or(engine.default_limit());

            let results = engine
                .find_similar_to_image(image_id, &model_name, limit, page.offset, groups_arg(&page.groups))?
                .ok_or_else(|| anyhow!("Image {} has no {} embedding yet", image_id, model_name))?;
            print_page(&results, page.json)
        }

        Commands::FacesOf { image_id, json } => {
            let engine = SearchEngine::new(db, config.search.clone());
            let faces = engine.faces_in_image(image_id, &config.faces.model_name)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&faces)?);
            } else {
                for face in &faces {
                    println!(
                        "{}  score {:.3}  box ({:.0}, {:.0}, {:.0}, {:.0})",
                        face.face_id, face.det_score, face.bbox.x1, face.bbox.y1, face.bbox.x2, face.bbox.y2
                    );
                }
            }
            Ok(())
        }

        Commands::ObjectsOf { image_id, json } => {
            let engine = SearchEngine::new(db, config.search.clone());
            let objects = engine.objects_in_image(image_id, &config.objects.model_name)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&objects)?);
            } else {
                for object in &objects {
                    println!(
                        "{:<16} {:.3}  box ({:.0}, {:.0}, {:.0}, {:.0})",
                        object.label,
                        object.confidence,
                        object.bbox.x1,
                        object.bbox.y1,
                        object.bbox.x2,
                        object.bbox.y2
                    );
                }
            }
            Ok(())
        }

        Commands::Labels { min_confidence, json } => {
            let engine = SearchEngine::new(db, config.search.clone());
            let labels = engine.object_labels(&config.objects.model_name, min_confidence)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&labels)?);
            } else {
                for label in &labels {
                    println!("{:<20} {:>7} images {:>8} boxes", label.label, label.images, label.detections);
                }
            }
            Ok(())
        }

        Commands::WithLabel {
            label,
            min_confidence,
            groups,
            json,
        } => {
            let engine = SearchEngine::new(db, config.search.clone());
            let images = engine.images_with_label(
                &config.objects.model_name,
                &label,
                min_confidence,
                groups_arg(&groups),
            )?;
            if json {
                println!("{}", serde_json::to_string_pretty(&images)?);
            } else {
                for image in &images {
                    println!(
                        "{:>6}  {:<28} {:>4}  {}",
                        image.id,
                        image.group_name,
                        image.group_year,
                        image.storage_path.as_deref().unwrap_or(&image.source_url)
                    );
                }
            }
            Ok(())
        }

        Commands::SamePerson {
            face_id,
            limit,
            groups,
            json,
        } => {
            let engine = SearchEngine::new(db, config.search.clone());
            let limit = limit.unwrap_or(engine.default_limit());
            let hits = engine
                .find_same_person(&face_id, limit, groups_arg(&groups))?
                .ok_or_else(|| anyhow!("Unknown face id {}", face_id))?;
            print_face_hits(&hits, json)
        }

        Commands::RenameGroups {
            from,
            to,
            year,
            dry_run,
        } => {
            let renames = match (from, to) {
                (Some(from), Some(to)) => vec![GroupRename { from, to, year }],
                _ => config.maintenance.renames.clone(),
            };
            if renames.is_empty() {
                bail!("No renames given and none configured under [maintenance]");
            }

            for outcome in db.rename_groups(&renames, dry_run)? {
                let verb = if outcome.applied { "renamed" } else { "would rename" };
                println!(
                    "{} -> {}{}: {} {} rows",
                    outcome.rename.from,
                    outcome.rename.to,
                    outcome.rename.year.map(|y| format!(" ({})", y)).unwrap_or_default(),
                    verb,
                    outcome.matched
                );
            }
            Ok(())
        }

        Commands::CopyStore { source, only } => {
            let report = db.copy_from_store(&source, only.into())?;
            println!(
                "Copied {} models, {} images, {} embeddings, {} faces, {} ledger rows, {} objects, {} object ledger rows",
                report.models,
                report.images,
                report.embeddings,
                report.faces,
                report.ledger,
                report.objects,
                report.object_ledger
            );
            Ok(())
        }

        Commands::PurgeModel { model, yes } => {
            if !yes {
                bail!("Refusing to delete vectors of {} without --yes", model);
            }
            let deleted = db.purge_model_vectors(&model)?;
            println!("Deleted {} vectors of {}", deleted, model);
            Ok(())
        }

        Commands::Export {
            output,
            format,
            filter,
        } => {
            let format = match format {
                Some(FormatArg::Json) => ExportFormat::Json,
                Some(FormatArg::Csv) => ExportFormat::Csv,
                None => ExportFormat::from_path(&output)
                    .ok_or_else(|| anyhow!("Cannot guess format of {}; pass --format", output.display()))?,
            };
            let count = export_images(db, &filter.into(), &output, format)?;
            println!("Exported {} images to {}", count, output.display());
            Ok(())
        }
    }
}

fn resolve_image_model<'c>(config: &'c Config, name: Option<&str>) -> Result<&'c ImageModelConfig> {
    match name {
        Some(name) => config
            .image_model(name)
            .ok_or_else(|| anyhow!("No image model named {} in config", name)),
        None => config
            .default_image_model()
            .ok_or_else(|| anyhow!("No image models configured")),
    }
}

fn index_options(config: &Config, run: &RunArgs) -> IndexOptions {
    let mut options = IndexOptions::new(&config.data_dir, &config.indexing);
    options.force = run.force;
    options.limit = run.limit;
    if let Some(size) = run.batch_size {
        options.batch_size = size.max(1);
    }
    options
}

fn groups_arg(groups: &[String]) -> Option<&[String]> {
    if groups.is_empty() {
        None
    } else {
        Some(groups)
    }
}

fn spawn_progress_printer() -> (mpsc::Sender<IndexingStatus>, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let mut last_percent = None;
        for status in rx {
            match status {
                IndexingStatus::Starting { model, total } => {
                    eprintln!("{}: {} images to process", model, total);
                }
                IndexingStatus::Progress { done, total } if total > 0 => {
                    let percent = done * 100 / total;
                    if last_percent != Some(percent) && percent % 10 == 0 {
                        eprintln!("  {}% ({}/{})", percent, done, total);
                        last_percent = Some(percent);
                    }
                }
                IndexingStatus::SkippedMissing { path, .. } => {
                    eprintln!("  missing: {}", path.display());
                }
                IndexingStatus::Error { message, .. } => {
                    eprintln!("  error: {}", message);
                }
                _ => {}
            }
        }
    });
    (tx, handle)
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{}: {} of {} processed, {} rows written, {} missing files, {} errors",
        summary.model, summary.processed, summary.total, summary.written, summary.skipped_missing, summary.errors
    );
    if summary.faces_found > 0 {
        println!("{} faces found", summary.faces_found);
    }
    if summary.objects_found > 0 {
        println!("{} objects found", summary.objects_found);
    }
}

fn print_page(page: &SearchPage, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(page)?);
        return Ok(());
    }
    for hit in &page.hits {
        print_image_hit(hit);
    }
    if page.has_more {
        println!("(more results available)");
    }
    Ok(())
}

fn print_image_hit(hit: &ImageHit) {
    println!(
        "{:.4}  {:>6}  {} ({})  {}",
        hit.score,
        hit.image.id,
        hit.image.group_name,
        hit.image.group_year,
        display_location(&hit.image.storage_path, &hit.image.source_url)
    );
}

fn print_face_hits(hits: &[FaceHit], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(hits)?);
        return Ok(());
    }
    for hit in hits {
        println!(
            "{:.4}  {:>6}  face {}  {}",
            hit.score,
            hit.image.id,
            hit.face.face_id,
            display_location(&hit.image.storage_path, &hit.image.source_url)
        );
    }
    Ok(())
}

fn display_location<'a>(storage_path: &'a Option<String>, source_url: &'a str) -> &'a str {
    storage_path.as_deref().unwrap_or(source_url)
}
