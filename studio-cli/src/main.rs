use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use studio_core::compose::{ImageAttachment, image_token};
use studio_core::config::{StudioConfig, studio_dir};
use studio_core::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
struct Args {
    /// API key for the image service
    #[arg(long, env = "STUDIO_API_KEY")]
    api_key: Option<String>,

    /// Base URL of the image service
    #[arg(long, env = "STUDIO_BASE_URL")]
    base_url: Option<String>,

    /// Image model name
    #[arg(long)]
    model: Option<String>,

    /// Persist new slides into this project
    #[arg(long)]
    project: Option<String>,

    /// Write the effective settings back to ~/.studio/config.json
    #[arg(long)]
    save_config: bool,

    /// Print the slide tree as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Normalize a prompt and print it
    Normalize { text: String },
    /// Generate a new original image from text
    Generate { prompt: String },
    /// Apply edits to a local image, one slide per prompt
    Edit {
        /// Source image
        #[arg(long)]
        image: PathBuf,
        /// Extra images embedded into the first prompt as [image 2], [image 3], ...
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
        /// Keep the last slide as a saved artifact
        #[arg(long)]
        keep: bool,
        #[arg(required = true)]
        prompts: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set up file-based tracing (logs go to ~/.studio/studio.log)
    {
        let log_dir = studio_dir();
        std::fs::create_dir_all(&log_dir).ok();
        let log_file = std::fs::File::create(log_dir.join("studio.log"))?;

        use tracing_subscriber::EnvFilter;
        let filter =
            EnvFilter::try_from_env("STUDIO_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(log_file)
            .with_ansi(false)
            .init();
    }

    let args = Args::parse();

    let mut config = StudioConfig::load()
        .context("reading ~/.studio/config.json")?
        .unwrap_or_default();
    if let Some(key) = &args.api_key {
        config.api_key = Some(key.clone());
    }
    if let Some(url) = &args.base_url {
        config.base_url = url.clone();
    }
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(project) = &args.project {
        config.project_id = Some(project.clone());
    }
    if args.save_config {
        config.save()?;
    }
    tracing::info!("using {} with model {}", config.base_url, config.model);

    match &args.command {
        Command::Normalize { text } => {
            println!("{}", normalize(text));
            Ok(())
        }
        Command::Generate { prompt } => generate(&args, &config, prompt).await,
        Command::Edit {
            image,
            attachments,
            keep,
            prompts,
        } => edit(&args, &config, image, attachments, *keep, prompts).await,
    }
}

fn http_backend(config: &StudioConfig) -> Arc<HttpBackend> {
    Arc::new(HttpBackend::new(&config.base_url, config.api_key.clone()))
}

/// Cancel on Ctrl-C until `done` fires.
fn cancel_on_interrupt(coordinator: GenerationCoordinator, done: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = done.cancelled() => {}
            _ = tokio::signal::ctrl_c() => {
                eprintln!("cancelling...");
                coordinator.cancel_active();
            }
        }
    });
}

async fn generate(args: &Args, config: &StudioConfig, prompt: &str) -> anyhow::Result<()> {
    let backend = http_backend(config);
    let tree = SlideTree::new().shared();
    let coordinator = GenerationCoordinator::new(
        tree.clone(),
        backend,
        Arc::new(BlobRegistry::new()),
        &config.model,
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    coordinator.generate_original(prompt, cancel).await?;
    print_tree(&tree, &coordinator, args.json)
}

async fn edit(
    args: &Args,
    config: &StudioConfig,
    image: &Path,
    attachments: &[PathBuf],
    keep: bool,
    prompts: &[String],
) -> anyhow::Result<()> {
    let backend = http_backend(config);
    let blobs = Arc::new(BlobRegistry::new());

    let source = read_image(image)?;
    let root_url = blobs.register(source.bytes, &source.mime);
    let mut tree = SlideTree::new();
    tree.create_root(Slide::original(
        "original",
        root_url.as_str(),
        image.display().to_string(),
        "",
    ))?;
    let tree = tree.shared();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut coordinator =
        GenerationCoordinator::new(tree.clone(), backend.clone(), blobs.clone(), &config.model)
            .with_events(tx);
    let sync = config.project_id.as_ref().map(|project| {
        PersistenceSync::new(backend.clone(), tree.clone(), blobs.clone(), project.clone())
    });
    if let Some(sync) = &sync {
        coordinator = coordinator.with_sync(sync.clone());
    }

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                GenerationEvent::Failed { slide_id, message } => {
                    eprintln!("{slide_id}: failed: {message}")
                }
                GenerationEvent::Cancelled { slide_id } => eprintln!("{slide_id}: cancelled"),
                GenerationEvent::Persisted {
                    client_id,
                    server_id,
                } => eprintln!("{client_id}: stored as {server_id}"),
                _ => {}
            }
        }
    });

    let mut last = None;
    for (i, text) in prompts.iter().enumerate() {
        let mut composer = Composer::for_edit(blobs.clone());
        let mut pos = composer.insert_text(0, text);
        if i == 0 {
            for path in attachments {
                let attachment = read_image(path)?;
                let (_, end) = composer.insert_image(pos, attachment)?;
                pos = end;
            }
        }
        let (prompt, handles) = composer.take_submission();
        eprintln!("editing: {}", prompt.text);

        let done = CancellationToken::new();
        cancel_on_interrupt(coordinator.clone(), done.clone());
        let submission = coordinator.submit(prompt, handles)?;
        let outcome = match submission {
            Submission::Busy => bail!("the active slide is still generating"),
            Submission::Started { task, .. } => task.await?,
        };
        done.cancel();

        match outcome {
            GenerationOutcome::Complete { slide_id } => last = Some(slide_id),
            GenerationOutcome::Cancelled => break,
            GenerationOutcome::Failed { message } => bail!("generation failed: {message}"),
        }
    }

    if keep
        && let Some(slide_id) = &last
    {
        let sync = sync.context("--keep needs --project")?;
        match sync.save_slide(slide_id, None).await? {
            SaveOutcome::Saved(id) => eprintln!("kept {slide_id} as {id}"),
            SaveOutcome::Skipped => eprintln!("{slide_id} has nothing to keep"),
        }
    }

    print_tree(&tree, &coordinator, args.json)
}

fn read_image(path: &Path) -> anyhow::Result<ImageAttachment> {
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => bail!("{}: unsupported image type", path.display()),
    };
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(ImageAttachment {
        bytes,
        mime: mime.to_string(),
    })
}

fn print_tree(
    tree: &SharedTree,
    coordinator: &GenerationCoordinator,
    json: bool,
) -> anyhow::Result<()> {
    let tree = tree.lock().unwrap();
    if json {
        println!("{}", serde_json::to_string_pretty(tree.slides())?);
        return Ok(());
    }

    let active = tree.active_index();
    for (i, slide) in tree.slides().iter().enumerate() {
        let depth = tree.lineage(&slide.id).len().saturating_sub(1);
        let marker = if i == active { '*' } else { ' ' };
        let state = match coordinator.state(&slide.id) {
            Some(state) => format!("{state:?}"),
            None if slide.is_original => "Original".to_string(),
            None => "Stored".to_string(),
        };
        let saved = if slide.is_saved { " saved" } else { "" };
        println!(
            "{marker} {}{} [{state}{saved}] {}",
            "  ".repeat(depth),
            slide.id,
            slide.prompt
        );
        if !slide.image_url.is_empty() && !slide.image_url.starts_with("blob:") {
            println!("  {}  {}", "  ".repeat(depth), slide.image_url);
        }
        for img in slide.edit_images.iter().filter(|img| !img.is_parent()) {
            println!("  {}  {} {}", "  ".repeat(depth), image_token(img.order), img.blob_url);
        }
    }
    Ok(())
}
