use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use atelier_contracts::config::StudioConfig;
use atelier_contracts::events::EventWriter;
use atelier_contracts::jobs::{
    Failure, FailureKind, GenerationKind, GenerationOutput, GenerationRequest, JobResult,
    ReferenceMedia, PARAM_ASPECT_RATIO, PARAM_DURATION, PARAM_IMAGE_SIZE,
};
use atelier_contracts::prompts::{
    build_video_prompt, compose_video_brief, find_template, with_render_settings, ProductBrief,
    VideoTemplate, DEFAULT_VIDEO_DURATION_S, DEFAULT_VIDEO_RATIO, VIDEO_TEMPLATES,
};
use atelier_contracts::providers::{ProviderTarget, TargetRegistry};
use atelier_contracts::runs::receipts::{build_receipt, write_receipt};
use atelier_engine::{HttpTransport, Orchestrator};
use chrono::Utc;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "Product image and video generation workbench")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Image(ImageArgs),
    Edit(EditArgs),
    Video(VideoArgs),
    Brief(BriefArgs),
    Targets,
}

#[derive(Debug, Parser)]
struct OutputArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ImageArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    target: Option<String>,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long)]
    image_size: Option<String>,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Parser)]
struct EditArgs {
    #[arg(long = "image", required = true)]
    images: Vec<PathBuf>,
    #[command(flatten)]
    image: ImageArgs,
}

#[derive(Debug, Parser)]
struct VideoArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
    /// Wraps the prompt in a commercial template; its ratio and duration become the defaults.
    #[arg(long)]
    template: Option<String>,
    #[arg(long, default_value = "Global")]
    market: String,
    #[arg(long)]
    ratio: Option<String>,
    #[arg(long)]
    duration: Option<u32>,
    /// Repeat to render several versions side by side.
    #[arg(long = "target")]
    targets: Vec<String>,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Parser)]
struct BriefArgs {
    #[arg(long)]
    template: Option<String>,
    #[arg(long, default_value = "")]
    product: String,
    #[arg(long, default_value = "")]
    category: String,
    #[arg(long, default_value = "Global")]
    market: String,
    #[arg(long, default_value = "")]
    price_tier: String,
    #[arg(long = "style")]
    style_tags: Vec<String>,
    #[arg(long, default_value = "")]
    motion: String,
    #[arg(long, default_value = "")]
    mood: String,
    #[arg(long, default_value = "")]
    shots: String,
    /// Plain-text product document; only its opening is used.
    #[arg(long)]
    doc: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Image(args) => run_image(GenerationKind::Image, args, Vec::new()),
        Command::Edit(args) => {
            let references = args
                .images
                .iter()
                .map(|path| read_reference(path))
                .collect::<Result<Vec<_>>>()?;
            run_image(GenerationKind::ImageEdit, args.image, references)
        }
        Command::Video(args) => run_video(args),
        Command::Brief(args) => run_brief(args),
        Command::Targets => run_targets(),
    }
}

struct Session {
    config: StudioConfig,
    registry: TargetRegistry,
    events: EventWriter,
    out_dir: PathBuf,
}

impl Session {
    fn open(output: &OutputArgs) -> Result<Self> {
        fs::create_dir_all(&output.out)
            .with_context(|| format!("failed to create {}", output.out.display()))?;
        let config = StudioConfig::from_env()?;
        let registry = config.target_registry();
        let events_path = output
            .events
            .clone()
            .unwrap_or_else(|| output.out.join("events.jsonl"));
        let session_id = format!("session-{}", Utc::now().format("%Y%m%dT%H%M%S"));
        Ok(Self {
            config,
            registry,
            events: EventWriter::new(events_path, session_id),
            out_dir: output.out.clone(),
        })
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(&self.config, Arc::new(HttpTransport::new()))
            .with_events(self.events.clone())
    }

    fn pick_target(&self, requested: Option<&str>, kind: GenerationKind) -> Result<ProviderTarget> {
        let selection = self
            .registry
            .select(requested, kind)
            .map_err(anyhow::Error::msg)?;
        if let Some(reason) = selection.fallback_reason.as_deref() {
            println!("{reason} Using '{}'.", selection.target.name);
        }
        Ok(selection.target)
    }

    fn record(
        &self,
        label: &str,
        request: &GenerationRequest,
        target: &ProviderTarget,
        outcome: &JobResult,
        artifacts: &[PathBuf],
    ) -> Result<PathBuf> {
        let receipt_path = self.out_dir.join(format!("receipt-{label}.json"));
        let receipt = build_receipt(label, request, target, outcome, artifacts);
        write_receipt(&receipt_path, &receipt)
            .with_context(|| format!("failed to write {}", receipt_path.display()))?;
        Ok(receipt_path)
    }
}

fn run_image(
    kind: GenerationKind,
    args: ImageArgs,
    references: Vec<ReferenceMedia>,
) -> Result<i32> {
    let session = Session::open(&args.output)?;
    let target = session.pick_target(args.target.as_deref(), kind)?;
    let mut request = GenerationRequest::new(kind, args.prompt.clone());
    for media in references {
        request = request.with_reference(media);
    }
    if let Some(ratio) = args.aspect_ratio.as_deref() {
        request = request.with_parameter(PARAM_ASPECT_RATIO, ratio);
    }
    if let Some(size) = args.image_size.as_deref() {
        request = request.with_parameter(PARAM_IMAGE_SIZE, size);
    }

    println!("Submitting {} job to {} ({})", kind.as_str(), target.name, target.model);
    let outcome = session.orchestrator().submit(&request, &target);
    let label = format!("{}-{}", kind.as_str(), Utc::now().format("%Y%m%dT%H%M%S"));
    let artifacts = match &outcome {
        Ok(output) => write_images(&session.out_dir, &label, output)?,
        Err(_) => Vec::new(),
    };
    let receipt_path = session.record(&label, &request, &target, &outcome, &artifacts)?;

    match &outcome {
        Ok(output) => {
            report_success(output, &artifacts);
            println!("Receipt: {}", receipt_path.display());
            Ok(0)
        }
        Err(failure) => {
            report_failure(&target.name, failure);
            Ok(1)
        }
    }
}

/// Finished renders keyed by target name, one entry per requested target.
#[derive(Debug, Default)]
struct VideoVersions {
    results: BTreeMap<String, JobResult>,
}

impl VideoVersions {
    fn insert(&mut self, target: impl Into<String>, outcome: JobResult) {
        self.results.insert(target.into(), outcome);
    }

    fn get(&self, target: &str) -> Option<&JobResult> {
        self.results.get(target)
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &JobResult)> {
        self.results.iter()
    }

    fn succeeded(&self) -> usize {
        self.results.values().filter(|outcome| outcome.is_ok()).count()
    }

    fn len(&self) -> usize {
        self.results.len()
    }
}

fn run_video(args: VideoArgs) -> Result<i32> {
    let session = Session::open(&args.output)?;
    let template = match args.template.as_deref() {
        Some(name) => Some(
            find_template(name).with_context(|| format!("unknown video template '{name}'"))?,
        ),
        None => None,
    };
    let request = video_request(
        &args.prompt,
        template,
        &args.market,
        args.ratio.as_deref(),
        args.duration,
        read_reference(&args.image)?,
    );

    let targets = if args.targets.is_empty() {
        vec![session.pick_target(None, GenerationKind::Video)?]
    } else {
        let mut picked: Vec<ProviderTarget> = Vec::new();
        for name in &args.targets {
            let target = session.pick_target(Some(name), GenerationKind::Video)?;
            if !picked.iter().any(|row| row.name == target.name) {
                picked.push(target);
            }
        }
        picked
    };

    let orchestrator = session.orchestrator();
    println!(
        "Rendering {} video version(s): {}",
        targets.len(),
        targets
            .iter()
            .map(|target| target.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let versions = render_versions(&orchestrator, &request, &targets);

    let stamp = Utc::now().format("%Y%m%dT%H%M%S").to_string();
    for target in &targets {
        let Some(outcome) = versions.get(&target.name) else {
            continue;
        };
        let label = format!("video-{}-{stamp}", target.name);
        let artifacts = match outcome {
            Ok(output) => write_video(&session.out_dir, &target.name, output)?
                .into_iter()
                .collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        session.record(&label, &request, target, outcome, &artifacts)?;
    }

    for (name, outcome) in versions.iter() {
        match outcome {
            Ok(output) => {
                println!("[{name}] done");
                let artifact = session.out_dir.join(video_file_name(name));
                report_success(output, &[artifact]);
            }
            Err(failure) => report_failure(name, failure),
        }
    }
    println!("{}/{} versions succeeded", versions.succeeded(), versions.len());
    Ok(if versions.succeeded() == versions.len() { 0 } else { 1 })
}

/// Explicit flags win over the template; without either the render is 16:9, 10s.
fn video_request(
    prompt: &str,
    template: Option<&VideoTemplate>,
    market: &str,
    ratio: Option<&str>,
    duration: Option<u32>,
    reference: ReferenceMedia,
) -> GenerationRequest {
    let prompt = match template {
        Some(template) => build_video_prompt(template, prompt, market),
        None => prompt.to_string(),
    };
    let ratio = ratio
        .or_else(|| template.map(|template| template.ratio))
        .unwrap_or(DEFAULT_VIDEO_RATIO);
    let duration = duration
        .or_else(|| template.map(|template| template.duration_s))
        .unwrap_or(DEFAULT_VIDEO_DURATION_S);
    GenerationRequest::new(
        GenerationKind::Video,
        with_render_settings(&prompt, ratio, duration),
    )
    .with_reference(reference)
    .with_parameter(PARAM_ASPECT_RATIO, ratio)
    .with_parameter(PARAM_DURATION, duration)
}

/// Submits one job per target concurrently and waits for all of them.
fn render_versions(
    orchestrator: &Orchestrator,
    request: &GenerationRequest,
    targets: &[ProviderTarget],
) -> VideoVersions {
    let mut versions = VideoVersions::default();
    thread::scope(|scope| {
        let handles = targets
            .iter()
            .map(|target| {
                let handle = scope.spawn(move || orchestrator.submit(request, target));
                (target.name.clone(), handle)
            })
            .collect::<Vec<_>>();
        for (name, handle) in handles {
            let outcome = handle.join().unwrap_or_else(|_| {
                Err(Failure::new(
                    FailureKind::Configuration,
                    format!("render thread for '{name}' panicked"),
                ))
            });
            versions.insert(name, outcome);
        }
    });
    versions
}

fn run_brief(args: BriefArgs) -> Result<i32> {
    let Some(name) = args.template.as_deref() else {
        for template in VIDEO_TEMPLATES {
            println!(
                "{:<26} {:<10} {:>3}s  {:<5} {} / {} / {}",
                template.name,
                template.platform,
                template.duration_s,
                template.ratio,
                template.motion,
                template.lighting,
                template.style
            );
        }
        return Ok(0);
    };
    let Some(template) = find_template(name) else {
        bail!("unknown video template '{name}'");
    };
    let doc_text = match args.doc.as_deref() {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => String::new(),
    };
    let brief = ProductBrief {
        name: args.product,
        category: args.category,
        market: args.market,
        price_tier: args.price_tier,
        style_tags: args.style_tags,
        custom_motion: args.motion,
        mood: args.mood,
        shot_list: args.shots,
        doc_text,
    };
    println!("{}", compose_video_brief(template, &brief));
    Ok(0)
}

fn run_targets() -> Result<i32> {
    let config = StudioConfig::from_env()?;
    for target in config.target_registry().list() {
        println!(
            "{:<14} {:<9} {:<28} {} (key: {})",
            target.name,
            target.mode.as_str(),
            target.model,
            target.api_base(),
            if target.api_key.is_some() { "set" } else { "missing" }
        );
    }
    Ok(0)
}

fn read_reference(path: &Path) -> Result<ReferenceMedia> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if bytes.is_empty() {
        bail!("reference image {} is empty", path.display());
    }
    Ok(ReferenceMedia::new(
        bytes,
        mime_for_path(path).unwrap_or("image/png"),
    ))
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

fn extension_for_mime(mime_type: Option<&str>) -> &'static str {
    let lowered = mime_type.unwrap_or_default().to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        "jpg"
    } else if lowered.contains("webp") {
        "webp"
    } else {
        "png"
    }
}

fn write_images(out_dir: &Path, label: &str, output: &GenerationOutput) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for (idx, image) in output.images.iter().enumerate() {
        let path = out_dir.join(format!(
            "{label}-{idx:02}.{}",
            extension_for_mime(image.mime_type.as_deref())
        ));
        fs::write(&path, &image.bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

fn video_file_name(target: &str) -> String {
    let safe = target
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect::<String>();
    format!("video-{safe}.mp4")
}

fn write_video(out_dir: &Path, target: &str, output: &GenerationOutput) -> Result<Option<PathBuf>> {
    let Some(bytes) = output.video_bytes() else {
        return Ok(None);
    };
    let path = out_dir.join(video_file_name(target));
    fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(Some(path))
}

fn report_success(output: &GenerationOutput, artifacts: &[PathBuf]) {
    for path in artifacts {
        println!("Saved {}", path.display());
    }
    if let Some(locator) = output.video.as_ref().and_then(|video| video.locator.as_deref()) {
        println!("Source: {locator}");
    }
    if let Some(text) = output.text.as_deref() {
        if output.video.is_none() {
            println!("Model said: {text}");
        }
    }
    for warning in &output.warnings {
        println!("Warning: {warning}");
    }
}

fn report_failure(target: &str, failure: &Failure) {
    eprintln!("[{target}] failed ({}): {}", failure.kind.as_str(), failure.message);
    if let Some(status) = failure.status {
        eprintln!("  status: {status}");
    }
    if let Some(raw) = failure.raw_body.as_deref() {
        eprintln!("  provider response: {raw}");
    }
    if failure.resubmittable() {
        eprintln!("  the job can be submitted again");
    }
}
