use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indexmap::IndexMap;
use musette_contracts::generation::GenerationRequest;
use musette_contracts::metrics::{GroupMetrics, OutcomeAggregator};
use musette_contracts::models::{ToolRegistry, ToolSpec};
use musette_contracts::telemetry::TelemetryWriter;
use musette_engine::{GenerateError, GenerationResult, InferenceGateway};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "musette", version, about = "Musette generation toolkit")]
struct Cli {
    /// Directory generated artifacts are written to.
    #[arg(long, default_value = ".")]
    out: PathBuf,
    /// Append a JSONL telemetry trace to this file.
    #[arg(long)]
    telemetry: Option<PathBuf>,
    /// Group label for outcome bookkeeping.
    #[arg(long)]
    group: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate an Electronic Press Kit.
    Epk(EpkArgs),
    /// Generate marketing copy for a release.
    Copy(CopyArgs),
    /// Get marketing strategy advice.
    Advise(AdviseArgs),
    /// Create album artwork (original plus 3000x3000 upscale).
    AlbumArt(AlbumArtArgs),
    /// List the available tools.
    Tools(ToolsArgs),
    /// Run a JSONL plan and print per-group fairness metrics.
    Report(ReportArgs),
}

#[derive(Debug, Parser)]
struct EpkArgs {
    #[arg(long)]
    artist: String,
    #[arg(long)]
    genre: String,
    #[arg(long)]
    bio: String,
    #[arg(long, default_value = "")]
    achievements: String,
}

#[derive(Debug, Parser)]
struct CopyArgs {
    #[arg(long, value_enum)]
    release_type: ReleaseType,
    #[arg(long)]
    title: String,
    #[arg(long)]
    key_points: String,
    #[arg(long, default_value = "")]
    audience: String,
}

#[derive(Debug, Parser)]
struct AdviseArgs {
    #[arg(long)]
    project: String,
    #[arg(long)]
    goals: String,
    #[arg(long, default_value = "")]
    following: String,
    #[arg(long, default_value = "$0-$100")]
    budget: String,
}

#[derive(Debug, Parser)]
struct AlbumArtArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    style: String,
    #[arg(long, value_enum)]
    mood: Mood,
}

#[derive(Debug, Parser)]
struct ToolsArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct ReportArgs {
    /// JSONL plan: one {"tool", "group", "prompt"} object per line.
    #[arg(long)]
    plan: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReleaseType {
    Single,
    Ep,
    Album,
}

impl ReleaseType {
    fn label(self) -> &'static str {
        match self {
            ReleaseType::Single => "Single",
            ReleaseType::Ep => "EP",
            ReleaseType::Album => "Album",
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mood {
    Dark,
    Energetic,
    Peaceful,
    Mysterious,
    Joyful,
    Melancholic,
}

impl Mood {
    fn label(self) -> &'static str {
        match self {
            Mood::Dark => "Dark",
            Mood::Energetic => "Energetic",
            Mood::Peaceful => "Peaceful",
            Mood::Mysterious => "Mysterious",
            Mood::Joyful => "Joyful",
            Mood::Melancholic => "Melancholic",
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let registry = ToolRegistry::new(None);
    let outcomes = OutcomeAggregator::new();
    let mut gateway = InferenceGateway::from_env(outcomes);
    if let Some(path) = &cli.telemetry {
        let session_id = uuid::Uuid::new_v4().to_string();
        gateway = gateway.with_telemetry(TelemetryWriter::new(path, session_id));
    }
    let group = cli.group.as_deref();

    match &cli.command {
        Command::Epk(args) => cmd_text_tool(
            &gateway,
            &registry,
            &cli.out,
            group,
            "EPK Generator",
            epk_prompt(&args.artist, &args.genre, &args.bio, &args.achievements),
            format!("{}_EPK.txt", file_stem(&args.artist)),
        ),
        Command::Copy(args) => cmd_text_tool(
            &gateway,
            &registry,
            &cli.out,
            group,
            "Marketing Copy Generator",
            marketing_copy_prompt(
                args.release_type.label(),
                &args.title,
                &args.key_points,
                &args.audience,
            ),
            format!("{}_marketing_copy.txt", file_stem(&args.title)),
        ),
        Command::Advise(args) => cmd_text_tool(
            &gateway,
            &registry,
            &cli.out,
            group,
            "Marketing Advisor",
            advisor_prompt(&args.project, &args.following, &args.budget, &args.goals),
            "marketing_strategy.txt".to_string(),
        ),
        Command::AlbumArt(args) => cmd_album_art(&gateway, &registry, &cli.out, group, args),
        Command::Tools(args) => cmd_tools(&registry, args.json),
        Command::Report(args) => cmd_report(&gateway, &registry, args),
    }
}

fn cmd_text_tool(
    gateway: &InferenceGateway,
    registry: &ToolRegistry,
    out_dir: &Path,
    group: Option<&str>,
    tool_name: &str,
    prompt: String,
    file_name: String,
) -> Result<()> {
    let tool = lookup(registry, tool_name)?;
    let result = gateway.generate(tool, &GenerationRequest::from_prompt(prompt), group)?;
    let GenerationResult::Text(text) = result else {
        bail!("{tool_name} unexpectedly returned image data");
    };
    println!("{text}");
    let path = write_artifact(out_dir, &file_name, text.as_bytes())?;
    eprintln!("saved {}", path.display());
    Ok(())
}

fn cmd_album_art(
    gateway: &InferenceGateway,
    registry: &ToolRegistry,
    out_dir: &Path,
    group: Option<&str>,
    args: &AlbumArtArgs,
) -> Result<()> {
    let tool = lookup(registry, "Album Art Creator")?;
    let prompt = album_art_prompt(&args.title, &args.style, args.mood.label());
    let result = gateway.generate(tool, &GenerationRequest::from_prompt(prompt), group)?;
    let GenerationResult::Artwork(artwork) = result else {
        bail!("Album Art Creator unexpectedly returned text");
    };

    let stem = file_stem(&args.title);
    let (width, height) = artwork.original_dims;
    let original = write_artifact(
        out_dir,
        &format!("{stem}_album_art_{width}x{height}.png"),
        &artwork.original_png,
    )?;
    let (up_width, up_height) = artwork.upscaled_dims;
    let upscaled = write_artifact(
        out_dir,
        &format!("{stem}_album_art_{up_width}x{up_height}.png"),
        &artwork.upscaled_png,
    )?;
    println!("original  {}x{}  {}", width, height, original.display());
    println!("upscaled  {}x{}  {}", up_width, up_height, upscaled.display());
    Ok(())
}

fn cmd_tools(registry: &ToolRegistry, json: bool) -> Result<()> {
    if json {
        let tools: Vec<&ToolSpec> = registry.list().collect();
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }
    for tool in registry.list() {
        println!(
            "{:<26} {:<10} {:<16} {}",
            tool.name, tool.provider, tool.modality, tool.description
        );
    }
    Ok(())
}

fn cmd_report(
    gateway: &InferenceGateway,
    registry: &ToolRegistry,
    args: &ReportArgs,
) -> Result<()> {
    let raw = fs::read_to_string(&args.plan)
        .with_context(|| format!("failed to read {}", args.plan.display()))?;
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // One bad entry never aborts the run; later entries still execute
        // and the report still prints.
        let entry = match parse_plan_line(line) {
            Ok(entry) => entry,
            Err(err) => {
                eprintln!("plan line {}: {err:#}", idx + 1);
                continue;
            }
        };
        let Some(tool) = registry.get(&entry.tool) else {
            eprintln!("[{}] unknown tool '{}'", entry.group, entry.tool);
            gateway.outcomes().record_attempt(&entry.group);
            gateway.outcomes().record_failure(&entry.group);
            continue;
        };
        match gateway.generate(tool, &entry.request, Some(&entry.group)) {
            Ok(_) => println!("[{}] {} ok", entry.group, tool.name),
            Err(err) => {
                // Validation errors are rejected before the gateway tallies
                // the attempt, so the batch books them here.
                if matches!(err, GenerateError::InvalidParameterKind { .. }) {
                    gateway.outcomes().record_attempt(&entry.group);
                    gateway.outcomes().record_failure(&entry.group);
                }
                eprintln!("[{}] {} failed: {err}", entry.group, tool.name);
            }
        }
    }
    print_report(gateway.outcomes());
    Ok(())
}

#[derive(Debug, PartialEq)]
struct PlanEntry {
    tool: String,
    group: String,
    request: GenerationRequest,
}

fn parse_plan_line(line: &str) -> Result<PlanEntry> {
    let row: Value = serde_json::from_str(line).context("plan line is not valid JSON")?;
    let tool = row
        .get("tool")
        .and_then(Value::as_str)
        .context("plan entry missing 'tool'")?
        .to_string();
    let group = row
        .get("group")
        .and_then(Value::as_str)
        .context("plan entry missing 'group'")?
        .to_string();
    let prompt = row
        .get("prompt")
        .and_then(Value::as_str)
        .context("plan entry missing 'prompt'")?
        .to_string();
    let image_ref = row
        .get("image")
        .and_then(Value::as_str)
        .map(str::to_string);
    let mut overrides = IndexMap::new();
    if let Some(map) = row.get("overrides").and_then(Value::as_object) {
        for (key, value) in map {
            let number = value
                .as_f64()
                .with_context(|| format!("override '{key}' must be a number"))?;
            overrides.insert(key.clone(), number);
        }
    }
    Ok(PlanEntry {
        tool,
        group,
        request: GenerationRequest {
            prompt,
            image_ref,
            overrides,
        },
    })
}

fn print_report(outcomes: &OutcomeAggregator) {
    let snapshot = outcomes.snapshot();
    println!();
    println!(
        "{:<20} {:>9} {:>10} {:>17}",
        "group", "attempts", "success %", "mean latency (s)"
    );
    for (name, metrics) in &snapshot {
        println!(
            "{:<20} {:>9} {:>10.1} {:>17.3}",
            name,
            metrics.attempted,
            metrics.success_rate(),
            metrics.mean_latency()
        );
    }
    match outcomes.disparity(GroupMetrics::success_rate) {
        Ok(value) => println!("success-rate disparity: {value:.1}"),
        Err(err) => println!("success-rate disparity: {err}"),
    }
    match outcomes.disparity(GroupMetrics::mean_latency) {
        Ok(value) => println!("mean-latency disparity: {value:.3}s"),
        Err(err) => println!("mean-latency disparity: {err}"),
    }
}

fn lookup<'a>(registry: &'a ToolRegistry, name: &str) -> Result<&'a ToolSpec> {
    registry
        .get(name)
        .with_context(|| format!("unknown tool '{name}'"))
}

fn write_artifact(out_dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let path = out_dir.join(file_name);
    fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Deterministic artifact name component derived from a user-supplied title.
fn file_stem(title: &str) -> String {
    let cleaned: String = title
        .trim()
        .chars()
        .map(|item| {
            if item.is_alphanumeric() || item == '-' || item == '_' {
                item
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}

fn epk_prompt(artist: &str, genre: &str, bio: &str, achievements: &str) -> String {
    format!(
        "Create a professional Electronic Press Kit for:\n\
         Artist: {artist}\n\
         Genre: {genre}\n\
         Bio: {bio}\n\
         Achievements: {achievements}\n\
         \n\
         Format the EPK with these sections:\n\
         1. Artist Overview\n\
         2. Biography\n\
         3. Music Description\n\
         4. Achievements & Press\n\
         5. Contact Information (placeholder)\n\
         \n\
         Make it engaging and professional, highlighting the artist's unique qualities."
    )
}

fn marketing_copy_prompt(
    release_type: &str,
    title: &str,
    key_points: &str,
    audience: &str,
) -> String {
    format!(
        "Create marketing copy for:\n\
         Type: {release_type}\n\
         Title: {title}\n\
         Key Points: {key_points}\n\
         Target Audience: {audience}\n\
         \n\
         Generate:\n\
         1. Short description (50 words)\n\
         2. Long description (200 words)\n\
         3. Social media posts (3 variations)\n\
         4. Email newsletter copy\n\
         \n\
         Make it engaging and compelling for the target audience."
    )
}

fn advisor_prompt(project: &str, following: &str, budget: &str, goals: &str) -> String {
    format!(
        "Provide marketing strategy advice for:\n\
         Project: {project}\n\
         Current Following: {following}\n\
         Budget: {budget}\n\
         Goals: {goals}\n\
         \n\
         Include:\n\
         1. Overall Strategy\n\
         2. Platform-specific tactics\n\
         3. Budget allocation suggestions\n\
         4. Timeline recommendations\n\
         5. Key performance indicators\n\
         6. Potential challenges and solutions\n\
         \n\
         Make it practical and actionable within the given budget."
    )
}

fn album_art_prompt(title: &str, style: &str, mood: &str) -> String {
    format!(
        "Create professional album cover art:\n\
         Title: {title}\n\
         Style: {style}\n\
         Mood: {mood}\n\
         \n\
         Important requirements:\n\
         - Square format album cover\n\
         - High quality, professional look\n\
         - Clear focal point\n\
         - Suitable for both digital and print\n\
         - No text or typography (will be added later)\n\
         - Strong visual impact"
    )
}
