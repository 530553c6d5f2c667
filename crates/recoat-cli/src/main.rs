use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use recoat_contracts::colors::{ColorChoice, PresetPalette};
use recoat_contracts::events::{EventWriter, SessionEvent};
use recoat_contracts::session::{RepaintOutcome, Session};
use recoat_engine::{
    extension_for_media_type, media_type_for_path, request_fingerprint, DryrunPainter,
    GeminiPainter, RepaintOptions, WallPainter, DEFAULT_IMAGE_MODEL,
};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "recoat", version, about = "Repaint the walls in a room photo with an image model")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Repaint one photo and save the result.
    Repaint(RepaintArgs),
    /// List the preset wall colors.
    Palette,
}

#[derive(Debug, Parser)]
struct RepaintArgs {
    /// Photo of the room (png, jpeg, webp, or gif).
    #[arg(long)]
    image: PathBuf,
    /// Preset color id (see `recoat palette`).
    #[arg(long)]
    color: Option<String>,
    /// Custom swatch as a hex code, e.g. #6366F1.
    #[arg(long)]
    hex: Option<String>,
    /// Free-text description of the desired wall treatment.
    #[arg(long)]
    describe: Option<String>,
    /// Output path; defaults to a name derived from the chosen color.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Append session lifecycle events to this JSONL file.
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_IMAGE_MODEL)]
    model: String,
    #[arg(long, default_value_t = 90)]
    timeout_secs: u64,
    /// Retry once after a transient transport failure.
    #[arg(long)]
    retry_transient: bool,
    /// Tint locally instead of calling the model (development only).
    #[arg(long)]
    dryrun: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("recoat error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Repaint(args) => run_repaint(args),
        Command::Palette => run_palette(),
    }
}

fn run_repaint(args: RepaintArgs) -> Result<i32> {
    let palette = PresetPalette::new(None);
    let choice = resolve_color(&palette, &args)?;
    let options = RepaintOptions {
        model: args.model.clone(),
        request_timeout: Duration::from_secs(args.timeout_secs),
        retry_transient_once: args.retry_transient,
    };
    let painter: Box<dyn WallPainter> = if args.dryrun {
        Box::new(DryrunPainter)
    } else {
        Box::new(GeminiPainter::from_env(options))
    };
    let events = args
        .events
        .as_ref()
        .map(|path| EventWriter::new(path, Uuid::new_v4().to_string()));
    repaint_once(
        &args.image,
        args.out.as_deref(),
        choice,
        painter.as_ref(),
        events.as_ref(),
    )
}

/// One full generate cycle: load -> pick color -> request -> land outcome.
fn repaint_once(
    image_path: &Path,
    out: Option<&Path>,
    choice: ColorChoice,
    painter: &dyn WallPainter,
    events: Option<&EventWriter>,
) -> Result<i32> {
    let Some(media_type) = media_type_for_path(image_path) else {
        bail!("not an image file: {}", image_path.display());
    };
    let bytes =
        fs::read(image_path).with_context(|| format!("failed reading {}", image_path.display()))?;

    let mut session = Session::new(PresetPalette::new(None).default_choice());
    session.load_image(bytes, media_type)?;
    emit_event(
        events,
        &SessionEvent::ImageLoaded {
            path: image_path.display().to_string(),
            media_type: media_type.to_string(),
            bytes: session.original().map(|image| image.data.len()).unwrap_or(0),
        },
    )?;

    session.select_color(choice.clone())?;
    emit_event(
        events,
        &SessionEvent::ColorSelected {
            color: choice.clone(),
        },
    )?;

    let request = session.begin_repaint()?;
    emit_event(
        events,
        &SessionEvent::RepaintStarted {
            request_id: request_fingerprint(&request),
            painter: painter.name().to_string(),
            media_type: request.media_type.clone(),
        },
    )?;

    match painter.repaint(&request) {
        Ok(generated) => {
            let extension = extension_for_media_type(&generated.media_type);
            let out_path = out
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(choice.download_file_name(extension)));
            fs::write(&out_path, &generated.data)
                .with_context(|| format!("failed to write {}", out_path.display()))?;
            emit_event(
                events,
                &SessionEvent::RepaintSucceeded {
                    bytes: generated.data.len(),
                    media_type: generated.media_type.clone(),
                },
            )?;
            emit_event(
                events,
                &SessionEvent::ArtifactSaved {
                    path: out_path.display().to_string(),
                },
            )?;
            session.complete(RepaintOutcome::Image(generated))?;
            println!("{}", out_path.display());
            Ok(0)
        }
        Err(err) => {
            let message = format!("{err:#}");
            emit_event(
                events,
                &SessionEvent::RepaintFailed {
                    message: message.clone(),
                },
            )?;
            session.complete(RepaintOutcome::Error(message.clone()))?;
            eprintln!("repaint failed: {message}");
            Ok(1)
        }
    }
}

fn run_palette() -> Result<i32> {
    let palette = PresetPalette::new(None);
    for color in palette.list() {
        println!(
            "{:<12} {:<8} {:<12} {}",
            color.id, color.hex, color.name, color.description
        );
    }
    Ok(0)
}

fn resolve_color(palette: &PresetPalette, args: &RepaintArgs) -> Result<ColorChoice> {
    let provided = [
        args.color.is_some(),
        args.hex.is_some(),
        args.describe.is_some(),
    ]
    .into_iter()
    .filter(|flag| *flag)
    .count();
    if provided > 1 {
        bail!("choose one of --color, --hex, or --describe");
    }
    if let Some(text) = args.describe.as_deref() {
        if text.trim().is_empty() {
            bail!("--describe is empty");
        }
        return Ok(ColorChoice::freeform(text));
    }
    if let Some(hex) = args.hex.as_deref() {
        let digits = hex.trim().trim_start_matches('#');
        if !(digits.len() == 3 || digits.len() == 6)
            || !digits.chars().all(|ch| ch.is_ascii_hexdigit())
        {
            bail!("invalid hex color '{hex}'");
        }
        return Ok(ColorChoice::custom(hex));
    }
    if let Some(id) = args.color.as_deref() {
        let Some(choice) = palette.get(id) else {
            bail!("unknown preset '{id}' (see `recoat palette`)");
        };
        return Ok(choice.clone());
    }
    Ok(palette.default_choice())
}

fn emit_event(events: Option<&EventWriter>, event: &SessionEvent) -> Result<()> {
    if let Some(writer) = events {
        writer.emit(event)?;
    }
    Ok(())
}
