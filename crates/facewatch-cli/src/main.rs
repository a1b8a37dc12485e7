use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::pipeline::{FrameReport, Orchestrator, Outcome};
use facewatch_core::ports::TakeFrames;
use facewatch_core::smoother::Decision;
use facewatch_core::{AppearanceModel, CanonicalSample, Config, Mode, RegionVerifier};
use facewatch_hw::Camera;
use facewatch_store::{FsImageCodec, Store, StoreEventSink, User};
use image::DynamicImage;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Parser)]
#[command(name = "facewatch", about = "facewatch face recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage enrolled users
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Manage places where recognitions are recorded
    Place {
        #[command(subcommand)]
        action: PlaceAction,
    },
    /// Capture face samples for a user from the camera
    Enroll {
        /// User name or ID
        user: String,
        /// Number of samples to capture
        #[arg(short, long, default_value_t = 10)]
        samples: usize,
    },
    /// Add face samples for a user from image files
    Import {
        /// User name or ID
        user: String,
        /// Image files containing one face each
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show recorded recognition events
    Events {
        /// Only events for this user (name or ID)
        #[arg(long, conflicts_with = "place")]
        user: Option<String>,
        /// Only events at this place ID
        #[arg(long)]
        place: Option<i64>,
        /// Maximum number of events to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Run face detection on live frames and print the regions
    Detect {
        #[arg(short, long, default_value_t = 30)]
        frames: usize,
    },
    /// Run recognition on live frames, recording events
    Recognize {
        #[arg(short, long, default_value_t = 300)]
        frames: usize,
    },
    /// List V4L2 capture devices
    Devices,
}

#[derive(Subcommand)]
enum UserAction {
    /// Add a user
    Add { name: String },
    /// List users with their sample counts
    List,
    /// Rename a user
    Rename { id: i64, name: String },
}

#[derive(Subcommand)]
enum PlaceAction {
    /// Add a place
    Add {
        name: String,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// List places
    List,
    /// Change a place's name or description
    Update {
        id: i64,
        #[arg(short, long, required_unless_present = "description")]
        name: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        list_devices();
        return Ok(());
    }

    let config = Config::load().context("failed to load configuration")?;
    tracing::debug!(db = %config.db_path.display(), data = %config.data_dir.display(), "configuration loaded");
    let store = Store::open(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    match cli.command {
        Commands::User { action } => user_command(&store, action)?,
        Commands::Place { action } => place_command(&store, action)?,
        Commands::Enroll { user, samples } => enroll(&config, &store, &user, samples)?,
        Commands::Import { user, files } => import(&config, &store, &user, &files)?,
        Commands::Events { user, place, limit, json } => {
            show_events(&store, user.as_deref(), place, limit, json)?
        }
        Commands::Detect { frames } => detect(&config, frames)?,
        Commands::Recognize { frames } => recognize(&config, &store, frames)?,
        Commands::Devices => list_devices(),
    }

    Ok(())
}

fn list_devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
}

fn user_command(store: &Store, action: UserAction) -> Result<()> {
    match action {
        UserAction::Add { name } => {
            let user = store.add_user(&name)?;
            println!("Added user {} (id {})", user.name, user.id);
        }
        UserAction::List => {
            let users = store.list_users()?;
            if users.is_empty() {
                println!("No users enrolled");
            }
            for user in users {
                let samples = store.count_face_samples(user.id)?;
                let avg = store
                    .average_confidence(user.id)?
                    .map(|c| format!("{c:.1}"))
                    .unwrap_or_else(|| "-".into());
                println!("{:>4}  {:<24} samples: {:<4} avg confidence: {avg}", user.id, user.name, samples);
            }
        }
        UserAction::Rename { id, name } => {
            let user = store.rename_user(id, &name)?;
            println!("User {} is now {}", user.id, user.name);
        }
    }
    Ok(())
}

fn place_command(store: &Store, action: PlaceAction) -> Result<()> {
    match action {
        PlaceAction::Add { name, description } => {
            let place = store.add_place(&name, description.as_deref())?;
            println!("Added place {} (id {})", place.name, place.id);
        }
        PlaceAction::List => {
            for place in store.list_places()? {
                println!(
                    "{:>4}  {:<24} {}",
                    place.id,
                    place.name,
                    place.description.unwrap_or_default()
                );
            }
        }
        PlaceAction::Update { id, name, description } => {
            let place = store.update_place(id, name.as_deref(), description.as_deref())?;
            println!(
                "Place {} is now {} ({})",
                place.id,
                place.name,
                place.description.as_deref().unwrap_or("no description")
            );
        }
    }
    Ok(())
}

/// Look a user up by numeric ID first, then by exact name.
fn resolve_user(store: &Store, key: &str) -> Result<User> {
    if let Ok(id) = key.parse::<i64>() {
        if let Some(user) = store.get_user(id)? {
            return Ok(user);
        }
    }
    match store.find_user(key)? {
        Some(user) => Ok(user),
        None => bail!("no user named or numbered {key:?}"),
    }
}

fn load_verifier(config: &Config) -> Result<RegionVerifier> {
    let verifier = RegionVerifier::load(&config.cascade_dir)
        .with_context(|| format!("failed to load cascades from {}", config.cascade_dir.display()))?;
    Ok(verifier.with_scan_params(config.pipeline.face_scan, config.pipeline.eye_scan))
}

fn open_camera(config: &Config) -> Result<Camera> {
    Camera::open(&config.camera_device)
        .with_context(|| format!("failed to open camera {}", config.camera_device))
}

fn save_samples(store: &Store, codec: &FsImageCodec, user: &User, samples: Vec<CanonicalSample>) -> Result<usize> {
    let mut saved = 0;
    for sample in samples {
        let path = codec.save_sample_image(&DynamicImage::ImageLuma8(sample.into_image()), user.id)?;
        store.add_face_sample(user.id, &path.to_string_lossy())?;
        saved += 1;
    }
    Ok(saved)
}

fn enroll(config: &Config, store: &Store, user: &str, wanted: usize) -> Result<()> {
    let user = resolve_user(store, user)?;
    let codec = FsImageCodec::new(&config.data_dir);
    let mut orch = Orchestrator::new(load_verifier(config)?, AppearanceModel::default(), &config.pipeline);

    let camera = open_camera(config)?;
    let mut stream = camera.stream()?;
    stream.warm_up(config.warmup_frames)?;
    // Give up after ten frames per requested sample.
    let mut source = TakeFrames::new(stream, wanted.saturating_mul(10));

    println!("Look at the camera; capturing {wanted} samples for {}...", user.name);
    let stop = AtomicBool::new(false);
    let mut captured: Vec<CanonicalSample> = Vec::new();
    orch.run(&mut source, Mode::Capture, &stop, |report| {
        // One sample per frame, from the first usable face.
        let sample = report.faces.iter().find_map(|f| match &f.outcome {
            Outcome::Captured(sample) => Some(sample.clone()),
            _ => None,
        });
        if let Some(sample) = sample {
            captured.push(sample);
            println!("  sample {}/{wanted}", captured.len());
        }
        if captured.len() >= wanted {
            stop.store(true, Ordering::Relaxed);
        }
    })?;

    let saved = save_samples(store, &codec, &user, captured)?;
    println!("Saved {saved} samples for {}", user.name);
    if saved < wanted {
        println!("Fewer samples than requested; make sure your face is well lit.");
    }
    println!("Send SIGHUP to a running facewatchd to retrain.");
    Ok(())
}

fn import(config: &Config, store: &Store, user: &str, files: &[PathBuf]) -> Result<()> {
    let user = resolve_user(store, user)?;
    let codec = FsImageCodec::new(&config.data_dir);
    let mut orch = Orchestrator::new(load_verifier(config)?, AppearanceModel::default(), &config.pipeline);

    let mut samples = Vec::new();
    for file in files {
        let image = match codec.load(file) {
            Ok(img) => img,
            Err(e) => {
                eprintln!("skipping {}: {e}", file.display());
                continue;
            }
        };
        let report = orch.process_frame(Some(&image), Mode::Capture);
        // Keep the largest confirmed face.
        let best = report
            .faces
            .into_iter()
            .filter(|f| matches!(f.outcome, Outcome::Captured(_)))
            .max_by_key(|f| f.region.area());
        match best {
            Some(face) => {
                if let Outcome::Captured(sample) = face.outcome {
                    samples.push(sample);
                }
            }
            None => eprintln!("skipping {}: no face found", file.display()),
        }
    }

    let saved = save_samples(store, &codec, &user, samples)?;
    println!("Imported {saved} of {} files for {}", files.len(), user.name);
    Ok(())
}

fn show_events(store: &Store, user: Option<&str>, place: Option<i64>, limit: usize, json: bool) -> Result<()> {
    let mut events = match (user, place) {
        (Some(user), _) => store.events_for_user(resolve_user(store, user)?.id)?,
        (None, Some(place)) => store.events_at_place(place)?,
        (None, None) => store.recent_events(limit)?,
    };
    events.truncate(limit);

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    if events.is_empty() {
        println!("No recognition events");
        return Ok(());
    }

    let users: HashMap<i64, String> = store.list_users()?.into_iter().map(|u| (u.id, u.name)).collect();
    let places: HashMap<i64, String> = store.list_places()?.into_iter().map(|p| (p.id, p.name)).collect();
    for e in events {
        println!(
            "{}  {:<20} {:<20} {:>6}  {}",
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            users.get(&e.user_id).map(String::as_str).unwrap_or("?"),
            places.get(&e.place_id).map(String::as_str).unwrap_or("?"),
            e.confidence.map(|c| format!("{c:.1}")).unwrap_or_else(|| "-".into()),
            e.image_path,
        );
    }
    Ok(())
}

fn detect(config: &Config, frames: usize) -> Result<()> {
    let mut orch = Orchestrator::new(load_verifier(config)?, AppearanceModel::default(), &config.pipeline);
    let camera = open_camera(config)?;
    let mut stream = camera.stream()?;
    stream.warm_up(config.warmup_frames)?;

    let mut frame_no = 0usize;
    let summary = orch.run(
        &mut TakeFrames::new(stream, frames),
        Mode::Detect,
        &AtomicBool::new(false),
        |report| {
            frame_no += 1;
            let regions: Vec<String> = report
                .faces
                .iter()
                .map(|f| format!("{}x{}+{}+{}", f.region.width, f.region.height, f.region.x, f.region.y))
                .collect();
            println!("frame {frame_no:>4}: {} face(s) {}", regions.len(), regions.join(" "));
        },
    )?;
    println!(
        "{} frames, {} skipped, {} faces",
        summary.frames, summary.missing_frames, summary.faces
    );
    Ok(())
}

fn recognize(config: &Config, store: &Store, frames: usize) -> Result<()> {
    let codec = FsImageCodec::new(&config.data_dir);
    let place = store.ensure_place(&config.place)?;
    let model = AppearanceModel::new(config.pipeline.lbph);
    let mut orch = Orchestrator::new(load_verifier(config)?, model, &config.pipeline)
        .with_sink(StoreEventSink::new(store, &codec, place.id));
    orch.retrain(store, &codec).context("failed to train model")?;
    if !orch.classifier().is_trained() {
        println!("Nobody is enrolled yet; faces will be reported as unrecognized.");
    }

    let camera = open_camera(config)?;
    let mut stream = camera.stream()?;
    stream.warm_up(config.warmup_frames)?;

    let summary = orch.run(
        &mut TakeFrames::new(stream, frames),
        Mode::Recognize,
        &AtomicBool::new(false),
        print_recognitions,
    )?;
    println!(
        "{} frames, {} faces, {} events recorded at {}",
        summary.frames, summary.faces, summary.events, place.name
    );
    Ok(())
}

fn print_recognitions(report: &FrameReport) {
    for face in &report.faces {
        let r = &face.region;
        let text = match &face.outcome {
            Outcome::Recognized { raw, decision, recorded } => {
                let kind = match decision {
                    Decision::Stable(_) => "stable",
                    Decision::PassThrough(_) => "raw",
                };
                let d = decision.observation();
                format!(
                    "{} ({:.1}) -> {kind} {} ({:.1}){}",
                    raw.claim,
                    raw.confidence,
                    d.claim,
                    d.confidence,
                    if *recorded { " [recorded]" } else { "" }
                )
            }
            Outcome::NoModel => "no model".to_string(),
            Outcome::Unusable => "unusable crop".to_string(),
            Outcome::Detected | Outcome::Captured(_) => continue,
        };
        println!("{}x{}+{}+{}: {text}", r.width, r.height, r.x, r.y);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place_action(args: &[&str]) -> PlaceAction {
        let argv = ["facewatch", "place"].iter().chain(args).copied();
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Place { action } => action,
            _ => panic!("not a place command"),
        }
    }

    #[test]
    fn test_place_update_changes_only_given_fields() {
        let store = Store::in_memory().unwrap();
        let lobby = store.add_place("Lobby", Some("Ground floor")).unwrap();

        place_command(&store, place_action(&["update", &lobby.id.to_string(), "--name", "Front desk"])).unwrap();
        let place = store.get_place(lobby.id).unwrap().unwrap();
        assert_eq!(place.name, "Front desk");
        assert_eq!(place.description.as_deref(), Some("Ground floor"));

        place_command(&store, place_action(&["update", &lobby.id.to_string(), "-d", "Reception"])).unwrap();
        let place = store.get_place(lobby.id).unwrap().unwrap();
        assert_eq!(place.name, "Front desk");
        assert_eq!(place.description.as_deref(), Some("Reception"));
    }

    #[test]
    fn test_place_update_needs_a_field() {
        assert!(Cli::try_parse_from(["facewatch", "place", "update", "1"]).is_err());
    }

    #[test]
    fn test_place_update_unknown_id_fails() {
        let store = Store::in_memory().unwrap();
        assert!(place_command(&store, place_action(&["update", "42", "--name", "Nowhere"])).is_err());
    }

    #[test]
    fn test_resolve_user_by_id_or_name() {
        let store = Store::in_memory().unwrap();
        let ana = store.add_user("Ana").unwrap();
        assert_eq!(resolve_user(&store, "Ana").unwrap().id, ana.id);
        assert_eq!(resolve_user(&store, &ana.id.to_string()).unwrap().name, "Ana");
        assert!(resolve_user(&store, "Bob").is_err());
    }
}
