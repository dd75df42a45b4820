use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pictor::config::Config;
use pictor::discovery::discover_images;
use pictor::enrichers::local_catalog;
use pictor::enrichment::{ActiveEnrichers, EnricherCatalog, EnricherKind, EnrichmentPipeline};
use pictor::faces::{create_provider, FaceIdentifier, FaceProvider, FaceReconciler, IdentificationReport};
use pictor::logging::{self, LogTarget};
use pictor::photo::{Photo, SourceData};
use pictor::retry::RetryPolicy;
use pictor::store::MemoryStore;

enum Command {
    Plan,
    Enrich { paths: Vec<PathBuf>, identify: bool },
}

struct Args {
    config_path: Option<PathBuf>,
    faces: bool,
    log_stderr: bool,
    command: Command,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut faces = false;
    let mut log_stderr = false;
    let mut identify = false;
    let mut command = None;
    let mut paths = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("pictor {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--faces" => faces = true,
            "--identify" => {
                faces = true;
                identify = true;
            }
            "--log-stderr" => log_stderr = true,
            "plan" | "enrich" if command.is_none() => command = Some(args[i].clone()),
            arg if command.as_deref() == Some("enrich") && !arg.starts_with('-') => {
                paths.push(PathBuf::from(arg));
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let command = match command.as_deref() {
        Some("plan") => Command::Plan,
        Some("enrich") if !paths.is_empty() => Command::Enrich { paths, identify },
        Some("enrich") => {
            eprintln!("Error: enrich requires at least one path");
            std::process::exit(1);
        }
        _ => {
            print_help();
            std::process::exit(1);
        }
    };

    Args {
        config_path,
        faces,
        log_stderr,
        command,
    }
}

fn print_help() {
    println!(
        r#"pictor - photo enrichment and face identification

USAGE:
    pictor [OPTIONS] plan
    pictor [OPTIONS] enrich PATH...

COMMANDS:
    plan                Print the waves the configured enrichers run in
    enrich PATH...      Enrich every image under the given files or directories
                        and print the results as JSON

OPTIONS:
    --config, -c PATH   Path to config file
    --faces             Register the face enricher with the configured provider
    --identify          Detect faces and identify them against the provider
                        (implies --faces)
    --log-stderr        Log to stderr instead of journald or the log file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PICTOR_CONFIG       Path to config file (overrides default location)
    PICTOR_LOG          Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/pictor/config.toml"#
    );
}

/// Configured kinds that this binary can actually run. Kinds without a
/// registered enricher are left out with a warning.
fn runnable_kinds(config: &Config, catalog: &EnricherCatalog) -> BTreeSet<EnricherKind> {
    let available = catalog.kinds();
    let (runnable, unavailable): (BTreeSet<_>, BTreeSet<_>) = config
        .enrichment
        .active_kinds()
        .into_iter()
        .partition(|kind| available.contains(kind));
    if !unavailable.is_empty() {
        warn!(
            kinds = %unavailable.iter().map(|k| k.name()).collect::<Vec<_>>().join(", "),
            "No enricher available, skipping"
        );
    }
    runnable
}

#[derive(Serialize)]
struct PhotoResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    photo: Photo,
}

#[derive(Serialize)]
struct EnrichOutput {
    photos: Vec<PhotoResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    identification: Option<IdentificationReport>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn enrich(
    config: &Config,
    pipeline: &EnrichmentPipeline,
    provider: Option<Arc<dyn FaceProvider>>,
    paths: &[PathBuf],
    identify: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut images = Vec::new();
    for path in paths {
        images.extend(discover_images(path, &config.scanner.image_extensions)?);
    }

    let mut items = Vec::with_capacity(images.len());
    for (i, path) in images.into_iter().enumerate() {
        match SourceData::load(&path).await {
            Ok(source) => items.push((Photo::new(i as i64 + 1).with_path(path), source)),
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot read image"),
        }
    }
    if items.is_empty() {
        bail!("no images found");
    }

    let active = runnable_kinds(config, pipeline.catalog());
    let outcomes = pipeline.run_batch(items, &active, cancel).await;

    let store = MemoryStore::new();
    let mut results = Vec::with_capacity(outcomes.len());
    for mut outcome in outcomes {
        let error = outcome.result.err().map(|e| format!("{:#}", anyhow::Error::from(e)));
        if error.is_none() {
            store.import_faces(&mut outcome.photo, &outcome.source.face_images).await;
        }
        results.push(PhotoResult {
            error,
            photo: outcome.photo,
        });
    }

    let identification = match provider.filter(|_| identify) {
        Some(provider) => {
            let shared = Arc::new(store.clone());
            let retry = RetryPolicy::from(&config.retry);
            // Creates the collection on first use and trains before matching.
            FaceReconciler::new(
                provider.clone(),
                shared.clone(),
                shared.clone(),
                retry.clone(),
                config.faces.max_parallelism,
            )
            .reconcile(cancel)
            .await?;
            let identifier = FaceIdentifier::new(provider, shared.clone(), shared, retry);
            let report = identifier.identify_pending(cancel).await?;
            for result in &mut results {
                for face in &mut result.photo.faces {
                    if let Some(updated) = store.face(face.id).await {
                        *face = updated;
                    }
                }
            }
            Some(report)
        }
        None => None,
    };

    let failed = results.iter().filter(|r| r.error.is_some()).count();
    let total = results.len();
    print_json(&EnrichOutput {
        photos: results,
        identification,
    })?;

    if failed > 0 {
        bail!("{} of {} photos failed to enrich", failed, total);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let target = if args.log_stderr {
        LogTarget::Stderr
    } else {
        LogTarget::System
    };
    if let Err(e) = logging::init(target) {
        eprintln!("Warning: logging not initialised: {e:#}");
    }

    let config = match &args.config_path {
        Some(path) => Config::load_from(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load()?,
    };

    let provider = if args.faces {
        Some(create_provider(&config.faces)?)
    } else {
        None
    };
    let pipeline = EnrichmentPipeline::new(local_catalog(&config.enrichment, provider.clone()), &config.enrichment);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    match args.command {
        Command::Plan => {
            let active = runnable_kinds(&config, pipeline.catalog());
            let waves: Vec<Vec<&str>> = pipeline
                .plan(&active)?
                .iter()
                .map(|wave| wave.iter().map(|k| k.name()).collect())
                .collect();
            print_json(&waves)
        }
        Command::Enrich { paths, identify } => enrich(&config, &pipeline, provider, &paths, identify, &cancel).await,
    }
}
