use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use facetrack_index::FaceMatcher;
use facetrack_pipeline::Config;

#[derive(Parser)]
#[command(name = "facetrack", about = "Facetrack face gallery administration")]
struct Cli {
    /// Override the gallery data directory (default: FACETRACK_DATA_DIR).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a face embedding for a person
    Register {
        /// Person this embedding belongs to
        #[arg(short, long)]
        person_id: String,
        /// JSON file holding the embedding as an array of floats
        #[arg(short, long)]
        embedding: PathBuf,
        /// Encoding id (generated when omitted)
        #[arg(long)]
        face_id: Option<String>,
        /// Capture quality in [0, 1]
        #[arg(long)]
        quality: Option<f32>,
        /// Register even if the embedding already matches an enrolled person
        #[arg(long)]
        force: bool,
    },
    /// Query the gallery with a probe embedding
    Find {
        /// JSON file holding the embedding as an array of floats
        embedding: PathBuf,
        /// Maximum number of matches to report
        #[arg(short, long, default_value_t = 5)]
        max_matches: usize,
    },
    /// Remove an enrolled embedding
    Remove {
        /// Encoding id to remove
        face_id: String,
    },
    /// Show gallery statistics
    Stats,
    /// Force a persistence checkpoint
    Checkpoint,
}

fn load_embedding(path: &PathBuf) -> Result<Vec<f32>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading embedding from {}", path.display()))?;
    let values: Vec<f32> =
        serde_json::from_str(&raw).context("embedding file must be a JSON array of numbers")?;
    Ok(values)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if cli.data_dir.is_some() {
        config.data_dir = cli.data_dir.clone();
    }
    let matcher = FaceMatcher::open(config.matcher_config())?;

    match cli.command {
        Commands::Register {
            person_id,
            embedding,
            face_id,
            quality,
            force,
        } => {
            let values = load_embedding(&embedding)?;

            // Registration flows check for an already-enrolled identity
            // before adding a second person with the same face.
            if !force {
                let existing = matcher.find(&values, 1);
                if let Some(hit) = existing.first() {
                    if hit.person_id != person_id {
                        bail!(
                            "embedding matches enrolled person {} (confidence {:.2}); \
                             pass --force to register anyway",
                            hit.person_id,
                            hit.confidence
                        );
                    }
                }
            }

            let face_id = face_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let mut metadata =
                HashMap::from([("person_id".to_string(), person_id.clone())]);
            if let Some(q) = quality {
                metadata.insert("quality_score".to_string(), q.to_string());
            }

            matcher.add(&face_id, &values, metadata)?;
            matcher.shutdown();
            println!("Registered {face_id} for {person_id}");
        }
        Commands::Find {
            embedding,
            max_matches,
        } => {
            let values = load_embedding(&embedding)?;
            let results = matcher.find(&values, max_matches);
            if results.is_empty() {
                println!("No matches");
            } else {
                for (rank, result) in results.iter().enumerate() {
                    println!(
                        "{:>2}. {}  confidence {:.3}  encoding {}",
                        rank + 1,
                        result.person_id,
                        result.confidence,
                        result.encoding_id
                    );
                }
            }
        }
        Commands::Remove { face_id } => {
            if matcher.remove(&face_id)? {
                matcher.shutdown();
                println!("Removed {face_id}");
            } else {
                println!("No such encoding: {face_id}");
            }
        }
        Commands::Stats => {
            let stats = matcher.stats();
            println!("Backend:  {:?}", stats.backend);
            println!("Entries:  {}", stats.entries);
            println!("Persons:  {}", stats.persons);
            println!(
                "Cache:    {} entries, {} hits, {} misses",
                stats.cache.entries, stats.cache.hits, stats.cache.misses
            );
        }
        Commands::Checkpoint => {
            matcher.checkpoint_now();
            matcher.shutdown();
            println!("Checkpoint written");
        }
    }

    Ok(())
}
