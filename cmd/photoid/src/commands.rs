//! Subcommand implementations.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::Arc;

use anyhow::Context;
use photoid_kv::RedbStore;
use photoid_people::{CancelToken, Engine, EngineConfig, FaceInput, PipelineOptions};
use serde_json::json;

use crate::output::OutputFormat;
use crate::{Cli, Commands};

/// Faces per ingest transaction.
const INGEST_CHUNK: usize = 1000;

fn open_engine(cli: &Cli) -> anyhow::Result<Engine> {
    let cfg = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let kv = RedbStore::open(&cli.db).with_context(|| format!("open database {}", cli.db))?;
    Ok(Engine::new(Arc::new(kv), cfg)?)
}

/// Loads detector output: one JSON `FaceInput` per line.
fn read_faces(path: &str) -> anyhow::Result<Vec<FaceInput>> {
    let reader: Box<dyn BufRead> = if path == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(
            File::open(path).with_context(|| format!("open {path}"))?,
        ))
    };
    let mut faces = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let face: FaceInput =
            serde_json::from_str(&line).with_context(|| format!("{path}:{}", n + 1))?;
        faces.push(face);
    }
    Ok(faces)
}

pub fn run(cli: &Cli) -> anyhow::Result<()> {
    let out = OutputFormat::from_flag(cli.json);
    let engine = open_engine(cli)?;
    let cfg = engine.config().clone();
    let cancel = CancelToken::new();
    let verbose = cli.verbose;
    let progress = move |p: u8| {
        if verbose {
            eprintln!("[progress] {p}%");
        }
    };

    match &cli.command {
        Commands::Ingest { file } => {
            let faces = read_faces(file)?;
            let mut ids = Vec::with_capacity(faces.len());
            for chunk in faces.chunks(INGEST_CHUNK) {
                ids.extend(engine.ingest_faces(chunk)?);
            }
            out.write(&json!({ "ingested": ids.len() }))
        }
        Commands::Match { threshold } => {
            let threshold = threshold.unwrap_or(cfg.match_threshold);
            let assigned = engine.match_unlabeled_faces(threshold, &progress, &cancel)?;
            out.write(&json!({ "assigned": assigned }))
        }
        Commands::Discover { eps, min_samples } => {
            let assigned = engine.discover_clusters(
                eps.unwrap_or(cfg.cluster_eps),
                min_samples.unwrap_or(cfg.cluster_min_samples),
                &progress,
                &cancel,
            )?;
            out.write(&json!({ "assigned": assigned }))
        }
        Commands::Suggest { threshold } => {
            let suggestions = engine.suggest_merges(threshold.unwrap_or(cfg.suggest_threshold))?;
            out.write(&suggestions)
        }
        Commands::Merge { source, target } => out.write(&engine.merge(source, target)?),
        Commands::Dismiss { a, b } => {
            engine.dismiss_suggestion(a, b)?;
            out.write(&json!({ "dismissed": [a, b] }))
        }
        Commands::Cluster { dry_run } => {
            let opts = PipelineOptions {
                dry_run: *dry_run,
                ..Default::default()
            };
            let report = engine.run_pipeline(&opts, &progress, &cancel)?;
            out.write(&report)
        }
        Commands::People { hidden } => out.write(&engine.list_people(*hidden)?),
        Commands::Similar { id, threshold } => {
            let similar = engine.similar_to(id, threshold.unwrap_or(cfg.suggest_threshold))?;
            out.write(&similar)
        }
        Commands::Diagnose { id } => out.write(&engine.diagnose_person(id)?),
        Commands::Release { id } => {
            let released = engine.release_person(id)?;
            out.write(&json!({ "released_faces": released }))
        }
        Commands::Hide { id } => {
            engine.set_hidden(id, true)?;
            out.write(&engine.get_person(id)?)
        }
        Commands::Unhide { id } => {
            engine.set_hidden(id, false)?;
            out.write(&engine.get_person(id)?)
        }
        Commands::Star { id } => {
            engine.set_starred(id, true)?;
            out.write(&engine.get_person(id)?)
        }
        Commands::Unstar { id } => {
            engine.set_starred(id, false)?;
            out.write(&engine.get_person(id)?)
        }
        Commands::Rename { id, name } => out.write(&engine.rename_person(id, name)?),
    }
}
