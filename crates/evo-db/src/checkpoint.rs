//! Checkpoint codec.
//!
//! Serializes the store to an indented JSON document and restores it by
//! rebuilding islands through their normal constructor, then overwriting
//! the persisted state. Writes are write-then-rename so a crash never
//! leaves a truncated checkpoint behind.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use evo_core::config::DatabaseConfig;
use evo_core::{EvolutionStats, EvolveError, Program};

use crate::island::Island;
use crate::store::StoreInner;

pub const CHECKPOINT_VERSION: &str = "1.0";

/// On-disk checkpoint document.
#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub iteration: u64,
    pub generation: u64,
    pub islands: BTreeMap<usize, IslandSnapshot>,
    pub global_best: Option<Program>,
    pub stats: EvolutionStats,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IslandSnapshot {
    pub programs: HashMap<String, Program>,
    pub grid: GridSnapshot,
    /// `None` for an island that has never held a program (JSON has no
    /// representation for the −∞ sentinel).
    pub best_score: Option<f64>,
    pub best_id: Option<String>,
    pub generation: u64,
    pub migrated: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub dimensions: Vec<String>,
    pub resolution: HashMap<String, usize>,
    pub bounds: HashMap<String, [f64; 2]>,
    pub cells: HashMap<String, Program>,
    pub total_cells: usize,
    pub filled_cells: usize,
}

/// Build and persist a checkpoint. Called under the store's read lock.
pub(crate) fn save(
    inner: &StoreInner,
    iteration: u64,
    checkpoint_dir: &Path,
) -> Result<(), EvolveError> {
    let islands = inner
        .islands
        .iter()
        .map(|island| {
            let grid = island.grid();
            let snapshot = IslandSnapshot {
                programs: island
                    .programs
                    .iter()
                    .map(|(id, p)| (id.clone(), (**p).clone()))
                    .collect(),
                grid: GridSnapshot {
                    dimensions: grid.dimensions().to_vec(),
                    resolution: grid.resolution().clone(),
                    bounds: grid.bounds().clone(),
                    cells: grid
                        .cells()
                        .iter()
                        .map(|(key, p)| (key.clone(), (**p).clone()))
                        .collect(),
                    total_cells: grid.total_cells(),
                    filled_cells: grid.filled_cells(),
                },
                best_score: island.best_score.is_finite().then_some(island.best_score),
                best_id: island.best_id.clone(),
                generation: island.generation(),
                migrated: island.migrated(),
            };
            (island.id(), snapshot)
        })
        .collect();

    let checkpoint = Checkpoint {
        version: CHECKPOINT_VERSION.to_string(),
        created_at: Utc::now(),
        iteration,
        generation: inner.islands.first().map_or(0, |i| i.generation()),
        islands,
        global_best: inner
            .global_best_id
            .as_ref()
            .and_then(|id| inner.programs.get(id))
            .map(|p| (**p).clone()),
        stats: inner.stats.clone(),
    };

    let data = serde_json::to_vec_pretty(&checkpoint)?;
    std::fs::create_dir_all(checkpoint_dir)?;

    let file = checkpoint_dir.join(format!("checkpoint_{iteration}.json"));
    write_atomic(&file, &data)?;
    write_atomic(&checkpoint_dir.join("latest.json"), &data)?;

    info!(iteration, file = %file.display(), "saved checkpoint");
    Ok(())
}

/// Restore store state from a checkpoint file. Called under the store's
/// write lock.
pub(crate) fn load(
    inner: &mut StoreInner,
    config: &DatabaseConfig,
    path: &Path,
) -> Result<(), EvolveError> {
    let data = std::fs::read_to_string(path)?;
    let checkpoint: Checkpoint = serde_json::from_str(&data)?;

    let num_islands = checkpoint.islands.len().max(config.num_islands);
    let mut islands: Vec<Island> = (0..num_islands)
        .map(|id| Island::new(id, config))
        .collect();
    let mut programs: HashMap<String, Arc<Program>> = HashMap::new();

    for (id, snapshot) in checkpoint.islands {
        let Some(island) = islands.get_mut(id) else {
            continue;
        };

        let residents: HashMap<String, Arc<Program>> = snapshot
            .programs
            .into_iter()
            .map(|(pid, p)| (pid, Arc::new(p)))
            .collect();
        programs.extend(residents.iter().map(|(k, v)| (k.clone(), Arc::clone(v))));

        // Grid cells share the resident Arcs so the map stays the single
        // owner.
        let cells = snapshot
            .grid
            .cells
            .into_iter()
            .map(|(key, p)| {
                let arc = residents
                    .get(&p.id)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(p));
                (key, arc)
            })
            .collect();
        island.grid.restore_cells(
            cells,
            snapshot.grid.total_cells,
            snapshot.grid.filled_cells,
        );

        island.restore(
            residents,
            snapshot.best_score.unwrap_or(f64::NEG_INFINITY),
            snapshot.best_id,
            snapshot.generation,
            snapshot.migrated,
        );
    }

    inner.islands = islands;
    inner.global_best_id = checkpoint.global_best.as_ref().map(|p| p.id.clone());
    inner.global_best_score = checkpoint
        .global_best
        .as_ref()
        .map_or(f64::NEG_INFINITY, |p| p.score);
    inner.programs = programs;
    inner.stats = checkpoint.stats;
    inner.last_iteration = checkpoint.iteration;

    info!(
        iteration = checkpoint.iteration,
        programs = inner.programs.len(),
        file = %path.display(),
        "loaded checkpoint"
    );
    Ok(())
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), EvolveError> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ProgramStore;
    use std::collections::HashMap as StdHashMap;

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            num_islands: 2,
            grid_dimensions: vec!["complexity".to_string()],
            grid_resolution: StdHashMap::from([("complexity".to_string(), 5)]),
            grid_bounds: StdHashMap::from([("complexity".to_string(), [0.0, 1.0])]),
            output_dir: String::new(),
            ..DatabaseConfig::default()
        }
    }

    fn program(id: &str, score: f64, feature: f64, island: usize) -> Program {
        let mut p = Program::from_code(format!("fn {id}() {{}}"));
        p.id = id.to_string();
        p.score = score;
        p.features = vec![feature];
        p.island_id = Some(island);
        p
    }

    #[test]
    fn checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        let original = ProgramStore::new(config(), dir.path()).with_seed(42);
        original.add_program(program("test1", 0.8, 0.5, 0), 5);
        original.add_program(program("test2", 0.9, 0.7, 1), 5);
        original.save_checkpoint(5).unwrap();

        assert!(dir.path().join("checkpoint_5.json").exists());
        assert!(dir.path().join("latest.json").exists());

        let restored = ProgramStore::new(config(), dir.path()).with_seed(42);
        restored
            .load_checkpoint(dir.path().join("checkpoint_5.json"))
            .unwrap();

        let p1 = restored.get_program("test1").unwrap();
        assert_eq!(p1.code, "fn test1() {}");
        assert_eq!(p1.score, 0.8);

        let p2 = restored.get_program("test2").unwrap();
        assert_eq!(p2.code, "fn test2() {}");
        assert_eq!(p2.score, 0.9);

        let best = restored.global_best().unwrap();
        assert_eq!(best.id, "test2");

        assert_eq!(restored.len(), 2);
        assert_eq!(restored.last_iteration(), 5);
        assert_eq!(restored.stats().total_evaluations, 2);
    }

    #[test]
    fn latest_mirrors_numbered_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgramStore::new(config(), dir.path()).with_seed(42);
        store.add_program(program("p", 0.5, 0.5, 0), 3);
        store.save_checkpoint(3).unwrap();

        let numbered = std::fs::read(dir.path().join("checkpoint_3.json")).unwrap();
        let latest = std::fs::read(dir.path().join("latest.json")).unwrap();
        assert_eq!(numbered, latest);
    }

    #[test]
    fn checkpoint_document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgramStore::new(config(), dir.path()).with_seed(42);
        store.add_program(program("p", 0.5, 0.5, 0), 1);
        store.save_checkpoint(1).unwrap();

        let data = std::fs::read_to_string(dir.path().join("checkpoint_1.json")).unwrap();
        let checkpoint: Checkpoint = serde_json::from_str(&data).unwrap();

        assert_eq!(checkpoint.version, CHECKPOINT_VERSION);
        assert_eq!(checkpoint.iteration, 1);
        assert_eq!(checkpoint.islands.len(), 2);
        assert_eq!(checkpoint.global_best.unwrap().id, "p");

        let island0 = &checkpoint.islands[&0];
        assert_eq!(island0.programs.len(), 1);
        assert_eq!(island0.grid.filled_cells, 1);
        assert_eq!(island0.best_score, Some(0.5));

        // The empty island serializes its best as absent, not −∞.
        let island1 = &checkpoint.islands[&1];
        assert_eq!(island1.best_score, None);
    }

    #[test]
    fn grid_cells_share_resident_programs_after_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgramStore::new(config(), dir.path()).with_seed(42);
        store.add_program(program("p", 0.5, 0.5, 0), 1);
        store.save_checkpoint(1).unwrap();

        let restored = ProgramStore::new(config(), dir.path()).with_seed(42);
        restored.load_checkpoint(dir.path().join("latest.json")).unwrap();

        let inner = restored.inner.read().unwrap();
        let island = &inner.islands[0];
        let resident = island.programs.get("p").unwrap();
        let occupant = island.grid.cells().values().next().unwrap();
        assert!(Arc::ptr_eq(resident, occupant));
    }

    #[test]
    fn sampling_works_after_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgramStore::new(config(), dir.path()).with_seed(42);
        store.add_program(program("p", 0.5, 0.5, 0), 1);
        store.save_checkpoint(1).unwrap();

        let restored = ProgramStore::new(config(), dir.path()).with_seed(42);
        restored.load_checkpoint(dir.path().join("latest.json")).unwrap();

        let sampled = restored.sample_from_island(0).unwrap();
        assert_eq!(sampled.id, "p");
    }
}
