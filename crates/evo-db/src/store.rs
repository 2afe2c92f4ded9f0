//! Program store: N islands behind one readers-writer lock.
//!
//! Combines MAP-Elites with the island model. All mutations take the
//! write lock; reads share the read lock. Migration triggered by the
//! generation clock runs as a detached task that re-acquires the lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};
use uuid::Uuid;

use evo_core::config::DatabaseConfig;
use evo_core::{EvolutionStats, EvolveError, Program};

use crate::checkpoint;
use crate::island::Island;

/// Fraction of the island best score a program must exceed to become a
/// migration candidate.
const MIGRATION_CANDIDATE_RATIO: f64 = 0.8;

pub(crate) struct StoreInner {
    /// Global index: union of all islands' program maps.
    pub(crate) programs: HashMap<String, Arc<Program>>,
    pub(crate) islands: Vec<Island>,
    pub(crate) global_best_id: Option<String>,
    pub(crate) global_best_score: f64,
    /// Round-robin insertion cursor.
    pub(crate) current_island: usize,
    pub(crate) last_iteration: u64,
    pub(crate) last_migration_generation: u64,
    pub(crate) stats: EvolutionStats,
}

/// The quality-diversity population store.
pub struct ProgramStore {
    config: DatabaseConfig,
    checkpoint_dir: PathBuf,
    pub(crate) inner: RwLock<StoreInner>,
    rng: Mutex<StdRng>,
    /// Detached migration tasks, awaited before shutdown checkpoints.
    migrations: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ProgramStore {
    pub fn new(config: DatabaseConfig, checkpoint_dir: impl Into<PathBuf>) -> Self {
        if !config.output_dir.is_empty() {
            if let Err(e) = std::fs::create_dir_all(&config.output_dir) {
                warn!(dir = %config.output_dir, error = %e, "failed to create output directory");
            }
        }

        let islands = (0..config.num_islands)
            .map(|id| Island::new(id, &config))
            .collect();

        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        info!(islands = config.num_islands, "initialized program store");

        Self {
            config,
            checkpoint_dir: checkpoint_dir.into(),
            inner: RwLock::new(StoreInner {
                programs: HashMap::new(),
                islands,
                global_best_id: None,
                global_best_score: f64::NEG_INFINITY,
                current_island: 0,
                last_iteration: 0,
                last_migration_generation: 0,
                stats: EvolutionStats::default(),
            }),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            migrations: Mutex::new(Vec::new()),
        }
    }

    /// Replace the sampling RNG with a seeded one, for deterministic runs.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock().unwrap() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn num_islands(&self) -> usize {
        self.config.num_islands
    }

    /// Insert a program.
    ///
    /// Assigns an id when absent, rescales features against the target
    /// island's statistics, and routes to the program's own island when
    /// valid, otherwise to the round-robin cursor. Returns the stored
    /// program.
    pub fn add_program(&self, mut program: Program, iteration: u64) -> Arc<Program> {
        let mut inner = self.inner.write().unwrap();
        let inner = &mut *inner;

        if program.id.is_empty() {
            program.id = Uuid::new_v4().to_string();
        }
        program.updated_at = Utc::now();

        let target = match program.island_id {
            Some(id) if id < inner.islands.len() => id,
            _ => inner.current_island,
        };
        program.island_id = Some(target);

        let island = &mut inner.islands[target];
        program.features = island.scale_features(&program.features);

        let program = Arc::new(program);
        inner.programs.insert(program.id.clone(), Arc::clone(&program));
        island.add(Arc::clone(&program));

        if program.score > inner.global_best_score {
            inner.global_best_id = Some(program.id.clone());
            inner.global_best_score = program.score;
            info!(
                score = program.score,
                program = program.short_id(),
                island = target,
                iteration,
                "new global best program"
            );
        }

        inner.stats.total_evaluations += 1;
        if program.score > 0.0 {
            inner.stats.successful_evals += 1;
        } else {
            inner.stats.failed_evals += 1;
        }
        inner.stats.last_update = Utc::now();
        inner.last_iteration = iteration;

        inner.current_island = (inner.current_island + 1) % inner.islands.len();

        program
    }

    /// Look up a program by id.
    pub fn get_program(&self, id: &str) -> Option<Arc<Program>> {
        self.inner.read().unwrap().programs.get(id).cloned()
    }

    /// Total number of programs across all islands.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().programs.is_empty()
    }

    /// Sample a program from one island: grid first, then the resident
    /// map, then fail.
    pub fn sample_from_island(&self, island_id: usize) -> Result<Arc<Program>, EvolveError> {
        let inner = self.inner.read().unwrap();
        let island = inner
            .islands
            .get(island_id)
            .ok_or(EvolveError::InvalidIsland(island_id))?;

        let mut rng = self.rng.lock().unwrap();
        if let Some(program) = island.grid.sample(&mut *rng) {
            return Ok(program);
        }
        island
            .sample_resident(&mut *rng)
            .ok_or(EvolveError::EmptyPopulation { island: island_id })
    }

    /// Sample up to `count` programs, one from each consecutive island
    /// starting at the cursor, topping up from the global index.
    pub fn sample_multiple(&self, count: usize) -> Result<Vec<Arc<Program>>, EvolveError> {
        if count == 0 {
            return Err(EvolveError::InvalidConfig(
                "invalid sample count: 0".to_string(),
            ));
        }

        let inner = self.inner.read().unwrap();
        let mut rng = self.rng.lock().unwrap();
        let mut sampled = Vec::with_capacity(count);

        for i in 0..count.min(inner.islands.len()) {
            let island = &inner.islands[(inner.current_island + i) % inner.islands.len()];
            if let Some(program) = island.grid.sample(&mut *rng) {
                sampled.push(program);
            } else if let Some(best) = island.peek_best() {
                sampled.push(best);
            }
        }

        while sampled.len() < count && !inner.programs.is_empty() {
            let idx = rng.gen_range(0..inner.programs.len());
            if let Some(program) = inner.programs.values().nth(idx) {
                sampled.push(Arc::clone(program));
            }
        }

        Ok(sampled)
    }

    /// Ring-topology migration: each island sends its top performers to
    /// the next island. Conserves the total program count; the global
    /// index is untouched apart from island reassignment.
    pub fn migrate_programs(&self) -> Result<(), EvolveError> {
        let mut inner = self.inner.write().unwrap();
        let inner = &mut *inner;

        let n = inner.islands.len();
        if n < 2 {
            return Ok(());
        }

        let mut total_moved = 0usize;

        for i in 0..n {
            let target = (i + 1) % n;

            let mut candidates: Vec<Arc<Program>> = inner.islands[i]
                .programs
                .values()
                .filter(|p| p.score > inner.islands[i].best_score * MIGRATION_CANDIDATE_RATIO)
                .cloned()
                .collect();
            if candidates.is_empty() {
                continue;
            }
            candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

            let quota = ((candidates.len() as f64 * self.config.migration_rate) as usize)
                .max(1)
                .min(candidates.len());

            for migrant in candidates.into_iter().take(quota) {
                inner.islands[i].remove(&migrant.id);

                let mut moved = (*migrant).clone();
                moved.island_id = Some(target);
                let moved = Arc::new(moved);

                inner
                    .programs
                    .insert(moved.id.clone(), Arc::clone(&moved));
                inner.islands[target].add(Arc::clone(&moved));

                inner.islands[i].migrated += 1;
                total_moved += 1;
            }
        }

        info!(migrated = total_moved, "completed island migration");
        Ok(())
    }

    /// Advance every island's generation counter; when the migration
    /// interval has elapsed, schedule migration as a detached task.
    ///
    /// The migration generation is recorded at scheduling time so the
    /// clock cannot double-fire while the task waits for the write lock.
    pub fn update_generation(self: &Arc<Self>) {
        let migrate = {
            let mut inner = self.inner.write().unwrap();
            for island in &mut inner.islands {
                island.increment_generation();
            }

            let generation = inner.islands[0].generation();
            if generation - inner.last_migration_generation >= self.config.migration_interval {
                inner.last_migration_generation = generation;
                true
            } else {
                false
            }
        };

        if migrate {
            let store = Arc::clone(self);
            let handle = tokio::spawn(async move {
                if let Err(e) = store.migrate_programs() {
                    warn!(error = %e, "island migration failed");
                }
            });
            self.migrations.lock().unwrap().push(handle);
        }
    }

    /// Wait for any scheduled migrations so a shutdown checkpoint does
    /// not race a pending move.
    pub async fn await_migrations(&self) {
        let pending: Vec<_> = self.migrations.lock().unwrap().drain(..).collect();
        for handle in pending {
            let _ = handle.await;
        }
    }

    /// The globally best program, if any has been inserted.
    pub fn global_best(&self) -> Option<Arc<Program>> {
        let inner = self.inner.read().unwrap();
        inner
            .global_best_id
            .as_ref()
            .and_then(|id| inner.programs.get(id))
            .cloned()
    }

    /// Best program of each non-empty island.
    pub fn island_bests(&self) -> Vec<Arc<Program>> {
        let inner = self.inner.read().unwrap();
        inner
            .islands
            .iter()
            .filter_map(|island| island.peek_best())
            .collect()
    }

    /// Current round-robin cursor position.
    pub fn current_island(&self) -> usize {
        self.inner.read().unwrap().current_island
    }

    pub fn last_iteration(&self) -> u64 {
        self.inner.read().unwrap().last_iteration
    }

    /// Generation clock, read from the first island.
    pub fn generation(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        inner.islands.first().map_or(0, |i| i.generation())
    }

    /// Evolution statistics with derived fields filled in.
    pub fn stats(&self) -> EvolutionStats {
        let inner = self.inner.read().unwrap();
        let mut stats = inner.stats.clone();

        stats.duration = (Utc::now() - stats.start_time)
            .to_std()
            .unwrap_or_default();

        if !inner.programs.is_empty() {
            let total: f64 = inner.programs.values().map(|p| p.score).sum();
            stats.avg_score = total / inner.programs.len() as f64;
        }
        if inner.global_best_score.is_finite() {
            stats.best_score = inner.global_best_score;
        }

        stats
    }

    /// Save a checkpoint for the given iteration, mirrored to
    /// `latest.json`. A no-op when no checkpoint directory is configured.
    pub fn save_checkpoint(&self, iteration: u64) -> Result<(), EvolveError> {
        if self.checkpoint_dir.as_os_str().is_empty() {
            return Ok(());
        }
        let inner = self.inner.read().unwrap();
        checkpoint::save(&inner, iteration, &self.checkpoint_dir)
    }

    /// Restore state from a checkpoint file.
    pub fn load_checkpoint(&self, path: impl AsRef<Path>) -> Result<(), EvolveError> {
        let mut inner = self.inner.write().unwrap();
        checkpoint::load(&mut inner, &self.config, path.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn config(num_islands: usize) -> DatabaseConfig {
        DatabaseConfig {
            num_islands,
            grid_dimensions: vec!["complexity".to_string()],
            grid_resolution: StdHashMap::from([("complexity".to_string(), 5)]),
            grid_bounds: StdHashMap::from([("complexity".to_string(), [0.0, 1.0])]),
            output_dir: String::new(),
            ..DatabaseConfig::default()
        }
    }

    fn program(id: &str, score: f64, features: Vec<f64>, island: Option<usize>) -> Program {
        let mut p = Program::from_code(format!("fn {id}() {{}}"));
        p.id = id.to_string();
        p.score = score;
        p.features = features;
        p.island_id = island;
        p
    }

    fn store(num_islands: usize) -> ProgramStore {
        ProgramStore::new(config(num_islands), "").with_seed(42)
    }

    #[test]
    fn new_store_is_empty() {
        let store = store(3);
        assert_eq!(store.num_islands(), 3);
        assert_eq!(store.current_island(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn add_program_assigns_id_and_tracks_best() {
        let store = store(2);
        let stored = store.add_program(program("", 0.7, vec![0.5], None), 1);
        assert!(!stored.id.is_empty());

        let fetched = store.get_program(&stored.id).unwrap();
        assert_eq!(fetched.code, stored.code);

        let best = store.global_best().unwrap();
        assert_eq!(best.id, stored.id);
    }

    #[test]
    fn round_robin_assignment() {
        let store = store(2);
        let a = store.add_program(program("a", 0.1, vec![0.1], None), 1);
        let b = store.add_program(program("b", 0.2, vec![0.2], None), 2);
        let c = store.add_program(program("c", 0.3, vec![0.3], None), 3);

        assert_eq!(a.island_id, Some(0));
        assert_eq!(b.island_id, Some(1));
        assert_eq!(c.island_id, Some(0));
        assert_eq!(store.current_island(), 1);
    }

    #[test]
    fn explicit_island_assignment_respected() {
        let store = store(3);
        let p = store.add_program(program("p", 0.5, vec![0.5], Some(2)), 1);
        assert_eq!(p.island_id, Some(2));

        // Out-of-range assignment falls back to the cursor.
        let q = store.add_program(program("q", 0.5, vec![0.5], Some(99)), 2);
        assert_eq!(q.island_id, Some(1));
    }

    #[test]
    fn sample_from_island_prefers_grid_then_errors_when_empty() {
        let store = store(2);
        store.add_program(program("p", 0.8, vec![0.5], Some(0)), 1);

        let sampled = store.sample_from_island(0).unwrap();
        assert_eq!(sampled.id, "p");

        let err = store.sample_from_island(1).unwrap_err();
        assert!(matches!(err, EvolveError::EmptyPopulation { island: 1 }));

        let err = store.sample_from_island(9).unwrap_err();
        assert!(matches!(err, EvolveError::InvalidIsland(9)));
    }

    #[test]
    fn sample_multiple_rejects_zero() {
        let store = store(2);
        assert!(store.sample_multiple(0).is_err());
    }

    #[test]
    fn sample_multiple_tops_up_from_global_index() {
        let store = store(3);
        store.add_program(program("p", 0.8, vec![0.5], Some(0)), 1);

        // Only one island is populated; the rest of the request is filled
        // from the global index.
        let sampled = store.sample_multiple(3).unwrap();
        assert_eq!(sampled.len(), 3);
        for s in sampled {
            assert_eq!(s.id, "p");
        }
    }

    #[test]
    fn migration_conserves_program_count() {
        let mut cfg = config(3);
        cfg.migration_rate = 0.5;
        let store = ProgramStore::new(cfg, "").with_seed(42);

        for island in 0..3 {
            for j in 0..4 {
                store.add_program(
                    program(
                        &format!("island{island}_prog{j}"),
                        j as f64 * 0.1,
                        vec![j as f64 * 0.1],
                        Some(island),
                    ),
                    1,
                );
            }
        }
        assert_eq!(store.len(), 12);

        store.migrate_programs().unwrap();

        let inner = store.inner.read().unwrap();
        let per_island: Vec<usize> = inner.islands.iter().map(|i| i.len()).collect();
        assert_eq!(per_island.iter().sum::<usize>(), 12);
        assert_eq!(inner.programs.len(), 12);

        // No program may appear on two islands.
        for island in &inner.islands {
            for id in island.programs.keys() {
                let holders = inner
                    .islands
                    .iter()
                    .filter(|other| other.programs.contains_key(id))
                    .count();
                assert_eq!(holders, 1, "program {id} present on {holders} islands");
            }
        }

        // Every moved program's island assignment matches its holder.
        for island in &inner.islands {
            for (id, p) in &island.programs {
                assert_eq!(p.island_id, Some(island.id()), "program {id}");
            }
        }
    }

    #[test]
    fn migration_counts_emigrants_per_island() {
        let mut cfg = config(2);
        cfg.migration_rate = 1.0;
        let store = ProgramStore::new(cfg, "").with_seed(42);

        store.add_program(program("a", 1.0, vec![0.1], Some(0)), 1);
        store.add_program(program("b", 0.95, vec![0.9], Some(0)), 2);

        store.migrate_programs().unwrap();

        let inner = store.inner.read().unwrap();
        assert_eq!(inner.programs.len(), 2);

        // Both programs clear the 0.8 * best bar, so island 0 sends both
        // to island 1; when the ring reaches island 1 they qualify again
        // and move on to island 0. Each island counts its own emigrants.
        assert_eq!(inner.islands[0].migrated(), 2);
        assert_eq!(inner.islands[1].migrated(), 2);
        for p in inner.islands[0].programs.values() {
            assert_eq!(p.island_id, Some(0));
        }
        assert!(inner.islands[1].is_empty());
    }

    #[test]
    fn migration_single_island_is_noop() {
        let store = store(1);
        store.add_program(program("p", 0.5, vec![0.5], Some(0)), 1);
        store.migrate_programs().unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn generation_clock_schedules_migration() {
        let mut cfg = config(2);
        cfg.migration_interval = 2;
        let store = Arc::new(ProgramStore::new(cfg, "").with_seed(42));

        store.add_program(program("a", 1.0, vec![0.2], Some(0)), 1);
        store.add_program(program("b", 0.9, vec![0.8], Some(0)), 2);

        store.update_generation();
        assert_eq!(
            store.inner.read().unwrap().last_migration_generation,
            0,
            "one generation must not trigger migration"
        );

        store.update_generation();
        assert_eq!(store.inner.read().unwrap().last_migration_generation, 2);

        // Let the detached migration task run.
        store.await_migrations().await;
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn stats_track_success_and_averages() {
        let store = store(1);
        for (i, score) in [0.0, 0.3, 0.6].iter().enumerate() {
            store.add_program(program(&format!("p{i}"), *score, vec![*score], None), 1);
        }

        let stats = store.stats();
        assert_eq!(stats.total_evaluations, 3);
        assert_eq!(stats.successful_evals, 2);
        assert_eq!(stats.failed_evals, 1);
        assert!((stats.best_score - 0.6).abs() < 1e-9);
        assert!((stats.avg_score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn global_index_matches_island_union() {
        let store = store(3);
        for i in 0..7 {
            store.add_program(
                program(&format!("p{i}"), i as f64 * 0.1, vec![i as f64 * 0.1], None),
                i,
            );
        }

        let inner = store.inner.read().unwrap();
        let union: usize = inner.islands.iter().map(|i| i.len()).sum();
        assert_eq!(union, inner.programs.len());
        for island in &inner.islands {
            for id in island.programs.keys() {
                assert!(inner.programs.contains_key(id));
            }
        }
    }
}
