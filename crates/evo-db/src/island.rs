//! Island: one parallel population.
//!
//! Holds a program map (superset of the grid's occupants), the MAP-Elites
//! grid, a best-program cache, and per-dimension running feature
//! statistics used to rescale raw features before grid placement.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;

use evo_core::config::DatabaseConfig;
use evo_core::Program;

use crate::grid::MapGrid;

/// Welford running statistics for one feature dimension.
#[derive(Debug, Clone)]
pub struct FeatureStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    m2: f64,
    pub count: u64,
    pub last_update: DateTime<Utc>,
}

impl FeatureStats {
    fn new() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            m2: 0.0,
            count: 0,
            last_update: Utc::now(),
        }
    }

    fn update(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;

        self.last_update = Utc::now();
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.m2 / self.count as f64
    }

    pub fn std(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// One island of the population.
#[derive(Debug)]
pub struct Island {
    id: usize,
    pub(crate) programs: HashMap<String, Arc<Program>>,
    pub(crate) grid: MapGrid,
    pub(crate) best_score: f64,
    pub(crate) best_id: Option<String>,
    pub(crate) generation: u64,
    pub(crate) migrated: u64,
    feature_stats: HashMap<String, FeatureStats>,
}

impl Island {
    pub fn new(id: usize, config: &DatabaseConfig) -> Self {
        let feature_stats = config
            .grid_dimensions
            .iter()
            .map(|dim| (dim.clone(), FeatureStats::new()))
            .collect();

        Self {
            id,
            programs: HashMap::new(),
            grid: MapGrid::new(config),
            best_score: f64::NEG_INFINITY,
            best_id: None,
            generation: 0,
            migrated: 0,
            feature_stats,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn migrated(&self) -> u64 {
        self.migrated
    }

    pub fn grid(&self) -> &MapGrid {
        &self.grid
    }

    pub fn feature_stats(&self) -> &HashMap<String, FeatureStats> {
        &self.feature_stats
    }

    /// Add a resident program: program map, grid, statistics, best cache.
    ///
    /// Returns whether the program became a grid cell occupant.
    pub fn add(&mut self, program: Arc<Program>) -> bool {
        self.programs.insert(program.id.clone(), Arc::clone(&program));

        let accepted = self.grid.insert(&program);
        if accepted {
            self.update_feature_stats(&program.features);
        }

        if program.score > self.best_score {
            self.best_score = program.score;
            self.best_id = Some(program.id.clone());
        }

        accepted
    }

    /// Remove a program from the map and vacate its grid cells.
    pub fn remove(&mut self, id: &str) -> Option<Arc<Program>> {
        let removed = self.programs.remove(id)?;
        self.grid.remove_program(id);
        if self.best_id.as_deref() == Some(id) {
            self.best_id = None;
        }
        Some(removed)
    }

    /// Best program on the island, recomputed lazily when the cache is
    /// empty (e.g. after a checkpoint load or a migration of the best).
    pub fn best_program(&mut self) -> Option<Arc<Program>> {
        if self.best_id.is_none() && !self.programs.is_empty() {
            for program in self.programs.values() {
                if program.score > self.best_score || self.best_id.is_none() {
                    self.best_score = program.score;
                    self.best_id = Some(program.id.clone());
                }
            }
        }

        self.best_id
            .as_ref()
            .and_then(|id| self.programs.get(id))
            .cloned()
    }

    /// Best program without touching the cache.
    pub fn peek_best(&self) -> Option<Arc<Program>> {
        match &self.best_id {
            Some(id) => self.programs.get(id).cloned(),
            None => self
                .programs
                .values()
                .max_by(|a, b| a.score.total_cmp(&b.score))
                .cloned(),
        }
    }

    /// Sample uniformly from the island's program map.
    pub fn sample_resident(&self, rng: &mut impl Rng) -> Option<Arc<Program>> {
        if self.programs.is_empty() {
            return None;
        }
        let idx = rng.gen_range(0..self.programs.len());
        self.programs.values().nth(idx).cloned()
    }

    pub fn increment_generation(&mut self) {
        self.generation += 1;
    }

    /// Min-max rescale a raw feature vector using the running statistics.
    ///
    /// Dimensions with no samples pass through unchanged; dimensions whose
    /// observed range has collapsed map to 0.5. Output is clamped to
    /// `[0, 1]`. Components beyond the dimension list pass through.
    pub fn scale_features(&self, features: &[f64]) -> Vec<f64> {
        let mut scaled = features.to_vec();

        for (dim_idx, dim) in self.grid.dimensions().iter().enumerate() {
            if dim_idx >= features.len() {
                break;
            }

            let Some(stats) = self.feature_stats.get(dim) else {
                continue;
            };
            if stats.count == 0 {
                continue;
            }

            scaled[dim_idx] = if stats.max > stats.min {
                ((features[dim_idx] - stats.min) / (stats.max - stats.min)).clamp(0.0, 1.0)
            } else {
                0.5
            };
        }

        scaled
    }

    pub(crate) fn update_feature_stats(&mut self, features: &[f64]) {
        // Dimension list is cloned up front: stats and grid live side by
        // side in the same struct.
        let dims: Vec<String> = self.grid.dimensions().to_vec();
        for (dim_idx, dim) in dims.iter().enumerate() {
            if dim_idx >= features.len() {
                continue;
            }
            self.feature_stats
                .entry(dim.clone())
                .or_insert_with(FeatureStats::new)
                .update(features[dim_idx]);
        }
    }

    pub(crate) fn restore(
        &mut self,
        programs: HashMap<String, Arc<Program>>,
        best_score: f64,
        best_id: Option<String>,
        generation: u64,
        migrated: u64,
    ) {
        self.programs = programs;
        self.best_score = best_score;
        self.best_id = best_id;
        self.generation = generation;
        self.migrated = migrated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            grid_dimensions: vec!["complexity".to_string(), "diversity".to_string()],
            grid_resolution: StdHashMap::from([
                ("complexity".to_string(), 10),
                ("diversity".to_string(), 10),
            ]),
            grid_bounds: StdHashMap::from([
                ("complexity".to_string(), [0.0, 1.0]),
                ("diversity".to_string(), [0.0, 1.0]),
            ]),
            ..DatabaseConfig::default()
        }
    }

    fn program(id: &str, score: f64, features: Vec<f64>) -> Arc<Program> {
        let mut p = Program::from_code(format!("fn {id}() {{}}"));
        p.id = id.to_string();
        p.score = score;
        p.features = features;
        Arc::new(p)
    }

    #[test]
    fn new_island_is_empty() {
        let island = Island::new(0, &config());
        assert_eq!(island.id(), 0);
        assert!(island.is_empty());
        assert_eq!(island.grid().total_cells(), 100);
        assert_eq!(island.grid().filled_cells(), 0);
        assert_eq!(island.generation(), 0);
    }

    #[test]
    fn add_updates_best_cache() {
        let mut island = Island::new(0, &config());
        assert!(island.best_program().is_none());

        island.add(program("p1", 0.5, vec![0.2, 0.2]));
        island.add(program("p2", 0.8, vec![0.7, 0.7]));

        let best = island.best_program().unwrap();
        assert_eq!(best.id, "p2");
        assert_eq!(best.score, 0.8);
    }

    #[test]
    fn best_recomputed_when_cache_cleared() {
        let mut island = Island::new(0, &config());
        island.add(program("p1", 0.5, vec![0.2, 0.2]));
        island.add(program("p2", 0.8, vec![0.7, 0.7]));

        // Simulate a checkpoint load that restored programs without a
        // best id.
        island.best_id = None;
        island.best_score = f64::NEG_INFINITY;

        let best = island.best_program().unwrap();
        assert_eq!(best.id, "p2");
    }

    #[test]
    fn welford_stats_track_min_max_mean() {
        let mut stats = FeatureStats::new();
        for value in [2.0, 4.0, 6.0] {
            stats.update(value);
        }

        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 6.0);
        assert!((stats.mean - 4.0).abs() < 1e-9);
        // Population variance of {2, 4, 6} is 8/3.
        assert!((stats.variance() - 8.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn scale_features_before_any_samples_is_identity() {
        let island = Island::new(0, &config());
        assert_eq!(island.scale_features(&[5.0, 0.0]), vec![5.0, 0.0]);
    }

    #[test]
    fn scale_features_min_max() {
        let mut island = Island::new(0, &config());
        island.update_feature_stats(&[2.0, -2.0]);
        island.update_feature_stats(&[8.0, 2.0]);

        let scaled = island.scale_features(&[5.0, 0.0]);
        assert!((scaled[0] - 0.5).abs() < 1e-9); // (5-2)/(8-2)
        assert!((scaled[1] - 0.5).abs() < 1e-9); // (0-(-2))/(2-(-2))

        // Out-of-range values clamp.
        let clamped = island.scale_features(&[100.0, -100.0]);
        assert_eq!(clamped[0], 1.0);
        assert_eq!(clamped[1], 0.0);
    }

    #[test]
    fn scale_features_collapsed_range_is_half() {
        let mut island = Island::new(0, &config());
        island.update_feature_stats(&[3.0, 3.0]);
        island.update_feature_stats(&[3.0, 3.0]);

        let scaled = island.scale_features(&[3.0, 9.0]);
        assert_eq!(scaled, vec![0.5, 0.5]);
    }

    #[test]
    fn remove_vacates_grid_and_best() {
        let mut island = Island::new(0, &config());
        island.add(program("p1", 0.9, vec![0.2, 0.2]));
        island.add(program("p2", 0.5, vec![0.7, 0.7]));

        let removed = island.remove("p1").unwrap();
        assert_eq!(removed.id, "p1");
        assert_eq!(island.len(), 1);
        assert_eq!(island.grid().filled_cells(), 1);

        // Best cache was invalidated and recomputes to the survivor.
        let best = island.best_program().unwrap();
        assert_eq!(best.id, "p2");
    }
}
