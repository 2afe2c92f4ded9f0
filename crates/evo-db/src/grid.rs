//! MAP-Elites grid.
//!
//! A cell-indexed best-of population over a discretized feature space.
//! Cells hold shared references into the owning island's program map;
//! the map remains the single source of truth.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use evo_core::config::{DatabaseConfig, DEFAULT_GRID_RESOLUTION};
use evo_core::Program;

const DEFAULT_BOUNDS: [f64; 2] = [0.0, 1.0];

/// Discretized quality-diversity grid.
#[derive(Debug, Clone)]
pub struct MapGrid {
    dimensions: Vec<String>,
    resolution: HashMap<String, usize>,
    bounds: HashMap<String, [f64; 2]>,
    cells: HashMap<String, Arc<Program>>,
    total_cells: usize,
    filled_cells: usize,
}

impl MapGrid {
    pub fn new(config: &DatabaseConfig) -> Self {
        let total_cells = config
            .grid_dimensions
            .iter()
            .map(|dim| {
                config
                    .grid_resolution
                    .get(dim)
                    .copied()
                    .unwrap_or(DEFAULT_GRID_RESOLUTION)
            })
            .product();

        Self {
            dimensions: config.grid_dimensions.clone(),
            resolution: config.grid_resolution.clone(),
            bounds: config.grid_bounds.clone(),
            cells: HashMap::new(),
            total_cells,
            filled_cells: 0,
        }
    }

    /// Map a feature vector to its cell key.
    ///
    /// The key is a canonical `dim:index;` concatenation in dimension
    /// order. When the vector is shorter than the dimension list (or vice
    /// versa), iteration stops at the shorter length, so the key stays
    /// deterministic under arity drift.
    pub fn cell_key(&self, features: &[f64]) -> String {
        let mut key = String::new();
        for (dim_idx, dim) in self.dimensions.iter().enumerate() {
            if dim_idx >= features.len() {
                break;
            }

            let [lo, hi] = self.bounds.get(dim).copied().unwrap_or(DEFAULT_BOUNDS);
            let resolution = self
                .resolution
                .get(dim)
                .copied()
                .unwrap_or(DEFAULT_GRID_RESOLUTION)
                .max(1);

            let normalized = ((features[dim_idx] - lo) / (hi - lo)).clamp(0.0, 1.0);
            let index = (normalized * (resolution - 1) as f64) as usize;

            key.push_str(dim);
            key.push(':');
            key.push_str(&index.to_string());
            key.push(';');
        }
        key
    }

    /// Insert a program, keeping the best occupant per cell.
    ///
    /// Returns `true` iff the program becomes the cell's occupant: the
    /// cell was empty, or the program strictly out-scores the current
    /// occupant. Ties keep the incumbent.
    pub fn insert(&mut self, program: &Arc<Program>) -> bool {
        let key = self.cell_key(&program.features);

        match self.cells.get(&key) {
            Some(existing) if program.score <= existing.score => return false,
            Some(_) => {}
            None => self.filled_cells += 1,
        }
        self.cells.insert(key, Arc::clone(program));
        true
    }

    /// Look up the occupant of the cell a feature vector maps to.
    pub fn get(&self, features: &[f64]) -> Option<&Arc<Program>> {
        self.cells.get(&self.cell_key(features))
    }

    /// Sample one filled cell's occupant uniformly at random.
    pub fn sample(&self, rng: &mut impl Rng) -> Option<Arc<Program>> {
        if self.cells.is_empty() {
            return None;
        }
        let idx = rng.gen_range(0..self.cells.len());
        self.cells.values().nth(idx).cloned()
    }

    /// Vacate every cell occupied by the given program id.
    ///
    /// Used when a program migrates away so that cells never reference a
    /// program missing from the island's map.
    pub fn remove_program(&mut self, id: &str) {
        let before = self.cells.len();
        self.cells.retain(|_, occupant| occupant.id != id);
        self.filled_cells -= before - self.cells.len();
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn total_cells(&self) -> usize {
        self.total_cells
    }

    pub fn filled_cells(&self) -> usize {
        self.filled_cells
    }

    /// Fraction of cells currently filled.
    pub fn occupancy(&self) -> f64 {
        if self.total_cells == 0 {
            return 0.0;
        }
        self.filled_cells as f64 / self.total_cells as f64
    }

    pub(crate) fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    pub(crate) fn resolution(&self) -> &HashMap<String, usize> {
        &self.resolution
    }

    pub(crate) fn bounds(&self) -> &HashMap<String, [f64; 2]> {
        &self.bounds
    }

    pub(crate) fn cells(&self) -> &HashMap<String, Arc<Program>> {
        &self.cells
    }

    pub(crate) fn restore_cells(
        &mut self,
        cells: HashMap<String, Arc<Program>>,
        total_cells: usize,
        filled_cells: usize,
    ) {
        self.cells = cells;
        self.total_cells = total_cells;
        self.filled_cells = filled_cells;
    }
}
