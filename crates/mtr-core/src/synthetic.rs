//! Seeded synthetic watershed for demos and end-to-end tests.
//!
//! Produces a V-shaped valley draining to the middle of the bottom edge,
//! with its highest ground levelled off and flagged as mined, a set of
//! exponential recovery curves and a noisy climate record. Same seed, same
//! watershed.
use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::driver::WatershedPaths;
use crate::error::{MtrError, MtrResult};
use crate::raster::{Raster, RasterHeader};

/// Shape and forcing of a synthetic watershed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthSpec {
    pub nrows: usize,
    pub ncols: usize,
    pub cell_size: f64,
    /// Elevation of the outlet, m.
    pub base_elevation: f64,
    /// Down-valley gradient.
    pub valley_slope: f64,
    /// Cross-valley gradient.
    pub side_slope: f64,
    /// Amplitude of uniform elevation noise, m.
    pub roughness: f64,
    /// Share of interior cells, highest first, that are mined.
    pub mined_fraction: f64,
    pub n_scenarios: usize,
    pub n_years: usize,
    pub k_unmined: f64,
    pub k_mined: f64,
    pub mean_precip_mm: f64,
    pub seed: u64,
}

impl Default for SynthSpec {
    fn default() -> Self {
        Self {
            nrows: 40,
            ncols: 30,
            cell_size: 10.0,
            base_elevation: 300.0,
            valley_slope: 0.08,
            side_slope: 0.15,
            roughness: 0.5,
            mined_fraction: 0.25,
            n_scenarios: 5,
            n_years: 200,
            k_unmined: 1e-5,
            k_mined: 1e-3,
            mean_precip_mm: 1200.0,
            seed: 42,
        }
    }
}

/// Generated inputs, in memory.
#[derive(Debug, Clone)]
pub struct SyntheticWatershed {
    pub dem: Raster,
    pub mask: Raster,
    /// One row per year, one column per scenario.
    pub table: Vec<Vec<f64>>,
    pub climate_mm: Vec<f64>,
}

pub fn generate(spec: &SynthSpec) -> SyntheticWatershed {
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let (nrows, ncols) = (spec.nrows, spec.ncols);
    let mid = (ncols / 2) as f64;
    let header = RasterHeader {
        nodata: Some(-99999.0),
        ..RasterHeader::new(nrows, ncols, spec.cell_size)
    };

    // ── Valley surface ───────────────────────────────────────────────────────
    let mut z: Vec<f64> = (0..nrows * ncols)
        .map(|i| {
            let (r, c) = (i / ncols, i % ncols);
            let down = (nrows - 1 - r) as f64 * spec.cell_size * spec.valley_slope;
            let across = (c as f64 - mid).abs() * spec.cell_size * spec.side_slope;
            let noise = if spec.roughness > 0.0 {
                rng.gen_range(0.0..spec.roughness)
            } else {
                0.0
            };
            spec.base_elevation + down + across + noise
        })
        .collect();
    // Outlet notch: lowest edge cell, below every interior neighbour.
    let outlet = (nrows - 1) * ncols + ncols / 2;
    z[outlet] = spec.base_elevation - 1.0;

    // ── Mined ridge tops ─────────────────────────────────────────────────────
    let interior: Vec<usize> = (1..nrows - 1)
        .flat_map(|r| (1..ncols - 1).map(move |c| r * ncols + c))
        .collect();
    let mut sorted: Vec<f64> = interior.iter().map(|&i| z[i]).collect();
    sorted.sort_by(f64::total_cmp);
    let n_mined = ((interior.len() as f64) * spec.mined_fraction.clamp(0.0, 1.0)).round() as usize;
    let mut mask = vec![0.0; nrows * ncols];
    if n_mined > 0 {
        let threshold = sorted[sorted.len() - n_mined];
        for &i in &interior {
            if z[i] >= threshold {
                mask[i] = 1.0;
                z[i] = threshold + rng.gen_range(0.0..0.05);
            }
        }
    }

    // ── Recovery curves ──────────────────────────────────────────────────────
    // Scenario s recovers with e-folding time growing with s.
    let table = (0..spec.n_years)
        .map(|t| {
            (0..spec.n_scenarios)
                .map(|s| {
                    let tau = 5.0 * (s as f64 + 1.0).powi(2);
                    spec.k_unmined + (spec.k_mined - spec.k_unmined) * (-(t as f64) / tau).exp()
                })
                .collect()
        })
        .collect();

    let climate_mm = (0..spec.n_years)
        .map(|_| spec.mean_precip_mm * rng.gen_range(0.85..1.15))
        .collect();

    SyntheticWatershed {
        dem: Raster {
            header: header.clone(),
            data: z,
        },
        mask: Raster {
            header: RasterHeader {
                nodata: Some(-9999.0),
                ..header
            },
            data: mask,
        },
        table,
        climate_mm,
    }
}

impl SyntheticWatershed {
    /// Write `dem.asc`, `mask.asc`, `K_table.txt` and `climate.csv` into
    /// `dir`, returning paths with outputs under `dir/output`.
    pub fn write(&self, dir: &Path) -> MtrResult<WatershedPaths> {
        fs::create_dir_all(dir).map_err(|e| MtrError::io(dir, e))?;
        let paths = WatershedPaths {
            dem: dir.join("dem.asc"),
            mask: Some(dir.join("mask.asc")),
            erodibility_table: dir.join("K_table.txt"),
            climate: dir.join("climate.csv"),
            climate_row: 0,
            climate_skip_columns: 2,
            output_dir: dir.join("output"),
        };
        self.dem.write(&paths.dem)?;
        if let Some(mask_path) = &paths.mask {
            self.mask.write(mask_path)?;
        }

        let table_text: String = self
            .table
            .iter()
            .map(|row| {
                let cells: Vec<String> = row.iter().map(|k| format!("{k:e}")).collect();
                cells.join(" ") + "\n"
            })
            .collect();
        fs::write(&paths.erodibility_table, table_text)
            .map_err(|e| MtrError::io(&paths.erodibility_table, e))?;

        let csv_err = |source| MtrError::Csv {
            path: paths.climate.clone(),
            source,
        };
        let mut w = csv::Writer::from_path(&paths.climate).map_err(csv_err)?;
        let mut head = vec!["watershed".to_string(), "code".to_string()];
        head.extend((0..self.climate_mm.len()).map(|y| format!("year_{y}")));
        w.write_record(&head).map_err(csv_err)?;
        let mut row = vec!["synthetic".to_string(), "0".to_string()];
        row.extend(self.climate_mm.iter().map(|p| format!("{p:.1}")));
        w.write_record(&row).map_err(csv_err)?;
        w.flush().map_err(|e| MtrError::io(&paths.climate, e))?;

        tracing::info!(dir = %dir.display(), "synthetic watershed written");
        Ok(paths)
    }
}
