//! Writes the final rasters, the sediment flux series and a run manifest.
//!
//! Every file goes to `<name>.tmp` first and is renamed into place once
//! fully flushed, so an interrupted run never leaves a complete-looking
//! file behind. The manifest is written last.
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, MtrError, MtrResult, SimError};
use crate::params::ModelParams;
use crate::raster::RasterHeader;
use crate::stepper::SimulationOutcome;

/// Output location and file-name prefix of one scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSet {
    pub dir: PathBuf,
    pub prefix: String,
}

impl OutputSet {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, name))
    }

    pub fn elevation(&self) -> PathBuf {
        self.path("elev.asc")
    }

    pub fn drainage_area(&self) -> PathBuf {
        self.path("DA.asc")
    }

    pub fn slope(&self) -> PathBuf {
        self.path("slope.asc")
    }

    pub fn sediment_flux(&self) -> PathBuf {
        self.path("sedflux.txt")
    }

    pub fn manifest(&self) -> PathBuf {
        self.path("run.json")
    }
}

/// Summary of a finished run, written as `<prefix>run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub scenario: String,
    pub params: ModelParams,
    pub steps: usize,
    pub core_cells: usize,
    /// Row and column of the outlet.
    pub outlet: (usize, usize),
    pub outlet_elevation: f64,
    /// Σ flux·dt over the whole run, m³.
    pub total_sediment_volume: f64,
    /// Sediment carried past the outlet by the transport law, m³.
    pub total_transported_volume: f64,
    pub files: Vec<String>,
}

/// Write all outputs of `outcome`. Returns the paths written.
pub fn write_outputs(
    set: &OutputSet,
    reference: &RasterHeader,
    scenario: &str,
    params: &ModelParams,
    outcome: &SimulationOutcome,
) -> MtrResult<Vec<PathBuf>> {
    let state = &outcome.state;
    let grid = &state.grid;
    if reference.nrows != grid.nrows() || reference.ncols != grid.ncols() {
        return Err(ConfigError::ShapeMismatch {
            what: "output grid".into(),
            expected_rows: reference.nrows,
            expected_cols: reference.ncols,
            rows: grid.nrows(),
            cols: grid.ncols(),
        }
        .into());
    }
    let expected = params.expected_steps();
    if outcome.sediment_flux.len() != expected {
        return Err(SimError::FluxLength {
            expected,
            actual: outcome.sediment_flux.len(),
        }
        .into());
    }

    fs::create_dir_all(&set.dir).map_err(|e| MtrError::io(&set.dir, e))?;

    let mut written = Vec::with_capacity(5);
    for (path, field) in [
        (set.elevation(), &state.elevation),
        (set.drainage_area(), &state.drainage_area),
        (set.slope(), &state.steepest_slope),
    ] {
        let mut raster = state.to_raster(field);
        raster.header = RasterHeader {
            nodata: raster.header.nodata,
            ..reference.clone()
        };
        write_atomic(&path, |w| raster.write_to(w))?;
        written.push(path);
    }

    let flux_path = set.sediment_flux();
    write_atomic(&flux_path, |w| write_flux(w, &outcome.sediment_flux))?;
    written.push(flux_path);

    let dts: Vec<f64> = std::iter::repeat(params.recovery_dt)
        .take(params.recovery_steps())
        .chain(std::iter::repeat(params.fast_dt))
        .take(expected)
        .collect();
    let integrate = |series: &[f64]| -> f64 { series.iter().zip(&dts).map(|(f, dt)| f * dt).sum() };
    let manifest = RunManifest {
        scenario: scenario.to_string(),
        params: params.clone(),
        steps: outcome.steps,
        core_cells: grid.core_nodes().len(),
        outlet: grid.row_col(grid.outlet()),
        outlet_elevation: state.elevation[grid.outlet()],
        total_sediment_volume: integrate(&outcome.sediment_flux),
        total_transported_volume: integrate(&outcome.transport_flux),
        files: written
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect(),
    };
    let manifest_path = set.manifest();
    let json = serde_json::to_string_pretty(&manifest)?;
    write_atomic(&manifest_path, |w| w.write_all(json.as_bytes()))?;
    written.push(manifest_path);

    tracing::info!(
        scenario,
        dir = %set.dir.display(),
        files = written.len(),
        "outputs written"
    );
    Ok(written)
}

/// One value per line in scientific notation.
pub fn write_flux<W: Write>(w: &mut W, flux: &[f64]) -> std::io::Result<()> {
    for v in flux {
        writeln!(w, "{v:e}")?;
    }
    Ok(())
}

/// Parse a flux file written by [`write_flux`].
pub fn read_flux(path: &Path) -> MtrResult<Vec<f64>> {
    let text = fs::read_to_string(path).map_err(|e| MtrError::io(path, e))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, l)| {
            l.trim().parse::<f64>().map_err(|_| {
                ConfigError::RasterBody {
                    source_name: path.display().to_string(),
                    index: i,
                    message: format!("cannot parse flux value {l:?}"),
                }
                .into()
            })
        })
        .collect()
}

fn write_atomic<F>(path: &Path, write: F) -> MtrResult<()>
where
    F: FnOnce(&mut BufWriter<fs::File>) -> std::io::Result<()>,
{
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let file = fs::File::create(&tmp).map_err(|e| MtrError::io(&tmp, e))?;
    let mut w = BufWriter::new(file);
    let result = write(&mut w).and_then(|_| w.flush());
    drop(w);
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(MtrError::io(&tmp, e));
    }
    fs::rename(&tmp, path).map_err(|e| MtrError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_name_every_file() {
        let set = OutputSet::new("/out", "scenario_4_");
        assert_eq!(set.elevation(), PathBuf::from("/out/scenario_4_elev.asc"));
        assert_eq!(set.drainage_area(), PathBuf::from("/out/scenario_4_DA.asc"));
        assert_eq!(set.slope(), PathBuf::from("/out/scenario_4_slope.asc"));
        assert_eq!(set.sediment_flux(), PathBuf::from("/out/scenario_4_sedflux.txt"));
        assert_eq!(set.manifest(), PathBuf::from("/out/scenario_4_run.json"));
    }

    #[test]
    fn flux_is_written_in_scientific_notation() {
        let mut buf = Vec::new();
        write_flux(&mut buf, &[1500.0, 0.0, -2.5e-3]).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "1.5e3\n0e0\n-2.5e-3\n");
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x_sedflux.txt");
        write_atomic(&path, |w| write_flux(w, &[1.0, 2.0])).unwrap();
        assert_eq!(read_flux(&path).unwrap(), vec![1.0, 2.0]);
        assert!(!dir.path().join("x_sedflux.txt.tmp").exists());
    }

    #[test]
    fn failed_write_does_not_create_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.txt");
        let err = write_atomic(&path, |_| Err(std::io::Error::other("disk full")));
        assert!(err.is_err());
        assert!(!path.exists());
        assert!(!dir.path().join("broken.txt.tmp").exists());
    }
}
