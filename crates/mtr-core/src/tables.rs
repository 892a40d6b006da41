//! Static forcing tables: the erodibility scenario matrix and the yearly
//! climate record.
use std::fs;
use std::io::Read;
use std::path::Path;

use crate::error::{ConfigError, MtrError, MtrResult};

/// Raw erodibility curves: one row per year, one column per scenario id.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioTable {
    rows: Vec<Vec<f64>>,
    n_scenarios: usize,
}

impl ScenarioTable {
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, ConfigError> {
        let n_scenarios = rows.first().map(Vec::len).unwrap_or(0);
        if rows.is_empty() || n_scenarios == 0 {
            return Err(ConfigError::Forcing("erodibility table is empty".into()));
        }
        for (t, row) in rows.iter().enumerate() {
            if row.len() != n_scenarios {
                return Err(ConfigError::Forcing(format!(
                    "erodibility table row {t} has {} columns, expected {n_scenarios}",
                    row.len()
                )));
            }
            if let Some(v) = row.iter().find(|v| !v.is_finite() || **v < 0.0) {
                return Err(ConfigError::Forcing(format!(
                    "erodibility table row {t} holds invalid value {v}"
                )));
            }
        }
        Ok(Self { rows, n_scenarios })
    }

    /// Whitespace-separated matrix, one row per line. Blank lines and `#`
    /// comments are skipped.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut rows = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let row = line
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|t| !t.is_empty())
                .map(|t| {
                    t.parse::<f64>().map_err(|_| {
                        ConfigError::Forcing(format!(
                            "erodibility table line {}: cannot parse {t:?}",
                            lineno + 1
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            rows.push(row);
        }
        Self::from_rows(rows)
    }

    pub fn read(path: &Path) -> MtrResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| MtrError::io(path, e))?;
        Ok(Self::parse(&text)?)
    }

    pub fn n_years(&self) -> usize {
        self.rows.len()
    }

    pub fn n_scenarios(&self) -> usize {
        self.n_scenarios
    }

    /// The raw curve for one scenario id.
    pub fn column(&self, scenario_id: usize) -> Result<Vec<f64>, ConfigError> {
        if scenario_id >= self.n_scenarios {
            return Err(ConfigError::Forcing(format!(
                "scenario {scenario_id} out of range: table has {} columns",
                self.n_scenarios
            )));
        }
        Ok(self.rows.iter().map(|r| r[scenario_id]).collect())
    }

    /// Smallest value anywhere in the table (the unmined erodibility).
    pub fn min_value(&self) -> f64 {
        self.rows
            .iter()
            .flatten()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }
}

/// Read one watershed's annual precipitation (mm/yr) from a climate CSV.
///
/// The CSV has a header row and one row per watershed; the first
/// `skip_columns` columns are labels, the rest are consecutive years.
pub fn read_climate_record(path: &Path, row: usize, skip_columns: usize) -> MtrResult<Vec<f64>> {
    let file = fs::File::open(path).map_err(|e| MtrError::io(path, e))?;
    parse_climate_record(file, row, skip_columns).map_err(|e| match e {
        ClimateReadError::Csv(source) => MtrError::Csv {
            path: path.to_path_buf(),
            source,
        },
        ClimateReadError::Config(c) => MtrError::Config(c),
    })
}

#[derive(Debug)]
pub(crate) enum ClimateReadError {
    Csv(csv::Error),
    Config(ConfigError),
}

impl From<csv::Error> for ClimateReadError {
    fn from(e: csv::Error) -> Self {
        ClimateReadError::Csv(e)
    }
}

impl From<ConfigError> for ClimateReadError {
    fn from(e: ConfigError) -> Self {
        ClimateReadError::Config(e)
    }
}

pub(crate) fn parse_climate_record<R: Read>(
    reader: R,
    row: usize,
    skip_columns: usize,
) -> Result<Vec<f64>, ClimateReadError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let record = match rdr.records().nth(row) {
        Some(r) => r?,
        None => {
            return Err(ConfigError::Forcing(format!("climate table has no row {row}")).into());
        }
    };

    let values = record
        .iter()
        .skip(skip_columns)
        .enumerate()
        .map(|(j, field)| {
            field.parse::<f64>().map_err(|_| {
                ConfigError::Forcing(format!(
                    "climate row {row}, column {}: cannot parse {field:?}",
                    j + skip_columns
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if values.is_empty() {
        return Err(ConfigError::Forcing(format!("climate row {row} has no yearly values")).into());
    }
    Ok(values)
}
