//! ESRI ASCII grid rasters.
//!
//! Row-major, first row is the northern edge, exactly as stored on disk.
//! Header keys are matched case-insensitively; `xllcenter`/`yllcenter` are
//! accepted and preserved on write.
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, MtrError, MtrResult};

/// Whether the lower-left coordinate refers to the cell corner or centre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anchor {
    Corner,
    Center,
}

/// Geographic referencing and shape of a raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterHeader {
    pub ncols: usize,
    pub nrows: usize,
    pub xll: f64,
    pub yll: f64,
    pub anchor: Anchor,
    pub cell_size: f64,
    pub nodata: Option<f64>,
}

impl RasterHeader {
    pub fn new(nrows: usize, ncols: usize, cell_size: f64) -> Self {
        Self {
            ncols,
            nrows,
            xll: 0.0,
            yll: 0.0,
            anchor: Anchor::Corner,
            cell_size,
            nodata: Some(-9999.0),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ncols * self.nrows
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same shape, cell size and origin. The nodata sentinel may differ.
    pub fn same_geometry(&self, other: &RasterHeader) -> bool {
        self.ncols == other.ncols
            && self.nrows == other.nrows
            && self.anchor == other.anchor
            && (self.cell_size - other.cell_size).abs() <= 1e-9 * self.cell_size.abs().max(1.0)
            && (self.xll - other.xll).abs() <= 1e-6
            && (self.yll - other.yll).abs() <= 1e-6
    }

    fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let (xk, yk) = match self.anchor {
            Anchor::Corner => ("xllcorner", "yllcorner"),
            Anchor::Center => ("xllcenter", "yllcenter"),
        };
        writeln!(w, "ncols {}", self.ncols)?;
        writeln!(w, "nrows {}", self.nrows)?;
        writeln!(w, "{xk} {}", self.xll)?;
        writeln!(w, "{yk} {}", self.yll)?;
        writeln!(w, "cellsize {}", self.cell_size)?;
        if let Some(nd) = self.nodata {
            writeln!(w, "NODATA_value {nd}")?;
        }
        Ok(())
    }
}

/// A raster grid of `f64` values.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub header: RasterHeader,
    pub data: Vec<f64>,
}

impl Raster {
    pub fn new(header: RasterHeader, data: Vec<f64>) -> Result<Self, ConfigError> {
        if data.len() != header.len() {
            return Err(ConfigError::ShapeMismatch {
                what: "raster data".into(),
                expected_rows: header.nrows,
                expected_cols: header.ncols,
                rows: data.len() / header.ncols.max(1),
                cols: header.ncols,
            });
        }
        Ok(Self { header, data })
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.header.ncols + col]
    }

    /// Read and parse an ESRI ASCII file.
    pub fn read(path: &Path) -> MtrResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| MtrError::io(path, e))?;
        Ok(Self::parse(&text, &path.display().to_string())?)
    }

    /// Parse ESRI ASCII text. `source_name` only labels errors.
    pub fn parse(text: &str, source_name: &str) -> Result<Self, ConfigError> {
        let header_err = |message: String| ConfigError::RasterHeader {
            source_name: source_name.to_string(),
            message,
        };

        let mut ncols = None;
        let mut nrows = None;
        let mut xll = None;
        let mut yll = None;
        let mut anchor = Anchor::Corner;
        let mut cell_size = None;
        let mut nodata = None;

        let mut lines = text.lines().peekable();
        while let Some(line) = lines.peek() {
            let mut tokens = line.split_whitespace();
            let Some(key) = tokens.next() else {
                lines.next();
                continue;
            };
            if !key.starts_with(|c: char| c.is_ascii_alphabetic()) {
                break;
            }
            let value = tokens
                .next()
                .ok_or_else(|| header_err(format!("key {key} has no value")))?;
            let num: f64 = value
                .parse()
                .map_err(|_| header_err(format!("key {key} has non-numeric value {value}")))?;
            let count = || {
                if num.is_finite() && num >= 0.0 && num.fract() == 0.0 && num <= u32::MAX as f64 {
                    Ok(num as usize)
                } else {
                    Err(header_err(format!("key {key} must be a whole non-negative count, got {value}")))
                }
            };
            match key.to_ascii_lowercase().as_str() {
                "ncols" => ncols = Some(count()?),
                "nrows" => nrows = Some(count()?),
                "xllcorner" => xll = Some(num),
                "yllcorner" => yll = Some(num),
                "xllcenter" => {
                    xll = Some(num);
                    anchor = Anchor::Center;
                }
                "yllcenter" => {
                    yll = Some(num);
                    anchor = Anchor::Center;
                }
                "cellsize" => cell_size = Some(num),
                "nodata_value" => nodata = Some(num),
                other => return Err(header_err(format!("unknown key {other}"))),
            }
            lines.next();
        }

        let ncols = ncols.ok_or_else(|| header_err("missing ncols".into()))?;
        let nrows = nrows.ok_or_else(|| header_err("missing nrows".into()))?;
        let xll = xll.ok_or_else(|| header_err("missing xllcorner/xllcenter".into()))?;
        let yll = yll.ok_or_else(|| header_err("missing yllcorner/yllcenter".into()))?;
        let cell_size = cell_size.ok_or_else(|| header_err("missing cellsize".into()))?;
        if ncols == 0 || nrows == 0 {
            return Err(header_err(format!("degenerate shape {nrows}x{ncols}")));
        }
        if cell_size.is_nan() || cell_size <= 0.0 {
            return Err(header_err(format!("cellsize must be positive, got {cell_size}")));
        }

        let expected = ncols
            .checked_mul(nrows)
            .ok_or_else(|| header_err(format!("shape {nrows}x{ncols} overflows")))?;
        let mut data = Vec::with_capacity(expected.min(text.len()));
        for tok in lines.flat_map(str::split_whitespace) {
            let v: f64 = tok.parse().map_err(|_| ConfigError::RasterBody {
                source_name: source_name.to_string(),
                index: data.len(),
                message: format!("cannot parse {tok:?}"),
            })?;
            data.push(v);
        }
        if data.len() != expected {
            return Err(ConfigError::RasterBody {
                source_name: source_name.to_string(),
                index: data.len(),
                message: format!("expected {expected} values ({nrows}x{ncols}), found {}", data.len()),
            });
        }

        Ok(Self {
            header: RasterHeader {
                ncols,
                nrows,
                xll,
                yll,
                anchor,
                cell_size,
                nodata,
            },
            data,
        })
    }

    /// Serialize as ESRI ASCII.
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.header.write_to(w)?;
        for row in self.data.chunks(self.header.ncols) {
            let mut first = true;
            for v in row {
                if !first {
                    w.write_all(b" ")?;
                }
                write!(w, "{v}")?;
                first = false;
            }
            w.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Write to `path`, creating or truncating it.
    pub fn write(&self, path: &Path) -> MtrResult<()> {
        let file = fs::File::create(path).map_err(|e| MtrError::io(path, e))?;
        let mut w = BufWriter::new(file);
        self.write_to(&mut w)
            .and_then(|_| w.flush())
            .map_err(|e| MtrError::io(path, e))
    }
}
