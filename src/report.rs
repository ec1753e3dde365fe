//! Atlas region volumes covered by a cluster map.

use crate::error::{Error, Result};
use crate::labels::LabelDictionary;
use crate::nifti;
use crate::output;
use crate::table;
use crate::volume::Volume;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, CellAlignment};
use rust_xlsxwriter::{Format, Workbook};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Column headers shared by every output format.
pub const COLUMNS: [&str; 3] = ["Name", "Number", "Volume (mm³)"];

/// Report serialization, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// `.csv`
    Csv,
    /// `.xls` or `.xlsx`, written as an OOXML workbook.
    Spreadsheet,
}

impl ReportFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("csv") => Ok(Self::Csv),
            Some("xls" | "xlsx") => Ok(Self::Spreadsheet),
            _ => Err(Error::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// One report row.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionVolume {
    pub name: String,
    pub label: i64,
    pub voxels: usize,
    /// Physical volume in mm³.
    pub volume: f64,
}

/// Region volumes sorted by volume (descending), then label id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VolumeReport {
    rows: Vec<RegionVolume>,
}

impl VolumeReport {
    pub fn rows(&self) -> &[RegionVolume] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn total_volume(&self) -> f64 {
        self.rows.iter().map(|r| r.volume).sum()
    }

    pub fn to_csv(&self) -> String {
        let mut text = table::format_row(&COLUMNS);
        for row in &self.rows {
            text.push_str(&table::format_row(&[
                row.name.clone(),
                row.label.to_string(),
                decimal(row.volume),
            ]));
        }
        text
    }

    /// Workbook bytes with one sheet holding the report.
    pub fn to_xlsx(&self) -> Result<Vec<u8>> {
        let mut workbook = Workbook::new();
        let bold = Format::new().set_bold();
        let sheet = workbook.add_worksheet();
        for (column, header) in COLUMNS.iter().enumerate() {
            sheet.write_string_with_format(0, column as u16, *header, &bold)?;
        }
        for (index, row) in self.rows.iter().enumerate() {
            let line = index as u32 + 1;
            sheet.write_string(line, 0, row.name.as_str())?;
            sheet.write_number(line, 1, row.label as f64)?;
            sheet.write_number(line, 2, row.volume)?;
        }
        sheet.set_column_width(0, 40)?;
        sheet.set_column_width(2, 14)?;
        Ok(workbook.save_to_buffer()?)
    }

    /// Console rendering.
    pub fn render(&self) -> String {
        let mut view = comfy_table::Table::new();
        view.load_preset(UTF8_FULL_CONDENSED)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(COLUMNS.iter().map(|h| Cell::new(*h)).collect::<Vec<_>>());
        for row in &self.rows {
            view.add_row(vec![
                Cell::new(&row.name),
                Cell::new(row.label).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.2}", row.volume)).set_alignment(CellAlignment::Right),
            ]);
        }
        view.to_string()
    }

    /// Write the report in the format selected by the extension of `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let bytes = match ReportFormat::from_path(path)? {
            ReportFormat::Csv => self.to_csv().into_bytes(),
            ReportFormat::Spreadsheet => self.to_xlsx()?,
        };
        output::write_bytes_atomic(path, &bytes)?;
        info!(path = %path.display(), rows = self.rows.len(), "wrote volume report");
        Ok(())
    }
}

/// Volume column text; integral values keep one decimal so the column reads as float.
fn decimal(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

/// Aggregates cluster maps over atlas regions.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegionVolumeReporter {
    /// Rows with at most this many voxels are dropped.
    pub min_size: Option<usize>,
}

impl RegionVolumeReporter {
    pub fn new(min_size: Option<usize>) -> Self {
        Self { min_size }
    }

    pub fn report(
        &self,
        clusters: &Volume,
        atlas: &Volume,
        labels: &LabelDictionary,
    ) -> Result<VolumeReport> {
        atlas.grid().ensure_same_grid(clusters.grid(), "cluster map vs atlas")?;

        let mut counts: HashMap<i64, usize> = HashMap::new();
        for (&marker, &label) in clusters.data().iter().zip(atlas.data()) {
            if marker != 0.0 && label.is_finite() {
                *counts.entry(label.round_ties_even() as i64).or_default() += 1;
            }
        }

        let voxel_volume = atlas.affine().voxel_volume();
        let mut rows: Vec<RegionVolume> = labels
            .iter()
            .map(|(label, name)| {
                let voxels = counts.get(&label).copied().unwrap_or(0);
                RegionVolume {
                    name: name.to_string(),
                    label,
                    voxels,
                    volume: voxels as f64 * voxel_volume,
                }
            })
            .filter(|row| self.min_size.map_or(true, |min| row.voxels > min))
            .collect();
        rows.sort_by(|a, b| b.volume.total_cmp(&a.volume).then(a.label.cmp(&b.label)));

        debug!(regions = rows.len(), voxel_volume, "volume report built");
        Ok(VolumeReport { rows })
    }

    /// Load inputs from disk, build the report and write it to `output`.
    ///
    /// The output format is checked before any input is read.
    pub fn run(
        &self,
        clusters: &Path,
        atlas: &Path,
        labels: &Path,
        output: &Path,
    ) -> Result<VolumeReport> {
        ReportFormat::from_path(output)?;
        let clusters = nifti::load(clusters)?;
        let atlas = nifti::load(atlas)?;
        let labels = LabelDictionary::load(labels)?;
        let report = self.report(&clusters, &atlas, &labels)?;
        report.save(output)?;
        Ok(report)
    }
}
