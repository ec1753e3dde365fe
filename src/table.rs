//! Tabular inputs and CSV output.
//!
//! Data tables are read from CSV text or from the first sheet of a
//! spreadsheet (`.xls`, `.xlsx`, `.xlsm`, `.xlsb`, `.ods`).

use crate::error::{Error, Result};
use calamine::{open_workbook_auto, Data, Reader};
use std::path::Path;

const WORKBOOK_EXTENSIONS: [&str; 5] = ["xls", "xlsx", "xlsm", "xlsb", "ods"];

/// Quote a field when it contains a comma, quote or newline.
pub fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Format one CSV row, newline included.
pub fn format_row<S: AsRef<str>>(fields: &[S]) -> String {
    let mut row = fields
        .iter()
        .map(|f| escape_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    row.push('\n');
    row
}

/// Split one CSV line, honouring double-quoted fields.
fn split_line(line: &str) -> std::result::Result<Vec<String>, &'static str> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => quoted = false,
            ('"', false) if field.is_empty() => quoted = true,
            (',', false) => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    if quoted {
        return Err("unterminated quoted field");
    }
    fields.push(field);
    Ok(fields)
}

/// A table with a header row.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Parse CSV text. `path` only labels errors.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let mut lines = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());

        let (_, header) = lines
            .next()
            .ok_or_else(|| Error::parse(path, 1, "table is empty"))?;
        let headers: Vec<String> = split_line(header.trim_start_matches('\u{feff}'))
            .map_err(|e| Error::parse(path, 1, e))?
            .into_iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for (number, line) in lines {
            let row = split_line(line).map_err(|e| Error::parse(path, number + 1, e))?;
            if row.len() != headers.len() {
                return Err(Error::parse(
                    path,
                    number + 1,
                    format!("expected {} fields, got {}", headers.len(), row.len()),
                ));
            }
            rows.push(row);
        }
        Ok(Self { headers, rows })
    }

    /// Load a table; spreadsheets are recognised by extension, anything
    /// else is read as CSV.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        if is_workbook(path) {
            return Self::load_workbook(path);
        }
        let text = std::fs::read_to_string(path).map_err(|e| Error::read(path, e))?;
        Self::parse(&text, path)
    }

    /// First worksheet of a workbook. Blank rows are skipped and every cell
    /// is kept as its display text.
    pub fn load_workbook(path: &Path) -> Result<Self> {
        let mut workbook = open_workbook_auto(path)
            .map_err(|e| Error::parse(path, 0, format!("cannot open workbook: {e}")))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| Error::parse(path, 0, "workbook has no sheet"))?
            .map_err(|e| Error::parse(path, 0, format!("cannot read first sheet: {e}")))?;

        let mut rows = range
            .rows()
            .filter(|row| row.iter().any(|cell| !matches!(cell, Data::Empty)));
        let header = rows
            .next()
            .ok_or_else(|| Error::parse(path, 1, "table is empty"))?;
        let headers: Vec<String> = header
            .iter()
            .map(|cell| cell.to_string().trim().to_string())
            .collect();
        let rows = rows
            .map(|row| {
                let mut fields: Vec<String> = row.iter().map(ToString::to_string).collect();
                fields.resize(headers.len(), String::new());
                fields
            })
            .collect();
        Ok(Self { headers, rows })
    }

    /// Index of column `name`.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

fn is_workbook(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| WORKBOOK_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("Hippocampus"), "Hippocampus");
        assert_eq!(escape_field("Gyrus, left"), "\"Gyrus, left\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_parse_quoted_fields() {
        let text = "Image,Group\n\"a,1.nii\",control\nb.nii,\"pa\"\"tient\"\n";
        let table = Table::parse(text, Path::new("t.csv")).unwrap();
        assert_eq!(table.column("Group"), Some(1));
        assert_eq!(table.rows[0][0], "a,1.nii");
        assert_eq!(table.rows[1][1], "pa\"tient");
    }

    #[test]
    fn test_ragged_row_reports_line() {
        let text = "Image,Group\n\na.nii\n";
        let err = Table::parse(text, Path::new("t.csv")).unwrap_err();
        assert!(err.to_string().contains("t.csv:3"));
    }

    #[test]
    fn test_format_row_roundtrip() {
        let row = format_row(&["x,y", "z"]);
        assert_eq!(row, "\"x,y\",z\n");
        assert_eq!(split_line(row.trim_end()).unwrap(), vec!["x,y", "z"]);
    }

    #[test]
    fn test_load_first_sheet_of_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.xlsx");
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Image").unwrap();
        sheet.write_string(0, 1, "Social").unwrap();
        sheet.write_string(1, 0, "s1.nii").unwrap();
        sheet.write_number(1, 1, 1.0).unwrap();
        sheet.write_string(3, 0, "s2.nii").unwrap();
        sheet.write_number(3, 1, 0.0).unwrap();
        workbook.save(&path).unwrap();

        let table = Table::load(&path).unwrap();
        assert_eq!(table.headers, vec!["Image", "Social"]);
        assert_eq!(table.rows, vec![vec!["s1.nii", "1"], vec!["s2.nii", "0"]]);
    }

    #[test]
    fn test_unknown_extension_reads_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, "Image,Social
s1.nii,1
").unwrap();
        assert!(!is_workbook(&path));
        assert!(is_workbook(Path::new("cohort.XLSX")));
        assert_eq!(Table::load(&path).unwrap().rows, vec![vec!["s1.nii", "1"]]);
    }

    #[test]
    fn test_corrupt_workbook_is_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.xlsx");
        std::fs::write(&path, "Image,Social\n").unwrap();
        let err = Table::load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Input);
    }
}
