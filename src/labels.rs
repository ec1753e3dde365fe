//! Atlas label dictionaries.
//!
//! Two on-disk dialects are understood:
//!
//! - [`LabelDialect::SpaceSeparated`]: `<id> <name>` per line (D99 style)
//! - [`LabelDialect::Tabular`]: tab-separated table with `Index` and
//!   `Full_Name` columns (CHARM/SARM style)
//!
//! Dictionaries are always written back in the space-separated dialect.

use crate::error::{Error, Result};
use crate::output;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

const INDEX_COLUMN: &str = "Index";
const NAME_COLUMN: &str = "Full_Name";

/// On-disk label format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelDialect {
    SpaceSeparated,
    Tabular,
}

impl LabelDialect {
    /// Dialect of `text` read from `path`: `.tsv` files and files whose first
    /// non-empty line is a tab-separated header naming both columns are
    /// tabular.
    pub fn detect(path: &Path, text: &str) -> Self {
        if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("tsv")) {
            return Self::Tabular;
        }
        match text.lines().find(|line| !line.trim().is_empty()) {
            Some(first)
                if first.contains('\t')
                    && first.contains(INDEX_COLUMN)
                    && first.contains(NAME_COLUMN) =>
            {
                Self::Tabular
            }
            _ => Self::SpaceSeparated,
        }
    }
}

/// Mapping from integer label to region name, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelDictionary {
    entries: Vec<(i64, String)>,
    positions: HashMap<i64, usize>,
}

impl LabelDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a label. A repeated id keeps its first position and takes the new
    /// name.
    pub fn insert(&mut self, id: i64, name: impl Into<String>) {
        let name = name.into();
        match self.positions.get(&id) {
            Some(&position) => {
                warn!(id, previous = %self.entries[position].1, %name, "duplicate label id");
                self.entries[position].1 = name;
            }
            None => {
                self.positions.insert(id, self.entries.len());
                self.entries.push((id, name));
            }
        }
    }

    pub fn get(&self, id: i64) -> Option<&str> {
        self.positions.get(&id).map(|&p| self.entries[p].1.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(id, name)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &str)> {
        self.entries.iter().map(|(id, name)| (*id, name.as_str()))
    }

    /// Parse `text` in `dialect`. `path` only labels errors.
    pub fn parse(text: &str, dialect: LabelDialect, path: &Path) -> Result<Self> {
        match dialect {
            LabelDialect::SpaceSeparated => parse_space_separated(text, path),
            LabelDialect::Tabular => parse_tabular(text, path),
        }
    }

    /// Read a dictionary, detecting its dialect.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|e| Error::read(path, e))?;
        let dialect = LabelDialect::detect(path, &text);
        let labels = Self::parse(&text, dialect, path)?;
        debug!(path = %path.display(), ?dialect, labels = labels.len(), "loaded labels");
        Ok(labels)
    }

    /// Space-separated text form.
    pub fn to_text(&self) -> String {
        self.iter().map(|(id, name)| format!("{id} {name}\n")).collect()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        output::write_bytes_atomic(path.as_ref(), self.to_text().as_bytes())
    }
}

fn parse_id(field: &str, path: &Path, line: usize) -> Result<i64> {
    field
        .trim()
        .parse()
        .map_err(|_| Error::parse(path, line, format!("invalid label id {:?}", field.trim())))
}

fn parse_space_separated(text: &str, path: &Path) -> Result<LabelDictionary> {
    let mut labels = LabelDictionary::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (id, name) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::parse(path, number + 1, "expected \"<id> <name>\""))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::parse(path, number + 1, "empty label name"));
        }
        labels.insert(parse_id(id, path, number + 1)?, name);
    }
    Ok(labels)
}

fn parse_tabular(text: &str, path: &Path) -> Result<LabelDictionary> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());
    let (header_number, header) = lines
        .next()
        .ok_or_else(|| Error::parse(path, 1, "missing header"))?;
    let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
    let column = |name: &str| {
        columns.iter().position(|c| *c == name).ok_or_else(|| {
            Error::parse(path, header_number + 1, format!("missing column {name:?}"))
        })
    };
    let index_column = column(INDEX_COLUMN)?;
    let name_column = column(NAME_COLUMN)?;

    let mut labels = LabelDictionary::new();
    for (number, line) in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        let (Some(id), Some(name)) = (fields.get(index_column), fields.get(name_column)) else {
            return Err(Error::parse(
                path,
                number + 1,
                format!("expected {} columns, got {}", columns.len(), fields.len()),
            ));
        };
        labels.insert(parse_id(id, path, number + 1)?, name.trim());
    }
    Ok(labels)
}
