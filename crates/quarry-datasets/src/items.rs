use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{DatasetError, Result};

/// One item of a dataset: a JSON object.
pub type Item = Map<String, Value>;

/// A dataset's NDJSON result artifact.
///
/// Every call to [`ItemSource::iter`] reopens the file, so a processor can
/// make several passes over the same items.
#[derive(Debug, Clone)]
pub struct ItemSource {
    path: PathBuf,
}

impl ItemSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn iter(&self) -> Result<Items> {
        let file = File::open(&self.path)?;
        Ok(Items {
            lines: BufReader::new(file).lines(),
            line: 0,
        })
    }
}

/// Lazy iterator over the items of an [`ItemSource`].
pub struct Items {
    lines: Lines<BufReader<File>>,
    line: usize,
}

impl Iterator for Items {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let raw = match self.lines.next()? {
                Ok(raw) => raw,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;
            if raw.trim().is_empty() {
                continue;
            }
            let parsed = match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(item)) => Ok(item),
                Ok(_) => Err(DatasetError::MalformedItem {
                    line: self.line,
                    reason: "not a JSON object".to_string(),
                }),
                Err(e) => Err(DatasetError::MalformedItem {
                    line: self.line,
                    reason: e.to_string(),
                }),
            };
            return Some(parsed);
        }
    }
}

/// Writes items as NDJSON and counts them.
pub struct ItemWriter {
    out: BufWriter<File>,
    written: usize,
}

impl ItemWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
            written: 0,
        })
    }

    pub fn write(&mut self, item: &Item) -> Result<()> {
        serde_json::to_writer(&mut self.out, item)?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    /// Flush and return the number of items written.
    pub fn finish(mut self) -> Result<usize> {
        self.out.flush()?;
        Ok(self.written)
    }
}
