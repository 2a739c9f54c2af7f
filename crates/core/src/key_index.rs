//! Source enumeration and input/target alignment by normalized filename key.
//!
//! Both collections are exposed in the same sorted key order. Downstream
//! decoding relies on that order to keep the two sides of every pair together.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::PairtileError;

const IMAGE_EXTENSIONS: [&str; 8] = ["png", "jpg", "jpeg", "webp", "bmp", "tif", "tiff", "gif"];
const INDEX_EXTENSIONS: [&str; 2] = ["txt", "csv"];

/// Identity of a sample, shared by its input and target images.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SampleKey(String);

impl SampleKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key for a source file: its stem, optionally prefixed with the name of the
/// directory holding it (`sub/img.png` becomes `sub.img`).
///
/// `path` should be relative to the collection root so that top-level files
/// keep their bare stem; see [`collection_key`].
pub fn filename_to_key(path: &Path, include_subdir: bool) -> SampleKey {
    let stem = path
        .file_stem()
        .or_else(|| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    if include_subdir {
        if let Some(parent) = path.parent().and_then(Path::file_name) {
            return SampleKey(format!("{}.{stem}", parent.to_string_lossy()));
        }
    }
    SampleKey(stem)
}

/// Key for `path` inside the collection rooted at `root`. Paths outside the
/// root are keyed as given.
pub fn collection_key(root: &Path, path: &Path, include_subdir: bool) -> SampleKey {
    let relative = path.strip_prefix(root).unwrap_or(path);
    filename_to_key(relative, include_subdir)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOptions {
    /// Descend into subdirectories when listing a directory.
    pub recursive: bool,
    pub include_subdir: bool,
}

/// One source image and the extra columns of its index row, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub path: PathBuf,
    pub options: Vec<String>,
}

/// All sources of one side, keyed and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collection {
    entries: BTreeMap<SampleKey, SourceEntry>,
}

impl Collection {
    /// Load a directory listing or a `.txt`/`.csv` index file.
    pub fn load(path: &Path, options: IndexOptions) -> Result<Self> {
        if path.is_dir() {
            return Self::from_dir(path, options);
        }

        if has_extension(path, &INDEX_EXTENSIONS) {
            return Self::from_index_file(path, options);
        }

        Err(PairtileError::configuration(format!(
            "{} is neither a directory nor a .txt/.csv index",
            path.display()
        ))
        .into())
    }

    pub fn from_dir(dir: &Path, options: IndexOptions) -> Result<Self> {
        let mut files = Vec::new();
        collect_image_files(dir, options.recursive, &mut files)?;
        files.sort();

        let mut collection = Self::default();
        for path in files {
            collection.insert(
                collection_key(dir, &path, options.include_subdir),
                SourceEntry {
                    path,
                    options: Vec::new(),
                },
            )?;
        }
        Ok(collection)
    }

    /// Rows are `source_path[, option, ...]`. Relative paths resolve against
    /// the index file's directory; blank rows and `#` comments are skipped.
    pub fn from_index_file(index: &Path, options: IndexOptions) -> Result<Self> {
        let base = index.parent().unwrap_or_else(|| Path::new(""));
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_path(index)
            .with_context(|| format!("failed to open index file: {}", index.display()))?;

        let mut collection = Self::default();
        for (row, record) in reader.records().enumerate() {
            let record = record.with_context(|| {
                format!("failed to read row {} of {}", row + 1, index.display())
            })?;
            let mut fields = record.iter();
            let Some(source) = fields.next().filter(|field| !field.is_empty()) else {
                continue;
            };

            let path = resolve_relative_to(base, Path::new(source));
            let entry = SourceEntry {
                options: fields.map(ToString::to_string).collect(),
                path,
            };
            let key = collection_key(base, &entry.path, options.include_subdir);
            collection.insert(key, entry)?;
        }
        Ok(collection)
    }

    fn insert(&mut self, key: SampleKey, entry: SourceEntry) -> Result<(), PairtileError> {
        if let Some(existing) = self.entries.get(&key) {
            return Err(PairtileError::DuplicateKey {
                key: key.0,
                first: existing.path.clone(),
                second: entry.path,
            });
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &SampleKey) -> Option<&SourceEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &SampleKey> {
        self.entries.keys()
    }
}

/// A target image and, when an input collection exists, its input counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    pub key: SampleKey,
    pub input: Option<SourceEntry>,
    pub target: SourceEntry,
}

/// Records in ascending key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleIndex {
    records: Vec<SampleRecord>,
    has_input: bool,
}

impl SampleIndex {
    /// Align the collections. Every target key must exist in `input`; input
    /// keys without a target are ignored.
    pub fn build(target: Collection, input: Option<Collection>) -> Result<Self, PairtileError> {
        let has_input = input.is_some();
        let mut input = input.map(|collection| collection.entries);
        let mut records = Vec::with_capacity(target.len());

        for (key, target_entry) in target.entries {
            let input_entry = match input.as_mut() {
                Some(inputs) => match inputs.remove(&key) {
                    Some(entry) => Some(entry),
                    None => return Err(PairtileError::MissingPair { key: key.0 }),
                },
                None => None,
            };
            records.push(SampleRecord {
                key,
                input: input_entry,
                target: target_entry,
            });
        }

        if let Some(unused) = input.filter(|inputs| !inputs.is_empty()) {
            debug!(count = unused.len(), "Ignoring input images without a target");
        }

        Ok(Self { records, has_input })
    }

    /// Load and align both sides as configured.
    pub fn load(target: &Path, input: Option<&Path>, options: IndexOptions) -> Result<Self> {
        let target_collection = Collection::load(target, options)
            .with_context(|| format!("failed to index target collection {}", target.display()))?;
        let input_collection = input
            .map(|path| {
                Collection::load(path, options)
                    .with_context(|| format!("failed to index input collection {}", path.display()))
            })
            .transpose()?;

        Ok(Self::build(target_collection, input_collection)?)
    }

    pub fn has_input(&self) -> bool {
        self.has_input
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<SampleRecord> {
        self.records
    }
}

fn collect_image_files(dir: &Path, recursive: bool, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to list directory: {}", dir.display()))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden {
            continue;
        }

        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if file_type.is_dir() {
            if recursive {
                collect_image_files(&path, recursive, files)?;
            }
        } else if has_extension(&path, &IMAGE_EXTENSIONS) {
            files.push(path);
        }
    }

    Ok(())
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            extensions
                .iter()
                .any(|candidate| ext.eq_ignore_ascii_case(candidate))
        })
        .unwrap_or(false)
}

fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
