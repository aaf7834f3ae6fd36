//! # Distance matrix and sample name handling
//!
//! Loads the comma-separated sample-by-sample distance matrix, optionally
//! relabels its samples through a name mapping file, and lines it up with the
//! sample columns of the VCF. All failures here are configuration errors and end
//! the run before any worker is started.

use crate::files::{FileError, open_text, quote};
use crate::types::Sample;
use crate::vcf::FIRST_SAMPLE_COLUMN;
use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// How many offending names to include in an error message.
const NAMES_IN_MESSAGES: usize = 5;

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error(transparent)]
    File(#[from] FileError),
    #[error("Error reading {}: {source}", quote(.path))]
    Csv { path: PathBuf, source: csv::Error },
    #[error("CSV file is empty: {}", quote(.path))]
    Empty { path: PathBuf },
    #[error("Wrong number of columns at {}:{line}", quote(.path))]
    ColumnCount { path: PathBuf, line: usize },
    #[error("Invalid value at {}:{line}: {value:?}", quote(.path))]
    InvalidValue {
        path: PathBuf,
        line: usize,
        value: String,
    },
    #[error("Duplicate columns in {}: {}", quote(.path), preview(.names))]
    DuplicateColumns { path: PathBuf, names: Vec<String> },
    #[error("Duplicate rows in {}: {}", quote(.path), preview(.names))]
    DuplicateRows { path: PathBuf, names: Vec<String> },
    #[error("Mismatch between row and column names in {}", quote(.path))]
    NameMismatch { path: PathBuf },
    #[error("Missing column in {}: {column:?}", quote(.path))]
    MissingColumn { path: PathBuf, column: String },
    #[error("Duplicate mapping from sample {0:?}")]
    DuplicateMappingSource(String),
    #[error("Duplicate mapping to sample {0:?}")]
    DuplicateMappingTarget(String),
    #[error("Missing samples in name mapping: {}", preview(.0))]
    MissingNames(Vec<String>),
    #[error("Sample {0:?} is not part of the distance matrix")]
    UnknownSample(String),
    #[error("Samples in VCF not found in distance matrix: {}", preview(.0))]
    SamplesNotInMatrix(Vec<String>),
    #[error("Duplicate sample names in VCF header: {}", preview(.0))]
    DuplicateVcfSamples(Vec<String>),
}

fn preview(names: &[String]) -> String {
    let shown = names.iter().take(NAMES_IN_MESSAGES).join(", ");
    if names.len() > NAMES_IN_MESSAGES {
        format!("{shown}, ...")
    } else {
        shown
    }
}

/// Returns every value that occurs more than once, sorted.
fn collect_duplicates<'a, I>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: AHashMap<&str, usize> = AHashMap::new();
    for item in items {
        *counts.entry(item).or_default() += 1;
    }

    counts
        .into_iter()
        .filter(|&(_, count)| count > 1)
        .map(|(name, _)| name.to_string())
        .sorted()
        .collect()
}

/// A CSV file with a header row, every data row having as many cells as the header.
struct CsvTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl CsvTable {
    fn read(path: &Path) -> Result<Self, MatrixError> {
        let csv_error = |source| MatrixError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(open_text(path)?);

        let mut records = reader.records();
        let header: Vec<String> = match records.next() {
            Some(record) => record.map_err(csv_error)?.iter().map(str::to_string).collect(),
            None => {
                return Err(MatrixError::Empty {
                    path: path.to_path_buf(),
                });
            }
        };

        let mut rows = Vec::new();
        for (index, record) in records.enumerate() {
            let record = record.map_err(csv_error)?;
            if record.len() != header.len() {
                return Err(MatrixError::ColumnCount {
                    path: path.to_path_buf(),
                    line: index + 1,
                });
            }
            rows.push(record.iter().map(str::to_string).collect());
        }

        if rows.is_empty() {
            return Err(MatrixError::Empty {
                path: path.to_path_buf(),
            });
        }

        Ok(Self { header, rows })
    }
}

/// A square table of pairwise distances, keyed by sample name in both dimensions.
#[derive(Clone, Debug)]
pub struct DistanceMatrix {
    samples: Vec<String>,
    matrix: AHashMap<String, AHashMap<String, f64>>,
}

impl DistanceMatrix {
    /// Loads a matrix whose header row names the columns (the first cell is
    /// ignored) and whose rows each start with the name of the row sample.
    pub fn load(path: &Path) -> Result<Self, MatrixError> {
        let table = CsvTable::read(path)?;
        let columns = table.header.get(1..).unwrap_or_default();

        let duplicates = collect_duplicates(columns.iter().map(String::as_str));
        if !duplicates.is_empty() {
            return Err(MatrixError::DuplicateColumns {
                path: path.to_path_buf(),
                names: duplicates,
            });
        }

        let duplicates = collect_duplicates(table.rows.iter().map(|row| row[0].as_str()));
        if !duplicates.is_empty() {
            return Err(MatrixError::DuplicateRows {
                path: path.to_path_buf(),
                names: duplicates,
            });
        }

        let row_names: AHashSet<&str> = table.rows.iter().map(|row| row[0].as_str()).collect();
        let column_names: AHashSet<&str> = columns.iter().map(String::as_str).collect();
        if *row_names != *column_names {
            return Err(MatrixError::NameMismatch {
                path: path.to_path_buf(),
            });
        }

        let mut matrix = AHashMap::with_capacity(table.rows.len());
        for (index, row) in table.rows.iter().enumerate() {
            let mut distances = AHashMap::with_capacity(columns.len());
            for (column, cell) in columns.iter().zip(&row[1..]) {
                let value = cell
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite())
                    .ok_or_else(|| MatrixError::InvalidValue {
                        path: path.to_path_buf(),
                        line: index + 1,
                        value: cell.clone(),
                    })?;
                distances.insert(column.clone(), value);
            }
            matrix.insert(row[0].clone(), distances);
        }

        Ok(Self {
            samples: columns.to_vec(),
            matrix,
        })
    }

    /// Sample names in the column order of the input file.
    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, row: &str, column: &str) -> Option<f64> {
        self.matrix.get(row)?.get(column).copied()
    }

    /// Renames every sample through `mapping`. Fails, leaving the matrix
    /// untouched, if any current sample has no entry.
    pub fn replace_names(&mut self, mapping: &AHashMap<String, String>) -> Result<(), MatrixError> {
        let missing: Vec<String> = self
            .samples
            .iter()
            .filter(|name| !mapping.contains_key(*name))
            .cloned()
            .sorted()
            .collect();
        if !missing.is_empty() {
            return Err(MatrixError::MissingNames(missing));
        }

        let rename = |name: &String| mapping[name].clone();
        self.samples = self.samples.iter().map(rename).collect();
        self.matrix = self
            .matrix
            .iter()
            .map(|(row, distances)| {
                let distances = distances
                    .iter()
                    .map(|(column, &value)| (rename(column), value))
                    .collect();
                (rename(row), distances)
            })
            .collect();

        Ok(())
    }

    /// Row-major values of the sub-matrix spanned by `order`: entry `i * n + j`
    /// is the distance from `order[i]` to `order[j]`.
    pub fn flatten(&self, order: &[String]) -> Result<Vec<f64>, MatrixError> {
        let mut values = Vec::with_capacity(order.len() * order.len());
        for row_name in order {
            let row = self
                .matrix
                .get(row_name)
                .ok_or_else(|| MatrixError::UnknownSample(row_name.clone()))?;
            for column_name in order {
                let value = row
                    .get(column_name)
                    .ok_or_else(|| MatrixError::UnknownSample(column_name.clone()))?;
                values.push(*value);
            }
        }

        Ok(values)
    }

    /// Pairs every VCF sample with its record column, in VCF order. Every VCF
    /// sample must be present in the matrix; matrix samples absent from the VCF
    /// are left out.
    pub fn align_samples(&self, vcf_samples: &[String]) -> Result<Vec<Sample>, MatrixError> {
        let duplicates = collect_duplicates(vcf_samples.iter().map(String::as_str));
        if !duplicates.is_empty() {
            return Err(MatrixError::DuplicateVcfSamples(duplicates));
        }

        let missing: Vec<String> = vcf_samples
            .iter()
            .filter(|name| !self.matrix.contains_key(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(MatrixError::SamplesNotInMatrix(missing));
        }

        Ok(vcf_samples
            .iter()
            .enumerate()
            .map(|(index, name)| Sample {
                name: name.clone(),
                column: FIRST_SAMPLE_COLUMN + index,
            })
            .collect())
    }
}

/// Reads a CSV file mapping names in `source_column` to names in `target_column`.
/// Both directions of the mapping must be unique.
pub fn load_name_mapping(
    path: &Path,
    source_column: &str,
    target_column: &str,
) -> Result<AHashMap<String, String>, MatrixError> {
    let table = CsvTable::read(path)?;
    let column_index = |column: &str| {
        table
            .header
            .iter()
            .position(|name| name == column)
            .ok_or_else(|| MatrixError::MissingColumn {
                path: path.to_path_buf(),
                column: column.to_string(),
            })
    };
    let source_index = column_index(source_column)?;
    let target_index = column_index(target_column)?;

    let mut mapping = AHashMap::with_capacity(table.rows.len());
    let mut targets = AHashSet::with_capacity(table.rows.len());
    for row in &table.rows {
        let source = &row[source_index];
        let target = &row[target_index];

        if mapping.contains_key(source) {
            return Err(MatrixError::DuplicateMappingSource(source.clone()));
        } else if !targets.insert(target.clone()) {
            return Err(MatrixError::DuplicateMappingTarget(target.clone()));
        }

        mapping.insert(source.clone(), target.clone());
    }

    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::{SeedableRng, rngs::StdRng};
    use tempfile::{TempDir, tempdir};

    fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn load(contents: &str) -> Result<DistanceMatrix, MatrixError> {
        let dir = tempdir().unwrap();
        DistanceMatrix::load(&write_file(&dir, "matrix.csv", contents))
    }

    const ASYMMETRIC: &str = "id,a,b,c\n\
                              a,0,1.5,2\n\
                              b,1.25,0,3\n\
                              c,2.5,3.5,0\n";

    #[test]
    fn loads_square_matrix() {
        let matrix = load(ASYMMETRIC).unwrap();
        assert_eq!(matrix.samples(), ["a", "b", "c"]);
        assert_eq!(matrix.get("a", "b"), Some(1.5));
        assert_eq!(matrix.get("b", "a"), Some(1.25));
        assert_eq!(matrix.get("c", "c"), Some(0.0));
    }

    #[test]
    fn row_order_may_differ_from_column_order() {
        let matrix = load("id,a,b\nb,1,0\na,0,1\n").unwrap();
        assert_eq!(matrix.samples(), ["a", "b"]);
        assert_eq!(matrix.get("b", "a"), Some(1.0));
    }

    #[test]
    fn rejects_malformed_matrices() {
        assert!(matches!(load(""), Err(MatrixError::Empty { .. })));
        assert!(matches!(load("id,a\n"), Err(MatrixError::Empty { .. })));
        assert!(matches!(
            load("id,a,b\na,0,1\nb,1\n"),
            Err(MatrixError::ColumnCount { line: 2, .. })
        ));
        assert!(matches!(
            load("id,a,b\na,0,x\nb,1,0\n"),
            Err(MatrixError::InvalidValue { line: 1, .. })
        ));
        assert!(matches!(
            load("id,a,b\na,0,nan\nb,1,0\n"),
            Err(MatrixError::InvalidValue { .. })
        ));
        assert!(matches!(
            load("id,a,a\na,0,1\nb,1,0\n"),
            Err(MatrixError::DuplicateColumns { .. })
        ));
        assert!(matches!(
            load("id,a,b\na,0,1\na,1,0\n"),
            Err(MatrixError::DuplicateRows { .. })
        ));
        assert!(matches!(
            load("id,a,b\na,0,1\nc,1,0\n"),
            Err(MatrixError::NameMismatch { .. })
        ));
    }

    #[test]
    fn flatten_reproduces_every_entry_for_any_order() {
        let matrix = load(ASYMMETRIC).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut order = matrix.samples().to_vec();

        for _ in 0..10 {
            order.shuffle(&mut rng);
            let values = matrix.flatten(&order).unwrap();
            let n = order.len();
            assert_eq!(values.len(), n * n);
            for (i, row) in order.iter().enumerate() {
                for (j, column) in order.iter().enumerate() {
                    assert_eq!(Some(values[i * n + j]), matrix.get(row, column));
                }
            }
        }
    }

    #[test]
    fn flatten_rejects_unknown_samples() {
        let matrix = load(ASYMMETRIC).unwrap();
        let order = vec!["a".to_string(), "z".to_string()];
        assert!(matches!(
            matrix.flatten(&order),
            Err(MatrixError::UnknownSample(name)) if name == "z"
        ));
    }

    #[test]
    fn replace_names_only_relabels() {
        let original = load(ASYMMETRIC).unwrap();
        let mapping: AHashMap<String, String> = [("a", "x"), ("b", "y"), ("c", "z")]
            .into_iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();

        let mut renamed = original.clone();
        renamed.replace_names(&mapping).unwrap();

        assert_eq!(renamed.samples(), ["x", "y", "z"]);
        for row in original.samples() {
            for column in original.samples() {
                assert_eq!(
                    original.get(row, column),
                    renamed.get(&mapping[row], &mapping[column])
                );
            }
        }
        assert_eq!(renamed.get("a", "b"), None);
    }

    #[test]
    fn replace_names_requires_every_sample() {
        let mut matrix = load(ASYMMETRIC).unwrap();
        let before = matrix.clone();
        let mapping: AHashMap<String, String> =
            [("a".to_string(), "x".to_string())].into_iter().collect();

        match matrix.replace_names(&mapping) {
            Err(MatrixError::MissingNames(names)) => assert_eq!(names, ["b", "c"]),
            other => panic!("expected missing names, got {other:?}"),
        }
        assert_eq!(matrix.samples(), before.samples());
        assert_eq!(matrix.get("a", "b"), Some(1.5));
        assert_eq!(matrix.get("x", "b"), None);
    }

    #[test]
    fn align_samples_follows_vcf_order() {
        let matrix = load(ASYMMETRIC).unwrap();
        let vcf = vec!["c".to_string(), "a".to_string()];
        let samples = matrix.align_samples(&vcf).unwrap();

        assert_eq!(
            samples,
            [
                Sample {
                    name: "c".into(),
                    column: 9
                },
                Sample {
                    name: "a".into(),
                    column: 10
                },
            ]
        );
    }

    #[test]
    fn align_samples_requires_vcf_samples_in_matrix() {
        let matrix = load(ASYMMETRIC).unwrap();
        let vcf = vec!["a".to_string(), "q".to_string()];
        assert!(matches!(
            matrix.align_samples(&vcf),
            Err(MatrixError::SamplesNotInMatrix(names)) if names == ["q"]
        ));

        let vcf = vec!["a".to_string(), "a".to_string()];
        assert!(matches!(
            matrix.align_samples(&vcf),
            Err(MatrixError::DuplicateVcfSamples(_))
        ));
    }

    #[test]
    fn name_mapping_uses_named_columns() {
        let dir = tempdir().unwrap();
        let path = write_file(
            &dir,
            "names.csv",
            "Extra,IND_ID,SampleID\n1,vcf_a,a\n2,vcf_b,b\n",
        );

        let mapping = load_name_mapping(&path, "SampleID", "IND_ID").unwrap();
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping["a"], "vcf_a");
        assert_eq!(mapping["b"], "vcf_b");
    }

    #[test]
    fn name_mapping_rejects_ambiguity() {
        let dir = tempdir().unwrap();

        let path = write_file(&dir, "dup_source.csv", "SampleID,IND_ID\na,x\na,y\n");
        assert!(matches!(
            load_name_mapping(&path, "SampleID", "IND_ID"),
            Err(MatrixError::DuplicateMappingSource(name)) if name == "a"
        ));

        let path = write_file(&dir, "dup_target.csv", "SampleID,IND_ID\na,x\nb,x\n");
        assert!(matches!(
            load_name_mapping(&path, "SampleID", "IND_ID"),
            Err(MatrixError::DuplicateMappingTarget(name)) if name == "x"
        ));

        let path = write_file(&dir, "no_column.csv", "SampleID,Other\na,x\n");
        assert!(matches!(
            load_name_mapping(&path, "SampleID", "IND_ID"),
            Err(MatrixError::MissingColumn { column, .. }) if column == "IND_ID"
        ));
    }

    #[test]
    fn preview_truncates_long_lists() {
        let names: Vec<String> = (1..=7).map(|i| format!("s{i}")).collect();
        assert_eq!(preview(&names), "s1, s2, s3, s4, s5, ...");
        assert_eq!(preview(&names[..2]), "s1, s2");
    }
}
