// pipeline/artifact.rs
// Persisted run artifacts - columnar embedding file plus JSON result documents

use crate::error::{PipelineError, Result};
use crate::pipeline::embed::EmbeddingSet;
use arrow::array::{Array, ArrayRef, AsArray, FixedSizeListArray, Float32Array, StringArray};
use arrow::datatypes::{DataType, Field, Float32Type, Schema};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const EMBEDDINGS_FILE: &str = "embeddings.arrow";
pub const CLUSTERING_FILE: &str = "clustering_results.json";
pub const ANALYSIS_FILE: &str = "analysis_results.json";

/// Reject ids that would resolve outside their own directory under the data root
pub fn check_project_id(project_id: &str) -> Result<()> {
    let invalid = project_id.trim().is_empty()
        || project_id == "."
        || project_id.contains("..")
        || project_id.contains(&['/', '\\', '\0'][..])
        || Path::new(project_id).is_absolute();
    if invalid {
        return Err(PipelineError::Input(format!("invalid project id {:?}", project_id)));
    }
    Ok(())
}

/// Per-project artifact directory under the data root
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn project_dir(&self, project_id: &str) -> Result<PathBuf> {
        check_project_id(project_id)?;
        Ok(self.root.join(project_id))
    }

    pub fn embeddings_path(&self, project_id: &str) -> Result<PathBuf> {
        Ok(self.project_dir(project_id)?.join(EMBEDDINGS_FILE))
    }

    /// Write the embedding set as an Arrow IPC file:
    /// `node_id`, `url`, `vector`, `fingerprint`
    pub fn write_embeddings(&self, project_id: &str, embeddings: &EmbeddingSet) -> Result<PathBuf> {
        let path = self.embeddings_path(project_id)?;
        let batch = embeddings_batch(embeddings)?;

        let tmp = path.with_extension("arrow.tmp");
        fs::create_dir_all(self.project_dir(project_id)?)?;
        {
            let mut writer = FileWriter::try_new(BufWriter::new(File::create(&tmp)?), &batch.schema())?;
            writer.write(&batch)?;
            writer.finish()?;
        }
        fs::rename(&tmp, &path)?;

        info!(
            "Saved {} embeddings ({} dims) to {}",
            embeddings.len(),
            embeddings.dimensions(),
            path.display()
        );
        Ok(path)
    }

    /// Load a previously written embedding set, `None` when there is none
    pub fn read_embeddings(&self, project_id: &str) -> Result<Option<EmbeddingSet>> {
        let path = self.embeddings_path(project_id)?;
        if !path.exists() {
            return Ok(None);
        }

        let reader = FileReader::try_new(BufReader::new(File::open(&path)?), None)?;
        let mut node_ids = Vec::new();
        let mut urls = Vec::new();
        let mut rows = Vec::new();
        let mut fingerprints = Vec::new();
        let mut fingerprinted = true;

        for batch in reader {
            let batch = batch?;
            let ids = string_column(&batch, "node_id")?;
            let batch_urls = string_column(&batch, "url")?;
            let vectors = batch
                .column_by_name("vector")
                .and_then(|c| c.as_fixed_size_list_opt())
                .ok_or_else(|| PipelineError::Artifact("missing vector column".to_string()))?;
            let width = vectors.value_length() as usize;
            let values = vectors
                .values()
                .as_primitive_opt::<Float32Type>()
                .ok_or_else(|| PipelineError::Artifact("vector items are not float32".to_string()))?;
            // Older artifacts carry no fingerprint column
            let batch_fingerprints = batch
                .column_by_name("fingerprint")
                .and_then(|c| c.as_string_opt::<i32>());

            for row in 0..batch.num_rows() {
                node_ids.push(ids.value(row).to_string());
                urls.push(batch_urls.value(row).to_string());
                let offset = vectors.value_offset(row) as usize;
                rows.push(values.values()[offset..offset + width].to_vec());
                match batch_fingerprints.filter(|c| c.is_valid(row)) {
                    Some(column) => fingerprints.push(column.value(row).to_string()),
                    None => fingerprinted = false,
                }
            }
        }

        debug!("Loaded {} embeddings from {}", rows.len(), path.display());
        let set = EmbeddingSet::from_rows(node_ids, urls, rows)?;
        if fingerprinted {
            set.with_fingerprints(fingerprints).map(Some)
        } else {
            Ok(Some(set))
        }
    }

    /// Pretty-printed JSON document in the project directory
    pub fn save_json<T: Serialize>(&self, project_id: &str, name: &str, value: &T) -> Result<PathBuf> {
        let dir = self.project_dir(project_id)?;
        fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, value)?;
        debug!("Saved {}", path.display());
        Ok(path)
    }

    pub fn load_json<T: DeserializeOwned>(&self, project_id: &str, name: &str) -> Result<Option<T>> {
        let path = self.project_dir(project_id)?.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(Some(serde_json::from_reader(reader)?))
    }
}

fn embeddings_batch(embeddings: &EmbeddingSet) -> Result<RecordBatch> {
    let dims = embeddings.dimensions() as i32;
    let item = Arc::new(Field::new("item", DataType::Float32, false));

    let schema = Arc::new(Schema::new(vec![
        Field::new("node_id", DataType::Utf8, false),
        Field::new("url", DataType::Utf8, false),
        Field::new("vector", DataType::FixedSizeList(item.clone(), dims), false),
        Field::new("fingerprint", DataType::Utf8, true),
    ]));

    let flat: Vec<f32> = embeddings.vectors.iter().copied().collect();
    let vectors = FixedSizeListArray::try_new(item, dims, Arc::new(Float32Array::from(flat)), None)?;

    let fingerprints: StringArray = if embeddings.fingerprints.is_empty() {
        (0..embeddings.len()).map(|_| None::<&str>).collect()
    } else {
        embeddings.fingerprints.iter().map(|f| Some(f.as_str())).collect()
    };

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(embeddings.node_ids.clone())),
        Arc::new(StringArray::from(embeddings.urls.clone())),
        Arc::new(vectors),
        Arc::new(fingerprints),
    ];

    Ok(RecordBatch::try_new(schema, columns)?)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_string_opt::<i32>())
        .ok_or_else(|| PipelineError::Artifact(format!("missing {} column", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> EmbeddingSet {
        EmbeddingSet::from_rows(
            vec!["n1".to_string(), "n2".to_string()],
            vec!["https://x/a".to_string(), "https://x/b".to_string()],
            vec![vec![0.6, 0.8, 0.0], vec![0.0, 0.0, 1.0]],
        )
        .unwrap()
    }

    #[test]
    fn embeddings_survive_a_write_read_cycle() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());

        let path = store.write_embeddings("p1", &sample()).unwrap();
        assert!(path.ends_with("p1/embeddings.arrow"));

        let loaded = store.read_embeddings("p1").unwrap().unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn missing_artifacts_read_as_none() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());

        assert!(store.read_embeddings("nope").unwrap().is_none());
        assert!(store
            .load_json::<serde_json::Value>("nope", ANALYSIS_FILE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn json_documents_land_in_the_project_dir() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());

        let path = store
            .save_json("p1", CLUSTERING_FILE, &serde_json::json!({"n_clusters": 2}))
            .unwrap();
        assert_eq!(path, dir.path().join("p1").join(CLUSTERING_FILE));

        let value: serde_json::Value = store.load_json("p1", CLUSTERING_FILE).unwrap().unwrap();
        assert_eq!(value["n_clusters"], 2);
    }

    #[test]
    fn fingerprints_are_persisted() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let set = sample()
            .with_fingerprints(vec!["aa".to_string(), "bb".to_string()])
            .unwrap();

        store.write_embeddings("p1", &set).unwrap();
        let loaded = store.read_embeddings("p1").unwrap().unwrap();
        assert_eq!(loaded.fingerprints, vec!["aa", "bb"]);
    }

    #[test]
    fn project_ids_cannot_leave_the_data_dir() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("data"));

        for bad in ["../x", "..", "a/b", "a\\b", "/etc", "", "."] {
            assert!(
                matches!(store.project_dir(bad), Err(PipelineError::Input(_))),
                "{:?} should be rejected",
                bad
            );
        }
        assert!(store.save_json("../x", ANALYSIS_FILE, &1).is_err());
        assert!(!dir.path().join("x").exists());
        assert!(store.project_dir("site-1.v2").is_ok());
    }
}
