use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::container::{Container, TensorDescriptor, TensorSource};
use crate::error::{ContainerError, Result};

pub const CONTAINER_EXTENSION: &str = "safetensors";

/// One or more containers that together hold a model's tensors.
pub struct ContainerSet {
    shards: Vec<Container>,
    index: HashMap<String, usize>,
}

impl ContainerSet {
    pub fn from_containers(shards: Vec<Container>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, shard) in shards.iter().enumerate() {
            for name in shard.names() {
                if let Some(prev) = index.insert(name.to_string(), i) {
                    return Err(ContainerError::format(format!(
                        "tensor {name} is declared by shards {prev} and {i}"
                    )));
                }
            }
        }
        Ok(Self { shards, index })
    }

    /// Container files in `dir`, sorted by file name.
    pub fn discover<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir.as_ref())?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == CONTAINER_EXTENSION))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Open every container in `dir`. `on_shard` is called after each file.
    pub fn open_dir<P, F>(dir: P, mut on_shard: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: FnMut(usize, usize),
    {
        let dir = dir.as_ref();
        let paths = Self::discover(dir)?;
        if paths.is_empty() {
            return Err(ContainerError::NotFound(format!(
                "*.{CONTAINER_EXTENSION} in {}",
                dir.display()
            )));
        }
        let mut shards = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            shards.push(Container::open(path)?);
            on_shard(i + 1, paths.len());
        }
        let set = Self::from_containers(shards)?;
        info!(
            dir = %dir.display(),
            shards = set.shards.len(),
            tensors = set.index.len(),
            "opened container set"
        );
        Ok(set)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl TensorSource for ContainerSet {
    fn descriptor(&self, name: &str) -> Option<&TensorDescriptor> {
        let shard = *self.index.get(name)?;
        self.shards[shard].descriptor(name)
    }

    fn tensor_bytes(&self, name: &str) -> Result<&[u8]> {
        let shard = *self
            .index
            .get(name)
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))?;
        self.shards[shard].tensor_bytes(name)
    }

    fn tensor_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.index.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
