use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::json;

use crate::dtype::{encode_f32, Dtype};
use crate::error::{ContainerError, Result};

struct Entry {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

/// Builds containers in the same layout [`crate::Container`] reads.
#[derive(Default)]
pub struct ContainerWriter {
    entries: BTreeMap<String, Entry>,
    metadata: HashMap<String, String>,
}

impl ContainerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_raw(&mut self, name: &str, dtype: Dtype, shape: &[usize], data: &[u8]) -> Result<()> {
        let expected = shape.iter().product::<usize>() * dtype.size_in_bytes();
        if data.len() != expected {
            return Err(ContainerError::format(format!(
                "tensor {name}: {} bytes given, shape {shape:?} of {dtype} needs {expected}",
                data.len()
            )));
        }
        if self.entries.contains_key(name) {
            return Err(ContainerError::format(format!("tensor {name} added twice")));
        }
        self.entries.insert(
            name.to_string(),
            Entry {
                dtype,
                shape: shape.to_vec(),
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    pub fn add_f32(&mut self, name: &str, shape: &[usize], values: &[f32]) -> Result<()> {
        self.add_as(name, Dtype::F32, shape, values)
    }

    /// Store `values` converted to a floating point `dtype`.
    pub fn add_as(&mut self, name: &str, dtype: Dtype, shape: &[usize], values: &[f32]) -> Result<()> {
        let data = encode_f32(dtype, values).ok_or_else(|| ContainerError::UnsupportedConversion {
            name: name.to_string(),
            dtype,
        })?;
        self.add_raw(name, dtype, shape, &data)
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) {
        self.metadata.insert(key.to_string(), value.to_string());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = serde_json::Map::new();
        if !self.metadata.is_empty() {
            header.insert("__metadata__".to_string(), json!(self.metadata));
        }
        let mut offset = 0usize;
        for (name, entry) in &self.entries {
            let end = offset + entry.data.len();
            header.insert(
                name.clone(),
                json!({
                    "dtype": entry.dtype.as_str(),
                    "shape": entry.shape,
                    "data_offsets": [offset, end],
                }),
            );
            offset = end;
        }

        let mut header = serde_json::Value::Object(header).to_string().into_bytes();
        // Pad with spaces so the payload starts 8-byte aligned.
        while (8 + header.len()) % 8 != 0 {
            header.push(b' ');
        }

        let mut bytes = Vec::with_capacity(8 + header.len() + offset);
        bytes.extend_from_slice(&(header.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&header);
        for entry in self.entries.values() {
            bytes.extend_from_slice(&entry.data);
        }
        bytes
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&self.to_bytes())?;
        out.flush()?;
        Ok(())
    }
}
