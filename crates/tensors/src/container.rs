use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use serde::Deserialize;
use tracing::debug;

use crate::dtype::{decode_f32, Dtype};
use crate::error::{ContainerError, Result};

/// Upper bound on the JSON header, guards against absurd length prefixes.
pub const MAX_HEADER_LEN: usize = 100_000_000;

const METADATA_KEY: &str = "__metadata__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    /// Half-open byte range relative to the payload start.
    pub data_offsets: Range<usize>,
}

impl TensorDescriptor {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.data_offsets.end - self.data_offsets.start
    }
}

// Unknown keys are ignored by serde unless `deny_unknown_fields` is set.
#[derive(Deserialize)]
struct RawEntry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// Decoded container header.
#[derive(Debug, Clone, Default)]
pub struct Header {
    pub tensors: BTreeMap<String, TensorDescriptor>,
    pub metadata: HashMap<String, String>,
}

impl Header {
    /// Decode the JSON portion of a header.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(json)
            .map_err(|e| ContainerError::format(format!("header is not valid JSON: {e}")))?;
        let serde_json::Value::Object(entries) = value else {
            return Err(ContainerError::format("header is not a JSON object"));
        };

        let mut header = Header::default();
        for (name, value) in entries {
            if name == METADATA_KEY {
                header.metadata = serde_json::from_value(value).map_err(|e| {
                    ContainerError::format(format!("{METADATA_KEY} must map strings to strings: {e}"))
                })?;
                continue;
            }

            let raw: RawEntry = serde_json::from_value(value)
                .map_err(|e| ContainerError::format(format!("tensor {name}: {e}")))?;
            let dtype = Dtype::parse(&raw.dtype).ok_or_else(|| {
                ContainerError::format(format!("tensor {name}: unsupported dtype {}", raw.dtype))
            })?;
            let [start, end] = raw.data_offsets;
            if start > end {
                return Err(ContainerError::Range {
                    name,
                    start,
                    end,
                    payload_len: 0,
                });
            }
            header.tensors.insert(
                name.clone(),
                TensorDescriptor {
                    name,
                    dtype,
                    shape: raw.shape,
                    data_offsets: start..end,
                },
            );
        }
        Ok(header)
    }

    /// Check every descriptor against a payload of `payload_len` bytes.
    pub fn validate(&self, payload_len: usize) -> Result<()> {
        for desc in self.tensors.values() {
            let Range { start, end } = desc.data_offsets.clone();
            if end > payload_len {
                return Err(ContainerError::Range {
                    name: desc.name.clone(),
                    start,
                    end,
                    payload_len,
                });
            }
            let expected = desc
                .shape
                .iter()
                .try_fold(desc.dtype.size_in_bytes(), |acc, &d| acc.checked_mul(d))
                .ok_or_else(|| {
                    ContainerError::format(format!("tensor {}: shape overflows", desc.name))
                })?;
            if desc.byte_len() != expected {
                return Err(ContainerError::format(format!(
                    "tensor {}: {} bytes declared, shape {:?} of {} needs {}",
                    desc.name,
                    desc.byte_len(),
                    desc.shape,
                    desc.dtype,
                    expected
                )));
            }
        }

        let mut ranges: Vec<&TensorDescriptor> = self
            .tensors
            .values()
            .filter(|d| d.byte_len() > 0)
            .collect();
        ranges.sort_by_key(|d| d.data_offsets.start);
        for pair in ranges.windows(2) {
            if pair[1].data_offsets.start < pair[0].data_offsets.end {
                return Err(ContainerError::format(format!(
                    "tensors {} and {} overlap",
                    pair[0].name, pair[1].name
                )));
            }
        }
        Ok(())
    }
}

/// Split `bytes` into a decoded header and the payload start offset.
pub fn parse_header(bytes: &[u8]) -> Result<(Header, usize)> {
    if bytes.len() < 8 {
        return Err(ContainerError::format(format!(
            "container is {} bytes, too short for the header length prefix",
            bytes.len()
        )));
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&bytes[..8]);
    let header_len = usize::try_from(u64::from_le_bytes(prefix))
        .map_err(|_| ContainerError::format("header length does not fit in memory"))?;
    if header_len > MAX_HEADER_LEN {
        return Err(ContainerError::format(format!(
            "header length {header_len} exceeds limit {MAX_HEADER_LEN}"
        )));
    }
    let payload_start = 8 + header_len;
    if payload_start > bytes.len() {
        return Err(ContainerError::format(format!(
            "header declares {header_len} bytes, only {} available",
            bytes.len() - 8
        )));
    }
    let header = Header::from_json(&bytes[8..payload_start])?;
    Ok((header, payload_start))
}

enum Storage {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Storage {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Storage::Mapped(m) => &m[..],
            Storage::Owned(v) => v.as_slice(),
        }
    }
}

/// Anything that can hand out tensor descriptors and raw tensor bytes.
pub trait TensorSource {
    fn descriptor(&self, name: &str) -> Option<&TensorDescriptor>;

    fn tensor_bytes(&self, name: &str) -> Result<&[u8]>;

    fn tensor_names(&self) -> Vec<&str>;

    fn contains(&self, name: &str) -> bool {
        self.descriptor(name).is_some()
    }

    /// Read a floating point tensor as `f32`.
    fn read_f32(&self, name: &str) -> Result<Vec<f32>> {
        let desc = self
            .descriptor(name)
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))?;
        let dtype = desc.dtype;
        let bytes = self.tensor_bytes(name)?;
        decode_f32(dtype, bytes).ok_or_else(|| ContainerError::UnsupportedConversion {
            name: name.to_string(),
            dtype,
        })
    }
}

/// A single tensor container, memory-mapped or held in memory.
pub struct Container {
    path: Option<PathBuf>,
    storage: Storage,
    payload_start: usize,
    header: Header,
}

impl Container {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        if file.metadata()?.len() < 8 {
            return Err(ContainerError::format(format!(
                "{} is too short to be a tensor container",
                path.display()
            )));
        }
        // SAFETY: the map is read-only and model files are not rewritten while loaded.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        let mut container = Self::from_storage(Storage::Mapped(mmap))?;
        container.path = Some(path.to_path_buf());
        debug!(
            path = %path.display(),
            tensors = container.len(),
            "opened tensor container"
        );
        Ok(container)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_storage(Storage::Owned(bytes))
    }

    fn from_storage(storage: Storage) -> Result<Self> {
        let bytes = storage.as_bytes();
        let (header, payload_start) = parse_header(bytes)?;
        header.validate(bytes.len() - payload_start)?;
        Ok(Self {
            path: None,
            storage,
            payload_start,
            header,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.header.metadata
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.header.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.header.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.header.tensors.is_empty()
    }

    pub fn payload_len(&self) -> usize {
        self.storage.as_bytes().len() - self.payload_start
    }
}

impl TensorSource for Container {
    fn descriptor(&self, name: &str) -> Option<&TensorDescriptor> {
        self.header.tensors.get(name)
    }

    fn tensor_bytes(&self, name: &str) -> Result<&[u8]> {
        let desc = self
            .descriptor(name)
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))?;
        let start = self.payload_start + desc.data_offsets.start;
        let end = self.payload_start + desc.data_offsets.end;
        Ok(&self.storage.as_bytes()[start..end])
    }

    fn tensor_names(&self) -> Vec<&str> {
        self.names().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::ContainerWriter;

    fn raw_container(header: &str, payload: &[u8]) -> Vec<u8> {
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn descriptor_range_matches_shape_and_dtype() {
        let header = br#"{"test_tensor":{"dtype":"F32","shape":[2,3],"data_offsets":[0,24]}}"#;
        let header = Header::from_json(header).unwrap();
        let desc = &header.tensors["test_tensor"];
        assert_eq!(desc.dtype, Dtype::F32);
        assert_eq!(desc.shape, vec![2, 3]);
        assert_eq!(desc.byte_len(), 24);
        assert_eq!(desc.byte_len(), 2 * 3 * Dtype::F32.size_in_bytes());
        header.validate(24).unwrap();
    }

    #[test]
    fn lookup_returns_exact_bytes_and_unknown_fails() {
        let mut writer = ContainerWriter::new();
        writer.add_f32("a", &[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        writer.add_f32("b", &[3], &[5.0, 6.0, 7.0]).unwrap();
        let container = Container::from_bytes(writer.to_bytes()).unwrap();

        for name in ["a", "b"] {
            let desc = container.descriptor(name).unwrap();
            let bytes = container.tensor_bytes(name).unwrap();
            assert_eq!(bytes.len(), desc.numel() * desc.dtype.size_in_bytes());
        }
        assert_eq!(container.read_f32("b").unwrap(), vec![5.0, 6.0, 7.0]);
        assert!(matches!(
            container.tensor_bytes("missing"),
            Err(ContainerError::NotFound(name)) if name == "missing"
        ));
    }

    #[test]
    fn unknown_entry_fields_and_metadata_are_tolerated() {
        let header = r#"{"__metadata__":{"format":"pt"},"w":{"dtype":"F32","shape":[1],"data_offsets":[0,4],"quant_hint":"none"}}"#;
        let container = Container::from_bytes(raw_container(header, &1.5f32.to_le_bytes())).unwrap();
        assert_eq!(container.metadata()["format"], "pt");
        assert_eq!(container.read_f32("w").unwrap(), vec![1.5]);
        assert_eq!(container.len(), 1);
    }

    #[test]
    fn offsets_past_payload_are_range_errors() {
        let header = r#"{"w":{"dtype":"F32","shape":[2],"data_offsets":[0,8]}}"#;
        let err = Container::from_bytes(raw_container(header, &[0u8; 4])).err().unwrap();
        assert!(matches!(err, ContainerError::Range { end: 8, payload_len: 4, .. }));
    }

    #[test]
    fn reversed_offsets_are_range_errors() {
        let header = br#"{"w":{"dtype":"F32","shape":[0],"data_offsets":[8,4]}}"#;
        assert!(matches!(
            Header::from_json(header),
            Err(ContainerError::Range { start: 8, end: 4, .. })
        ));
    }

    #[test]
    fn length_disagreeing_with_shape_is_a_format_error() {
        let header = r#"{"w":{"dtype":"F16","shape":[3],"data_offsets":[0,4]}}"#;
        let err = Container::from_bytes(raw_container(header, &[0u8; 4])).err().unwrap();
        assert!(matches!(err, ContainerError::Format(_)));
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let header = r#"{"a":{"dtype":"F32","shape":[2],"data_offsets":[0,8]},"b":{"dtype":"F32","shape":[2],"data_offsets":[4,12]}}"#;
        let err = Container::from_bytes(raw_container(header, &[0u8; 12])).err().unwrap();
        match err {
            ContainerError::Format(msg) => assert!(msg.contains("overlap"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn garbage_headers_are_format_errors() {
        assert!(matches!(
            Container::from_bytes(vec![1, 2, 3]),
            Err(ContainerError::Format(_))
        ));
        assert!(matches!(
            Container::from_bytes(raw_container("not json", &[])),
            Err(ContainerError::Format(_))
        ));
        assert!(matches!(
            Container::from_bytes(raw_container("[1,2]", &[])),
            Err(ContainerError::Format(_))
        ));
        let mut truncated = 1000u64.to_le_bytes().to_vec();
        truncated.extend_from_slice(b"{}");
        assert!(matches!(
            Container::from_bytes(truncated),
            Err(ContainerError::Format(_))
        ));
        let header = r#"{"w":{"dtype":"Q4","shape":[1],"data_offsets":[0,1]}}"#;
        assert!(matches!(
            Container::from_bytes(raw_container(header, &[0])),
            Err(ContainerError::Format(_))
        ));
    }

    #[test]
    fn integer_tensors_are_not_read_as_f32() {
        let mut writer = ContainerWriter::new();
        writer.add_raw("q", Dtype::I8, &[4], &[1, 2, 3, 4]).unwrap();
        let container = Container::from_bytes(writer.to_bytes()).unwrap();
        assert_eq!(container.tensor_bytes("q").unwrap(), &[1, 2, 3, 4]);
        assert!(matches!(
            container.read_f32("q"),
            Err(ContainerError::UnsupportedConversion { dtype: Dtype::I8, .. })
        ));
    }

    #[test]
    fn open_maps_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let mut writer = ContainerWriter::new();
        writer.add_f32("w", &[2], &[0.25, -0.5]).unwrap();
        writer.write_to(&path).unwrap();

        let container = Container::open(&path).unwrap();
        assert_eq!(container.path(), Some(path.as_path()));
        assert_eq!(container.read_f32("w").unwrap(), vec![0.25, -0.5]);
        assert_eq!(container.payload_len(), 8);
    }
}
