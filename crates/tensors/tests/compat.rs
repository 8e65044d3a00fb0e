use std::borrow::Cow;
use std::collections::HashMap;

use safetensors::tensor::View;
use safetensors::SafeTensors;
use tensors::{Container, ContainerWriter, Dtype, TensorSource};

struct Fixture {
    dtype: safetensors::Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl View for Fixture {
    fn dtype(&self) -> safetensors::Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[test]
fn reads_containers_written_by_the_reference_implementation() {
    let tensors = vec![
        (
            "model.embed_tokens.weight".to_string(),
            Fixture {
                dtype: safetensors::Dtype::F32,
                shape: vec![2, 3],
                data: f32_bytes(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
            },
        ),
        (
            "model.norm.weight".to_string(),
            Fixture {
                dtype: safetensors::Dtype::BF16,
                shape: vec![3],
                data: vec![0x80, 0x3f, 0x00, 0x40, 0x40, 0x40],
            },
        ),
        (
            "q".to_string(),
            Fixture {
                dtype: safetensors::Dtype::I8,
                shape: vec![4],
                data: vec![1, 255, 3, 128],
            },
        ),
    ];
    let mut info = HashMap::new();
    info.insert("format".to_string(), "pt".to_string());
    let bytes = safetensors::serialize(tensors, &Some(info)).unwrap();

    let container = Container::from_bytes(bytes).unwrap();
    assert_eq!(container.len(), 3);
    assert_eq!(container.metadata()["format"], "pt");
    assert_eq!(
        container.read_f32("model.embed_tokens.weight").unwrap(),
        vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]
    );
    assert_eq!(container.read_f32("model.norm.weight").unwrap(), vec![1.0, 2.0, 3.0]);
    let q = container.descriptor("q").unwrap();
    assert_eq!(q.dtype, Dtype::I8);
    assert_eq!(container.tensor_bytes("q").unwrap(), &[1, 255, 3, 128]);
}

#[test]
fn reference_implementation_reads_our_containers() {
    let mut writer = ContainerWriter::new();
    writer.add_f32("a", &[2, 2], &[1.0, -1.0, 0.5, 8.0]).unwrap();
    writer.add_as("b", Dtype::F16, &[3], &[0.5, 0.25, -2.0]).unwrap();
    writer.set_metadata("source", "gemi");
    let bytes = writer.to_bytes();

    let reference = SafeTensors::deserialize(&bytes).unwrap();
    let a = reference.tensor("a").unwrap();
    assert_eq!(a.dtype(), safetensors::Dtype::F32);
    assert_eq!(a.shape(), &[2, 2]);
    assert_eq!(a.data(), f32_bytes(&[1.0, -1.0, 0.5, 8.0]).as_slice());

    let b = reference.tensor("b").unwrap();
    assert_eq!(b.dtype(), safetensors::Dtype::F16);
    let ours = Container::from_bytes(bytes.clone()).unwrap();
    assert_eq!(b.data(), ours.tensor_bytes("b").unwrap());
}
