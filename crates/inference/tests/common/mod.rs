#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use gemi_core::testing::{random_container, tiny_config, write_model_dir, WeightFormat};
use gemi_core::{Family, ModelConfig};
use inference::{DirectoryLoader, LoadError, LoadedModel, ModelLoader};
use tensors::{ContainerWriter, TensorSource};
use tempfile::TempDir;

/// A model directory with int8 weights and the small chat tokenizer.
pub fn model_dir_with(config: &ModelConfig, seed: u64) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_model_dir(dir.path(), config, seed, WeightFormat::Int8).unwrap();
    tokenizer::testing::chat_file()
        .save(dir.path().join("tokenizer.json"))
        .unwrap();
    dir
}

/// No stop tokens, so replies only end on length, context or cancellation.
pub fn open_ended_config() -> ModelConfig {
    let mut config = tiny_config(Family::Gemma);
    config.eos_token_ids = vec![];
    config
}

pub fn open_ended_dir(seed: u64) -> TempDir {
    let dir = model_dir_with(&open_ended_config(), seed);
    let mut file = tokenizer::testing::chat_file();
    file.eos_token = None;
    file.end_of_turn_token = None;
    file.save(dir.path().join("tokenizer.json")).unwrap();
    dir
}

/// Untied embeddings whose row for `token` is NaN: any prompt containing
/// that token fails during prefill, while sampling it stays possible.
pub fn poisoned_embedding_dir(token: u32, seed: u64) -> TempDir {
    let mut config = open_ended_config();
    config.tie_word_embeddings = false;
    let source = random_container(&config, seed, WeightFormat::F32).unwrap();

    let mut writer = ContainerWriter::new();
    for name in source.tensor_names() {
        let desc = source.descriptor(name).unwrap();
        if name == "model.embed_tokens.weight" {
            let mut values = source.read_f32(name).unwrap();
            let hidden = desc.shape[1];
            let row = token as usize * hidden;
            values[row..row + hidden].fill(f32::NAN);
            writer.add_f32(name, &desc.shape, &values).unwrap();
        } else {
            writer
                .add_raw(name, desc.dtype, &desc.shape, source.tensor_bytes(name).unwrap())
                .unwrap();
        }
    }

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.json"), config.to_json()).unwrap();
    writer.write_to(dir.path().join("model.safetensors")).unwrap();
    let mut file = tokenizer::testing::chat_file();
    file.eos_token = None;
    file.end_of_turn_token = None;
    file.save(dir.path().join("tokenizer.json")).unwrap();
    dir
}

/// Counts calls and can hold each load until released.
pub struct CountingLoader {
    inner: DirectoryLoader,
    pub calls: Arc<AtomicUsize>,
    gate: Option<Mutex<mpsc::Receiver<()>>>,
}

impl CountingLoader {
    pub fn new(dir: &Path) -> Self {
        Self {
            inner: DirectoryLoader::new(dir).with_warmup(false),
            calls: Arc::new(AtomicUsize::new(0)),
            gate: None,
        }
    }

    /// Loads block until a message arrives on the returned sender.
    pub fn gated(dir: &Path) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let mut loader = Self::new(dir);
        loader.gate = Some(Mutex::new(rx));
        (loader, tx)
    }
}

impl ModelLoader for CountingLoader {
    fn load(&self, progress: &dyn Fn(f32)) -> Result<LoadedModel, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.lock().unwrap().recv().unwrap();
        }
        self.inner.load(progress)
    }
}
