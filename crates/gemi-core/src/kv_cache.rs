/// Keys and values of one layer, laid out `[position][kv_head][head_dim]`.
#[derive(Debug, Clone, Default)]
struct LayerCache {
    keys: Vec<f32>,
    values: Vec<f32>,
}

/// Per-session cache of attention keys and values.
///
/// A decode step appends one entry to every layer and then commits; `len`
/// counts committed positions. A compute error invalidates the cache and it
/// must be cleared before reuse.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<LayerCache>,
    kv_dim: usize,
    len: usize,
    capacity: usize,
    valid: bool,
}

impl KvCache {
    pub fn new(num_layers: usize, kv_dim: usize, capacity: usize) -> Self {
        Self {
            layers: vec![LayerCache::default(); num_layers],
            kv_dim,
            len: 0,
            capacity,
            valid: true,
        }
    }

    /// Committed positions.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.len)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Drop every entry and make the cache usable again.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.keys.clear();
            layer.values.clear();
        }
        self.len = 0;
        self.valid = true;
    }

    pub fn append(&mut self, layer: usize, key: &[f32], value: &[f32]) {
        debug_assert_eq!(key.len(), self.kv_dim);
        debug_assert_eq!(value.len(), self.kv_dim);
        let cache = &mut self.layers[layer];
        cache.keys.extend_from_slice(key);
        cache.values.extend_from_slice(value);
    }

    /// Mark the position appended to every layer as complete.
    pub fn commit(&mut self) {
        self.len += 1;
        debug_assert!(self.layers.iter().all(|l| l.keys.len() == self.len * self.kv_dim));
    }

    pub fn keys(&self, layer: usize) -> &[f32] {
        &self.layers[layer].keys
    }

    pub fn values(&self, layer: usize) -> &[f32] {
        &self.layers[layer].values
    }

    /// Entries stored for `layer`, including an uncommitted one.
    pub fn entries(&self, layer: usize) -> usize {
        self.layers[layer].keys.len() / self.kv_dim.max(1)
    }
}
