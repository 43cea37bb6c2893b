use ash::vk;
use xxhash_rust::xxh3::xxh3_64;

/// Builds a [`VertexInput`] from a sequence of bindings and their attributes.
///
/// Attribute locations and offsets are assigned in the order elements are added.
#[derive(Default)]
pub struct VertexInputBuilder {
    bindings: Vec<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
    current_offset: u32,
}

impl VertexInputBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new binding. All following elements belong to this binding until the next call.
    pub fn binding(mut self, input_rate: vk::VertexInputRate) -> Self {
        self.finish_binding();
        self.bindings.push(vk::VertexInputBindingDescription {
            binding: self.bindings.len() as u32,
            stride: 0,
            input_rate,
        });
        self.current_offset = 0;
        self
    }

    pub fn element(mut self, format: vk::Format, byte_size: u32) -> Self {
        if self.bindings.is_empty() {
            self = self.binding(vk::VertexInputRate::VERTEX);
        }

        self.attributes.push(vk::VertexInputAttributeDescription {
            location: self.attributes.len() as u32,
            binding: (self.bindings.len() - 1) as u32,
            format,
            offset: self.current_offset,
        });
        self.current_offset += byte_size;
        self
    }

    /// Adds unused bytes to the current binding.
    pub fn padding(mut self, byte_size: u32) -> Self {
        self.current_offset += byte_size;
        self
    }

    pub fn build(mut self) -> VertexInput {
        self.finish_binding();
        VertexInput::new(self.bindings, self.attributes)
    }

    fn finish_binding(&mut self) {
        if let Some(last) = self.bindings.last_mut() {
            last.stride = self.current_offset;
        }
    }
}

/// Vertex buffer layout of a draw call.
///
/// Pipelines are cached per vertex input. Two inputs with identical descriptions produce the same
/// fingerprint and therefore share pipelines.
#[derive(Clone, Debug)]
pub struct VertexInput {
    bindings: Vec<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
    fingerprint: u64,
}

impl VertexInput {
    pub fn new(bindings: Vec<vk::VertexInputBindingDescription>, attributes: Vec<vk::VertexInputAttributeDescription>) -> Self {
        let fingerprint = Self::compute_fingerprint(&bindings, &attributes);
        Self {
            bindings,
            attributes,
            fingerprint,
        }
    }

    /// Input without any vertex buffers. Used for draws that generate vertices in the shader.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn get_bindings(&self) -> &[vk::VertexInputBindingDescription] {
        &self.bindings
    }

    pub fn get_attributes(&self) -> &[vk::VertexInputAttributeDescription] {
        &self.attributes
    }

    pub fn get_fingerprint(&self) -> u64 {
        self.fingerprint
    }

    fn compute_fingerprint(bindings: &[vk::VertexInputBindingDescription], attributes: &[vk::VertexInputAttributeDescription]) -> u64 {
        let mut bytes = Vec::with_capacity(4 + bindings.len() * 12 + attributes.len() * 16);
        bytes.extend_from_slice(&(bindings.len() as u32).to_le_bytes());
        for binding in bindings {
            bytes.extend_from_slice(&binding.binding.to_le_bytes());
            bytes.extend_from_slice(&binding.stride.to_le_bytes());
            bytes.extend_from_slice(&binding.input_rate.as_raw().to_le_bytes());
        }
        for attribute in attributes {
            bytes.extend_from_slice(&attribute.location.to_le_bytes());
            bytes.extend_from_slice(&attribute.binding.to_le_bytes());
            bytes.extend_from_slice(&attribute.format.as_raw().to_le_bytes());
            bytes.extend_from_slice(&attribute.offset.to_le_bytes());
        }
        xxh3_64(&bytes)
    }
}

impl PartialEq for VertexInput {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for VertexInput {
}
