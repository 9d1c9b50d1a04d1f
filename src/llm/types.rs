use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::stream::TokenStream;

/// The closed set of inference backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeKind {
    /// Quantized GGUF model served by llama.cpp.
    #[serde(rename = "gguf", alias = "native", alias = "llama_cpp")]
    Native,
    /// Optimized ONNX graph.
    #[serde(rename = "onnx", alias = "graph")]
    Graph,
    /// Plain safetensors weights run through candle.
    #[serde(rename = "transformers", alias = "tensor", alias = "candle")]
    Tensor,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Native => "gguf",
            RuntimeKind::Graph => "onnx",
            RuntimeKind::Tensor => "transformers",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gguf" | "native" | "llama_cpp" => Ok(RuntimeKind::Native),
            "onnx" | "graph" => Ok(RuntimeKind::Graph),
            "transformers" | "tensor" | "candle" => Ok(RuntimeKind::Tensor),
            other => Err(format!("unknown runtime: {}", other)),
        }
    }
}

/// Reduced-precision mode for the tensor backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuantizationMode {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "f16")]
    Half,
    #[serde(rename = "bf16")]
    BFloat16,
    #[serde(rename = "8bit")]
    Int8,
    #[serde(rename = "4bit")]
    Int4,
}

impl FromStr for QuantizationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(QuantizationMode::None),
            "f16" | "fp16" | "half" => Ok(QuantizationMode::Half),
            "bf16" => Ok(QuantizationMode::BFloat16),
            "8bit" | "int8" => Ok(QuantizationMode::Int8),
            "4bit" | "int4" => Ok(QuantizationMode::Int4),
            other => Err(format!("unknown quantization mode: {}", other)),
        }
    }
}

/// Device choice as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    Auto,
    Cpu,
    Cuda(usize),
    Metal,
}

impl DevicePreference {
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase();
        match normalized.as_str() {
            "auto" | "gpu" => Some(DevicePreference::Auto),
            "cpu" => Some(DevicePreference::Cpu),
            "cuda" => Some(DevicePreference::Cuda(0)),
            "metal" | "mps" => Some(DevicePreference::Metal),
            _ => normalized
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse().ok())
                .map(DevicePreference::Cuda),
        }
    }
}

/// Concrete compute device picked for the tensor backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda(usize),
    Metal,
}

impl DeviceKind {
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, DeviceKind::Cpu)
    }
}

/// Explicit override wins; otherwise a discrete accelerator, then an
/// integrated one, then the CPU.
pub fn resolve_device_kind(
    preference: Option<DevicePreference>,
    cuda_available: bool,
    metal_available: bool,
) -> DeviceKind {
    match preference {
        Some(DevicePreference::Cpu) => DeviceKind::Cpu,
        Some(DevicePreference::Cuda(ordinal)) => DeviceKind::Cuda(ordinal),
        Some(DevicePreference::Metal) => DeviceKind::Metal,
        Some(DevicePreference::Auto) | None => {
            if cuda_available {
                DeviceKind::Cuda(0)
            } else if metal_available {
                DeviceKind::Metal
            } else {
                DeviceKind::Cpu
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub stream: bool,
    pub use_cache: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 256,
            temperature: 0.7,
            stream: false,
            use_cache: true,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }
}

/// Sampling knobs handed to a backend after the prompt has been formatted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
}

impl SamplingParams {
    pub const TOP_P: f32 = 0.95;
    pub const REPEAT_PENALTY: f32 = 1.1;

    pub fn from_request(request: &GenerationRequest) -> Self {
        Self {
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: Self::TOP_P,
            repeat_penalty: Self::REPEAT_PENALTY,
        }
    }
}

/// Result of a generation call: either the full text or a pull-based stream
/// of fragments.
pub enum Generation {
    Text(String),
    Stream(TokenStream),
}

impl Generation {
    pub fn is_stream(&self) -> bool {
        matches!(self, Generation::Stream(_))
    }

    pub async fn into_text(self) -> String {
        match self {
            Generation::Text(text) => text,
            Generation::Stream(stream) => stream.collect_text().await,
        }
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Generation::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}
