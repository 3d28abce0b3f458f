//! Model components of the decoder
//!
//! The adapter is the only new network. The DiT is rebuilt in `flux_dit`
//! so it can be trained; the frozen encoders wrap candle-transformers.

pub mod backbone;
pub mod conditioning;
pub mod embed_adapter;
pub mod encoders;
pub mod flux_backbone;
pub mod flux_dit;
pub mod flux_vae;
pub mod norms;
pub mod pipeline;
pub mod text_encoders;

// Re-export key types
pub use backbone::DenoisingBackbone;
pub use conditioning::{ConditioningBundle, ExtraInputs, PromptEmbeds, StepContext};
pub use embed_adapter::{EmbedAdapter, EmbedAdapterConfig};
pub use encoders::{LatentEncoder, PromptEncoder};
pub use flux_backbone::FluxBackbone;
pub use flux_dit::FluxDit;
pub use flux_vae::{load_flux_vae, FluxVae};
pub use pipeline::DecoderPipeline;
pub use text_encoders::{load_clip_prompt_encoder, ClipPromptEncoder};
