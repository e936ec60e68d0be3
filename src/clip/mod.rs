//! CLIP (Contrastive Language-Image Pre-training) embeddings module
//!
//! Images and text prompts are embedded into the same space, so an image
//! can be compared both to reference images and to category descriptions.

mod model;
mod tokenizer;

use std::path::Path;

use crate::error::FilerError;

pub use model::ClipModel;
pub use tokenizer::{ClipTokenizer, CONTEXT_LENGTH};

/// L2-normalized embedding vector (512 dimensions for ViT-B/32).
pub type Embedding = Vec<f32>;

/// Anything that can place images and text in a shared embedding space.
///
/// Implementations are shared read-only across worker threads for the whole
/// batch. Tests substitute a lightweight fake.
pub trait EmbeddingProvider: Send + Sync {
    /// Identifier stored next to cached vectors; changes whenever the
    /// weights change.
    fn model_id(&self) -> &str;

    fn embed_image(&self, path: &Path) -> Result<Embedding, FilerError>;

    fn embed_text(&self, text: &str) -> Result<Embedding, FilerError>;
}

/// Scale a vector to unit length. Zero vectors are returned unchanged.
pub fn l2_normalize(mut v: Embedding) -> Embedding {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// Normalized mean of several embeddings, `None` for an empty input or
/// mismatched dimensions.
pub fn mean_embedding(vectors: &[Embedding]) -> Option<Embedding> {
    let dim = vectors.first()?.len();
    if dim == 0 || vectors.iter().any(|v| v.len() != dim) {
        return None;
    }

    let mut sum = vec![0.0f32; dim];
    for v in vectors {
        for (acc, x) in sum.iter_mut().zip(v) {
            *acc += x;
        }
    }
    let n = vectors.len() as f32;
    sum.iter_mut().for_each(|x| *x /= n);
    Some(l2_normalize(sum))
}

/// Calculate cosine similarity between two embeddings
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}

/// Cosine distance in [0, 2].
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}
