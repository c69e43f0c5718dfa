use async_trait::async_trait;

use crate::errors::ModelError;

/// Produces fixed-dimension embeddings for the vector memory tier.
/// Backends live in `relay-llm`; the store only sees this seam.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dims(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError>;
}
