//! Renderer used when no art backend is configured.

use crate::error::RenderError;
use crate::ports::{DrawingCommands, RasterImage, Rasterizer, SigilRenderer};
use async_trait::async_trait;

/// Refuses every request, so moments stay text-only.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledRenderer;

#[async_trait]
impl SigilRenderer for DisabledRenderer {
    async fn generate(&self, _phrase: &str) -> Result<DrawingCommands, RenderError> {
        Err(RenderError::Unavailable("sigil rendering is disabled".into()))
    }
}

#[async_trait]
impl Rasterizer for DisabledRenderer {
    async fn render(&self, _commands: &DrawingCommands) -> Result<RasterImage, RenderError> {
        Err(RenderError::Unavailable("rasterization is disabled".into()))
    }
}
