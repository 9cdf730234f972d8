//! Headless page rendering seam.
//!
//! The crate ships no browser. Deployments that have one (a WebDriver
//! endpoint, a rendering service) implement [`PageRenderer`] and hand it to
//! the manager builder; the `browser_auto` strategy reports itself as
//! unsupported otherwise.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

/// DOM snapshot after scripts, timers and client-side navigation settled.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// URL the browser ended on.
    pub final_url: Url,
    /// Serialised DOM.
    pub html: String,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer timed out after {0:?}")]
    Timeout(Duration),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("renderer unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn render(&self, url: &Url, timeout: Duration) -> Result<RenderedPage, RenderError>;
}
