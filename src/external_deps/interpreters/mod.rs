//! JavaScript interpreter infrastructure.
//!
//! Provides a shared trait and error type used by the script-driven
//! strategies, along with the Boa-backed runtime.

mod boa;

pub use boa::BoaJavascriptInterpreter;

use thiserror::Error;
use url::Url;

/// Abstraction over sandboxed JavaScript runtimes.
///
/// Implementations are synchronous; callers run them on the blocking pool.
pub trait JavascriptInterpreter: Send + Sync {
    /// Run page scripts in order inside a browser-like stub environment and
    /// report the first navigation they attempt (`location.href = ..`,
    /// `location.replace(..)`, `window.open(..)`, timers included).
    fn capture_redirect(&self, scripts: &[String], page_url: &Url)
    -> InterpreterResult<Option<String>>;

    /// Evaluate a single expression and return its string value.
    fn evaluate(&self, expression: &str, page_url: &Url) -> InterpreterResult<String>;
}

/// Failures produced by JavaScript runtimes.
#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("javascript execution failed: {0}")]
    Execution(String),
    #[error("javascript engine error: {0}")]
    Engine(String),
}

/// Convenience alias for runtime results.
pub type InterpreterResult<T> = Result<T, InterpreterError>;
