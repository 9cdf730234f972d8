//! Integrations that rely on external runtimes.
//!
//! This module groups the JavaScript interpreter used by script-driven
//! strategies and the rendering seam for full browsers.

pub mod interpreters;
pub mod renderers;

pub use interpreters::{BoaJavascriptInterpreter, InterpreterError, JavascriptInterpreter};
pub use renderers::{PageRenderer, RenderError, RenderedPage};
