//! Built-in work units
//!
//! Small units for composing and testing pipelines, plus `HttpPluginUnit`,
//! which turns a plugin server route into a chain stage.

pub mod http;
pub mod math;
pub mod text;
pub mod util;

pub use http::{HttpPluginConfig, HttpPluginUnit};
pub use math::{AddUnit, DoubleUnit};
pub use text::{ReadTextUnit, SaveTextUnit};
pub use util::{BlockUnit, DelayUnit, FailUnit};

use pipeline_core::Registry;
use std::sync::Arc;

/// Register every built-in unit
pub fn register_builtin(registry: &mut Registry) {
    registry.register(Arc::new(DoubleUnit::new()));
    registry.register(Arc::new(AddUnit::new()));
    registry.register(Arc::new(SaveTextUnit::new()));
    registry.register(Arc::new(ReadTextUnit::new()));
    registry.register(Arc::new(DelayUnit::new()));
    registry.register(Arc::new(BlockUnit::new()));
    registry.register(Arc::new(FailUnit::new()));
}

/// A registry holding only the built-in units
pub fn builtin_registry() -> Registry {
    let mut registry = Registry::new();
    register_builtin(&mut registry);
    registry
}
