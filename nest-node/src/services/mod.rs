//! Built-in service modules shipped with the node.

pub mod echod;
pub mod logger;

use nest_runtime::ModuleRegistry;

/// Register every built-in module.
pub fn register_all(modules: &ModuleRegistry) {
    modules.register("logger", || Box::new(logger::Logger::new()));
    modules.register("echod", || Box::new(echod::Echod::new()));
}
