//! The declarative specification model: commands, dependencies, scripts,
//! and targets.

mod command;
mod dependency;
mod script;
mod target;

pub use command::Command;
pub use dependency::{
    CommandDependency, Dependency, GlobalDependency, GlobalReference, SourceDependency,
    TargetDependency, VariableDependency,
};
pub use script::Script;
pub use target::{Target, TargetExecutionMode, TargetOperations, TargetOutputs};
