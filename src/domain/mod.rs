pub mod issue;
pub mod status;
pub mod timestamp;

pub use issue::{Dependency, DependencyType, Issue, ParseDependencyTypeError};
pub use status::{InvalidStatusTransition, ParseStatusError, Status};
