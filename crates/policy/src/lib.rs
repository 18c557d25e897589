pub mod engine;
pub mod predicates;
pub mod registry;
pub mod schema;

pub use engine::{ClaimEvaluationEngine, PrecheckError};
pub use predicates::{UsageCounter, UsageError, UsageOutcome};
pub use registry::{
    BuiltinClaim, ClaimPredicate, PolicyContext, PredicateError, PredicateRegistry, RegistryError,
};
pub use schema::{ClaimEntry, ClaimSpec, SchemaViolation, ValidationOutcome};
