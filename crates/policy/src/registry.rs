use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::predicates::{MaxUses, NotAfter, NotBefore, UsageCounter};
use crate::schema::is_claim_type_name;

/// What a predicate sees when it is asked about one declared claim.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub policy_id: String,
    pub claim_type: String,
    pub group: Option<String>,
    pub params: Map<String, Value>,
}

impl PolicyContext {
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredicateError {
    InvalidParams(String),
    Unavailable(String),
    Failed(String),
}

impl std::fmt::Display for PredicateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PredicateError::InvalidParams(msg) => write!(f, "invalid parameters: {}", msg),
            PredicateError::Unavailable(msg) => write!(f, "dependency unavailable: {}", msg),
            PredicateError::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for PredicateError {}

#[async_trait]
pub trait ClaimPredicate: Send + Sync {
    async fn check(&self, ctx: &PolicyContext) -> Result<bool, PredicateError>;

    /// True when a check mutates persistent state, e.g. consuming a use.
    fn has_side_effects(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    InvalidName(String),
    Duplicate(String),
    NotFound(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::InvalidName(name) => write!(f, "invalid claim-type name: {}", name),
            RegistryError::Duplicate(name) => write!(f, "claim type already registered: {}", name),
            RegistryError::NotFound(name) => write!(f, "claim type not registered: {}", name),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinClaim {
    MaxUses,
    NotBefore,
    NotAfter,
}

impl BuiltinClaim {
    pub const ALL: [BuiltinClaim; 3] = [
        BuiltinClaim::MaxUses,
        BuiltinClaim::NotBefore,
        BuiltinClaim::NotAfter,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            BuiltinClaim::MaxUses => "max_uses",
            BuiltinClaim::NotBefore => "not_before",
            BuiltinClaim::NotAfter => "not_after",
        }
    }

    fn predicate(self, usage: &Arc<dyn UsageCounter>) -> Arc<dyn ClaimPredicate> {
        match self {
            BuiltinClaim::MaxUses => Arc::new(MaxUses::new(usage.clone())),
            BuiltinClaim::NotBefore => Arc::new(NotBefore::default()),
            BuiltinClaim::NotAfter => Arc::new(NotAfter::default()),
        }
    }
}

/// Maps claim-type names to predicates. Populated at startup and shared
/// read-only afterwards.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    predicates: HashMap<String, Arc<dyn ClaimPredicate>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins(usage: Arc<dyn UsageCounter>) -> Self {
        let mut registry = Self::new();
        for claim in BuiltinClaim::ALL {
            registry
                .predicates
                .insert(claim.tag().to_string(), claim.predicate(&usage));
        }
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        predicate: Arc<dyn ClaimPredicate>,
    ) -> Result<(), RegistryError> {
        if !is_claim_type_name(name) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        if self.predicates.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.predicates.insert(name.to_string(), predicate);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ClaimPredicate>, RegistryError> {
        self.predicates
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self.predicates.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

impl std::fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateRegistry")
            .field("names", &self.names())
            .finish()
    }
}
