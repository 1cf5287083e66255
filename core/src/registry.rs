use crate::error::PersistenceError;
use crate::resumable::Resumable;
use flowline_frame::Signature;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves frame signatures back to functions when a process is revived.
///
/// Keyed by qualified name; the trampoline checks the full signature on
/// re-entry, so a function whose result kind changed fails there.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Arc<dyn Resumable>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function`, returning any function it replaces.
    pub fn register(&self, function: Arc<dyn Resumable>) -> Option<Arc<dyn Resumable>> {
        let name = function.signature().qualified_name();
        self.functions.write().insert(name, function)
    }

    pub fn lookup(&self, signature: &Signature) -> Result<Arc<dyn Resumable>, PersistenceError> {
        self.functions
            .read()
            .get(&signature.qualified_name())
            .cloned()
            .ok_or_else(|| PersistenceError::UnknownFunction(signature.clone()))
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }
}
