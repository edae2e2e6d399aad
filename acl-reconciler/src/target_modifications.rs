use std::ops::{Deref, DerefMut};

use kube::api::DynamicObject;
use serde_json::{Map, Value};

use crate::errors::ControllerError;

/// Helper construct to compute the merge patch for edits on a target object.
pub(crate) struct TargetModifications {
    original: DynamicObject,
    pub modified: DynamicObject,
}

impl Deref for TargetModifications {
    type Target = DynamicObject;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl DerefMut for TargetModifications {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

impl TargetModifications {
    pub(crate) fn new(original: DynamicObject) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    /// JSON merge patch turning the original into the modified object, `None` if nothing changed.
    pub(crate) fn merge_patch(&self) -> Result<Option<Value>, ControllerError> {
        let original = serde_json::to_value(&self.original)?;
        let modified = serde_json::to_value(&self.modified)?;
        let patch = create_merge_patch(&original, &modified);
        match &patch {
            Value::Object(map) if map.is_empty() => Ok(None),
            _ => Ok(Some(patch)),
        }
    }
}

/// RFC 7386 merge patch between two documents.
pub(crate) fn create_merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(original), Value::Object(modified)) => {
            let mut patch = Map::new();
            for key in original.keys() {
                if !modified.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, value) in modified {
                match original.get(key) {
                    Some(old) if old == value => (),
                    Some(old) if old.is_object() && value.is_object() => {
                        patch.insert(key.clone(), create_merge_patch(old, value));
                    }
                    _ => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => modified.clone(),
    }
}
