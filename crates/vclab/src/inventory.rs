//! Name-based inventory lookups with strict cardinality.

use crate::backend::Backend;
use crate::error::{DriverError, DriverResult};
use crate::types::{ObjectKind, ObjectRef};

/// Resolve exactly one object of `kind` named `name`.
///
/// Zero matches fail with `NotFound`, more than one with `Ambiguous`.
/// Matching is exact string equality even when the backend pre-filters.
pub async fn find_one(
    backend: &dyn Backend,
    kind: ObjectKind,
    name: &str,
) -> DriverResult<ObjectRef> {
    let mut matches = backend.find_objects(kind, Some(name)).await?;
    matches.retain(|obj| obj.name == name);
    match matches.len() {
        0 => Err(DriverError::not_found(format!("no {kind} named '{name}'"))),
        1 => Ok(matches.remove(0)),
        n => Err(DriverError::ambiguous(format!(
            "{n} {kind} objects named '{name}'"
        ))),
    }
}

/// Every object of `kind`, with no name filter and no cardinality check.
pub async fn find_all(backend: &dyn Backend, kind: ObjectKind) -> DriverResult<Vec<ObjectRef>> {
    backend.find_objects(kind, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverErrorKind;
    use crate::testing::FakeBackend;
    use std::sync::Arc;

    fn backend_with(names: &[&str]) -> Arc<FakeBackend> {
        let backend = Arc::new(FakeBackend::new());
        for (i, name) in names.iter().enumerate() {
            backend.add_object(ObjectRef::new(
                ObjectKind::VirtualMachine,
                format!("vm-{i}"),
                *name,
            ));
        }
        backend
    }

    #[tokio::test]
    async fn test_single_match() {
        let backend = backend_with(&["apple", "orange"]);
        let found = find_one(backend.as_ref(), ObjectKind::VirtualMachine, "apple")
            .await
            .unwrap();
        assert_eq!(found.name, "apple");
        assert_eq!(found.id, "vm-0");
    }

    #[tokio::test]
    async fn test_zero_matches() {
        let backend = backend_with(&["apple"]);
        let err = find_one(backend.as_ref(), ObjectKind::VirtualMachine, "grapes")
            .await
            .unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_name_matching_is_exact() {
        let backend = backend_with(&["apple"]);
        let err = find_one(backend.as_ref(), ObjectKind::VirtualMachine, "Apple")
            .await
            .unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_duplicate_names_are_ambiguous() {
        let backend = backend_with(&["orange", "orange"]);
        let err = find_one(backend.as_ref(), ObjectKind::VirtualMachine, "orange")
            .await
            .unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Ambiguous);
        assert!(err.message.contains("2"));
    }

    #[tokio::test]
    async fn test_find_all_never_fails_on_cardinality() {
        let backend = backend_with(&["orange", "orange", "apple"]);
        let all = find_all(backend.as_ref(), ObjectKind::VirtualMachine)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        let none = find_all(backend.as_ref(), ObjectKind::Datastore)
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
