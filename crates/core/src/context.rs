//! Async-scoped audit context propagation.
//!
//! A context binds for the synchronous and asynchronous extent of a
//! [`with_context`] scope via task-local storage: suspension points inside
//! the scope observe the binding on resumption, and nested scopes shadow.
//! Tasks spawned with `tokio::spawn` do not inherit task-locals; the
//! interceptor therefore snapshots the current context before handing
//! records to the writer, and user code that spawns inside a scope re-wraps
//! the spawned future with [`with_context`]. There is no process-global
//! mutable state.

use std::cell::RefCell;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::record::Row;

/// Metadata keys that can act as prototype-pollution vectors in downstream
/// JSON consumers; they are never persisted.
const FORBIDDEN_METADATA_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Ambient request context attached to audit records at persist time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditContext {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Row>,
}

impl AuditContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    #[must_use]
    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Row) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Right-biased merge: fields set on `other` override, unset fields are
    /// left alone, and metadata maps are merged key-by-key.
    pub fn merge_from(&mut self, other: &AuditContext) {
        if other.user_id.is_some() {
            self.user_id = other.user_id.clone();
        }
        if other.ip_address.is_some() {
            self.ip_address = other.ip_address.clone();
        }
        if other.user_agent.is_some() {
            self.user_agent = other.user_agent.clone();
        }
        if other.transaction_id.is_some() {
            self.transaction_id = other.transaction_id.clone();
        }
        if other.metadata.is_some() {
            self.metadata = merge_metadata([self.metadata.as_ref(), other.metadata.as_ref()]);
        }
    }
}

/// Merge metadata maps right-biased: later sources override earlier ones
/// key by key (absent keys overwrite nothing), and forbidden keys are
/// dropped. An explicit `null` value is still a present key and survives
/// the merge. Returns `None` only when the result is empty after
/// forbidden-key removal, so empty metadata persists as SQL NULL rather
/// than `{}`.
pub fn merge_metadata<'a, I>(sources: I) -> Option<Row>
where
    I: IntoIterator<Item = Option<&'a Row>>,
{
    let mut merged = Row::new();
    for source in sources.into_iter().flatten() {
        for (key, value) in source {
            if FORBIDDEN_METADATA_KEYS.contains(&key.as_str()) {
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }
    }
    (!merged.is_empty()).then_some(merged)
}

tokio::task_local! {
    static CURRENT_CONTEXT: RefCell<Option<AuditContext>>;
}

/// Bind `context` for the extent of `f`, shadowing any outer binding.
pub async fn with_context<F>(context: AuditContext, f: F) -> F::Output
where
    F: Future,
{
    CURRENT_CONTEXT.scope(RefCell::new(Some(context)), f).await
}

/// A snapshot of the effective context, or `None` outside any scope.
pub fn current_context() -> Option<AuditContext> {
    CURRENT_CONTEXT
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
}

/// Merge `partial` into the current binding (last writer wins). Returns
/// `false` when called outside a [`with_context`] scope, in which case
/// nothing is stored.
pub fn merge_context(partial: &AuditContext) -> bool {
    CURRENT_CONTEXT
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_mut() {
                Some(current) => current.merge_from(partial),
                None => *slot = Some(partial.clone()),
            }
        })
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn context_survives_suspension_points() {
        let ctx = AuditContext::new().with_user_id("u-1");
        with_context(ctx, async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            let current = current_context().expect("context bound");
            assert_eq!(current.user_id.as_deref(), Some("u-1"));
        })
        .await;
    }

    #[tokio::test]
    async fn nested_scopes_shadow_and_restore() {
        with_context(AuditContext::new().with_user_id("outer"), async {
            with_context(AuditContext::new().with_user_id("inner"), async {
                assert_eq!(
                    current_context().unwrap().user_id.as_deref(),
                    Some("inner")
                );
            })
            .await;
            assert_eq!(current_context().unwrap().user_id.as_deref(), Some("outer"));
        })
        .await;
    }

    #[tokio::test]
    async fn merge_context_updates_current_binding() {
        with_context(AuditContext::new().with_user_id("u-1"), async {
            let merged = merge_context(&AuditContext::new().with_ip_address("10.0.0.1"));
            assert!(merged);
            let current = current_context().unwrap();
            assert_eq!(current.user_id.as_deref(), Some("u-1"));
            assert_eq!(current.ip_address.as_deref(), Some("10.0.0.1"));
        })
        .await;
    }

    #[tokio::test]
    async fn no_context_outside_scope() {
        assert!(current_context().is_none());
        assert!(!merge_context(&AuditContext::new().with_user_id("u")));
    }

    #[test]
    fn merge_is_right_biased() {
        let a = meta(&[("env", json!("dev")), ("region", json!("eu"))]);
        let b = meta(&[("env", json!("prod"))]);
        let merged = merge_metadata([Some(&a), Some(&b)]).unwrap();
        assert_eq!(merged["env"], json!("prod"));
        assert_eq!(merged["region"], json!("eu"));
    }

    #[test]
    fn merge_is_associative() {
        let a = meta(&[("x", json!(1))]);
        let b = meta(&[("x", json!(2)), ("y", json!(2))]);
        let c = meta(&[("y", json!(3))]);

        let left = merge_metadata([merge_metadata([Some(&a), Some(&b)]).as_ref(), Some(&c)]);
        let right = merge_metadata([Some(&a), merge_metadata([Some(&b), Some(&c)]).as_ref()]);
        assert_eq!(left, right);
    }

    #[test]
    fn merge_drops_forbidden_keys() {
        let a = meta(&[
            ("__proto__", json!({"polluted": true})),
            ("constructor", json!("x")),
            ("prototype", json!("y")),
            ("kept", json!("ok")),
        ]);
        let merged = merge_metadata([Some(&a)]).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["kept"], json!("ok"));
    }

    #[test]
    fn merge_of_effectively_empty_inputs_is_none() {
        let only_forbidden = meta(&[("__proto__", json!(1))]);
        assert!(merge_metadata([None, Some(&Row::new()), Some(&only_forbidden)]).is_none());
        assert!(merge_metadata([]).is_none());
    }

    #[test]
    fn explicit_null_values_survive_the_merge() {
        let a = meta(&[("note", json!("old"))]);
        let b = meta(&[("note", json!(null))]);
        let merged = merge_metadata([Some(&a), Some(&b)]).unwrap();
        assert_eq!(merged["note"], json!(null));

        let only_null = meta(&[("note", json!(null))]);
        let merged = merge_metadata([Some(&only_null)]).unwrap();
        assert_eq!(merged.len(), 1);
    }
}
