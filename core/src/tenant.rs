//! Tenant registry and current-tenant propagation.
//!
//! The registry lives on the engine instance. The *current* tenant is
//! ambient: a thread-scoped stack for synchronous code ([`TenantContext::switch`])
//! and a task-local stack for async code ([`TenantContext::scope`]). Both
//! nest, restore the previous tenant on exit even under error propagation,
//! and concurrently running tasks each see only the scope they entered.

use crate::{Error, ErrorKind, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

thread_local! {
    static SYNC_STACK: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

tokio::task_local! {
    static ASYNC_STACK: RefCell<Vec<String>>;
}

#[derive(Debug, Default)]
struct TenantState {
    records: RwLock<HashMap<String, TenantRecord>>,
    /// How many live scopes hold each tenant as their active context.
    in_use: Mutex<HashMap<String, usize>>,
}

/// The engine's tenant registry.
#[derive(Clone, Default)]
pub struct TenantContext {
    state: Arc<TenantState>,
}

impl TenantContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<TenantRecord> {
        let tenant_id = tenant_id.into();
        dataflow_sql::validate::check_identifier(&tenant_id)
            .map_err(|e| Error::validation(e.to_string()))?;

        let record = TenantRecord {
            tenant_id: tenant_id.clone(),
            name: name.into(),
            active: true,
            created_at: Utc::now(),
            metadata: metadata.unwrap_or_default(),
        };

        self.state
            .records
            .write()
            .insert(tenant_id, record.clone());
        Ok(record)
    }

    pub fn unregister(&self, tenant_id: &str) -> Result<()> {
        if self.state.in_use.lock().get(tenant_id).copied().unwrap_or(0) > 0 {
            return Err(ErrorKind::TenantInUse(tenant_id.to_owned()).into());
        }

        self.state.records.write().remove(tenant_id);
        Ok(())
    }

    /// Deactivation is reversible; the record stays registered.
    pub fn deactivate(&self, tenant_id: &str) -> Result<()> {
        self.set_active(tenant_id, false)
    }

    pub fn activate(&self, tenant_id: &str) -> Result<()> {
        self.set_active(tenant_id, true)
    }

    fn set_active(&self, tenant_id: &str, active: bool) -> Result<()> {
        match self.state.records.write().get_mut(tenant_id) {
            Some(record) => {
                record.active = active;
                Ok(())
            }
            None => Err(ErrorKind::TenantUnavailable(tenant_id.to_owned()).into()),
        }
    }

    pub fn get(&self, tenant_id: &str) -> Option<TenantRecord> {
        self.state.records.read().get(tenant_id).cloned()
    }

    pub fn list(&self) -> Vec<TenantRecord> {
        let mut records: Vec<TenantRecord> = self.state.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        records
    }

    fn check_available(&self, tenant_id: &str) -> Result<()> {
        match self.state.records.read().get(tenant_id) {
            Some(record) if record.active => Ok(()),
            _ => Err(ErrorKind::TenantUnavailable(tenant_id.to_owned()).into()),
        }
    }

    fn retain(&self, tenant_id: &str) {
        *self.state.in_use.lock().entry(tenant_id.to_owned()).or_insert(0) += 1;
    }

    /// The tenant of the innermost enclosing scope, if any. The async stack
    /// shadows the thread stack.
    pub fn current() -> Option<String> {
        ASYNC_STACK
            .try_with(|stack| stack.borrow().last().cloned())
            .ok()
            .flatten()
            .or_else(|| SYNC_STACK.with(|stack| stack.borrow().last().cloned()))
    }

    /// Like [`Self::current`], failing when no tenant is active.
    pub fn require() -> Result<String> {
        Self::current().ok_or_else(|| ErrorKind::TenantRequired.into())
    }

    /// Enters a tenant scope on the current thread (or, inside an async
    /// scope, on the current task's stack). The previous tenant is restored
    /// when the guard drops.
    pub fn switch(&self, tenant_id: &str) -> Result<TenantGuard> {
        self.check_available(tenant_id)?;
        self.retain(tenant_id);

        let pushed_async = ASYNC_STACK
            .try_with(|stack| stack.borrow_mut().push(tenant_id.to_owned()))
            .is_ok();

        if !pushed_async {
            SYNC_STACK.with(|stack| stack.borrow_mut().push(tenant_id.to_owned()));
        }

        Ok(TenantGuard {
            state: Arc::clone(&self.state),
            tenant_id: tenant_id.to_owned(),
            on_async_stack: pushed_async,
        })
    }

    /// Runs a future inside a tenant scope. Scopes nest: the future sees the
    /// new tenant on top of whatever stack it was entered from, and sibling
    /// tasks are unaffected.
    pub async fn scope<F, T>(&self, tenant_id: &str, future: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        self.check_available(tenant_id)?;
        self.retain(tenant_id);

        let mut stack = ASYNC_STACK
            .try_with(|stack| stack.borrow().clone())
            .unwrap_or_else(|_| SYNC_STACK.with(|stack| stack.borrow().clone()));
        stack.push(tenant_id.to_owned());

        let release = ReleaseOnDrop {
            state: Arc::clone(&self.state),
            tenant_id: tenant_id.to_owned(),
        };

        let result = ASYNC_STACK.scope(RefCell::new(stack), future).await;
        drop(release);

        Ok(result)
    }

    pub fn tenant_count(&self) -> usize {
        self.state.records.read().len()
    }
}

/// Restores the previous tenant on drop.
#[derive(Debug)]
pub struct TenantGuard {
    state: Arc<TenantState>,
    tenant_id: String,
    on_async_stack: bool,
}

impl Drop for TenantGuard {
    fn drop(&mut self) {
        if self.on_async_stack {
            let _ = ASYNC_STACK.try_with(|stack| {
                let mut stack = stack.borrow_mut();
                if stack.last() == Some(&self.tenant_id) {
                    stack.pop();
                }
            });
        } else {
            SYNC_STACK.with(|stack| {
                let mut stack = stack.borrow_mut();
                if stack.last() == Some(&self.tenant_id) {
                    stack.pop();
                }
            });
        }

        release_count(&self.state, &self.tenant_id);
    }
}

struct ReleaseOnDrop {
    state: Arc<TenantState>,
    tenant_id: String,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        release_count(&self.state, &self.tenant_id);
    }
}

fn release_count(state: &TenantState, tenant_id: &str) {
    let mut in_use = state.in_use.lock();
    if let Some(count) = in_use.get_mut(tenant_id) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            in_use.remove(tenant_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with(ids: &[&str]) -> TenantContext {
        let ctx = TenantContext::new();
        for id in ids {
            ctx.register(*id, format!("{id} inc"), None).unwrap();
        }
        ctx
    }

    #[test]
    fn switch_nests_and_restores() {
        let ctx = context_with(&["acme", "globex"]);
        assert_eq!(TenantContext::current(), None);

        {
            let _outer = ctx.switch("globex").unwrap();
            assert_eq!(TenantContext::current().as_deref(), Some("globex"));

            {
                let _inner = ctx.switch("acme").unwrap();
                assert_eq!(TenantContext::current().as_deref(), Some("acme"));
            }

            assert_eq!(TenantContext::current().as_deref(), Some("globex"));
        }

        assert_eq!(TenantContext::current(), None);
    }

    #[test]
    fn switch_restores_under_panic() {
        let ctx = context_with(&["acme"]);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = ctx.switch("acme").unwrap();
            panic!("boom");
        }));

        assert!(result.is_err());
        assert_eq!(TenantContext::current(), None);
        // And the tenant is free again.
        ctx.unregister("acme").unwrap();
    }

    #[test]
    fn unavailable_tenants_are_rejected() {
        let ctx = context_with(&["acme"]);

        assert!(matches!(
            ctx.switch("nope").unwrap_err().kind(),
            ErrorKind::TenantUnavailable(_)
        ));

        ctx.deactivate("acme").unwrap();
        assert!(matches!(
            ctx.switch("acme").unwrap_err().kind(),
            ErrorKind::TenantUnavailable(_)
        ));

        ctx.activate("acme").unwrap();
        ctx.switch("acme").unwrap();
    }

    #[test]
    fn unregistering_an_active_tenant_fails() {
        let ctx = context_with(&["acme"]);
        let guard = ctx.switch("acme").unwrap();

        assert!(matches!(
            ctx.unregister("acme").unwrap_err().kind(),
            ErrorKind::TenantInUse(_)
        ));

        drop(guard);
        ctx.unregister("acme").unwrap();
    }

    #[test]
    fn require_fails_outside_any_scope() {
        assert!(matches!(
            TenantContext::require().unwrap_err().kind(),
            ErrorKind::TenantRequired
        ));
    }

    #[tokio::test]
    async fn async_scopes_nest() {
        let ctx = context_with(&["acme", "globex"]);

        ctx.scope("globex", async {
            assert_eq!(TenantContext::current().as_deref(), Some("globex"));

            ctx.scope("acme", async {
                assert_eq!(TenantContext::current().as_deref(), Some("acme"));
            })
            .await
            .unwrap();

            assert_eq!(TenantContext::current().as_deref(), Some("globex"));
        })
        .await
        .unwrap();

        assert_eq!(TenantContext::current(), None);
    }

    #[tokio::test]
    async fn concurrent_tasks_see_their_own_tenant() {
        let ctx = context_with(&["acme", "globex"]);

        let a = ctx.scope("acme", async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            TenantContext::current()
        });
        let b = ctx.scope("globex", async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            TenantContext::current()
        });

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap().as_deref(), Some("acme"));
        assert_eq!(b.unwrap().as_deref(), Some("globex"));
    }

    #[test]
    fn register_validates_identifier() {
        let ctx = TenantContext::new();
        assert!(ctx.register("bad tenant!", "x", None).is_err());
    }
}
