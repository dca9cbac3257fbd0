//! Nested transaction manager.
//!
//! Transactions form a tree: a root transaction and any number of nested
//! children opened against it. A child's notifications and `onCommit` hooks
//! are buffered and handed up to its parent when the child commits; nothing
//! is actually delivered to the outside world until the root itself
//! commits, at which point hooks run in post-order (deepest child first)
//! and every buffered notification is returned to the caller to publish.
//!
//! Rolling back any transaction in the chain rolls back everything above
//! it: a parent cannot commit over a rolled-back child.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

use crate::error::{Error, Result};

/// What a caller requires of the parent slot when opening a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionRequirement {
    /// Must be a root transaction; providing a parent is an error.
    New,
    /// Must be nested inside another transaction.
    Nested,
    /// No constraint either way.
    Any,
}

impl std::str::FromStr for TransactionRequirement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(Self::New),
            "nested" => Ok(Self::Nested),
            "any" => Ok(Self::Any),
            _ => Err(Error::TransactionRequirementUnknown),
        }
    }
}

type Hook = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    id: Uuid,
    parent: Option<Transaction>,
    committed: AtomicBool,
    rolled_back: AtomicBool,
    notifications: Mutex<Vec<Value>>,
    hooks: Mutex<Vec<Hook>>,
    children: Mutex<Vec<Weak<Inner>>>,
}

/// A single transaction node, possibly nested inside a parent.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

impl Transaction {
    /// Opens a new transaction, validating `requirement` against whether
    /// `parent` was supplied.
    pub fn begin(parent: Option<Transaction>, requirement: TransactionRequirement) -> Result<Self> {
        match (requirement, &parent) {
            (TransactionRequirement::New, Some(_)) => {
                return Err(Error::ParentTransactionMayNotBeProvided)
            }
            (TransactionRequirement::Nested, None) => {
                return Err(Error::ParentTransactionNotProvided)
            }
            _ => {}
        }

        let inner = Arc::new(Inner {
            id: Uuid::new_v4(),
            parent: parent.clone(),
            committed: AtomicBool::new(false),
            rolled_back: AtomicBool::new(false),
            notifications: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
        });

        if let Some(parent) = &parent {
            parent.inner.children.lock().unwrap().push(Arc::downgrade(&inner));
        }

        Ok(Self { inner })
    }

    /// Whether any child opened against this transaction is still neither
    /// committed nor rolled back.
    fn has_running_child(&self) -> bool {
        self.inner.children.lock().unwrap().iter().any(|child| {
            child.upgrade().is_some_and(|child| {
                !child.committed.load(Ordering::SeqCst) && !child.rolled_back.load(Ordering::SeqCst)
            })
        })
    }

    /// This transaction's id.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Whether this transaction has a parent.
    pub fn is_nested(&self) -> bool {
        self.inner.parent.is_some()
    }

    /// Buffers a notification to be returned to the caller once the root
    /// transaction commits.
    pub fn notify(&self, payload: Value) {
        self.inner.notifications.lock().unwrap().push(payload);
    }

    /// Registers a hook to run once the root transaction commits. Hooks run
    /// in post-order: a child's hooks run before its parent's.
    pub fn on_commit<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.hooks.lock().unwrap().push(Box::new(hook));
    }

    /// Commits this transaction. If nested, notifications and hooks are
    /// handed up to the parent and an empty notification list is returned
    /// here; only the root's commit returns the full buffered set and
    /// actually runs the hooks.
    pub fn commit(self) -> Result<Vec<Value>> {
        if self.inner.rolled_back.load(Ordering::SeqCst) {
            return Err(Error::InnerTransactionRolledBack);
        }
        if self.has_running_child() {
            return Err(Error::InnerTransactionNotAwaited);
        }
        self.inner.committed.store(true, Ordering::SeqCst);

        let notifications = std::mem::take(&mut *self.inner.notifications.lock().unwrap());
        let hooks = std::mem::take(&mut *self.inner.hooks.lock().unwrap());

        match &self.inner.parent {
            Some(parent) => {
                if parent.inner.rolled_back.load(Ordering::SeqCst) {
                    return Err(Error::RollBack);
                }
                parent
                    .inner
                    .notifications
                    .lock()
                    .unwrap()
                    .extend(notifications);
                parent.inner.hooks.lock().unwrap().extend(hooks);
                Ok(Vec::new())
            }
            None => {
                for hook in hooks {
                    hook();
                }
                Ok(notifications)
            }
        }
    }

    /// Rolls back this transaction. Any ancestor that later tries to commit
    /// over this rollback fails with [`Error::RollBack`]; callers awaiting
    /// this specific transaction see [`Error::InnerTransactionRolledBack`]
    /// if they try to commit it again.
    pub fn rollback(self) {
        self.inner.rolled_back.store(true, Ordering::SeqCst);
        self.inner.notifications.lock().unwrap().clear();
        self.inner.hooks.lock().unwrap().clear();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.committed.load(Ordering::SeqCst) && !self.rolled_back.load(Ordering::SeqCst) {
            tracing::warn!(transaction_id = %self.id, "transaction dropped without commit or rollback");
        }
    }
}
