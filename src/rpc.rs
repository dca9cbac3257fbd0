//! RPC dispatcher.
//!
//! Maps an incoming method name to a registered handler, runs it under the
//! [`ActivityTracker`] so graceful shutdown can wait for it, and wraps
//! whatever comes back (or whatever error was thrown) into the wire
//! response envelope.
//!
//! Dispatch follows a fixed sequence: reject while paused, require an
//! authenticated caller, look up the route, register the call as an
//! activity, open a transaction eagerly for routes that declare
//! `transactional`, run the handler, then commit or roll back whatever
//! transaction was opened depending on the outcome.

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::activity::ActivityTracker;
use crate::error::Error;
use crate::transaction::{Transaction, TransactionRequirement};

/// Per-call context handed to every RPC handler: who is calling, and a
/// lazily-opened transaction shared by the whole call.
///
/// A handler that never touches [`RpcContext::transaction`] never pays for
/// one; a route registered as `transactional` has it opened before the
/// handler runs instead.
pub struct RpcContext {
    /// The authenticated caller's claims, as resolved from their token.
    pub user: Value,
    /// The authenticated caller's id, if present in `user`.
    pub user_id: Option<String>,
    /// The tenant (`origin`) this call is scoped to, if any.
    pub tenant_id: Option<String>,
    transaction: Mutex<Option<Transaction>>,
}

impl RpcContext {
    fn new(user: Value, user_id: Option<String>, tenant_id: Option<String>) -> Self {
        Self {
            user,
            user_id,
            tenant_id,
            transaction: Mutex::new(None),
        }
    }

    fn with_open_transaction(
        user: Value,
        user_id: Option<String>,
        tenant_id: Option<String>,
    ) -> Result<Self, Error> {
        let ctx = Self::new(user, user_id, tenant_id);
        let txn = Transaction::begin(None, TransactionRequirement::Any)?;
        *ctx.transaction.lock().unwrap() = Some(txn);
        Ok(ctx)
    }

    /// Returns the call's transaction, opening a new root transaction on
    /// first access. Subsequent calls within the same context return the
    /// same transaction.
    pub fn transaction(&self) -> Result<Transaction, Error> {
        let mut slot = self.transaction.lock().unwrap();
        if let Some(txn) = slot.as_ref() {
            return Ok(txn.clone());
        }
        let txn = Transaction::begin(None, TransactionRequirement::Any)?;
        *slot = Some(txn.clone());
        Ok(txn)
    }

    /// Takes whatever transaction was opened during this call, if any,
    /// leaving none behind. Used by the dispatcher to commit or roll back
    /// after the handler returns.
    fn take_transaction(&self) -> Option<Transaction> {
        self.transaction.lock().unwrap().take()
    }
}

/// Identifies the caller a request is dispatched on behalf of. Built by the
/// socket transport from the connection's authenticated state; `user: None`
/// models a call made before (or without) authentication.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    /// The authenticated caller's claims. `None` if the connection has not
    /// completed authentication.
    pub user: Option<Value>,
    /// The authenticated caller's id.
    pub user_id: Option<String>,
    /// The tenant (`origin`) the connection authenticated against.
    pub tenant_id: Option<String>,
}

/// A registered RPC handler: takes the call's JSON params and its
/// [`RpcContext`], returns a JSON result or an [`Error`].
pub type HandlerFn = Arc<
    dyn Fn(Value, Arc<RpcContext>) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync,
>;

/// One entry in the route table.
#[derive(Clone)]
pub struct RouteEntry {
    /// The RPC method name this entry answers for.
    pub method: String,
    /// Whether a transaction is opened before the handler runs, rather than
    /// lazily on first use.
    pub transactional: bool,
    handler: HandlerFn,
}

/// An inbound RPC call as decoded from the socket transport.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    /// Correlation id, echoed back on the response. `None` for
    /// fire-and-forget calls.
    #[serde(default)]
    pub id: Option<Value>,
    /// The method name to dispatch to.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// The response envelope returned for an [`RpcRequest`].
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    /// Echoes [`RpcRequest::id`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// The handler's result, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// `{ code, data }`, present on failure. See [`Error::to_rpc_error`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl RpcResponse {
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Option<Value>, error: &Error) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.to_rpc_error()),
        }
    }
}

/// Holds the method-name-to-handler route table and dispatches calls
/// against it.
#[derive(Clone)]
pub struct RpcDispatcher {
    routes: Arc<DashMap<String, RouteEntry>>,
    activity: ActivityTracker,
}

impl RpcDispatcher {
    /// Builds an empty dispatcher. Activity spent inside handlers is
    /// tracked through `activity`, so a graceful shutdown can drain it.
    pub fn new(activity: ActivityTracker) -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
            activity,
        }
    }

    /// Registers `handler` under `method`, replacing any previous
    /// registration for the same name. `transactional` routes get a
    /// transaction opened before the handler runs; others get one lazily,
    /// the first time the handler calls [`RpcContext::transaction`].
    pub fn register<F, Fut>(&self, method: impl Into<String>, transactional: bool, handler: F)
    where
        F: Fn(Value, Arc<RpcContext>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, Error>> + Send + 'static,
    {
        let method = method.into();
        let boxed: HandlerFn = Arc::new(move |params, ctx| Box::pin(handler(params, ctx)));
        self.routes.insert(
            method.clone(),
            RouteEntry {
                method,
                transactional,
                handler: boxed,
            },
        );
    }

    /// Whether a handler is registered for `method`.
    pub fn has_route(&self, method: &str) -> bool {
        self.routes.contains_key(method)
    }

    /// Dispatches `request` on behalf of `caller`, tracking the call as an
    /// activity for the duration of the handler and committing or rolling
    /// back any transaction the handler opened.
    pub async fn dispatch(&self, request: RpcRequest, caller: &CallerContext) -> RpcResponse {
        if self.activity.is_paused() {
            return RpcResponse::err(request.id, &Error::ServerUnavailable);
        }

        let user = match &caller.user {
            Some(user) => user.clone(),
            None => {
                let err = Error::Unauthorized("Access requires authentication".to_string());
                return RpcResponse::err(request.id, &err);
            }
        };

        let entry = match self.routes.get(&request.method) {
            Some(entry) => entry.clone(),
            None => {
                let err = Error::UnknownMethod(request.method.clone());
                return RpcResponse::err(request.id, &err);
            }
        };

        let guard = match self
            .activity
            .begin(format!("rpc:{}", request.method))
        {
            Ok(guard) => guard,
            Err(err) => return RpcResponse::err(request.id, &err),
        };

        let ctx = if entry.transactional {
            match RpcContext::with_open_transaction(
                user,
                caller.user_id.clone(),
                caller.tenant_id.clone(),
            ) {
                Ok(ctx) => Arc::new(ctx),
                Err(err) => {
                    drop(guard);
                    return RpcResponse::err(request.id, &err);
                }
            }
        } else {
            Arc::new(RpcContext::new(
                user,
                caller.user_id.clone(),
                caller.tenant_id.clone(),
            ))
        };

        let result = (entry.handler)(request.params, ctx.clone()).await;
        drop(guard);

        let opened = ctx.take_transaction();

        match result {
            Ok(value) => {
                if let Some(txn) = opened {
                    if let Err(err) = txn.commit() {
                        return RpcResponse::err(request.id, &err);
                    }
                }
                RpcResponse::ok(request.id, value)
            }
            Err(err) => {
                if let Some(txn) = opened {
                    txn.rollback();
                }
                RpcResponse::err(request.id, &err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> RpcDispatcher {
        RpcDispatcher::new(ActivityTracker::new())
    }

    fn authenticated_caller() -> CallerContext {
        CallerContext {
            user: Some(serde_json::json!({"id": "user-1"})),
            user_id: Some("user-1".to_string()),
            tenant_id: Some("tenant-1".to_string()),
        }
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_handler() {
        let dispatcher = dispatcher();
        dispatcher.register("echo", false, |params, _ctx| async move { Ok(params) });

        let response = dispatcher
            .dispatch(
                RpcRequest {
                    id: Some(Value::from(1)),
                    method: "echo".to_string(),
                    params: serde_json::json!({"hello": "world"}),
                },
                &authenticated_caller(),
            )
            .await;

        assert_eq!(response.result.unwrap()["hello"], "world");
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn dispatch_unknown_method_returns_api_unknown() {
        let dispatcher = dispatcher();
        let response = dispatcher
            .dispatch(
                RpcRequest {
                    id: None,
                    method: "missing.method".to_string(),
                    params: Value::Null,
                },
                &authenticated_caller(),
            )
            .await;

        assert_eq!(response.error.unwrap()["code"], "API-UNKNOWN");
    }

    #[tokio::test]
    async fn dispatch_propagates_handler_error() {
        let dispatcher = dispatcher();
        dispatcher.register("fail", false, |_params, _ctx| async move {
            Err(Error::WrongUser)
        });

        let response = dispatcher
            .dispatch(
                RpcRequest {
                    id: None,
                    method: "fail".to_string(),
                    params: Value::Null,
                },
                &authenticated_caller(),
            )
            .await;

        assert_eq!(response.error.unwrap()["code"], "wrong_user");
    }

    #[tokio::test]
    async fn dispatch_rejects_new_calls_while_paused() {
        let activity = ActivityTracker::new();
        activity.pause();
        let dispatcher = RpcDispatcher::new(activity);
        dispatcher.register("echo", false, |params, _ctx| async move { Ok(params) });

        let response = dispatcher
            .dispatch(
                RpcRequest {
                    id: None,
                    method: "echo".to_string(),
                    params: Value::Null,
                },
                &authenticated_caller(),
            )
            .await;

        assert_eq!(response.error.unwrap()["code"], "SERVER_UNAVAILABLE");
    }

    #[tokio::test]
    async fn dispatch_rejects_unauthenticated_caller() {
        let dispatcher = dispatcher();
        dispatcher.register("echo", false, |params, _ctx| async move { Ok(params) });

        let response = dispatcher
            .dispatch(
                RpcRequest {
                    id: None,
                    method: "echo".to_string(),
                    params: Value::Null,
                },
                &CallerContext::default(),
            )
            .await;

        assert_eq!(response.error.unwrap()["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn transactional_route_commits_on_success() {
        let dispatcher = dispatcher();
        dispatcher.register("create", true, |params, ctx| async move {
            let txn = ctx.transaction().unwrap();
            txn.notify(serde_json::json!({"event": "created"}));
            Ok(params)
        });

        let response = dispatcher
            .dispatch(
                RpcRequest {
                    id: None,
                    method: "create".to_string(),
                    params: Value::Null,
                },
                &authenticated_caller(),
            )
            .await;

        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn transactional_route_rolls_back_on_failure() {
        let dispatcher = dispatcher();
        dispatcher.register("create", true, |_params, ctx| async move {
            let txn = ctx.transaction().unwrap();
            txn.notify(serde_json::json!({"event": "created"}));
            Err(Error::ValidationError("bad input".to_string()))
        });

        let response = dispatcher
            .dispatch(
                RpcRequest {
                    id: None,
                    method: "create".to_string(),
                    params: Value::Null,
                },
                &authenticated_caller(),
            )
            .await;

        assert_eq!(response.error.unwrap()["code"], "USER_INVALID");
    }

    #[tokio::test]
    async fn lazy_transaction_is_not_opened_unless_used() {
        let dispatcher = dispatcher();
        dispatcher.register("echo", false, |params, _ctx| async move { Ok(params) });

        let response = dispatcher
            .dispatch(
                RpcRequest {
                    id: None,
                    method: "echo".to_string(),
                    params: serde_json::json!({"ok": true}),
                },
                &authenticated_caller(),
            )
            .await;

        assert!(response.error.is_none());
    }
}
