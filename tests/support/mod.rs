#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use tokio::sync::Notify;

use smartcache::{
    AjaxEnvelope, AjaxRequest, AjaxTransport, CacheClient, CacheConfig, Credentials, GraphqlRequest,
    GraphqlResponse, GraphqlTransport, SessionContext, TransportError, UserProfile,
};

pub struct Scripted<T> {
    gate: Option<Arc<Notify>>,
    reply: Result<T, TransportError>,
}

impl<T> Scripted<T> {
    pub fn now(reply: Result<T, TransportError>) -> Self {
        Self { gate: None, reply }
    }

    pub fn after(gate: &Arc<Notify>, reply: Result<T, TransportError>) -> Self {
        Self {
            gate: Some(Arc::clone(gate)),
            reply,
        }
    }
}

/// Replays scripted GraphQL replies in call order.
#[derive(Default)]
pub struct ScriptedGraphql {
    script: Mutex<VecDeque<Scripted<GraphqlResponse>>>,
    calls: Mutex<Vec<GraphqlRequest>>,
}

impl ScriptedGraphql {
    pub fn push(&self, step: Scripted<GraphqlResponse>) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn calls(&self) -> Vec<GraphqlRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GraphqlTransport for ScriptedGraphql {
    async fn execute(&self, request: GraphqlRequest) -> Result<GraphqlResponse, TransportError> {
        self.calls.lock().unwrap().push(request);
        let step = self.script.lock().unwrap().pop_front();
        let Some(step) = step else {
            return Err(TransportError::ConnectionFailed {
                message: "no scripted reply".to_string(),
            });
        };
        if let Some(gate) = step.gate {
            gate.notified().await;
        }
        step.reply
    }
}

/// Answers admin actions with a closure over the request.
pub struct FnAjax {
    handler: Box<dyn Fn(&AjaxRequest) -> Result<AjaxEnvelope, TransportError> + Send + Sync>,
    calls: Mutex<Vec<String>>,
}

impl FnAjax {
    pub fn new(handler: impl Fn(&AjaxRequest) -> Result<AjaxEnvelope, TransportError> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn unused() -> Self {
        Self::new(|req| {
            Err(TransportError::ConnectionFailed {
                message: format!("unexpected action {}", req.action),
            })
        })
    }

    /// Form bodies of every request, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AjaxTransport for FnAjax {
    async fn post(&self, request: AjaxRequest) -> Result<AjaxEnvelope, TransportError> {
        self.calls.lock().unwrap().push(request.encode_form());
        (self.handler)(&request)
    }
}

pub fn data(value: Json) -> Result<GraphqlResponse, TransportError> {
    Ok(GraphqlResponse::ok(value))
}

pub fn signed_in_session() -> Arc<SessionContext> {
    let session = Arc::new(SessionContext::new());
    session
        .sign_in(
            UserProfile {
                id: "u1".to_string(),
                email: "owner@example.com".to_string(),
                display_name: Some("Owner".to_string()),
            },
            Credentials {
                access_token: "token".to_string(),
                nonce: "n0nce".to_string(),
                expires_at: None,
            },
        )
        .unwrap();
    session
}

pub fn client(graphql: &Arc<ScriptedGraphql>, ajax: &Arc<FnAjax>, cfg: CacheConfig) -> CacheClient {
    CacheClient::builder(graphql.clone(), ajax.clone())
        .config(cfg)
        .session(signed_in_session())
        .build()
        .unwrap()
}

/// A batch of three open suggestions, as the batch query returns it.
pub fn batch_payload() -> Json {
    json!({
        "__typename": "Batch",
        "id": "b1",
        "status": "open",
        "suggestions": {
            "nodes": [
                {"__typename": "Suggestion", "id": "41", "status": "open"},
                {"__typename": "Suggestion", "id": "42", "status": "open"},
                {"__typename": "Suggestion", "id": "43", "status": "open"}
            ],
            "pageInfo": {"hasNextPage": false, "endCursor": "c3"},
            "totalCount": 3
        }
    })
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
