//! Network boundary contracts.
//!
//! The cache never talks to the network directly. Callers supply a
//! [`GraphqlTransport`] for queries and mutations and an [`AjaxTransport`] for
//! the form-encoded admin actions. Both are async and object safe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::TransportError;

/// A GraphQL operation.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlRequest {
    pub operation_name: String,
    pub query: String,
    #[serde(default)]
    pub variables: Json,
}

impl GraphqlRequest {
    /// A request with empty variables.
    #[must_use]
    pub fn new(operation_name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            query: query.into(),
            variables: Json::Object(serde_json::Map::new()),
        }
    }

    /// Replace the variables object.
    #[must_use]
    pub fn with_variables(mut self, variables: Json) -> Self {
        self.variables = variables;
        self
    }
}

/// Machine-readable part of a GraphQL error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphqlErrorExtensions {
    /// Error code such as `UNAUTHENTICATED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// One entry of a GraphQL `errors` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphqlError {
    /// Human-readable message.
    pub message: String,
    /// Error metadata.
    #[serde(default)]
    pub extensions: GraphqlErrorExtensions,
}

/// A GraphQL response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphqlResponse {
    /// The `data` member.
    #[serde(default)]
    pub data: Option<Json>,
    /// The `errors` member.
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

impl GraphqlResponse {
    /// A successful response carrying `data`.
    #[must_use]
    pub fn ok(data: Json) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// Extract `data`, surfacing any reported errors.
    ///
    /// A response with both data and errors is treated as failed.
    pub fn into_data(self) -> Result<Json, TransportError> {
        if !self.errors.is_empty() {
            let codes = self
                .errors
                .iter()
                .filter_map(|e| e.extensions.code.clone())
                .collect();
            let messages = self.errors.into_iter().map(|e| e.message).collect();
            return Err(TransportError::GraphqlErrors { messages, codes });
        }
        self.data.ok_or_else(|| TransportError::DeserializationFailed {
            message: "response has neither data nor errors".to_string(),
        })
    }
}

/// Executes GraphQL operations against the backend.
#[async_trait]
pub trait GraphqlTransport: Send + Sync {
    /// Send one operation and return the raw response body.
    async fn execute(&self, request: GraphqlRequest) -> Result<GraphqlResponse, TransportError>;
}

/// A form-encoded admin action (`action`, `nonce`, and action fields).
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AjaxRequest {
    pub action: String,
    pub nonce: String,
    pub fields: Vec<(String, String)>,
}

impl AjaxRequest {
    /// Create an empty instance.
    #[must_use]
    pub fn new(action: impl Into<String>, nonce: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            nonce: nonce.into(),
            fields: Vec::new(),
        }
    }

    /// Append a form field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// `application/x-www-form-urlencoded` body.
    #[must_use]
    pub fn encode_form(&self) -> String {
        let head = [("action", self.action.as_str()), ("nonce", self.nonce.as_str())];
        head.into_iter()
            .chain(self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// `{ "success": bool, "data": ... }` reply of an admin action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AjaxEnvelope {
    /// Whether the action succeeded.
    pub success: bool,
    /// Payload, or error details on failure.
    #[serde(default)]
    pub data: Json,
}

impl AjaxEnvelope {
    /// Unwrap the payload, raising `success: false` as [`TransportError::ActionFailed`].
    pub fn into_result(self, action: &str) -> Result<Json, TransportError> {
        if self.success {
            return Ok(self.data);
        }
        let message = match &self.data {
            Json::String(s) => s.clone(),
            Json::Object(obj) => obj
                .get("message")
                .and_then(Json::as_str)
                .map_or_else(|| Json::Object(obj.clone()).to_string(), str::to_string),
            Json::Null => "no details".to_string(),
            other => other.to_string(),
        };
        Err(TransportError::ActionFailed {
            action: action.to_string(),
            message,
        })
    }
}

/// Posts admin actions.
#[async_trait]
pub trait AjaxTransport: Send + Sync {
    /// Post one action and return its envelope.
    async fn post(&self, request: AjaxRequest) -> Result<AjaxEnvelope, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn _assert_transports_object_safe(_: &dyn GraphqlTransport, _: &dyn AjaxTransport) {}

    #[test]
    fn test_request_serializes_camel_case() {
        let req = GraphqlRequest::new("DiscardSuggestion", "mutation { x }").with_variables(json!({"id": "42"}));
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["operationName"], "DiscardSuggestion");
        assert_eq!(v["variables"]["id"], "42");
    }

    #[test]
    fn test_graphql_errors_surface() {
        let resp: GraphqlResponse = serde_json::from_value(json!({
            "data": null,
            "errors": [{"message": "Token expired", "extensions": {"code": "invalid_token"}}]
        }))
        .unwrap();
        let err = resp.into_data().unwrap_err();
        assert!(err.is_auth_rejection());
        assert_eq!(err.to_string(), "GraphQL errors: Token expired");
    }

    #[test]
    fn test_missing_data_is_an_error() {
        assert!(GraphqlResponse::default().into_data().is_err());
        assert_eq!(GraphqlResponse::ok(json!({"a": 1})).into_data().unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_form_encoding() {
        let req = AjaxRequest::new("smart_edits_invite", "n0nce")
            .field("email", "a+b@example.com")
            .field("note", "hi there");
        assert_eq!(
            req.encode_form(),
            "action=smart_edits_invite&nonce=n0nce&email=a%2Bb%40example.com&note=hi%20there"
        );
    }

    #[test]
    fn test_envelope_failure() {
        let env = AjaxEnvelope {
            success: false,
            data: json!({"message": "Seat limit reached"}),
        };
        assert_eq!(
            env.into_result("invite").unwrap_err(),
            TransportError::ActionFailed {
                action: "invite".to_string(),
                message: "Seat limit reached".to_string(),
            }
        );

        let ok = AjaxEnvelope {
            success: true,
            data: json!([1, 2]),
        };
        assert_eq!(ok.into_result("invite").unwrap(), json!([1, 2]));
    }
}
