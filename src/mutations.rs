//! Smart Edits mutations.
//!
//! Each mutation declares the keys it touches, the speculative patch shown
//! immediately, the request sent to the backend, and how the server's reply maps
//! back onto the store. [`crate::client::CacheClient::mutate`] drives the
//! lifecycle.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value as Json};

use crate::entity::{EntityKey, Fields};
use crate::error::{CacheError, CacheResult, ExecutionError, ValidationError};
use crate::normalize::normalize;
use crate::optimistic::PatchWriter;
use crate::reconcile::ServerTruth;
use crate::transport::{AjaxRequest, GraphqlRequest};
use crate::value::Value;

/// Field on `Batch` listing its suggestions.
pub const BATCH_SUGGESTIONS: &str = "suggestions";
/// Field on `Suggestion` listing its comments.
pub const SUGGESTION_COMMENTS: &str = "comments";
/// Field on `Suggestion` listing its tags.
pub const SUGGESTION_TAGS: &str = "tags";
/// Field on `Team` listing outstanding invitations.
pub const TEAM_INVITATIONS: &str = "invitations";

/// Wire request of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationRequest {
    /// Sent through the [`GraphqlTransport`](crate::GraphqlTransport).
    Graphql(GraphqlRequest),
    /// The nonce is filled in from the session at dispatch.
    Ajax(AjaxRequest),
}

/// A mutation with an optimistic patch and a reconciliation rule.
pub trait MutationSpec: Send + Sync {
    /// Short name used in logs.
    fn label(&self) -> &'static str;

    /// Local input checks. A failure here means nothing is patched or sent.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Every existing key the patch may write.
    fn affected_keys(&self) -> Vec<EntityKey>;

    /// Write the speculative state.
    fn optimistic(&self, patch: &mut PatchWriter<'_>) -> CacheResult<()>;

    /// Build the backend request. `placeholders` are the keys minted by `optimistic`.
    fn request(&self, placeholders: &[EntityKey]) -> MutationRequest;

    /// Translate the backend payload into authoritative store operations.
    fn reconcile(&self, placeholders: &[EntityKey], response: &Json) -> CacheResult<ServerTruth>;
}

fn suggestion_key(id: &str) -> EntityKey {
    EntityKey::new("Suggestion", id)
}

fn batch_key(id: &str) -> EntityKey {
    EntityKey::new("Batch", id)
}

fn require(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn malformed(reason: impl Into<String>) -> CacheError {
    ExecutionError::MalformedPayload { reason: reason.into() }.into()
}

/// Server truth for a reply that creates one entity standing in for a placeholder.
///
/// `response[field]` must be the created object with `__typename` and `id`.
fn created_entity(response: &Json, field: &str, placeholders: &[EntityKey]) -> CacheResult<ServerTruth> {
    let created = response
        .get(field)
        .ok_or_else(|| malformed(format!("missing '{field}' in response")))?;
    let normalized = normalize(created)?;
    let Value::Ref(real) = normalized.value else {
        return Err(malformed(format!("'{field}' is not an entity")));
    };
    let temp = placeholders
        .first()
        .ok_or_else(|| CacheError::internal("created entity without a placeholder"))?;

    let mut truth = ServerTruth::new().substitute(temp.clone(), real);
    for (key, fields) in normalized.entities {
        truth = truth.write(key, fields);
    }
    Ok(truth)
}

/// Truth for every entity in the payload, tolerating a null or scalar payload.
fn entities_in(response: &Json) -> CacheResult<ServerTruth> {
    match response {
        Json::Object(_) | Json::Array(_) => ServerTruth::from_response(response),
        _ => Ok(ServerTruth::new()),
    }
}

/// Discard a suggestion and drop it from its batch.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardSuggestion {
    pub batch_id: String,
    pub suggestion_id: String,
}

impl MutationSpec for DiscardSuggestion {
    fn label(&self) -> &'static str {
        "discard_suggestion"
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require("batch_id", &self.batch_id)?;
        require("suggestion_id", &self.suggestion_id)
    }

    fn affected_keys(&self) -> Vec<EntityKey> {
        vec![batch_key(&self.batch_id), suggestion_key(&self.suggestion_id)]
    }

    fn optimistic(&self, patch: &mut PatchWriter<'_>) -> CacheResult<()> {
        let suggestion = suggestion_key(&self.suggestion_id);
        patch.remove_edge(&batch_key(&self.batch_id), BATCH_SUGGESTIONS, &suggestion)?;
        patch.write_field(&suggestion, "status", "discarded")
    }

    fn request(&self, _placeholders: &[EntityKey]) -> MutationRequest {
        MutationRequest::Graphql(
            GraphqlRequest::new(
                "DiscardSuggestion",
                "mutation DiscardSuggestion($id: ID!) { discardSuggestion(id: $id) { __typename id status } }",
            )
            .with_variables(json!({ "id": self.suggestion_id })),
        )
    }

    fn reconcile(&self, _placeholders: &[EntityKey], response: &Json) -> CacheResult<ServerTruth> {
        entities_in(response.get("discardSuggestion").unwrap_or(&Json::Null))
    }
}

/// Post a comment on a suggestion.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddComment {
    pub suggestion_id: String,
    pub body: String,
    pub author: String,
}

impl MutationSpec for AddComment {
    fn label(&self) -> &'static str {
        "add_comment"
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require("suggestion_id", &self.suggestion_id)?;
        require("body", &self.body)
    }

    fn affected_keys(&self) -> Vec<EntityKey> {
        vec![suggestion_key(&self.suggestion_id)]
    }

    fn optimistic(&self, patch: &mut PatchWriter<'_>) -> CacheResult<()> {
        let comment = patch.placeholder("Comment")?;
        let mut fields = Fields::new();
        fields.insert("body".to_string(), Value::from(self.body.as_str()));
        fields.insert("author".to_string(), Value::from(self.author.as_str()));
        patch.write(&comment, fields)?;
        patch.append_edge(&suggestion_key(&self.suggestion_id), SUGGESTION_COMMENTS, comment)?;
        Ok(())
    }

    fn request(&self, _placeholders: &[EntityKey]) -> MutationRequest {
        MutationRequest::Graphql(
            GraphqlRequest::new(
                "AddComment",
                "mutation AddComment($suggestionId: ID!, $body: String!) { addComment(suggestionId: $suggestionId, body: $body) { __typename id body author } }",
            )
            .with_variables(json!({ "suggestionId": self.suggestion_id, "body": self.body })),
        )
    }

    fn reconcile(&self, placeholders: &[EntityKey], response: &Json) -> CacheResult<ServerTruth> {
        created_entity(response, "addComment", placeholders)
    }
}

/// Delete a comment.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteComment {
    pub suggestion_id: String,
    pub comment_id: String,
}

impl DeleteComment {
    fn comment_key(&self) -> EntityKey {
        EntityKey::new("Comment", self.comment_id.as_str())
    }
}

impl MutationSpec for DeleteComment {
    fn label(&self) -> &'static str {
        "delete_comment"
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require("suggestion_id", &self.suggestion_id)?;
        require("comment_id", &self.comment_id)
    }

    fn affected_keys(&self) -> Vec<EntityKey> {
        vec![suggestion_key(&self.suggestion_id), self.comment_key()]
    }

    fn optimistic(&self, patch: &mut PatchWriter<'_>) -> CacheResult<()> {
        let comment = self.comment_key();
        patch.remove_edge(&suggestion_key(&self.suggestion_id), SUGGESTION_COMMENTS, &comment)?;
        patch.evict(&comment)?;
        Ok(())
    }

    fn request(&self, _placeholders: &[EntityKey]) -> MutationRequest {
        MutationRequest::Graphql(
            GraphqlRequest::new(
                "DeleteComment",
                "mutation DeleteComment($id: ID!) { deleteComment(id: $id) }",
            )
            .with_variables(json!({ "id": self.comment_id })),
        )
    }

    fn reconcile(&self, _placeholders: &[EntityKey], _response: &Json) -> CacheResult<ServerTruth> {
        Ok(ServerTruth::new().evict(self.comment_key()))
    }
}

/// Attach a new tag to a suggestion.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddTag {
    pub suggestion_id: String,
    pub name: String,
}

impl MutationSpec for AddTag {
    fn label(&self) -> &'static str {
        "add_tag"
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require("suggestion_id", &self.suggestion_id)?;
        require("name", &self.name)
    }

    fn affected_keys(&self) -> Vec<EntityKey> {
        vec![suggestion_key(&self.suggestion_id)]
    }

    fn optimistic(&self, patch: &mut PatchWriter<'_>) -> CacheResult<()> {
        let tag = patch.placeholder("Tag")?;
        patch.write_field(&tag, "name", self.name.as_str())?;
        patch.append_edge(&suggestion_key(&self.suggestion_id), SUGGESTION_TAGS, tag)?;
        Ok(())
    }

    fn request(&self, _placeholders: &[EntityKey]) -> MutationRequest {
        MutationRequest::Graphql(
            GraphqlRequest::new(
                "AddTag",
                "mutation AddTag($suggestionId: ID!, $name: String!) { addTag(suggestionId: $suggestionId, name: $name) { __typename id name } }",
            )
            .with_variables(json!({ "suggestionId": self.suggestion_id, "name": self.name })),
        )
    }

    fn reconcile(&self, placeholders: &[EntityKey], response: &Json) -> CacheResult<ServerTruth> {
        created_entity(response, "addTag", placeholders)
    }
}

/// Record the reviewer's feedback on a suggestion.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSuggestionFeedback {
    pub suggestion_id: String,
    pub feedback: String,
    pub rating: Option<i64>,
}

impl MutationSpec for UpdateSuggestionFeedback {
    fn label(&self) -> &'static str {
        "update_suggestion_feedback"
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require("suggestion_id", &self.suggestion_id)
    }

    fn affected_keys(&self) -> Vec<EntityKey> {
        vec![suggestion_key(&self.suggestion_id)]
    }

    fn optimistic(&self, patch: &mut PatchWriter<'_>) -> CacheResult<()> {
        let suggestion = suggestion_key(&self.suggestion_id);
        patch.write_field(&suggestion, "feedback", self.feedback.as_str())?;
        if let Some(rating) = self.rating {
            patch.write_field(&suggestion, "rating", rating)?;
        }
        Ok(())
    }

    fn request(&self, _placeholders: &[EntityKey]) -> MutationRequest {
        MutationRequest::Graphql(
            GraphqlRequest::new(
                "UpdateSuggestionFeedback",
                "mutation UpdateSuggestionFeedback($id: ID!, $feedback: String!, $rating: Int) { updateSuggestionFeedback(id: $id, feedback: $feedback, rating: $rating) { __typename id feedback rating } }",
            )
            .with_variables(json!({
                "id": self.suggestion_id,
                "feedback": self.feedback,
                "rating": self.rating,
            })),
        )
    }

    fn reconcile(&self, _placeholders: &[EntityKey], response: &Json) -> CacheResult<ServerTruth> {
        entities_in(response.get("updateSuggestionFeedback").unwrap_or(&Json::Null))
    }
}

fn batch_transition(patch: &mut PatchWriter<'_>, batch_id: &str, status: &str) -> CacheResult<()> {
    patch.write_field(&batch_key(batch_id), "status", status)
}

fn batch_action(action: &str, batch_id: &str) -> MutationRequest {
    MutationRequest::Ajax(AjaxRequest::new(action, "").field("batch_id", batch_id))
}

/// Mark a batch of suggestions as applied to the site.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkBatchApplied {
    pub batch_id: String,
}

impl MutationSpec for MarkBatchApplied {
    fn label(&self) -> &'static str {
        "mark_batch_applied"
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require("batch_id", &self.batch_id)
    }

    fn affected_keys(&self) -> Vec<EntityKey> {
        vec![batch_key(&self.batch_id)]
    }

    fn optimistic(&self, patch: &mut PatchWriter<'_>) -> CacheResult<()> {
        batch_transition(patch, &self.batch_id, "applied")
    }

    fn request(&self, _placeholders: &[EntityKey]) -> MutationRequest {
        batch_action("smart_edits_apply_batch", &self.batch_id)
    }

    fn reconcile(&self, _placeholders: &[EntityKey], response: &Json) -> CacheResult<ServerTruth> {
        entities_in(response)
    }
}

/// Mark a previously applied batch as reverted.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkBatchReverted {
    pub batch_id: String,
}

impl MutationSpec for MarkBatchReverted {
    fn label(&self) -> &'static str {
        "mark_batch_reverted"
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require("batch_id", &self.batch_id)
    }

    fn affected_keys(&self) -> Vec<EntityKey> {
        vec![batch_key(&self.batch_id)]
    }

    fn optimistic(&self, patch: &mut PatchWriter<'_>) -> CacheResult<()> {
        batch_transition(patch, &self.batch_id, "reverted")
    }

    fn request(&self, _placeholders: &[EntityKey]) -> MutationRequest {
        batch_action("smart_edits_revert_batch", &self.batch_id)
    }

    fn reconcile(&self, _placeholders: &[EntityKey], response: &Json) -> CacheResult<ServerTruth> {
        entities_in(response)
    }
}

const EMAIL_PATTERN: &str = r"^[^\s@]+@[^\s@]+\.[^\s@]+$";

static EMAIL_REGEX: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Whether `value` looks like a deliverable email address.
pub fn is_valid_email(value: &str) -> CacheResult<bool> {
    let re = EMAIL_REGEX
        .get_or_init(|| Regex::new(EMAIL_PATTERN))
        .as_ref()
        .map_err(|e| CacheError::internal(format!("email pattern failed to compile: {e}")))?;
    Ok(re.is_match(value))
}

/// Invite several people to a team. Each invitation reconciles on its own.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteMembers {
    pub team_id: String,
    pub emails: Vec<String>,
    pub role: String,
}

impl InviteMembers {
    /// Validate every address and split into one mutation per invitee.
    ///
    /// Any invalid address rejects the whole request before anything is patched.
    pub fn into_invites(self) -> CacheResult<Vec<InviteMember>> {
        require("team_id", &self.team_id)?;
        if self.emails.is_empty() {
            return Err(ValidationError::MissingField {
                field: "emails".to_string(),
            }
            .into());
        }

        let mut invites: Vec<InviteMember> = Vec::with_capacity(self.emails.len());
        for raw in self.emails {
            let email = raw.trim().to_lowercase();
            if !is_valid_email(&email)? {
                return Err(ValidationError::InvalidEmail { value: raw }.into());
            }
            if invites.iter().any(|i| i.email == email) {
                continue;
            }
            invites.push(InviteMember {
                team_id: self.team_id.clone(),
                email,
                role: self.role.clone(),
            });
        }
        Ok(invites)
    }
}

/// A single invitation, tracked as a pending `Invitation` entity on the team.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteMember {
    pub team_id: String,
    pub email: String,
    pub role: String,
}

impl InviteMember {
    fn team_key(&self) -> EntityKey {
        EntityKey::new("Team", self.team_id.as_str())
    }
}

impl MutationSpec for InviteMember {
    fn label(&self) -> &'static str {
        "invite_member"
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require("team_id", &self.team_id)?;
        match is_valid_email(&self.email) {
            Ok(true) => Ok(()),
            _ => Err(ValidationError::InvalidEmail {
                value: self.email.clone(),
            }),
        }
    }

    fn affected_keys(&self) -> Vec<EntityKey> {
        vec![self.team_key()]
    }

    fn optimistic(&self, patch: &mut PatchWriter<'_>) -> CacheResult<()> {
        let invitation = patch.placeholder("Invitation")?;
        let mut fields = Fields::new();
        fields.insert("email".to_string(), Value::from(self.email.as_str()));
        fields.insert("role".to_string(), Value::from(self.role.as_str()));
        fields.insert("status".to_string(), Value::from("sending"));
        patch.write(&invitation, fields)?;
        patch.append_edge(&self.team_key(), TEAM_INVITATIONS, invitation)?;
        Ok(())
    }

    fn request(&self, _placeholders: &[EntityKey]) -> MutationRequest {
        MutationRequest::Ajax(
            AjaxRequest::new("smart_edits_invite_member", "")
                .field("team_id", self.team_id.as_str())
                .field("email", self.email.as_str())
                .field("role", self.role.as_str()),
        )
    }

    fn reconcile(&self, placeholders: &[EntityKey], response: &Json) -> CacheResult<ServerTruth> {
        created_entity(response, "invitation", placeholders)
    }
}
