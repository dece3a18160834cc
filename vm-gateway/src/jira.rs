//! Jira Cloud ticketing gateway (REST v3, basic auth with an API token).
//!
//! Issues are labelled with the subject's external key, which makes
//! [`create_or_update_ticket`](TicketingGateway::create_or_update_ticket)
//! idempotent even when the key returned by an earlier call was never
//! persisted: the label search finds the issue again instead of opening a
//! duplicate.

use crate::error::{GatewayError, Result};
use crate::http::{self, HttpFailure};
use crate::settings::JiraSettings;
use crate::ticketing::{TicketDecision, TicketRef, TicketRequest, TicketingGateway};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;

#[derive(Debug, Deserialize)]
struct IssueKey {
    key: String,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    issues: Vec<IssueKey>,
}

#[derive(Debug, Deserialize)]
struct Transition {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Transitions {
    #[serde(default)]
    transitions: Vec<Transition>,
}

fn unavailable(context: &str, failure: HttpFailure) -> GatewayError {
    GatewayError::TicketingUnavailable(format!("{context}: {failure}"))
}

/// Wrap plain text into an Atlassian Document Format body, one paragraph per
/// non-empty line.
pub(crate) fn adf(text: &str) -> Value {
    let paragraphs: Vec<Value> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            json!({
                "type": "paragraph",
                "content": [ { "type": "text", "text": line } ]
            })
        })
        .collect();

    json!({ "type": "doc", "version": 1, "content": paragraphs })
}

pub struct JiraGateway {
    client: Client,
    base: Url,
    email: String,
    api_token: String,
    project_key: String,
    issue_type: String,
    approve_transition: String,
    reject_transition: String,
}

impl JiraGateway {
    pub fn new(settings: &JiraSettings) -> Result<Self> {
        let mut base = Url::parse(&settings.base_url).map_err(|e| {
            GatewayError::Settings(format!("invalid Jira base_url {}: {e}", settings.base_url))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = http::build_client(Duration::from_secs(30), true)
            .map_err(|e| GatewayError::TicketingUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            base,
            email: settings.email.clone(),
            api_token: settings.api_token.expose().to_string(),
            project_key: settings.project_key.clone(),
            issue_type: settings.issue_type.clone(),
            approve_transition: settings.approve_transition.clone(),
            reject_transition: settings.reject_transition.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| GatewayError::Settings(format!("invalid Jira path {path}: {e}")))
    }

    fn browse_url(&self, key: &str) -> String {
        self.endpoint(&format!("browse/{key}"))
            .map(|u| u.to_string())
            .unwrap_or_else(|_| key.to_string())
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.basic_auth(&self.email, Some(&self.api_token))
    }

    async fn update_issue(&self, key: &str, request: &TicketRequest) -> std::result::Result<(), HttpFailure> {
        let url = self
            .endpoint(&format!("rest/api/3/issue/{key}"))
            .map_err(|e| HttpFailure { status: None, message: e.to_string() })?;
        let body = json!({
            "fields": {
                "summary": request.summary,
                "description": adf(&request.description),
            }
        });
        let resp = self.authed(self.client.put(url)).json(&body).send().await?;
        http::check(resp).await?;
        Ok(())
    }

    async fn find_by_label(&self, label: &str) -> Result<Option<String>> {
        let mut url = self.endpoint("rest/api/3/search/jql")?;
        let jql = format!("project = \"{}\" AND labels = \"{}\"", self.project_key, label);
        url.query_pairs_mut()
            .append_pair("jql", &jql)
            .append_pair("fields", "key")
            .append_pair("maxResults", "1");

        let resp = self
            .authed(self.client.get(url))
            .send()
            .await
            .map_err(|e| unavailable("search issues", e.into()))?;
        let result: SearchResult = http::json(resp)
            .await
            .map_err(|e| unavailable("search issues", e))?;
        Ok(result.issues.into_iter().next().map(|i| i.key))
    }

    async fn create_issue(&self, request: &TicketRequest) -> Result<String> {
        let url = self.endpoint("rest/api/3/issue")?;
        let body = json!({
            "fields": {
                "project": { "key": self.project_key },
                "issuetype": { "name": self.issue_type },
                "summary": request.summary,
                "description": adf(&request.description),
                "labels": [ request.external_key() ],
            }
        });

        let resp = self
            .authed(self.client.post(url))
            .json(&body)
            .send()
            .await
            .map_err(|e| unavailable("create issue", e.into()))?;
        let created: IssueKey = http::json(resp)
            .await
            .map_err(|e| unavailable("create issue", e))?;
        Ok(created.key)
    }
}

#[async_trait]
impl TicketingGateway for JiraGateway {
    #[instrument(skip_all, fields(subject = %request.external_key()))]
    async fn create_or_update_ticket(&self, request: &TicketRequest) -> Result<TicketRef> {
        if let Some(key) = &request.existing_key {
            match self.update_issue(key, request).await {
                Ok(()) => {
                    debug!(key = %key, "Updated Jira issue");
                    return Ok(TicketRef {
                        key: key.clone(),
                        url: self.browse_url(key),
                    });
                }
                Err(failure) if failure.is_not_found() => {
                    debug!(key = %key, "Stored Jira issue no longer exists, searching by label");
                }
                Err(failure) => return Err(unavailable("update issue", failure)),
            }
        }

        let label = request.external_key();
        if let Some(key) = self.find_by_label(&label).await? {
            self.update_issue(&key, request)
                .await
                .map_err(|e| unavailable("update issue", e))?;
            debug!(key = %key, "Found Jira issue by label");
            let url = self.browse_url(&key);
            return Ok(TicketRef { key, url });
        }

        let key = self.create_issue(request).await?;
        info!(key = %key, "Created Jira issue");
        let url = self.browse_url(&key);
        Ok(TicketRef { key, url })
    }

    async fn add_comment(&self, key: &str, body: &str) -> Result<()> {
        let url = self.endpoint(&format!("rest/api/3/issue/{key}/comment"))?;
        let resp = self
            .authed(self.client.post(url))
            .json(&json!({ "body": adf(body) }))
            .send()
            .await
            .map_err(|e| unavailable("add comment", e.into()))?;
        http::check(resp)
            .await
            .map_err(|e| unavailable("add comment", e))?;
        Ok(())
    }

    async fn record_decision(&self, key: &str, decision: TicketDecision) -> Result<bool> {
        let wanted = match decision {
            TicketDecision::Approved => &self.approve_transition,
            TicketDecision::Rejected => &self.reject_transition,
        };

        let url = self.endpoint(&format!("rest/api/3/issue/{key}/transitions"))?;
        let resp = self
            .authed(self.client.get(url.clone()))
            .send()
            .await
            .map_err(|e| unavailable("list transitions", e.into()))?;
        let available: Transitions = http::json(resp)
            .await
            .map_err(|e| unavailable("list transitions", e))?;

        let Some(transition) = available
            .transitions
            .into_iter()
            .find(|t| t.name.eq_ignore_ascii_case(wanted))
        else {
            debug!(key = %key, transition = %wanted, "Transition not available");
            return Ok(false);
        };

        let resp = self
            .authed(self.client.post(url))
            .json(&json!({ "transition": { "id": transition.id } }))
            .send()
            .await
            .map_err(|e| unavailable("transition issue", e.into()))?;
        http::check(resp)
            .await
            .map_err(|e| unavailable("transition issue", e))?;
        info!(key = %key, transition = %transition.name, "Transitioned Jira issue");
        Ok(true)
    }
}
