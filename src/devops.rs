use anyhow::{anyhow, ensure, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::DevOpsConfig;
use crate::http::{self, Credentials, HttpRequest};

pub const API_VERSION: &str = "7.1";

/// Upper bound on ids accepted by the `workitemsbatch` endpoint.
pub const MAX_BATCH_SIZE: usize = 200;

/// Fields requested from `workitemsbatch`; these map onto [`WorkItem`].
pub const WORK_ITEM_FIELDS: [&str; 7] = [
    "System.Id",
    "System.Title",
    "System.State",
    "System.AssignedTo",
    "System.CreatedDate",
    "System.ChangedDate",
    "System.Tags",
];

/// WIQL selecting every Issue in the project, most recently changed first.
pub const ISSUE_IDS_WIQL: &str = "SELECT [System.Id] FROM WorkItems \
     WHERE [System.TeamProject] = @project AND [System.WorkItemType] = 'Issue' \
     ORDER BY [System.ChangedDate] DESC";

/// A work item reduced to the fields the report and the state prompt use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: i64,
    pub title: String,
    pub state: String,
    pub assigned_to: Option<String>,
    pub created_date: DateTime<Utc>,
    pub changed_date: DateTime<Utc>,
    #[serde(default)]
    pub tags: String,
}

impl WorkItem {
    /// Map an Azure DevOps work item (`{ id, fields: { "System.*": ... } }`).
    pub fn from_api(value: &Value) -> Result<Self> {
        let id = value
            .get("id")
            .and_then(Value::as_i64)
            .context("Work item is missing a numeric id")?;
        let fields = value
            .get("fields")
            .with_context(|| format!("Work item {id} has no fields"))?;

        let text = |name: &str| {
            fields
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let date = |name: &str| -> Result<DateTime<Utc>> {
            let raw = fields
                .get(name)
                .and_then(Value::as_str)
                .with_context(|| format!("Work item {id} is missing {name}"))?;
            Ok(DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("Work item {id} has an invalid {name}: {raw}"))?
                .with_timezone(&Utc))
        };

        // Identity fields come back as objects; very old collections return a plain string.
        let assigned_to = match fields.get("System.AssignedTo") {
            Some(Value::Object(identity)) => identity
                .get("displayName")
                .and_then(Value::as_str)
                .map(str::to_string),
            Some(Value::String(name)) => Some(name.clone()),
            _ => None,
        };

        Ok(WorkItem {
            id,
            title: text("System.Title"),
            state: text("System.State"),
            assigned_to,
            created_date: date("System.CreatedDate")?,
            changed_date: date("System.ChangedDate")?,
            tags: text("System.Tags"),
        })
    }
}

/// `{org_url}/{project}/_apis/wit/{segments...}?api-version=7.1`
pub fn endpoint(cfg: &DevOpsConfig, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(&cfg.org_url)
        .with_context(|| format!("Invalid Azure DevOps organisation URL: {}", cfg.org_url))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("Azure DevOps organisation URL cannot be a base: {}", cfg.org_url))?
        .pop_if_empty()
        .push(&cfg.project)
        .extend(["_apis", "wit"])
        .extend(segments);
    url.query_pairs_mut().append_pair("api-version", API_VERSION);
    Ok(url)
}

/// Run [`ISSUE_IDS_WIQL`] and return the matching ids in query order.
pub async fn query_issue_ids(
    client: &Client,
    cfg: &DevOpsConfig,
    credentials: &Credentials,
) -> Result<Vec<i64>> {
    let url = endpoint(cfg, &["wiql"])?;
    let request = HttpRequest::post(url.as_str())
        .basic_auth(credentials.clone())
        .json_body(&json!({ "query": ISSUE_IDS_WIQL }));

    let body = http::send(client, request)
        .await?
        .error_for_status()
        .context("WIQL query failed")?
        .into_json()?;

    body.get("workItems")
        .and_then(Value::as_array)
        .context("WIQL response has no workItems array")?
        .iter()
        .map(|item| {
            item.get("id")
                .and_then(Value::as_i64)
                .context("WIQL work item reference without an id")
        })
        .collect()
}

/// Fetch [`WORK_ITEM_FIELDS`] for `ids` in a single `workitemsbatch` call and
/// return the raw response.
pub async fn fetch_work_items_raw(
    client: &Client,
    cfg: &DevOpsConfig,
    credentials: &Credentials,
    ids: &[i64],
) -> Result<Value> {
    ensure!(!ids.is_empty(), "At least one work item id is required");
    ensure!(
        ids.len() <= MAX_BATCH_SIZE,
        "At most {MAX_BATCH_SIZE} work item ids can be fetched at once (got {})",
        ids.len()
    );

    let url = endpoint(cfg, &["workitemsbatch"])?;
    let request = HttpRequest::post(url.as_str())
        .basic_auth(credentials.clone())
        .json_body(&json!({ "ids": ids, "fields": WORK_ITEM_FIELDS }));

    http::send(client, request)
        .await?
        .error_for_status()
        .context("Work item batch request failed")?
        .into_json()
}

/// Fetch and map work items for `ids`.
pub async fn fetch_work_items(
    client: &Client,
    cfg: &DevOpsConfig,
    credentials: &Credentials,
    ids: &[i64],
) -> Result<Vec<WorkItem>> {
    let body = fetch_work_items_raw(client, cfg, credentials, ids).await?;
    body.get("value")
        .and_then(Value::as_array)
        .context("Work item batch response has no value array")?
        .iter()
        .map(WorkItem::from_api)
        .collect()
}

/// GET a single work item with all of its fields.
pub async fn get_work_item(
    client: &Client,
    cfg: &DevOpsConfig,
    credentials: &Credentials,
    id: i64,
) -> Result<Value> {
    let id = id.to_string();
    let url = endpoint(cfg, &["workitems", &id])?;
    let request = HttpRequest::get(url.as_str()).basic_auth(credentials.clone());

    http::send(client, request)
        .await?
        .error_for_status()
        .with_context(|| format!("Failed to fetch work item {id}"))?
        .into_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const AUTH: &str = "Basic dXNlcjpwYXQ=";

    fn cfg(server: &MockServer) -> DevOpsConfig {
        DevOpsConfig {
            org_url: server.base_url(),
            project: "Widgets".into(),
        }
    }

    fn creds() -> Credentials {
        Credentials::new("user", "pat")
    }

    fn api_item(id: i64, state: &str) -> Value {
        json!({
            "id": id,
            "fields": {
                "System.Id": id,
                "System.Title": format!("Item {id}"),
                "System.State": state,
                "System.AssignedTo": { "displayName": "Ada Lovelace", "uniqueName": "ada@example.com" },
                "System.CreatedDate": "2024-03-01T09:30:00.123Z",
                "System.ChangedDate": "2024-03-02T17:05:00Z",
                "System.Tags": "backend; urgent"
            }
        })
    }

    #[test]
    fn endpoint_encodes_project_and_api_version() {
        let cfg = DevOpsConfig {
            org_url: "https://dev.azure.com/acme/".into(),
            project: "My Project".into(),
        };
        let url = endpoint(&cfg, &["workitems", "42"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://dev.azure.com/acme/My%20Project/_apis/wit/workitems/42?api-version=7.1"
        );
    }

    #[test]
    fn work_item_maps_field_bag() {
        let item = WorkItem::from_api(&api_item(5, "Doing")).unwrap();
        assert_eq!(item.id, 5);
        assert_eq!(item.title, "Item 5");
        assert_eq!(item.state, "Doing");
        assert_eq!(item.assigned_to.as_deref(), Some("Ada Lovelace"));
        assert_eq!(item.tags, "backend; urgent");
        assert_eq!(item.changed_date.to_rfc3339(), "2024-03-02T17:05:00+00:00");
    }

    #[test]
    fn work_item_without_assignee_or_tags() {
        let value = json!({
            "id": 9,
            "fields": {
                "System.Title": "Lonely",
                "System.State": "To Do",
                "System.CreatedDate": "2024-01-01T00:00:00Z",
                "System.ChangedDate": "2024-01-01T00:00:00Z"
            }
        });
        let item = WorkItem::from_api(&value).unwrap();
        assert_eq!(item.assigned_to, None);
        assert_eq!(item.tags, "");
    }

    #[test]
    fn work_item_with_bad_date_is_rejected() {
        let mut value = api_item(1, "Done");
        value["fields"]["System.CreatedDate"] = json!("yesterday");
        assert!(WorkItem::from_api(&value).is_err());
    }

    #[tokio::test]
    async fn query_issue_ids_posts_wiql() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/Widgets/_apis/wit/wiql")
                    .query_param("api-version", "7.1")
                    .header("authorization", AUTH)
                    .json_body(json!({ "query": ISSUE_IDS_WIQL }));
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({ "workItems": [{ "id": 3 }, { "id": 1 }] }));
            })
            .await;

        let ids = query_issue_ids(&Client::new(), &cfg(&server), &creds())
            .await
            .unwrap();
        assert_eq!(ids, vec![3, 1]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetch_work_items_maps_batch_response() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/Widgets/_apis/wit/workitemsbatch")
                    .json_body(json!({ "ids": [1, 2], "fields": WORK_ITEM_FIELDS }));
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({ "count": 2, "value": [api_item(1, "Done"), api_item(2, "To Do")] }));
            })
            .await;

        let items = fetch_work_items(&Client::new(), &cfg(&server), &creds(), &[1, 2])
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].state, "To Do");
    }

    #[tokio::test]
    async fn batch_rejects_empty_and_oversized_requests() {
        let cfg = DevOpsConfig {
            org_url: "http://127.0.0.1:9".into(),
            project: "Widgets".into(),
        };
        let client = Client::new();
        assert!(fetch_work_items_raw(&client, &cfg, &creds(), &[]).await.is_err());

        let ids: Vec<i64> = (0..=MAX_BATCH_SIZE as i64).collect();
        let err = fetch_work_items_raw(&client, &cfg, &creds(), &ids)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("At most 200"));
    }

    #[tokio::test]
    async fn get_work_item_reports_status_on_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/Widgets/_apis/wit/workitems/77");
                then.status(401).body("unauthorised");
            })
            .await;

        let err = get_work_item(&Client::new(), &cfg(&server), &creds(), 77)
            .await
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("work item 77"));
        assert!(message.contains("401"));
    }
}
