use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    error::{IndexError, Result},
    model::{Address, Severity},
};

const USER_AGENT: &str = concat!("chainlog/", env!("CARGO_PKG_VERSION"));

const LOG_FIELDS: &str = "id creator level category message metadata timestamp blockNumber \
                          transactionHash active updateCount";

/// GraphQL consumer of a chainlog endpoint. Transport failures surface as
/// [`IndexError::Unavailable`] so callers can tell "unreachable" apart from
/// "no results".
#[derive(Clone)]
pub struct IndexClient {
    http: Client,
    endpoint: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteLogFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedLog {
    pub id: String,
    pub creator: Address,
    pub level: Severity,
    pub category: String,
    pub message: String,
    pub metadata: Option<String>,
    pub timestamp: u64,
    pub block_number: u64,
    pub transaction_hash: Option<String>,
    pub active: bool,
    pub update_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteGlobalStats {
    pub total_logs: u64,
    pub active_logs: u64,
    pub total_users: u64,
    pub total_categories: u64,
    pub total_updates: u64,
    pub total_batches: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUser {
    pub address: Address,
    pub total_logs: u64,
    pub active_logs: u64,
    pub updates_made: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    pub block_number: Option<u64>,
    pub log_index: Option<u64>,
    pub events_applied: u64,
    pub events_skipped: u64,
}

#[derive(Deserialize)]
struct GraphqlEnvelope {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlErrorMessage>,
}

#[derive(Deserialize)]
struct GraphqlErrorMessage {
    message: String,
}

impl IndexClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|err| IndexError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Runs a GraphQL query and deserializes the field named `field` from
    /// the response data.
    pub async fn query<T>(&self, query: &str, variables: Value, field: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let body = json!({ "query": query, "variables": variables });
        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| transport_error(&self.endpoint, err))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(IndexError::Unavailable(format!(
                "{} responded with {status}",
                self.endpoint
            )));
        }
        let text = response
            .text()
            .await
            .map_err(|err| transport_error(&self.endpoint, err))?;
        if status != StatusCode::OK {
            return Err(IndexError::Query(format!(
                "{} responded with {status}: {}",
                self.endpoint,
                text.trim()
            )));
        }

        let envelope: GraphqlEnvelope = serde_json::from_str(&text)
            .map_err(|err| IndexError::Query(format!("malformed GraphQL response: {err}")))?;
        if !envelope.errors.is_empty() {
            let messages: Vec<_> = envelope
                .errors
                .into_iter()
                .map(|error| error.message)
                .collect();
            return Err(IndexError::Query(messages.join("; ")));
        }
        let mut data = envelope
            .data
            .ok_or_else(|| IndexError::Query("GraphQL response carried no data".into()))?;
        let value = data.get_mut(field).map(Value::take).unwrap_or(Value::Null);
        debug!(endpoint = %self.endpoint, field, "graphql query succeeded");
        serde_json::from_value(value)
            .map_err(|err| IndexError::Query(format!("unexpected shape for {field}: {err}")))
    }

    pub async fn log_entries(
        &self,
        filter: &RemoteLogFilter,
        first: Option<usize>,
        skip: Option<usize>,
    ) -> Result<Vec<FetchedLog>> {
        let query = format!(
            "query Logs($where: LogEntryFilter, $first: Int, $skip: Int) {{ \
             logEntries(where: $where, first: $first, skip: $skip) {{ {LOG_FIELDS} }} }}"
        );
        let variables = json!({ "where": filter, "first": first, "skip": skip });
        let entries: Option<Vec<FetchedLog>> =
            self.query(&query, variables, "logEntries").await?;
        Ok(entries.unwrap_or_default())
    }

    pub async fn log_entry(&self, id: u64) -> Result<Option<FetchedLog>> {
        let query = format!("query Log($id: String!) {{ logEntry(id: $id) {{ {LOG_FIELDS} }} }}");
        self.query(&query, json!({ "id": id.to_string() }), "logEntry")
            .await
    }

    pub async fn user(&self, address: &Address) -> Result<Option<RemoteUser>> {
        let query = "query User($address: String!) { user(address: $address) { \
                     address totalLogs activeLogs updatesMade } }";
        self.query(query, json!({ "address": address }), "user").await
    }

    pub async fn global_stats(&self) -> Result<RemoteGlobalStats> {
        let query = "{ globalStats { totalLogs activeLogs totalUsers totalCategories \
                     totalUpdates totalBatches } }";
        self.query(query, json!({}), "globalStats").await
    }

    pub async fn indexer_status(&self) -> Result<RemoteStatus> {
        let query = "{ indexerStatus(recentFaults: 0) { blockNumber logIndex eventsApplied \
                     eventsSkipped } }";
        self.query(query, json!({}), "indexerStatus").await
    }
}

fn transport_error(endpoint: &str, err: reqwest::Error) -> IndexError {
    if err.is_timeout() {
        IndexError::Unavailable(format!("{endpoint} timed out: {err}"))
    } else if err.is_decode() {
        IndexError::Query(format!("failed to read response from {endpoint}: {err}"))
    } else {
        IndexError::Unavailable(format!("{endpoint} unreachable: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_endpoint_is_retryable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client =
            IndexClient::new(format!("http://127.0.0.1:{port}/graphql"), Duration::from_secs(2))
                .unwrap();
        let err = client.global_stats().await.unwrap_err();
        assert!(matches!(err, IndexError::Unavailable(_)), "{err:?}");
        assert!(err.is_retryable());
    }

    #[test]
    fn filter_serializes_graphql_names() {
        let filter = RemoteLogFilter {
            creator: Some(Address::parse("0x00000000000000000000000000000000000000a1").unwrap()),
            level: Some(Severity::Warn),
            ..RemoteLogFilter::default()
        };
        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(value["level"], "WARN");
        assert_eq!(
            value["creator"],
            "0x00000000000000000000000000000000000000a1"
        );
        assert!(value.get("category").is_none());
    }
}
