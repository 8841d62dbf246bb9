//! Remote store backed by the Firestore REST API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use super::api_types::{
  patch_fields, structured_query, vehicle_fields, ApiDocument, ApiErrorResponse,
  ApiListDocumentsResponse, ApiRunQueryItem, ApiValue, ORDER_FIELD,
};
use super::{Created, RemoteError, RemoteResult, RemoteStore, SnapshotReceiver};
use crate::config::RemoteConfig;
use crate::vehicle::{Vehicle, VehiclePatch};

const LIST_PAGE_SIZE: u32 = 300;

/// Firestore REST client for the vehicle collection.
#[derive(Clone)]
pub struct FirestoreStore {
  http: reqwest::Client,
  /// `.../projects/{project}/databases/(default)/documents`
  documents_url: Url,
  api_key: Option<String>,
  poll_interval: Duration,
}

impl FirestoreStore {
  pub fn new(config: &RemoteConfig, api_key: Option<String>) -> Result<Self> {
    let mut documents_url = Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid remote base_url {}: {}", config.base_url, e))?;

    documents_url
      .path_segments_mut()
      .map_err(|_| eyre!("Remote base_url {} cannot hold a path", config.base_url))?
      .pop_if_empty()
      .extend([
        "projects",
        config.project_id.as_str(),
        "databases",
        "(default)",
        "documents",
      ]);

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      documents_url,
      api_key,
      poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
    })
  }

  fn url_for(&self, segments: &[&str]) -> Url {
    let mut url = self.documents_url.clone();
    // Cannot fail: `new` already appended segments to this URL.
    if let Ok(mut path) = url.path_segments_mut() {
      path.extend(segments);
    }
    url
  }

  fn run_query_url(&self) -> Url {
    let mut url = self.documents_url.clone();
    let path = format!("{}:runQuery", url.path());
    url.set_path(&path);
    url
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.api_key {
      Some(key) => request.query(&[("key", key)]),
      None => request,
    }
  }

  /// Send a request, turning transport failures and error statuses into
  /// [`RemoteError`]s.
  async fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
    let response = self
      .authorize(request)
      .send()
      .await
      .map_err(transport_error)?;

    if response.status().is_success() {
      Ok(response)
    } else {
      Err(status_error(response).await)
    }
  }

  async fn run_query(&self, body: serde_json::Value) -> RemoteResult<Vec<Vehicle>> {
    let response = self
      .send(self.http.post(self.run_query_url()).json(&body))
      .await?;

    let items: Vec<ApiRunQueryItem> = response
      .json()
      .await
      .map_err(|e| RemoteError::Other(format!("Failed to parse query response: {}", e)))?;

    Ok(
      items
        .into_iter()
        .filter_map(|item| item.document)
        .filter_map(|doc| {
          doc
            .into_vehicle()
            .map_err(|e| warn!(error = %e, "Skipping malformed vehicle document"))
            .ok()
        })
        .collect(),
    )
  }

  async fn list_page(
    &self,
    collection: &str,
    page_token: Option<&str>,
  ) -> RemoteResult<ApiListDocumentsResponse> {
    let mut url = self.url_for(&[collection]);
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("pageSize", &LIST_PAGE_SIZE.to_string());
      query.append_pair("mask.fieldPaths", "status");
      if let Some(token) = page_token {
        query.append_pair("pageToken", token);
      }
    }

    self
      .send(self.http.get(url))
      .await?
      .json()
      .await
      .map_err(|e| RemoteError::Other(format!("Failed to parse document list: {}", e)))
  }
}

#[async_trait]
impl RemoteStore for FirestoreStore {
  async fn create(&self, collection: &str, vehicle: &Vehicle) -> RemoteResult<Created> {
    let sync_timestamp = Utc::now();
    let mut fields = vehicle_fields(&vehicle.for_remote_create());
    fields.insert(ORDER_FIELD.to_string(), ApiValue::TimestampValue(sync_timestamp.to_rfc3339()));

    let created: ApiDocument = self
      .send(
        self
          .http
          .post(self.url_for(&[collection]))
          .json(&ApiDocument::from_fields(fields)),
      )
      .await?
      .json()
      .await
      .map_err(|e| RemoteError::Other(format!("Failed to parse created document: {}", e)))?;

    let id = created
      .id()
      .map(String::from)
      .ok_or_else(|| RemoteError::Other("Created document has no name".to_string()))?;

    debug!(%id, plate = %vehicle.plate, "Created remote vehicle");
    Ok(Created { id, sync_timestamp })
  }

  async fn update(&self, collection: &str, id: &str, patch: &VehiclePatch) -> RemoteResult<()> {
    let mut url = self.url_for(&[collection, id]);
    {
      let mut query = url.query_pairs_mut();
      for name in patch.field_names() {
        query.append_pair("updateMask.fieldPaths", name);
      }
      query.append_pair("currentDocument.exists", "true");
    }

    self
      .send(
        self
          .http
          .patch(url)
          .json(&ApiDocument::from_fields(patch_fields(patch))),
      )
      .await?;

    Ok(())
  }

  async fn get(&self, collection: &str, id: &str) -> RemoteResult<Option<Vehicle>> {
    let response = match self.send(self.http.get(self.url_for(&[collection, id]))).await {
      Ok(response) => response,
      Err(RemoteError::NotFound(_)) => return Ok(None),
      Err(e) => return Err(e),
    };

    let document: ApiDocument = response
      .json()
      .await
      .map_err(|e| RemoteError::Other(format!("Failed to parse document {}: {}", id, e)))?;

    document.into_vehicle().map(Some).map_err(RemoteError::Other)
  }

  async fn delete(&self, collection: &str, id: &str) -> RemoteResult<()> {
    self
      .send(self.http.delete(self.url_for(&[collection, id])))
      .await?;
    Ok(())
  }

  async fn delete_all(&self, collection: &str) -> RemoteResult<()> {
    let mut ids = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
      let page = self.list_page(collection, page_token.as_deref()).await?;
      ids.extend(page.documents.iter().filter_map(|d| d.id().map(String::from)));

      match page.next_page_token {
        Some(token) if !token.is_empty() => page_token = Some(token),
        _ => break,
      }
    }

    for id in &ids {
      match self.delete(collection, id).await {
        Ok(()) | Err(RemoteError::NotFound(_)) => {}
        Err(e) => return Err(e),
      }
    }

    debug!(count = ids.len(), collection, "Deleted remote collection");
    Ok(())
  }

  async fn query_range(
    &self,
    collection: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> RemoteResult<Vec<Vehicle>> {
    self
      .run_query(structured_query(collection, Some((start, end))))
      .await
  }

  fn watch(&self, collection: &str) -> SnapshotReceiver {
    let (tx, rx) = mpsc::unbounded_channel();
    let store = self.clone();
    let body = structured_query(collection, None);

    // Firestore's REST surface has no listen stream, so poll and push the
    // full set whenever it changes.
    tokio::spawn(async move {
      let mut last: Option<Vec<Vehicle>> = None;
      let mut ticker = tokio::time::interval(store.poll_interval);
      loop {
        ticker.tick().await;
        if tx.is_closed() {
          break;
        }

        match store.run_query(body.clone()).await {
          Ok(vehicles) => {
            if last.as_ref() == Some(&vehicles) {
              continue;
            }
            if tx.send(Ok(vehicles.clone())).is_err() {
              break;
            }
            last = Some(vehicles);
          }
          Err(e) => {
            let _ = tx.send(Err(e));
            break;
          }
        }
      }
    });

    rx
  }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
  if e.is_connect() || e.is_timeout() || e.is_request() {
    RemoteError::Unavailable(e.to_string())
  } else {
    RemoteError::Other(e.to_string())
  }
}

async fn status_error(response: Response) -> RemoteError {
  let status = response.status();
  let message = response
    .json::<ApiErrorResponse>()
    .await
    .map(|r| format!("{} {}", r.error.status, r.error.message))
    .unwrap_or_else(|_| status.to_string());
  classify_status(status, message)
}

fn classify_status(status: StatusCode, message: String) -> RemoteError {
  match status.as_u16() {
    401 | 403 => RemoteError::PermissionDenied(message),
    404 => RemoteError::NotFound(message),
    408 | 429 | 500..=599 => RemoteError::Unavailable(message),
    _ => RemoteError::Other(message),
  }
}
