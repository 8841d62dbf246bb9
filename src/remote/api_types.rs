//! Serde types matching Firestore REST payloads.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping `Vehicle` focused on application needs.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use crate::vehicle::{Vehicle, VehiclePatch, VehicleStatus};

/// Field carrying the server-side ordering token.
pub const ORDER_FIELD: &str = "syncTimestamp";

// ============================================================================
// Documents and values
// ============================================================================

/// A Firestore typed value. Only the kinds this collection uses are modelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApiValue {
  NullValue(Option<String>),
  BooleanValue(bool),
  IntegerValue(String),
  DoubleValue(f64),
  TimestampValue(String),
  StringValue(String),
}

impl ApiValue {
  fn string(s: &str) -> Self {
    ApiValue::StringValue(s.to_string())
  }

  fn timestamp(dt: DateTime<Utc>) -> Self {
    ApiValue::TimestampValue(dt.to_rfc3339_opts(SecondsFormat::Micros, true))
  }

  fn optional_timestamp(dt: Option<DateTime<Utc>>) -> Self {
    match dt {
      Some(dt) => ApiValue::timestamp(dt),
      None => ApiValue::NullValue(None),
    }
  }

  fn as_str(&self) -> Option<&str> {
    match self {
      ApiValue::StringValue(s) => Some(s),
      _ => None,
    }
  }

  fn as_timestamp(&self) -> Result<Option<DateTime<Utc>>, String> {
    match self {
      ApiValue::NullValue(_) => Ok(None),
      ApiValue::TimestampValue(s) | ApiValue::StringValue(s) => parse_timestamp(s).map(Some),
      other => Err(format!("expected timestamp, got {:?}", other)),
    }
  }
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| format!("invalid timestamp {:?}: {}", s, e))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDocument {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default)]
  pub fields: BTreeMap<String, ApiValue>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub create_time: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub update_time: Option<String>,
}

impl ApiDocument {
  pub fn from_fields(fields: BTreeMap<String, ApiValue>) -> Self {
    Self {
      fields,
      ..Default::default()
    }
  }

  /// Last path segment of the document name.
  pub fn id(&self) -> Option<&str> {
    self
      .name
      .as_deref()
      .and_then(|name| name.rsplit('/').next())
      .filter(|id| !id.is_empty())
  }

  fn text(&self, field: &str) -> String {
    self
      .fields
      .get(field)
      .and_then(ApiValue::as_str)
      .unwrap_or_default()
      .to_string()
  }

  fn timestamp(&self, field: &str) -> Result<Option<DateTime<Utc>>, String> {
    match self.fields.get(field) {
      Some(value) => value.as_timestamp(),
      None => Ok(None),
    }
  }

  /// Convert to a domain record. Fields outside the vehicle schema are ignored.
  pub fn into_vehicle(self) -> Result<Vehicle, String> {
    let id = self
      .id()
      .map(String::from)
      .ok_or_else(|| "document has no name".to_string())?;

    let status = self
      .fields
      .get("status")
      .and_then(ApiValue::as_str)
      .and_then(VehicleStatus::parse)
      .ok_or_else(|| format!("document {} has no valid status", id))?;

    let entered_at = self
      .timestamp("enteredAt")?
      .ok_or_else(|| format!("document {} has no entry time", id))?;

    Ok(Vehicle {
      plate: self.text("plate"),
      model: self.text("model"),
      color: self.text("color"),
      owner: self.text("owner"),
      tag: self.text("tag"),
      notes: self.text("notes"),
      entered_at,
      exited_at: self.timestamp("exitedAt")?,
      status,
      sync_timestamp: self.timestamp(ORDER_FIELD)?,
      id: Some(id),
    })
  }
}

/// Document fields for a full vehicle record. The identifier is not a field.
pub fn vehicle_fields(vehicle: &Vehicle) -> BTreeMap<String, ApiValue> {
  let mut fields = BTreeMap::new();
  fields.insert("plate".to_string(), ApiValue::string(&vehicle.plate));
  fields.insert("model".to_string(), ApiValue::string(&vehicle.model));
  fields.insert("color".to_string(), ApiValue::string(&vehicle.color));
  fields.insert("owner".to_string(), ApiValue::string(&vehicle.owner));
  fields.insert("tag".to_string(), ApiValue::string(&vehicle.tag));
  fields.insert("notes".to_string(), ApiValue::string(&vehicle.notes));
  fields.insert(
    "status".to_string(),
    ApiValue::string(vehicle.status.as_str()),
  );
  fields.insert(
    "enteredAt".to_string(),
    ApiValue::timestamp(vehicle.entered_at),
  );
  fields.insert(
    "exitedAt".to_string(),
    ApiValue::optional_timestamp(vehicle.exited_at),
  );
  if let Some(ts) = vehicle.sync_timestamp {
    fields.insert(ORDER_FIELD.to_string(), ApiValue::timestamp(ts));
  }
  fields
}

/// Document fields touched by a patch, keyed like [`VehiclePatch::field_names`].
pub fn patch_fields(patch: &VehiclePatch) -> BTreeMap<String, ApiValue> {
  let mut fields = BTreeMap::new();
  let text = [
    ("plate", &patch.plate),
    ("model", &patch.model),
    ("color", &patch.color),
    ("owner", &patch.owner),
    ("tag", &patch.tag),
    ("notes", &patch.notes),
  ];
  for (name, value) in text {
    if let Some(value) = value {
      fields.insert(name.to_string(), ApiValue::string(value));
    }
  }
  if let Some(status) = patch.status {
    fields.insert("status".to_string(), ApiValue::string(status.as_str()));
  }
  if let Some(exited_at) = patch.exited_at {
    fields.insert("exitedAt".to_string(), ApiValue::timestamp(exited_at));
  }
  fields
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiListDocumentsResponse {
  #[serde(default)]
  pub documents: Vec<ApiDocument>,
  pub next_page_token: Option<String>,
}

/// One element of a `:runQuery` response array.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRunQueryItem {
  pub document: Option<ApiDocument>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorResponse {
  pub error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
  #[serde(default)]
  pub message: String,
  #[serde(default)]
  pub status: String,
}

// ============================================================================
// Requests
// ============================================================================

/// `structuredQuery` over the collection ordered newest first, optionally
/// bounded on the ordering token.
pub fn structured_query(
  collection: &str,
  range: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> serde_json::Value {
  let mut query = json!({
    "from": [{ "collectionId": collection }],
    "orderBy": [{
      "field": { "fieldPath": ORDER_FIELD },
      "direction": "DESCENDING"
    }]
  });

  if let Some((start, end)) = range {
    let bound = |op: &str, dt: DateTime<Utc>| {
      json!({
        "fieldFilter": {
          "field": { "fieldPath": ORDER_FIELD },
          "op": op,
          "value": ApiValue::timestamp(dt)
        }
      })
    };
    query["where"] = json!({
      "compositeFilter": {
        "op": "AND",
        "filters": [bound("GREATER_THAN_OR_EQUAL", start), bound("LESS_THAN_OR_EQUAL", end)]
      }
    });
  }

  json!({ "structuredQuery": query })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::vehicle::NewVehicle;
  use chrono::TimeZone;

  fn sample() -> Vehicle {
    let mut v = NewVehicle {
      model: "CIVIC".to_string(),
      color: "WHITE".to_string(),
      owner: "MARIA".to_string(),
      tag: "07".to_string(),
      entered_at: Some(Utc.with_ymd_and_hms(2024, 5, 10, 9, 15, 0).unwrap()),
      ..NewVehicle::new("ABC-1234")
    }
    .into_vehicle(None);
    v.sync_timestamp = Some(Utc.with_ymd_and_hms(2024, 5, 10, 9, 15, 1).unwrap());
    v
  }

  #[test]
  fn test_value_wire_format() {
    let json = serde_json::to_value(ApiValue::string("x")).unwrap();
    assert_eq!(json, json!({ "stringValue": "x" }));
    let null = serde_json::to_value(ApiValue::NullValue(None)).unwrap();
    assert_eq!(null, json!({ "nullValue": null }));
  }

  #[test]
  fn test_document_to_vehicle() {
    let vehicle = sample();
    let mut doc = ApiDocument::from_fields(vehicle_fields(&vehicle));
    doc.name = Some("projects/p/databases/(default)/documents/vehicles/Xk29".to_string());
    doc
      .fields
      .insert("legacy".to_string(), ApiValue::BooleanValue(true));

    let parsed = doc.into_vehicle().unwrap();
    assert_eq!(parsed.id.as_deref(), Some("Xk29"));
    assert_eq!(parsed.for_remote_create(), vehicle.for_remote_create());
    assert_eq!(parsed.sync_timestamp, vehicle.sync_timestamp);
  }

  #[test]
  fn test_document_from_response_json() {
    let raw = r#"{
      "name": "projects/p/databases/(default)/documents/vehicles/abc",
      "fields": {
        "plate": { "stringValue": "XYZ-9876" },
        "status": { "stringValue": "EXITED" },
        "enteredAt": { "timestampValue": "2024-05-10T09:15:00Z" },
        "exitedAt": { "timestampValue": "2024-05-10T11:00:00.123456Z" },
        "syncTimestamp": { "timestampValue": "2024-05-10T09:15:01Z" }
      },
      "createTime": "2024-05-10T09:15:01.000001Z"
    }"#;
    let doc: ApiDocument = serde_json::from_str(raw).unwrap();
    let v = doc.into_vehicle().unwrap();
    assert_eq!(v.plate, "XYZ-9876");
    assert_eq!(v.status, VehicleStatus::Exited);
    assert!(v.exited_at.is_some());
    assert_eq!(v.model, "");
  }

  #[test]
  fn test_document_without_status_is_rejected() {
    let mut doc = ApiDocument::from_fields(BTreeMap::new());
    doc.name = Some("a/b/vehicles/abc".to_string());
    assert!(doc.into_vehicle().is_err());
  }

  #[test]
  fn test_patch_fields_match_field_names() {
    let patch = VehiclePatch {
      notes: Some("keys at desk".to_string()),
      ..VehiclePatch::exit(Utc::now())
    };
    let fields = patch_fields(&patch);
    let mut names: Vec<&str> = fields.keys().map(String::as_str).collect();
    let mut expected = patch.field_names();
    names.sort_unstable();
    expected.sort_unstable();
    assert_eq!(names, expected);
  }

  #[test]
  fn test_structured_query_range() {
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 5, 31, 23, 59, 59).unwrap();
    let body = structured_query("vehicles", Some((start, end)));
    let query = &body["structuredQuery"];
    assert_eq!(query["from"][0]["collectionId"], "vehicles");
    assert_eq!(query["orderBy"][0]["direction"], "DESCENDING");
    assert_eq!(query["where"]["compositeFilter"]["filters"].as_array().unwrap().len(), 2);

    let unbounded = structured_query("vehicles", None);
    assert!(unbounded["structuredQuery"].get("where").is_none());
  }
}
