//! S3 and DynamoDB clients for [`AwsLibrary`](super::AwsLibrary).
//!
//! Table layout: partition key `library_id` (S), sort key `entry_id` (S).
//! Tags and blob sequences are stored as lists because string sets cannot
//! be empty and lose order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::Duration;

use super::{AwsLibrary, ClientError, EntryItem, EntryTable, ObjectStore, QueryPage, StoredObject};

const THROTTLING_CODES: &[&str] = &[
    "ThrottlingException",
    "SlowDown",
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
];

fn classify<E, R>(err: SdkError<E, R>) -> ClientError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let text = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => ClientError::Transport(text),
        SdkError::ServiceError(ctx) => match ctx.err().code() {
            Some(code) if THROTTLING_CODES.contains(&code) => ClientError::Throttled(text),
            _ => ClientError::Service(text),
        },
        _ => ClientError::Service(text),
    }
}

/// Shared SDK configuration; `endpoint_url` targets local emulators
pub async fn load_sdk_config(region: Option<&str>, endpoint_url: Option<&str>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_string()));
    }
    if let Some(endpoint_url) = endpoint_url {
        loader = loader.endpoint_url(endpoint_url);
    }
    loader.load().await
}

impl AwsLibrary {
    /// Library over real S3 and DynamoDB clients
    pub async fn connect(
        name: impl Into<String>,
        bucket: impl Into<String>,
        table: impl Into<String>,
        region: Option<&str>,
        endpoint_url: Option<&str>,
        entry_ttl_days: i64,
    ) -> Self {
        let sdk_config = load_sdk_config(region, endpoint_url).await;
        let objects = S3ObjectStore::from_sdk_config(&sdk_config, bucket, endpoint_url.is_some());
        let table = DynamoEntryTable::from_sdk_config(&sdk_config, table);
        AwsLibrary::new(name, Arc::new(objects), Arc::new(table))
            .with_entry_ttl(Duration::days(entry_ttl_days))
    }
}

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Emulators generally need path-style addressing
    pub fn from_sdk_config(sdk_config: &SdkConfig, bucket: impl Into<String>, path_style: bool) -> Self {
        let config = aws_sdk_s3::config::Builder::from(sdk_config)
            .force_path_style(path_style)
            .build();
        Self::new(aws_sdk_s3::Client::from_conf(config), bucket)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ClientError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>, ClientError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if err.as_service_error().map_or(false, |e| e.is_no_such_key()) => {
                return Ok(None)
            }
            Err(err) => return Err(classify(err)),
        };

        let content_type = output.content_type().map(str::to_string);
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?
            .into_bytes();

        Ok(Some(StoredObject { body, content_type }))
    }

    async fn head_object(&self, key: &str) -> Result<bool, ClientError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().map_or(false, |e| e.is_not_found()) => Ok(false),
            Err(err) => Err(classify(err)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DynamoEntryTable {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

fn string_list(values: &[String]) -> AttributeValue {
    AttributeValue::L(values.iter().cloned().map(AttributeValue::S).collect())
}

fn to_attribute_map(item: EntryItem) -> HashMap<String, AttributeValue> {
    let attributes = item
        .attributes
        .into_iter()
        .map(|(k, v)| (k, AttributeValue::S(v)))
        .collect();

    HashMap::from([
        ("library_id".to_string(), AttributeValue::S(item.library_id)),
        ("entry_id".to_string(), AttributeValue::S(item.entry_id)),
        ("attributes".to_string(), AttributeValue::M(attributes)),
        ("tags".to_string(), string_list(&item.tags)),
        ("blob_sequence".to_string(), string_list(&item.blob_sequence)),
        (
            "expires_at".to_string(),
            AttributeValue::N(item.expires_at.to_string()),
        ),
    ])
}

fn malformed(field: &str) -> ClientError {
    ClientError::Service(format!("malformed entry item: bad or missing `{}`", field))
}

fn string_field(map: &HashMap<String, AttributeValue>, field: &str) -> Result<String, ClientError> {
    map.get(field)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| malformed(field))
}

fn list_field(map: &HashMap<String, AttributeValue>, field: &str) -> Result<Vec<String>, ClientError> {
    let Some(value) = map.get(field) else {
        return Ok(Vec::new());
    };
    value
        .as_l()
        .map_err(|_| malformed(field))?
        .iter()
        .map(|v| v.as_s().cloned().map_err(|_| malformed(field)))
        .collect()
}

fn from_attribute_map(map: &HashMap<String, AttributeValue>) -> Result<EntryItem, ClientError> {
    let attributes = match map.get("attributes") {
        Some(value) => value
            .as_m()
            .map_err(|_| malformed("attributes"))?
            .iter()
            .map(|(k, v)| {
                v.as_s()
                    .map(|s| (k.clone(), s.clone()))
                    .map_err(|_| malformed("attributes"))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?,
        None => BTreeMap::new(),
    };
    let expires_at = map
        .get("expires_at")
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse::<i64>().ok())
        .unwrap_or_default();

    Ok(EntryItem {
        library_id: string_field(map, "library_id")?,
        entry_id: string_field(map, "entry_id")?,
        attributes,
        tags: list_field(map, "tags")?,
        blob_sequence: list_field(map, "blob_sequence")?,
        expires_at,
    })
}

impl DynamoEntryTable {
    pub fn new(client: aws_sdk_dynamodb::Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    pub fn from_sdk_config(sdk_config: &SdkConfig, table: impl Into<String>) -> Self {
        Self::new(aws_sdk_dynamodb::Client::new(sdk_config), table)
    }
}

#[async_trait]
impl EntryTable for DynamoEntryTable {
    async fn put_item_if_absent(&self, item: EntryItem) -> Result<(), ClientError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(to_attribute_map(item)))
            .condition_expression("attribute_not_exists(entry_id)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .map_or(false, |e| e.is_conditional_check_failed_exception()) =>
            {
                Err(ClientError::ConditionFailed)
            }
            Err(err) => Err(classify(err)),
        }
    }

    async fn get_item(
        &self,
        library_id: &str,
        entry_id: &str,
    ) -> Result<Option<EntryItem>, ClientError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("library_id", AttributeValue::S(library_id.to_string()))
            .key("entry_id", AttributeValue::S(entry_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(classify)?;

        output.item().map(from_attribute_map).transpose()
    }

    async fn query(
        &self,
        library_id: &str,
        exclusive_start: Option<&str>,
        limit: usize,
        descending: bool,
    ) -> Result<QueryPage, ClientError> {
        let start_key = exclusive_start.map(|entry_id| {
            HashMap::from([
                (
                    "library_id".to_string(),
                    AttributeValue::S(library_id.to_string()),
                ),
                (
                    "entry_id".to_string(),
                    AttributeValue::S(entry_id.to_string()),
                ),
            ])
        });

        let output = self
            .client
            .query()
            .table_name(&self.table)
            .key_condition_expression("library_id = :library_id")
            .expression_attribute_values(":library_id", AttributeValue::S(library_id.to_string()))
            .scan_index_forward(!descending)
            .limit(i32::try_from(limit).unwrap_or(i32::MAX))
            .set_exclusive_start_key(start_key)
            .consistent_read(true)
            .send()
            .await
            .map_err(classify)?;

        let items = output
            .items()
            .iter()
            .map(from_attribute_map)
            .collect::<Result<Vec<_>, _>>()?;
        let last_evaluated_key = output
            .last_evaluated_key()
            .and_then(|key| key.get("entry_id"))
            .and_then(|v| v.as_s().ok())
            .cloned();

        Ok(QueryPage {
            items,
            last_evaluated_key,
        })
    }
}
