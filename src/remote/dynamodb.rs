//! DynamoDB implementation of [`RemoteTable`].
//!
//! The table is provisioned outside this crate and must have:
//! - string keys `pk` (partition) and `sk` (sort)
//! - native TTL enabled on the numeric `ttl` attribute
//! - a global secondary index (`RemoteConfig::expiry_index`) with `entityType` as
//!   partition key and `ttl` as sort key, which serves [`ScanFilter::ExpiredBefore`]

use super::error_code::{RemoteError, RemoteErrorCode};
use super::keys::{self, attr};
use super::table::{
    Condition, Item, ItemKey, Page, QueryRequest, RemoteTable, ScanFilter, ScanRequest,
    SortKeyFilter, MAX_BATCH_SIZE,
};
use super::RemoteConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{AttributeValue, DeleteRequest, WriteRequest};
use aws_sdk_dynamodb::Client;
use serde_json::{Number, Value};
use std::collections::HashMap;
use tracing::{debug, info};

const PK: &str = "pk";
const SK: &str = "sk";
const TTL: &str = "ttl";

type Attributes = HashMap<String, AttributeValue>;

pub struct DynamoDbTable {
    client: Client,
    table: String,
    expiry_index: String,
}

impl DynamoDbTable {
    pub fn new(client: Client, config: &RemoteConfig) -> Self {
        Self {
            client,
            table: config.table_name.clone(),
            expiry_index: config.expiry_index.clone(),
        }
    }

    /// Build a client from the default credential chain, honouring `region` and
    /// `endpoint` (for DynamoDB Local or a VPC endpoint).
    pub async fn connect(config: &RemoteConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.as_str());
        }
        let shared = loader.load().await;
        info!(
            table = %config.table_name,
            region = shared.region().map(|r| r.as_ref()).unwrap_or("unset"),
            "dynamodb client ready"
        );
        Self::new(Client::new(&shared), config)
    }

    async fn expired(&self, pk_prefix: &str, ttl_secs: i64) -> Result<Page> {
        let Some(entity) = keys::entity_for_prefix(pk_prefix) else {
            debug!(pk_prefix, "no expiry index partition for prefix, scanning");
            return self.filtered_scan(pk_prefix, Some(ttl_secs), None, None).await;
        };

        let mut expr = Expression::default();
        let entity_name = expr.name(attr::ENTITY);
        let entity_value = expr.value(AttributeValue::S(entity.to_string()));
        let ttl_name = expr.name(TTL);
        let ttl_value = expr.value(AttributeValue::N(ttl_secs.to_string()));
        let pk_name = expr.name(PK);
        let prefix_value = expr.value(AttributeValue::S(pk_prefix.to_string()));
        let key_condition = format!("{entity_name} = {entity_value} AND {ttl_name} <= {ttl_value}");
        let filter = format!("begins_with({pk_name}, {prefix_value})");
        let (names, values) = expr.into_parts();

        // Index continuation keys carry index attributes an `ItemKey` cannot hold,
        // so the whole result is drained here and returned as one page.
        let mut items = Vec::new();
        let mut start: Option<Attributes> = None;
        loop {
            let output = self
                .client
                .query()
                .table_name(&self.table)
                .index_name(&self.expiry_index)
                .key_condition_expression(key_condition.as_str())
                .filter_expression(filter.as_str())
                .set_expression_attribute_names(names.clone())
                .set_expression_attribute_values(values.clone())
                .set_exclusive_start_key(start.take())
                .send()
                .await
                .map_err(|e| remote_error("query", e))?;
            for attributes in output.items() {
                items.push(from_attributes(attributes)?);
            }
            match output.last_evaluated_key() {
                Some(last) => start = Some(last.clone()),
                None => break,
            }
        }
        Ok(Page {
            items,
            last_key: None,
        })
    }

    async fn filtered_scan(
        &self,
        pk_prefix: &str,
        ttl_secs: Option<i64>,
        limit: Option<usize>,
        start_after: Option<&ItemKey>,
    ) -> Result<Page> {
        let mut expr = Expression::default();
        let pk_name = expr.name(PK);
        let prefix_value = expr.value(AttributeValue::S(pk_prefix.to_string()));
        let mut filter = format!("begins_with({pk_name}, {prefix_value})");
        if let Some(ttl_secs) = ttl_secs {
            let ttl_name = expr.name(TTL);
            let ttl_value = expr.value(AttributeValue::N(ttl_secs.to_string()));
            filter.push_str(&format!(" AND {ttl_name} <= {ttl_value}"));
        }
        let (names, values) = expr.into_parts();
        let output = self
            .client
            .scan()
            .table_name(&self.table)
            .filter_expression(filter)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values)
            .consistent_read(true)
            .set_limit(limit.map(page_limit))
            .set_exclusive_start_key(start_after.map(key_attributes))
            .send()
            .await
            .map_err(|e| remote_error("scan", e))?;
        page(output.items(), output.last_evaluated_key())
    }
}

#[async_trait]
impl RemoteTable for DynamoDbTable {
    async fn get_item(&self, key: &ItemKey) -> Result<Option<Item>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .set_key(Some(key_attributes(key)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| remote_error("get_item", e))?;
        output.item().map(from_attributes).transpose()
    }

    async fn put_item(&self, item: &Item, condition: Option<&Condition>) -> Result<()> {
        let mut request = self
            .client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(to_attributes(item)));
        if let Some(condition) = condition {
            let mut expr = Expression::default();
            let rendered = expr.condition(condition);
            let (names, values) = expr.into_parts();
            request = request
                .condition_expression(rendered)
                .set_expression_attribute_names(names)
                .set_expression_attribute_values(values);
        }
        request
            .send()
            .await
            .map_err(|e| remote_error("put_item", e))?;
        Ok(())
    }

    async fn delete_item(&self, key: &ItemKey, condition: Option<&Condition>) -> Result<()> {
        let mut request = self
            .client
            .delete_item()
            .table_name(&self.table)
            .set_key(Some(key_attributes(key)));
        if let Some(condition) = condition {
            let mut expr = Expression::default();
            let rendered = expr.condition(condition);
            let (names, values) = expr.into_parts();
            request = request
                .condition_expression(rendered)
                .set_expression_attribute_names(names)
                .set_expression_attribute_values(values);
        }
        request
            .send()
            .await
            .map_err(|e| remote_error("delete_item", e))?;
        Ok(())
    }

    async fn query(&self, request: &QueryRequest) -> Result<Page> {
        let mut expr = Expression::default();
        let pk_name = expr.name(PK);
        let pk_value = expr.value(AttributeValue::S(request.pk.clone()));
        let mut key_condition = format!("{pk_name} = {pk_value}");
        match &request.sk {
            SortKeyFilter::Any => {}
            SortKeyFilter::BeginsWith(prefix) => {
                let sk_name = expr.name(SK);
                let prefix = expr.value(AttributeValue::S(prefix.clone()));
                key_condition.push_str(&format!(" AND begins_with({sk_name}, {prefix})"));
            }
            SortKeyFilter::Between(low, high) => {
                let sk_name = expr.name(SK);
                let low = expr.value(AttributeValue::S(low.clone()));
                let high = expr.value(AttributeValue::S(high.clone()));
                key_condition.push_str(&format!(" AND {sk_name} BETWEEN {low} AND {high}"));
            }
        }
        let (names, values) = expr.into_parts();
        let output = self
            .client
            .query()
            .table_name(&self.table)
            .key_condition_expression(key_condition)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values)
            .scan_index_forward(request.ascending)
            .consistent_read(true)
            .set_limit(request.limit.map(page_limit))
            .set_exclusive_start_key(request.start_after.as_ref().map(key_attributes))
            .send()
            .await
            .map_err(|e| remote_error("query", e))?;
        page(output.items(), output.last_evaluated_key())
    }

    async fn scan(&self, request: &ScanRequest) -> Result<Page> {
        match &request.filter {
            ScanFilter::PartitionPrefix(prefix) => {
                self.filtered_scan(prefix, None, request.limit, request.start_after.as_ref())
                    .await
            }
            ScanFilter::ExpiredBefore {
                pk_prefix,
                ttl_secs,
            } => self.expired(pk_prefix, *ttl_secs).await,
        }
    }

    async fn batch_delete(&self, keys: &[ItemKey]) -> Result<Vec<ItemKey>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        if keys.len() > MAX_BATCH_SIZE {
            return Err(RemoteError::new(
                RemoteErrorCode::Validation,
                format!("batch of {} exceeds {MAX_BATCH_SIZE} keys", keys.len()),
            )
            .into());
        }
        let requests = keys
            .iter()
            .map(|key| {
                DeleteRequest::builder()
                    .set_key(Some(key_attributes(key)))
                    .build()
                    .map(|delete| WriteRequest::builder().delete_request(delete).build())
                    .map_err(|e| Error::from(RemoteError::new(RemoteErrorCode::Validation, e.to_string())))
            })
            .collect::<Result<Vec<_>>>()?;

        let output = self
            .client
            .batch_write_item()
            .request_items(self.table.clone(), requests)
            .send()
            .await
            .map_err(|e| remote_error("batch_delete", e))?;

        let Some(unprocessed) = output
            .unprocessed_items()
            .and_then(|pending| pending.get(&self.table))
        else {
            return Ok(Vec::new());
        };
        unprocessed
            .iter()
            .filter_map(WriteRequest::delete_request)
            .map(|delete| key_from(delete.key()))
            .collect()
    }

    fn name(&self) -> &'static str {
        "dynamodb"
    }
}

fn remote_error<E, R>(operation: &str, err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = match &err {
        SdkError::TimeoutError(_) => RemoteErrorCode::ConnectionTimeout,
        SdkError::DispatchFailure(failure) if failure.is_timeout() => {
            RemoteErrorCode::ConnectionTimeout
        }
        SdkError::DispatchFailure(_) => RemoteErrorCode::ConnectionReset,
        _ => err
            .as_service_error()
            .and_then(ProvideErrorMetadata::code)
            .map_or(RemoteErrorCode::Unknown, RemoteErrorCode::from_code),
    };
    RemoteError::new(code, format!("{operation}: {}", DisplayErrorContext(&err))).into()
}

fn page_limit(limit: usize) -> i32 {
    i32::try_from(limit).unwrap_or(i32::MAX)
}

fn page(items: &[Attributes], last: Option<&Attributes>) -> Result<Page> {
    Ok(Page {
        items: items.iter().map(from_attributes).collect::<Result<_>>()?,
        last_key: last.map(key_from).transpose()?,
    })
}

fn key_attributes(key: &ItemKey) -> Attributes {
    HashMap::from([
        (PK.to_string(), AttributeValue::S(key.pk.clone())),
        (SK.to_string(), AttributeValue::S(key.sk.clone())),
    ])
}

fn key_from(attributes: &Attributes) -> Result<ItemKey> {
    let part = |name: &str| {
        attributes
            .get(name)
            .and_then(|value| value.as_s().ok())
            .cloned()
            .ok_or_else(|| {
                Error::from(RemoteError::new(
                    RemoteErrorCode::Validation,
                    format!("item is missing string key attribute `{name}`"),
                ))
            })
    };
    Ok(ItemKey::new(part(PK)?, part(SK)?))
}

fn to_attributes(item: &Item) -> Attributes {
    let mut out: Attributes = item
        .attributes
        .iter()
        .map(|(name, value)| (name.clone(), to_attribute(value)))
        .collect();
    out.extend(key_attributes(&item.key));
    if let Some(ttl) = item.ttl {
        out.insert(TTL.to_string(), AttributeValue::N(ttl.to_string()));
    }
    out
}

fn from_attributes(attributes: &Attributes) -> Result<Item> {
    let key = key_from(attributes)?;
    let ttl = attributes
        .get(TTL)
        .and_then(|value| value.as_n().ok())
        .and_then(|n| n.parse::<i64>().ok());
    let attributes = attributes
        .iter()
        .filter(|(name, _)| !matches!(name.as_str(), PK | SK | TTL))
        .map(|(name, value)| (name.clone(), from_attribute(value)))
        .collect();
    Ok(Item {
        key,
        ttl,
        attributes,
    })
}

fn to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(name, value)| (name.clone(), to_attribute(value)))
                .collect(),
        ),
    }
}

fn from_attribute(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => number(n),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::L(items) => Value::Array(items.iter().map(from_attribute).collect()),
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(name, value)| (name.clone(), from_attribute(value)))
                .collect(),
        ),
        AttributeValue::Ss(set) => Value::from(set.clone()),
        AttributeValue::Ns(set) => Value::Array(set.iter().map(|n| number(n)).collect()),
        _ => Value::Null,
    }
}

fn number(n: &str) -> Value {
    n.parse::<i64>()
        .map(Value::from)
        .or_else(|_| {
            n.parse::<f64>()
                .map(|f| Number::from_f64(f).map_or(Value::Null, Value::Number))
        })
        .unwrap_or(Value::Null)
}

/// Placeholder bookkeeping for one DynamoDB expression.
#[derive(Default)]
struct Expression {
    names: HashMap<String, String>,
    values: Attributes,
}

impl Expression {
    fn name(&mut self, attribute: &str) -> String {
        if let Some((placeholder, _)) = self.names.iter().find(|(_, a)| a.as_str() == attribute) {
            return placeholder.clone();
        }
        let placeholder = format!("#n{}", self.names.len());
        self.names.insert(placeholder.clone(), attribute.to_string());
        placeholder
    }

    fn value(&mut self, value: AttributeValue) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.insert(placeholder.clone(), value);
        placeholder
    }

    fn condition(&mut self, condition: &Condition) -> String {
        match condition {
            Condition::NotExists => format!("attribute_not_exists({})", self.name(PK)),
            Condition::Equals(name, value) => {
                let name = self.name(name);
                let value = self.value(to_attribute(value));
                format!("{name} = {value}")
            }
            // A missing attribute never satisfies a comparison.
            Condition::NotEquals(name, value) => {
                let name = self.name(name);
                let value = self.value(to_attribute(value));
                format!("(attribute_exists({name}) AND {name} <> {value})")
            }
            Condition::LessThan(name, bound) => {
                let name = self.name(name);
                let bound = self.value(AttributeValue::N(bound.to_string()));
                format!("{name} < {bound}")
            }
            Condition::Or(all) => self.join(all, " OR ", false),
            Condition::And(all) => self.join(all, " AND ", true),
        }
    }

    fn join(&mut self, all: &[Condition], op: &str, empty: bool) -> String {
        if all.is_empty() {
            let pk = self.name(PK);
            return if empty {
                format!("(attribute_exists({pk}) OR attribute_not_exists({pk}))")
            } else {
                format!("(attribute_exists({pk}) AND attribute_not_exists({pk}))")
            };
        }
        let parts: Vec<String> = all.iter().map(|c| self.condition(c)).collect();
        format!("({})", parts.join(op))
    }

    /// DynamoDB rejects empty placeholder maps, so empty ones become `None`.
    fn into_parts(self) -> (Option<HashMap<String, String>>, Option<Attributes>) {
        (
            (!self.names.is_empty()).then_some(self.names),
            (!self.values.is_empty()).then_some(self.values),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_claim_condition_rendering() {
        let mut expr = Expression::default();
        let rendered = expr.condition(&Condition::Or(vec![
            Condition::NotExists,
            Condition::not_equals("status", "pending"),
            Condition::less_than("createdAt", 42),
        ]));
        assert_eq!(
            rendered,
            "(attribute_not_exists(#n0) OR (attribute_exists(#n1) AND #n1 <> :v0) OR #n2 < :v1)"
        );
        let (names, values) = expr.into_parts();
        let names = names.unwrap();
        assert_eq!(names["#n0"], "pk");
        assert_eq!(names["#n1"], "status");
        assert_eq!(names["#n2"], "createdAt");
        let values = values.unwrap();
        assert_eq!(values[":v0"], AttributeValue::S("pending".into()));
        assert_eq!(values[":v1"], AttributeValue::N("42".into()));
    }

    #[test]
    fn test_empty_expression_has_no_placeholder_maps() {
        assert_eq!(Expression::default().into_parts(), (None, None));
    }

    #[test]
    fn test_item_attributes_round_trip() {
        let item = Item::new(keys::dedupe_job("abc", "j1"))
            .with(attr::STATUS, "completed")
            .with(attr::CREATED_AT, 1_700_000_000_000i64)
            .with("ratio", 0.5)
            .with("nested", json!({"tags": ["a", null, true]}))
            .with_ttl(1_700_000_300);
        let attributes = to_attributes(&item);
        assert_eq!(attributes["pk"], AttributeValue::S("DEDUPE#abc".into()));
        assert_eq!(attributes["ttl"], AttributeValue::N("1700000300".into()));
        assert_eq!(from_attributes(&attributes).unwrap(), item);
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let attributes = HashMap::from([(PK.to_string(), AttributeValue::S("CACHE#a".into()))]);
        let err = from_attributes(&attributes).unwrap_err();
        assert_eq!(err.remote_code(), Some(RemoteErrorCode::Validation));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(number("12"), json!(12));
        assert_eq!(number("1.25"), json!(1.25));
        assert_eq!(number("nope"), Value::Null);
    }
}
