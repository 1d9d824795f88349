use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::{AttributeValue, Put, ReturnValue, TransactWriteItem, Update};
use chrono::{DateTime, Utc};
use shared::{Annotation, PlumCategory};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use uuid::Uuid;

use super::models::{BatchRecord, ClassificationRecord};
use super::repository::{RepositoryError, ResultRepository};

type Item = HashMap<String, AttributeValue>;

#[derive(Clone)]
pub struct DynamoDbRepository {
    client: Client,
    results_table: String,
    batches_table: String,
}

impl DynamoDbRepository {
    pub fn new(client: Client, results_table: String, batches_table: String) -> Self {
        Self {
            client,
            results_table,
            batches_table,
        }
    }

    fn key_of(id: Uuid) -> Item {
        let mut key = HashMap::new();
        key.insert("id".to_string(), AttributeValue::S(id.to_string()));
        key
    }

    fn batch_increment(&self, record: &ClassificationRecord, batch_id: Uuid) -> Result<Update, RepositoryError> {
        Update::builder()
            .table_name(&self.batches_table)
            .set_key(Some(Self::key_of(batch_id)))
            .update_expression("ADD success_count :one, #category :one")
            .condition_expression("attribute_exists(id)")
            .expression_attribute_names("#category", category_attribute(record.class_name))
            .expression_attribute_values(":one", AttributeValue::N("1".to_string()))
            .build()
            .map_err(|e| RepositoryError::DynamoDb(e.to_string()))
    }
}

#[async_trait]
impl ResultRepository for DynamoDbRepository {
    async fn insert_result(&self, record: &ClassificationRecord) -> Result<(), RepositoryError> {
        let put = Put::builder()
            .table_name(&self.results_table)
            .set_item(Some(record_to_item(record)))
            .condition_expression("attribute_not_exists(id)")
            .build()
            .map_err(|e| RepositoryError::DynamoDb(e.to_string()))?;

        let mut request = self
            .client
            .transact_write_items()
            .transact_items(TransactWriteItem::builder().put(put).build());
        if let Some(batch_id) = record.batch_id {
            let update = self.batch_increment(record, batch_id)?;
            request = request.transact_items(TransactWriteItem::builder().update(update).build());
        }

        match request.send().await {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Some(TransactWriteItemsError::TransactionCanceledException(cancelled)) =
                    e.as_service_error()
                {
                    let failed: Vec<usize> = cancelled
                        .cancellation_reasons()
                        .iter()
                        .enumerate()
                        .filter(|(_, r)| r.code() == Some("ConditionalCheckFailed"))
                        .map(|(i, _)| i)
                        .collect();
                    if failed.contains(&1) {
                        return Err(RepositoryError::NotFound);
                    }
                    if failed.contains(&0) {
                        return Err(RepositoryError::Conflict(format!(
                            "result {} already exists",
                            record.id
                        )));
                    }
                }
                log::error!(
                    "DynamoDB transact_write_items failed for result {}: {:?}",
                    record.id,
                    e
                );
                Err(RepositoryError::DynamoDb(e.to_string()))
            }
        }
    }

    async fn record_batch_failures(
        &self,
        batch_id: Uuid,
        failures: u64,
    ) -> Result<(), RepositoryError> {
        let result = self
            .client
            .update_item()
            .table_name(&self.batches_table)
            .set_key(Some(Self::key_of(batch_id)))
            .update_expression("ADD error_count :n")
            .condition_expression("attribute_exists(id)")
            .expression_attribute_values(":n", AttributeValue::N(failures.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception())
                {
                    return Err(RepositoryError::NotFound);
                }
                Err(RepositoryError::DynamoDb(e.to_string()))
            }
        }
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<ClassificationRecord>, RepositoryError> {
        let result = self
            .client
            .get_item()
            .table_name(&self.results_table)
            .set_key(Some(Self::key_of(id)))
            .send()
            .await
            .map_err(|e| RepositoryError::DynamoDb(e.to_string()))?;

        match result.item {
            Some(item) => Ok(Some(parse_record_from_item(&item)?)),
            None => Ok(None),
        }
    }

    async fn annotate_result(
        &self,
        id: Uuid,
        annotation: &Annotation,
    ) -> Result<ClassificationRecord, RepositoryError> {
        let result = self
            .client
            .update_item()
            .table_name(&self.results_table)
            .set_key(Some(Self::key_of(id)))
            .update_expression("SET annotation = :annotation")
            .condition_expression("attribute_exists(id)")
            .expression_attribute_values(":annotation", annotation_to_attribute(annotation))
            .return_values(ReturnValue::AllNew)
            .send()
            .await;

        match result {
            Ok(output) => match output.attributes {
                Some(item) => parse_record_from_item(&item),
                None => Err(RepositoryError::NotFound),
            },
            Err(e) => {
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception())
                {
                    return Err(RepositoryError::NotFound);
                }
                log::error!("DynamoDB update_item failed for result {}: {:?}", id, e);
                Err(RepositoryError::DynamoDb(e.to_string()))
            }
        }
    }

    async fn list_results_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ClassificationRecord>, RepositoryError> {
        let mut records = Vec::new();
        let mut start_key: Option<Item> = None;
        loop {
            let page = self
                .client
                .scan()
                .table_name(&self.results_table)
                .filter_expression("user_id = :user_id")
                .expression_attribute_values(":user_id", AttributeValue::S(user_id.to_string()))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| RepositoryError::DynamoDb(e.to_string()))?;

            for item in page.items() {
                records.push(parse_record_from_item(item)?);
            }
            match page.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn create_batch(&self, batch: &BatchRecord) -> Result<(), RepositoryError> {
        log::info!("Creating batch {} for farm {}", batch.id, batch.farm_id);

        let result = self
            .client
            .put_item()
            .table_name(&self.batches_table)
            .set_item(Some(batch_to_item(batch)))
            .condition_expression("attribute_not_exists(id)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception())
                {
                    return Err(RepositoryError::Conflict(format!(
                        "batch {} already exists",
                        batch.id
                    )));
                }
                log::error!("DynamoDB put_item failed for batch {}: {:?}", batch.id, e);
                Err(RepositoryError::DynamoDb(e.to_string()))
            }
        }
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<BatchRecord>, RepositoryError> {
        let result = self
            .client
            .get_item()
            .table_name(&self.batches_table)
            .set_key(Some(Self::key_of(id)))
            .send()
            .await
            .map_err(|e| RepositoryError::DynamoDb(e.to_string()))?;

        match result.item {
            Some(item) => Ok(Some(parse_batch_from_item(&item)?)),
            None => Ok(None),
        }
    }
}

fn category_attribute(category: PlumCategory) -> String {
    format!("count_{}", category)
}

fn record_to_item(record: &ClassificationRecord) -> Item {
    let mut item = HashMap::new();
    item.insert("id".to_string(), AttributeValue::S(record.id.to_string()));
    item.insert(
        "user_id".to_string(),
        AttributeValue::S(record.user_id.to_string()),
    );
    item.insert(
        "image_key".to_string(),
        AttributeValue::S(record.image_key.clone()),
    );
    item.insert(
        "image_path".to_string(),
        AttributeValue::S(record.image_path.clone()),
    );
    item.insert(
        "class_name".to_string(),
        AttributeValue::S(record.class_name.to_string()),
    );
    item.insert(
        "confidence".to_string(),
        AttributeValue::N(record.confidence.to_string()),
    );
    item.insert("is_plum".to_string(), AttributeValue::Bool(record.is_plum));
    item.insert(
        "low_confidence".to_string(),
        AttributeValue::Bool(record.low_confidence),
    );
    item.insert(
        "probabilities".to_string(),
        AttributeValue::M(
            record
                .probabilities
                .iter()
                .map(|(c, p)| (c.to_string(), AttributeValue::N(p.to_string())))
                .collect(),
        ),
    );
    item.insert(
        "processing_time_ms".to_string(),
        AttributeValue::N(record.processing_time_ms.to_string()),
    );
    item.insert("tta_used".to_string(), AttributeValue::Bool(record.tta_used));
    item.insert(
        "model_version".to_string(),
        AttributeValue::S(record.model_version.clone()),
    );
    if let Some(farm_id) = record.farm_id {
        item.insert("farm_id".to_string(), AttributeValue::S(farm_id.to_string()));
    }
    if let Some(batch_id) = record.batch_id {
        item.insert(
            "batch_id".to_string(),
            AttributeValue::S(batch_id.to_string()),
        );
    }
    item.insert(
        "created_at".to_string(),
        AttributeValue::S(record.created_at.to_rfc3339()),
    );
    if let Some(annotation) = &record.annotation {
        item.insert("annotation".to_string(), annotation_to_attribute(annotation));
    }
    item
}

fn annotation_to_attribute(annotation: &Annotation) -> AttributeValue {
    let mut map = HashMap::new();
    if let Some(ground_truth) = annotation.ground_truth {
        map.insert(
            "ground_truth".to_string(),
            AttributeValue::S(ground_truth.to_string()),
        );
    }
    if let Some(notes) = &annotation.notes {
        map.insert("notes".to_string(), AttributeValue::S(notes.clone()));
    }
    if let Some(location) = &annotation.location {
        map.insert("location".to_string(), AttributeValue::S(location.clone()));
    }
    map.insert(
        "corrected_by".to_string(),
        AttributeValue::S(annotation.corrected_by.to_string()),
    );
    map.insert(
        "corrected_at".to_string(),
        AttributeValue::S(annotation.corrected_at.to_rfc3339()),
    );
    AttributeValue::M(map)
}

fn parse_annotation(item: &Item) -> Result<Option<Annotation>, RepositoryError> {
    let Some(value) = item.get("annotation") else {
        return Ok(None);
    };
    let map = value
        .as_m()
        .map_err(|_| RepositoryError::InvalidData("Invalid annotation".to_string()))?;
    let ground_truth = match map.get("ground_truth").and_then(|v| v.as_s().ok()) {
        Some(s) => Some(PlumCategory::from_str(s).map_err(|_| {
            RepositoryError::InvalidData("Invalid annotation ground_truth".to_string())
        })?),
        None => None,
    };
    let optional_string = |name: &str| map.get(name).and_then(|v| v.as_s().ok()).cloned();

    Ok(Some(Annotation {
        ground_truth,
        notes: optional_string("notes"),
        location: optional_string("location"),
        corrected_by: uuid_attr(map, "corrected_by")?,
        corrected_at: timestamp_attr(map, "corrected_at")?,
    }))
}

fn batch_to_item(batch: &BatchRecord) -> Item {
    let mut item = HashMap::new();
    item.insert("id".to_string(), AttributeValue::S(batch.id.to_string()));
    item.insert(
        "farm_id".to_string(),
        AttributeValue::S(batch.farm_id.to_string()),
    );
    item.insert(
        "user_id".to_string(),
        AttributeValue::S(batch.user_id.to_string()),
    );
    item.insert("name".to_string(), AttributeValue::S(batch.name.clone()));
    item.insert(
        "created_at".to_string(),
        AttributeValue::S(batch.created_at.to_rfc3339()),
    );
    item.insert(
        "success_count".to_string(),
        AttributeValue::N(batch.success_count.to_string()),
    );
    item.insert(
        "error_count".to_string(),
        AttributeValue::N(batch.error_count.to_string()),
    );
    for (category, count) in &batch.class_distribution {
        item.insert(
            category_attribute(*category),
            AttributeValue::N(count.to_string()),
        );
    }
    item
}

fn uuid_attr(item: &Item, name: &str) -> Result<Uuid, RepositoryError> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| RepositoryError::InvalidData(format!("Invalid {}", name)))
}

fn optional_uuid_attr(item: &Item, name: &str) -> Option<Uuid> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn string_attr(item: &Item, name: &str) -> Result<String, RepositoryError> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| RepositoryError::InvalidData(format!("Invalid {}", name)))
}

fn number_attr<T: FromStr>(item: &Item, name: &str) -> Result<T, RepositoryError> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|s| s.parse::<T>().ok())
        .ok_or_else(|| RepositoryError::InvalidData(format!("Invalid {}", name)))
}

fn bool_attr(item: &Item, name: &str) -> Result<bool, RepositoryError> {
    item.get(name)
        .and_then(|v| v.as_bool().ok())
        .copied()
        .ok_or_else(|| RepositoryError::InvalidData(format!("Invalid {}", name)))
}

fn timestamp_attr(item: &Item, name: &str) -> Result<DateTime<Utc>, RepositoryError> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| RepositoryError::InvalidData(format!("Invalid {}", name)))
}

fn parse_record_from_item(item: &Item) -> Result<ClassificationRecord, RepositoryError> {
    let class_name = item
        .get("class_name")
        .and_then(|v| v.as_s().ok())
        .and_then(|s| PlumCategory::from_str(s).ok())
        .ok_or_else(|| RepositoryError::InvalidData("Invalid class_name".to_string()))?;

    let stored = item
        .get("probabilities")
        .and_then(|v| v.as_m().ok())
        .ok_or_else(|| RepositoryError::InvalidData("Invalid probabilities".to_string()))?;
    let mut probabilities = BTreeMap::new();
    for category in PlumCategory::all() {
        let p = stored
            .get(category.as_ref())
            .and_then(|v| v.as_n().ok())
            .and_then(|s| s.parse::<f32>().ok())
            .unwrap_or(0.0);
        probabilities.insert(category, p);
    }

    Ok(ClassificationRecord {
        id: uuid_attr(item, "id")?,
        user_id: uuid_attr(item, "user_id")?,
        image_key: string_attr(item, "image_key")?,
        image_path: string_attr(item, "image_path")?,
        class_name,
        confidence: number_attr(item, "confidence")?,
        is_plum: bool_attr(item, "is_plum")?,
        low_confidence: bool_attr(item, "low_confidence")?,
        probabilities,
        processing_time_ms: number_attr(item, "processing_time_ms")?,
        tta_used: bool_attr(item, "tta_used").unwrap_or(false),
        model_version: string_attr(item, "model_version")?,
        farm_id: optional_uuid_attr(item, "farm_id"),
        batch_id: optional_uuid_attr(item, "batch_id"),
        created_at: timestamp_attr(item, "created_at")?,
        annotation: parse_annotation(item)?,
    })
}

fn parse_batch_from_item(item: &Item) -> Result<BatchRecord, RepositoryError> {
    let mut class_distribution = BTreeMap::new();
    for category in PlumCategory::all() {
        if let Ok(count) = number_attr::<u64>(item, &category_attribute(category)) {
            if count > 0 {
                class_distribution.insert(category, count);
            }
        }
    }

    Ok(BatchRecord {
        id: uuid_attr(item, "id")?,
        farm_id: uuid_attr(item, "farm_id")?,
        user_id: uuid_attr(item, "user_id")?,
        name: string_attr(item, "name")?,
        created_at: timestamp_attr(item, "created_at")?,
        success_count: number_attr(item, "success_count").unwrap_or(0),
        error_count: number_attr(item, "error_count").unwrap_or(0),
        class_distribution,
    })
}
