use futures::stream::{self, StreamExt};
use shared::{BatchItemResult, BatchSummary, ClassificationResponse, PlumCategory};
use std::collections::BTreeMap;
use std::future::Future;

use super::validator::UploadedImage;
use crate::error::ClassifyError;

/// Order-independent running totals for a batch. Any split of the items,
/// folded in any order and merged, gives the same summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryAccumulator {
    total: usize,
    succeeded: usize,
    failed: usize,
    distribution: BTreeMap<PlumCategory, usize>,
    confidence_sum: f64,
}

impl SummaryAccumulator {
    pub fn record(&mut self, item: &BatchItemResult) {
        self.total += 1;
        match &item.result {
            Some(result) => {
                self.succeeded += 1;
                *self.distribution.entry(result.class_name).or_insert(0) += 1;
                self.confidence_sum += f64::from(result.confidence);
            }
            None => self.failed += 1,
        }
    }

    pub fn merge(mut self, other: SummaryAccumulator) -> SummaryAccumulator {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.confidence_sum += other.confidence_sum;
        for (category, count) in other.distribution {
            *self.distribution.entry(category).or_insert(0) += count;
        }
        self
    }

    pub fn finish(self) -> BatchSummary {
        let mean_confidence = if self.succeeded == 0 {
            None
        } else {
            Some((self.confidence_sum / self.succeeded as f64) as f32)
        };
        BatchSummary {
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
            class_distribution: self.distribution,
            mean_confidence,
        }
    }
}

impl<'a> FromIterator<&'a BatchItemResult> for SummaryAccumulator {
    fn from_iter<I: IntoIterator<Item = &'a BatchItemResult>>(iter: I) -> Self {
        iter.into_iter().fold(Self::default(), |mut acc, item| {
            acc.record(item);
            acc
        })
    }
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub results: Vec<BatchItemResult>,
    pub summary: BatchSummary,
}

/// Runs every image of a batch through the same per-image pipeline. One
/// image failing never stops the others; results keep the input order.
/// At most `concurrency` images are in flight at once.
#[derive(Debug, Clone)]
pub struct BatchOrchestrator {
    max_images: usize,
    concurrency: usize,
}

impl BatchOrchestrator {
    pub fn new(max_images: usize, concurrency: usize) -> Self {
        Self {
            max_images,
            concurrency: concurrency.max(1),
        }
    }

    pub fn max_images(&self) -> usize {
        self.max_images
    }

    pub async fn run<F, Fut>(
        &self,
        uploads: Vec<UploadedImage>,
        process: F,
    ) -> Result<BatchOutcome, ClassifyError>
    where
        F: Fn(UploadedImage) -> Fut,
        Fut: Future<Output = Result<ClassificationResponse, ClassifyError>>,
    {
        if uploads.is_empty() {
            return Err(ClassifyError::bad_field(
                "images",
                "at least one image is required",
            ));
        }
        if uploads.len() > self.max_images {
            return Err(ClassifyError::bad_field(
                "images",
                format!("at most {} images per batch", self.max_images),
            ));
        }

        let process = &process;
        let items = uploads.into_iter().enumerate().map(|(index, upload)| {
            let file_name = upload.file_name.clone();
            async move {
                let pending = process(upload);
                match pending.await {
                    Ok(result) => BatchItemResult {
                        index,
                        file_name,
                        result: Some(result),
                        error: None,
                    },
                    Err(e) => {
                        log::warn!(
                            "Batch item {} ({}) failed: {}",
                            index,
                            file_name.as_deref().unwrap_or("unnamed"),
                            e
                        );
                        BatchItemResult {
                            index,
                            file_name,
                            result: None,
                            error: Some(e.to_item_error()),
                        }
                    }
                }
            }
        });
        let results: Vec<BatchItemResult> = stream::iter(items)
            .buffered(self.concurrency)
            .collect()
            .await;

        let summary = results.iter().collect::<SummaryAccumulator>().finish();
        log::info!(
            "Batch processed: {} succeeded, {} failed of {}",
            summary.succeeded,
            summary.failed,
            summary.total
        );
        Ok(BatchOutcome { results, summary })
    }
}
