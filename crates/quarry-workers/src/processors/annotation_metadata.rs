use anyhow::Result;
use async_trait::async_trait;
use chrono::DateTime;
use quarry_datasets::{Annotation, Item, ItemWriter};
use serde_json::Value;

use crate::processor::{Processor, ProcessorRun};

pub const ANNOTATION_METADATA_TYPE: &str = "annotation-metadata";

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Exports who annotated what, and when, for the parent dataset.
pub struct AnnotationMetadata;

#[async_trait]
impl Processor for AnnotationMetadata {
    fn processor_type(&self) -> &'static str {
        ANNOTATION_METADATA_TYPE
    }

    async fn process(&self, run: &mut ProcessorRun<'_>) -> Result<()> {
        let annotations = run.ctx.datasets.annotations(&run.parent.key)?;
        if annotations.is_empty() {
            return run.finish_with_error("No annotations made for this dataset");
        }

        let mut writer = ItemWriter::create(&run.result_path())?;
        for annotation in &annotations {
            writer.write(&metadata_row(annotation))?;
        }
        let rows = writer.finish()?;
        run.finish(rows)
    }
}

fn metadata_row(a: &Annotation) -> Item {
    let mut row = Item::new();
    row.insert("id".into(), Value::from(a.id));
    row.insert("item_id".into(), Value::from(a.item_id.clone()));
    row.insert("label".into(), Value::from(a.label.clone()));
    row.insert("value".into(), Value::from(a.value.clone()));
    row.insert("author".into(), Value::from(a.author.clone()));
    row.insert("by_processor".into(), Value::from(a.by_processor));
    row.insert("timestamp".into(), Value::from(date_string(a.timestamp)));
    row.insert("epoch_timestamp".into(), Value::from(a.timestamp));
    row.insert("timestamp_created".into(), Value::from(date_string(a.timestamp_created)));
    row.insert("epoch_timestamp_created".into(), Value::from(a.timestamp_created));
    row
}

fn date_string(epoch: i64) -> String {
    DateTime::from_timestamp(epoch, 0)
        .map(|dt| dt.format(DATE_FORMAT).to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_carry_both_timestamp_forms() {
        let row = metadata_row(&Annotation {
            id: 3,
            dataset: "d".into(),
            item_id: "t1".into(),
            label: "TOXICITY".into(),
            value: "0.5".into(),
            author: "alice".into(),
            by_processor: true,
            timestamp: 1_700_000_000,
            timestamp_created: 0,
        });
        assert_eq!(row["timestamp"], "2023-11-14 22:13:20");
        assert_eq!(row["epoch_timestamp"], 1_700_000_000);
        assert_eq!(row["timestamp_created"], "1970-01-01 00:00:00");
        assert_eq!(row["epoch_timestamp_created"], 0);
        assert_eq!(row["label"], "TOXICITY");
    }
}
