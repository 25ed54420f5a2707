use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::processor::{Processor, ProcessorRun};

pub const CONVERT_JSON_TYPE: &str = "convert-json";

/// Progress is reported every this many items.
const STATUS_EVERY: usize = 1_000;

/// Writes the parent's items as one JSON array.
pub struct ConvertJson;

#[async_trait]
impl Processor for ConvertJson {
    fn processor_type(&self) -> &'static str {
        CONVERT_JSON_TYPE
    }

    fn extension(&self) -> &'static str {
        "json"
    }

    async fn process(&self, run: &mut ProcessorRun<'_>) -> Result<()> {
        let source = run.source();

        // First pass only counts, so progress can be reported against a total.
        run.update_status("Counting items")?;
        let mut total = 0;
        for item in source.iter()? {
            item?;
            total += 1;
        }

        run.update_status("Converting items")?;
        let path = run.result_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        out.write_all(b"[")?;
        let mut converted = 0;
        for item in source.iter()? {
            let item = item?;
            if converted > 0 {
                out.write_all(b",")?;
            }
            serde_json::to_writer(&mut out, &item)?;
            converted += 1;
            if converted % STATUS_EVERY == 0 {
                run.update_status(&format!("Converted {converted}/{total} items"))?;
            }
        }
        out.write_all(b"]")?;
        out.flush()?;

        run.update_status("Finished.")?;
        run.finish(converted)
    }
}
