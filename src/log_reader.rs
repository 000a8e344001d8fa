// Reads extractor batch files (parquet) into raw log events. The extractor
// writes one file per inner block range with binary columns for address,
// topics and data.

use std::fs::File;
use std::path::Path;

use arrow::array::{Array, BinaryArray, Int64Array, LargeBinaryArray, UInt32Array, UInt64Array};
use arrow::record_batch::RecordBatch;
use ethers::types::{Address, H256};
use log::debug;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::error::{Result, WhitelistError};
use crate::types::RawLogEvent;

const TOPIC_COLUMNS: [&str; 4] = ["topic0", "topic1", "topic2", "topic3"];

/// Loads every log event from one batch file, in file order (the extractor
/// writes them ordered by block and log index).
pub fn read_log_events(path: &Path) -> Result<Vec<RawLogEvent>> {
    let file = File::open(path).map_err(|e| {
        WhitelistError::ExtractorFailed(format!("cannot open {}: {e}", path.display()))
    })?;

    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| {
        WhitelistError::DecodeFailed(format!("bad parquet file {}: {e}", path.display()))
    })?;
    let reader = builder.build().map_err(|e| {
        WhitelistError::DecodeFailed(format!("bad parquet file {}: {e}", path.display()))
    })?;

    let mut events = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| {
            WhitelistError::DecodeFailed(format!("error reading {}: {e}", path.display()))
        })?;
        read_batch(&batch, path, &mut events)?;
    }

    debug!(
        "[LogReader] {} events from {}",
        events.len(),
        path.display()
    );
    Ok(events)
}

fn read_batch(batch: &RecordBatch, path: &Path, out: &mut Vec<RawLogEvent>) -> Result<()> {
    let address_col = column(batch, path, "address")?;
    let data_col = column(batch, path, "data")?;
    let block_col = column(batch, path, "block_number")?;

    let topic_cols: Vec<Option<&dyn Array>> = TOPIC_COLUMNS
        .iter()
        .map(|name| batch.column_by_name(name).map(|c| c.as_ref()))
        .collect();

    for row in 0..batch.num_rows() {
        let address_bytes = binary_value(address_col, row).ok_or_else(|| {
            WhitelistError::DecodeFailed(format!("{}: null address at row {row}", path.display()))
        })?;
        if address_bytes.len() != 20 {
            return Err(WhitelistError::DecodeFailed(format!(
                "{}: address at row {row} has {} bytes",
                path.display(),
                address_bytes.len()
            )));
        }

        let mut topics = Vec::with_capacity(4);
        for col in &topic_cols {
            let value = col.and_then(|c| binary_value(c, row));
            match value {
                Some(bytes) if bytes.len() == 32 => topics.push(H256::from_slice(bytes)),
                Some(bytes) => {
                    return Err(WhitelistError::DecodeFailed(format!(
                        "{}: topic at row {row} has {} bytes",
                        path.display(),
                        bytes.len()
                    )))
                }
                // Topics are trailing-null; stop at the first absent one.
                None => break,
            }
        }

        let block_number = integer_value(block_col, row).ok_or_else(|| {
            WhitelistError::DecodeFailed(format!(
                "{}: null block_number at row {row}",
                path.display()
            ))
        })?;

        out.push(RawLogEvent {
            address: Address::from_slice(address_bytes),
            topics,
            data: binary_value(data_col, row).unwrap_or_default().to_vec(),
            block_number,
        });
    }
    Ok(())
}

fn column<'a>(batch: &'a RecordBatch, path: &Path, name: &str) -> Result<&'a dyn Array> {
    batch
        .column_by_name(name)
        .map(|c| c.as_ref())
        .ok_or_else(|| {
            WhitelistError::DecodeFailed(format!(
                "{}: missing column '{name}'",
                path.display()
            ))
        })
}

fn binary_value(array: &dyn Array, row: usize) -> Option<&[u8]> {
    if array.is_null(row) {
        return None;
    }
    if let Some(arr) = array.as_any().downcast_ref::<BinaryArray>() {
        return Some(arr.value(row));
    }
    if let Some(arr) = array.as_any().downcast_ref::<LargeBinaryArray>() {
        return Some(arr.value(row));
    }
    None
}

fn integer_value(array: &dyn Array, row: usize) -> Option<u64> {
    if array.is_null(row) {
        return None;
    }
    if let Some(arr) = array.as_any().downcast_ref::<UInt32Array>() {
        return Some(arr.value(row) as u64);
    }
    if let Some(arr) = array.as_any().downcast_ref::<UInt64Array>() {
        return Some(arr.value(row));
    }
    if let Some(arr) = array.as_any().downcast_ref::<Int64Array>() {
        return u64::try_from(arr.value(row)).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, BinaryBuilder, UInt32Builder};
    use arrow::datatypes::{DataType, Field, Schema};
    use parquet::arrow::ArrowWriter;
    use std::sync::Arc;

    fn write_sample(path: &Path, rows: &[(Vec<u8>, Vec<Option<Vec<u8>>>, Vec<u8>, u32)]) {
        let schema = Arc::new(Schema::new(vec![
            Field::new("address", DataType::Binary, false),
            Field::new("topic0", DataType::Binary, true),
            Field::new("topic1", DataType::Binary, true),
            Field::new("topic2", DataType::Binary, true),
            Field::new("topic3", DataType::Binary, true),
            Field::new("data", DataType::Binary, true),
            Field::new("block_number", DataType::UInt32, false),
        ]));

        let mut address = BinaryBuilder::new();
        let mut topics: Vec<BinaryBuilder> = (0..4).map(|_| BinaryBuilder::new()).collect();
        let mut data = BinaryBuilder::new();
        let mut blocks = UInt32Builder::new();

        for (addr, row_topics, row_data, block) in rows {
            address.append_value(addr);
            for (i, builder) in topics.iter_mut().enumerate() {
                match row_topics.get(i).cloned().flatten() {
                    Some(bytes) => builder.append_value(&bytes),
                    None => builder.append_null(),
                }
            }
            data.append_value(row_data);
            blocks.append_value(*block);
        }

        let mut columns: Vec<ArrayRef> = vec![Arc::new(address.finish())];
        for mut builder in topics {
            columns.push(Arc::new(builder.finish()));
        }
        columns.push(Arc::new(data.finish()));
        columns.push(Arc::new(blocks.finish()));

        let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();
        let file = File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn reads_events_with_trailing_null_topics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ethereum__logs__0_to_9999.parquet");

        let addr = vec![0x11u8; 20];
        let topic0 = vec![0xaau8; 32];
        let topic1 = vec![0xbbu8; 32];
        write_sample(
            &path,
            &[(
                addr.clone(),
                vec![Some(topic0.clone()), Some(topic1.clone()), None, None],
                vec![1, 2, 3],
                12345,
            )],
        );

        let events = read_log_events(&path).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.address, Address::from_slice(&addr));
        assert_eq!(event.topics.len(), 2);
        assert_eq!(event.topics[0], H256::from_slice(&topic0));
        assert_eq!(event.data, vec![1, 2, 3]);
        assert_eq!(event.block_number, 12345);
    }

    #[test]
    fn rejects_malformed_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ethereum__logs__0_to_9999.parquet");
        write_sample(&path, &[(vec![0x11u8; 19], vec![None; 4], vec![], 1)]);
        assert!(read_log_events(&path).is_err());
    }
}
