// Segment File Format
//
// Segments are Parquet files with one row per log record. Segment-level
// metadata travels inside the file footer under `apilog.segment`, so an
// orphaned file can be re-indexed without any other state.

use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, Int32Array, Int64Array, RecordBatch, StringArray, TimestampMillisecondArray,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use serde::{Deserialize, Serialize};

use super::SegmentError;
use crate::record::{LogRecord, NodeId};

/// Footer key holding [`SegmentFooter`] as JSON.
pub const SEGMENT_METADATA_KEY: &str = "apilog.segment";

/// Version of the column layout below.
pub const SCHEMA_VERSION: i32 = 1;

/// Column name, type, nullability.
pub const COLUMNS: &[(&str, &str, bool)] = &[
    ("time", "timestamptz", false),
    ("name", "string", false),
    ("bucket", "string", false),
    ("object", "string", false),
    ("httpStatusCode", "int", false),
    ("inputBytes", "long", false),
    ("outputBytes", "long", false),
    ("durationNs", "long", false),
    ("timeToFirstByteNs", "long", true),
    ("remoteHost", "string", false),
    ("userAgent", "string", false),
    ("accessKey", "string", false),
    ("requestId", "string", false),
    ("node", "string", false),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentFooter {
    pub schema_version: i32,
    pub node: NodeId,
    pub sequence: u64,
    pub row_count: u64,
    pub created_at: DateTime<Utc>,
}

fn arrow_type(kind: &str) -> DataType {
    match kind {
        "timestamptz" => DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
        "int" => DataType::Int32,
        "long" => DataType::Int64,
        _ => DataType::Utf8,
    }
}

pub fn arrow_schema() -> SchemaRef {
    Arc::new(Schema::new(
        COLUMNS
            .iter()
            .map(|(name, kind, nullable)| Field::new(*name, arrow_type(kind), *nullable))
            .collect::<Vec<_>>(),
    ))
}

fn strings<'a>(records: &'a [LogRecord], f: impl Fn(&'a LogRecord) -> &'a str) -> ArrayRef {
    Arc::new(StringArray::from_iter_values(records.iter().map(f)))
}

fn longs(records: &[LogRecord], f: impl Fn(&LogRecord) -> u64) -> ArrayRef {
    Arc::new(Int64Array::from_iter_values(
        records.iter().map(|r| i64::try_from(f(r)).unwrap_or(i64::MAX)),
    ))
}

fn to_record_batch(records: &[LogRecord]) -> Result<RecordBatch, SegmentError> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(
            TimestampMillisecondArray::from_iter_values(
                records.iter().map(|r| r.time.timestamp_millis()),
            )
            .with_timezone("UTC"),
        ),
        strings(records, |r| r.name.as_str()),
        strings(records, |r| r.bucket.as_str()),
        strings(records, |r| r.object.as_str()),
        Arc::new(Int32Array::from_iter_values(
            records.iter().map(|r| i32::from(r.http_status_code)),
        )),
        longs(records, |r| r.input_bytes),
        longs(records, |r| r.output_bytes),
        longs(records, |r| r.duration_ns),
        Arc::new(Int64Array::from(
            records
                .iter()
                .map(|r| r.time_to_first_byte_ns.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
                .collect::<Vec<_>>(),
        )),
        strings(records, |r| r.remote_host.as_str()),
        strings(records, |r| r.user_agent.as_str()),
        strings(records, |r| r.access_key.as_str()),
        strings(records, |r| r.request_id.as_str()),
        strings(records, |r| r.node.as_str()),
    ];

    Ok(RecordBatch::try_new(arrow_schema(), columns)?)
}

/// Serialize a batch into a Parquet file.
pub fn encode_segment(records: &[LogRecord], footer: &SegmentFooter) -> Result<Bytes, SegmentError> {
    let batch = to_record_batch(records)?;
    let footer_json = serde_json::to_string(footer)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![KeyValue::new(
            SEGMENT_METADATA_KEY.to_string(),
            footer_json,
        )]))
        .build();

    let mut out = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut out, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(Bytes::from(out))
}

/// Read the segment footer without decoding any rows.
pub fn read_footer(data: Bytes) -> Result<SegmentFooter, SegmentError> {
    let reader = SerializedFileReader::new(data)?;
    let file_metadata = reader.metadata().file_metadata();
    let value = file_metadata
        .key_value_metadata()
        .and_then(|kvs| kvs.iter().find(|kv| kv.key == SEGMENT_METADATA_KEY))
        .and_then(|kv| kv.value.as_deref())
        .ok_or_else(|| SegmentError::MissingFooter(SEGMENT_METADATA_KEY.to_string()))?;

    let mut footer: SegmentFooter = serde_json::from_str(value)?;
    footer.row_count = u64::try_from(file_metadata.num_rows()).unwrap_or_default();
    Ok(footer)
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, SegmentError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| SegmentError::Decode(format!("column `{name}` missing or mistyped")))
}

/// Decode every row of a segment file.
pub fn decode_segment(data: Bytes) -> Result<Vec<LogRecord>, SegmentError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(data)?.build()?;
    let mut records = Vec::new();

    for batch in reader {
        let batch = batch?;
        let times = column::<TimestampMillisecondArray>(&batch, "time")?;
        let name = column::<StringArray>(&batch, "name")?;
        let bucket = column::<StringArray>(&batch, "bucket")?;
        let object = column::<StringArray>(&batch, "object")?;
        let status = column::<Int32Array>(&batch, "httpStatusCode")?;
        let input = column::<Int64Array>(&batch, "inputBytes")?;
        let output = column::<Int64Array>(&batch, "outputBytes")?;
        let duration = column::<Int64Array>(&batch, "durationNs")?;
        let ttfb = column::<Int64Array>(&batch, "timeToFirstByteNs")?;
        let remote_host = column::<StringArray>(&batch, "remoteHost")?;
        let user_agent = column::<StringArray>(&batch, "userAgent")?;
        let access_key = column::<StringArray>(&batch, "accessKey")?;
        let request_id = column::<StringArray>(&batch, "requestId")?;
        let node = column::<StringArray>(&batch, "node")?;

        for i in 0..batch.num_rows() {
            let time = Utc
                .timestamp_millis_opt(times.value(i))
                .single()
                .ok_or_else(|| SegmentError::Decode(format!("invalid timestamp in row {i}")))?;
            records.push(LogRecord {
                time,
                name: name.value(i).to_string(),
                bucket: bucket.value(i).to_string(),
                object: object.value(i).to_string(),
                http_status_code: u16::try_from(status.value(i)).unwrap_or_default(),
                input_bytes: input.value(i).max(0) as u64,
                output_bytes: output.value(i).max(0) as u64,
                duration_ns: duration.value(i).max(0) as u64,
                time_to_first_byte_ns: (!ttfb.is_null(i)).then(|| ttfb.value(i).max(0) as u64),
                remote_host: remote_host.value(i).to_string(),
                user_agent: user_agent.value(i).to_string(),
                access_key: access_key.value(i).to_string(),
                request_id: request_id.value(i).to_string(),
                node: NodeId::new(node.value(i)),
            });
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::record;

    fn footer(rows: u64) -> SegmentFooter {
        SegmentFooter {
            schema_version: SCHEMA_VERSION,
            node: NodeId::new("n1"),
            sequence: 4,
            row_count: rows,
            created_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        }
    }

    #[test]
    fn footer_is_readable_without_rows() {
        let records: Vec<_> = (0..5).map(|n| record("n1", n)).collect();
        let data = encode_segment(&records, &footer(5)).unwrap();

        let read = read_footer(data).unwrap();
        assert_eq!(read, footer(5));
    }

    #[test]
    fn decoded_rows_match_written_records() {
        let records: Vec<_> = (0..7).map(|n| record("n1", n)).collect();
        let data = encode_segment(&records, &footer(7)).unwrap();

        assert_eq!(decode_segment(data).unwrap(), records);
    }

    #[test]
    fn schema_marks_only_ttfb_nullable() {
        let schema = arrow_schema();
        let nullable: Vec<_> = schema
            .fields()
            .iter()
            .filter(|f| f.is_nullable())
            .map(|f| f.name().as_str())
            .collect();
        assert_eq!(nullable, vec!["timeToFirstByteNs"]);
    }
}
