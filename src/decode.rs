//! Avro alert packet decoding.
//!
//! Broker messages are Avro object-container payloads with an embedded
//! schema; one message may carry several records. Records are converted to
//! BSON documents so unknown payload fields pass through to the store
//! untouched and cutout byte fields stay binary.

use anyhow::{Context, Result};
use apache_avro::types::Value as AvroValue;
use apache_avro::Reader;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{Binary, Bson, Document};

/// Decode every record in one broker message.
pub fn read_records(payload: &[u8]) -> Result<Vec<Document>> {
    let reader = Reader::new(payload).context("failed to read Avro container header")?;
    let mut records = Vec::new();
    for value in reader {
        let value = value.context("failed to decode Avro record")?;
        match avro_to_bson(value) {
            Bson::Document(doc) => records.push(doc),
            other => anyhow::bail!("expected an Avro record, got {:?}", other.element_type()),
        }
    }
    Ok(records)
}

pub fn avro_to_bson(value: AvroValue) -> Bson {
    match value {
        AvroValue::Null => Bson::Null,
        AvroValue::Boolean(b) => Bson::Boolean(b),
        AvroValue::Int(i) => Bson::Int32(i),
        AvroValue::Long(l) => Bson::Int64(l),
        AvroValue::Float(f) => Bson::Double(f as f64),
        AvroValue::Double(d) => Bson::Double(d),
        AvroValue::Bytes(bytes) | AvroValue::Fixed(_, bytes) => Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes,
        }),
        AvroValue::String(s) => Bson::String(s),
        AvroValue::Enum(_, symbol) => Bson::String(symbol),
        AvroValue::Union(_, inner) => avro_to_bson(*inner),
        AvroValue::Array(items) => Bson::Array(items.into_iter().map(avro_to_bson).collect()),
        AvroValue::Map(entries) => {
            let mut doc = Document::new();
            for (key, item) in entries {
                doc.insert(key, avro_to_bson(item));
            }
            Bson::Document(doc)
        }
        AvroValue::Record(fields) => {
            let mut doc = Document::new();
            for (key, item) in fields {
                doc.insert(key, avro_to_bson(item));
            }
            Bson::Document(doc)
        }
        AvroValue::Date(days) => Bson::Int32(days),
        AvroValue::TimeMillis(ms) => Bson::Int32(ms),
        AvroValue::TimeMicros(us) => Bson::Int64(us),
        AvroValue::TimestampMillis(ms) => Bson::Int64(ms),
        AvroValue::TimestampMicros(us) => Bson::Int64(us),
        AvroValue::Uuid(uuid) => Bson::String(uuid.to_string()),
        // exotic logical types never appear in alert schemas
        _ => Bson::Null,
    }
}
