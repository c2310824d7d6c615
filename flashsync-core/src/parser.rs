//! Row parsing: driver values to normalized records.

use chrono::NaiveTime;

use crate::config::DateFormat;
use crate::error::RowParseError;
use crate::models::{Record, RecordValue};
use crate::source::{SourceRow, SourceValue};

/// Converts one source row into a [`Record`].
///
/// Implementations fail only when the row cannot be read at the driver
/// level. Value conversion itself never fails.
pub trait RowParser: Send + Sync {
    fn parse(&self, row: &dyn SourceRow) -> Result<Record, RowParseError>;
}

/// Default parser keyed on the driver-reported column set.
///
/// - raw bytes become text (lossy UTF-8)
/// - dates and datetimes are formatted with the configured [`DateFormat`]
/// - nulls are kept as explicit nulls
/// - every other value passes through unchanged
#[derive(Debug, Clone, Default)]
pub struct DynamicRowParser {
    date_format: DateFormat,
}

impl DynamicRowParser {
    pub const fn new(date_format: DateFormat) -> Self {
        Self { date_format }
    }

    /// Normalizes a single driver value.
    pub fn convert(&self, value: SourceValue) -> RecordValue {
        match value {
            SourceValue::Null => RecordValue::Null,
            SourceValue::Bytes(bytes) => RecordValue::String(match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            }),
            SourceValue::Text(text) => RecordValue::String(text),
            SourceValue::Int(v) => RecordValue::Integer(v),
            SourceValue::UInt(v) => RecordValue::UnsignedInteger(v),
            SourceValue::Float(v) => RecordValue::Float(v),
            SourceValue::Bool(v) => RecordValue::Bool(v),
            SourceValue::Date(date) => {
                let midnight = date.and_time(NaiveTime::MIN).and_utc();
                RecordValue::Temporal(self.date_format.format(&midnight))
            }
            SourceValue::DateTime(naive) => {
                RecordValue::Temporal(self.date_format.format(&naive.and_utc()))
            }
            SourceValue::Timestamp(ts) => RecordValue::Temporal(self.date_format.format(&ts)),
        }
    }
}

impl RowParser for DynamicRowParser {
    fn parse(&self, row: &dyn SourceRow) -> Result<Record, RowParseError> {
        let count = row.column_count();
        let mut record = Record::with_capacity(count);

        for index in 0..count {
            let column = row.column_name(index);
            let value = row.value(index).map_err(|source| RowParseError {
                column: column.to_string(),
                index,
                source,
            })?;
            record.push(column, self.convert(value));
        }

        tracing::trace!(columns = count, "Row parsed");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use chrono::{NaiveDate, TimeZone, Utc};

    struct FixedRow {
        columns: Vec<&'static str>,
        values: Vec<Result<SourceValue, &'static str>>,
    }

    impl SourceRow for FixedRow {
        fn column_count(&self) -> usize {
            self.columns.len()
        }

        fn column_name(&self, index: usize) -> &str {
            self.columns[index]
        }

        fn value(&self, index: usize) -> Result<SourceValue, BoxError> {
            self.values[index].clone().map_err(BoxError::from)
        }
    }

    #[test]
    fn test_conversion_rules() {
        let parser = DynamicRowParser::default();
        let row = FixedRow {
            columns: vec!["id", "name", "note", "amount", "active", "born", "seen_at", "big"],
            values: vec![
                Ok(SourceValue::Int(42)),
                Ok(SourceValue::Bytes(b"Ada".to_vec())),
                Ok(SourceValue::Null),
                Ok(SourceValue::Float(12.5)),
                Ok(SourceValue::Bool(false)),
                Ok(SourceValue::Date(NaiveDate::from_ymd_opt(1990, 5, 17).unwrap())),
                Ok(SourceValue::DateTime(
                    NaiveDate::from_ymd_opt(2024, 2, 29)
                        .unwrap()
                        .and_hms_opt(23, 59, 1)
                        .unwrap(),
                )),
                Ok(SourceValue::UInt(u64::MAX)),
            ],
        };

        let record = parser.parse(&row).unwrap();
        assert_eq!(record.len(), 8);
        assert_eq!(record.get("id"), Some(&RecordValue::Integer(42)));
        assert_eq!(record.get("name"), Some(&RecordValue::String("Ada".to_string())));
        assert_eq!(record.get("note"), Some(&RecordValue::Null));
        assert_eq!(record.get("amount"), Some(&RecordValue::Float(12.5)));
        assert_eq!(record.get("active"), Some(&RecordValue::Bool(false)));
        assert_eq!(
            record.get("born"),
            Some(&RecordValue::Temporal("1990-05-17T00:00:00+00:00".to_string()))
        );
        assert_eq!(
            record.get("seen_at"),
            Some(&RecordValue::Temporal("2024-02-29T23:59:01+00:00".to_string()))
        );
        assert_eq!(record.get("big"), Some(&RecordValue::UnsignedInteger(u64::MAX)));
    }

    #[test]
    fn test_configured_format_applies_to_every_temporal_value() {
        let parser = DynamicRowParser::new(DateFormat::new("%d/%m/%Y").unwrap());
        let ts = Utc.with_ymd_and_hms(2021, 12, 31, 10, 0, 0).unwrap();

        assert_eq!(
            parser.convert(SourceValue::Timestamp(ts)),
            RecordValue::Temporal("31/12/2021".to_string())
        );
        assert_eq!(
            parser.convert(SourceValue::Date(NaiveDate::from_ymd_opt(2021, 1, 2).unwrap())),
            RecordValue::Temporal("02/01/2021".to_string())
        );
    }

    #[test]
    fn test_invalid_utf8_bytes_are_replaced() {
        let parser = DynamicRowParser::default();
        assert_eq!(
            parser.convert(SourceValue::Bytes(vec![0x66, 0xff, 0x6f])),
            RecordValue::String("f\u{fffd}o".to_string())
        );
    }

    #[test]
    fn test_null_is_an_explicit_entry() {
        let parser = DynamicRowParser::default();
        let row = FixedRow {
            columns: vec!["a", "b"],
            values: vec![Ok(SourceValue::Null), Ok(SourceValue::Text("x".to_string()))],
        };

        let record = parser.parse(&row).unwrap();
        assert_eq!(serde_json::to_string(&record).unwrap(), r#"{"a":null,"b":"x"}"#);
    }

    #[test]
    fn test_driver_failure_reports_column() {
        let parser = DynamicRowParser::default();
        let row = FixedRow {
            columns: vec!["id", "created_at"],
            values: vec![Ok(SourceValue::Int(1)), Err("bad datetime")],
        };

        let err = parser.parse(&row).unwrap_err();
        assert_eq!(err.column, "created_at");
        assert_eq!(err.index, 1);
    }
}
