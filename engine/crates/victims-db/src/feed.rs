//! Wire format of the remote update and remove feeds
//!
//! Both feeds are JSON arrays of single-field objects. The field name is a
//! label chosen by the server and carries no meaning; its value is the entry.

use serde::de::{self, DeserializeOwned, IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::marker::PhantomData;
use victims_core::{AdvisoryRecord, Error, Result};

/// One feed entry: `{"<label>": <value>}` with the label discarded
#[derive(Debug)]
pub struct Tagged<T>(pub T);

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Tagged<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct TaggedVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for TaggedVisitor<T> {
            type Value = Tagged<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object with a single labelled entry")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                if map.next_key::<IgnoredAny>()?.is_none() {
                    return Err(de::Error::invalid_length(0, &self));
                }
                let value = map.next_value::<T>()?;
                if map.next_key::<IgnoredAny>()?.is_some() {
                    return Err(de::Error::custom("feed entry has more than one field"));
                }
                Ok(Tagged(value))
            }
        }

        deserializer.deserialize_map(TaggedVisitor(PhantomData))
    }
}

/// The part of a removal entry the engine uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RemovalRef {
    pub id: i64,
}

/// Removal entries come as a bare id, a labelled object, or a plain object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RemovalItem {
    Id(i64),
    Tagged(Tagged<RemovalRef>),
    Plain(RemovalRef),
}

impl RemovalItem {
    fn id(&self) -> i64 {
        match self {
            RemovalItem::Id(id) => *id,
            RemovalItem::Tagged(Tagged(entry)) | RemovalItem::Plain(entry) => entry.id,
        }
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<Vec<T>> {
    serde_json::from_slice(body).map_err(|e| Error::Parse(format!("Malformed feed: {}", e)))
}

/// Decode the body of an update feed response
pub fn decode_updates(body: &[u8]) -> Result<Vec<AdvisoryRecord>> {
    let entries: Vec<Tagged<AdvisoryRecord>> = decode(body)?;
    Ok(entries.into_iter().map(|Tagged(record)| record).collect())
}

/// Decode the body of a remove feed response into advisory ids
pub fn decode_removals(body: &[u8]) -> Result<Vec<i64>> {
    let entries: Vec<RemovalItem> = decode(body)?;
    Ok(entries.iter().map(RemovalItem::id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_decode_updates() {
        let body = json!([
            {"fields": {
                "cves": ["CVE-2012-0001"],
                "vendor": "acme",
                "name": "widget",
                "version": "1.0",
                "created": "2012-05-06T07:08:09",
                "status": "RELEASED",
                "hashes": {"SHA512": {"combined": "c", "files": {"A.class": "a"}}}
            }},
            {"record": {
                "vendor": "acme",
                "name": "gadget",
                "version": "2.0",
                "date": "2012-05-07T00:00:00"
            }}
        ]);

        let records = decode_updates(body.to_string().as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "widget");
        assert_eq!(records[0].created, Utc.with_ymd_and_hms(2012, 5, 6, 7, 8, 9).unwrap());
        assert_eq!(records[1].name, "gadget");
        assert!(records[1].hashes.is_empty());
    }

    #[test]
    fn test_decode_empty_feed() {
        assert!(decode_updates(b"[]").unwrap().is_empty());
        assert!(decode_removals(b"[]").unwrap().is_empty());
    }

    #[test]
    fn test_decode_removals_shapes() {
        let body = json!([
            5,
            {"fields": {"id": 6, "vendor": "acme", "created": "2012-01-01T00:00:00"}},
            {"id": 7}
        ]);

        let ids = decode_removals(body.to_string().as_bytes()).unwrap();
        assert_eq!(ids, vec![5, 6, 7]);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(decode_updates(b"{\"not\": \"an array\"}"), Err(Error::Parse(_))));
        assert!(decode_updates(b"[{}]").is_err());
        assert!(decode_updates(b"[{\"a\": {\"created\": \"yesterday\"}}]").is_err());
        assert!(decode_removals(b"[\"five\"]").is_err());
        assert!(decode_updates(b"[{\"a\": 1, \"b\": 2}]").is_err());
    }
}
