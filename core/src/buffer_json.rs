//! Serde helpers for the `{"type":"Buffer","data":"<base64>"}` encoding used
//! for every byte buffer persisted to disk.

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const BUFFER_TYPE: &str = "Buffer";

#[derive(Serialize, Deserialize)]
struct Repr {
    #[serde(rename = "type")]
    kind: String,
    data: String,
}

pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsRef<[u8]>,
{
    Repr {
        kind: BUFFER_TYPE.to_string(),
        data: BASE64_STANDARD.encode(bytes.as_ref()),
    }
    .serialize(serializer)
}

pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<Vec<u8>>,
{
    let repr = Repr::deserialize(deserializer)?;
    if repr.kind != BUFFER_TYPE {
        return Err(D::Error::custom(format!(
            "expected type \"{BUFFER_TYPE}\", got \"{}\"",
            repr.kind
        )));
    }
    let raw = BASE64_STANDARD
        .decode(repr.data.as_bytes())
        .map_err(D::Error::custom)?;
    let len = raw.len();
    T::try_from(raw).map_err(|_| D::Error::custom(format!("unexpected buffer length {len}")))
}

pub mod option {
    use super::*;

    pub fn serialize<S, T>(bytes: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        match bytes {
            Some(b) => super::serialize(b, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        #[derive(Deserialize)]
        struct Wrapped<T: TryFrom<Vec<u8>>>(#[serde(deserialize_with = "crate::buffer_json::deserialize")] T);

        Ok(Option::<Wrapped<T>>::deserialize(deserializer)?.map(|w| w.0))
    }
}

/// An owned byte buffer that (de)serializes in buffer JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffer(#[serde(with = "crate::buffer_json")] pub Vec<u8>);

impl From<Vec<u8>> for Buffer {
    fn from(v: Vec<u8>) -> Self {
        Buffer(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Holder {
        #[serde(with = "crate::buffer_json")]
        key: [u8; 4],
        #[serde(with = "crate::buffer_json::option", default)]
        extra: Option<Vec<u8>>,
    }

    #[test]
    fn writes_buffer_objects() {
        let json = serde_json::to_string(&Buffer(vec![1, 2, 3])).unwrap();
        assert_eq!(json, r#"{"type":"Buffer","data":"AQID"}"#);
    }

    #[test]
    fn fixed_size_arrays_check_length() {
        let ok: Holder =
            serde_json::from_str(r#"{"key":{"type":"Buffer","data":"AQIDBA=="},"extra":null}"#)
                .unwrap();
        assert_eq!(ok.key, [1, 2, 3, 4]);
        assert_eq!(ok.extra, None);

        let bad = serde_json::from_str::<Holder>(r#"{"key":{"type":"Buffer","data":"AQID"}}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn rejects_foreign_type_tags() {
        let bad = serde_json::from_str::<Buffer>(r#"{"type":"Blob","data":"AQID"}"#);
        assert!(bad.is_err());
    }
}
