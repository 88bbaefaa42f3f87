//! Ready-made content mappers.

use std::marker::PhantomData;

use anyhow::{anyhow, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;

use crate::consumer::{Content, ContentMapper, MessageContext};

fn as_bytes(content: &Content) -> Option<&[u8]> {
    if let Some(bytes) = content.downcast_ref::<Vec<u8>>() {
        return Some(bytes.as_slice());
    }
    content.downcast_ref::<String>().map(String::as_bytes)
}

/// Decodes standard, padded base64 into bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Base64Decode;

impl ContentMapper for Base64Decode {
    fn map(&self, _context: &MessageContext, offset: i64, content: Content) -> anyhow::Result<Content> {
        let encoded = as_bytes(&content)
            .ok_or_else(|| anyhow!("offset {offset}: base64 input should be bytes or a string"))?;
        let decoded = STANDARD
            .decode(encoded)
            .with_context(|| format!("offset {offset}: invalid base64 content"))?;
        Ok(Box::new(decoded))
    }
}

/// Deserializes JSON bytes into `T`.
pub struct JsonDecode<T> {
    target: PhantomData<fn() -> T>,
}

impl<T> JsonDecode<T> {
    pub fn new() -> Self {
        Self {
            target: PhantomData,
        }
    }
}

impl<T> Default for JsonDecode<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ContentMapper for JsonDecode<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn map(&self, _context: &MessageContext, offset: i64, content: Content) -> anyhow::Result<Content> {
        let bytes = as_bytes(&content)
            .ok_or_else(|| anyhow!("offset {offset}: JSON input should be bytes or a string"))?;
        let value: T = serde_json::from_slice(bytes)
            .with_context(|| format!("offset {offset}: failed to decode JSON content"))?;
        Ok(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use test_case::test_case;

    fn map(mapper: &impl ContentMapper, content: Content) -> anyhow::Result<Content> {
        mapper.map(&MessageContext::default(), 7, content)
    }

    #[test_case(b"VGVzdCBvZiB0aGUgZnVuY3Rpb24=".to_vec(), Some("Test of the function"); "valid")]
    #[test_case(b"ey".to_vec(), None; "invalid padding")]
    #[test_case(b"not base64!".to_vec(), None; "invalid alphabet")]
    fn test_base64_decode(input: Vec<u8>, expected: Option<&str>) {
        let result = map(&Base64Decode, Box::new(input));
        match expected {
            Some(text) => {
                let content = result.unwrap();
                assert_eq!(
                    content.downcast_ref::<Vec<u8>>().map(Vec::as_slice),
                    Some(text.as_bytes())
                );
            }
            None => assert!(result.is_err()),
        }
    }

    #[test]
    fn test_base64_decode_accepts_strings_only() {
        let content = map(&Base64Decode, Box::new("aGk=".to_string())).unwrap();
        assert_eq!(content.downcast_ref::<Vec<u8>>(), Some(&b"hi".to_vec()));

        assert!(map(&Base64Decode, Box::new(42_u32)).is_err());
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Event {
        name: String,
        count: u32,
    }

    #[test]
    fn test_json_decode() {
        let mapper = JsonDecode::<Event>::new();
        let content = map(&mapper, Box::new(br#"{"name":"e","count":2}"#.to_vec())).unwrap();
        assert_eq!(
            content.downcast_ref::<Event>(),
            Some(&Event {
                name: "e".to_string(),
                count: 2
            })
        );

        assert!(map(&mapper, Box::new(b"{".to_vec())).is_err());
    }

    #[test]
    fn test_mappers_chain() {
        // base64 of {"name":"e","count":2}
        let encoded = STANDARD.encode(br#"{"name":"e","count":2}"#);
        let decoded = map(&Base64Decode, Box::new(encoded.into_bytes())).unwrap();
        let event = map(&JsonDecode::<Event>::new(), decoded).unwrap();
        assert_eq!(event.downcast_ref::<Event>().map(|e| e.count), Some(2));
    }
}
