use std::collections::HashMap;

use base64::Engine;

use super::UploadError;

/// Metadata declared by the client when an upload is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadMetadata {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    /// Any other keys, decoded
    pub extra: HashMap<String, String>,
}

impl UploadMetadata {
    /// Parse a tus `Upload-Metadata` header: comma-separated `key base64(value)`
    /// pairs, where the value may be omitted.
    pub fn parse(header: &str) -> Result<Self, UploadError> {
        let mut metadata = UploadMetadata::default();

        for pair in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let mut parts = pair.splitn(2, ' ');
            let key = parts.next().unwrap_or_default();
            if key.is_empty() {
                return Err(UploadError::InvalidMetadata("empty metadata key".into()));
            }

            let value = match parts.next().map(str::trim) {
                Some(encoded) if !encoded.is_empty() => {
                    let raw = base64::engine::general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|e| {
                            UploadError::InvalidMetadata(format!("value of '{key}' is not base64: {e}"))
                        })?;
                    String::from_utf8(raw).map_err(|_| {
                        UploadError::InvalidMetadata(format!("value of '{key}' is not UTF-8"))
                    })?
                }
                _ => String::new(),
            };

            match key {
                "filename" | "name" => metadata.filename = Some(value),
                // tus-js-client sends `filetype`; other clients send `type`
                "type" | "filetype" => metadata.content_type = Some(value.to_lowercase()),
                _ => {
                    metadata.extra.insert(key.to_string(), value);
                }
            }
        }

        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[test]
    fn test_parse_known_keys() {
        let header = format!("filename {},type {}", b64("cat.png"), b64("image/PNG"));
        let meta = UploadMetadata::parse(&header).unwrap();
        assert_eq!(meta.filename.as_deref(), Some("cat.png"));
        assert_eq!(meta.content_type.as_deref(), Some("image/png"));
        assert!(meta.extra.is_empty());
    }

    #[test]
    fn test_parse_filetype_and_extra_keys() {
        let header = format!("filetype {}, owner {}, is_public", b64("image/jpeg"), b64("u1"));
        let meta = UploadMetadata::parse(&header).unwrap();
        assert_eq!(meta.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(meta.extra.get("owner").map(String::as_str), Some("u1"));
        assert_eq!(meta.extra.get("is_public").map(String::as_str), Some(""));
    }

    #[test]
    fn test_parse_empty_header() {
        assert_eq!(UploadMetadata::parse("").unwrap(), UploadMetadata::default());
    }

    #[test]
    fn test_parse_rejects_bad_base64() {
        assert!(matches!(
            UploadMetadata::parse("filename !!!"),
            Err(UploadError::InvalidMetadata(_))
        ));
    }
}
