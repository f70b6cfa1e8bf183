use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};

use super::{ObjectStore, ObjectStoreError};
use crate::config::{ObjectAcl, S3Config};

const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// S3-compatible object store backend (AWS S3, MinIO, R2, ...).
/// Requests use path-style addressing and AWS Signature Version 4.
pub struct S3Store {
    access_key_id: String,
    acl: ObjectAcl,
    bucket: String,
    client: Client,
    endpoint: Url,
    host: String,
    region: String,
    secret_access_key: String,
}

/// Inputs to a SigV4 signature. Headers must already be lowercase.
pub(crate) struct SigningRequest<'a> {
    pub method: &'a str,
    pub canonical_uri: &'a str,
    pub headers: Vec<(String, String)>,
    pub payload_sha256: &'a str,
    pub amz_date: &'a str,
}

impl S3Store {
    pub fn new(config: &S3Config, acl: ObjectAcl) -> Result<Self, anyhow::Error> {
        let client = Client::builder().build()?;
        let endpoint = Url::parse(&config.endpoint)?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => anyhow::bail!("S3 endpoint has no host: {}", config.endpoint),
        };

        Ok(Self {
            access_key_id: config.access_key_id.clone(),
            acl,
            bucket: config.bucket.clone(),
            client,
            endpoint,
            host,
            region: config.region.clone(),
            secret_access_key: config.secret_access_key.clone(),
        })
    }

    fn canonical_uri(&self, key: &str) -> String {
        let base = self.endpoint.path().trim_end_matches('/');
        let encoded_key: Vec<String> = key.split('/').map(uri_encode).collect();
        format!(
            "{base}/{}/{}",
            uri_encode(&self.bucket),
            encoded_key.join("/")
        )
    }

    fn request(
        &self,
        method: Method,
        key: &str,
        payload: Option<&Bytes>,
        extra_headers: Vec<(String, String)>,
    ) -> RequestBuilder {
        let canonical_uri = self.canonical_uri(key);
        let url = format!("{}://{}{}", self.endpoint.scheme(), self.host, canonical_uri);

        let payload_sha256 = match payload {
            Some(data) => sha256_hex(data),
            None => EMPTY_PAYLOAD_SHA256.to_string(),
        };
        let amz_date = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_sha256.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        headers.extend(extra_headers);

        let authorization = sign_v4(
            &SigningRequest {
                method: method.as_str(),
                canonical_uri: &canonical_uri,
                headers: headers.clone(),
                payload_sha256: &payload_sha256,
                amz_date: &amz_date,
            },
            &self.access_key_id,
            &self.secret_access_key,
            &self.region,
        );

        let mut builder = self.client.request(method, url);
        for (name, value) in headers.into_iter().filter(|(n, _)| n != "host") {
            builder = builder.header(name, value);
        }
        builder = builder.header("authorization", authorization);
        if let Some(data) = payload {
            builder = builder.body(data.clone());
        }
        builder
    }
}

async fn backend_failure(action: &str, resp: reqwest::Response) -> ObjectStoreError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    ObjectStoreError::Backend(format!("S3 {action} failed ({status}): {body}"))
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        let resp = self
            .request(
                Method::PUT,
                key,
                Some(&data),
                vec![("x-amz-acl".to_string(), self.acl.as_str().to_string())],
            )
            .header("content-type", "application/octet-stream")
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(backend_failure("upload", resp).await);
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        let resp = self
            .request(Method::GET, key, None, Vec::new())
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }

        if !resp.status().is_success() {
            return Err(backend_failure("download", resp).await);
        }

        resp.bytes()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes, ObjectStoreError> {
        let resp = self
            .request(Method::GET, key, None, Vec::new())
            .header("range", format!("bytes={start}-{end}"))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(ObjectStoreError::NotFound(key.to_string())),
            StatusCode::RANGE_NOT_SATISFIABLE => Err(ObjectStoreError::InvalidRange {
                key: key.to_string(),
                start,
                end,
            }),
            StatusCode::PARTIAL_CONTENT => resp
                .bytes()
                .await
                .map_err(|e| ObjectStoreError::Backend(e.to_string())),
            // Some S3-compatible services ignore Range and return the whole object
            StatusCode::OK => {
                let data = resp
                    .bytes()
                    .await
                    .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
                if start > end || end >= data.len() as u64 {
                    return Err(ObjectStoreError::InvalidRange {
                        key: key.to_string(),
                        start,
                        end,
                    });
                }
                Ok(data.slice(start as usize..=end as usize))
            }
            _ => Err(backend_failure("ranged download", resp).await),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let resp = self
            .request(Method::DELETE, key, None, Vec::new())
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        // 404 is fine -- object already gone
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(backend_failure("delete", resp).await);
        }

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let resp = self
            .request(Method::HEAD, key, None, Vec::new())
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(ObjectStoreError::Backend(format!("S3 head failed ({s})"))),
        }
    }
}

/// Build the `Authorization` header value for an S3 request.
pub(crate) fn sign_v4(
    req: &SigningRequest<'_>,
    access_key_id: &str,
    secret_access_key: &str,
    region: &str,
) -> String {
    let mut headers = req.headers.clone();
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{}\n", value.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        req.method, req.canonical_uri, canonical_headers, signed_headers, req.payload_sha256
    );

    let date = &req.amz_date[..8];
    let scope = format!("{date}/{region}/s3/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{scope}\n{}",
        req.amz_date,
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac_sha256(format!("AWS4{secret_access_key}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex_encode(&hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={access_key_id}/{scope}, SignedHeaders={signed_headers}, Signature={signature}"
    )
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, key);
    ring::hmac::sign(&key, data).as_ref().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex_encode(ring::digest::digest(&ring::digest::SHA256, data).as_ref())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Percent-encode a single path segment per the SigV4 rules.
fn uri_encode(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signing_request(payload_sha256: &str) -> SigningRequest<'_> {
        SigningRequest {
            method: "PUT",
            canonical_uri: "/bucket/abc/original",
            headers: vec![
                ("x-amz-date".to_string(), "20240101T000000Z".to_string()),
                ("host".to_string(), "localhost:9000".to_string()),
                (
                    "x-amz-content-sha256".to_string(),
                    payload_sha256.to_string(),
                ),
            ],
            payload_sha256,
            amz_date: "20240101T000000Z",
        }
    }

    #[test]
    fn test_empty_payload_hash_constant() {
        assert_eq!(sha256_hex(b""), EMPTY_PAYLOAD_SHA256);
    }

    #[test]
    fn test_signature_header_shape() {
        let auth = sign_v4(
            &signing_request(EMPTY_PAYLOAD_SHA256),
            "AKID",
            "secret",
            "us-east-1",
        );
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKID/20240101/us-east-1/s3/aws4_request, "
        ));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date, "));
        let signature = auth.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_depends_on_payload_and_secret() {
        let a = sign_v4(&signing_request(EMPTY_PAYLOAD_SHA256), "AKID", "secret", "us-east-1");
        let b = sign_v4(&signing_request(EMPTY_PAYLOAD_SHA256), "AKID", "secret", "us-east-1");
        assert_eq!(a, b);

        let other_payload = sha256_hex(b"hello");
        let c = sign_v4(&signing_request(&other_payload), "AKID", "secret", "us-east-1");
        assert_ne!(a, c);

        let d = sign_v4(&signing_request(EMPTY_PAYLOAD_SHA256), "AKID", "other", "us-east-1");
        assert_ne!(a, d);
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("abc-123_x.y~z"), "abc-123_x.y~z");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn test_canonical_uri_is_path_style() {
        let store = S3Store::new(
            &S3Config {
                bucket: "media".to_string(),
                endpoint: "http://localhost:9000".to_string(),
                region: "us-east-1".to_string(),
                access_key_id: "AKID".to_string(),
                secret_access_key: "secret".to_string(),
            },
            ObjectAcl::PublicRead,
        )
        .unwrap();
        assert_eq!(store.host, "localhost:9000");
        assert_eq!(store.canonical_uri("f1/original"), "/media/f1/original");
    }
}
