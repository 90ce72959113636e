//! Amazon S3 / MinIO [`ObjectStore`].
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication
//! built from `hmac` + `sha2`, with no AWS SDK dependency. With a custom
//! `endpoint_url` (MinIO, LocalStack) requests use path-style addressing
//! (`{endpoint}/{bucket}/{key}`); otherwise virtual-hosted style
//! (`https://{bucket}.s3.{region}.amazonaws.com/{key}`).
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! backend = "s3"
//! bucket = "kb-uploads"
//! region = "us-east-1"
//! prefix = "documents/"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha2::{Digest, Sha256};

use crate::config::StorageConfig;

use super::ObjectStore;

type HmacSha256 = Hmac<Sha256>;

/// AWS credentials loaded from environment variables.
#[derive(Clone)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    pub fn new(access_key_id: &str, secret_access_key: &str, session_token: Option<String>) -> Self {
        Self {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            session_token,
        }
    }

    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

pub struct S3ObjectStore {
    client: reqwest::Client,
    bucket: String,
    region: String,
    prefix: String,
    endpoint_url: Option<String>,
    creds: AwsCredentials,
}

impl S3ObjectStore {
    pub fn new(
        bucket: &str,
        region: &str,
        prefix: &str,
        endpoint_url: Option<String>,
        creds: AwsCredentials,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            bucket: bucket.to_string(),
            region: region.to_string(),
            prefix: prefix.to_string(),
            endpoint_url,
            creds,
        }
    }

    /// Build from `[storage]` config and credentials in the environment.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .as_deref()
            .context("storage.bucket is required for the s3 backend")?;
        Ok(Self::new(
            bucket,
            &config.region,
            &config.prefix,
            config.endpoint_url.clone(),
            AwsCredentials::from_env()?,
        ))
    }

    /// `(scheme, host, canonical_uri)` for an object key.
    fn address(&self, key: &str) -> (String, String, String) {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match &self.endpoint_url {
            Some(endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                let uri = format!("/{}/{}", uri_encode(&self.bucket), encoded_key);
                (scheme.to_string(), host, uri)
            }
            None => (
                "https".to_string(),
                format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
                format!("/{}", encoded_key),
            ),
        }
    }

    async fn send(&self, method: Method, key: &str, body: Vec<u8>) -> Result<reqwest::Response> {
        let (scheme, host, canonical_uri) = self.address(key);
        let url = format!("{}://{}{}", scheme, host, canonical_uri);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(&body);

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        let authorization = authorization_header(
            method.as_str(),
            &canonical_uri,
            &mut headers,
            &payload_hash,
            &amz_date,
            &date_stamp,
            &self.region,
            &self.creds,
        );

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        req.send()
            .await
            .with_context(|| format!("S3 {} s3://{}/{} failed", method, self.bucket, key))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let full_key = format!("{}{}", self.prefix, key);
        let resp = self.send(Method::PUT, &full_key, bytes.to_vec()).await?;
        if !resp.status().is_success() {
            bail!(
                "S3 PutObject failed (HTTP {}) for key '{}'",
                resp.status(),
                full_key
            );
        }
        Ok(full_key)
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>> {
        let resp = self.send(Method::GET, location, Vec::new()).await?;
        if !resp.status().is_success() {
            bail!(
                "S3 GetObject failed (HTTP {}) for key '{}'",
                resp.status(),
                location
            );
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let resp = self.send(Method::DELETE, location, Vec::new()).await?;
        // S3 answers 204 for deletes, including of missing keys.
        if !resp.status().is_success() {
            bail!(
                "S3 DeleteObject failed (HTTP {}) for key '{}'",
                resp.status(),
                location
            );
        }
        Ok(())
    }
}

// ============ AWS SigV4 Helpers ============

/// Build the SigV4 `Authorization` header value. Sorts `headers` in place.
#[allow(clippy::too_many_arguments)]
fn authorization_header(
    method: &str,
    canonical_uri: &str,
    headers: &mut [(String, String)],
    payload_hash: &str,
    amz_date: &str,
    date_stamp: &str,
    region: &str,
    creds: &AwsCredentials,
) -> String {
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        method, canonical_uri, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, date_stamp, region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    )
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a path segment per RFC 3986 (unreserved: `A-Z a-z 0-9 - _ . ~`).
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}
