//! HTTP Signature utilities for `ActivityPub`.
//!
//! Implements HTTP Signatures as used by `ActivityPub` for request authentication.
//! See: <https://datatracker.ietf.org/doc/html/draft-cavage-http-signatures>

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use rsa::{
    RsaPrivateKey,
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    sha2::Sha256,
    signature::{SignatureEncoding, Signer, Verifier},
};
use sha2::{Digest, Sha256 as Sha256Hasher};
use std::collections::HashMap;
use url::Url;

use crate::crypto::parse_public_key;
use crate::{AppError, AppResult};

/// Parsed HTTP Signature header.
#[derive(Debug, Clone)]
pub struct HttpSignature {
    /// Key ID (typically the actor's public key URL)
    pub key_id: String,
    /// Algorithm used (typically "rsa-sha256")
    pub algorithm: String,
    /// Headers included in the signature
    pub headers: Vec<String>,
    /// The signature itself (base64 encoded)
    pub signature: String,
}

impl HttpSignature {
    /// Parse an HTTP Signature header value.
    ///
    /// Format: `keyId="...",algorithm="...",headers="...",signature="..."`
    pub fn parse(header: &str) -> AppResult<Self> {
        let mut key_id = None;
        let mut algorithm = None;
        let mut headers = None;
        let mut signature = None;

        for part in header.split(',') {
            let part = part.trim();
            if let Some((key, value)) = part.split_once('=') {
                let value = value.trim_matches('"');
                match key.trim() {
                    "keyId" => key_id = Some(value.to_string()),
                    "algorithm" => algorithm = Some(value.to_string()),
                    "headers" => headers = Some(value.to_string()),
                    "signature" => signature = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        Ok(Self {
            key_id: key_id.ok_or_else(|| AppError::BadRequest("Missing keyId".to_string()))?,
            algorithm: algorithm.unwrap_or_else(|| "rsa-sha256".to_string()),
            headers: headers
                .unwrap_or_else(|| "date".to_string())
                .split(' ')
                .map(std::string::ToString::to_string)
                .collect(),
            signature: signature
                .ok_or_else(|| AppError::BadRequest("Missing signature".to_string()))?,
        })
    }
}

/// Headers produced by signing a request, ready to be attached to it.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    /// `Host` header value.
    pub host: String,
    /// `Date` header value (RFC 7231 format).
    pub date: String,
    /// `Digest` header value, present when the request has a body.
    pub digest: Option<String>,
    /// `Signature` header value.
    pub signature: String,
}

impl SignedHeaders {
    /// Iterate over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            Some(("Host", self.host.as_str())),
            Some(("Date", self.date.as_str())),
            self.digest.as_deref().map(|d| ("Digest", d)),
            Some(("Signature", self.signature.as_str())),
        ]
        .into_iter()
        .flatten()
    }
}

/// Build the signature string from request components.
///
/// This creates the string that needs to be signed/verified.
pub fn build_signature_string(
    method: &str,
    path: &str,
    headers: &HashMap<String, String>,
    signed_headers: &[String],
) -> AppResult<String> {
    let mut parts = Vec::new();

    for header_name in signed_headers {
        let value = if header_name == "(request-target)" {
            format!("{} {}", method.to_lowercase(), path)
        } else {
            headers
                .get(&header_name.to_lowercase())
                .cloned()
                .ok_or_else(|| AppError::BadRequest(format!("Missing header: {header_name}")))?
        };

        parts.push(format!("{header_name}: {value}"));
    }

    Ok(parts.join("\n"))
}

/// Verify an HTTP Signature.
///
/// `headers` maps lowercase header names to values. Returns `Ok(false)` when
/// the signature does not match the key, and an error when the inputs cannot
/// be decoded or a signed header is missing.
pub fn verify_signature(
    signature: &HttpSignature,
    public_key_pem: &str,
    method: &str,
    path: &str,
    headers: &HashMap<String, String>,
) -> AppResult<bool> {
    let sig_string = build_signature_string(method, path, headers, &signature.headers)?;

    let sig_bytes = BASE64
        .decode(&signature.signature)
        .map_err(|e| AppError::BadRequest(format!("Invalid signature encoding: {e}")))?;
    let signature_obj = Signature::try_from(sig_bytes.as_slice())
        .map_err(|e| AppError::BadRequest(format!("Invalid signature format: {e}")))?;

    let verifying_key = VerifyingKey::<Sha256>::new(parse_public_key(public_key_pem)?);
    Ok(verifying_key
        .verify(sig_string.as_bytes(), &signature_obj)
        .is_ok())
}

/// Sign an HTTP request.
///
/// Signs `(request-target)`, `host`, `date` and, when a body is given,
/// `digest`. The request target includes the query string.
pub fn sign_request(
    private_key: &RsaPrivateKey,
    key_id: &str,
    method: &str,
    url: &Url,
    body: Option<&[u8]>,
) -> AppResult<SignedHeaders> {
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(AppError::Signing(format!("No host in URL: {url}"))),
    };
    let target = match url.query() {
        Some(q) => format!("{}?{q}", url.path()),
        None => url.path().to_string(),
    };

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(calculate_digest);

    let mut headers = HashMap::new();
    headers.insert("host".to_string(), host.clone());
    headers.insert("date".to_string(), date.clone());
    let mut names = vec![
        "(request-target)".to_string(),
        "host".to_string(),
        "date".to_string(),
    ];
    if let Some(ref d) = digest {
        headers.insert("digest".to_string(), d.clone());
        names.push("digest".to_string());
    }

    let sig_string = build_signature_string(method, &target, &headers, &names)?;

    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let signature = signing_key
        .try_sign(sig_string.as_bytes())
        .map_err(|e| AppError::Signing(e.to_string()))?;
    let sig_base64 = BASE64.encode(signature.to_bytes());

    Ok(SignedHeaders {
        host,
        date,
        digest,
        signature: format!(
            r#"keyId="{}",algorithm="rsa-sha256",headers="{}",signature="{}""#,
            key_id,
            names.join(" "),
            sig_base64
        ),
    })
}

/// Calculate SHA-256 digest of a body.
#[must_use]
pub fn calculate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256Hasher::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::{generate_rsa_keypair, parse_private_key};

    #[test]
    fn test_parse_signature_header() {
        let header = r#"keyId="https://example.com/users/test#main-key",algorithm="rsa-sha256",headers="(request-target) host date digest",signature="abc123==""#;

        let sig = HttpSignature::parse(header).unwrap();

        assert_eq!(sig.key_id, "https://example.com/users/test#main-key");
        assert_eq!(sig.algorithm, "rsa-sha256");
        assert_eq!(
            sig.headers,
            vec!["(request-target)", "host", "date", "digest"]
        );
        assert_eq!(sig.signature, "abc123==");
    }

    #[test]
    fn test_parse_rejects_missing_key_id() {
        let err = HttpSignature::parse(r#"signature="abc""#).unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_build_signature_string() {
        let mut headers = HashMap::new();
        headers.insert("host".to_string(), "example.com".to_string());
        headers.insert(
            "date".to_string(),
            "Sun, 06 Nov 1994 08:49:37 GMT".to_string(),
        );

        let signed_headers = vec![
            "(request-target)".to_string(),
            "host".to_string(),
            "date".to_string(),
        ];

        let sig_string =
            build_signature_string("POST", "/inbox", &headers, &signed_headers).unwrap();

        assert_eq!(
            sig_string,
            "(request-target): post /inbox\nhost: example.com\ndate: Sun, 06 Nov 1994 08:49:37 GMT"
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = generate_rsa_keypair().unwrap();
        let private_key = parse_private_key(&keypair.private_key_pem).unwrap();
        let url = Url::parse("https://remote.example:8443/users/bob/inbox?x=1").unwrap();
        let body = br#"{"type":"Create"}"#;

        let signed = sign_request(
            &private_key,
            "https://tern.example/users/alice#main-key",
            "POST",
            &url,
            Some(body),
        )
        .unwrap();

        assert_eq!(signed.host, "remote.example:8443");
        assert_eq!(signed.digest.as_deref(), Some(calculate_digest(body).as_str()));
        assert_eq!(signed.iter().count(), 4);

        let parsed = HttpSignature::parse(&signed.signature).unwrap();
        assert_eq!(parsed.key_id, "https://tern.example/users/alice#main-key");
        assert_eq!(parsed.headers, vec!["(request-target)", "host", "date", "digest"]);

        let mut headers = HashMap::new();
        headers.insert("host".to_string(), signed.host.clone());
        headers.insert("date".to_string(), signed.date.clone());
        headers.insert("digest".to_string(), signed.digest.clone().unwrap());
        assert!(
            verify_signature(
                &parsed,
                &keypair.public_key_pem,
                "POST",
                "/users/bob/inbox?x=1",
                &headers
            )
            .unwrap()
        );

        // A different body digest no longer matches.
        headers.insert("digest".to_string(), calculate_digest(b"{}"));
        assert!(
            !verify_signature(
                &parsed,
                &keypair.public_key_pem,
                "POST",
                "/users/bob/inbox?x=1",
                &headers
            )
            .unwrap()
        );
    }

    #[test]
    fn test_verify_with_other_key_fails() {
        let signer = generate_rsa_keypair().unwrap();
        let other = generate_rsa_keypair().unwrap();
        let private_key = parse_private_key(&signer.private_key_pem).unwrap();
        let url = Url::parse("https://tern.example/inbox").unwrap();

        let signed = sign_request(&private_key, "k", "POST", &url, Some(b"{}")).unwrap();
        let parsed = HttpSignature::parse(&signed.signature).unwrap();
        let headers: HashMap<String, String> = signed
            .iter()
            .map(|(name, value)| (name.to_lowercase(), value.to_string()))
            .collect();

        assert!(
            verify_signature(&parsed, &signer.public_key_pem, "POST", "/inbox", &headers).unwrap()
        );
        assert!(
            !verify_signature(&parsed, &other.public_key_pem, "POST", "/inbox", &headers).unwrap()
        );
    }

    #[test]
    fn test_verify_missing_signed_header_is_client_error() {
        let keypair = generate_rsa_keypair().unwrap();
        let parsed = HttpSignature::parse(
            r#"keyId="k",headers="(request-target) host date digest",signature="AAAA""#,
        )
        .unwrap();
        let mut headers = HashMap::new();
        headers.insert("host".to_string(), "tern.example".to_string());

        let err =
            verify_signature(&parsed, &keypair.public_key_pem, "POST", "/inbox", &headers)
                .unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_sign_without_body_has_no_digest() {
        let keypair = generate_rsa_keypair().unwrap();
        let private_key = parse_private_key(&keypair.private_key_pem).unwrap();
        let url = Url::parse("https://remote.example/notes/1").unwrap();

        let signed = sign_request(&private_key, "k", "GET", &url, None).unwrap();
        assert!(signed.digest.is_none());
        assert!(signed.signature.contains(r#"headers="(request-target) host date""#));
    }

    #[test]
    fn test_calculate_digest() {
        let digest = calculate_digest(b"hello world");
        assert_eq!(digest, "SHA-256=uU0nuZNNPgilLlLX2n2r+sSE7+N6U4DukIj3rOLvzek=");
    }
}
