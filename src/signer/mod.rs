//! Request signing strategies (§4.4).
//!
//! `sign` is a pure function `(secret, method, path, params, timestamp)
//! -> (params', headers')`; two concrete schemes are supported, matching
//! the two authentication styles the corpus's venues use.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Credentials passed in by the caller; never read from the environment
/// by the core (§6).
#[derive(Debug, Clone)]
pub struct Keys {
    pub api_key: String,
    pub secret: String,
    pub subaccount: Option<String>,
}

/// Strategy object collapsing venue-specific signing differences
/// (REDESIGN FLAGS "dynamic type dispatch on venue").
pub trait Signer: Send + Sync {
    /// Sign a request, returning the (possibly augmented) query
    /// parameters and the headers to attach.
    fn sign(
        &self,
        keys: &Keys,
        method: &str,
        path: &str,
        params: &[(String, String)],
        timestamp: i64,
    ) -> (Vec<(String, String)>, Vec<(String, String)>);
}

/// Scheme 1: HMAC-SHA256 over `urlencode(params+{timestamp})`, appended
/// as a `signature` query parameter; API key travels in a header.
pub struct HmacQuerySigner;

impl Signer for HmacQuerySigner {
    fn sign(
        &self,
        keys: &Keys,
        _method: &str,
        _path: &str,
        params: &[(String, String)],
        timestamp: i64,
    ) -> (Vec<(String, String)>, Vec<(String, String)>) {
        let mut signed_params = params.to_vec();
        signed_params.push(("timestamp".to_string(), timestamp.to_string()));

        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(signed_params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();

        let mut mac = HmacSha256::new_from_slice(keys.secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        signed_params.push(("signature".to_string(), signature));

        let headers = vec![("X-API-KEY".to_string(), keys.api_key.clone())];
        (signed_params, headers)
    }
}

/// Scheme 2: HMAC-SHA256 over `timestamp || method.upper() || path ||
/// json(body)?`, split across three headers with an optional
/// `SUBACCOUNT` header.
pub struct HmacHeaderSigner;

impl Signer for HmacHeaderSigner {
    fn sign(
        &self,
        keys: &Keys,
        method: &str,
        path: &str,
        params: &[(String, String)],
        timestamp: i64,
    ) -> (Vec<(String, String)>, Vec<(String, String)>) {
        let body = if params.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&params.iter().cloned().collect::<std::collections::BTreeMap<_, _>>())
                .unwrap_or_default()
        };

        let payload = format!("{timestamp}{}{path}{body}", method.to_uppercase());
        let mut mac = HmacSha256::new_from_slice(keys.secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let mut headers = vec![
            ("KEY".to_string(), keys.api_key.clone()),
            ("SIGN".to_string(), signature),
            ("TS".to_string(), timestamp.to_string()),
        ];
        if let Some(subaccount) = &keys.subaccount {
            headers.push(("SUBACCOUNT".to_string(), subaccount.clone()));
        }
        (params.to_vec(), headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Keys {
        Keys {
            api_key: "key".to_string(),
            secret: "secret".to_string(),
            subaccount: None,
        }
    }

    #[test]
    fn query_signer_appends_signature_and_timestamp() {
        let signer = HmacQuerySigner;
        let (params, headers) = signer.sign(&keys(), "GET", "/orders", &[("symbol".to_string(), "BTCUSDT".to_string())], 1000);
        assert!(params.iter().any(|(k, _)| k == "signature"));
        assert!(params.iter().any(|(k, v)| k == "timestamp" && v == "1000"));
        assert_eq!(headers, vec![("X-API-KEY".to_string(), "key".to_string())]);
    }

    #[test]
    fn header_signer_emits_key_sign_ts() {
        let signer = HmacHeaderSigner;
        let (_, headers) = signer.sign(&keys(), "post", "/orders", &[], 1000);
        let names: Vec<_> = headers.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(names, vec!["KEY", "SIGN", "TS"]);
    }

    #[test]
    fn header_signer_includes_subaccount_when_present() {
        let mut k = keys();
        k.subaccount = Some("sub-1".to_string());
        let signer = HmacHeaderSigner;
        let (_, headers) = signer.sign(&k, "post", "/orders", &[], 1000);
        assert!(headers.iter().any(|(k, v)| k == "SUBACCOUNT" && v == "sub-1"));
    }

    #[test]
    fn signing_is_deterministic() {
        let signer = HmacHeaderSigner;
        let (_, h1) = signer.sign(&keys(), "GET", "/a", &[], 42);
        let (_, h2) = signer.sign(&keys(), "GET", "/a", &[], 42);
        assert_eq!(h1, h2);
    }
}
