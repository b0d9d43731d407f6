use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};

use crate::error::ApiError;
use crate::models::datasource::{AuthType, DataSource};

const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

fn missing(key: &str) -> ApiError {
    ApiError::invalid(format!("invalid auth config: missing required field {key}"))
}

fn required<'a>(ds: &'a DataSource, key: &str) -> Result<&'a str, ApiError> {
    ds.auth_config_str(key).ok_or_else(|| missing(key))
}

/// Apply the datasource's credential scheme to an outbound request and hand
/// back the ready-to-send request. Credential material stays on the request;
/// nothing here is ever logged.
pub fn apply(builder: reqwest::RequestBuilder, ds: &DataSource) -> Result<reqwest::Request, ApiError> {
    match ds.auth_type {
        AuthType::None => builder.build().map_err(ApiError::from_reqwest),
        AuthType::Basic => {
            let username = required(ds, "username")?;
            let password = ds.auth_config_str("password");
            builder.basic_auth(username, password).build().map_err(ApiError::from_reqwest)
        }
        AuthType::Bearer => {
            let token = required(ds, "token")?;
            builder.bearer_auth(token).build().map_err(ApiError::from_reqwest)
        }
        AuthType::ApiKey => {
            let value = required(ds, "value")?;
            let header = ds.auth_config_str("header").unwrap_or(DEFAULT_API_KEY_HEADER);
            let name = HeaderName::from_bytes(header.as_bytes())
                .map_err(|_| ApiError::invalid(format!("invalid auth config: bad header name {header}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ApiError::invalid("invalid auth config: api key value is not a valid header"))?;
            builder.header(name, value).build().map_err(ApiError::from_reqwest)
        }
        AuthType::Cloud => {
            let mut request = builder.build().map_err(ApiError::from_reqwest)?;
            sign_cloud(&mut request, ds)?;
            Ok(request)
        }
    }
}

/// Header-only variant for protocols where we cannot re-sign the payload
/// (the WebSocket tail upgrade). Cloud signing is body-dependent and has no
/// streaming backends, so it is rejected here.
pub fn static_headers(ds: &DataSource) -> Result<Vec<(HeaderName, HeaderValue)>, ApiError> {
    match ds.auth_type {
        AuthType::None => Ok(Vec::new()),
        AuthType::Basic => {
            let username = required(ds, "username")?;
            let password = ds.auth_config_str("password").unwrap_or("");
            let encoded = BASE64.encode(format!("{username}:{password}"));
            let value = HeaderValue::from_str(&format!("Basic {encoded}"))
                .map_err(|_| ApiError::invalid("invalid auth config: credentials are not header-safe"))?;
            Ok(vec![(AUTHORIZATION, value)])
        }
        AuthType::Bearer => {
            let token = required(ds, "token")?;
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ApiError::invalid("invalid auth config: token is not header-safe"))?;
            Ok(vec![(AUTHORIZATION, value)])
        }
        AuthType::ApiKey => {
            let raw = required(ds, "value")?;
            let header = ds.auth_config_str("header").unwrap_or(DEFAULT_API_KEY_HEADER);
            let name = HeaderName::from_bytes(header.as_bytes())
                .map_err(|_| ApiError::invalid(format!("invalid auth config: bad header name {header}")))?;
            let value = HeaderValue::from_str(raw)
                .map_err(|_| ApiError::invalid("invalid auth config: api key value is not a valid header"))?;
            Ok(vec![(name, value)])
        }
        AuthType::Cloud => Err(ApiError::invalid(
            "unsupported auth type: cloud signing is not available for streaming connections",
        )),
    }
}

/// SigV4-sign a built request in place. The signing service name is taken
/// from `auth_config.service`, falling back to the first host label of AWS
/// endpoints (`monitoring.eu-west-1.amazonaws.com` → `monitoring`).
fn sign_cloud(request: &mut reqwest::Request, ds: &DataSource) -> Result<(), ApiError> {
    use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningSettings, sign};
    use aws_sigv4::sign::v4;

    let region = required(ds, "region")?.to_string();
    let access_key_id = required(ds, "access_key_id")?.to_string();
    let secret_access_key = required(ds, "secret_access_key")?.to_string();
    let session_token = ds.auth_config_str("session_token").map(str::to_string);

    let service = ds
        .auth_config_str("service")
        .map(str::to_string)
        .or_else(|| service_from_host(request.url()))
        .unwrap_or_else(|| "monitoring".to_string());

    let credentials = aws_credential_types::Credentials::new(
        access_key_id,
        secret_access_key,
        session_token,
        None,
        "datasource",
    );
    let identity = credentials.into();
    let params: aws_sigv4::http_request::SigningParams<'_> = v4::SigningParams::builder()
        .identity(&identity)
        .region(&region)
        .name(&service)
        .time(std::time::SystemTime::now())
        .settings(SigningSettings::default())
        .build()
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("sigv4 params: {e}")))?
        .into();

    let body = match request.body().and_then(|b| b.as_bytes()) {
        Some(bytes) => SignableBody::Bytes(bytes),
        None => SignableBody::Bytes(&[]),
    };
    let headers: Vec<(String, String)> = request
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    let signable = SignableRequest::new(
        request.method().as_str(),
        request.url().as_str(),
        headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        body,
    )
    .map_err(|e| ApiError::Internal(anyhow::anyhow!("sigv4 request: {e}")))?;

    let (instructions, _signature) = sign(signable, &params)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("sigv4 signing: {e}")))?
        .into_parts();

    for (name, value) in instructions.headers() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("sigv4 header: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("sigv4 header value: {e}")))?;
        request.headers_mut().insert(name, value);
    }
    Ok(())
}

fn service_from_host(url: &reqwest::Url) -> Option<String> {
    let host = url.host_str()?;
    if !host.ends_with(".amazonaws.com") {
        return None;
    }
    host.split('.').next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::datasource::DsType;

    fn ds(auth_type: AuthType, auth_config: serde_json::Value) -> DataSource {
        DataSource {
            id: "d1".into(),
            organization_id: "o1".into(),
            name: "ds".into(),
            ds_type: DsType::Prometheus,
            url: "http://backend:9090".into(),
            auth_type,
            auth_config: auth_config.as_object().cloned().unwrap_or_default(),
            config: serde_json::Map::new(),
            is_default: false,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn build(ds: &DataSource) -> reqwest::Request {
        let client = reqwest::Client::new();
        apply(client.get("http://backend:9090/api"), ds).unwrap()
    }

    #[test]
    fn none_is_a_no_op() {
        let req = build(&ds(AuthType::None, serde_json::json!({})));
        assert!(req.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn basic_sets_authorization() {
        let req = build(&ds(
            AuthType::Basic,
            serde_json::json!({"username": "alice", "password": "pw"}),
        ));
        let value = req.headers().get(AUTHORIZATION).unwrap().to_str().unwrap();
        assert!(value.starts_with("Basic "));
    }

    #[test]
    fn bearer_sets_authorization() {
        let req = build(&ds(AuthType::Bearer, serde_json::json!({"token": "tok123"})));
        assert_eq!(req.headers().get(AUTHORIZATION).unwrap(), "Bearer tok123");
    }

    #[test]
    fn api_key_defaults_header_name() {
        let req = build(&ds(AuthType::ApiKey, serde_json::json!({"value": "k"})));
        assert_eq!(req.headers().get("X-API-Key").unwrap(), "k");

        let req = build(&ds(
            AuthType::ApiKey,
            serde_json::json!({"value": "k", "header": "X-Custom"}),
        ));
        assert_eq!(req.headers().get("X-Custom").unwrap(), "k");
    }

    #[test]
    fn missing_required_fields_fail() {
        let client = reqwest::Client::new();
        for (auth_type, cfg) in [
            (AuthType::Basic, serde_json::json!({})),
            (AuthType::Bearer, serde_json::json!({"token": ""})),
            (AuthType::ApiKey, serde_json::json!({"header": "X-K"})),
            (AuthType::Cloud, serde_json::json!({"region": "eu-west-1"})),
        ] {
            let d = ds(auth_type, cfg);
            let result = apply(client.get("http://backend:9090/api"), &d);
            assert!(result.is_err(), "{auth_type:?} must require its fields");
        }
    }

    #[test]
    fn static_headers_reject_cloud() {
        let d = ds(
            AuthType::Cloud,
            serde_json::json!({"region": "r", "access_key_id": "a", "secret_access_key": "s"}),
        );
        assert!(static_headers(&d).is_err());
    }

    #[test]
    fn static_headers_encode_basic() {
        let d = ds(AuthType::Basic, serde_json::json!({"username": "u", "password": "p"}));
        let headers = static_headers(&d).unwrap();
        assert_eq!(headers[0].0, AUTHORIZATION);
        assert_eq!(headers[0].1.to_str().unwrap(), "Basic dTpw");
    }

    #[test]
    fn cloud_signing_adds_signature_headers() {
        let d = ds(
            AuthType::Cloud,
            serde_json::json!({
                "region": "eu-west-1",
                "access_key_id": "AKIDEXAMPLE",
                "secret_access_key": "secret"
            }),
        );
        let client = reqwest::Client::new();
        let req = apply(
            client
                .post("https://monitoring.eu-west-1.amazonaws.com/")
                .body("{}"),
            &d,
        )
        .unwrap();
        let auth = req.headers().get(AUTHORIZATION).unwrap().to_str().unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256"));
        assert!(auth.contains("/eu-west-1/monitoring/aws4_request"));
        assert!(req.headers().get("x-amz-date").is_some());
    }

    #[test]
    fn service_name_derived_from_aws_host() {
        let url = reqwest::Url::parse("https://logs.us-east-1.amazonaws.com/").unwrap();
        assert_eq!(service_from_host(&url).as_deref(), Some("logs"));
        let url = reqwest::Url::parse("http://localstack:4566/").unwrap();
        assert_eq!(service_from_host(&url), None);
    }
}
