//! HTTP transport routed through a Tor SOCKS port

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, HOST, ORIGIN, REFERER};
use reqwest::redirect::Policy;
use reqwest::tls;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{Result, TorPoolError};
use crate::models::{HttpSettings, ProcessInstanceConfig};

/// Build the `reqwest::Client` a proxied client owns
#[instrument(skip(settings, process), fields(socks_port = process.socks_port))]
pub fn build_transport(
    settings: &HttpSettings,
    process: &ProcessInstanceConfig,
) -> Result<reqwest::Client> {
    let redirect = if settings.follow_redirects {
        Policy::limited(settings.max_redirects)
    } else {
        Policy::none()
    };

    let mut builder = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(process.socks_proxy_url())?)
        .redirect(redirect)
        .gzip(settings.decompress)
        .brotli(settings.decompress)
        .cookie_store(settings.use_cookies)
        .default_headers(default_headers(settings)?)
        .timeout(settings.timeout());

    if let Some(ref version) = settings.min_tls_version {
        builder = builder.min_tls_version(parse_tls_version(version)?);
    }

    if let Some(ref agent) = settings.user_agent {
        builder = builder.user_agent(agent.as_str());
    }

    debug!(
        "Building transport through {} (redirects: {}, cookies: {})",
        process.socks_proxy_url(),
        settings.follow_redirects,
        settings.use_cookies
    );

    Ok(builder.build()?)
}

/// Headers sent with every request
pub fn default_headers(settings: &HttpSettings) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    if !settings.accept.is_empty() {
        headers.insert(ACCEPT, header_value(&settings.accept)?);
    }

    if settings.set_origin_headers {
        if let Some(ref base) = settings.base_address {
            let base = Url::parse(base)?;
            let host = base
                .host_str()
                .ok_or_else(|| TorPoolError::InvalidConfig(format!("base address {} has no host", base)))?;
            let authority = match base.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };

            headers.insert(HOST, header_value(&authority)?);
            headers.insert(
                ORIGIN,
                header_value(&format!("{}://{}", base.scheme(), authority))?,
            );
            headers.insert(REFERER, header_value(base.as_str())?);
        }
    }

    for (name, value) in &settings.default_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TorPoolError::InvalidConfig(format!("invalid header name {}: {}", name, e)))?;
        headers.insert(name, header_value(value)?);
    }

    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| TorPoolError::InvalidConfig(format!("invalid header value {:?}: {}", value, e)))
}

pub fn parse_tls_version(version: &str) -> Result<tls::Version> {
    match version.trim() {
        "1.0" => Ok(tls::Version::TLS_1_0),
        "1.1" => Ok(tls::Version::TLS_1_1),
        "1.2" => Ok(tls::Version::TLS_1_2),
        "1.3" => Ok(tls::Version::TLS_1_3),
        other => Err(TorPoolError::InvalidConfig(format!(
            "unsupported TLS version: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_headers_from_base_address() {
        let settings = HttpSettings {
            base_address: Some("https://example.com:8443/app/".to_string()),
            ..HttpSettings::default()
        };

        let headers = default_headers(&settings).unwrap();

        assert_eq!(headers[HOST], "example.com:8443");
        assert_eq!(headers[ORIGIN], "https://example.com:8443");
        assert_eq!(headers[REFERER], "https://example.com:8443/app/");
        assert!(headers.contains_key(ACCEPT));
    }

    #[test]
    fn test_origin_headers_can_be_disabled() {
        let settings = HttpSettings {
            base_address: Some("https://example.com".to_string()),
            set_origin_headers: false,
            ..HttpSettings::default()
        };

        let headers = default_headers(&settings).unwrap();
        assert!(!headers.contains_key(ORIGIN));
        assert!(!headers.contains_key(HOST));
    }

    #[test]
    fn test_custom_headers() {
        let mut settings = HttpSettings::default();
        settings
            .default_headers
            .insert("X-Trace".to_string(), "abc".to_string());

        let headers = default_headers(&settings).unwrap();
        assert_eq!(headers["x-trace"], "abc");

        settings
            .default_headers
            .insert("bad header".to_string(), "x".to_string());
        assert!(default_headers(&settings).unwrap_err().is_config_error());
    }

    #[test]
    fn test_tls_versions() {
        assert_eq!(parse_tls_version("1.2").unwrap(), tls::Version::TLS_1_2);
        assert_eq!(parse_tls_version(" 1.3 ").unwrap(), tls::Version::TLS_1_3);
        assert!(parse_tls_version("2.0").is_err());
    }

    #[test]
    fn test_build_transport() {
        let settings = HttpSettings {
            user_agent: Some("torpool-test".to_string()),
            use_cookies: true,
            ..HttpSettings::default()
        };
        assert!(build_transport(&settings, &ProcessInstanceConfig::default()).is_ok());

        let bad = HttpSettings {
            min_tls_version: Some("0.9".to_string()),
            ..HttpSettings::default()
        };
        assert!(build_transport(&bad, &ProcessInstanceConfig::default()).is_err());
    }
}
