use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
///
/// Media URLs come from server-supplied feed content, so they are checked
/// against SSRF-style targets before the client fetches them.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
    /// The URL embeds a username or password.
    #[error("Credentials in URL not allowed")]
    EmbeddedCredentials,
}

/// Validates the configured backend base URL.
///
/// `allow_private` admits loopback and private-range hosts, for local
/// development backends.
///
/// # Errors
///
/// Returns [`UrlValidationError`] if the URL does not parse, is not
/// http(s), or targets a private host while `allow_private` is false.
pub fn validate_api_url(url_str: &str, allow_private: bool) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;
    check_scheme(&url)?;
    if !allow_private {
        check_host(&url)?;
    }
    Ok(url)
}

/// Validates a media URL taken from feed content before prefetching it.
///
/// Same rules as [`validate_api_url`], and additionally rejects URLs that
/// carry credentials.
///
/// # Examples
///
/// ```
/// use feedsync::util::validate_media_url;
///
/// assert!(validate_media_url("https://cdn.example.com/a.jpg", false).is_ok());
/// assert!(validate_media_url("http://192.168.1.1/a.jpg", false).is_err());
/// assert!(validate_media_url("file:///etc/passwd", true).is_err());
/// ```
pub fn validate_media_url(url_str: &str, allow_private: bool) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;
    check_scheme(&url)?;
    if !url.username().is_empty() || url.password().is_some() {
        return Err(UrlValidationError::EmbeddedCredentials);
    }
    if !allow_private {
        check_host(&url)?;
    }
    Ok(url)
}

fn check_scheme(url: &Url) -> Result<(), UrlValidationError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }
}

fn check_host(url: &Url) -> Result<(), UrlValidationError> {
    if let Some(host) = url.host_str() {
        if host == "localhost" {
            return Err(UrlValidationError::Localhost);
        }

        // Strip brackets from IPv6 addresses for parsing
        let host_for_parse = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
            if ip.is_loopback() {
                return Err(UrlValidationError::Localhost);
            }
            if is_private_ip(&ip) {
                return Err(UrlValidationError::PrivateIp(ip.to_string()));
            }
        }
    }
    Ok(())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}
