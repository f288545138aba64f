//! URL validation for the backend endpoint and for media URLs taken from
//! feed content (SSRF protection).

mod url_validator;

pub use url_validator::{validate_api_url, validate_media_url, UrlValidationError};
