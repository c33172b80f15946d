//! Response content-coding negotiation.
//!
//! A response is compressed only when all of the following hold:
//!
//! - compression is enabled, globally or for this response
//! - the client accepts the coding with a non-zero quality
//! - the content type is on the compressible allow-list
//! - the response is not already content-encoded
//! - the user agent is not a legacy agent known to mishandle compressed css/javascript

use http::HeaderMap;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use mime::Mime;

/// Content codings the engine can apply to a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Gzip,
    Deflate,
}

impl ContentCoding {
    /// Value of the `Content-Encoding` header.
    pub fn name(&self) -> &'static str {
        match self {
            ContentCoding::Gzip => "gzip",
            ContentCoding::Deflate => "deflate",
        }
    }
}

const COMPRESSIBLE_APPLICATION_TYPES: &[&str] =
    &["json", "javascript", "x-javascript", "ecmascript", "xml", "xhtml+xml", "rss+xml", "atom+xml"];

/// Picks the coding preferred by the client, gzip winning ties.
///
/// Returns `None` when nothing acceptable is offered.
pub fn select_coding(accept_encoding: &str) -> Option<ContentCoding> {
    let mut gzip: Option<f32> = None;
    let mut deflate: Option<f32> = None;
    let mut wildcard: Option<f32> = None;

    for item in accept_encoding.split(',') {
        let mut parts = item.split(';');
        let coding = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let quality = parts
            .filter_map(|p| p.trim().strip_prefix("q=").or_else(|| p.trim().strip_prefix("Q=")))
            .find_map(|q| q.trim().parse::<f32>().ok())
            .unwrap_or(1.0);

        match coding.as_str() {
            "gzip" | "x-gzip" => gzip = Some(quality),
            "deflate" => deflate = Some(quality),
            "*" => wildcard = Some(quality),
            _ => {}
        }
    }

    let gzip = gzip.or(wildcard).unwrap_or(0.0);
    let deflate = deflate.or(wildcard).unwrap_or(0.0);

    if gzip <= 0.0 && deflate <= 0.0 {
        return None;
    }
    if gzip >= deflate { Some(ContentCoding::Gzip) } else { Some(ContentCoding::Deflate) }
}

/// Whether a content type is worth compressing.
pub fn is_compressible(content_type: &str) -> bool {
    let Ok(mime) = content_type.parse::<Mime>() else {
        return false;
    };

    if mime.type_() == mime::TEXT {
        return true;
    }
    if mime.type_() == mime::IMAGE && mime.subtype().as_str() == "svg" {
        return mime.suffix().is_some_and(|s| s.as_str() == "xml");
    }
    if mime.type_() != mime::APPLICATION {
        return false;
    }

    let subtype = match mime.suffix() {
        Some(suffix) => format!("{}+{}", mime.subtype(), suffix),
        None => mime.subtype().as_str().to_owned(),
    };
    COMPRESSIBLE_APPLICATION_TYPES.contains(&subtype.as_str())
}

fn is_script_or_style(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.contains("css") || lower.contains("javascript") || lower.contains("ecmascript")
}

/// Old agents that claim gzip support but break on compressed css/javascript.
pub fn is_legacy_agent(user_agent: &str) -> bool {
    if ["MSIE 4.", "MSIE 5.", "MSIE 6."].iter().any(|p| user_agent.contains(p)) {
        return true;
    }
    // Netscape 4.x
    user_agent.starts_with("Mozilla/4.") && !user_agent.contains("compatible")
}

/// Inputs of the compression decision taken from the request.
#[derive(Debug, Clone, Default)]
pub struct EncodingPreferences {
    pub accept_encoding: Option<String>,
    pub user_agent: Option<String>,
}

impl EncodingPreferences {
    /// Decides the coding for a response with the given headers.
    pub fn negotiate(&self, enabled: bool, response_headers: &HeaderMap) -> Option<ContentCoding> {
        if !enabled || response_headers.contains_key(CONTENT_ENCODING) {
            return None;
        }

        let content_type = response_headers.get(CONTENT_TYPE)?.to_str().ok()?;
        if !is_compressible(content_type) {
            return None;
        }

        if is_script_or_style(content_type) && self.user_agent.as_deref().is_some_and(is_legacy_agent) {
            return None;
        }

        select_coding(self.accept_encoding.as_deref()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn select_by_quality() {
        assert_eq!(select_coding("gzip, deflate, br"), Some(ContentCoding::Gzip));
        assert_eq!(select_coding("deflate"), Some(ContentCoding::Deflate));
        assert_eq!(select_coding("gzip;q=0.5, deflate;q=0.8"), Some(ContentCoding::Deflate));
        assert_eq!(select_coding("gzip;q=0"), None);
        assert_eq!(select_coding("br"), None);
        assert_eq!(select_coding("*"), Some(ContentCoding::Gzip));
        assert_eq!(select_coding("*;q=0, deflate"), Some(ContentCoding::Deflate));
        assert_eq!(select_coding("x-gzip"), Some(ContentCoding::Gzip));
        assert_eq!(select_coding(""), None);
    }

    #[test]
    fn compressible_types() {
        assert!(is_compressible("text/html; charset=utf-8"));
        assert!(is_compressible("text/css"));
        assert!(is_compressible("application/json"));
        assert!(is_compressible("application/javascript"));
        assert!(is_compressible("application/xhtml+xml"));
        assert!(is_compressible("image/svg+xml"));
        assert!(!is_compressible("image/png"));
        assert!(!is_compressible("application/octet-stream"));
        assert!(!is_compressible("not a mime"));
    }

    #[test]
    fn legacy_agents() {
        assert!(is_legacy_agent("Mozilla/4.0 (compatible; MSIE 6.0; Windows NT 5.1)"));
        assert!(is_legacy_agent("Mozilla/4.78 [en] (X11; U; Linux)"));
        assert!(!is_legacy_agent("Mozilla/5.0 (X11; Linux x86_64) Firefox/120.0"));
    }

    #[test]
    fn negotiate_response() {
        let prefs = EncodingPreferences {
            accept_encoding: Some("gzip".into()),
            user_agent: Some("Mozilla/4.0 (compatible; MSIE 6.0; Windows NT 5.1)".into()),
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        assert_eq!(prefs.negotiate(true, &headers), Some(ContentCoding::Gzip));
        assert_eq!(prefs.negotiate(false, &headers), None);

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/css"));
        assert_eq!(prefs.negotiate(true, &headers), None);

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        assert_eq!(prefs.negotiate(true, &headers), None);

        let no_accept = EncodingPreferences::default();
        headers.remove(CONTENT_ENCODING);
        assert_eq!(no_accept.negotiate(true, &headers), None);
    }
}
