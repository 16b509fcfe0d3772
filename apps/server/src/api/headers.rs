//! FHIR request header handling

use axum::http::HeaderMap;

use crate::services::bundle::PreferReturn;

/// `return=` preference from the `Prefer` header, if the client sent a recognized one.
///
/// `Prefer: return=minimal, handling=strict` yields `Some(Minimal)`.
pub fn extract_prefer_return(headers: &HeaderMap) -> Option<PreferReturn> {
    headers
        .get_all("prefer")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split([',', ';']))
        .filter_map(|pref| {
            let (name, value) = pref.split_once('=')?;
            if name.trim().eq_ignore_ascii_case("return") {
                PreferReturn::parse(value.trim().trim_matches('"'))
            } else {
                None
            }
        })
        .next()
}

/// Service base derived from the request, honoring reverse-proxy headers.
pub fn build_base_url_from_headers(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get("host"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{}://{}/fhir", scheme, host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_prefer_return() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_prefer_return(&headers), None);

        headers.insert(
            "prefer",
            HeaderValue::from_static("handling=strict; return=minimal"),
        );
        assert_eq!(extract_prefer_return(&headers), Some(PreferReturn::Minimal));

        headers.insert("prefer", HeaderValue::from_static("return=OperationOutcome"));
        assert_eq!(
            extract_prefer_return(&headers),
            Some(PreferReturn::OperationOutcome)
        );

        headers.insert("prefer", HeaderValue::from_static("return=everything"));
        assert_eq!(extract_prefer_return(&headers), None);
    }

    #[test]
    fn test_base_url_from_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("internal:8080"));
        assert_eq!(
            build_base_url_from_headers(&headers),
            "http://internal:8080/fhir"
        );

        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("fhir.example.org"));
        assert_eq!(
            build_base_url_from_headers(&headers),
            "https://fhir.example.org/fhir"
        );
    }
}
