// # Inbound demux
//
// Every inbound request lands here and is classified, first match wins:
// forward proxy (CONNECT / absolute-URI), control plane (reserved paths),
// token-scoped action (`/{token}/api/...`, inherit-lease only), token
// mismatch (403), reverse proxy (everything else). Token comparison uses
// percent-decoded segments; malformed encoding is treated as non-matching.

use http::{Method, Uri};

use crate::util::percent_decode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteClass {
    Forward,
    ControlPlane,
    /// Path after the token, without a leading slash (starts with `api/`).
    TokenAction { rest: String },
    AuthFailed,
    /// Path after the token (or the whole path when no token is set),
    /// without a leading slash.
    Reverse { rest: String },
}

const CONTROL_PREFIXES: &[&str] = &["/api", "/ui"];

pub fn classify(method: &Method, uri: &Uri, proxy_token: &str) -> RouteClass {
    // 1. Explicit-proxy shapes.
    if method == Method::CONNECT || uri.scheme().is_some() {
        return RouteClass::Forward;
    }
    let path = uri.path();

    // 2. Reserved control-plane paths.
    if path == "/" || path == "/healthz" {
        return RouteClass::ControlPlane;
    }
    for prefix in CONTROL_PREFIXES {
        if path == *prefix || path.starts_with(&format!("{prefix}/")) {
            return RouteClass::ControlPlane;
        }
    }

    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let (first, rest) = match trimmed.split_once('/') {
        Some((f, r)) => (f, r),
        None => (trimmed, ""),
    };
    let first_decoded = percent_decode(first);

    if !proxy_token.is_empty() {
        let token_matches = first_decoded.as_deref() == Some(proxy_token);
        if token_matches {
            // 3. `/{token}/api/...` is the token-action namespace.
            let second = rest.split('/').next().unwrap_or("");
            if second == "api" {
                return RouteClass::TokenAction {
                    rest: rest.to_string(),
                };
            }
            // 5. Token-prefixed reverse path.
            return RouteClass::Reverse {
                rest: rest.to_string(),
            };
        }
        // 4. Wrong or undecodable token.
        return RouteClass::AuthFailed;
    }

    // 5. No token configured: the whole path is the reverse grammar.
    RouteClass::Reverse {
        rest: trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_connect_is_forward() {
        let c = classify(&Method::CONNECT, &uri("example.com:443"), "tok");
        assert_eq!(c, RouteClass::Forward);
    }

    #[test]
    fn test_absolute_uri_is_forward() {
        let c = classify(&Method::GET, &uri("http://example.com/x"), "tok");
        assert_eq!(c, RouteClass::Forward);
    }

    #[test]
    fn test_reserved_paths_are_control_plane() {
        for p in ["/", "/healthz", "/api", "/api/v1/nodes", "/ui", "/ui/platforms"] {
            assert_eq!(
                classify(&Method::GET, &uri(p), "tok"),
                RouteClass::ControlPlane,
                "path {p}"
            );
        }
    }

    #[test]
    fn test_token_api_namespace_is_token_action() {
        let c = classify(
            &Method::GET,
            &uri("/tok/api/v1/x/actions/inherit-lease"),
            "tok",
        );
        assert_eq!(
            c,
            RouteClass::TokenAction {
                rest: "api/v1/x/actions/inherit-lease".to_string()
            }
        );
    }

    #[test]
    fn test_wrong_token_is_auth_failed() {
        let c = classify(
            &Method::GET,
            &uri("/wrong/plat/https/example.com/x"),
            "tok",
        );
        assert_eq!(c, RouteClass::AuthFailed);
    }

    #[test]
    fn test_token_prefixed_reverse() {
        let c = classify(
            &Method::GET,
            &uri("/tok/plat/https/example.com/x"),
            "tok",
        );
        assert_eq!(
            c,
            RouteClass::Reverse {
                rest: "plat/https/example.com/x".to_string()
            }
        );
    }

    #[test]
    fn test_percent_encoded_token_matches() {
        let c = classify(&Method::GET, &uri("/t%20k/plat/https/h.example/x"), "t k");
        assert_eq!(
            c,
            RouteClass::Reverse {
                rest: "plat/https/h.example/x".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_encoding_falls_through_to_auth_failed() {
        let c = classify(&Method::GET, &uri("/t%zzk/plat/https/h.example/x"), "tok");
        assert_eq!(c, RouteClass::AuthFailed);
    }

    #[test]
    fn test_empty_token_everything_is_reverse() {
        let c = classify(&Method::GET, &uri("/anything/api/v1/system/info"), "");
        assert_eq!(
            c,
            RouteClass::Reverse {
                rest: "anything/api/v1/system/info".to_string()
            }
        );
    }
}
