//! Credential extraction from redirect locators.
//!
//! A provider redirect may carry a credential in any of three places:
//!
//! 1. `?code=...` (PKCE authorization code)
//! 2. `#access_token=...&refresh_token=...` (implicit flow fragment)
//! 3. `?access_token=...&refresh_token=...` (token pair in the query)
//!
//! [`extract_candidates`] returns every credential it can find, in that
//! priority order. Extraction never fails: a locator that cannot be parsed
//! simply yields no candidates. Fragment decoding is attempted with a
//! structured parser first and falls back to manual `&`/`=` splitting so
//! that fragments such as `#/access_token=...` still produce a candidate.

use crate::types::CredentialCandidate;
use serde::Deserialize;
use url::{form_urlencoded, Url};

const RELATIVE_BASE: &str = "http://localhost/";

/// An `error`/`error_description` pair reported by the provider in the redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRedirectError {
    pub code: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
struct FragmentTokens {
    access_token: String,
    refresh_token: String,
}

/// Every credential found in `locator`, highest priority first.
///
/// Accepts absolute URLs as well as relative locators such as
/// `/auth/callback?code=abc`.
///
/// # Examples
///
/// ```
/// use core_auth::extractor::extract_candidates;
/// use core_auth::CredentialKind;
///
/// let found = extract_candidates("/auth/callback?code=abc#access_token=t&refresh_token=r");
/// let kinds: Vec<_> = found.iter().map(|c| c.kind()).collect();
///
/// assert_eq!(
///     kinds,
///     vec![CredentialKind::AuthorizationCode, CredentialKind::AccessTokenFragment]
/// );
/// ```
pub fn extract_candidates(locator: &str) -> Vec<CredentialCandidate> {
    let Some(url) = parse_locator(locator) else {
        return Vec::new();
    };

    let mut candidates = Vec::new();

    if let Some(code) = query_value(&url, "code") {
        candidates.push(CredentialCandidate::AuthorizationCode { code });
    }

    if let Some((access_token, refresh_token)) = url.fragment().and_then(fragment_tokens) {
        candidates.push(CredentialCandidate::AccessTokenFragment {
            access_token,
            refresh_token,
        });
    }

    if let (Some(access_token), Some(refresh_token)) = (
        query_value(&url, "access_token"),
        query_value(&url, "refresh_token"),
    ) {
        candidates.push(CredentialCandidate::AccessTokenQuery {
            access_token,
            refresh_token,
        });
    }

    candidates
}

/// The error the provider reported in the redirect, if any.
///
/// The query string wins over the fragment.
pub fn provider_error(locator: &str) -> Option<ProviderRedirectError> {
    let url = parse_locator(locator)?;

    let from_pairs = |pairs: Vec<(String, String)>| {
        let lookup = |key: &str| {
            pairs
                .iter()
                .find(|(k, v)| k == key && !v.is_empty())
                .map(|(_, v)| v.clone())
        };
        let code = lookup("error").or_else(|| lookup("error_code"))?;
        Some(ProviderRedirectError {
            code,
            description: lookup("error_description"),
        })
    };

    let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    from_pairs(query).or_else(|| url.fragment().and_then(|f| from_pairs(split_pairs(f))))
}

fn parse_locator(locator: &str) -> Option<Url> {
    let trimmed = locator.trim();
    if trimmed.is_empty() {
        return None;
    }
    match Url::parse(trimmed) {
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(RELATIVE_BASE).ok()?.join(trimmed).ok()
        }
        Err(_) => None,
    }
}

fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn fragment_tokens(fragment: &str) -> Option<(String, String)> {
    structured_fragment_tokens(fragment).or_else(|| manual_fragment_tokens(fragment))
}

fn structured_fragment_tokens(fragment: &str) -> Option<(String, String)> {
    let tokens: FragmentTokens = serde_urlencoded::from_str(fragment).ok()?;
    non_empty_pair(tokens.access_token, tokens.refresh_token)
}

fn manual_fragment_tokens(fragment: &str) -> Option<(String, String)> {
    let pairs = split_pairs(fragment);
    let first = |key: &str| {
        pairs
            .iter()
            .find(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.clone())
    };
    non_empty_pair(first("access_token")?, first("refresh_token")?)
}

/// Split on `&`, then on the first `=`, tolerating stray `#`, `/` or `?`
/// in front of keys.
fn split_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|part| !part.is_empty())
        .filter_map(|part| form_urlencoded::parse(part.as_bytes()).next())
        .map(|(key, value)| {
            (
                key.trim_start_matches(['#', '/', '?']).to_string(),
                value.into_owned(),
            )
        })
        .collect()
}

fn non_empty_pair(access_token: String, refresh_token: String) -> Option<(String, String)> {
    (!access_token.is_empty() && !refresh_token.is_empty()).then_some((access_token, refresh_token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CredentialKind;

    fn kinds(locator: &str) -> Vec<CredentialKind> {
        extract_candidates(locator).iter().map(|c| c.kind()).collect()
    }

    #[test]
    fn test_code_in_query() {
        let found = extract_candidates("https://app.example.com/auth/callback?code=abc123");
        assert_eq!(
            found,
            vec![CredentialCandidate::AuthorizationCode {
                code: "abc123".into()
            }]
        );
    }

    #[test]
    fn test_relative_locator_is_accepted() {
        assert_eq!(
            kinds("/auth/callback?code=abc"),
            vec![CredentialKind::AuthorizationCode]
        );
    }

    #[test]
    fn test_fragment_tokens() {
        let found =
            extract_candidates("/auth/callback#access_token=tok&refresh_token=ref&token_type=bearer");
        assert_eq!(
            found,
            vec![CredentialCandidate::AccessTokenFragment {
                access_token: "tok".into(),
                refresh_token: "ref".into(),
            }]
        );
    }

    #[test]
    fn test_path_style_fragment_falls_back_to_manual_parsing() {
        let fragment = "/access_token=tok&refresh_token=ref&token_type=bearer";
        assert!(structured_fragment_tokens(fragment).is_none());

        let found = extract_candidates(&format!("/auth/callback#{fragment}"));
        assert_eq!(
            found,
            vec![CredentialCandidate::AccessTokenFragment {
                access_token: "tok".into(),
                refresh_token: "ref".into(),
            }]
        );
    }

    #[test]
    fn test_duplicate_fragment_keys_use_first_value() {
        let fragment = "access_token=first&access_token=second&refresh_token=ref";
        assert!(structured_fragment_tokens(fragment).is_none());
        assert_eq!(
            fragment_tokens(fragment),
            Some(("first".to_string(), "ref".to_string()))
        );
    }

    #[test]
    fn test_structured_and_manual_agree_on_well_formed_fragments() {
        let fragments = [
            "access_token=a.b.c&refresh_token=r1&expires_in=3600",
            "refresh_token=r%2B2&access_token=tok%3D%3D",
            "expires_at=1&token_type=bearer&access_token=x&refresh_token=y",
        ];
        for fragment in fragments {
            assert_eq!(
                structured_fragment_tokens(fragment),
                manual_fragment_tokens(fragment),
                "parsers disagree on {fragment}"
            );
            assert!(structured_fragment_tokens(fragment).is_some());
        }
    }

    #[test]
    fn test_query_tokens() {
        assert_eq!(
            kinds("/auth/callback?access_token=t&refresh_token=r"),
            vec![CredentialKind::AccessTokenQuery]
        );
    }

    #[test]
    fn test_priority_order_when_everything_is_present() {
        assert_eq!(
            kinds("/cb?access_token=q&refresh_token=qr&code=c#access_token=f&refresh_token=fr"),
            vec![
                CredentialKind::AuthorizationCode,
                CredentialKind::AccessTokenFragment,
                CredentialKind::AccessTokenQuery,
            ]
        );
    }

    #[test]
    fn test_incomplete_or_empty_values_are_ignored() {
        assert!(extract_candidates("/cb?code=").is_empty());
        assert!(extract_candidates("/cb#access_token=only").is_empty());
        assert!(extract_candidates("/cb?access_token=t&refresh_token=").is_empty());
        assert!(extract_candidates("/cb").is_empty());
        assert!(extract_candidates("").is_empty());
        assert!(extract_candidates("http://[::1").is_empty());
    }

    #[test]
    fn test_provider_error_from_query_and_fragment() {
        let err = provider_error("/cb?error=access_denied&error_description=User+cancelled").unwrap();
        assert_eq!(err.code, "access_denied");
        assert_eq!(err.description.as_deref(), Some("User cancelled"));

        let err = provider_error("/cb#error=server_error").unwrap();
        assert_eq!(err.code, "server_error");
        assert_eq!(err.description, None);

        assert!(provider_error("/cb?code=abc").is_none());
    }
}
