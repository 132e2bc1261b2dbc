// # Account-header rules
//
// Ordered (URL-prefix → header list) rules that derive an account from a
// request when the reverse path does not name one. Prefixes are lowercased
// `host[/path]` and matched longest-first against `host + escaped-path`. The
// reserved `*` fallback always exists: POSTing `*` replaces its headers,
// deleting it is rejected.

use std::sync::Arc;

use http::HeaderMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{ResinError, Result};
use crate::persist::{AccountHeaderRuleRow, StateStore};
use crate::util::now_ns;

pub const FALLBACK_PREFIX: &str = "*";
const DEFAULT_FALLBACK_HEADERS: &[&str] = &["x-resin-account"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountHeaderRule {
    pub url_prefix: String,
    pub headers: Vec<String>,
    pub updated_at_ns: i64,
}

impl AccountHeaderRule {
    pub fn to_row(&self) -> AccountHeaderRuleRow {
        AccountHeaderRuleRow {
            url_prefix: self.url_prefix.clone(),
            headers_json: serde_json::to_string(&self.headers).unwrap_or_default(),
            updated_at_ns: self.updated_at_ns,
        }
    }

    pub fn from_row(row: &AccountHeaderRuleRow) -> Result<Self> {
        Ok(Self {
            url_prefix: row.url_prefix.clone(),
            headers: serde_json::from_str(&row.headers_json)?,
            updated_at_ns: row.updated_at_ns,
        })
    }
}

pub struct AccountHeaderRules {
    // Sorted longest-prefix-first; the fallback sits at the end.
    rules: RwLock<Vec<AccountHeaderRule>>,
    store: Arc<dyn StateStore>,
}

impl AccountHeaderRules {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        let fallback = AccountHeaderRule {
            url_prefix: FALLBACK_PREFIX.to_string(),
            headers: DEFAULT_FALLBACK_HEADERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            updated_at_ns: now_ns(),
        };
        Self {
            rules: RwLock::new(vec![fallback]),
            store,
        }
    }

    /// Normalise a prefix: host lowercased, percent-encoded path retained.
    fn normalize(prefix: &str) -> Result<String> {
        if prefix == FALLBACK_PREFIX {
            return Ok(prefix.to_string());
        }
        if prefix.is_empty() || prefix.starts_with('/') {
            return Err(ResinError::InvalidArgument(format!(
                "rule prefix must start with a host: {prefix:?}"
            )));
        }
        match prefix.split_once('/') {
            Some((host, path)) => Ok(format!("{}/{}", host.to_ascii_lowercase(), path)),
            None => Ok(prefix.to_ascii_lowercase()),
        }
    }

    pub async fn upsert(&self, prefix: &str, headers: Vec<String>) -> Result<AccountHeaderRule> {
        if headers.is_empty() {
            return Err(ResinError::InvalidArgument(
                "rule headers must not be empty".to_string(),
            ));
        }
        let prefix = Self::normalize(prefix)?;
        let rule = AccountHeaderRule {
            url_prefix: prefix.clone(),
            headers: headers.iter().map(|h| h.to_ascii_lowercase()).collect(),
            updated_at_ns: now_ns(),
        };
        self.store
            .upsert_account_header_rules(vec![rule.to_row()])
            .await?;

        let mut rules = self.rules.write();
        rules.retain(|r| r.url_prefix != prefix);
        rules.push(rule.clone());
        sort_rules(&mut rules);
        Ok(rule)
    }

    pub async fn delete(&self, prefix: &str) -> Result<()> {
        if prefix == FALLBACK_PREFIX {
            return Err(ResinError::InvalidArgument(
                "the fallback rule cannot be deleted".to_string(),
            ));
        }
        let prefix = Self::normalize(prefix)?;
        if !self.rules.read().iter().any(|r| r.url_prefix == prefix) {
            return Err(ResinError::NotFound(format!("rule {prefix}")));
        }
        self.store
            .delete_account_header_rules(vec![prefix.clone()])
            .await?;
        self.rules.write().retain(|r| r.url_prefix != prefix);
        Ok(())
    }

    pub fn list(&self) -> Vec<AccountHeaderRule> {
        self.rules.read().clone()
    }

    pub fn get(&self, prefix: &str) -> Option<AccountHeaderRule> {
        let prefix = Self::normalize(prefix).ok()?;
        self.rules
            .read()
            .iter()
            .find(|r| r.url_prefix == prefix)
            .cloned()
    }

    /// Longest-prefix-first match over `host + escaped-path`.
    pub fn matching_rule(&self, host_and_path: &str) -> AccountHeaderRule {
        let input = {
            // Lowercase only the host portion for comparison.
            match host_and_path.split_once('/') {
                Some((host, path)) => format!("{}/{}", host.to_ascii_lowercase(), path),
                None => host_and_path.to_ascii_lowercase(),
            }
        };
        let rules = self.rules.read();
        rules
            .iter()
            .find(|r| r.url_prefix == FALLBACK_PREFIX || input.starts_with(&r.url_prefix))
            .cloned()
            .unwrap_or_else(|| AccountHeaderRule {
                url_prefix: FALLBACK_PREFIX.to_string(),
                headers: Vec::new(),
                updated_at_ns: 0,
            })
    }

    /// Derive the account for a request: the first listed header that is
    /// present wins; otherwise empty.
    pub fn derive_account(&self, host_and_path: &str, headers: &HeaderMap) -> String {
        let rule = self.matching_rule(host_and_path);
        for name in &rule.headers {
            if let Some(value) = headers.get(name.as_str()) {
                if let Ok(v) = value.to_str() {
                    if !v.is_empty() {
                        return v.to_string();
                    }
                }
            }
        }
        String::new()
    }

    /// Restore path: replace everything, re-seeding the fallback if the
    /// store had none.
    pub fn restore(&self, rows: &[AccountHeaderRuleRow]) -> Result<()> {
        let mut rules = Vec::with_capacity(rows.len() + 1);
        for row in rows {
            rules.push(AccountHeaderRule::from_row(row)?);
        }
        if !rules.iter().any(|r| r.url_prefix == FALLBACK_PREFIX) {
            rules.push(AccountHeaderRule {
                url_prefix: FALLBACK_PREFIX.to_string(),
                headers: DEFAULT_FALLBACK_HEADERS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                updated_at_ns: now_ns(),
            });
        }
        sort_rules(&mut rules);
        *self.rules.write() = rules;
        Ok(())
    }

    pub fn snapshot_row(&self, prefix: &str) -> Option<AccountHeaderRuleRow> {
        self.rules
            .read()
            .iter()
            .find(|r| r.url_prefix == prefix)
            .map(|r| r.to_row())
    }
}

/// Longest prefix first; the fallback `*` sorts last.
fn sort_rules(rules: &mut [AccountHeaderRule]) {
    rules.sort_by(|a, b| {
        let a_fallback = a.url_prefix == FALLBACK_PREFIX;
        let b_fallback = b.url_prefix == FALLBACK_PREFIX;
        a_fallback
            .cmp(&b_fallback)
            .then(b.url_prefix.len().cmp(&a.url_prefix.len()))
            .then(a.url_prefix.cmp(&b.url_prefix))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;

    fn rules() -> AccountHeaderRules {
        AccountHeaderRules::new(Arc::new(MemoryStore::new()))
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        map
    }

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let r = rules();
        r.upsert("api.example.com", vec!["x-team".into()])
            .await
            .unwrap();
        r.upsert("api.example.com/v2", vec!["x-tenant".into()])
            .await
            .unwrap();

        let m = r.matching_rule("api.example.com/v2/users");
        assert_eq!(m.url_prefix, "api.example.com/v2");
        let m = r.matching_rule("api.example.com/v1/users");
        assert_eq!(m.url_prefix, "api.example.com");
        let m = r.matching_rule("other.example.com/");
        assert_eq!(m.url_prefix, FALLBACK_PREFIX);
    }

    #[tokio::test]
    async fn test_host_is_lowercased_path_retained() {
        let r = rules();
        let rule = r
            .upsert("API.Example.COM/Path%2FSeg", vec!["x-a".into()])
            .await
            .unwrap();
        assert_eq!(rule.url_prefix, "api.example.com/Path%2FSeg");
        assert_eq!(
            r.matching_rule("API.example.com/Path%2FSeg/x").url_prefix,
            "api.example.com/Path%2FSeg"
        );
    }

    #[tokio::test]
    async fn test_derive_account_first_present_header() {
        let r = rules();
        r.upsert(
            "svc.example.com",
            vec!["x-primary".into(), "x-secondary".into()],
        )
        .await
        .unwrap();

        let h = headers(&[("x-secondary", "acct-2")]);
        assert_eq!(r.derive_account("svc.example.com/a", &h), "acct-2");

        let h = headers(&[("x-primary", "acct-1"), ("x-secondary", "acct-2")]);
        assert_eq!(r.derive_account("svc.example.com/a", &h), "acct-1");

        let h = headers(&[("unrelated", "x")]);
        assert_eq!(r.derive_account("svc.example.com/a", &h), "");
    }

    #[tokio::test]
    async fn test_fallback_rule_applies_everywhere() {
        let r = rules();
        let h = headers(&[("x-resin-account", "fallback-acct")]);
        assert_eq!(r.derive_account("anything.example/x", &h), "fallback-acct");
    }

    #[tokio::test]
    async fn test_fallback_is_replaceable_not_deletable() {
        let r = rules();
        r.upsert(FALLBACK_PREFIX, vec!["x-custom".into()])
            .await
            .unwrap();
        let h = headers(&[("x-custom", "acct")]);
        assert_eq!(r.derive_account("x.example/", &h), "acct");

        let err = r.delete(FALLBACK_PREFIX).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
        // Only one fallback entry exists.
        assert_eq!(
            r.list()
                .iter()
                .filter(|x| x.url_prefix == FALLBACK_PREFIX)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_delete_and_validation() {
        let r = rules();
        r.upsert("a.example", vec!["x-a".into()]).await.unwrap();
        r.delete("A.EXAMPLE").await.unwrap();
        assert!(r.delete("a.example").await.is_err());
        assert!(r.upsert("/pathonly", vec!["x".into()]).await.is_err());
        assert!(r.upsert("a.example", vec![]).await.is_err());
    }
}
