//! Pre-extraction filtering of capture entries by base URL, method and
//! path extension.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::sample::STANDARD_METHODS;

/// Anything that exposes a request line can be filtered.
pub trait FilterTarget {
    fn request_method(&self) -> &str;
    fn request_url(&self) -> &str;
}

/// Which extensioned paths are accepted. Paths without an extension always
/// pass, whatever the policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExtensionPolicy {
    /// No extension filtering
    #[default]
    Any,
    /// Reject every path that has an extension
    NoExtensions,
    /// Accept only these extensions (lowercase, with leading dot)
    Only(BTreeSet<String>),
}

impl ExtensionPolicy {
    /// Build a policy from an optional selection, the way a UI checklist
    /// reports it: `None` means untouched, an empty list means everything
    /// was unchecked.
    pub fn from_selection<I, S>(selection: Option<I>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Some(selection) = selection else {
            return Self::Any;
        };
        let set: BTreeSet<String> = selection
            .into_iter()
            .filter_map(|e| normalize_extension(e.as_ref()))
            .collect();
        if set.is_empty() {
            Self::NoExtensions
        } else {
            Self::Only(set)
        }
    }

    /// Whether a URL path passes this policy.
    pub fn accepts_path(&self, path: &str) -> bool {
        let Some(ext) = path_extension(path) else {
            return true;
        };
        match self {
            Self::Any => true,
            Self::NoExtensions => false,
            Self::Only(set) => set.contains(&ext),
        }
    }
}

impl Serialize for ExtensionPolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Any => serializer.serialize_none(),
            Self::NoExtensions => Vec::<String>::new().serialize(serializer),
            Self::Only(set) => set.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ExtensionPolicy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let selection = Option::<Vec<String>>::deserialize(deserializer)?;
        Ok(Self::from_selection(selection))
    }
}

fn normalize_extension(raw: &str) -> Option<String> {
    let ext = raw.trim().to_lowercase();
    if ext.is_empty() || ext == "." {
        return None;
    }
    Some(if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    })
}

/// Final suffix of the last path segment, lowercased with its dot.
///
/// Leading-dot names (`/.well-known`) and trailing-slash paths have none.
pub fn path_extension(path: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or("");
    let segment = path.rsplit('/').next().unwrap_or("");
    let dot = segment.rfind('.')?;
    if dot == 0 || dot + 1 == segment.len() {
        return None;
    }
    Some(segment[dot..].to_lowercase())
}

/// `scheme://host[:port]` of an absolute URL.
pub fn base_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

fn url_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.to_string(),
    }
}

/// Allow-lists applied to capture entries before extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFilter {
    /// Accepted `scheme://host[:port]` prefixes; empty accepts all
    #[serde(default)]
    pub base_urls: Vec<String>,
    /// Accepted methods (case-insensitive); empty accepts all
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub extensions: ExtensionPolicy,
}

impl EntryFilter {
    pub fn is_noop(&self) -> bool {
        self.base_urls.is_empty()
            && self.methods.is_empty()
            && self.extensions == ExtensionPolicy::Any
    }

    /// Whether a single request line passes every allow-list.
    pub fn accepts(&self, method: &str, url: &str) -> bool {
        if !self.base_urls.is_empty() && !url.is_empty() {
            let allowed = base_url(url).is_some_and(|base| {
                self.base_urls
                    .iter()
                    .any(|b| b.trim().trim_end_matches('/').eq_ignore_ascii_case(&base))
            });
            if !allowed {
                return false;
            }
        }
        let method = method.trim();
        if !self.methods.is_empty()
            && !method.is_empty()
            && !self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
        {
            return false;
        }
        self.extensions.accepts_path(&url_path(url))
    }

    /// Keep the entries that pass, in their original order.
    pub fn apply<T: FilterTarget>(&self, entries: Vec<T>) -> Vec<T> {
        if self.is_noop() {
            return entries;
        }
        let before = entries.len();
        let kept: Vec<T> = entries
            .into_iter()
            .filter(|e| self.accepts(e.request_method(), e.request_url()))
            .collect();
        log::debug!("Entry filter kept {} of {} entries", kept.len(), before);
        kept
    }
}

/// What a capture contains, for building an [`EntryFilter`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Inventory {
    /// Sorted, de-duplicated `scheme://host[:port]` values
    pub base_urls: Vec<String>,
    /// Methods present, standard ones first in canonical order
    pub methods: Vec<String>,
    /// Sorted path extensions of one to eight alphanumerics
    pub extensions: Vec<String>,
}

impl Inventory {
    pub fn of<T: FilterTarget>(entries: &[T]) -> Self {
        let base_urls: BTreeSet<String> = entries
            .iter()
            .filter_map(|e| base_url(e.request_url()))
            .collect();

        let mut found: BTreeSet<String> = entries
            .iter()
            .map(|e| e.request_method().trim().to_uppercase())
            .filter(|m| !m.is_empty())
            .collect();
        let mut methods: Vec<String> = STANDARD_METHODS
            .iter()
            .filter(|m| found.remove(**m))
            .map(|m| m.to_string())
            .collect();
        methods.extend(found);

        let extensions: BTreeSet<String> = entries
            .iter()
            .filter_map(|e| Url::parse(e.request_url()).ok())
            .filter(|u| !u.path().ends_with('/'))
            .filter_map(|u| path_extension(u.path()))
            .filter(|ext| {
                let body = &ext[1..];
                (1..=8).contains(&body.len()) && body.chars().all(|c| c.is_ascii_alphanumeric())
            })
            .collect();

        Self {
            base_urls: base_urls.into_iter().collect(),
            methods,
            extensions: extensions.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Line(&'static str, &'static str);

    impl FilterTarget for Line {
        fn request_method(&self) -> &str {
            self.0
        }
        fn request_url(&self) -> &str {
            self.1
        }
    }

    #[test]
    fn test_path_extension() {
        assert_eq!(path_extension("/report.PDF"), Some(".pdf".to_string()));
        assert_eq!(path_extension("/a.b/health"), None);
        assert_eq!(path_extension("/.well-known"), None);
        assert_eq!(path_extension("/dir/"), None);
        assert_eq!(path_extension("/x.tar.gz?v=1"), Some(".gz".to_string()));
    }

    #[test]
    fn test_empty_selection_excludes_extensioned_paths() {
        let policy = ExtensionPolicy::from_selection(Some(Vec::<String>::new()));
        assert_eq!(policy, ExtensionPolicy::NoExtensions);
        assert!(!policy.accepts_path("/report.pdf"));
        assert!(policy.accepts_path("/health"));
    }

    #[test]
    fn test_extensionless_paths_pass_every_policy() {
        for policy in [
            ExtensionPolicy::Any,
            ExtensionPolicy::NoExtensions,
            ExtensionPolicy::from_selection(Some(["js"])),
        ] {
            assert!(policy.accepts_path("/health"), "{:?}", policy);
        }
    }

    #[test]
    fn test_only_selection_is_case_insensitive() {
        let policy = ExtensionPolicy::from_selection(Some(["JS", ".Css"]));
        assert!(policy.accepts_path("/app.js"));
        assert!(policy.accepts_path("/site.CSS"));
        assert!(!policy.accepts_path("/logo.png"));
    }

    #[test]
    fn test_no_selection_accepts_everything() {
        let policy = ExtensionPolicy::from_selection(None::<Vec<String>>);
        assert!(policy.accepts_path("/logo.png"));
    }

    #[test]
    fn test_entry_filter_apply() {
        let filter = EntryFilter {
            base_urls: vec!["https://api.test/".into()],
            methods: vec!["get".into()],
            extensions: ExtensionPolicy::NoExtensions,
        };
        let kept = filter.apply(vec![
            Line("GET", "https://api.test/items"),
            Line("POST", "https://api.test/items"),
            Line("GET", "https://cdn.test/items"),
            Line("GET", "https://api.test/app.js"),
            Line("GET", "https://api.test:8443/items"),
        ]);
        let urls: Vec<_> = kept.iter().map(|l| l.1).collect();
        assert_eq!(urls, vec!["https://api.test/items"]);
    }

    #[test]
    fn test_inventory() {
        let inventory = Inventory::of(&[
            Line("post", "https://b.test/login"),
            Line("PROPFIND", "https://a.test/dav/"),
            Line("GET", "https://a.test/app.JS"),
            Line("GET", "https://a.test/blob.verylongext"),
            Line("GET", "not a url"),
        ]);
        assert_eq!(inventory.base_urls, vec!["https://a.test", "https://b.test"]);
        assert_eq!(inventory.methods, vec!["GET", "POST", "PROPFIND"]);
        assert_eq!(inventory.extensions, vec![".js"]);
    }

    #[test]
    fn test_base_url_keeps_explicit_port() {
        assert_eq!(
            base_url("http://localhost:8080/a?b=c"),
            Some("http://localhost:8080".to_string())
        );
        assert_eq!(base_url("not a url"), None);
    }

    #[test]
    fn test_extension_policy_deserialize() {
        let any: ExtensionPolicy = serde_json::from_str("null").unwrap();
        assert_eq!(any, ExtensionPolicy::Any);
        let none: ExtensionPolicy = serde_json::from_str("[]").unwrap();
        assert_eq!(none, ExtensionPolicy::NoExtensions);
        let only: ExtensionPolicy = serde_json::from_str(r#"["html"]"#).unwrap();
        assert!(only.accepts_path("/index.html"));
    }
}
