// Credential set (cookie jar) shared between the worker and the external login flow

use std::{path::Path, sync::Arc};

use parking_lot::RwLock;
use tracing::info;

use crate::error::SessionError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    // insertion order is kept so the rendered header matches what the browser sent
    pairs: Vec<(String, String)>,
}

impl Credentials {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        let mut creds = Self::default();
        for (k, v) in pairs {
            creds.insert(k, v);
        }
        creds
    }

    // Accepts the browser "a=b; c=d" form or one pair per line ('#' lines skipped).
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let mut creds = Self::default();

        let items: Vec<&str> = if text.contains(';') {
            text.split(';').collect()
        } else {
            text.lines()
                .filter(|line| !line.trim_start().starts_with('#'))
                .collect()
        };

        for item in items {
            if let Some((k, v)) = item.trim().split_once('=') {
                let k = k.trim();
                if !k.is_empty() {
                    creds.insert(k.to_string(), v.trim().to_string());
                }
            }
        }

        creds
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let creds = Self::parse(&raw);
        if creds.is_empty() {
            return Err(SessionError::Empty);
        }
        info!(
            path = %path.as_ref().display(),
            cookies = creds.len(),
            "loaded session cookies"
        );
        Ok(creds)
    }

    fn insert(&mut self, key: String, value: String) {
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }

    pub fn cookie_header(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// Holder for the current credential set. A refresh replaces the whole set, so a
// snapshot taken at the start of a logical request never mixes old and new cookies.
#[derive(Debug, Default)]
pub struct SessionStore {
    current: RwLock<Arc<Credentials>>,
}

impl SessionStore {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            current: RwLock::new(Arc::new(credentials)),
        }
    }

    pub fn snapshot(&self) -> Arc<Credentials> {
        self.current.read().clone()
    }

    pub fn replace(&self, credentials: Credentials) {
        info!(cookies = credentials.len(), "session credentials replaced");
        *self.current.write() = Arc::new(credentials);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_browser_format() {
        let creds = Credentials::parse("EMAP_LANG=zh; JSESSIONID=abc=def ;route=r1;");
        assert_eq!(creds.len(), 3);
        assert_eq!(creds.get("EMAP_LANG"), Some("zh"));
        // only the first '=' splits
        assert_eq!(creds.get("JSESSIONID"), Some("abc=def"));
        assert_eq!(creds.cookie_header(), "EMAP_LANG=zh; JSESSIONID=abc=def; route=r1");
    }

    #[test]
    fn test_parse_line_format() {
        let creds = Credentials::parse("# exported\nMOD_AUTH_CAS=xyz\nroute = r2\n\njunk\n");
        assert_eq!(creds.len(), 2);
        assert_eq!(creds.get("MOD_AUTH_CAS"), Some("xyz"));
        assert_eq!(creds.get("route"), Some("r2"));
    }

    #[test]
    fn test_duplicate_key_keeps_last_value_in_first_position() {
        let creds = Credentials::parse("a=1; b=2; a=3");
        assert_eq!(creds.cookie_header(), "a=3; b=2");
    }

    #[test]
    fn test_empty_input() {
        assert!(Credentials::parse("   ").is_empty());
        assert!(Credentials::parse("no pairs here").is_empty());
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let store = SessionStore::new(Credentials::parse("a=old"));
        let snap = store.snapshot();
        store.replace(Credentials::parse("a=new"));

        assert_eq!(snap.get("a"), Some("old"));
        assert_eq!(store.snapshot().get("a"), Some("new"));
    }
}
