use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{definition_files, load_definition, ConfigError, ConfigResult};
use crate::error::{Error, Result};
use crate::registry::Rejection;

/// On-disk form of a parser definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParserDocument {
    pub name: String,
    pub pattern: String,
    pub entity_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Capture group that, when a pattern names it, holds the entity while the
/// rest of the match only anchors it.
pub const ENTITY_GROUP: &str = "entity";

/// A named regular expression that pulls entities of one type out of cells.
#[derive(Debug, Clone)]
pub struct ParserDefinition {
    name: String,
    pattern: Regex,
    entity_group: Option<usize>,
    entity_type: Arc<str>,
    description: Option<String>,
}

impl ParserDefinition {
    pub fn new(name: &str, pattern: &str, entity_type: &str) -> ConfigResult<Self> {
        Self::from_document(ParserDocument {
            name: name.to_string(),
            pattern: pattern.to_string(),
            entity_type: entity_type.to_string(),
            description: None,
        })
    }

    pub fn from_document(doc: ParserDocument) -> ConfigResult<Self> {
        let name = doc.name.trim();
        if name.is_empty() {
            return Err(ConfigError::invalid("<unnamed parser>", "name is empty"));
        }
        if doc.entity_type.trim().is_empty() {
            return Err(ConfigError::invalid(name, "entity_type is empty"));
        }
        if doc.pattern.is_empty() {
            return Err(ConfigError::invalid(name, "pattern is empty"));
        }

        let pattern = Regex::new(&doc.pattern).map_err(|source| ConfigError::Pattern {
            name: name.to_string(),
            source,
        })?;

        let entity_group = pattern
            .capture_names()
            .position(|group| group == Some(ENTITY_GROUP));

        Ok(Self {
            name: name.to_string(),
            pattern,
            entity_group,
            entity_type: Arc::from(doc.entity_type.trim()),
            description: doc.description,
        })
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let doc: ParserDocument = load_definition(path)?;
        Self::from_document(doc)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Every entity in `text`, in match order. With an `entity` group the
    /// next search resumes where the entity ended, so a boundary character
    /// consumed after one entity can still lead the next.
    pub fn find_all<'t>(&self, text: &'t str) -> Vec<&'t str> {
        let Some(group) = self.entity_group else {
            return self.pattern.find_iter(text).map(|m| m.as_str()).collect();
        };

        let mut found = Vec::new();
        let mut start = 0;
        while start <= text.len() {
            let Some(captures) = self.pattern.captures_at(text, start) else {
                break;
            };
            let Some(whole) = captures.get(0) else {
                break;
            };
            start = match captures.get(group) {
                Some(entity) if !entity.is_empty() => {
                    found.push(entity.as_str());
                    entity.end()
                }
                _ if whole.is_empty() => text[whole.end()..]
                    .chars()
                    .next()
                    .map_or(text.len() + 1, |c| whole.end() + c.len_utf8()),
                _ => whole.end(),
            };
        }
        found
    }

    pub(crate) fn shared_entity_type(&self) -> Arc<str> {
        Arc::clone(&self.entity_type)
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Parser definitions discovered from a configuration directory.
#[derive(Debug, Default)]
pub struct ParserSet {
    parsers: BTreeMap<String, ParserDefinition>,
    rejected: Vec<Rejection>,
}

impl ParserSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every definition in `dir`. Invalid definitions are logged and
    /// recorded, never fatal.
    pub fn discover(dir: &Path) -> Self {
        let mut set = Self::new();

        let files = match definition_files(dir) {
            Ok(files) => files,
            Err(error) => {
                set.reject(dir.to_path_buf(), error);
                return set;
            }
        };

        for path in files {
            match ParserDefinition::load(&path) {
                Ok(parser) => {
                    tracing::debug!(
                        parser = parser.name(),
                        path = %path.display(),
                        "loaded parser"
                    );
                    set.insert(parser);
                }
                Err(error) => set.reject(path, error),
            }
        }

        set
    }

    fn reject(&mut self, path: PathBuf, error: ConfigError) {
        tracing::warn!(path = %path.display(), %error, "rejected parser definition");
        self.rejected.push(Rejection { path, error });
    }

    /// Add a parser; a parser with the same name is replaced with a warning.
    pub fn insert(&mut self, parser: ParserDefinition) -> Option<ParserDefinition> {
        let previous = self.parsers.insert(parser.name().to_string(), parser);
        if let Some(ref old) = previous {
            tracing::warn!(parser = old.name(), "parser name collision, later definition wins");
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<&ParserDefinition> {
        self.parsers.get(name)
    }

    pub fn require(&self, name: &str) -> Result<ParserDefinition> {
        self.get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownParser(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParserDefinition> {
        self.parsers.values()
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    pub fn rejected(&self) -> &[Rejection] {
        &self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_compiles_pattern() {
        let parser = ParserDefinition::new("ipv4", r"\d+\.\d+\.\d+\.\d+", "ipv4").unwrap();
        assert_eq!(parser.name(), "ipv4");
        assert_eq!(parser.entity_type(), "ipv4");
        assert!(parser.pattern().is_match("1.2.3.4"));
    }

    #[test]
    fn test_entity_group_excludes_boundaries() {
        let parser =
            ParserDefinition::new("port", r"(?:^|\s):(?P<entity>\d+)(?:$|\s)", "port").unwrap();
        assert_eq!(parser.find_all(":80 :443 x:22"), vec!["80", "443"]);
        assert_eq!(parser.find_all(":8080x"), Vec::<&str>::new());
    }

    fn shipped_ipv6() -> ParserDefinition {
        ParserDefinition::load(Path::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../../parsers/ipv6.toml"
        )))
        .unwrap()
    }

    #[test]
    fn test_shipped_ipv6_forms() {
        let parser = shipped_ipv6();
        assert_eq!(parser.find_all("::1"), vec!["::1"]);
        assert_eq!(parser.find_all("mapped ::ffff:1.2.3.4 up"), vec!["::ffff:1.2.3.4"]);
        assert_eq!(
            parser.find_all("2001:db8::8a2e:370:7334, fe80::1"),
            vec!["2001:db8::8a2e:370:7334", "fe80::1"]
        );
        assert_eq!(
            parser.find_all("2001:0DB8:0000:0000:0000:FF00:0042:8329"),
            vec!["2001:0DB8:0000:0000:0000:FF00:0042:8329"]
        );
        assert_eq!(parser.find_all("::1 ::2"), vec!["::1", "::2"]);
    }

    #[test]
    fn test_shipped_ipv6_rejects_partial_tokens() {
        let parser = shipped_ipv6();
        assert!(parser.find_all("1:2:3:4:5:6:7:8:9").is_empty());
        assert!(parser.find_all("deadbeef::1").is_empty());
        assert!(parser.find_all("12:30:45 and 1.2.3.4").is_empty());
        assert!(parser.find_all("fe80::1g").is_empty());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = ParserDefinition::new("bad", "(unclosed", "x").unwrap_err();
        assert!(matches!(err, ConfigError::Pattern { .. }));
    }

    #[test]
    fn test_missing_fields_rejected() {
        assert!(ParserDefinition::new("", "a", "x").is_err());
        assert!(ParserDefinition::new("p", "a", " ").is_err());
        assert!(ParserDefinition::new("p", "", "x").is_err());
    }

    #[test]
    fn test_discover_skips_invalid_definitions() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("ipv4.toml"),
            "name = \"ipv4\"\n\
             pattern = '\\b\\d{1,3}(\\.\\d{1,3}){3}\\b'\n\
             entity_type = \"ipv4\"\n\
             description = \"IPv4 addresses\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("broken.json"),
            r#"{"name": "broken", "pattern": "(", "entity_type": "x"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("partial.toml"), "name = \"partial\"\n").unwrap();

        let set = ParserSet::discover(dir.path());

        assert_eq!(set.len(), 1);
        let ipv4 = set.get("ipv4").unwrap();
        assert_eq!(ipv4.description(), Some("IPv4 addresses"));
        assert_eq!(set.rejected().len(), 2);
    }

    #[test]
    fn test_require_unknown_parser() {
        let set = ParserSet::new();
        assert!(matches!(set.require("nope"), Err(Error::UnknownParser(_))));
    }

    #[test]
    fn test_insert_collision_replaces() {
        let mut set = ParserSet::new();
        set.insert(ParserDefinition::new("p", "a", "first").unwrap());
        let previous = set.insert(ParserDefinition::new("p", "b", "second").unwrap());

        assert_eq!(previous.unwrap().entity_type(), "first");
        assert_eq!(set.get("p").unwrap().entity_type(), "second");
    }
}
