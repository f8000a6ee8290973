//! Graph resource names: validation and resolution.
//!
//! A name is *global* (`/a/b`), *relative* (`a/b`, resolved against a
//! namespace) or *private* (`~a`, resolved under the node's own name).
//! Resolved names are always global, canonical (no trailing `/` except the
//! root) and then passed through the remapping table.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Check that `name` is a legal graph resource name.
pub fn validate(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(Error::InvalidName {
            name: name.to_owned(),
            reason: reason.to_owned(),
        })
    };

    let Some(first) = name.chars().next() else {
        return invalid("empty name");
    };
    if !(first.is_ascii_alphabetic() || first == '/' || first == '~') {
        return invalid("must start with a letter, '/' or '~'");
    }
    if name.contains("//") {
        return invalid("empty path segment");
    }
    for (i, c) in name.char_indices() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '/' => {}
            '~' if i == 0 => {}
            _ => return invalid(&format!("illegal character {c:?}")),
        }
    }
    Ok(())
}

pub fn is_global(name: &str) -> bool {
    name.starts_with('/')
}

pub fn is_private(name: &str) -> bool {
    name.starts_with('~')
}

/// Strip a trailing separator; the root namespace stays `/`.
pub fn canonicalize(name: &str) -> String {
    if name.len() > 1 {
        name.trim_end_matches('/').to_owned()
    } else {
        name.to_owned()
    }
}

/// Join a namespace and a relative name.
pub fn join(namespace: &str, name: &str) -> String {
    let ns = canonicalize(namespace);
    let name = name.trim_start_matches('/');
    if ns == "/" {
        format!("/{name}")
    } else {
        format!("{ns}/{name}")
    }
}

/// Parent namespace of a global name (`/a/b` → `/a`, `/a` → `/`).
pub fn parent(name: &str) -> String {
    let name = canonicalize(name);
    match name.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(idx) => name[..idx].to_owned(),
    }
}

/// Resolves names for one node handle.
#[derive(Debug, Clone)]
pub struct Resolver {
    namespace: String,
    node_name: String,
    remappings: HashMap<String, String>,
}

impl Resolver {
    /// `node_name` must already be global. Remapping keys and values are
    /// resolved against `namespace` once, up front.
    pub fn new(
        namespace: &str,
        node_name: &str,
        remappings: &HashMap<String, String>,
    ) -> Result<Self> {
        validate(namespace)?;
        validate(node_name)?;
        if !is_global(node_name) {
            return Err(Error::InvalidName {
                name: node_name.to_owned(),
                reason: "node name must be global".into(),
            });
        }
        let namespace = if is_global(namespace) {
            canonicalize(namespace)
        } else {
            join("/", namespace)
        };

        let mut resolver = Self {
            namespace,
            node_name: canonicalize(node_name),
            remappings: HashMap::new(),
        };
        let mut resolved = HashMap::with_capacity(remappings.len());
        for (from, to) in remappings {
            resolved.insert(resolver.resolve_raw(from)?, resolver.resolve_raw(to)?);
        }
        resolver.remappings = resolved;
        Ok(resolver)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// A resolver for a child namespace sharing the same node and remappings.
    pub fn child(&self, namespace: &str) -> Result<Self> {
        let ns = self.resolve_raw(namespace)?;
        Ok(Self {
            namespace: ns,
            node_name: self.node_name.clone(),
            remappings: self.remappings.clone(),
        })
    }

    /// Resolve `name` to a canonical global name, then apply remappings.
    pub fn resolve(&self, name: &str) -> Result<String> {
        let resolved = self.resolve_raw(name)?;
        Ok(self
            .remappings
            .get(&resolved)
            .cloned()
            .unwrap_or(resolved))
    }

    fn resolve_raw(&self, name: &str) -> Result<String> {
        validate(name)?;
        let resolved = if is_global(name) {
            canonicalize(name)
        } else if let Some(rest) = name.strip_prefix('~') {
            if rest.is_empty() {
                self.node_name.clone()
            } else {
                join(&self.node_name, rest)
            }
        } else {
            join(&self.namespace, name)
        };
        Ok(canonicalize(&resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(ns: &str) -> Resolver {
        Resolver::new(ns, "/talker", &HashMap::new()).unwrap()
    }

    #[test]
    fn validate_accepts_common_forms() {
        for name in ["/", "/a", "a", "a/b_c", "~private", "/a/b2"] {
            assert!(validate(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn validate_rejects_bad_names() {
        for name in ["", "1abc", "/a//b", "a-b", "a~b", "/a b"] {
            assert!(validate(name).is_err(), "{name} should be invalid");
        }
    }

    #[test]
    fn resolve_relative_global_private() {
        let r = resolver("/robot");
        assert_eq!(r.resolve("chatter").unwrap(), "/robot/chatter");
        assert_eq!(r.resolve("/chatter").unwrap(), "/chatter");
        assert_eq!(r.resolve("~rate").unwrap(), "/talker/rate");
        assert_eq!(r.resolve("~").unwrap(), "/talker");
        assert_eq!(r.resolve("/a/b/").unwrap(), "/a/b");
    }

    #[test]
    fn root_namespace_join() {
        let r = resolver("/");
        assert_eq!(r.resolve("chatter").unwrap(), "/chatter");
    }

    #[test]
    fn relative_namespace_is_made_global() {
        let r = resolver("robot");
        assert_eq!(r.namespace(), "/robot");
    }

    #[test]
    fn remapping_applies_after_resolution() {
        let mut remaps = HashMap::new();
        remaps.insert("chatter".to_string(), "/speech".to_string());
        let r = Resolver::new("/", "/talker", &remaps).unwrap();
        assert_eq!(r.resolve("chatter").unwrap(), "/speech");
        assert_eq!(r.resolve("/chatter").unwrap(), "/speech");
        assert_eq!(r.resolve("other").unwrap(), "/other");
    }

    #[test]
    fn child_namespace() {
        let r = resolver("/robot");
        let arm = r.child("arm").unwrap();
        assert_eq!(arm.namespace(), "/robot/arm");
        assert_eq!(arm.resolve("joint").unwrap(), "/robot/arm/joint");
    }

    #[test]
    fn node_name_must_be_global() {
        assert!(Resolver::new("/", "talker", &HashMap::new()).is_err());
    }

    #[test]
    fn parent_of_names() {
        assert_eq!(parent("/a/b"), "/a");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
    }
}
