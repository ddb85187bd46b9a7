//! Environment overlays.
//!
//! [`apply`] is a pure function of the package root, the declared
//! mutations and an explicit snapshot of the ambient environment. Nothing in
//! here reads the process environment except [`Envars::from_os`].

use std::path::Path;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::manifest::{EnvAction, EnvOp};

/// Separator for path-list variables.
pub const PATH_SEPARATOR: char = if cfg!(windows) { ';' } else { ':' };

/// An ordered set of environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envars {
    vars: Vec<(String, String)>,
}

impl Envars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current process environment, sorted by name.
    pub fn from_os() -> Self {
        let mut vars: Vec<(String, String)> = std::env::vars().collect();
        vars.sort();
        Self { vars }
    }

    /// Parse `KEY=VALUE` entries. Entries without `=` are skipped.
    pub fn parse<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut envars = Self::new();
        for entry in entries {
            if let Some((key, value)) = entry.as_ref().split_once('=') {
                envars.set(key, value);
            }
        }
        envars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set `key`, keeping its position if it already exists.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.vars.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.vars.push((key.to_string(), value.to_string())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// The environment after applying a package's mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentMapping {
    vars: Envars,
    ambient: Envars,
    /// Keys touched by a mutation, in order of first touch.
    touched: Vec<String>,
}

impl EnvironmentMapping {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key)
    }

    /// The full resulting environment.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter()
    }

    /// True if `key` ends up different from its ambient value. A key that
    /// was absent and is now present counts as changed.
    pub fn is_changed(&self, key: &str) -> bool {
        self.vars.get(key) != self.ambient.get(key)
    }

    /// Variables the package touched, in first-touch order.
    ///
    /// With `include_unmodified`, variables whose final value happens to equal
    /// the ambient one are kept as well.
    pub fn changed(&self, include_unmodified: bool) -> Vec<(String, String)> {
        self.touched
            .iter()
            .filter(|k| include_unmodified || self.is_changed(k))
            .filter_map(|k| self.vars.get(k).map(|v| (k.clone(), v.to_string())))
            .collect()
    }
}

impl Serialize for EnvironmentMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let changed = self.changed(false);
        let mut map = serializer.serialize_map(Some(changed.len()))?;
        for (k, v) in &changed {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Apply `ops` in declaration order on top of `ambient`.
pub fn apply(root: &Path, ops: &[EnvOp], ambient: &Envars) -> EnvironmentMapping {
    let root = root.to_string_lossy();
    let mut vars = ambient.clone();
    let mut touched: Vec<String> = Vec::new();

    for op in ops {
        let current = vars.get(&op.name).map(String::from);
        let value = match &op.action {
            EnvAction::Set(template) => expand(template, &root, &vars),
            EnvAction::Prepend(template) => {
                let added = expand(template, &root, &vars);
                join_path_list(&added, current.as_deref(), true)
            }
            EnvAction::Append(template) => {
                let added = expand(template, &root, &vars);
                join_path_list(&added, current.as_deref(), false)
            }
        };
        vars.set(&op.name, &value);
        if !touched.contains(&op.name) {
            touched.push(op.name.clone());
        }
    }

    EnvironmentMapping {
        vars,
        ambient: ambient.clone(),
        touched,
    }
}

/// Insert `added` before or after `existing`, dropping elements of
/// `existing` that `added` already contains so re-application is a no-op.
fn join_path_list(added: &str, existing: Option<&str>, prepend: bool) -> String {
    let new: Vec<&str> = added.split(PATH_SEPARATOR).filter(|s| !s.is_empty()).collect();
    let old = existing
        .unwrap_or_default()
        .split(PATH_SEPARATOR)
        .filter(|s| !s.is_empty() && !new.contains(s));

    let joined: Vec<&str> = if prepend {
        new.iter().copied().chain(old).collect()
    } else {
        old.chain(new.iter().copied()).collect()
    };
    joined.join(&PATH_SEPARATOR.to_string())
}

/// Expand `${root}`, `${VAR}` and `$VAR` against `vars`. Unknown variables
/// expand to the empty string; `$$` is a literal `$`.
fn expand(template: &str, root: &str, vars: &Envars) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(idx) = rest.find('$') {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 1..];

        if let Some(stripped) = after.strip_prefix('$') {
            out.push('$');
            rest = stripped;
        } else if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => {
                    out.push_str(&lookup(&braced[..end], root, vars));
                    rest = &braced[end + 1..];
                }
                None => {
                    out.push_str(&rest[idx..]);
                    rest = "";
                }
            }
        } else {
            let len = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            if len == 0 {
                out.push('$');
            } else {
                out.push_str(&lookup(&after[..len], root, vars));
            }
            rest = &after[len..];
        }
    }
    out.push_str(rest);
    out
}

fn lookup(name: &str, root: &str, vars: &Envars) -> String {
    if name == "root" {
        return root.to_string();
    }
    vars.get(name).unwrap_or_default().to_string()
}
