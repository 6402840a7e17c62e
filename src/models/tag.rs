use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an independent site sharing the tag store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tag shared across tenants. The slug is unique system-wide; the tenant
/// set must be non-empty for any persisted tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
    /// Prefix of `name` before the first `:`, empty when there is none.
    /// Recomputed on every save.
    pub namespace: String,
    pub slug: String,
    pub tenants: BTreeSet<TenantId>,
    pub created_at: DateTime<Utc>,
}

impl Tag {
    pub fn new(name: String) -> Self {
        let namespace = derive_namespace(&name);
        Self {
            id: Uuid::new_v4(),
            name,
            namespace,
            slug: String::new(),
            tenants: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    /// Change the display name and recompute the namespace. The slug is left
    /// untouched; callers go through the registry to reallocate it.
    pub fn set_name(&mut self, name: String) {
        self.namespace = derive_namespace(&name);
        self.name = name;
    }

    /// The name with any `namespace:` prefix stripped.
    pub fn display_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, rest)) => rest,
            None => &self.name,
        }
    }
}

pub fn derive_namespace(name: &str) -> String {
    match name.split_once(':') {
        Some((ns, _)) => ns.to_string(),
        None => String::new(),
    }
}

/// URL-safe identifier derived from a display name: accented Latin folded to
/// ASCII, lower-cased, runs of anything else collapsed to a single `-`.
/// A disambiguation counter appends `_i`.
pub fn slugify(name: &str, counter: Option<u32>) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_sep = false;
    let mut push = |c: char, slug: &mut String| {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            if pending_sep && !slug.is_empty() {
                slug.push('-');
            }
            pending_sep = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    };
    for c in name.chars() {
        match fold_ascii(c) {
            Some(folded) => {
                for f in folded.chars() {
                    push(f, &mut slug);
                }
            }
            None => push(c, &mut slug),
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if let Some(i) = counter {
        slug.push_str(&format!("_{}", i));
    }
    slug
}

/// Fold common accented Latin characters to their ASCII base. Characters
/// outside the table are kept as-is (non-ASCII ones become separators).
fn fold_ascii(c: char) -> Option<&'static str> {
    let folded = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "a",
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => "e",
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => "i",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => "o",
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => "u",
        'ý' | 'ÿ' | 'Ý' => "y",
        'ñ' | 'Ñ' => "n",
        'ç' | 'Ç' => "c",
        'ß' => "ss",
        'æ' | 'Æ' => "ae",
        'œ' | 'Œ' => "oe",
        'đ' | 'Đ' | 'ð' | 'Ð' => "d",
        'þ' | 'Þ' => "th",
        'š' | 'Š' => "s",
        'ž' | 'Ž' => "z",
        _ => return None,
    };
    Some(folded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Red", None), "red");
        assert_eq!(slugify("Breaking News!", None), "breaking-news");
        assert_eq!(slugify("  spaced   out  ", None), "spaced-out");
    }

    #[test]
    fn test_slugify_counter() {
        assert_eq!(slugify("Red", Some(1)), "red_1");
        assert_eq!(slugify("Red", Some(12)), "red_12");
    }

    #[test]
    fn test_slugify_accents_fold() {
        assert_eq!(slugify("réd", None), "red");
        assert_eq!(slugify("Crème Brûlée", None), "creme-brulee");
    }

    #[test]
    fn test_slugify_round_trip() {
        for name in ["Red!", "color:red", "a  b__c", "Straße", "99 bottles"] {
            let once = slugify(name, None);
            assert_eq!(slugify(&once, None), once, "unstable for {:?}", name);
        }
    }

    #[test]
    fn test_slugify_colliding_names_share_base() {
        assert_eq!(slugify("Red", None), slugify("Red!", None));
        assert_eq!(slugify("Red", None), slugify("réd", None));
    }

    #[test]
    fn test_namespace_derivation() {
        let tag = Tag::new("color:red".to_string());
        assert_eq!(tag.namespace, "color");
        assert_eq!(tag.display_name(), "red");

        let tag = Tag::new("red".to_string());
        assert_eq!(tag.namespace, "");
        assert_eq!(tag.display_name(), "red");
    }

    #[test]
    fn test_set_name_recomputes_namespace() {
        let mut tag = Tag::new("red".to_string());
        tag.set_name("color:crimson".to_string());
        assert_eq!(tag.namespace, "color");
        assert_eq!(tag.display_name(), "crimson");
    }
}
