//! LDAP Helper Utilities
//!
//! Extension trait for pulling typed values out of `SearchEntry` without
//! repeating the `.get().and_then().cloned()` pattern.

use crate::ldap_utils::sid_to_string;
use ldap3::SearchEntry;

pub(crate) trait SearchEntryExt {
    /// Get a string attribute, returning empty string if not found
    fn get_string_attr(&self, name: &str) -> String;

    /// Get an optional string attribute (returns None if missing)
    fn get_optional_attr(&self, name: &str) -> Option<String>;

    /// Get an optional u32 attribute (returns None if missing, Some(0) if value is "0")
    fn get_optional_u32_attr(&self, name: &str) -> Option<u32>;

    /// Get binary attribute as bytes
    fn get_binary_attr(&self, name: &str) -> Option<Vec<u8>>;

    /// `objectSid` rendered as `S-1-...`
    fn get_sid(&self) -> Option<String>;

    fn get_dn(&self) -> String;

    /// True when any `objectClass` value matches, ignoring case
    fn has_object_class(&self, class: &str) -> bool;
}

impl SearchEntryExt for SearchEntry {
    fn get_string_attr(&self, name: &str) -> String {
        self.get_optional_attr(name).unwrap_or_default()
    }

    fn get_optional_attr(&self, name: &str) -> Option<String> {
        self.attrs.get(name).and_then(|v| v.first()).cloned()
    }

    fn get_optional_u32_attr(&self, name: &str) -> Option<u32> {
        self.attrs
            .get(name)
            .and_then(|v| v.first())
            .and_then(|v| v.parse().ok())
    }

    fn get_binary_attr(&self, name: &str) -> Option<Vec<u8>> {
        // Values that happen to be valid UTF-8 land in attrs instead
        self.bin_attrs
            .get(name)
            .and_then(|v| v.first())
            .cloned()
            .or_else(|| {
                self.attrs
                    .get(name)
                    .and_then(|v| v.first())
                    .map(|s| s.as_bytes().to_vec())
            })
    }

    fn get_sid(&self) -> Option<String> {
        self.get_binary_attr("objectSid")
            .and_then(|bytes| sid_to_string(&bytes).ok())
    }

    fn get_dn(&self) -> String {
        // dn is a field on SearchEntry, not in attrs
        self.dn.clone()
    }

    fn has_object_class(&self, class: &str) -> bool {
        self.attrs
            .get("objectClass")
            .map(|values| values.iter().any(|v| v.eq_ignore_ascii_case(class)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap_utils::sid_to_bytes;
    use std::collections::HashMap;

    fn create_test_entry(attrs: Vec<(&str, Vec<&str>)>) -> SearchEntry {
        let mut attr_map = HashMap::new();
        for (key, values) in attrs {
            attr_map.insert(key.to_string(), values.into_iter().map(|s| s.to_string()).collect());
        }
        SearchEntry {
            dn: "CN=Test,DC=example,DC=com".to_string(),
            attrs: attr_map,
            bin_attrs: HashMap::new(),
        }
    }

    #[test]
    fn test_get_string_attr() {
        let entry = create_test_entry(vec![("sAMAccountName", vec!["testuser"])]);
        assert_eq!(entry.get_string_attr("sAMAccountName"), "testuser");
        assert_eq!(entry.get_string_attr("nonexistent"), "");
    }

    #[test]
    fn test_get_optional_u32_attr() {
        let entry = create_test_entry(vec![
            ("versionNumber", vec!["65537"]),
            ("zeroValue", vec!["0"]),
            ("garbage", vec!["x"]),
        ]);
        assert_eq!(entry.get_optional_u32_attr("versionNumber"), Some(65537));
        // Zero is distinguishable from missing
        assert_eq!(entry.get_optional_u32_attr("zeroValue"), Some(0));
        assert_eq!(entry.get_optional_u32_attr("garbage"), None);
        assert_eq!(entry.get_optional_u32_attr("nonexistent"), None);
    }

    #[test]
    fn test_get_sid_from_binary_attr() {
        let mut entry = create_test_entry(vec![]);
        assert_eq!(entry.get_sid(), None);

        let sid = "S-1-5-21-1004336348-1177238915-682003330-512";
        entry
            .bin_attrs
            .insert("objectSid".to_string(), vec![sid_to_bytes(sid).unwrap()]);
        assert_eq!(entry.get_sid().as_deref(), Some(sid));
    }

    #[test]
    fn test_has_object_class() {
        let entry = create_test_entry(vec![("objectClass", vec!["top", "Group"])]);
        assert!(entry.has_object_class("group"));
        assert!(!entry.has_object_class("user"));
    }

    #[test]
    fn test_get_dn() {
        let entry = create_test_entry(vec![]);
        assert_eq!(entry.get_dn(), "CN=Test,DC=example,DC=com");
    }
}
