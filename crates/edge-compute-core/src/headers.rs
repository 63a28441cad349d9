//! Header name and value canonicalization, and the [`Headers`] collection.

use edge_compute_common::ScriptError;
use edge_compute_host::{Host, HostResult, MessageRef};

/// Whether `byte` may appear in a header name (an HTTP token).
fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

/// Validate and lower-case a header name. `op` names the calling operation
/// in error messages.
pub fn normalize_name(op: &str, name: &str) -> Result<String, ScriptError> {
    if name.is_empty() {
        return Err(ScriptError::type_error(format!(
            "{op}: Header name can't be empty"
        )));
    }
    if !name.bytes().all(is_token_byte) {
        return Err(ScriptError::type_error(format!(
            "{op}: Invalid header name '{name}'"
        )));
    }
    Ok(name.to_ascii_lowercase())
}

/// Trim a header value of surrounding whitespace and reject control
/// characters other than horizontal tab.
pub fn normalize_value(op: &str, value: &str) -> Result<String, ScriptError> {
    let trimmed = value.trim_matches(|c| matches!(c, '\t' | ' ' | '\r' | '\n'));
    if trimmed.chars().any(|c| c != '\t' && c.is_ascii_control()) {
        return Err(ScriptError::type_error(format!(
            "{op}: Invalid header value '{value}'"
        )));
    }
    Ok(trimmed.to_string())
}

/// Ordered, multi-valued header list with canonical (lower-case) names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    list: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from name/value pairs, validating each.
    pub fn from_pairs<I, N, V>(pairs: I) -> Result<Self, ScriptError>
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: AsRef<str>,
    {
        let mut headers = Self::new();
        for (name, value) in pairs {
            headers.append(name.as_ref(), value.as_ref())?;
        }
        Ok(headers)
    }

    /// Values of `name` joined with `", "`.
    pub fn get(&self, name: &str) -> Result<Option<String>, ScriptError> {
        let name = normalize_name("Headers.get", name)?;
        let values: Vec<&str> = self.values(&name).collect();
        Ok((!values.is_empty()).then(|| values.join(", ")))
    }

    /// Every `set-cookie` value, unjoined.
    pub fn get_set_cookie(&self) -> Vec<String> {
        self.values("set-cookie").map(str::to_string).collect()
    }

    /// Replace every value of `name`.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), ScriptError> {
        let name = normalize_name("Headers.set", name)?;
        let value = normalize_value("Headers.set", value)?;
        match self.list.iter().position(|(n, _)| *n == name) {
            Some(first) => {
                self.list[first].1 = value;
                let mut index = 0;
                self.list.retain(|(n, _)| {
                    let keep = index <= first || *n != name;
                    index += 1;
                    keep
                });
            }
            None => self.list.push((name, value)),
        }
        Ok(())
    }

    pub fn append(&mut self, name: &str, value: &str) -> Result<(), ScriptError> {
        let name = normalize_name("Headers.append", name)?;
        let value = normalize_value("Headers.append", value)?;
        self.list.push((name, value));
        Ok(())
    }

    pub fn has(&self, name: &str) -> Result<bool, ScriptError> {
        let name = normalize_name("Headers.has", name)?;
        Ok(self.contains(&name))
    }

    pub fn delete(&mut self, name: &str) -> Result<(), ScriptError> {
        let name = normalize_name("Headers.delete", name)?;
        self.list.retain(|(n, _)| *n != name);
        Ok(())
    }

    /// Add `name: value` unless `name` is already present.
    pub fn maybe_add(&mut self, name: &str, value: &str) -> Result<(), ScriptError> {
        let canonical = normalize_name("Headers.append", name)?;
        if !self.contains(&canonical) {
            self.append(name, value)?;
        }
        Ok(())
    }

    /// Pairs sorted by name, with values of the same name joined.
    /// `set-cookie` values stay separate.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut names: Vec<&str> = self.list.iter().map(|(n, _)| n.as_str()).collect();
        names.sort_unstable();
        names.dedup();

        let mut entries = Vec::new();
        for name in names {
            if name == "set-cookie" {
                entries.extend(self.values(name).map(|v| (name.to_string(), v.to_string())));
            } else {
                let joined = self.values(name).collect::<Vec<_>>().join(", ");
                entries.push((name.to_string(), joined));
            }
        }
        entries
    }

    /// Pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.list.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    fn contains(&self, canonical: &str) -> bool {
        self.list.iter().any(|(n, _)| n == canonical)
    }

    fn values<'a>(&'a self, canonical: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.list
            .iter()
            .filter(move |(n, _)| n == canonical)
            .map(|(_, v)| v.as_str())
    }

    /// Reify the headers of a host request or response. Names the host
    /// holds are lower-cased; pairs that are not valid headers are skipped.
    pub(crate) fn read_from(host: &dyn Host, message: MessageRef<'_>) -> HostResult<Self> {
        let mut headers = Self::new();
        for name in host.header_names_get(message)? {
            let Ok(canonical) = normalize_name("Headers", &name) else {
                continue;
            };
            for value in host.header_values_get(message, &name)? {
                if let Ok(value) = normalize_value("Headers", &value) {
                    headers.list.push((canonical.clone(), value));
                }
            }
        }
        Ok(headers)
    }

    /// Replace the host's headers with these.
    pub(crate) fn write_to(&self, host: &dyn Host, message: MessageRef<'_>) -> HostResult<()> {
        for name in host.header_names_get(message)? {
            host.header_remove(message, &name)?;
        }
        for (name, value) in &self.list {
            host.header_append(message, name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_lower_cased() {
        assert_eq!(normalize_name("op", "Content-Type").unwrap(), "content-type");
        assert_eq!(normalize_name("op", "x-a!#$%&'*+-.^_`|~9").unwrap(), "x-a!#$%&'*+-.^_`|~9");
    }

    #[test]
    fn test_name_errors() {
        assert_eq!(
            normalize_name("Headers.set", "").unwrap_err(),
            ScriptError::type_error("Headers.set: Header name can't be empty")
        );
        assert_eq!(
            normalize_name("Headers.set", "bad name").unwrap_err(),
            ScriptError::type_error("Headers.set: Invalid header name 'bad name'")
        );
        assert!(normalize_name("op", "a:b").is_err());
        assert!(normalize_name("op", "ü").is_err());
    }

    #[test]
    fn test_value_is_trimmed() {
        assert_eq!(normalize_value("op", " \t a b \r\n").unwrap(), "a b");
        assert_eq!(normalize_value("op", "a\tb").unwrap(), "a\tb");
    }

    #[test]
    fn test_value_control_characters_rejected() {
        assert_eq!(
            normalize_value("Headers.append", "a\nb").unwrap_err(),
            ScriptError::type_error("Headers.append: Invalid header value 'a\nb'")
        );
        assert!(normalize_value("op", "a\0b").is_err());
        assert!(normalize_value("op", "a\x7fb").is_err());
    }

    #[test]
    fn test_get_joins_values() {
        let mut headers = Headers::new();
        headers.append("Accept", "text/html").unwrap();
        headers.append("accept", "application/json").unwrap();
        assert_eq!(
            headers.get("ACCEPT").unwrap().as_deref(),
            Some("text/html, application/json")
        );
        assert_eq!(headers.get("missing").unwrap(), None);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut headers = Headers::from_pairs([("a", "1"), ("b", "2"), ("a", "3")]).unwrap();
        headers.set("A", "4").unwrap();
        assert_eq!(headers.iter().collect::<Vec<_>>(), vec![("a", "4"), ("b", "2")]);
    }

    #[test]
    fn test_delete_and_maybe_add() {
        let mut headers = Headers::new();
        headers.maybe_add("Content-Type", "text/plain").unwrap();
        headers.maybe_add("content-type", "text/html").unwrap();
        assert_eq!(headers.get("content-type").unwrap().as_deref(), Some("text/plain"));

        headers.delete("Content-Type").unwrap();
        assert!(!headers.has("content-type").unwrap());
        assert!(headers.is_empty());
    }

    #[test]
    fn test_entries_sorted_and_set_cookie_kept_apart() {
        let headers = Headers::from_pairs([
            ("x-b", "1"),
            ("Set-Cookie", "a=1"),
            ("x-a", "1"),
            ("set-cookie", "b=2"),
            ("x-b", "2"),
        ])
        .unwrap();
        assert_eq!(
            headers.entries(),
            vec![
                ("set-cookie".to_string(), "a=1".to_string()),
                ("set-cookie".to_string(), "b=2".to_string()),
                ("x-a".to_string(), "1".to_string()),
                ("x-b".to_string(), "1, 2".to_string()),
            ]
        );
        assert_eq!(headers.get_set_cookie(), vec!["a=1", "b=2"]);
    }
}
