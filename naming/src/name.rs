//! Application and DIF names.
//!
//! A name is made of four components of which only the process name is
//! required. The canonical string form joins them with `/` and substitutes
//! the literal `<NONE>` for missing components:
//!
//! ```text
//! process_name/process_instance/entity_name/entity_instance
//! ```
use log::trace;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Placeholder for a missing component in the string form.
pub const NONE: &str = "<NONE>";

const DELIMITER: char = '/';

/// A structured RINA name.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Name {
    process_name: Option<String>,
    process_instance: Option<String>,
    entity_name: Option<String>,
    entity_instance: Option<String>,
}

impl Name {
    /// Creates a name with all components missing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a name holding only a process name.
    pub fn process(process_name: &str) -> Self {
        let mut name = Self::new();
        name.init_from(Some(process_name), None, None, None);
        name
    }

    /// Initializes the name from borrowed components, copying them.
    ///
    /// Any components held before are released first.
    pub fn init_from(
        &mut self,
        process_name: Option<&str>,
        process_instance: Option<&str>,
        entity_name: Option<&str>,
        entity_instance: Option<&str>,
    ) -> &mut Self {
        self.finalize();
        self.process_name = process_name.map(str::to_owned);
        self.process_instance = process_instance.map(str::to_owned);
        self.entity_name = entity_name.map(str::to_owned);
        self.entity_instance = entity_instance.map(str::to_owned);
        self
    }

    /// Initializes the name by taking ownership of the components.
    ///
    /// Any components held before are released first.
    pub fn init_with(
        &mut self,
        process_name: Option<String>,
        process_instance: Option<String>,
        entity_name: Option<String>,
        entity_instance: Option<String>,
    ) -> &mut Self {
        self.finalize();
        self.process_name = process_name;
        self.process_instance = process_instance;
        self.entity_name = entity_name;
        self.entity_instance = entity_instance;
        self
    }

    /// Replaces the components with copies of `src`'s.
    pub fn copy_from(&mut self, src: &Name) {
        trace!("copying name {}", src);
        self.init_from(
            src.process_name(),
            src.process_instance(),
            src.entity_name(),
            src.entity_instance(),
        );
    }

    /// Releases all components, leaving an empty name.
    pub fn finalize(&mut self) {
        self.process_name = None;
        self.process_instance = None;
        self.entity_name = None;
        self.entity_instance = None;
    }

    /// Returns `true` if no component is set.
    pub fn is_empty(&self) -> bool {
        self.process_name.is_none()
            && self.process_instance.is_none()
            && self.entity_name.is_none()
            && self.entity_instance.is_none()
    }

    /// Only the process name is mandatory.
    pub fn is_valid(&self) -> bool {
        self.process_name.is_some()
    }

    /// Process name.
    pub fn process_name(&self) -> Option<&str> {
        self.process_name.as_deref()
    }

    /// Process instance.
    pub fn process_instance(&self) -> Option<&str> {
        self.process_instance.as_deref()
    }

    /// Entity name.
    pub fn entity_name(&self) -> Option<&str> {
        self.entity_name.as_deref()
    }

    /// Entity instance.
    pub fn entity_instance(&self) -> Option<&str> {
        self.entity_instance.as_deref()
    }

    fn components(&self) -> [Option<&str>; 4] {
        [
            self.process_name(),
            self.process_instance(),
            self.entity_name(),
            self.entity_instance(),
        ]
    }

    /// Length of the canonical string form.
    pub fn display_len(&self) -> usize {
        let fields: usize = self
            .components()
            .iter()
            .map(|c| c.map_or(NONE.len(), str::len))
            .sum();
        fields + 3 * DELIMITER.len_utf8()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [pn, pi, en, ei] = self.components();
        write!(
            f,
            "{}{}{}{}{}{}{}",
            pn.unwrap_or(NONE),
            DELIMITER,
            pi.unwrap_or(NONE),
            DELIMITER,
            en.unwrap_or(NONE),
            DELIMITER,
            ei.unwrap_or(NONE),
        )
    }
}

fn component(field: Option<&str>) -> Option<String> {
    match field {
        None => None,
        Some(NONE) => None,
        Some(field) => Some(field.to_owned()),
    }
}

/// Parses the canonical string form.
///
/// Missing trailing components are left unset and separators beyond the
/// third are kept as part of the entity instance.
impl FromStr for Name {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.splitn(4, DELIMITER);
        let mut name = Name::new();
        name.init_with(
            component(fields.next()),
            component(fields.next()),
            component(fields.next()),
            component(fields.next()),
        );
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(pn: Option<&str>, pi: Option<&str>, en: Option<&str>, ei: Option<&str>) -> Name {
        let mut n = Name::new();
        n.init_from(pn, pi, en, ei);
        n
    }

    fn rt(n: &Name) {
        let s = n.to_string();
        assert_eq!(s.len(), n.display_len());
        let n2: Name = s.parse().unwrap();
        assert_eq!(&n2, n);
    }

    #[test]
    fn test_to_string() {
        let n = name(Some("A"), Some("1"), Some("E"), Some("2"));
        assert_eq!(n.to_string(), "A/1/E/2");
        let n = name(Some("A"), None, None, None);
        assert_eq!(n.to_string(), "A/<NONE>/<NONE>/<NONE>");
        assert_eq!(Name::new().to_string(), "<NONE>/<NONE>/<NONE>/<NONE>");
    }

    #[test]
    fn test_round_trip() {
        rt(&name(Some("A"), Some("1"), Some("E"), Some("2")));
        rt(&name(Some("A"), None, None, None));
        rt(&name(Some("rina.apps.echo"), None, Some("mgmt"), None));
        rt(&name(Some("A"), Some(""), Some("E"), Some("")));
        let parsed: Name = "A/1/E/2".parse().unwrap();
        assert_eq!(parsed, name(Some("A"), Some("1"), Some("E"), Some("2")));
    }

    #[test]
    fn test_parse_partial() {
        let n: Name = "A/1".parse().unwrap();
        assert_eq!(n, name(Some("A"), Some("1"), None, None));
        let n: Name = "A/1/E/2/x/y".parse().unwrap();
        assert_eq!(n.entity_instance(), Some("2/x/y"));
        let n: Name = "".parse().unwrap();
        assert_eq!(n.process_name(), Some(""));
    }

    #[test]
    fn test_equality() {
        let a = name(Some("A"), None, Some("E"), None);
        let b = name(Some("A"), None, Some("E"), None);
        assert_eq!(a, b);
        let c = name(Some("A"), Some("1"), Some("E"), None);
        assert_ne!(a, c);
        assert_eq!(Name::new(), Name::new());
    }

    #[test]
    fn test_validity() {
        assert!(!Name::new().is_valid());
        assert!(Name::new().is_empty());
        assert!(Name::process("A").is_valid());
        assert!(!name(None, Some("1"), None, None).is_valid());
    }

    #[test]
    fn test_reinit_and_copy() {
        let mut n = name(Some("A"), Some("1"), Some("E"), Some("2"));
        n.init_with(Some("B".to_string()), None, None, None);
        assert_eq!(n.to_string(), "B/<NONE>/<NONE>/<NONE>");

        let src = name(Some("C"), Some("3"), None, None);
        n.copy_from(&src);
        assert_eq!(n, src);

        n.finalize();
        assert!(n.is_empty());
        assert_eq!(src.clone(), src);
    }
}
