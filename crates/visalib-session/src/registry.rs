//! Resource registry.
//!
//! The registry knows which resources exist and how to connect to them.
//! Resources are registered up front through the
//! [`ResourceManagerBuilder`](crate::ResourceManagerBuilder), each with its
//! own [`Connector`]; serial ports can additionally be discovered from the
//! OS at `find` time. Names that are not registered still open through the
//! fallback connector, if one is configured.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use visalib_core::descriptor::{InterfaceType, ResourceDescriptor};
use visalib_core::error::{Error, Result};
use visalib_core::transport::Connector;

use crate::pattern::ResourcePattern;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Result of [`ResourceManager::parse_resource`](crate::ResourceManager::parse_resource).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResource {
    /// The resolved, unaliased descriptor.
    pub descriptor: ResourceDescriptor,
    /// The alias registered for this resource, if any.
    pub alias: Option<String>,
}

/// A resource resolved for opening.
pub(crate) struct Resolved {
    pub descriptor: ResourceDescriptor,
    pub connector: Arc<dyn Connector>,
}

struct Registered {
    descriptor: ResourceDescriptor,
    connector: Arc<dyn Connector>,
}

/// Known resources, aliases and the fallback connector.
///
/// Immutable once the resource manager is built.
pub(crate) struct Registry {
    /// Canonical name -> entry. Sorted, so `find` order is stable.
    resources: BTreeMap<String, Registered>,
    /// Lower-cased alias -> (alias as registered, canonical name).
    aliases: BTreeMap<String, (String, String)>,
    fallback: Option<Arc<dyn Connector>>,
    scan_serial: bool,
}

impl Registry {
    pub fn new(fallback: Option<Arc<dyn Connector>>, scan_serial: bool) -> Self {
        Self {
            resources: BTreeMap::new(),
            aliases: BTreeMap::new(),
            fallback,
            scan_serial,
        }
    }

    /// Register `name` with the connector that opens it.
    pub fn register(&mut self, name: &str, connector: Arc<dyn Connector>) -> Result<()> {
        let descriptor = ResourceDescriptor::parse(name)?;
        let canonical = descriptor.to_string();
        self.resources.insert(
            canonical,
            Registered {
                descriptor,
                connector,
            },
        );
        Ok(())
    }

    /// Register `alias` for the resource `target`.
    pub fn add_alias(&mut self, alias: &str, target: &str) -> Result<()> {
        if alias.is_empty() || alias.contains("::") {
            return Err(Error::InvalidParameter(format!(
                "alias {alias:?} must be non-empty and contain no '::'"
            )));
        }
        let canonical = ResourceDescriptor::parse(target)?.to_string();
        self.aliases
            .insert(alias.to_ascii_lowercase(), (alias.to_string(), canonical));
        Ok(())
    }

    /// Resolve an alias or a descriptor string to its descriptor and alias.
    pub fn parse(&self, name: &str) -> Result<ParsedResource> {
        if let Some((alias, canonical)) = self.aliases.get(&name.to_ascii_lowercase()) {
            let descriptor = ResourceDescriptor::parse(canonical)?;
            return Ok(ParsedResource {
                descriptor,
                alias: Some(alias.clone()),
            });
        }

        let descriptor = ResourceDescriptor::parse(name)?;
        let alias = self.alias_of(&descriptor.to_string());
        Ok(ParsedResource { descriptor, alias })
    }

    /// Resolve `name` for opening.
    pub fn resolve(&self, name: &str) -> Result<Resolved> {
        let parsed = self.parse(name)?;
        let canonical = parsed.descriptor.to_string();

        if let Some(entry) = self.resources.get(&canonical) {
            return Ok(Resolved {
                descriptor: entry.descriptor.clone(),
                connector: Arc::clone(&entry.connector),
            });
        }

        match &self.fallback {
            Some(connector) => Ok(Resolved {
                descriptor: parsed.descriptor,
                connector: Arc::clone(connector),
            }),
            None => Err(Error::NotFound(canonical)),
        }
    }

    /// Snapshot the resources matching `pattern`.
    pub fn find(&self, pattern: &str) -> Result<FindList> {
        let pattern = ResourcePattern::compile(pattern)?;

        let mut candidates: BTreeSet<String> = self.resources.keys().cloned().collect();
        if self.scan_serial {
            match visalib_transport::available_ports() {
                Ok(ports) => candidates.extend(ports.iter().map(ToString::to_string)),
                Err(e) => tracing::warn!(error = %e, "Serial port scan failed"),
            }
        }

        let matches: Vec<String> = candidates
            .into_iter()
            .filter(|canonical| self.names_for(canonical).iter().any(|n| pattern.matches(n)))
            .collect();

        tracing::debug!(
            pattern = %pattern.as_str(),
            count = matches.len(),
            "Resource search"
        );
        Ok(FindList::new(matches))
    }

    fn alias_of(&self, canonical: &str) -> Option<String> {
        self.aliases
            .values()
            .find(|(_, target)| target == canonical)
            .map(|(alias, _)| alias.clone())
    }

    /// Every spelling a search expression may match for a resource: the
    /// canonical name, the name with board 0 left out, and its aliases.
    fn names_for(&self, canonical: &str) -> Vec<String> {
        let mut names = vec![canonical.to_string()];
        if let Ok(descriptor) = ResourceDescriptor::parse(canonical) {
            if let Some(short) = short_name(&descriptor, canonical) {
                names.push(short);
            }
        }
        names.extend(
            self.aliases
                .values()
                .filter(|(_, target)| target == canonical)
                .map(|(alias, _)| alias.clone()),
        );
        names
    }
}

/// `GPIB0::2::INSTR` -> `GPIB::2::INSTR`.
fn short_name(descriptor: &ResourceDescriptor, canonical: &str) -> Option<String> {
    if descriptor.board() != 0 || descriptor.interface() == InterfaceType::Asrl {
        return None;
    }
    let keyword = descriptor.interface().to_string();
    canonical
        .strip_prefix(&format!("{keyword}0::"))
        .map(|rest| format!("{keyword}::{rest}"))
}

// ---------------------------------------------------------------------------
// Find list
// ---------------------------------------------------------------------------

/// Result of a resource search.
///
/// The list is a snapshot taken when the search ran; its order is stable
/// for its lifetime. [`first`](FindList::first) is the first match and
/// [`find_next`](FindList::find_next) walks the rest.
#[derive(Debug)]
pub struct FindList {
    items: Vec<String>,
    cursor: usize,
    closed: bool,
}

impl FindList {
    fn new(items: Vec<String>) -> Self {
        Self {
            items,
            cursor: 1,
            closed: false,
        }
    }

    /// Number of matching resources. Zero is a normal outcome.
    pub fn count(&self) -> usize {
        self.items.len()
    }

    /// The first match, if there was one.
    pub fn first(&self) -> Option<&str> {
        self.items.first().map(String::as_str)
    }

    /// The next match after those already returned.
    ///
    /// Fails with [`Error::NotFound`] once the list is exhausted and with
    /// [`Error::InvalidHandle`] after [`close`](FindList::close).
    pub fn find_next(&mut self) -> Result<String> {
        if self.closed {
            return Err(Error::InvalidHandle);
        }
        match self.items.get(self.cursor) {
            Some(name) => {
                self.cursor += 1;
                Ok(name.clone())
            }
            None => Err(Error::NotFound("no more matching resources".into())),
        }
    }

    /// Release the list.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidHandle);
        }
        self.closed = true;
        self.items.clear();
        Ok(())
    }

    /// All matches, in order.
    pub fn as_slice(&self) -> &[String] {
        &self.items
    }

    /// Drain the matches [`find_next`](FindList::find_next) has not yet
    /// returned. [`count`](FindList::count) is unaffected.
    pub fn remaining(&mut self) -> impl Iterator<Item = String> + '_ {
        std::iter::from_fn(move || self.find_next().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visalib_test_harness::LoopbackConnector;

    fn registry() -> Registry {
        let connector: Arc<dyn Connector> = Arc::new(LoopbackConnector::new());
        let mut r = Registry::new(None, false);
        for name in [
            "GPIB0::2::INSTR",
            "gpib0::14::instr",
            "GPIB1::5::INSTR",
            "TCPIP0::10.0.0.5::5025::SOCKET",
            "ASRL1::INSTR",
        ] {
            r.register(name, Arc::clone(&connector)).unwrap();
        }
        r.add_alias("dmm", "GPIB0::14::INSTR").unwrap();
        r
    }

    #[test]
    fn find_all_is_sorted_and_stable() {
        let r = registry();
        let list = r.find("?*").unwrap();
        assert_eq!(list.count(), 5);
        let names = list.as_slice().to_vec();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(r.find("?*").unwrap().as_slice(), names.as_slice());
    }

    #[test]
    fn find_board_zero_short_form() {
        let r = registry();
        let list = r.find("GPIB::?*::INSTR").unwrap();
        assert_eq!(list.as_slice(), ["GPIB0::14::INSTR", "GPIB0::2::INSTR"]);
    }

    #[test]
    fn find_by_alias() {
        let r = registry();
        let list = r.find("DMM").unwrap();
        assert_eq!(list.first(), Some("GPIB0::14::INSTR"));
    }

    #[test]
    fn no_match_is_empty_list() {
        let r = registry();
        let mut list = r.find("NOMATCH::*").unwrap();
        assert_eq!(list.count(), 0);
        assert_eq!(list.first(), None);
        assert!(matches!(list.find_next(), Err(Error::NotFound(_))));
    }

    #[test]
    fn find_next_walks_after_first() {
        let r = registry();
        let mut list = r.find("GPIB?*INSTR").unwrap();
        assert_eq!(list.count(), 3);
        assert_eq!(list.first(), Some("GPIB0::14::INSTR"));
        assert_eq!(list.find_next().unwrap(), "GPIB0::2::INSTR");
        assert_eq!(list.find_next().unwrap(), "GPIB1::5::INSTR");
        assert!(matches!(list.find_next(), Err(Error::NotFound(_))));
    }

    #[test]
    fn remaining_yields_rest_and_keeps_count() {
        let r = registry();
        let mut list = r.find("GPIB?*INSTR").unwrap();
        let rest: Vec<String> = list.remaining().collect();
        assert_eq!(rest, ["GPIB0::2::INSTR", "GPIB1::5::INSTR"]);
        assert_eq!(list.count(), 3);
        assert_eq!(list.first(), Some("GPIB0::14::INSTR"));
        assert!(matches!(list.find_next(), Err(Error::NotFound(_))));
    }

    #[test]
    fn closed_list_is_invalid() {
        let r = registry();
        let mut list = r.find("?*").unwrap();
        list.close().unwrap();
        assert!(matches!(list.find_next(), Err(Error::InvalidHandle)));
        assert!(matches!(list.close(), Err(Error::InvalidHandle)));
    }

    #[test]
    fn invalid_pattern_propagates() {
        let r = registry();
        assert!(matches!(r.find("*"), Err(Error::InvalidPattern(_))));
    }

    #[test]
    fn parse_resolves_alias_both_ways() {
        let r = registry();
        let by_alias = r.parse("DMM").unwrap();
        assert_eq!(by_alias.descriptor.to_string(), "GPIB0::14::INSTR");
        assert_eq!(by_alias.alias.as_deref(), Some("dmm"));

        let by_name = r.parse("GPIB::14").unwrap();
        assert_eq!(by_name.alias.as_deref(), Some("dmm"));

        let plain = r.parse("GPIB0::2::INSTR").unwrap();
        assert_eq!(plain.alias, None);
    }

    #[test]
    fn unregistered_without_fallback_is_not_found() {
        let r = registry();
        assert!(matches!(r.resolve("GPIB0::9::INSTR"), Err(Error::NotFound(_))));
        assert!(r.resolve("gpib0::2").is_ok());
    }

    #[test]
    fn unregistered_uses_fallback() {
        let r = Registry::new(Some(Arc::new(LoopbackConnector::new())), false);
        let resolved = r.resolve("TCPIP::example.com::5025::SOCKET").unwrap();
        assert_eq!(
            resolved.descriptor.to_string(),
            "TCPIP0::example.com::5025::SOCKET"
        );
    }

    #[test]
    fn bad_alias_rejected() {
        let mut r = Registry::new(None, false);
        assert!(matches!(
            r.add_alias("a::b", "GPIB0::1::INSTR"),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            r.add_alias("scope", "not a resource"),
            Err(Error::InvalidDescriptor(_))
        ));
    }
}
