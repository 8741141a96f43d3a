//! Symbol Index (§4.1): turns the output of an external symbol lister (`nm`-shaped) into a
//! bidirectional mangled <-> demangled lookup, partitioned by section class.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use std::process::Command;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Minimum width of a well-formed listing line: 8 hex digits, a space, a one-character class,
/// a space, and at least one character of name.
const MIN_LINE_WIDTH: usize = 11;

bitflags! {
    /// Attributes of a [`Symbol`] that are cheap to test independently of its [`SymbolClass`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymbolFlags: u8 {
        /// Imported from glibc via the PLT; needs the ebx trampoline treatment (§4.6).
        const GLIBC = 0b001;
        /// A weak symbol; absence is tolerated at link time, stored as `void**` downstream.
        const WEAK  = 0b010;
    }
}

/// The section a [`Symbol`] was listed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolClass {
    Text,
    Data,
    Bss,
    Undefined,
    Weak,
}

impl SymbolClass {
    /// Maps an `nm` one-letter class code to a [`SymbolClass`]. Case indicates local (lower) vs
    /// global (upper) binding, which this engine does not distinguish.
    fn from_code(code: char) -> Option<SymbolClass> {
        match code.to_ascii_uppercase() {
            'T' => Some(SymbolClass::Text),
            'D' => Some(SymbolClass::Data),
            'B' => Some(SymbolClass::Bss),
            'U' => Some(SymbolClass::Undefined),
            'W' | 'V' => Some(SymbolClass::Weak),
            _ => None,
        }
    }
}

impl Display for SymbolClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SymbolClass::Text => "text",
            SymbolClass::Data => "data",
            SymbolClass::Bss => "bss",
            SymbolClass::Undefined => "undef",
            SymbolClass::Weak => "weak",
        };
        write!(f, "{s}")
    }
}

/// One entry of the symbol table, as reconciled from the raw listing plus demangling.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Symbol {
    pub mangled: String,
    pub demangled_short: String,
    pub demangled_full: String,
    pub class: SymbolClassRepr,
    pub is_glibc: bool,
    pub is_weak: bool,
    pub address: String,
}

impl Symbol {
    pub fn flags(&self) -> SymbolFlags {
        let mut flags = SymbolFlags::empty();
        if self.is_glibc {
            flags |= SymbolFlags::GLIBC;
        }
        if self.is_weak {
            flags |= SymbolFlags::WEAK;
        }
        flags
    }
}

/// Serializable twin of [`SymbolClass`] (bitflags fields already derive serde; plain enums need
/// their own derive, kept separate so [`SymbolClass`] itself stays a lean copy type used as a
/// `HashMap` key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SymbolClassRepr {
    Text,
    Data,
    Bss,
    Undefined,
    Weak,
}

impl From<SymbolClass> for SymbolClassRepr {
    fn from(c: SymbolClass) -> Self {
        match c {
            SymbolClass::Text => SymbolClassRepr::Text,
            SymbolClass::Data => SymbolClassRepr::Data,
            SymbolClass::Bss => SymbolClassRepr::Bss,
            SymbolClass::Undefined => SymbolClassRepr::Undefined,
            SymbolClass::Weak => SymbolClassRepr::Weak,
        }
    }
}

/// Demangling is delegated to an external filter (§6: `c++filt`); abstracted behind a trait so
/// tests can supply a stub instead of spawning a process.
pub trait Demangler {
    /// Returns `(short, full)` demangled forms. Implementations that cannot demangle a name
    /// (e.g. it was never mangled) should return the name unchanged in both fields.
    fn demangle(&self, mangled: &str) -> Result<(String, String)>;
}

/// Invokes the `c++filt` binary named in §6, once per symbol.
pub struct ExternalDemangler {
    pub command: String,
}

impl Default for ExternalDemangler {
    fn default() -> Self {
        ExternalDemangler { command: "c++filt".to_string() }
    }
}

impl Demangler for ExternalDemangler {
    fn demangle(&self, mangled: &str) -> Result<(String, String)> {
        let output = Command::new(&self.command)
            .arg(mangled)
            .output()
            .map_err(|e| Error::spawn(self.command.clone(), e))?;
        let full = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let full = if full.is_empty() { mangled.to_string() } else { full };
        // the "short" form drops template/argument-list detail; for names c++filt left alone
        // (no '(' introduced) short == full, matching the common case of plain C symbols.
        let short = full.split('(').next().unwrap_or(&full).trim().to_string();
        Ok((short, full))
    }
}

/// A no-op demangler for plain-C binaries and for tests: every name passes through unchanged.
pub struct IdentityDemangler;

impl Demangler for IdentityDemangler {
    fn demangle(&self, mangled: &str) -> Result<(String, String)> {
        Ok((mangled.to_string(), mangled.to_string()))
    }
}

/// The reconciled, bidirectional symbol table for one binary.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct SymbolIndex {
    by_mangled: HashMap<String, Symbol>,
    by_demangled: HashMap<String, String>,
    #[serde(skip)]
    by_class: HashMap<SymbolClassRepr, Vec<String>>,
}

impl SymbolIndex {
    /// Parses an `nm`-shaped listing (§6) and demangles every text/data symbol found.
    ///
    /// Lines shorter than [`MIN_LINE_WIDTH`] are skipped with a warning. A non-8-hex-digit
    /// address column (suggesting a 64-bit listing) is fatal, per §4.1.
    pub fn build(listing: &str, demangler: &dyn Demangler) -> Result<SymbolIndex> {
        let mut index = SymbolIndex::default();
        for line in listing.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if line.len() < MIN_LINE_WIDTH {
                warn!("skipping short symbol line: {line:?}");
                continue;
            }
            let hex_width = line.chars().take_while(|c| c.is_ascii_hexdigit()).count();
            if hex_width == 0 {
                return Err(Error::MalformedSymbolLine(line.to_string()));
            }
            if hex_width != 8 {
                return Err(Error::UnsupportedAddressWidth(line.to_string()));
            }
            let address = &line[0..8];
            let class_code = line.chars().nth(9).ok_or_else(|| Error::MalformedSymbolLine(line.to_string()))?;
            let raw_name = if line.len() > 11 { &line[11..] } else { "" };
            if raw_name.is_empty() {
                warn!("skipping symbol line with empty name: {line:?}");
                continue;
            }
            let Some(class) = SymbolClass::from_code(class_code) else {
                debug!("unrecognized symbol class '{class_code}', skipping: {line:?}");
                continue;
            };

            let (stripped, is_glibc) = strip_version_suffix(raw_name);
            let (demangled_short, demangled_full) = demangler.demangle(stripped)?;

            let symbol = Symbol {
                mangled: stripped.to_string(),
                demangled_short: demangled_short.clone(),
                demangled_full,
                class: class.into(),
                is_glibc,
                is_weak: class == SymbolClass::Weak,
                address: address.to_string(),
            };

            index.by_demangled.insert(demangled_short, stripped.to_string());
            index.by_class.entry(class.into()).or_default().push(stripped.to_string());
            index.by_mangled.insert(stripped.to_string(), symbol);
        }
        Ok(index)
    }

    pub fn get(&self, mangled: &str) -> Option<&Symbol> {
        self.by_mangled.get(mangled)
    }

    pub fn mangled_for_demangled(&self, demangled: &str) -> Option<&str> {
        self.by_demangled.get(demangled).map(|s| s.as_str())
    }

    pub fn contains(&self, mangled: &str) -> bool {
        self.by_mangled.contains_key(mangled)
    }

    pub fn class_members(&self, class: SymbolClass) -> &[String] {
        self.by_class
            .get(&SymbolClassRepr::from(class))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Every symbol whose class would satisfy a C global-variable reference (§6.2: `d D b B`).
    pub fn data_symbol_names(&self) -> Vec<&str> {
        [SymbolClass::Data, SymbolClass::Bss]
            .iter()
            .flat_map(|c| self.class_members(*c))
            .map(|s| s.as_str())
            .collect()
    }

    /// Every symbol whose class would satisfy a function reference (§6.2: `t T U`).
    pub fn function_symbol_names(&self) -> Vec<&str> {
        [SymbolClass::Text, SymbolClass::Undefined]
            .iter()
            .flat_map(|c| self.class_members(*c))
            .map(|s| s.as_str())
            .collect()
    }

    /// Attempts the two heuristic rewrites from §7 for a symbol absent from the index: strip a
    /// trailing `_NN` suffix, then try a prepended `_`. Returns the rewritten name if either
    /// resolves, else `None`.
    pub fn resolve_with_heuristics(&self, name: &str) -> Option<String> {
        if self.contains(name) {
            return Some(name.to_string());
        }
        if let Some(stripped) = strip_inline_suffix(name) {
            if self.contains(&stripped) {
                return Some(stripped);
            }
        }
        let prefixed = format!("_{name}");
        if self.contains(&prefixed) {
            return Some(prefixed);
        }
        None
    }

    /// Loads a previously-serialized index. Per §4.1, a non-empty cache file is treated as
    /// valid without further checking.
    pub fn load_cached(path: &Path) -> Result<Option<SymbolIndex>> {
        match fs::metadata(path) {
            Ok(meta) if meta.len() > 0 => {
                let data = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
                let mut index: SymbolIndex =
                    serde_json::from_str(&data).map_err(Error::Serialize)?;
                index.rebuild_class_index();
                Ok(Some(index))
            }
            _ => Ok(None),
        }
    }

    pub fn save_cache(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string(self).map_err(Error::Serialize)?;
        fs::write(path, data).map_err(|e| Error::io(path, e))
    }

    fn rebuild_class_index(&mut self) {
        self.by_class.clear();
        for symbol in self.by_mangled.values() {
            self.by_class.entry(symbol.class).or_default().push(symbol.mangled.clone());
        }
    }
}

/// Strips a `@VERSION` suffix (glibc symbol versioning) from a raw listed name.
fn strip_version_suffix(raw: &str) -> (&str, bool) {
    match raw.split_once('@') {
        Some((base, _version)) => (base, true),
        None => (raw, false),
    }
}

/// Strips a trailing `_NN` numeric suffix, as hex-rays adds to inlined function aliases.
fn strip_inline_suffix(name: &str) -> Option<String> {
    let idx = name.rfind('_')?;
    let (base, suffix) = name.split_at(idx);
    let digits = &suffix[1..];
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        Some(base.to_string())
    } else {
        None
    }
}

/// Invokes the symbol lister described in §6 (`nm <binary>`) and returns its raw stdout.
pub fn list_symbols(binary: &Path) -> Result<String> {
    let output = Command::new("nm")
        .arg(binary)
        .output()
        .map_err(|e| Error::spawn("nm", e))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_listing() -> &'static str {
        "deadbeef T cgc_WalkTree\n\
         0badf00d U printf@@GLIBC_2.0\n\
         0000cafe D my_global\n\
         0000face W weak_hook\n"
    }

    #[test]
    fn parses_classes_and_glibc_suffix() {
        let idx = SymbolIndex::build(sample_listing(), &IdentityDemangler).unwrap();
        assert!(idx.contains("cgc_WalkTree"));
        let printf = idx.get("printf").expect("printf entry");
        assert!(printf.is_glibc);
        assert_eq!(printf.class, SymbolClassRepr::Undefined);
        assert!(idx.get("my_global").unwrap().class == SymbolClassRepr::Data);
        assert!(idx.get("weak_hook").unwrap().is_weak);
    }

    #[test]
    fn rejects_64bit_looking_address() {
        let listing = "deadbeef00 T too_wide\n";
        let err = SymbolIndex::build(listing, &IdentityDemangler).unwrap_err();
        assert!(matches!(err, Error::UnsupportedAddressWidth(_)));
    }

    #[test]
    fn skips_short_lines_without_failing() {
        let listing = "short\ndeadbeef T ok_symbol\n";
        let idx = SymbolIndex::build(listing, &IdentityDemangler).unwrap();
        assert!(idx.contains("ok_symbol"));
    }

    #[test]
    fn heuristics_strip_suffix_then_prepend_underscore() {
        let listing = "deadbeef T real_fn\n0000beef T _other_fn\n";
        let idx = SymbolIndex::build(listing, &IdentityDemangler).unwrap();
        assert_eq!(idx.resolve_with_heuristics("real_fn_12"), Some("real_fn".to_string()));
        assert_eq!(idx.resolve_with_heuristics("other_fn"), Some("_other_fn".to_string()));
        assert_eq!(idx.resolve_with_heuristics("totally_missing"), None);
    }

    #[test]
    fn cache_round_trips() {
        let idx = SymbolIndex::build(sample_listing(), &IdentityDemangler).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("symbols.cache");
        idx.save_cache(&path).unwrap();
        let loaded = SymbolIndex::load_cached(&path).unwrap().expect("cache hit");
        assert!(loaded.contains("cgc_WalkTree"));
        assert_eq!(loaded.class_members(SymbolClass::Text).len(), 1);
    }
}
