use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::MarshalError;

/// Identity of a virtual object cohort: `o+{kind}/{instance}`.
///
/// Every facet of an instance shares one `BaseRef`; the per-object state
/// record in the vatstore is keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BaseRef {
    pub kind: u64,
    pub instance: u64,
}

impl BaseRef {
    pub fn new(kind: u64, instance: u64) -> Self {
        Self { kind, instance }
    }

    /// Reference designating the whole cohort (no facet).
    pub fn vref(&self) -> Vref {
        Vref::Virtual { base: *self, facet: None }
    }

    /// Reference designating one facet of the cohort.
    pub fn facet_vref(&self, facet: u32) -> Vref {
        Vref::Virtual { base: *self, facet: Some(facet) }
    }
}

impl fmt::Display for BaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o+{}/{}", self.kind, self.instance)
    }
}

impl FromStr for BaseRef {
    type Err = MarshalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<Vref>()? {
            Vref::Virtual { base, facet: None } => Ok(base),
            _ => Err(MarshalError::BadVref(s.to_string())),
        }
    }
}

/// Structured form of a vat-side object reference.
///
/// The textual grammar is `o-N` for an import allocated by the kernel,
/// `o+N` for a plain export, and `o+K/I` (optionally `o+K/I:F`) for a
/// virtual object managed by the virtual object layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Vref {
    /// Negative-slot import from another vat.
    Import(u64),
    /// Plain positive export of the owning vat.
    Export(u64),
    /// Virtual object instance, optionally narrowed to one facet.
    Virtual { base: BaseRef, facet: Option<u32> },
}

impl Vref {
    /// The cohort identity when this reference designates a virtual
    /// object, facet or not.
    pub fn base_ref(&self) -> Option<BaseRef> {
        match self {
            Vref::Virtual { base, .. } => Some(*base),
            _ => None,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Vref::Virtual { .. })
    }

    /// Same reference with any facet suffix removed.
    pub fn without_facet(&self) -> Vref {
        match self {
            Vref::Virtual { base, .. } => Vref::Virtual { base: *base, facet: None },
            other => other.clone(),
        }
    }
}

impl fmt::Display for Vref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vref::Import(n) => write!(f, "o-{n}"),
            Vref::Export(n) => write!(f, "o+{n}"),
            Vref::Virtual { base, facet: None } => write!(f, "{base}"),
            Vref::Virtual { base, facet: Some(facet) } => write!(f, "{base}:{facet}"),
        }
    }
}

impl FromStr for Vref {
    type Err = MarshalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || MarshalError::BadVref(s.to_string());
        let body = s.strip_prefix('o').ok_or_else(bad)?;
        if let Some(digits) = body.strip_prefix('-') {
            let n = digits.parse::<u64>().map_err(|_| bad())?;
            return Ok(Vref::Import(n));
        }
        let rest = body.strip_prefix('+').ok_or_else(bad)?;
        let Some((kind, tail)) = rest.split_once('/') else {
            let n = rest.parse::<u64>().map_err(|_| bad())?;
            return Ok(Vref::Export(n));
        };
        let kind = kind.parse::<u64>().map_err(|_| bad())?;
        let (instance, facet) = match tail.split_once(':') {
            Some((instance, facet)) => {
                let facet = facet.parse::<u32>().map_err(|_| bad())?;
                (instance, Some(facet))
            }
            None => (tail, None),
        };
        let instance = instance.parse::<u64>().map_err(|_| bad())?;
        Ok(Vref::Virtual { base: BaseRef::new(kind, instance), facet })
    }
}

impl Serialize for Vref {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Vref {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

impl Serialize for BaseRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BaseRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}
