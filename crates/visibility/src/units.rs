//! Metric units.
//!
//! OpenTelemetry only names a handful of units (`1`, `By`, `ms`). The table
//! below adds the UCUM-style codes Prometheus and most collectors understand.

use std::borrow::Cow;
use std::fmt;

/// A metric unit code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Unit(Cow<'static, str>);

impl Unit {
    pub const fn new(code: &'static str) -> Self {
        Self(Cow::Borrowed(code))
    }

    /// A unit code that is not part of the built-in table.
    pub fn custom(code: impl Into<String>) -> Self {
        Self(Cow::Owned(code.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The closest `metrics` facade unit, if the facade has one.
    pub fn to_metrics_unit(&self) -> Option<metrics::Unit> {
        let unit = match self.as_str() {
            "1" => metrics::Unit::Count,
            "%" => metrics::Unit::Percent,
            "s" => metrics::Unit::Seconds,
            "ms" => metrics::Unit::Milliseconds,
            "us" => metrics::Unit::Microseconds,
            "ns" => metrics::Unit::Nanoseconds,
            "B" | "By" => metrics::Unit::Bytes,
            "KiBy" => metrics::Unit::Kibibytes,
            "MiBy" => metrics::Unit::Mebibytes,
            "GiBy" => metrics::Unit::Gibibytes,
            "TiBy" => metrics::Unit::Tebibytes,
            _ => return None,
        };
        Some(unit)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub const DIMENSIONLESS: Unit = Unit::new("1");

// Time
pub const DAYS: Unit = Unit::new("d");
pub const HOURS: Unit = Unit::new("h");
pub const MINUTES: Unit = Unit::new("min");
pub const SECONDS: Unit = Unit::new("s");
pub const MILLISECONDS: Unit = Unit::new("ms");
pub const MICROSECONDS: Unit = Unit::new("us");
pub const NANOSECONDS: Unit = Unit::new("ns");

// Bytes
pub const KIBIBYTES: Unit = Unit::new("KiBy");
pub const MEBIBYTES: Unit = Unit::new("MiBy");
pub const GIBIBYTES: Unit = Unit::new("GiBy");
pub const TEBIBYTES: Unit = Unit::new("TiBy");

pub const BYTES: Unit = Unit::new("B");
pub const KILOBYTES: Unit = Unit::new("KB");
pub const MEGABYTES: Unit = Unit::new("MB");
pub const GIGABYTES: Unit = Unit::new("GB");
pub const TERABYTES: Unit = Unit::new("TB");

// Network speed
pub const KIBIBYTES_PER_SEC: Unit = Unit::new("KiBy/s");
pub const MEBIBYTES_PER_SEC: Unit = Unit::new("MiBy/s");
pub const GIBIBYTES_PER_SEC: Unit = Unit::new("GiBy/s");
pub const TEBIBYTES_PER_SEC: Unit = Unit::new("TiBy/s");

pub const BYTES_PER_SEC: Unit = Unit::new("B/s");
pub const KILOBYTES_PER_SEC: Unit = Unit::new("KB/s");
pub const MEGABYTES_PER_SEC: Unit = Unit::new("MB/s");
pub const GIGABYTES_PER_SEC: Unit = Unit::new("GB/s");
pub const TERABYTES_PER_SEC: Unit = Unit::new("TB/s");

// SI
pub const METERS_PER_SEC: Unit = Unit::new("m/s");
pub const METERS: Unit = Unit::new("m");
pub const VOLTS: Unit = Unit::new("V");
pub const AMPERES: Unit = Unit::new("A");
pub const JOULES: Unit = Unit::new("J");
pub const WATTS: Unit = Unit::new("W");
pub const GRAMS: Unit = Unit::new("g");

// Misc
pub const CELSIUS: Unit = Unit::new("Cel");
pub const HERTZ: Unit = Unit::new("Hz");
pub const PERCENT: Unit = Unit::new("%");
pub const DOLLARS: Unit = Unit::new("$");
