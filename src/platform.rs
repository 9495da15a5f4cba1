//! OS / architecture / variant triples.

use std::fmt;

use crate::error::{Error, Result};

/// An OS / architecture / variant triple, parseable from the conventional
/// `os/arch[/variant]` string or built up field by field.
///
/// ## Examples
///
/// ```rust
/// use llbscript::platform::Platform;
///
/// let p: Platform = "linux/arm64/v8".parse().unwrap();
/// assert_eq!(p.os, "linux");
/// assert_eq!(p.architecture, "arm64");
/// assert_eq!(p.variant.as_deref(), Some("v8"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Platform {
    /// The operating system, e.g. `linux`.
    pub os: String,
    /// The CPU architecture, e.g. `amd64`.
    pub architecture: String,
    /// The optional architecture variant, e.g. `v8`.
    pub variant: Option<String>,
}

impl Platform {
    /// The platform this crate assumes when a script never specifies one.
    pub fn default_platform() -> Self {
        Platform {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let os = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::validation(format!("invalid platform string '{s}'")))?;
        let architecture = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::validation(format!("invalid platform string '{s}'")))?;
        let variant = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        if parts.next().is_some() {
            return Err(Error::validation(format!("invalid platform string '{s}'")));
        }
        Ok(Platform {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_os_arch() {
        let p: Platform = "linux/amd64".parse().unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "amd64");
        assert_eq!(p.variant, None);
    }

    #[test]
    fn parses_os_arch_variant() {
        let p: Platform = "linux/arm64/v8".parse().unwrap();
        assert_eq!(p.variant.as_deref(), Some("v8"));
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!("linux".parse::<Platform>().is_err());
        assert!("linux/amd64/v8/extra".parse::<Platform>().is_err());
        assert!("/amd64".parse::<Platform>().is_err());
    }

    #[test]
    fn display_round_trips() {
        let p = Platform {
            os: "linux".into(),
            architecture: "arm64".into(),
            variant: Some("v8".into()),
        };
        assert_eq!(p.to_string(), "linux/arm64/v8");
        assert_eq!(p.to_string().parse::<Platform>().unwrap(), p);
    }
}
