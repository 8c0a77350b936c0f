use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Gas measurements reported by the farm sensors. Names that are not
/// recognized are carried through as `Other` and still forwarded.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum ResourceKind {
    Co2,
    Ch4,
    Nh3,
    N2o,
    Other(String),
}

impl ResourceKind {
    pub fn is_recognized(&self) -> bool {
        !matches!(self, ResourceKind::Other(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::Co2 => "CO2",
            ResourceKind::Ch4 => "CH4",
            ResourceKind::Nh3 => "NH3",
            ResourceKind::N2o => "N2O",
            ResourceKind::Other(name) => name.as_str(),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Infallible> {
        Ok(match s {
            "CO2" => ResourceKind::Co2,
            "CH4" => ResourceKind::Ch4,
            "NH3" => ResourceKind::Nh3,
            "N2O" => ResourceKind::N2o,
            other => ResourceKind::Other(other.to_string()),
        })
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
