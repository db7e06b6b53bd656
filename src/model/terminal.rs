use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Code, Error};

/// The four kinds of terminal making up the network.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalKind {
    Urn,
    Station,
    SubStation,
    Post,
}

impl TerminalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urn => "urn",
            Self::Station => "station",
            Self::SubStation => "substation",
            Self::Post => "post",
        }
    }
}

impl Display for TerminalKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TerminalKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "urn" => Ok(Self::Urn),
            "station" => Ok(Self::Station),
            "substation" => Ok(Self::SubStation),
            "post" => Ok(Self::Post),
            other => Err(Error::new(
                Code::UnexpectedValue,
                format!("unknown terminal kind `{other}`"),
            )),
        }
    }
}

/// Where a Station and its dependent terminals live, as known to the Urn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationLayout {
    pub station: SocketAddr,
    #[serde(default)]
    pub posts: Vec<SocketAddr>,
    #[serde(default)]
    pub substations: Vec<SocketAddr>,
}

impl StationLayout {
    /// The kind of terminal at `ip` within this layout, if any.
    pub fn kind_of(&self, ip: IpAddr) -> Option<TerminalKind> {
        if self.station.ip() == ip {
            Some(TerminalKind::Station)
        } else if self.posts.iter().any(|post| post.ip() == ip) {
            Some(TerminalKind::Post)
        } else if self.substations.iter().any(|sub| sub.ip() == ip) {
            Some(TerminalKind::SubStation)
        } else {
            None
        }
    }
}
