use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq)]
pub enum Version {
    V5 = 5,
    V6 = 6,
}

const CONTENT_TYPE_V5: &str = "application/vnd.keel.invocation.v5";
const CONTENT_TYPE_V6: &str = "application/vnd.keel.invocation.v6";

impl Version {
    pub const fn content_type(&self) -> &'static str {
        match self {
            Version::V5 => CONTENT_TYPE_V5,
            Version::V6 => CONTENT_TYPE_V6,
        }
    }

    pub const fn minimum_supported_version() -> Self {
        Version::V5
    }

    pub const fn maximum_supported_version() -> Self {
        Version::V6
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.content_type())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContentTypeError {
    #[error("unsupported protocol version '{0}'")]
    UnsupportedVersion(String),
    #[error("unrecognized content-type '{0}', this is not an invocation protocol content type. Make sure the service is invoked through the supervisor, rather than directly.")]
    OtherContentType(String),
}

impl FromStr for Version {
    type Err = ContentTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            CONTENT_TYPE_V5 => Ok(Version::V5),
            CONTENT_TYPE_V6 => Ok(Version::V6),
            s if s.starts_with("application/vnd.keel.invocation.") => {
                Err(ContentTypeError::UnsupportedVersion(s.to_owned()))
            }
            s => Err(ContentTypeError::OtherContentType(s.to_owned())),
        }
    }
}
