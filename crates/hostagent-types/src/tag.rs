//! Host-local forwarding tag.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Host-local forwarding-table tag (an 802.1Q VLAN id on the integration bridge).
///
/// Tags only have meaning inside this host's switch. Valid range is 1-4094.
///
/// ```
/// use hostagent_types::LocalTag;
///
/// let tag = LocalTag::new(1).unwrap();
/// assert_eq!(tag.as_u16(), 1);
/// assert!(LocalTag::new(0).is_err());
/// assert!(LocalTag::new(4095).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct LocalTag(u16);

impl LocalTag {
    pub const MIN: u16 = 1;
    pub const MAX: u16 = 4094;

    pub fn new(id: u32) -> Result<Self, ParseError> {
        if id >= u32::from(Self::MIN) && id <= u32::from(Self::MAX) {
            Ok(LocalTag(id as u16))
        } else {
            Err(ParseError::InvalidLocalTag(id))
        }
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    pub const fn as_u32(&self) -> u32 {
        self.0 as u32
    }

    /// Extracts the VLAN id from an 802.1Q tag control field.
    pub fn from_tci(tci: u16) -> Result<Self, ParseError> {
        Self::new(u32::from(tci & 0x0fff))
    }
}

impl fmt::Display for LocalTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for LocalTag {
    type Error = ParseError;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        LocalTag::new(id)
    }
}

impl From<LocalTag> for u32 {
    fn from(tag: LocalTag) -> u32 {
        tag.as_u32()
    }
}
