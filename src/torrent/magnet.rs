// Magnet URI parsing (BEP 9) and the v1 info hash type.

use std::fmt;

use data_encoding::BASE32;

use crate::error::{RelayError, RelayResult};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Parse the `urn:btih:` payload: 40 hex characters or 32 base32 characters.
    pub fn parse(value: &str) -> Option<Self> {
        match value.len() {
            40 => {
                let bytes = hex::decode(value).ok()?;
                Self::from_slice(&bytes)
            }
            32 => {
                let bytes = BASE32.decode(value.to_ascii_uppercase().as_bytes()).ok()?;
                Self::from_slice(&bytes)
            }
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    /// Tracker URLs (`http`, `https` and `udp`), in the order given.
    pub trackers: Vec<String>,
    /// Explicit peer addresses from `x.pe`, as `host:port`.
    pub peers: Vec<String>,
}

impl MagnetLink {
    pub fn parse(uri: &str) -> RelayResult<Self> {
        let uri = uri.trim();
        let query = uri
            .get(..8)
            .filter(|p| p.eq_ignore_ascii_case("magnet:?"))
            .map(|_| &uri[8..])
            .ok_or_else(|| RelayError::validation("not a magnet uri"))?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut peers = Vec::new();

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "xt" => {
                    let Some(hash) = value
                        .get(..9)
                        .filter(|p| p.eq_ignore_ascii_case("urn:btih:"))
                        .map(|_| &value[9..])
                    else {
                        continue;
                    };
                    let parsed = InfoHash::parse(hash).ok_or_else(|| {
                        RelayError::validation(format!("malformed btih info hash {hash:?}"))
                    })?;
                    info_hash.get_or_insert(parsed);
                }
                "dn" if display_name.is_none() => display_name = Some(value.into_owned()),
                "tr" => {
                    let lower = value.to_ascii_lowercase();
                    if (lower.starts_with("http://")
                        || lower.starts_with("https://")
                        || lower.starts_with("udp://"))
                        && !trackers.iter().any(|t| *t == value)
                    {
                        trackers.push(value.into_owned());
                    }
                }
                "x.pe" => peers.push(value.into_owned()),
                _ => {}
            }
        }

        let info_hash = info_hash
            .ok_or_else(|| RelayError::validation("magnet uri carries no btih info hash"))?;

        Ok(Self {
            info_hash,
            display_name,
            trackers,
            peers,
        })
    }
}
