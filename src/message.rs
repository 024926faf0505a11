use crate::types::{EndpointId, Namespace};
use std::fmt::Debug;

/// Body of a frame. Control namespaces only ever carry UTF-8 JSON.
#[derive(Clone, Eq, PartialEq)]
pub enum CastMessagePayload {
    String(String),
    Binary(Vec<u8>),
}

/// One decoded frame of the control channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CastMessage {
    /// Sub-protocol the payload belongs to, e.g. the heartbeat or media namespace.
    pub namespace: Namespace,

    pub source: EndpointId,

    pub destination: EndpointId,

    pub payload: CastMessagePayload,
}

impl CastMessagePayload {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CastMessagePayload::String(s) => Some(s.as_str()),
            CastMessagePayload::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CastMessagePayload::String(s) => s.len(),
            CastMessagePayload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for CastMessagePayload {
    fn from(s: String) -> CastMessagePayload {
        Self::String(s)
    }
}

impl From<Vec<u8>> for CastMessagePayload {
    fn from(b: Vec<u8>) -> CastMessagePayload {
        Self::Binary(b)
    }
}

impl Debug for CastMessagePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CastMessagePayload::String(s) => {
                f.debug_struct("CastMessagePayload::String")
                 .field("len", &s.len())
                 .finish_non_exhaustive()?;
            },
            CastMessagePayload::Binary(v) => {
                f.debug_struct("CastMessagePayload::Binary")
                 .field("len", &v.len())
                 .finish_non_exhaustive()?;
            },
        }

        Ok(())
    }
}
