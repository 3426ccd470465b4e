use bytes::Bytes;

/// A service data unit.
///
/// Ownership of the bytes passes to the DTP on write.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Sdu(Bytes);

impl Sdu {
    /// Wraps a buffer.
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Length of the SDU.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the SDU is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrowed content.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Owned content.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Splits the SDU into slices of at most `max` bytes.
    ///
    /// The slices share the SDU's storage. An empty SDU yields one empty
    /// fragment.
    pub fn fragments(&self, max: usize) -> Vec<Bytes> {
        debug_assert!(max > 0);
        if self.0.is_empty() {
            return vec![Bytes::new()];
        }
        (0..self.0.len())
            .step_by(max)
            .map(|start| self.0.slice(start..self.0.len().min(start + max)))
            .collect()
    }
}

impl From<Bytes> for Sdu {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for Sdu {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl From<&[u8]> for Sdu {
    fn from(payload: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(payload))
    }
}

impl From<&str> for Sdu {
    fn from(payload: &str) -> Self {
        Self::from(payload.as_bytes())
    }
}
