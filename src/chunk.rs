use bytes::Bytes;
use serde_json::Value;

/// One unit of data moving through a pipeline.
///
/// Chunks are immutable once emitted. Cloning a `Bytes` chunk is cheap (the
/// buffer is reference counted), records are deep-copied.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Bytes(Bytes),
    Record(Value),
}

/// How much of a flow controller's capacity a chunk occupies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Weight {
    pub bytes: usize,
    pub records: usize,
}

impl Chunk {
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Chunk::Bytes(data.into())
    }

    pub fn record(value: impl Into<Value>) -> Self {
        Chunk::Record(value.into())
    }

    pub fn weight(&self) -> Weight {
        match self {
            Chunk::Bytes(b) => Weight {
                bytes: b.len(),
                records: 0,
            },
            Chunk::Record(_) => Weight {
                bytes: 0,
                records: 1,
            },
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self, Chunk::Record(_))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Chunk::Bytes(b) => Some(b),
            Chunk::Record(_) => None,
        }
    }

    pub fn as_record(&self) -> Option<&Value> {
        match self {
            Chunk::Record(v) => Some(v),
            Chunk::Bytes(_) => None,
        }
    }

    pub fn into_record(self) -> Option<Value> {
        match self {
            Chunk::Record(v) => Some(v),
            Chunk::Bytes(_) => None,
        }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Chunk::Bytes(b) => Some(b),
            Chunk::Record(_) => None,
        }
    }
}

impl From<&'static str> for Chunk {
    fn from(s: &'static str) -> Self {
        Chunk::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Chunk {
    fn from(s: String) -> Self {
        Chunk::Bytes(Bytes::from(s))
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(v: Vec<u8>) -> Self {
        Chunk::Bytes(Bytes::from(v))
    }
}

impl From<Bytes> for Chunk {
    fn from(b: Bytes) -> Self {
        Chunk::Bytes(b)
    }
}

impl From<Value> for Chunk {
    fn from(v: Value) -> Self {
        Chunk::Record(v)
    }
}

impl std::ops::AddAssign for Weight {
    fn add_assign(&mut self, rhs: Self) {
        self.bytes += rhs.bytes;
        self.records += rhs.records;
    }
}

impl std::ops::SubAssign for Weight {
    fn sub_assign(&mut self, rhs: Self) {
        self.bytes = self.bytes.saturating_sub(rhs.bytes);
        self.records = self.records.saturating_sub(rhs.records);
    }
}
