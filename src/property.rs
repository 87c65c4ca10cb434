/// Property value types for nodes and edges.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    /// Encode property value to bytes for WAL storage.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            PropertyValue::Null => vec![0],
            PropertyValue::Bool(b) => {
                let mut out = vec![1];
                out.push(if *b { 1 } else { 0 });
                out
            }
            PropertyValue::Int(i) => {
                let mut out = vec![2];
                out.extend_from_slice(&i.to_le_bytes());
                out
            }
            PropertyValue::Float(f) => {
                let mut out = vec![3];
                out.extend_from_slice(&f.to_le_bytes());
                out
            }
            PropertyValue::String(s) => {
                let mut out = vec![4];
                let bytes = s.as_bytes();
                let len = u32::try_from(bytes.len()).expect("string length should fit in u32");
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(bytes);
                out
            }
        }
    }

    /// Decode property value from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let ty = bytes[0];
        let payload = &bytes[1..];
        match ty {
            0 => Ok(PropertyValue::Null),
            1 => {
                if payload.len() != 1 {
                    return Err(DecodeError::InvalidLength);
                }
                Ok(PropertyValue::Bool(payload[0] != 0))
            }
            2 => {
                if payload.len() != 8 {
                    return Err(DecodeError::InvalidLength);
                }
                let i = i64::from_le_bytes(payload[0..8].try_into().unwrap());
                Ok(PropertyValue::Int(i))
            }
            3 => {
                if payload.len() != 8 {
                    return Err(DecodeError::InvalidLength);
                }
                let f = f64::from_le_bytes(payload[0..8].try_into().unwrap());
                Ok(PropertyValue::Float(f))
            }
            4 => {
                if payload.len() < 4 {
                    return Err(DecodeError::InvalidLength);
                }
                let len = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
                if payload.len() < 4 + len {
                    return Err(DecodeError::InvalidLength);
                }
                let s = String::from_utf8(payload[4..4 + len].to_vec())
                    .map_err(|_| DecodeError::InvalidUtf8)?;
                Ok(PropertyValue::String(s))
            }
            _ => Err(DecodeError::UnknownType(ty)),
        }
    }
}

/// Minimal stand-in for the columnar batch substrate the query executor
/// owns (out of scope here): a flat run of typed cells with no selection
/// vector, since every read path this crate drives materializes exactly
/// one value per row.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueVector {
    values: Vec<PropertyValue>,
}

impl ValueVector {
    pub fn with_len(len: usize) -> Self {
        Self {
            values: vec![PropertyValue::Null; len],
        }
    }

    pub fn from_values(values: Vec<PropertyValue>) -> Self {
        Self { values }
    }

    /// Number of positions this vector was sized for before any
    /// read-merge overwrote individual cells — the window staged updates
    /// are matched against during a read-time merge.
    pub fn original_size(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, idx: usize) -> Option<&PropertyValue> {
        self.values.get(idx)
    }

    pub fn set(&mut self, idx: usize, value: PropertyValue) {
        self.values[idx] = value;
    }

    pub fn as_slice(&self) -> &[PropertyValue] {
        &self.values
    }
}

#[derive(Debug)]
pub enum DecodeError {
    Empty,
    InvalidLength,
    InvalidUtf8,
    UnknownType(u8),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "empty property value bytes"),
            DecodeError::InvalidLength => write!(f, "invalid property value length"),
            DecodeError::InvalidUtf8 => write!(f, "invalid UTF-8 in string property"),
            DecodeError::UnknownType(ty) => write!(f, "unknown property value type: {}", ty),
        }
    }
}

impl std::error::Error for DecodeError {}

impl PropertyValue {
    /// Get float value if this is a Float variant.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}
