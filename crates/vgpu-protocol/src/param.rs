use serde::{Deserialize, Serialize};

/// One raw call parameter as received from the transport: an owned copy of
/// the `{void*, size}` descriptor the guest submitted. Values are encoded
/// little-endian, matching the guest ABI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDesc {
    data: Vec<u8>,
}

impl ParamDesc {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn from_u64(v: u64) -> Self {
        Self { data: v.to_le_bytes().to_vec() }
    }

    pub fn from_u32(v: u32) -> Self {
        Self { data: v.to_le_bytes().to_vec() }
    }

    pub fn from_i32(v: i32) -> Self {
        Self { data: v.to_le_bytes().to_vec() }
    }

    /// String parameters travel NUL-terminated, like the C caller passed them.
    pub fn from_str(s: &str) -> Self {
        let mut data = s.as_bytes().to_vec();
        data.push(0);
        Self { data }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_u64(&self) -> Option<u64> {
        Some(u64::from_le_bytes(self.data.get(..8)?.try_into().ok()?))
    }

    pub fn as_u32(&self) -> Option<u32> {
        Some(u32::from_le_bytes(self.data.get(..4)?.try_into().ok()?))
    }

    pub fn as_i32(&self) -> Option<i32> {
        Some(i32::from_le_bytes(self.data.get(..4)?.try_into().ok()?))
    }

    pub fn as_str(&self) -> Option<&str> {
        let end = self.data.iter().position(|&b| b == 0).unwrap_or(self.data.len());
        std::str::from_utf8(&self.data[..end]).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trips() {
        assert_eq!(ParamDesc::from_u64(0x2000_0000_0000).as_u64(), Some(0x2000_0000_0000));
        assert_eq!(ParamDesc::from_i32(-3).as_i32(), Some(-3));
        assert_eq!(ParamDesc::from_str("_Z3addPfi").as_str(), Some("_Z3addPfi"));
    }

    #[test]
    fn short_buffer_reads_none() {
        assert_eq!(ParamDesc::from_u32(7).as_u64(), None);
        assert_eq!(ParamDesc::new(vec![]).as_u32(), None);
    }
}
