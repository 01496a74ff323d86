use crate::error::{Result, TrialsError};

/// 解码定长字节字段：截断到第一个 NUL，去掉尾部填充
pub fn fixed_width_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
        .trim_end_matches(|c: char| c.is_whitespace() || c.is_control())
        .to_string()
}

/// 非本地化的浮点数解析
pub fn atof_nonlocalized(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse().ok()
}

/// Little-endian reader over a fixed-size header buffer
///
/// Every accessor advances the cursor. Reading past the end is an
/// `InvalidFormat` error naming the field, never a panic.
pub struct FieldCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FieldCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        FieldCursor { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(TrialsError::InvalidFormat(format!(
                "field {} needs bytes {}..{} of a {}-byte header",
                field,
                self.pos,
                end,
                self.bytes.len()
            )));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, field: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    pub fn skip(&mut self, len: usize, field: &str) -> Result<()> {
        self.take(len, field).map(|_| ())
    }

    pub fn u8(&mut self, field: &str) -> Result<u8> {
        Ok(self.array::<1>(field)?[0])
    }

    pub fn i16(&mut self, field: &str) -> Result<i16> {
        Ok(i16::from_le_bytes(self.array(field)?))
    }

    pub fn u16(&mut self, field: &str) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array(field)?))
    }

    pub fn i32(&mut self, field: &str) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array(field)?))
    }

    pub fn u32(&mut self, field: &str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array(field)?))
    }

    pub fn f64(&mut self, field: &str) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array(field)?))
    }

    pub fn string(&mut self, len: usize, field: &str) -> Result<String> {
        Ok(fixed_width_string(self.take(len, field)?))
    }

    /// Reads `count` consecutive little-endian `i32` values.
    pub fn i32_array(&mut self, count: usize, field: &str) -> Result<Vec<i32>> {
        (0..count).map(|_| self.i32(field)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_string_strips_fill() {
        assert_eq!(fixed_width_string(b"sig001\0\0\0\0"), "sig001");
        assert_eq!(fixed_width_string(b"sig001\0garbage"), "sig001");
        assert_eq!(fixed_width_string(b"spaced   "), "spaced");
        assert_eq!(fixed_width_string(b"\0\0\0"), "");
    }

    #[test]
    fn test_atof_nonlocalized() {
        assert_eq!(atof_nonlocalized(" 1.5 "), Some(1.5));
        assert_eq!(atof_nonlocalized("-2"), Some(-2.0));
        assert_eq!(atof_nonlocalized(""), None);
        assert_eq!(atof_nonlocalized("abc"), None);
    }

    #[test]
    fn test_field_cursor() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(-2i16).to_le_bytes());
        bytes.extend_from_slice(&40000u16.to_le_bytes());
        bytes.extend_from_slice(&7i32.to_le_bytes());
        bytes.extend_from_slice(&1.25f64.to_le_bytes());
        bytes.extend_from_slice(b"ab\0\0");

        let mut cursor = FieldCursor::new(&bytes);
        assert_eq!(cursor.i16("a").unwrap(), -2);
        assert_eq!(cursor.u16("b").unwrap(), 40000);
        assert_eq!(cursor.i32("c").unwrap(), 7);
        assert_eq!(cursor.f64("d").unwrap(), 1.25);
        assert_eq!(cursor.string(4, "e").unwrap(), "ab");
        assert_eq!(cursor.position(), bytes.len());
        assert!(matches!(cursor.u8("f"), Err(TrialsError::InvalidFormat(_))));
    }
}
