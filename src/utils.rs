use core::fmt;

/// Formats a byte slice as bracketed hex (`[1f, 26, 00]`).
pub struct HexSlice<T>(pub T)
where
    T: AsRef<[u8]>;

impl<T: AsRef<[u8]>> fmt::Debug for HexSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        let mut bytes = self.0.as_ref().iter();
        if let Some(first) = bytes.next() {
            write!(f, "{:02x}", first)?;
            for byte in bytes {
                write!(f, ", {:02x}", byte)?;
            }
        }
        f.write_str("]")
    }
}
