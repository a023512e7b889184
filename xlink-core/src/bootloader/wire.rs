//! Little-endian field helpers shared by request and response records.

use bytes::{Buf, BufMut};

use crate::error::XLinkError;

/// Size of fixed error message fields, terminating NUL included.
pub const ERROR_MSG_SIZE: usize = 64;

pub(crate) fn ensure_len(
    buf: &[u8],
    expected: usize,
    what: &'static str,
) -> Result<(), XLinkError> {
    if buf.len() < expected {
        return Err(XLinkError::Truncated {
            what,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Write `msg` into a NUL-terminated field, truncating on a char boundary.
pub(crate) fn put_fixed_str(dst: &mut impl BufMut, msg: &str) {
    let text = crate::types::bounded(msg, ERROR_MSG_SIZE);
    dst.put_slice(text.as_bytes());
    dst.put_bytes(0, ERROR_MSG_SIZE - text.len());
}

/// Read a NUL-terminated field up to the first NUL.
pub(crate) fn get_fixed_str(src: &mut &[u8]) -> String {
    let field = &src[..ERROR_MSG_SIZE];
    let end = field.iter().position(|&b| b == 0).unwrap_or(ERROR_MSG_SIZE);
    let text = String::from_utf8_lossy(&field[..end]).into_owned();
    src.advance(ERROR_MSG_SIZE);
    text
}

pub(crate) fn get_bool(src: &mut &[u8]) -> bool {
    src.get_u32_le() != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_strings_truncate_and_stop_at_nul() {
        let mut buf = Vec::new();
        put_fixed_str(&mut buf, &"e".repeat(100));
        assert_eq!(buf.len(), ERROR_MSG_SIZE);
        assert_eq!(buf[ERROR_MSG_SIZE - 1], 0);

        let mut src = &buf[..];
        assert_eq!(get_fixed_str(&mut src).len(), ERROR_MSG_SIZE - 1);
        assert!(src.is_empty());

        let mut buf = Vec::new();
        put_fixed_str(&mut buf, "bad crc");
        let mut src = &buf[..];
        assert_eq!(get_fixed_str(&mut src), "bad crc");
    }
}
