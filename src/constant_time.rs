// Non-inline so the optimizer cannot short-circuit the comparison.
#[inline(never)]
fn constant_time_ne(a: &[u8], b: &[u8]) -> u8 {
    a.iter().zip(b).fold(0, |acc, (x, y)| acc | (x ^ y))
}

/// Compares byte strings in constant time.
pub(crate) fn eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && constant_time_ne(a, b) == 0
}

#[cfg(test)]
mod tests {
    #[test]
    fn compares() {
        assert!(super::eq(b"token", b"token"));
        assert!(!super::eq(b"token", b"tokem"));
        assert!(!super::eq(b"token", b"tok"));
    }
}
