/// Visits `0..len` once, starting at `start` and wrapping around.
///
/// The stage that served index `i` last sets `start = i + 1` so every
/// candidate gets its turn.
pub fn round_robin(start: usize, len: usize) -> impl Iterator<Item = usize> {
    let start = if len == 0 { 0 } else { start % len };
    (start..len).chain(0..start)
}

#[cfg(test)]
mod tests {
    use super::round_robin;

    #[test]
    fn wraps_around() {
        utils::diff::assert_eq!(
            have: round_robin(2, 4).collect::<Vec<_>>(),
            want: vec![2, 3, 0, 1]
        );
        utils::diff::assert_eq!(
            have: round_robin(5, 4).collect::<Vec<_>>(),
            want: vec![1, 2, 3, 0]
        );
        assert_eq!(round_robin(3, 0).count(), 0);
    }
}
