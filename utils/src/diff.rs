pub use similar_asserts;

/// Asserts equality and prints a line diff of the debug representations on failure.
///
/// Both sides carry a label, e.g. `diff::assert_eq!(have: regs, want: expected)`.
pub use similar_asserts::assert_eq;

/// Renders a labelled line diff of two values without failing.
#[must_use]
pub fn render<L, R>(left_label: &str, left: &L, right_label: &str, right: &R) -> String
where
    L: std::fmt::Debug + ?Sized,
    R: std::fmt::Debug + ?Sized,
{
    let left = format!("{left:#?}");
    let right = format!("{right:#?}");
    similar_asserts::SimpleDiff::from_str(&left, &right, left_label, right_label).to_string()
}

#[macro_export]
macro_rules! diff {
    (
        $left_label:ident:
        $left:expr,
        $right_label:ident:
        $right:expr $(,)?
    ) => {{
        println!(
            "{}",
            $crate::diff::render(
                stringify!($left_label),
                &$left,
                stringify!($right_label),
                &$right,
            )
        );
    }};
}

pub use diff;
