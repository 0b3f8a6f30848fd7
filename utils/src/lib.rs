#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

pub mod diff;
pub mod fs;

/// Allocates a boxed slice of `n` clones of `elem`.
#[macro_export]
macro_rules! box_slice {
    ($elem:expr; $n:expr) => {{
        ::std::vec![$elem; $n].into_boxed_slice()
    }};
}
