//! Extra assertion macros.

/// Asserts that an `Option`-valued expression is `None`, showing the
/// unexpected value on failure.
#[macro_export]
macro_rules! assert_none {
    ($val:expr, $($msg:tt)+) => {{
        if let Some(y) = &$val {
            panic!("assertion failed: expected None found Some({y:?}), {}", format!($($msg)+));
        }
    }};
    ($val:expr) => {{
        if let Some(y) = &$val {
            panic!("assertion failed: expected None found Some({y:?})");
        }
    }}
}
