//! Utilities to cast between integers.

/// A trait for safe and infallible casts.
///
/// You can easily cast between integers using the `as` keyword, but those
/// casts aren't always safe, e.g. using `as` you can cast a `u64` to a `u32`
/// but you'll lose precision.
///
/// This trait facilitates casts that are always known to be safe.
pub trait CastFrom<T> {
    fn cast_from(from: T) -> Self;
}

macro_rules! cast_from {
    ($from:ty, $to:ty) => {
        paste::paste! {
            impl crate::cast::CastFrom<$from> for $to {
                #[allow(clippy::as_conversions)]
                fn cast_from(from: $from) -> $to {
                    from as $to
                }
            }

            /// Casts [`$from`] to [`$to`].
            ///
            /// This is equivalent to the [`crate::cast::CastFrom`] implementation but is
            /// available as a `const fn`.
            #[allow(clippy::as_conversions)]
            pub const fn [< $from _to_ $to >](from: $from) -> $to {
                from as $to
            }
        }
    };
}

#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
mod target32 {
    cast_from!(u8, u64);
    cast_from!(u16, u64);
    cast_from!(u32, u64);
    cast_from!(u32, usize);
    cast_from!(u64, u64);
}
#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
pub use target32::*;

// Casts that are safe on 64-bit architectures.
#[cfg(target_pointer_width = "64")]
mod target64 {
    cast_from!(u64, usize);
    cast_from!(usize, u64);
}
#[cfg(target_pointer_width = "64")]
pub use target64::*;
