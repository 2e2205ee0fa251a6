//! Logging shims that forward to the [`log`] crate when the `log` feature is
//! enabled, and compile to nothing otherwise.
//!
//! [`log`]: https://docs.rs/log/

#![allow(unused_macros)]

macro_rules! trace {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        log::trace!($($args)*);
    }};
}

macro_rules! debug {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        log::debug!($($args)*);
    }};
}

macro_rules! info {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        log::info!($($args)*);
    }};
}

macro_rules! warn {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        log::warn!($($args)*);
    }};
}
