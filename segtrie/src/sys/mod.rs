//! Platform-specific code.
//!
//! At the moment we only target Unix platforms.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod unix;
    }
}
