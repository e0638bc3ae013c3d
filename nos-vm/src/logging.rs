//! Unified logging support for nos-vm
//!
//! The macros forward to the `log` crate when the `log` feature is enabled
//! and expand to nothing otherwise, so call sites need no `#[cfg]`.

/// Unified trace-level logging
#[macro_export]
macro_rules! vm_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::trace!($($arg)*);
    }
}

/// Unified debug-level logging
#[macro_export]
macro_rules! vm_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::debug!($($arg)*);
    }
}

/// Unified info-level logging
#[macro_export]
macro_rules! vm_info {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::info!($($arg)*);
    }
}

/// Unified warn-level logging
#[macro_export]
macro_rules! vm_warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::warn!($($arg)*);
    }
}

/// Unified error-level logging
#[macro_export]
macro_rules! vm_error {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::error!($($arg)*);
    }
}
